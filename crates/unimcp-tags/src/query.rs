//! The object form of a tag filter, used by presets and the HTTP surface.
//!
//! A `TagQuery` is the JSON-friendly equivalent of a [`TagExpression`]:
//!
//! ```json
//! { "$or": [ { "tag": "web" }, { "$and": [ { "$in": ["db", "cache"] } ] } ] }
//! ```
//!
//! Exactly one operator key per node. `$advanced` embeds an infix string.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::TagError;
use crate::expr::{TagExpression, is_valid_tag};
use crate::parser::parse_advanced;

/// One node of the object query form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagQuery {
    /// All children must match.
    #[serde(rename = "$and", skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<TagQuery>>,
    /// Any child must match.
    #[serde(rename = "$or", skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<TagQuery>>,
    /// Child must not match.
    #[serde(rename = "$not", skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<TagQuery>>,
    /// Any of these tags present.
    #[serde(rename = "$in", skip_serializing_if = "Option::is_none")]
    pub any_in: Option<Vec<String>>,
    /// This tag present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Embedded advanced infix expression.
    #[serde(rename = "$advanced", skip_serializing_if = "Option::is_none")]
    pub advanced: Option<String>,
}

impl TagQuery {
    /// A single-tag query.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    /// An `$in` query over a list of tags.
    pub fn any_of<I: IntoIterator<Item = String>>(tags: I) -> Self {
        Self {
            any_in: Some(tags.into_iter().collect()),
            ..Default::default()
        }
    }

    /// An `$and` query over children.
    pub fn all(children: Vec<TagQuery>) -> Self {
        Self {
            and: Some(children),
            ..Default::default()
        }
    }

    /// Convert to the expression tree.
    ///
    /// Rejects nodes with zero or more than one operator key.
    pub fn to_expression(&self) -> Result<TagExpression, TagError> {
        let mut keys = 0;
        keys += usize::from(self.and.is_some());
        keys += usize::from(self.or.is_some());
        keys += usize::from(self.not.is_some());
        keys += usize::from(self.any_in.is_some());
        keys += usize::from(self.tag.is_some());
        keys += usize::from(self.advanced.is_some());
        if keys != 1 {
            return Err(TagError::InvalidQuery(format!(
                "expected exactly one operator key, found {keys}"
            )));
        }

        if let Some(children) = &self.and {
            let children = children
                .iter()
                .map(TagQuery::to_expression)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(TagExpression::And(children));
        }
        if let Some(children) = &self.or {
            let children = children
                .iter()
                .map(TagQuery::to_expression)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(TagExpression::Or(children));
        }
        if let Some(child) = &self.not {
            return Ok(TagExpression::Not(Box::new(child.to_expression()?)));
        }
        if let Some(tags) = &self.any_in {
            for tag in tags {
                if !is_valid_tag(tag) {
                    return Err(TagError::InvalidTag(tag.clone()));
                }
            }
            return Ok(TagExpression::any_of(tags.iter().cloned()));
        }
        if let Some(tag) = &self.tag {
            if !is_valid_tag(tag) {
                return Err(TagError::InvalidTag(tag.clone()));
            }
            return Ok(TagExpression::Tag(tag.clone()));
        }
        if let Some(advanced) = &self.advanced {
            return parse_advanced(advanced);
        }
        unreachable!("key count checked above")
    }

    /// Evaluate the query against a tag set.
    pub fn evaluate(&self, tags: &HashSet<String>) -> Result<bool, TagError> {
        Ok(self.to_expression()?.evaluate(tags))
    }
}
