//! The tag expression tree and its evaluator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Longest permitted tag name.
pub const MAX_TAG_LEN: usize = 64;

/// True when `tag` matches `[A-Za-z0-9_-]{1,64}`.
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A parsed tag filter.
///
/// `And`/`Or` are n-ary (commutative, associative); the parser flattens
/// nested chains of the same operator. The empty filter is `Or([])`, which
/// matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagExpression {
    /// Matches when the tag is present.
    Tag(String),
    /// Matches when every child matches.
    And(Vec<TagExpression>),
    /// Matches when any child matches.
    Or(Vec<TagExpression>),
    /// Matches when the child does not.
    Not(Box<TagExpression>),
}

impl TagExpression {
    /// The empty expression: matches no tag set, including the empty one.
    pub fn empty() -> Self {
        Self::Or(Vec::new())
    }

    /// True for the empty expression.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Or(children) if children.is_empty())
    }

    /// Simple-OR over a list of tags, collapsing duplicates.
    pub fn any_of<I: IntoIterator<Item = String>>(tags: I) -> Self {
        let mut seen = HashSet::new();
        let children: Vec<TagExpression> = tags
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .map(TagExpression::Tag)
            .collect();
        Self::Or(children)
    }

    /// Evaluate against a set of tags. Pure; short-circuits And/Or.
    pub fn evaluate(&self, tags: &HashSet<String>) -> bool {
        match self {
            Self::Tag(v) => tags.contains(v),
            Self::And(children) => children.iter().all(|c| c.evaluate(tags)),
            Self::Or(children) => {
                !children.is_empty() && children.iter().any(|c| c.evaluate(tags))
            }
            Self::Not(child) => !child.evaluate(tags),
        }
    }

    /// Evaluate against a slice of tags (convenience for callers holding
    /// config-ordered lists).
    pub fn evaluate_slice(&self, tags: &[String]) -> bool {
        let set: HashSet<String> = tags.iter().cloned().collect();
        self.evaluate(&set)
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, parent: u8) -> fmt::Result {
        // Precedence ranks: or=0, and=1, not=2, atom=3.
        let (rank, result): (u8, fmt::Result) = match self {
            Self::Tag(v) => (3, write!(f, "{v}")),
            Self::Not(child) => (2, {
                write!(f, "!")?;
                child.fmt_prec(f, 2)
            }),
            Self::And(children) => (1, Self::fmt_chain(f, children, "+", 1, parent > 1)),
            Self::Or(children) => (0, Self::fmt_chain(f, children, ",", 0, parent > 0)),
        };
        debug_assert!(rank <= 3);
        result
    }

    fn fmt_chain(
        f: &mut fmt::Formatter<'_>,
        children: &[TagExpression],
        op: &str,
        rank: u8,
        parens: bool,
    ) -> fmt::Result {
        if parens {
            write!(f, "(")?;
        }
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                write!(f, "{op}")?;
            }
            child.fmt_prec(f, rank + 1)?;
        }
        if parens {
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Serializes to the advanced infix form: `+` and, `,` or, `!` not.
impl fmt::Display for TagExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0)
    }
}
