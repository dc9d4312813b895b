//! The scope↔tag bijection.
//!
//! Scope `tag:X` grants visibility of servers tagged `X`. A token's
//! effective filter is the OR of its tags.

use unimcp_tags::{TagExpression, is_valid_tag};

/// `web` → `tag:web`.
pub fn tag_to_scope(tag: &str) -> String {
    format!("tag:{tag}")
}

/// `tag:web` → `web`; `None` for anything not in the scope namespace.
pub fn scope_to_tag(scope: &str) -> Option<&str> {
    scope.strip_prefix("tag:").filter(|tag| is_valid_tag(tag))
}

/// Every configured tag as a scope list.
pub fn tags_to_scopes(tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| tag_to_scope(t)).collect()
}

/// The OR filter a token's scopes grant.
pub fn scopes_to_expression(scopes: &[String]) -> TagExpression {
    TagExpression::any_of(
        scopes
            .iter()
            .filter_map(|s| scope_to_tag(s))
            .map(ToString::to_string),
    )
}
