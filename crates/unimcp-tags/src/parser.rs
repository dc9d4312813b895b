//! Parsers for the simple and advanced tag filter syntaxes.
//!
//! Grammar (advanced):
//!
//! ```text
//! Expr   := Or
//! Or     := And ((',' | 'or') And)*
//! And    := Not (('+' | 'and') Not)*
//! Not    := ('-' | '!' | 'not') Not | Atom
//! Atom   := IDENT | '(' Expr ')'
//! IDENT  := [A-Za-z0-9_-]+
//! ```
//!
//! `-` binds as negation, so a leading dash cannot begin a tag name in the
//! advanced syntax; tags with interior dashes are fine. The word operators
//! `and`/`or`/`not` are reserved.

use crate::error::TagError;
use crate::expr::{TagExpression, is_valid_tag};

/// Parse a legacy simple-OR list: `a,b,c`.
///
/// Tags are validated against `[A-Za-z0-9_-]{1,64}`; duplicates collapse,
/// first occurrence order is kept. Empty input yields an empty list.
pub fn parse_simple(input: &str) -> Result<Vec<String>, TagError> {
    let mut out: Vec<String> = Vec::new();
    for part in input.split(',') {
        let tag = part.trim();
        if tag.is_empty() {
            continue;
        }
        if !is_valid_tag(tag) {
            return Err(TagError::InvalidTag(tag.to_string()));
        }
        if !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    Ok(out)
}

/// Parse an advanced infix expression.
///
/// The empty string (or all-whitespace input) parses to the empty
/// expression, which matches nothing.
pub fn parse_advanced(input: &str) -> Result<TagExpression, TagError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(TagExpression::empty());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(TagError::at(
            tok.pos,
            format!("unexpected {}", tok.kind.describe()),
        ));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Plus,
    Comma,
    Bang,
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier {s:?}"),
            Self::Plus => "'+'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Bang => "negation".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, TagError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token {
                    kind: TokenKind::Plus,
                    pos: i,
                });
                i += 1;
            }
            ',' => {
                tokens.push(Token {
                    kind: TokenKind::Comma,
                    pos: i,
                });
                i += 1;
            }
            '!' | '-' => {
                tokens.push(Token {
                    kind: TokenKind::Bang,
                    pos: i,
                });
                i += 1;
            }
            '(' => {
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    pos: i,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    pos: i,
                });
                i += 1;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    // A dash after the first identifier char belongs to the
                    // tag name, not to negation.
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                // Trailing dashes are valid tag chars, but "a--b" style runs
                // still must satisfy the tag charset, which they do.
                match word {
                    "and" => tokens.push(Token {
                        kind: TokenKind::Plus,
                        pos: start,
                    }),
                    "or" => tokens.push(Token {
                        kind: TokenKind::Comma,
                        pos: start,
                    }),
                    "not" => tokens.push(Token {
                        kind: TokenKind::Bang,
                        pos: start,
                    }),
                    _ => {
                        if !is_valid_tag(word) {
                            return Err(TagError::at(start, format!("invalid tag {word:?}")));
                        }
                        tokens.push(Token {
                            kind: TokenKind::Ident(word.to_string()),
                            pos: start,
                        });
                    }
                }
            }
            c if c.is_control() => {
                return Err(TagError::at(i, "control character in expression"));
            }
            other => {
                return Err(TagError::at(i, format!("unexpected character {other:?}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn end_pos(&self) -> usize {
        self.tokens.last().map_or(0, |t| t.pos + 1)
    }

    fn parse_or(&mut self) -> Result<TagExpression, TagError> {
        let first = self.parse_and()?;
        let mut children = vec![first];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
            self.bump();
            children.push(self.parse_and()?);
        }
        if children.len() == 1 {
            Ok(children.pop().expect("one child"))
        } else {
            Ok(TagExpression::Or(Self::flatten_or(children)))
        }
    }

    fn parse_and(&mut self) -> Result<TagExpression, TagError> {
        let first = self.parse_not()?;
        let mut children = vec![first];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Plus)) {
            self.bump();
            children.push(self.parse_not()?);
        }
        if children.len() == 1 {
            Ok(children.pop().expect("one child"))
        } else {
            Ok(TagExpression::And(Self::flatten_and(children)))
        }
    }

    fn parse_not(&mut self) -> Result<TagExpression, TagError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Bang)) {
            self.bump();
            let inner = self.parse_not()?;
            return Ok(TagExpression::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<TagExpression, TagError> {
        let end = self.end_pos();
        match self.bump() {
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => Ok(TagExpression::Tag(name)),
            Some(Token {
                kind: TokenKind::LParen,
                pos,
            }) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(tok) => Err(TagError::at(
                        tok.pos,
                        format!("expected ')', found {}", tok.kind.describe()),
                    )),
                    None => Err(TagError::at(pos, "unclosed '('")),
                }
            }
            Some(tok) => Err(TagError::at(
                tok.pos,
                format!("expected tag or '(', found {}", tok.kind.describe()),
            )),
            None => Err(TagError::at(end, "expected tag or '('")),
        }
    }

    fn flatten_or(children: Vec<TagExpression>) -> Vec<TagExpression> {
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            match child {
                TagExpression::Or(inner) if !inner.is_empty() => out.extend(inner),
                other => out.push(other),
            }
        }
        out
    }

    fn flatten_and(children: Vec<TagExpression>) -> Vec<TagExpression> {
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            match child {
                TagExpression::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn tags(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn simple_list() {
        assert_eq!(
            parse_simple("a, b,c").unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(parse_simple("a,a,b").unwrap().len(), 2);
        assert_eq!(parse_simple("").unwrap(), Vec::<String>::new());
        assert!(parse_simple("bad tag").is_err());
        assert!(parse_simple("ok,\u{1}").is_err());
    }

    #[test]
    fn advanced_precedence() {
        // not > and > or: a,b+!c == Or(a, And(b, Not(c)))
        let expr = parse_advanced("a,b+!c").unwrap();
        assert!(expr.evaluate(&tags(&["a"])));
        assert!(expr.evaluate(&tags(&["b"])));
        assert!(!expr.evaluate(&tags(&["b", "c"])));
        assert!(!expr.evaluate(&tags(&["c"])));
    }

    #[test]
    fn word_operators() {
        let expr = parse_advanced("web and not db or cli").unwrap();
        assert!(expr.evaluate(&tags(&["web"])));
        assert!(!expr.evaluate(&tags(&["web", "db"])));
        assert!(expr.evaluate(&tags(&["cli", "db"])));
    }

    #[test]
    fn dash_negation_and_interior_dashes() {
        let expr = parse_advanced("-db").unwrap();
        assert!(expr.evaluate(&tags(&["web"])));
        assert!(!expr.evaluate(&tags(&["db"])));

        let expr = parse_advanced("us-east-1").unwrap();
        assert!(expr.evaluate(&tags(&["us-east-1"])));
    }

    #[test]
    fn parens_override_precedence() {
        let expr = parse_advanced("(a,b)+c").unwrap();
        assert!(expr.evaluate(&tags(&["a", "c"])));
        assert!(!expr.evaluate(&tags(&["a"])));
    }

    #[test]
    fn empty_input_matches_nothing() {
        let expr = parse_advanced("").unwrap();
        assert!(expr.is_empty());
        assert!(!expr.evaluate(&tags(&["anything"])));
        assert!(parse_advanced("   ").unwrap().is_empty());
    }

    #[test]
    fn errors_carry_column() {
        match parse_advanced("a+%b") {
            Err(TagError::InvalidExpression { pos, .. }) => assert_eq!(pos, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
        match parse_advanced("a+") {
            Err(TagError::InvalidExpression { pos, .. }) => assert_eq!(pos, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(parse_advanced("(a").is_err());
        assert!(parse_advanced("a b").is_err());
    }

    #[test]
    fn round_trip_through_display() {
        for input in ["a", "a+b", "a,b", "!a", "a+!b,c", "(a,b)+c", "!(a+b)"] {
            let expr = parse_advanced(input).unwrap();
            let reparsed = parse_advanced(&expr.to_string()).unwrap();
            assert_eq!(expr, reparsed, "round-trip failed for {input:?}");
        }
    }

    proptest::proptest! {
        #[test]
        fn display_reparse_is_identity(seed in proptest::collection::vec(0u8..4, 1..8)) {
            // Build a small random tree, stringify, reparse, compare.
            fn build(seed: &[u8], depth: usize) -> TagExpression {
                if depth >= 3 || seed.is_empty() {
                    return TagExpression::Tag(format!("t{}", seed.first().copied().unwrap_or(0)));
                }
                match seed[0] % 4 {
                    0 => TagExpression::Tag(format!("t{}", seed.len())),
                    1 => TagExpression::Not(Box::new(build(&seed[1..], depth + 1))),
                    2 => TagExpression::And(vec![
                        build(&seed[1..], depth + 1),
                        TagExpression::Tag("x".into()),
                    ]),
                    _ => TagExpression::Or(vec![
                        build(&seed[1..], depth + 1),
                        TagExpression::Tag("y".into()),
                    ]),
                }
            }
            // Hand-built trees may nest And-in-And, which the parser
            // flattens, so the property is the display/parse fixpoint:
            // one reparse reaches canonical form and stays there.
            let expr = build(&seed, 0);
            let canonical = parse_advanced(&expr.to_string()).unwrap();
            let again = parse_advanced(&canonical.to_string()).unwrap();
            proptest::prop_assert_eq!(canonical, again);
        }
    }
}
