//! The `{{…}}` renderer.
//!
//! Supported forms:
//!
//! - `{{path.to.field}}`: interpolation; absent paths render empty
//! - `{{#if path}}…{{else}}…{{/if}}`: truthy when the path resolves to a
//!   non-empty string
//! - `{{#if (eq a b)}}…{{/if}}`: equality over resolved values; operands
//!   may be paths or `"quoted"` literals
//!
//! Missing values never raise; only structurally broken templates
//! (unclosed tags, unbalanced blocks) produce [`TemplateError`].

use thiserror::Error;
use unimcp_config::McpServerParams;

use crate::context::ContextLookup;

/// Structural template failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed '{{{{' at byte {0}")]
    UnclosedTag(usize),
    #[error("'{{{{/if}}}}' without matching '{{{{#if}}}}' at byte {0}")]
    UnmatchedClose(usize),
    #[error("'{{{{#if}}}}' opened at byte {0} is never closed")]
    UnclosedIf(usize),
    #[error("'{{{{else}}}}' outside an if block at byte {0}")]
    StrayElse(usize),
    #[error("malformed condition {0:?}")]
    BadCondition(String),
}

/// Render a single template string against a context.
pub fn render_str(template: &str, ctx: &dyn ContextLookup) -> Result<String, TemplateError> {
    let segments = scan(template)?;
    let mut out = String::with_capacity(template.len());
    let mut pos = 0;
    render_segments(&segments, &mut pos, ctx, &mut out, true)?;
    Ok(out)
}

/// Render every string-valued leaf of `params`; non-string leaves pass
/// through untouched.
pub fn render_params(
    params: &McpServerParams,
    ctx: &dyn ContextLookup,
) -> Result<McpServerParams, TemplateError> {
    let mut rendered = params.clone();
    if let Some(command) = &params.command {
        rendered.command = Some(render_str(command, ctx)?);
    }
    rendered.args = params
        .args
        .iter()
        .map(|a| render_str(a, ctx))
        .collect::<Result<_, _>>()?;
    rendered.env = params
        .env
        .iter()
        .map(|(k, v)| Ok((k.clone(), render_str(v, ctx)?)))
        .collect::<Result<_, TemplateError>>()?;
    if let Some(cwd) = &params.cwd {
        rendered.cwd = Some(render_str(cwd, ctx)?);
    }
    if let Some(url) = &params.url {
        rendered.url = Some(render_str(url, ctx)?);
    }
    rendered.headers = params
        .headers
        .iter()
        .map(|(k, v)| Ok((k.clone(), render_str(v, ctx)?)))
        .collect::<Result<_, TemplateError>>()?;
    Ok(rendered)
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Interp(String),
    IfOpen { cond: String, at: usize },
    Else { at: usize },
    IfClose { at: usize },
}

fn scan(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let tag_start = offset + open;
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(TemplateError::UnclosedTag(tag_start));
        };
        let body = after[..close].trim();
        if let Some(cond) = body.strip_prefix("#if") {
            segments.push(Segment::IfOpen {
                cond: cond.trim().to_string(),
                at: tag_start,
            });
        } else if body == "else" {
            segments.push(Segment::Else { at: tag_start });
        } else if body == "/if" {
            segments.push(Segment::IfClose { at: tag_start });
        } else {
            segments.push(Segment::Interp(body.to_string()));
        }
        let consumed = open + 2 + close + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

/// Walk top-level segments, emitting into `out` while `emit` is set.
/// If-blocks recurse through `render_branch`.
fn render_segments(
    segments: &[Segment],
    pos: &mut usize,
    ctx: &dyn ContextLookup,
    out: &mut String,
    emit: bool,
) -> Result<(), TemplateError> {
    while *pos < segments.len() {
        match &segments[*pos] {
            Segment::Text(text) => {
                if emit {
                    out.push_str(text);
                }
                *pos += 1;
            }
            Segment::Interp(path) => {
                if emit {
                    out.push_str(&ctx.lookup(path).unwrap_or_default());
                }
                *pos += 1;
            }
            Segment::IfOpen { cond, at } => {
                let truthy = eval_condition(cond, ctx)?;
                let open_at = *at;
                *pos += 1;
                // Then-branch
                render_branch(segments, pos, ctx, out, emit && truthy, open_at)?;
                // Optional else-branch
                if matches!(segments.get(*pos), Some(Segment::Else { .. })) {
                    *pos += 1;
                    render_branch(segments, pos, ctx, out, emit && !truthy, open_at)?;
                }
                match segments.get(*pos) {
                    Some(Segment::IfClose { .. }) => *pos += 1,
                    _ => return Err(TemplateError::UnclosedIf(open_at)),
                }
            }
            Segment::Else { at } => {
                return Err(TemplateError::StrayElse(*at));
            }
            Segment::IfClose { at } => {
                return Err(TemplateError::UnmatchedClose(*at));
            }
        }
    }
    Ok(())
}

/// Render until the next `{{else}}`/`{{/if}}` at this nesting depth.
fn render_branch(
    segments: &[Segment],
    pos: &mut usize,
    ctx: &dyn ContextLookup,
    out: &mut String,
    emit: bool,
    open_at: usize,
) -> Result<(), TemplateError> {
    while *pos < segments.len() {
        match &segments[*pos] {
            Segment::Else { .. } | Segment::IfClose { .. } => return Ok(()),
            Segment::Text(text) => {
                if emit {
                    out.push_str(text);
                }
                *pos += 1;
            }
            Segment::Interp(path) => {
                if emit {
                    out.push_str(&ctx.lookup(path).unwrap_or_default());
                }
                *pos += 1;
            }
            Segment::IfOpen { cond, at } => {
                let truthy = eval_condition(cond, ctx)?;
                let inner_at = *at;
                *pos += 1;
                render_branch(segments, pos, ctx, out, emit && truthy, inner_at)?;
                if matches!(segments.get(*pos), Some(Segment::Else { .. })) {
                    *pos += 1;
                    render_branch(segments, pos, ctx, out, emit && !truthy, inner_at)?;
                }
                match segments.get(*pos) {
                    Some(Segment::IfClose { .. }) => *pos += 1,
                    _ => return Err(TemplateError::UnclosedIf(inner_at)),
                }
            }
        }
    }
    Err(TemplateError::UnclosedIf(open_at))
}

fn eval_condition(cond: &str, ctx: &dyn ContextLookup) -> Result<bool, TemplateError> {
    let cond = cond.trim();
    if let Some(inner) = cond.strip_prefix('(') {
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| TemplateError::BadCondition(cond.to_string()))?;
        let mut parts = split_operands(inner);
        let op = parts.next();
        match op.as_deref() {
            Some("eq") => {
                let a = parts
                    .next()
                    .ok_or_else(|| TemplateError::BadCondition(cond.to_string()))?;
                let b = parts
                    .next()
                    .ok_or_else(|| TemplateError::BadCondition(cond.to_string()))?;
                if parts.next().is_some() {
                    return Err(TemplateError::BadCondition(cond.to_string()));
                }
                Ok(resolve_operand(&a, ctx) == resolve_operand(&b, ctx))
            }
            _ => Err(TemplateError::BadCondition(cond.to_string())),
        }
    } else if cond.is_empty() {
        Err(TemplateError::BadCondition(cond.to_string()))
    } else {
        Ok(!ctx.lookup(cond).unwrap_or_default().is_empty())
    }
}

fn split_operands(input: &str) -> impl Iterator<Item = String> + '_ {
    // Whitespace-split with simple quote awareness; operands never nest.
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                // Mark quoted operands so "a" and path a stay distinct.
                current.push('\0');
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out.into_iter()
}

fn resolve_operand(operand: &str, ctx: &dyn ContextLookup) -> String {
    if let Some(literal) = operand.strip_prefix('\0') {
        literal.to_string()
    } else {
        ctx.lookup(operand).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextData;
    use pretty_assertions::assert_eq;

    fn ctx() -> ContextData {
        ContextData {
            project: serde_json::json!({"name": "alpha", "environment": "dev"}),
            session_id: Some("unimcp-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn plain_interpolation() {
        assert_eq!(
            render_str("run-{{project.name}}", &ctx()).unwrap(),
            "run-alpha"
        );
    }

    #[test]
    fn missing_resolves_empty() {
        assert_eq!(render_str("x{{project.none}}y", &ctx()).unwrap(), "xy");
        assert_eq!(render_str("{{totally.unknown}}", &ctx()).unwrap(), "");
    }

    #[test]
    fn if_else_blocks() {
        let tpl = "{{#if project.name}}named {{project.name}}{{else}}anonymous{{/if}}";
        assert_eq!(render_str(tpl, &ctx()).unwrap(), "named alpha");
        assert_eq!(
            render_str(tpl, &ContextData::default()).unwrap(),
            "anonymous"
        );
    }

    #[test]
    fn eq_condition() {
        let tpl = "{{#if (eq project.environment \"dev\")}}debug{{else}}quiet{{/if}}";
        assert_eq!(render_str(tpl, &ctx()).unwrap(), "debug");

        let mut prod = ctx();
        prod.project = serde_json::json!({"environment": "prod"});
        assert_eq!(render_str(tpl, &prod).unwrap(), "quiet");
    }

    #[test]
    fn eq_between_two_paths() {
        let tpl = "{{#if (eq project.name project.environment)}}same{{else}}diff{{/if}}";
        assert_eq!(render_str(tpl, &ctx()).unwrap(), "diff");
    }

    #[test]
    fn nested_ifs() {
        let tpl = "{{#if project.name}}{{#if sessionId}}both{{/if}}{{/if}}";
        assert_eq!(render_str(tpl, &ctx()).unwrap(), "both");
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(
            render_str("{{oops", &ctx()),
            Err(TemplateError::UnclosedTag(0))
        ));
        assert!(matches!(
            render_str("{{#if x}}no end", &ctx()),
            Err(TemplateError::UnclosedIf(_))
        ));
        assert!(matches!(
            render_str("{{/if}}", &ctx()),
            Err(TemplateError::UnmatchedClose(_))
        ));
        assert!(matches!(
            render_str("{{else}}", &ctx()),
            Err(TemplateError::StrayElse(_))
        ));
    }

    #[test]
    fn renders_params_string_leaves_only() {
        let params: McpServerParams = serde_json::from_value(serde_json::json!({
            "command": "worker",
            "args": ["--project", "{{project.name}}"],
            "env": {"SESSION": "{{sessionId}}"},
            "cwd": "/srv/{{project.name}}",
            "tags": ["a"],
            "connectionTimeout": 5000
        }))
        .unwrap();
        let rendered = render_params(&params, &ctx()).unwrap();
        assert_eq!(rendered.args, vec!["--project".to_string(), "alpha".to_string()]);
        assert_eq!(rendered.env["SESSION"], "unimcp-1");
        assert_eq!(rendered.cwd.as_deref(), Some("/srv/alpha"));
        assert_eq!(rendered.connection_timeout, Some(5000));
        assert_eq!(rendered.tags, vec!["a".to_string()]);
    }
}
