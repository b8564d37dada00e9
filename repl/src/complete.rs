//! Cursor-localized completion.
//!
//! Given the parsed input and a cursor offset, locate the innermost node
//! under the cursor (promoted to its member-expression parent when there
//! is one) and dispatch: identifiers complete from the global scope,
//! member chains walk the live value graph, path literals list their
//! parent directory under the REPL context.

use tern_engine::ast::{find_at, member_parent_at, Node, NodeKind};
use tern_engine::{Module, State, Value};
use tern_runtime::Context;
use tern_types::Span;
use tern_verbs::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    /// Rendered in the suggestion list.
    pub shown: String,
    /// Replacement for `span`.
    pub value: String,
    /// Source range the suggestion replaces.
    pub span: Span,
}

/// Suggestions for `input` with the cursor at byte `cursor`.
pub async fn complete(
    module: &Module,
    input: &str,
    cursor: u32,
    state: &State,
    ctx: &Context,
) -> Vec<Suggestion> {
    if input.trim().is_empty() {
        return all_globals(state, cursor);
    }
    if let Some(member) = member_parent_at(&module.root, cursor) {
        return member_suggestions(member, input, state);
    }
    match find_at(&module.root, cursor) {
        Some(node) => match &node.kind {
            NodeKind::Ident(prefix) => ident_suggestions(prefix, node.span, state),
            NodeKind::PathLit(raw) => path_suggestions(raw, node.span, ctx).await,
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn all_globals(state: &State, cursor: u32) -> Vec<Suggestion> {
    state
        .names()
        .into_iter()
        .map(|name| Suggestion {
            shown: name.clone(),
            value: name,
            span: Span::new(cursor, cursor),
        })
        .collect()
}

fn ident_suggestions(prefix: &str, span: Span, state: &State) -> Vec<Suggestion> {
    state
        .names()
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .map(|name| Suggestion {
            shown: name.clone(),
            value: name,
            span,
        })
        .collect()
}

fn member_suggestions(member: &Node, input: &str, state: &State) -> Vec<Suggestion> {
    let NodeKind::Member {
        base,
        segments,
        terminated,
    } = &member.kind
    else {
        return Vec::new();
    };
    let base_name = match &base.kind {
        NodeKind::Ident(name) | NodeKind::Variable(name) | NodeKind::GlobalVar(name) => name,
        _ => return Vec::new(),
    };
    let Some(mut value) = state.get(base_name) else {
        return Vec::new();
    };

    // Walk the live value graph. The first segment that does not resolve
    // on a record becomes the prefix to complete.
    for seg in segments {
        match value.memb(&seg.name) {
            Some(next) => value = next,
            None => {
                let chain_prefix = &input[member.span.start as usize..seg.span.start as usize];
                return value
                    .field_names()
                    .into_iter()
                    .filter(|f| f.starts_with(&seg.name))
                    .map(|field| Suggestion {
                        shown: format!("{chain_prefix}{field}"),
                        value: field,
                        span: seg.span,
                    })
                    .collect();
            }
        }
    }

    if !terminated {
        // Dangling dot: offer every field of the current record.
        let end = member.span.end;
        let chain_prefix = &input[member.span.start as usize..end as usize];
        return value
            .field_names()
            .into_iter()
            .map(|field| Suggestion {
                shown: format!("{chain_prefix}{field}"),
                value: field,
                span: Span::new(end, end),
            })
            .collect();
    }
    Vec::new()
}

async fn path_suggestions(raw: &str, span: Span, ctx: &Context) -> Vec<Suggestion> {
    let path = tern_types::Pth::new(raw);
    let (dir, prefix) = if path.is_dir() {
        (path.clone(), String::new())
    } else {
        (path.parent_dir(), path.base_name().to_string())
    };
    let Ok(Value::List(entries)) = fs::ls(ctx, &dir).await else {
        return Vec::new();
    };
    let Ok(entries) = entries.read() else {
        return Vec::new();
    };
    let dir_text = if path.is_dir() {
        raw.to_string()
    } else {
        match raw.rfind('/') {
            Some(idx) => raw[..=idx].to_string(),
            None => String::new(),
        }
    };
    entries
        .iter()
        .filter_map(|entry| {
            let name = match entry.memb("name") {
                Some(Value::Str(s)) => s,
                _ => return None,
            };
            if !name.starts_with(&prefix) {
                return None;
            }
            let is_dir = entry.memb("is_dir") == Some(Value::Bool(true));
            let completed = if is_dir {
                format!("{dir_text}{name}/")
            } else {
                format!("{dir_text}{name}")
            };
            Some(Suggestion {
                shown: completed.clone(),
                value: completed,
                span,
            })
        })
        .collect()
}
