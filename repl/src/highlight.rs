//! AST-driven colorization.
//!
//! The current input is re-parsed on every keystroke (the parse is
//! error-tolerant) and a depth-first walk emits one [`ColorSpan`] per
//! colorable node. Spans of unfinished tokens can reach past the input;
//! the renderer clamps them.

use crossterm::style::{Color, ResetColor, SetForegroundColor};

use tern_engine::ast::{walk, Module, NodeKind};
use tern_types::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSpan {
    pub span: Span,
    pub color: Color,
}

const NAME: Color = Color::Cyan;
const NUMBER: Color = Color::Green;
const TEXTUAL: Color = Color::AnsiValue(209);
const PATTERN: Color = Color::DarkRed;
const CONSTANT: Color = Color::DarkBlue;
const BROKEN: Color = Color::Red;
const CONTROL: Color = Color::Magenta;
const DECL: Color = Color::DarkBlue;

/// Colorizations for `module`, sorted by start offset and clamped to
/// `input_len` bytes.
#[must_use]
pub fn colorize(module: &Module, input_len: u32) -> Vec<ColorSpan> {
    let mut out = Vec::new();
    walk(&module.root, &mut |node| {
        let color = match &node.kind {
            NodeKind::Ident(_)
            | NodeKind::Variable(_)
            | NodeKind::GlobalVar(_)
            | NodeKind::AtHost(_) => Some(NAME),
            NodeKind::PatternIdent(_) | NodeKind::Int(_) | NodeKind::Float(_) => Some(NUMBER),
            NodeKind::Str(_)
            | NodeKind::Flag(_)
            | NodeKind::UrlLit(_)
            | NodeKind::HostLit(_)
            | NodeKind::PathLit(_) => Some(TEXTUAL),
            NodeKind::PathPattern(_) | NodeKind::UrlPattern(_) | NodeKind::HostPattern(_) => {
                Some(PATTERN)
            }
            NodeKind::Bool(_) | NodeKind::Nil => Some(CONSTANT),
            NodeKind::Invalid => Some(BROKEN),
            NodeKind::KeywordCtrl(_) => Some(CONTROL),
            NodeKind::KeywordDecl(_) => Some(DECL),
            NodeKind::Member { segments, .. } => {
                for seg in segments {
                    out.push(ColorSpan {
                        span: seg.span,
                        color: NAME,
                    });
                }
                None
            }
            NodeKind::Record(fields) => {
                // Option-name prefixes.
                for field in fields {
                    out.push(ColorSpan {
                        span: field.name_span,
                        color: TEXTUAL,
                    });
                }
                None
            }
            NodeKind::Assign { name_span, .. } => {
                out.push(ColorSpan {
                    span: *name_span,
                    color: NAME,
                });
                None
            }
            _ => None,
        };
        if let Some(color) = color {
            out.push(ColorSpan {
                span: node.span,
                color,
            });
        }
    });
    for cs in &mut out {
        cs.span = cs.span.clamp_end(input_len);
    }
    out.retain(|cs| !cs.span.is_empty());
    out.sort_by_key(|cs| (cs.span.start, cs.span.end));
    out
}

/// Interleave default-colored runs with colorized ones. Overlapping spans
/// defer to the earlier one.
#[must_use]
pub fn render(input: &str, spans: &[ColorSpan]) -> String {
    let mut out = String::with_capacity(input.len() * 2);
    let mut pos = 0usize;
    for cs in spans {
        let start = cs.span.start as usize;
        let end = cs.span.end as usize;
        if start < pos || end > input.len() {
            continue;
        }
        out.push_str(&input[pos..start]);
        out.push_str(&SetForegroundColor(cs.color).to_string());
        out.push_str(&input[start..end]);
        out.push_str(&ResetColor.to_string());
        pos = end;
    }
    out.push_str(&input[pos..]);
    out
}
