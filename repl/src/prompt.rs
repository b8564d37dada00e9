//! Prompt rendering.

use crossterm::style::{ResetColor, SetForegroundColor};

use tern_engine::{ScriptEngine, State, Value};
use tern_runtime::Context;

use crate::config::{PromptLeaf, PromptPart};

/// Values render without quoting in the prompt.
fn plain(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the prompt parts; lazy parts are evaluated now, and a part
/// whose evaluation fails renders as `?` rather than killing the prompt.
pub async fn render(
    parts: &[PromptPart],
    engine: &dyn ScriptEngine,
    state: &mut State,
    ctx: &Context,
) -> String {
    let mut out = String::new();
    for part in parts {
        let text = match &part.leaf {
            PromptLeaf::Text(s) => s.clone(),
            PromptLeaf::Lazy(func) => match engine.call(func, state, ctx, Vec::new()).await {
                Ok(value) => plain(&value),
                Err(err) => {
                    tracing::debug!(error = %err, "prompt part failed");
                    "?".to_string()
                }
            },
        };
        match part.color {
            Some(color) => {
                out.push_str(&SetForegroundColor(color).to_string());
                out.push_str(&text);
                out.push_str(&ResetColor.to_string());
            }
            None => out.push_str(&text),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::render;
    use crate::config::{PromptLeaf, PromptPart};
    use crossterm::style::Color;
    use tern_engine::{ScriptEngine, State, SurfaceEngine, Value};
    use tern_runtime::{Context, Limiter};

    fn ctx() -> Context {
        Context::new(Vec::new(), Limiter::default())
    }

    #[tokio::test]
    async fn text_and_colored_parts() {
        let parts = vec![
            PromptPart {
                leaf: PromptLeaf::Text("tern".into()),
                color: None,
            },
            PromptPart {
                leaf: PromptLeaf::Text("> ".into()),
                color: Some(Color::Cyan),
            },
        ];
        let engine = SurfaceEngine::new();
        let mut state = State::new();
        let out = render(&parts, &engine, &mut state, &ctx()).await;
        assert!(out.starts_with("tern"));
        assert!(out.contains("> "));
        assert!(out.contains("\u{1b}["));
    }

    #[tokio::test]
    async fn lazy_parts_evaluate_against_the_state() {
        let engine = SurfaceEngine::new();
        let mut state = State::new();
        let ctx = ctx();
        // `fn() $$who` closes over nothing; it reads a global at render time.
        let module = engine.parse("fn() $$who", "p").unwrap();
        let func = match engine.eval(&module, &mut state, &ctx).await.unwrap() {
            Value::Func(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        state.set("who", Value::Str("dev".into()));
        let parts = vec![PromptPart {
            leaf: PromptLeaf::Lazy(func),
            color: None,
        }];
        let out = render(&parts, &engine, &mut state, &ctx).await;
        assert_eq!(out, "dev");
    }

    #[tokio::test]
    async fn failing_lazy_part_renders_placeholder() {
        let engine = SurfaceEngine::new();
        let mut state = State::new();
        let ctx = ctx();
        let module = engine.parse("fn() $$missing", "p").unwrap();
        let func = match engine.eval(&module, &mut state, &ctx).await.unwrap() {
            Value::Func(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        let parts = vec![PromptPart {
            leaf: PromptLeaf::Lazy(func),
            color: None,
        }];
        let out = render(&parts, &engine, &mut state, &ctx).await;
        assert_eq!(out, "?");
    }
}
