//! The interactive shell loop.
//!
//! Raw mode is a scoped acquisition: the guard restores the terminal on
//! every exit path, panics included. The loop owns stdout; all other
//! output (tracing) goes to the debug log so the raw-mode screen is never
//! corrupted.

use std::io::Write;
use std::sync::Arc;

use crossterm::cursor;
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::queue;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};

use tern_engine::{ScriptEngine, State};
use tern_runtime::{Context, RtError};

use crate::complete;
use crate::config::ReplConfig;
use crate::editor::{EditAction, Editor};
use crate::highlight;
use crate::prompt;

/// Raw-mode terminal as an RAII acquisition.
struct RawModeGuard;

impl RawModeGuard {
    fn new() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

pub struct Repl {
    engine: Arc<dyn ScriptEngine>,
    state: State,
    ctx: Context,
    editor: Editor,
    config: ReplConfig,
    prompt_cache: String,
}

impl Repl {
    /// Build a shell over an already-populated state; installs the
    /// configured aliases and builtins (collisions are fatal).
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        mut state: State,
        ctx: Context,
        config: ReplConfig,
    ) -> Result<Self, RtError> {
        config.install(&mut state)?;
        Ok(Self {
            engine,
            state,
            ctx,
            editor: Editor::new(),
            config,
            prompt_cache: String::new(),
        })
    }

    async fn refresh_prompt(&mut self) {
        self.prompt_cache = prompt::render(
            &self.config.prompt,
            self.engine.as_ref(),
            &mut self.state,
            &self.ctx,
        )
        .await;
    }

    /// Repaint the prompt line with highlighted input and the cursor at
    /// its logical position.
    fn redraw(&self, out: &mut impl Write) -> std::io::Result<()> {
        let text = self.editor.text();
        queue!(out, cursor::MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        out.write_all(self.prompt_cache.as_bytes())?;
        match self.engine.parse(&text, "<repl>") {
            Ok(module) => {
                let spans = highlight::colorize(&module, text.len() as u32);
                out.write_all(highlight::render(&text, &spans).as_bytes())?;
            }
            Err(_) => out.write_all(text.as_bytes())?,
        }
        let right = self.editor.chars_right_of_cursor();
        if right > 0 {
            queue!(out, cursor::MoveLeft(right.min(u16::MAX as usize) as u16))?;
        }
        out.flush()
    }

    async fn run_line(&mut self, line: &str) -> Result<Option<String>, RtError> {
        let module = self.engine.parse(line, "<repl>")?;
        self.engine.check(&module)?;
        let value = self.engine.eval(&module, &mut self.state, &self.ctx).await?;
        // Blank results (nil, empty list) are suppressed.
        if value.is_blank() {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    /// Evaluate a committed line and print its result or error, with
    /// CR+LF conversion for the raw-mode terminal.
    pub async fn eval_line(&mut self, out: &mut impl Write, line: &str) -> std::io::Result<()> {
        out.write_all(b"\r\n")?;
        if !line.trim().is_empty() {
            match self.run_line(line).await {
                Ok(Some(rendered)) => {
                    out.write_all(rendered.replace('\n', "\r\n").as_bytes())?;
                    out.write_all(b"\r\n")?;
                }
                Ok(None) => {}
                Err(err) => {
                    let msg = err.to_string().replace('\n', "\r\n");
                    out.write_all(msg.as_bytes())?;
                    out.write_all(b"\r\n")?;
                }
            }
        }
        self.refresh_prompt().await;
        self.redraw(out)
    }

    async fn complete_input(&mut self, out: &mut impl Write, listing: bool) -> std::io::Result<()> {
        let text = self.editor.text();
        let cursor = self.editor.cursor_byte();
        let Ok(module) = self.engine.parse(&text, "<repl>") else {
            return Ok(());
        };
        let suggestions = complete::complete(&module, &text, cursor, &self.state, &self.ctx).await;
        if suggestions.len() == 1 {
            let s = &suggestions[0];
            self.editor.replace_range(s.span.start, s.span.end, &s.value);
            return self.redraw(out);
        }
        if listing && !suggestions.is_empty() {
            out.write_all(b"\r\n")?;
            let line = suggestions
                .iter()
                .map(|s| s.shown.as_str())
                .collect::<Vec<_>>()
                .join("  ");
            out.write_all(line.as_bytes())?;
            out.write_all(b"\r\n")?;
            return self.redraw(out);
        }
        Ok(())
    }

    /// Run the raw-mode input loop until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), RtError> {
        let _raw = RawModeGuard::new()?;
        let mut out = std::io::stdout();
        self.refresh_prompt().await;
        self.redraw(&mut out)?;
        loop {
            let event = tokio::task::spawn_blocking(event::read)
                .await
                .map_err(|e| RtError::Eval(format!("input task failed: {e}")))??;
            let Event::Key(key) = event else { continue };
            if key.kind == KeyEventKind::Release {
                continue;
            }
            match self.editor.apply_key(key) {
                EditAction::None => {}
                EditAction::Redraw => self.redraw(&mut out)?,
                EditAction::Exit => {
                    out.write_all(b"\r\n")?;
                    out.flush()?;
                    break;
                }
                EditAction::Commit(line) => self.eval_line(&mut out, &line).await?,
                EditAction::Complete { listing } => {
                    self.complete_input(&mut out, listing).await?;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn editor_mut(&mut self) -> &mut Editor {
        &mut self.editor
    }
}

#[cfg(test)]
mod tests {
    use super::Repl;
    use crate::config::ReplConfig;
    use std::sync::Arc;
    use tern_engine::{State, SurfaceEngine, Value};
    use tern_runtime::{Context, Limiter};

    fn repl() -> Repl {
        Repl::new(
            Arc::new(SurfaceEngine::new()),
            State::new(),
            Context::new(Vec::new(), Limiter::default()),
            ReplConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn eval_line_prints_results_with_crlf() {
        let mut repl = repl();
        let mut out = Vec::new();
        repl.eval_line(&mut out, "x = 2").await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("\r\n"));
        assert!(text.contains('2'));
        assert_eq!(repl.state().get("x"), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn eval_line_surfaces_errors() {
        let mut repl = repl();
        let mut out = Vec::new();
        repl.eval_line(&mut out, "missing").await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("not defined"));
    }

    #[tokio::test]
    async fn blank_results_are_suppressed() {
        let mut repl = repl();
        let mut out = Vec::new();
        repl.eval_line(&mut out, "[]").await.unwrap();
        let text = String::from_utf8_lossy(&out);
        // Just the line break and the fresh prompt: no rendered value.
        assert!(!text.contains("[]"));
    }

    #[tokio::test]
    async fn completion_rewrites_unique_match() {
        let mut state = State::new();
        state.set("fs", Value::object([("mkfile".into(), Value::Int(1))]));
        let mut repl = Repl::new(
            Arc::new(SurfaceEngine::new()),
            state,
            Context::new(Vec::new(), Limiter::default()),
            ReplConfig::default(),
        )
        .unwrap();
        repl.editor_mut().set_text("fs.mk");
        let mut out = Vec::new();
        repl.complete_input(&mut out, false).await.unwrap();
        assert_eq!(repl.editor_mut().text(), "fs.mkfile");
    }
}
