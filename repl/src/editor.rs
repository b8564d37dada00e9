//! The line editor proper.
//!
//! Input is a `Vec<char>`; the logical cursor is `backspace_count`, the
//! number of characters to the right of it. Key handling is a pure state
//! transition so it can be tested without a terminal.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::history::History;

/// What the shell loop should do after a key was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditAction {
    None,
    Redraw,
    Commit(String),
    Exit,
    /// Tab was pressed; `listing` is set on the second press in a row.
    Complete { listing: bool },
}

#[derive(Debug, Default)]
pub struct Editor {
    input: Vec<char>,
    backspace_count: usize,
    history: History,
    last_was_tab: bool,
}

impl Editor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.input.iter().collect()
    }

    /// Char index of the cursor.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.input.len() - self.backspace_count
    }

    /// Byte offset of the cursor into [`Editor::text`].
    #[must_use]
    pub fn cursor_byte(&self) -> u32 {
        self.input[..self.cursor()]
            .iter()
            .map(|c| c.len_utf8() as u32)
            .sum()
    }

    #[must_use]
    pub fn chars_right_of_cursor(&self) -> usize {
        self.backspace_count
    }

    pub fn set_text(&mut self, text: &str) {
        self.input = text.chars().collect();
        self.backspace_count = 0;
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    /// Replace the byte range `start..end` of the current text.
    pub fn replace_range(&mut self, start: u32, end: u32, replacement: &str) {
        let text = self.text();
        let start = (start as usize).min(text.len());
        let end = (end as usize).min(text.len()).max(start);
        let mut out = String::with_capacity(text.len() + replacement.len());
        out.push_str(&text[..start]);
        out.push_str(replacement);
        out.push_str(&text[end..]);
        let right = text[end..].chars().count();
        self.input = out.chars().collect();
        self.backspace_count = right;
    }

    fn insert(&mut self, c: char) {
        let at = self.cursor();
        self.input.insert(at, c);
        // Opening brackets bring their closer along, cursor in between.
        if let Some(closer) = matching_closer(c) {
            self.input.insert(at + 1, closer);
            self.backspace_count += 1;
        }
    }

    fn backspace(&mut self) {
        let at = self.cursor();
        if at > 0 {
            self.input.remove(at - 1);
        }
    }

    pub fn apply_key(&mut self, key: KeyEvent) -> EditAction {
        let was_tab = self.last_was_tab;
        self.last_was_tab = false;
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => EditAction::Exit,
            KeyCode::Char(c)
                if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT =>
            {
                self.insert(c);
                EditAction::Redraw
            }
            KeyCode::Backspace => {
                self.backspace();
                EditAction::Redraw
            }
            KeyCode::Enter => {
                let line = self.text();
                self.history.push(&line);
                self.input.clear();
                self.backspace_count = 0;
                EditAction::Commit(line)
            }
            KeyCode::Left => {
                if self.backspace_count < self.input.len() {
                    self.backspace_count += 1;
                }
                EditAction::Redraw
            }
            KeyCode::Right => {
                self.backspace_count = self.backspace_count.saturating_sub(1);
                EditAction::Redraw
            }
            KeyCode::Home => {
                self.backspace_count = self.input.len();
                EditAction::Redraw
            }
            KeyCode::End => {
                self.backspace_count = 0;
                EditAction::Redraw
            }
            KeyCode::Up => {
                if let Some(line) = self.history.prev() {
                    let line = line.to_string();
                    self.set_text(&line);
                }
                EditAction::Redraw
            }
            KeyCode::Down => {
                if let Some(line) = self.history.next() {
                    let line = line.to_string();
                    self.set_text(&line);
                }
                EditAction::Redraw
            }
            KeyCode::Tab => {
                self.last_was_tab = true;
                EditAction::Complete { listing: was_tab }
            }
            // A bare Escape usually means a CSI sequence the terminal
            // already swallowed; ignore it.
            KeyCode::Esc => EditAction::None,
            _ => EditAction::None,
        }
    }
}

const fn matching_closer(c: char) -> Option<char> {
    match c {
        '(' => Some(')'),
        '[' => Some(']'),
        '{' => Some('}'),
        _ => None,
    }
}
