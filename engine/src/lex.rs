//! Lexer for the surface front-end.
//!
//! Path, URL and host literals are first-class tokens: `/tmp/a/`,
//! `./rel.txt`, `https://example.com/x`. The lexer never fails; bytes it
//! cannot place become `Invalid` tokens with their span preserved.

use tern_types::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str { value: String, terminated: bool },
    PathLike(String),
    UrlLike(String),
    Variable(String),
    GlobalVar(String),
    AtHost(String),
    PatternIdent(String),
    Flag(String),
    Punct(char),
    Newline,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub span: Span,
    pub kind: TokenKind,
}

const PUNCT: &[char] = &['(', ')', '[', ']', '{', '}', ',', '.', '=', ':', ';'];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_path_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';' | '"' | ':')
}

fn is_url_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '{' | '}' | ',' | ';' | '"')
}

pub fn lex(source: &str) -> Vec<Token> {
    Lexer {
        src: source,
        chars: source.char_indices().peekable(),
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer<'s> {
    src: &'s str,
    chars: std::iter::Peekable<std::str::CharIndices<'s>>,
    tokens: Vec<Token>,
}

impl Lexer<'_> {
    fn run(mut self) -> Vec<Token> {
        while let Some(&(start, c)) = self.chars.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.chars.next();
                }
                '\n' => {
                    self.chars.next();
                    self.push(start, start + 1, TokenKind::Newline);
                }
                '#' => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                '"' => self.string(start),
                '0'..='9' => self.number(start),
                '/' | '~' => self.path(start),
                '.' => {
                    // `./x` and `../x` are paths, a lone `.` is member access.
                    let rest = &self.src[start..];
                    if rest.starts_with("./") || rest.starts_with("../") {
                        self.path(start);
                    } else {
                        self.chars.next();
                        self.push(start, start + 1, TokenKind::Punct('.'));
                    }
                }
                '$' => self.sigil(start, '$'),
                '@' => self.sigil(start, '@'),
                '%' => self.sigil(start, '%'),
                '-' => self.flag_or_number(start),
                c if is_ident_start(c) => self.ident_or_url(start),
                c if PUNCT.contains(&c) => {
                    self.chars.next();
                    self.push(start, start + c.len_utf8(), TokenKind::Punct(c));
                }
                c => {
                    self.chars.next();
                    self.push(
                        start,
                        start + c.len_utf8(),
                        TokenKind::Invalid(c.to_string()),
                    );
                }
            }
        }
        self.tokens
    }

    fn push(&mut self, start: usize, end: usize, kind: TokenKind) {
        self.tokens.push(Token {
            span: Span::new(start as u32, end as u32),
            kind,
        });
    }

    /// Consume chars while `pred` holds, returning the end byte offset.
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> usize {
        let mut end = self
            .chars
            .peek()
            .map_or(self.src.len(), |&(i, _)| i);
        while let Some(&(i, c)) = self.chars.peek() {
            if !pred(c) {
                end = i;
                return end;
            }
            self.chars.next();
            end = i + c.len_utf8();
        }
        end
    }

    fn string(&mut self, start: usize) {
        self.chars.next(); // opening quote
        let mut value = String::new();
        let mut terminated = false;
        let mut end = start + 1;
        while let Some((i, c)) = self.chars.next() {
            end = i + c.len_utf8();
            match c {
                '"' => {
                    terminated = true;
                    break;
                }
                '\\' => {
                    if let Some((j, esc)) = self.chars.next() {
                        end = j + esc.len_utf8();
                        value.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                }
                '\n' => {
                    // Strings do not span lines; leave the newline for the
                    // parser so statement separation survives mid-edit.
                    break;
                }
                other => value.push(other),
            }
        }
        self.push(start, end, TokenKind::Str { value, terminated });
    }

    fn number(&mut self, start: usize) {
        let mut end = self.take_while(|c| c.is_ascii_digit() || c == '_');
        let mut is_float = false;
        // Only a `.` followed by a digit continues the number; `1.foo` is
        // member access on an int literal.
        if self.src[end..].starts_with('.')
            && self.src[end + 1..].chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            self.chars.next(); // '.'
            end = self.take_while(|c| c.is_ascii_digit() || c == '_');
            is_float = true;
        }
        let text: String = self.src[start..end].chars().filter(|&c| c != '_').collect();
        let kind = if is_float {
            text.parse()
                .map(TokenKind::Float)
                .unwrap_or_else(|_| TokenKind::Invalid(text))
        } else {
            text.parse()
                .map(TokenKind::Int)
                .unwrap_or_else(|_| TokenKind::Invalid(text))
        };
        self.push(start, end, kind);
    }

    fn path(&mut self, start: usize) {
        let end = self.take_while(is_path_char);
        let text = self.src[start..end].to_string();
        self.push(start, end, TokenKind::PathLike(text));
    }

    fn sigil(&mut self, start: usize, sigil: char) {
        self.chars.next();
        // `$$name` is a global variable reference.
        let double = sigil == '$' && matches!(self.chars.peek(), Some(&(_, '$')));
        if double {
            self.chars.next();
        }
        let end = self.take_while(is_ident_continue);
        let name_start = start + if double { 2 } else { 1 };
        let name = self.src[name_start..end].to_string();
        if name.is_empty() {
            self.push(start, end.max(start + 1), TokenKind::Invalid(sigil.to_string()));
            return;
        }
        let kind = match (sigil, double) {
            ('$', true) => TokenKind::GlobalVar(name),
            ('$', false) => TokenKind::Variable(name),
            ('@', _) => TokenKind::AtHost(name),
            _ => TokenKind::PatternIdent(name),
        };
        self.push(start, end, kind);
    }

    fn flag_or_number(&mut self, start: usize) {
        self.chars.next(); // '-'
        match self.chars.peek() {
            Some(&(_, '-')) => {
                self.chars.next();
                let end = self.take_while(is_ident_continue);
                // Flags keep their dashes so they round-trip into argv.
                let text = self.src[start..end].to_string();
                self.push(start, end, TokenKind::Flag(text));
            }
            Some(&(_, c)) if c.is_ascii_alphabetic() => {
                let end = self.take_while(is_ident_continue);
                let text = self.src[start..end].to_string();
                self.push(start, end, TokenKind::Flag(text));
            }
            Some(&(_, c)) if c.is_ascii_digit() => {
                self.number(start);
            }
            _ => self.push(start, start + 1, TokenKind::Invalid("-".into())),
        }
    }

    fn ident_or_url(&mut self, start: usize) {
        let end = self.take_while(is_ident_continue);
        // `scheme://…` continues as a URL token.
        if self.src[end..].starts_with("://") {
            self.chars.next();
            self.chars.next();
            self.chars.next();
            let end = self.take_while(is_url_char);
            let text = self.src[start..end].to_string();
            self.push(start, end, TokenKind::UrlLike(text));
            return;
        }
        let text = self.src[start..end].to_string();
        self.push(start, end, TokenKind::Ident(text));
    }
}
