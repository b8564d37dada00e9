//! Error-tolerant surface parser.
//!
//! Built to be re-run on every keystroke: whatever the input, it produces
//! a module tree with byte-accurate spans, downgrading unparseable regions
//! to `Invalid` nodes instead of failing. A dangling `.` leaves its member
//! chain marked unterminated so the completer can offer every field.

use tern_runtime::{ActionKind, LimitKind};
use tern_types::Span;

use crate::ast::{CtrlKeyword, DeclKeyword, MemberSeg, Module, Node, NodeKind, RecordField};
use crate::lex::{lex, Token, TokenKind};
use crate::requirements::{EntityDecl, RequirementDecl};

pub fn parse_module(source: &str, filename: &str) -> Module {
    let mut parser = Parser {
        tokens: lex(source),
        pos: 0,
        len: source.len() as u32,
    };
    let requirements = parser.requirements();
    let mut items = Vec::new();
    loop {
        parser.eat_separators();
        if parser.peek().is_none() {
            break;
        }
        items.push(parser.statement());
    }
    Module {
        root: Node::new(Span::new(0, parser.len), NodeKind::Block(items)),
        requirements,
        filename: filename.to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    len: u32,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Some(t) if t.kind == TokenKind::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_separators(&mut self) {
        while matches!(
            self.peek(),
            Some(t) if matches!(t.kind, TokenKind::Newline | TokenKind::Punct(';'))
        ) {
            self.pos += 1;
        }
    }

    fn end_span(&self) -> Span {
        Span::new(self.len, self.len)
    }

    // --- statements -----------------------------------------------------

    fn statement(&mut self) -> Node {
        if let (Some(Token { kind: TokenKind::Ident(name), span }), Some(next)) =
            (self.peek().cloned(), self.peek_at(1))
        {
            if next.kind == TokenKind::Punct('=') && !is_keyword(&name) {
                self.pos += 2;
                let value = self.expr();
                let full = span.cover(value.span);
                return Node::new(
                    full,
                    NodeKind::Assign {
                        name,
                        name_span: span,
                        value: Box::new(value),
                    },
                );
            }
        }
        self.expr()
    }

    // --- expressions ----------------------------------------------------

    fn expr(&mut self) -> Node {
        let primary = self.primary();
        self.postfix(primary)
    }

    fn primary(&mut self) -> Node {
        let Some(tok) = self.next() else {
            return Node::new(self.end_span(), NodeKind::Invalid);
        };
        let span = tok.span;
        match tok.kind {
            TokenKind::Int(n) => Node::new(span, NodeKind::Int(n)),
            TokenKind::Float(x) => Node::new(span, NodeKind::Float(x)),
            TokenKind::Str { value, .. } => Node::new(span, NodeKind::Str(value)),
            TokenKind::PathLike(raw) => Node::new(span, classify_path(&raw)),
            TokenKind::UrlLike(raw) => Node::new(span, classify_url(&raw)),
            TokenKind::Variable(name) => Node::new(span, NodeKind::Variable(name)),
            TokenKind::GlobalVar(name) => Node::new(span, NodeKind::GlobalVar(name)),
            TokenKind::AtHost(name) => Node::new(span, NodeKind::AtHost(name)),
            TokenKind::PatternIdent(name) => Node::new(span, NodeKind::PatternIdent(name)),
            TokenKind::Flag(name) => Node::new(span, NodeKind::Flag(name)),
            TokenKind::Ident(name) => self.ident_node(span, name),
            TokenKind::Punct('(') => {
                let inner = self.expr();
                self.eat_punct(')');
                inner
            }
            TokenKind::Punct('[') => self.list(span),
            TokenKind::Punct('{') => self.record(span),
            _ => Node::new(span, NodeKind::Invalid),
        }
    }

    fn ident_node(&mut self, span: Span, name: String) -> Node {
        match name.as_str() {
            "true" => Node::new(span, NodeKind::Bool(true)),
            "false" => Node::new(span, NodeKind::Bool(false)),
            "nil" => Node::new(span, NodeKind::Nil),
            "if" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::If)),
            "switch" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Switch)),
            "match" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Match)),
            "return" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Return)),
            "break" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Break)),
            "continue" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Continue)),
            "spawn" => Node::new(span, NodeKind::KeywordCtrl(CtrlKeyword::Spawn)),
            "assign" => Node::new(span, NodeKind::KeywordDecl(DeclKeyword::Assign)),
            "const" => Node::new(span, NodeKind::KeywordDecl(DeclKeyword::Const)),
            "import" => Node::new(span, NodeKind::KeywordDecl(DeclKeyword::Import)),
            "drop-perms" => Node::new(span, NodeKind::KeywordDecl(DeclKeyword::DropPerms)),
            "fn" => self.fn_lit(span),
            _ => Node::new(span, NodeKind::Ident(name)),
        }
    }

    fn fn_lit(&mut self, kw_span: Span) -> Node {
        let mut params = Vec::new();
        if self.eat_punct('(') {
            loop {
                match self.peek().cloned() {
                    Some(Token {
                        kind: TokenKind::Ident(name),
                        ..
                    }) => {
                        self.pos += 1;
                        params.push(name);
                        self.eat_punct(',');
                    }
                    _ => break,
                }
            }
            self.eat_punct(')');
        }
        let body = self.expr();
        let span = kw_span.cover(body.span);
        Node::new(
            span,
            NodeKind::FnLit {
                params,
                body: Box::new(body),
            },
        )
    }

    fn list(&mut self, open: Span) -> Node {
        let mut items = Vec::new();
        let mut end = open;
        loop {
            self.eat_separators();
            match self.peek() {
                None => break,
                Some(t) if t.kind == TokenKind::Punct(']') => {
                    end = t.span;
                    self.pos += 1;
                    break;
                }
                _ => {
                    items.push(self.expr());
                    self.eat_punct(',');
                }
            }
        }
        let span = items
            .iter()
            .fold(open.cover(end), |s, n| s.cover(n.span));
        Node::new(span, NodeKind::List(items))
    }

    fn record(&mut self, open: Span) -> Node {
        let mut fields = Vec::new();
        let mut end = open;
        loop {
            self.eat_separators();
            match self.peek().cloned() {
                None => break,
                Some(t) if t.kind == TokenKind::Punct('}') => {
                    end = t.span;
                    self.pos += 1;
                    break;
                }
                Some(Token { kind, span }) => {
                    let name = match kind {
                        TokenKind::Ident(name) => name,
                        TokenKind::Str { value, .. } => value,
                        _ => {
                            // Not a field name; swallow one token to make progress.
                            self.pos += 1;
                            continue;
                        }
                    };
                    self.pos += 1;
                    if !self.eat_punct(':') {
                        fields.push(RecordField {
                            name,
                            name_span: span,
                            value: Node::new(span, NodeKind::Invalid),
                        });
                        continue;
                    }
                    let value = self.expr();
                    fields.push(RecordField {
                        name,
                        name_span: span,
                        value,
                    });
                    self.eat_punct(',');
                }
            }
        }
        let span = fields
            .iter()
            .fold(open.cover(end), |s, f| s.cover(f.value.span));
        Node::new(span, NodeKind::Record(fields))
    }

    fn postfix(&mut self, mut node: Node) -> Node {
        loop {
            if let Some(dot) = self.peek().cloned()
                && dot.kind == TokenKind::Punct('.')
            {
                self.pos += 1;
                let (seg, terminated) = match self.peek().cloned() {
                    Some(Token {
                        kind: TokenKind::Ident(name),
                        span,
                    }) => {
                        self.pos += 1;
                        (Some(MemberSeg { name, span }), true)
                    }
                    _ => (None, false),
                };
                node = extend_member(node, seg, terminated, dot.span);
                if !terminated {
                    return node;
                }
                continue;
            }
            if let Some(open) = self.peek().cloned()
                && open.kind == TokenKind::Punct('(')
            {
                self.pos += 1;
                let mut args = Vec::new();
                let mut end = open.span;
                loop {
                    self.eat_separators();
                    match self.peek() {
                        None => break,
                        Some(t) if t.kind == TokenKind::Punct(')') => {
                            end = t.span;
                            self.pos += 1;
                            break;
                        }
                        _ => {
                            args.push(self.expr());
                            self.eat_punct(',');
                        }
                    }
                }
                let span = args
                    .iter()
                    .fold(node.span.cover(end), |s, a| s.cover(a.span));
                node = Node::new(
                    span,
                    NodeKind::Call {
                        callee: Box::new(node),
                        args,
                    },
                );
                continue;
            }
            return node;
        }
    }

    // --- requirements ---------------------------------------------------

    fn requirements(&mut self) -> Vec<RequirementDecl> {
        self.eat_separators();
        let is_require = matches!(
            (self.peek(), self.peek_at(1)),
            (
                Some(Token { kind: TokenKind::Ident(name), .. }),
                Some(Token { kind: TokenKind::Punct('{'), .. })
            ) if name == "require"
        );
        if !is_require {
            return Vec::new();
        }
        self.pos += 2;

        let mut decls = Vec::new();
        loop {
            self.eat_separators();
            let Some(tok) = self.next() else { break };
            match tok.kind {
                TokenKind::Punct('}') => break,
                TokenKind::Ident(word) => match word.as_str() {
                    "read" | "create" | "update" | "delete" | "provide" => {
                        let kind = action_kind(&word);
                        if let Some(decl) = self.perm_entry(kind, &word) {
                            decls.push(decl);
                        }
                    }
                    "command" => {
                        if let Some(decl) = self.command_entry() {
                            decls.push(decl);
                        }
                    }
                    "limit" => {
                        if let Some(decl) = self.limit_entry() {
                            decls.push(decl);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        decls
    }

    fn perm_entry(&mut self, kind: ActionKind, kind_word: &str) -> Option<RequirementDecl> {
        match self.peek().cloned() {
            Some(Token {
                kind: TokenKind::PathLike(raw),
                ..
            }) => {
                self.pos += 1;
                Some(RequirementDecl::Perm {
                    kind,
                    entity: match classify_path(&raw) {
                        NodeKind::PathPattern(p) => EntityDecl::PathPattern(p),
                        _ => EntityDecl::Path(raw),
                    },
                })
            }
            Some(Token {
                kind: TokenKind::UrlLike(raw),
                ..
            }) => {
                self.pos += 1;
                let entity = match classify_url(&raw) {
                    NodeKind::HostLit(h) => EntityDecl::Host(h),
                    NodeKind::HostPattern(h) => EntityDecl::HostPattern(h),
                    NodeKind::UrlPattern(u) => EntityDecl::UrlPattern(u),
                    _ => EntityDecl::Url(raw),
                };
                Some(RequirementDecl::Perm { kind, entity })
            }
            // `read cli-args: true` style custom entries.
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => {
                self.pos += 1;
                if !self.eat_punct(':') {
                    return None;
                }
                let value = self.literal_json()?;
                Some(RequirementDecl::Custom {
                    kind: kind_word.to_string(),
                    name,
                    value,
                })
            }
            _ => None,
        }
    }

    fn command_entry(&mut self) -> Option<RequirementDecl> {
        let name = match self.next()? {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            _ => return None,
        };
        let mut chain = Vec::new();
        if self.eat_punct('[') {
            loop {
                match self.peek().cloned() {
                    Some(Token {
                        kind: TokenKind::Ident(sub),
                        ..
                    }) => {
                        self.pos += 1;
                        chain.push(sub);
                        self.eat_punct(',');
                    }
                    _ => break,
                }
            }
            self.eat_punct(']');
        }
        Some(RequirementDecl::Command { name, chain })
    }

    fn limit_entry(&mut self) -> Option<RequirementDecl> {
        let name = match self.next()? {
            Token {
                kind: TokenKind::Str { value, .. },
                ..
            } => value,
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            _ => return None,
        };
        let kind = match self.next()? {
            Token {
                kind: TokenKind::Ident(word),
                ..
            } => match word.as_str() {
                "bytes" => LimitKind::ByteRate,
                "ops" => LimitKind::OpRate,
                "total" => LimitKind::Total,
                _ => return None,
            },
            _ => return None,
        };
        let rate = match self.next()? {
            Token {
                kind: TokenKind::Int(n),
                ..
            } if n >= 0 => n as u64,
            _ => return None,
        };
        Some(RequirementDecl::Limit { name, kind, rate })
    }

    fn literal_json(&mut self) -> Option<serde_json::Value> {
        match self.next()?.kind {
            TokenKind::Int(n) => Some(serde_json::Value::from(n)),
            TokenKind::Float(x) => serde_json::Number::from_f64(x).map(serde_json::Value::Number),
            TokenKind::Str { value, .. } => Some(serde_json::Value::String(value)),
            TokenKind::Ident(word) => match word.as_str() {
                "true" => Some(serde_json::Value::Bool(true)),
                "false" => Some(serde_json::Value::Bool(false)),
                "nil" => Some(serde_json::Value::Null),
                other => Some(serde_json::Value::String(other.to_string())),
            },
            _ => None,
        }
    }
}

fn extend_member(node: Node, seg: Option<MemberSeg>, terminated: bool, dot_span: Span) -> Node {
    let new_end = seg.as_ref().map_or(dot_span, |s| s.span);
    match node.kind {
        NodeKind::Member {
            base,
            mut segments,
            ..
        } => {
            if let Some(seg) = seg {
                segments.push(seg);
            }
            Node::new(
                node.span.cover(new_end),
                NodeKind::Member {
                    base,
                    segments,
                    terminated,
                },
            )
        }
        _ => Node::new(
            node.span.cover(new_end),
            NodeKind::Member {
                base: Box::new(node),
                segments: seg.into_iter().collect(),
                terminated,
            },
        ),
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "true"
            | "false"
            | "nil"
            | "if"
            | "switch"
            | "match"
            | "return"
            | "break"
            | "continue"
            | "spawn"
            | "assign"
            | "const"
            | "import"
            | "drop-perms"
            | "fn"
            | "require"
    )
}

fn action_kind(word: &str) -> ActionKind {
    match word {
        "create" => ActionKind::Create,
        "update" => ActionKind::Update,
        "delete" => ActionKind::Delete,
        "provide" => ActionKind::Provide,
        _ => ActionKind::Read,
    }
}

fn classify_path(raw: &str) -> NodeKind {
    if raw.contains('*') || raw.contains('?') {
        NodeKind::PathPattern(raw.to_string())
    } else {
        NodeKind::PathLit(raw.to_string())
    }
}

fn classify_url(raw: &str) -> NodeKind {
    let rest = raw.split_once("://").map_or("", |(_, rest)| rest);
    let (authority, path) = rest.split_once('/').map_or((rest, None), |(a, p)| (a, Some(p)));
    if authority.contains('*') {
        NodeKind::HostPattern(raw.to_string())
    } else if raw.contains('*') {
        NodeKind::UrlPattern(raw.to_string())
    } else if path.is_none() {
        NodeKind::HostLit(raw.to_string())
    } else {
        NodeKind::UrlLit(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::parse_module;
    use crate::ast::{NodeKind, find_at};
    use tern_runtime::{ActionKind, LimitKind};
    use crate::requirements::{EntityDecl, RequirementDecl};

    fn first_stmt(src: &str) -> crate::ast::Node {
        let module = parse_module(src, "test.tn");
        match module.root.kind {
            NodeKind::Block(mut items) => items.remove(0),
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn assignment_statement() {
        let stmt = first_stmt("x = 3");
        match stmt.kind {
            NodeKind::Assign { name, value, .. } => {
                assert_eq!(name, "x");
                assert_eq!(value.kind, NodeKind::Int(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn call_with_path_and_string() {
        let stmt = first_stmt("mkfile(./a.txt, \"hi\")");
        match stmt.kind {
            NodeKind::Call { callee, args } => {
                assert_eq!(callee.kind, NodeKind::Ident("mkfile".into()));
                assert_eq!(args[0].kind, NodeKind::PathLit("./a.txt".into()));
                assert_eq!(args[1].kind, NodeKind::Str("hi".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn member_chain_with_call() {
        let stmt = first_stmt("fs.mkfile(./a)");
        match stmt.kind {
            NodeKind::Call { callee, .. } => match callee.kind {
                NodeKind::Member {
                    base,
                    segments,
                    terminated,
                } => {
                    assert_eq!(base.kind, NodeKind::Ident("fs".into()));
                    assert_eq!(segments.len(), 1);
                    assert_eq!(segments[0].name, "mkfile");
                    assert!(terminated);
                }
                other => panic!("unexpected callee {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dangling_dot_marks_unterminated() {
        let stmt = first_stmt("fs.");
        match stmt.kind {
            NodeKind::Member {
                segments,
                terminated,
                ..
            } => {
                assert!(segments.is_empty());
                assert!(!terminated);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn record_keeps_key_spans() {
        let stmt = first_stmt("{ timeout: 10, mode: \"fast\" }");
        match stmt.kind {
            NodeKind::Record(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "timeout");
                assert_eq!(fields[0].name_span.start, 2);
                assert_eq!(fields[0].name_span.end, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn url_host_and_pattern_classification() {
        assert!(matches!(
            first_stmt("https://e.com/v1").kind,
            NodeKind::UrlLit(_)
        ));
        assert!(matches!(
            first_stmt("https://e.com").kind,
            NodeKind::HostLit(_)
        ));
        assert!(matches!(
            first_stmt("https://e.com/v1/*").kind,
            NodeKind::UrlPattern(_)
        ));
        assert!(matches!(
            first_stmt("https://*.e.com").kind,
            NodeKind::HostPattern(_)
        ));
        assert!(matches!(
            first_stmt("/tmp/*.json").kind,
            NodeKind::PathPattern(_)
        ));
    }

    #[test]
    fn garbage_degrades_to_invalid_nodes() {
        let module = parse_module("mkfile(&", "t");
        let mut invalid = 0;
        crate::ast::walk(&module.root, &mut |n| {
            if n.kind == NodeKind::Invalid {
                invalid += 1;
            }
        });
        assert!(invalid > 0);
    }

    #[test]
    fn require_block_parses_permissions_and_limits() {
        let src = r#"require {
            read /tmp/data/
            create /tmp/data/
            provide https://localhost:8443
            command git [remote, show]
            limit "fs/write" bytes 100000
            limit "fs/total-new-file" total 10
            read cli-args: true
        }
        x = 1"#;
        let module = parse_module(src, "t");
        assert_eq!(module.requirements.len(), 7);
        assert_eq!(
            module.requirements[0],
            RequirementDecl::Perm {
                kind: ActionKind::Read,
                entity: EntityDecl::Path("/tmp/data/".into())
            }
        );
        assert_eq!(
            module.requirements[3],
            RequirementDecl::Command {
                name: "git".into(),
                chain: vec!["remote".into(), "show".into()]
            }
        );
        assert_eq!(
            module.requirements[5],
            RequirementDecl::Limit {
                name: "fs/total-new-file".into(),
                kind: LimitKind::Total,
                rate: 10
            }
        );
        assert_eq!(
            module.requirements[6],
            RequirementDecl::Custom {
                kind: "read".into(),
                name: "cli-args".into(),
                value: serde_json::Value::Bool(true)
            }
        );
        // The body still parses after the header.
        assert!(matches!(module.root.kind, NodeKind::Block(ref items) if items.len() == 1));
    }

    #[test]
    fn cursor_lookup_inside_parse_tree() {
        let module = parse_module("ls(/tmp/)", "t");
        let node = find_at(&module.root, 6).unwrap();
        assert_eq!(node.kind, NodeKind::PathLit("/tmp/".into()));
    }
}
