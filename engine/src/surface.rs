//! The bundled surface front-end.
//!
//! Implements [`ScriptEngine`] for the interactive subset: literals,
//! identifier and member lookup, assignment, list/record construction,
//! single-expression `fn` literals, and calls into native verbs. Control
//! flow and the full checker belong to the external language
//! implementation; reaching for them here is an `Eval` error, not a panic.

use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use tern_runtime::{Context, RtError};
use tern_types::{HttpHost, Pth};

use crate::ast::{walk, Module, Node, NodeKind};
use crate::parse::parse_module;
use crate::state::State;
use crate::value::{FuncKind, FuncValue, Value};
use crate::{ScriptEngine, VerbFut};

#[derive(Debug, Default, Clone, Copy)]
pub struct SurfaceEngine;

impl SurfaceEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for SurfaceEngine {
    fn parse(&self, source: &str, filename: &str) -> Result<Module, RtError> {
        Ok(parse_module(source, filename))
    }

    fn check(&self, module: &Module) -> Result<(), RtError> {
        let mut first_invalid = None;
        walk(&module.root, &mut |node| {
            if node.kind == NodeKind::Invalid && first_invalid.is_none() {
                first_invalid = Some(node.span);
            }
        });
        match first_invalid {
            Some(span) => Err(RtError::Check(format!(
                "invalid syntax at byte {}",
                span.start
            ))),
            None => Ok(()),
        }
    }

    fn eval<'a>(
        &'a self,
        module: &'a Module,
        state: &'a mut State,
        ctx: &'a Context,
    ) -> VerbFut<'a> {
        Box::pin(async move {
            let mut locals = Vec::new();
            let mut last = Value::Nil;
            if let NodeKind::Block(items) = &module.root.kind {
                for item in items {
                    last = eval_node(item, state, &mut locals, ctx).await?;
                }
            }
            Ok(last)
        })
    }

    fn call<'a>(
        &'a self,
        func: &'a FuncValue,
        state: &'a mut State,
        ctx: &'a Context,
        args: Vec<Value>,
    ) -> VerbFut<'a> {
        Box::pin(async move {
            let mut locals = Vec::new();
            call_func(func, state, &mut locals, ctx, args).await
        })
    }
}

type Locals = Vec<BTreeMap<String, Value>>;

fn lookup(name: &str, state: &State, locals: &Locals) -> Option<Value> {
    for scope in locals.iter().rev() {
        if let Some(v) = scope.get(name) {
            return Some(v.clone());
        }
    }
    state.get(name)
}

fn eval_node<'a>(
    node: &'a Node,
    state: &'a mut State,
    locals: &'a mut Locals,
    ctx: &'a Context,
) -> VerbFut<'a> {
    Box::pin(async move {
        ctx.ensure_live()?;
        match &node.kind {
            NodeKind::Block(items) => {
                let mut last = Value::Nil;
                for item in items {
                    last = eval_node(item, state, locals, ctx).await?;
                }
                Ok(last)
            }
            NodeKind::Nil => Ok(Value::Nil),
            NodeKind::Bool(b) => Ok(Value::Bool(*b)),
            NodeKind::Int(n) => Ok(Value::Int(*n)),
            NodeKind::Float(x) => Ok(Value::Float(*x)),
            NodeKind::Str(s) | NodeKind::Flag(s) => Ok(Value::Str(s.clone())),
            NodeKind::PathLit(p) | NodeKind::PathPattern(p) => Ok(Value::Path(Pth::new(p.as_str()))),
            NodeKind::UrlLit(u) => Url::parse(u)
                .map(Value::Url)
                .map_err(|e| RtError::Eval(format!("bad url '{u}': {e}"))),
            NodeKind::HostLit(h) => HttpHost::parse(h)
                .map(Value::Host)
                .map_err(|e| RtError::Eval(format!("bad host '{h}': {e}"))),
            NodeKind::UrlPattern(p) | NodeKind::HostPattern(p) => Err(RtError::Eval(format!(
                "pattern '{p}' is only meaningful in a require block"
            ))),
            NodeKind::Ident(name) | NodeKind::Variable(name) | NodeKind::AtHost(name) => {
                lookup(name, state, locals)
                    .ok_or_else(|| RtError::Eval(format!("'{name}' is not defined")))
            }
            NodeKind::GlobalVar(name) => state
                .get(name)
                .ok_or_else(|| RtError::Eval(format!("global '{name}' is not defined"))),
            NodeKind::PatternIdent(name) => Err(RtError::Eval(format!(
                "pattern identifier '%{name}' is not supported by the surface evaluator"
            ))),
            NodeKind::Invalid => Err(RtError::Eval("invalid syntax".into())),
            NodeKind::KeywordCtrl(kw) => Err(RtError::Eval(format!(
                "control construct {kw:?} requires the full engine"
            ))),
            NodeKind::KeywordDecl(kw) => Err(RtError::Eval(format!(
                "declaration {kw:?} requires the full engine"
            ))),
            NodeKind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(eval_node(item, state, locals, ctx).await?);
                }
                Ok(Value::list(out))
            }
            NodeKind::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    let value = eval_node(&field.value, state, locals, ctx).await?;
                    out.push((field.name.clone(), value));
                }
                Ok(Value::object(out))
            }
            NodeKind::Assign { name, value, .. } => {
                let value = eval_node(value, state, locals, ctx).await?;
                state.set(name.clone(), value.clone());
                Ok(value)
            }
            NodeKind::FnLit { params, body } => Ok(Value::Func(Arc::new(FuncValue {
                name: "fn".to_string(),
                kind: FuncKind::Script {
                    params: params.clone(),
                    body: (**body).clone(),
                },
            }))),
            NodeKind::Member {
                base,
                segments,
                terminated,
            } => {
                if !terminated {
                    return Err(RtError::Eval("incomplete member expression".into()));
                }
                let mut value = eval_node(base, state, locals, ctx).await?;
                for seg in segments {
                    value = value.memb(&seg.name).ok_or_else(|| {
                        RtError::Eval(format!(
                            "{} has no member '{}'",
                            value.type_name(),
                            seg.name
                        ))
                    })?;
                }
                Ok(value)
            }
            NodeKind::Call { callee, args } => {
                let func = eval_node(callee, state, locals, ctx).await?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(eval_node(arg, state, locals, ctx).await?);
                }
                match func {
                    Value::Func(func) => call_func(&func, state, locals, ctx, arg_values).await,
                    other => Err(RtError::Eval(format!(
                        "{} is not callable",
                        other.type_name()
                    ))),
                }
            }
        }
    })
}

async fn call_func(
    func: &FuncValue,
    state: &mut State,
    locals: &mut Locals,
    ctx: &Context,
    args: Vec<Value>,
) -> Result<Value, RtError> {
    match &func.kind {
        FuncKind::Native(verb) => verb.call(ctx, args).await,
        FuncKind::Script { params, body } => {
            if params.len() != args.len() {
                return Err(RtError::Eval(format!(
                    "{} expects {} argument(s), got {}",
                    func.name,
                    params.len(),
                    args.len()
                )));
            }
            let scope: BTreeMap<String, Value> =
                params.iter().cloned().zip(args).collect();
            locals.push(scope);
            let result = eval_node(body, state, locals, ctx).await;
            locals.pop();
            result
        }
    }
}
