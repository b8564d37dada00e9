//! Generic resource verbs.
//!
//! `read` / `create` / `update` / `delete` dispatch on the entity
//! argument: a URL routes to the HTTP client, a path to the filesystem
//! verbs. The capability checked is whichever the target verb checks.

use reqwest::Method;

use tern_engine::{Value, Verb, VerbFut};
use tern_runtime::{ActionKind, Context, RtError};

use crate::{fs, http, set_once, take_required};

fn has_url(args: &[Value]) -> bool {
    args.iter().any(|a| matches!(a, Value::Url(_)))
}

fn path_and_optional_content(args: Vec<Value>) -> Result<(tern_types::Pth, Vec<u8>), RtError> {
    let mut path = None;
    let mut content: Option<Vec<u8>> = None;
    for arg in args {
        match arg {
            Value::Path(p) => set_once(&mut path, p, "path")?,
            Value::Str(s) => set_once(&mut content, s.into_bytes(), "content")?,
            Value::Bytes(b) => set_once(&mut content, b.as_ref().clone(), "content")?,
            other => {
                return Err(RtError::invalid_args(format!(
                    "unexpected {} argument",
                    other.type_name()
                )));
            }
        }
    }
    Ok((take_required(path, "path")?, content.unwrap_or_default()))
}

pub struct ResourceReadVerb;

impl Verb for ResourceReadVerb {
    fn name(&self) -> &'static str {
        "read"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            if has_url(&args) {
                return http::request(ctx, ActionKind::Read, Method::GET, args).await;
            }
            let mut path = None;
            for arg in args {
                match arg {
                    Value::Path(p) => set_once(&mut path, p, "path")?,
                    other => {
                        return Err(RtError::invalid_args(format!(
                            "unexpected {} argument",
                            other.type_name()
                        )));
                    }
                }
            }
            fs::read(ctx, &take_required(path, "path")?).await
        })
    }
}

pub struct ResourceCreateVerb;

impl Verb for ResourceCreateVerb {
    fn name(&self) -> &'static str {
        "create"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            if has_url(&args) {
                return http::request(ctx, ActionKind::Create, Method::POST, args).await;
            }
            let (path, content) = path_and_optional_content(args)?;
            if path.is_dir() {
                fs::mkdir(ctx, &path).await?;
            } else {
                fs::mkfile(ctx, &path, &content).await?;
            }
            Ok(Value::Nil)
        })
    }
}

pub struct ResourceUpdateVerb;

impl Verb for ResourceUpdateVerb {
    fn name(&self) -> &'static str {
        "update"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            if has_url(&args) {
                return http::request(ctx, ActionKind::Update, Method::PATCH, args).await;
            }
            let (path, content) = path_and_optional_content(args)?;
            fs::append(ctx, &path, &content).await?;
            Ok(Value::Nil)
        })
    }
}

pub struct ResourceDeleteVerb;

impl Verb for ResourceDeleteVerb {
    fn name(&self) -> &'static str {
        "delete"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            if has_url(&args) {
                return http::request(ctx, ActionKind::Delete, Method::DELETE, args).await;
            }
            let mut path = None;
            for arg in args {
                match arg {
                    Value::Path(p) => set_once(&mut path, p, "path")?,
                    other => {
                        return Err(RtError::invalid_args(format!(
                            "unexpected {} argument",
                            other.type_name()
                        )));
                    }
                }
            }
            fs::del(ctx, &take_required(path, "path")?).await?;
            Ok(Value::Nil)
        })
    }
}
