//! Subprocess verb.
//!
//! `ex(name, subcommand*, arg*)`: identifier-shaped strings at the head of
//! the argument list form the sub-command chain the capability is checked
//! against; the remaining simple scalars become argv. The child runs in
//! its own session so cancellation kills the whole process group.

use tokio::process::Command;

use tern_engine::{Value, Verb, VerbFut};
use tern_runtime::{Context, Permission, RtError};

/// `true` for strings that read as bare identifiers (`remote`, `show`).
fn is_identifier_like(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn scalar_to_argv(value: &Value) -> Result<String, RtError> {
    if !value.is_simple_scalar() {
        return Err(RtError::invalid_args(format!(
            "{} cannot be passed to a subprocess",
            value.type_name()
        )));
    }
    Ok(match value {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Put the child in its own session so the entire process group dies with
/// it when the command is cancelled.
#[cfg(unix)]
fn set_new_session(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_new_session(_cmd: &mut Command) {}

pub async fn ex(
    ctx: &Context,
    name: &str,
    chain: &[String],
    argv: &[String],
) -> Result<String, RtError> {
    ctx.check(&Permission::Command {
        name: name.to_string(),
        subcommand_chain: chain.to_vec(),
    })?;

    let mut cmd = Command::new(name);
    cmd.args(chain)
        .args(argv)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    set_new_session(&mut cmd);

    tracing::debug!(command = name, ?chain, ?argv, "ex");
    let child = cmd.spawn()?;
    let output = tokio::select! {
        () = ctx.cancel_token().cancelled() => return Err(RtError::Cancelled),
        out = child.wait_with_output() => out?,
    };
    if !output.status.success() {
        return Err(RtError::Eval(format!(
            "'{name}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub struct ExVerb;

impl Verb for ExVerb {
    fn name(&self) -> &'static str {
        "ex"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let mut iter = args.into_iter();
            let name = match iter.next() {
                Some(Value::Str(s)) if is_identifier_like(&s) => s,
                Some(other) => {
                    return Err(RtError::invalid_args(format!(
                        "ex expects a command name, got {}",
                        other.type_name()
                    )));
                }
                None => return Err(RtError::invalid_args("ex expects a command name")),
            };
            let mut chain = Vec::new();
            let mut argv = Vec::new();
            for value in iter {
                let in_chain = argv.is_empty()
                    && matches!(&value, Value::Str(s) if is_identifier_like(s));
                if in_chain {
                    if let Value::Str(s) = value {
                        chain.push(s);
                    }
                } else {
                    argv.push(scalar_to_argv(&value)?);
                }
            }
            let stdout = ex(ctx, &name, &chain, &argv).await?;
            Ok(Value::Str(stdout))
        })
    }
}

/// Global installed for each `aliased-commands` entry: calling `git(x)` is
/// `ex("git", x)`.
pub struct AliasVerb {
    name: String,
}

impl AliasVerb {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

impl Verb for AliasVerb {
    fn name(&self) -> &str {
        &self.name
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(Value::Str(self.name.clone()));
            full.extend(args);
            ExVerb.call(ctx, full).await
        })
    }
}
