//! Effect verbs.
//!
//! Every verb follows the same shape: parse arguments (each logical slot
//! at most once), resolve the entity, prove the capability against the
//! [`Context`], reserve limit tokens, and only then perform the effect.
//! [`install`] wires the whole table into a script [`State`].

pub mod ex;
pub mod fs;
pub mod http;
pub mod kv;
pub mod resource;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use tern_engine::{ScriptEngine, State, Value};
use tern_runtime::RtError;

/// Fill a logical argument slot, rejecting duplicates.
pub(crate) fn set_once<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<(), RtError> {
    if slot.is_some() {
        return Err(RtError::duplicate_arg(name));
    }
    *slot = Some(value);
    Ok(())
}

pub(crate) fn take_required<T>(slot: Option<T>, name: &str) -> Result<T, RtError> {
    slot.ok_or_else(|| RtError::invalid_args(format!("missing required argument '{name}'")))
}

/// Install the verb table into a global scope.
///
/// `tls_dir` is where the `serve` harness keeps its certificate pair;
/// production use passes the process cwd.
pub fn install(state: &mut State, engine: Arc<dyn ScriptEngine>, tls_dir: PathBuf) {
    state.set(
        "fs",
        Value::object([
            ("mkfile".into(), Value::native(Arc::new(fs::MkfileVerb))),
            ("mkdir".into(), Value::native(Arc::new(fs::MkdirVerb))),
            ("read".into(), Value::native(Arc::new(fs::ReadVerb))),
            ("ls".into(), Value::native(Arc::new(fs::LsVerb))),
            ("del".into(), Value::native(Arc::new(fs::DelVerb))),
            ("append".into(), Value::native(Arc::new(fs::AppendVerb))),
        ]),
    );
    state.set(
        "http",
        Value::object([
            ("get".into(), Value::native(Arc::new(http::GetVerb))),
            ("post".into(), Value::native(Arc::new(http::PostVerb))),
            ("patch".into(), Value::native(Arc::new(http::PatchVerb))),
            ("delete".into(), Value::native(Arc::new(http::DeleteVerb))),
            (
                "serve".into(),
                Value::native(Arc::new(serve::ServeVerb::new(
                    Arc::clone(&engine),
                    tls_dir.clone(),
                ))),
            ),
            (
                "servedir".into(),
                Value::native(Arc::new(serve::ServedirVerb::new(tls_dir))),
            ),
        ]),
    );
    state.set("ex", Value::native(Arc::new(ex::ExVerb)));
    state.set(
        "kv",
        Value::object([("open".into(), Value::native(Arc::new(kv::KvOpenVerb)))]),
    );
    state.set("read", Value::native(Arc::new(resource::ResourceReadVerb)));
    state.set(
        "create",
        Value::native(Arc::new(resource::ResourceCreateVerb)),
    );
    state.set(
        "update",
        Value::native(Arc::new(resource::ResourceUpdateVerb)),
    );
    state.set(
        "delete",
        Value::native(Arc::new(resource::ResourceDeleteVerb)),
    );
}
