//! Script-level integration: the verb table driven through the engine.

use std::sync::Arc;

use tern_engine::{ScriptEngine, State, SurfaceEngine, Value};
use tern_runtime::{ActionKind, Context, Limit, LimitKind, Limiter, Permission, RtError};
use tern_types::Pth;

fn ctx_for(dir: &std::path::Path, limits: Vec<Limit>) -> Context {
    let root = Pth::new(format!("{}/", dir.display()));
    Context::new(
        vec![
            Permission::fs_path(ActionKind::Read, root.clone()),
            Permission::fs_path(ActionKind::Create, root.clone()),
            Permission::fs_path(ActionKind::Update, root.clone()),
            Permission::fs_path(ActionKind::Delete, root),
        ],
        Limiter::new(limits),
    )
}

fn fresh_state(engine: &Arc<dyn ScriptEngine>, dir: &std::path::Path) -> State {
    let mut state = State::new();
    tern_verbs::install(&mut state, Arc::clone(engine), dir.to_path_buf());
    state
}

async fn eval(
    engine: &Arc<dyn ScriptEngine>,
    state: &mut State,
    ctx: &Context,
    src: &str,
) -> Result<Value, RtError> {
    let module = engine.parse(src, "test.tn")?;
    engine.check(&module)?;
    engine.eval(&module, state, ctx).await
}

#[tokio::test]
async fn script_writes_and_reads_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let ctx = ctx_for(dir.path(), vec![]);
    let mut state = fresh_state(&engine, dir.path());

    let base = dir.path().display();
    eval(
        &engine,
        &mut state,
        &ctx,
        &format!("fs.mkfile({base}/greeting.txt, \"hello world\")"),
    )
    .await
    .unwrap();

    let out = eval(
        &engine,
        &mut state,
        &ctx,
        &format!("fs.read({base}/greeting.txt)"),
    )
    .await
    .unwrap();
    assert_eq!(out, Value::Str("hello world".into()));

    // The generic resource verb reaches the same file.
    let out = eval(
        &engine,
        &mut state,
        &ctx,
        &format!("read({base}/greeting.txt)"),
    )
    .await
    .unwrap();
    assert_eq!(out, Value::Str("hello world".into()));
}

#[tokio::test]
async fn script_drives_the_kv_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let ctx = ctx_for(dir.path(), vec![]);
    let mut state = fresh_state(&engine, dir.path());

    let base = dir.path().display();
    eval(
        &engine,
        &mut state,
        &ctx,
        &format!("store = kv.open({base}/db.json)"),
    )
    .await
    .unwrap();
    eval(&engine, &mut state, &ctx, "store.set(\"count\", 41)")
        .await
        .unwrap();
    let has = eval(&engine, &mut state, &ctx, "store.has(\"count\")")
        .await
        .unwrap();
    assert_eq!(has, Value::Bool(true));
    let got = eval(&engine, &mut state, &ctx, "store.get(\"count\")")
        .await
        .unwrap();
    assert_eq!(got, Value::Int(41));
    eval(&engine, &mut state, &ctx, "store.close()")
        .await
        .unwrap();

    // The backing file round-trips through a reopen.
    let mut state2 = fresh_state(&engine, dir.path());
    eval(
        &engine,
        &mut state2,
        &ctx,
        &format!("store = kv.open({base}/db.json)"),
    )
    .await
    .unwrap();
    let got = eval(&engine, &mut state2, &ctx, "store.get(\"count\")")
        .await
        .unwrap();
    assert_eq!(got, Value::Int(41));
    eval(&engine, &mut state2, &ctx, "store.close()")
        .await
        .unwrap();
}

#[tokio::test]
async fn permission_denials_surface_as_script_errors() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let ctx = Context::new(Vec::new(), Limiter::default());
    let mut state = fresh_state(&engine, dir.path());

    let err = eval(&engine, &mut state, &ctx, "fs.read(/etc/hostname)")
        .await
        .unwrap_err();
    assert!(matches!(err, RtError::PermissionDenied { .. }));
}

#[tokio::test]
async fn new_file_quota_applies_across_verbs() {
    let dir = tempfile::tempdir().unwrap();
    let engine: Arc<dyn ScriptEngine> = Arc::new(SurfaceEngine::new());
    let ctx = ctx_for(
        dir.path(),
        vec![Limit::new("fs/total-new-file", LimitKind::Total, 2)],
    );
    let mut state = fresh_state(&engine, dir.path());

    let base = dir.path().display();
    eval(&engine, &mut state, &ctx, &format!("fs.mkfile({base}/a, \"1\")"))
        .await
        .unwrap();
    eval(
        &engine,
        &mut state,
        &ctx,
        &format!("create({base}/b, \"2\")"),
    )
    .await
    .unwrap();
    let err = eval(&engine, &mut state, &ctx, &format!("fs.mkfile({base}/c, \"3\")"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RtError::Limit(tern_runtime::LimitError::QuotaExhausted { .. })
    ));
}
