//! TLS server harness: `serve` and `servedir`.
//!
//! Both require a `Provide` capability on the bound host. The self-signed
//! certificate pair lives next to the process (`localhost.cert` /
//! `localhost.key`); it is generated on first use and reused afterwards.
//! If only one half of the pair exists, both are regenerated, which also
//! makes concurrent first uses idempotent: the loser of the race simply
//! rewrites the same files.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::lookup_host;

use tern_engine::{FuncValue, ObjectRef, ScriptEngine, State, Value, Verb, VerbFut};
use tern_runtime::{ActionKind, Context, HttpEntity, Permission, RtError};
use tern_types::{HttpHost, Pth};

use crate::{fs, set_once, take_required};

pub const CERT_FILE: &str = "localhost.cert";
pub const KEY_FILE: &str = "localhost.key";

/// Connection read deadline (headers + body).
pub const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(8);
/// Handler + write deadline per request.
pub const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(12);
/// Requests with more header bytes than this are answered 431.
pub const MAX_HEADER_BYTES: usize = 4 * 1024;

/// Create or reuse the on-disk certificate pair, returning (cert, key).
pub fn ensure_cert_pair(dir: &Path) -> Result<(PathBuf, PathBuf), RtError> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }
    let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| RtError::Eval(format!("certificate generation failed: {e}")))?;
    std::fs::write(&cert_path, certified.cert.pem())?;
    std::fs::write(&key_path, certified.key_pair.serialize_pem())?;
    tracing::info!(cert = %cert_path.display(), "generated self-signed certificate pair");
    Ok((cert_path, key_path))
}

/// Running server; dropping the handle leaves the server running, tied to
/// its context's cancellation signal.
#[derive(Debug)]
pub struct ServerHandle {
    handle: axum_server::Handle,
}

impl ServerHandle {
    /// Address actually bound (resolves port 0 binds).
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

struct ServeShared {
    engine: Arc<dyn ScriptEngine>,
    handler: Arc<FuncValue>,
    globals: Vec<(String, Value)>,
    ctx: Context,
}

fn header_bytes(req: &axum::extract::Request) -> usize {
    req.headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum()
}

fn request_record(req: &axum::extract::Request, body: &str) -> Value {
    let headers = Value::object(req.headers().iter().map(|(name, value)| {
        (
            name.as_str().to_string(),
            Value::Str(value.to_str().unwrap_or_default().to_string()),
        )
    }));
    Value::object([
        ("method".into(), Value::Str(req.method().to_string())),
        ("path".into(), Value::Str(req.uri().path().to_string())),
        ("headers".into(), headers),
        ("body".into(), Value::Str(body.to_string())),
    ])
}

fn fresh_response_record() -> Value {
    Value::object([
        ("status".into(), Value::Int(200)),
        ("headers".into(), Value::object([])),
        ("body".into(), Value::Str(String::new())),
    ])
}

/// Render the script's view of the response into an HTTP response.
///
/// The handler may mutate the shared response record, or return a value:
/// a returned record replaces the response record wholesale, any other
/// non-blank value becomes the body.
fn render_response(response: &Value, returned: &Value) -> Response {
    let effective = match returned {
        Value::Object(_) => returned,
        _ => response,
    };
    let status = match effective.memb("status") {
        Some(Value::Int(code)) => {
            StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::OK,
    };
    let body = match returned {
        Value::Str(s) => s.clone(),
        Value::Object(_) | Value::Nil => match effective.memb("body") {
            Some(Value::Str(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        },
        other if !other.is_blank() => other.to_string(),
        _ => String::new(),
    };
    let mut builder = Response::builder().status(status);
    if let Some(Value::Object(headers)) = effective.memb("headers")
        && let Ok(headers) = headers.read()
    {
        for (name, value) in headers.iter() {
            if let Value::Str(v) = value {
                builder = builder.header(name.as_str(), v.as_str());
            }
        }
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_request(shared: Arc<ServeShared>, req: axum::extract::Request) -> Response {
    if header_bytes(&req) > MAX_HEADER_BYTES {
        return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into_response();
    }
    let (parts, body) = req.into_parts();
    let body = match tokio::time::timeout(READ_TIMEOUT, axum::body::to_bytes(body, usize::MAX)).await
    {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => return StatusCode::BAD_REQUEST.into_response(),
        Err(_) => return StatusCode::REQUEST_TIMEOUT.into_response(),
    };
    let req = axum::extract::Request::from_parts(parts, Body::empty());

    // Fresh evaluator state per request; the enumerated globals are shared
    // by reference, so handler writes are visible across requests.
    let mut state = State::new();
    for (name, value) in &shared.globals {
        state.set(name.clone(), value.clone());
    }
    let request = request_record(&req, &body);
    let response = fresh_response_record();

    let call = shared.engine.call(
        shared.handler.as_ref(),
        &mut state,
        &shared.ctx,
        vec![response.clone(), request],
    );
    match tokio::time::timeout(WRITE_TIMEOUT, call).await {
        Ok(Ok(returned)) => render_response(&response, &returned),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "handler failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

async fn bind(
    ctx: &Context,
    host: &HttpHost,
    tls_dir: &Path,
    app: Router,
) -> Result<ServerHandle, RtError> {
    ctx.check(&Permission::Http {
        kind: ActionKind::Provide,
        entity: HttpEntity::Host(host.clone()),
    })?;

    // Both reqwest (ring) and axum-server (aws-lc-rs) link rustls; pin the
    // process-wide provider before the first TLS config is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert, key) = ensure_cert_pair(tls_dir)?;
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| RtError::Eval(format!("tls config failed: {e}")))?;

    let addr = lookup_host(host.authority())
        .await?
        .next()
        .ok_or_else(|| RtError::invalid_args(format!("cannot resolve host '{host}'")))?;

    let handle = axum_server::Handle::new();
    let server = axum_server::bind_rustls(addr, tls).handle(handle.clone());
    let ctx_watch = ctx.clone();
    let stop = handle.clone();
    tokio::spawn(async move {
        ctx_watch.cancel_token().cancelled().await;
        stop.shutdown();
    });
    tokio::spawn(async move {
        if let Err(e) = server.serve(app.into_make_service()).await {
            tracing::error!(error = %e, "server terminated");
        }
    });
    tracing::info!(%host, "serving");
    Ok(ServerHandle { handle })
}

/// Run a script handler behind TLS on `host`.
pub async fn serve(
    ctx: &Context,
    engine: Arc<dyn ScriptEngine>,
    host: &HttpHost,
    handler: Arc<FuncValue>,
    shared_globals: Option<ObjectRef>,
    tls_dir: &Path,
) -> Result<ServerHandle, RtError> {
    let globals = match shared_globals {
        Some(map) => map
            .read()
            .map_err(|_| RtError::Eval("poisoned object lock".into()))?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => Vec::new(),
    };
    let shared = Arc::new(ServeShared {
        engine,
        handler,
        globals,
        ctx: ctx.child(),
    });
    let app = Router::new().fallback(move |req: axum::extract::Request| {
        let shared = Arc::clone(&shared);
        async move { handle_request(shared, req).await }
    });
    bind(ctx, host, tls_dir, app).await
}

/// Serve a directory of static files through the rate-limited `read` verb.
pub async fn servedir(
    ctx: &Context,
    host: &HttpHost,
    dir: &Pth,
    tls_dir: &Path,
) -> Result<ServerHandle, RtError> {
    if !dir.is_dir() {
        return Err(RtError::invalid_args(format!(
            "servedir takes a directory path, got '{dir}'"
        )));
    }
    let root = dir.to_abs(&ctx.cwd());
    let file_ctx = ctx.child();
    let app = Router::new().fallback(move |req: axum::extract::Request| {
        let root = root.clone();
        let ctx = file_ctx.clone();
        async move {
            if header_bytes(&req) > MAX_HEADER_BYTES {
                return StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.into_response();
            }
            let rel = req.uri().path().trim_start_matches('/');
            let target = if rel.is_empty() { "index.html" } else { rel };
            let path = root.join(target);
            match fs::read_bytes(&ctx, &path).await {
                Ok(bytes) => {
                    let mime = mime_for(target);
                    ([(axum::http::header::CONTENT_TYPE, mime)], bytes).into_response()
                }
                Err(RtError::PermissionDenied { .. }) => StatusCode::FORBIDDEN.into_response(),
                Err(_) => StatusCode::NOT_FOUND.into_response(),
            }
        }
    });
    bind(ctx, host, tls_dir, app).await
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

// --- script-facing adapters ---------------------------------------------

pub struct ServeVerb {
    engine: Arc<dyn ScriptEngine>,
    tls_dir: PathBuf,
}

impl ServeVerb {
    #[must_use]
    pub fn new(engine: Arc<dyn ScriptEngine>, tls_dir: PathBuf) -> Self {
        Self { engine, tls_dir }
    }
}

impl Verb for ServeVerb {
    fn name(&self) -> &'static str {
        "serve"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let mut host = None;
            let mut handler = None;
            let mut globals: Option<ObjectRef> = None;
            for arg in args {
                match arg {
                    Value::Host(h) => set_once(&mut host, h, "host")?,
                    Value::Func(f) => set_once(&mut handler, f, "handler")?,
                    Value::Object(map) => set_once(&mut globals, map, "globals")?,
                    other => {
                        return Err(RtError::invalid_args(format!(
                            "unexpected {} argument",
                            other.type_name()
                        )));
                    }
                }
            }
            let host = take_required(host, "host")?;
            let handler = take_required(handler, "handler")?;
            serve(
                ctx,
                Arc::clone(&self.engine),
                &host,
                handler,
                globals,
                &self.tls_dir,
            )
            .await?;
            Ok(Value::object([("host".into(), Value::Host(host))]))
        })
    }
}

pub struct ServedirVerb {
    tls_dir: PathBuf,
}

impl ServedirVerb {
    #[must_use]
    pub fn new(tls_dir: PathBuf) -> Self {
        Self { tls_dir }
    }
}

impl Verb for ServedirVerb {
    fn name(&self) -> &'static str {
        "servedir"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let mut host = None;
            let mut dir = None;
            for arg in args {
                match arg {
                    Value::Host(h) => set_once(&mut host, h, "host")?,
                    Value::Path(p) => set_once(&mut dir, p, "dir")?,
                    other => {
                        return Err(RtError::invalid_args(format!(
                            "unexpected {} argument",
                            other.type_name()
                        )));
                    }
                }
            }
            let host = take_required(host, "host")?;
            let dir = take_required(dir, "dir")?;
            servedir(ctx, &host, &dir, &self.tls_dir).await?;
            Ok(Value::object([("host".into(), Value::Host(host))]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_cert_pair, serve, servedir};
    use std::sync::Arc;
    use tern_engine::{FuncValue, ScriptEngine, State, SurfaceEngine, Value};
    use tern_runtime::{ActionKind, Context, HttpEntity, Limiter, Permission, RtError};
    use tern_types::{HttpHost, Pth};

    fn provide_ctx(host: &HttpHost) -> Context {
        Context::new(
            vec![
                Permission::Http {
                    kind: ActionKind::Provide,
                    entity: HttpEntity::Host(host.clone()),
                },
                Permission::fs_path(ActionKind::Read, "/"),
            ],
            Limiter::default(),
        )
    }

    async fn script_handler(src: &str) -> Arc<FuncValue> {
        let engine = SurfaceEngine::new();
        let module = engine.parse(src, "handler.tn").unwrap();
        let mut state = State::new();
        let ctx = Context::new(Vec::new(), Limiter::default());
        match engine.eval(&module, &mut state, &ctx).await.unwrap() {
            Value::Func(f) => f,
            other => panic!("expected function, got {other:?}"),
        }
    }

    fn insecure_client() -> reqwest::Client {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
    }

    #[test]
    fn cert_pair_is_created_once_and_regenerated_together() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = ensure_cert_pair(dir.path()).unwrap();
        assert!(cert.exists() && key.exists());
        let first = std::fs::read(&cert).unwrap();

        // Both present: reused verbatim.
        ensure_cert_pair(dir.path()).unwrap();
        assert_eq!(std::fs::read(&cert).unwrap(), first);

        // Half the pair missing: both regenerated.
        std::fs::remove_file(&key).unwrap();
        ensure_cert_pair(dir.path()).unwrap();
        assert!(key.exists());
        assert_ne!(std::fs::read(&cert).unwrap(), first);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serve_runs_the_handler_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let host = HttpHost::parse("https://127.0.0.1:0").unwrap();
        let ctx = provide_ctx(&host);
        let handler = script_handler("fn(res, req) \"hello from handler\"").await;

        let server = serve(
            &ctx,
            Arc::new(SurfaceEngine::new()),
            &host,
            handler,
            None,
            dir.path(),
        )
        .await
        .unwrap();
        let addr = server.bound_addr().await.unwrap();

        let body = insecure_client()
            .get(format!("https://127.0.0.1:{}/x", addr.port()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hello from handler");
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serve_requires_provide_permission() {
        let dir = tempfile::tempdir().unwrap();
        let host = HttpHost::parse("https://127.0.0.1:0").unwrap();
        let ctx = Context::new(Vec::new(), Limiter::default());
        let handler = script_handler("fn(res, req) \"x\"").await;
        let err = serve(
            &ctx,
            Arc::new(SurfaceEngine::new()),
            &host,
            handler,
            None,
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RtError::PermissionDenied { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn servedir_serves_files_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.json"), b"{\"ok\":true}").unwrap();
        let host = HttpHost::parse("https://127.0.0.1:0").unwrap();
        let ctx = provide_ctx(&host);

        let server = servedir(
            &ctx,
            &host,
            &Pth::new(format!("{}/", dir.path().display())),
            dir.path(),
        )
        .await
        .unwrap();
        let addr = server.bound_addr().await.unwrap();

        let resp = insecure_client()
            .get(format!("https://127.0.0.1:{}/hello.json", addr.port()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(resp.text().await.unwrap(), "{\"ok\":true}");

        let missing = insecure_client()
            .get(format!("https://127.0.0.1:{}/nope.txt", addr.port()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        server.shutdown();
    }
}
