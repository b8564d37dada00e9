//! HTTP client verbs.
//!
//! `get`/`post`/`patch`/`delete` accept, in any order: a URL, an optional
//! mime type, an optional body (string, bytes, list-to-JSON or
//! object-to-JSON) and at most one options record (`{ timeout: seconds }`).
//! Filling any slot twice is a typed error. Every request proves the
//! matching HTTP capability and reserves one `http/request` token before
//! the socket is touched.

use std::time::Duration;

use reqwest::Method;
use url::Url;

use tern_engine::{ObjectRef, Value, Verb, VerbFut};
use tern_runtime::{ActionKind, Context, HttpEntity, HttpError, Permission, RtError};

use crate::{set_once, take_required};

pub const HTTP_REQUEST: &str = "http/request";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Body {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

#[derive(Debug, Default)]
struct RequestArgs {
    url: Option<Url>,
    mime: Option<String>,
    body: Option<Body>,
    options: Option<Duration>,
}

/// `type/subtype` with no whitespace reads as a mime type, anything else
/// as a body string.
fn looks_like_mime(s: &str) -> bool {
    match s.split_once('/') {
        Some((ty, sub)) => {
            !ty.is_empty()
                && !sub.is_empty()
                && !sub.contains('/')
                && s.chars().all(|c| !c.is_whitespace())
        }
        None => false,
    }
}

fn options_timeout(record: &ObjectRef) -> Result<Duration, RtError> {
    let map = record
        .read()
        .map_err(|_| RtError::Eval("poisoned object lock".into()))?;
    for key in map.keys() {
        if key != "timeout" {
            return Err(RtError::invalid_args(format!(
                "unknown option '{key}' (expected 'timeout')"
            )));
        }
    }
    match map.get("timeout") {
        None => Ok(DEFAULT_TIMEOUT),
        Some(Value::Int(secs)) if *secs > 0 => Ok(Duration::from_secs(*secs as u64)),
        Some(Value::Float(secs)) if *secs > 0.0 => Ok(Duration::from_secs_f64(*secs)),
        Some(other) => Err(RtError::invalid_args(format!(
            "timeout must be a positive number, got {}",
            other.type_name()
        ))),
    }
}

/// An object is the options record when its keys fit the option schema;
/// any other object is a JSON body.
fn is_options_record(record: &ObjectRef) -> bool {
    record
        .read()
        .map(|m| m.keys().all(|k| k == "timeout"))
        .unwrap_or(false)
}

fn parse_request_args(args: Vec<Value>) -> Result<RequestArgs, RtError> {
    let mut parsed = RequestArgs::default();
    for arg in args {
        match arg {
            Value::Url(u) => set_once(&mut parsed.url, u, "url")?,
            Value::Str(s) => {
                if parsed.mime.is_none() && looks_like_mime(&s) {
                    parsed.mime = Some(s);
                } else {
                    set_once(&mut parsed.body, Body::Text(s), "body")?;
                }
            }
            Value::Bytes(b) => set_once(&mut parsed.body, Body::Bytes(b.as_ref().clone()), "body")?,
            Value::List(_) => {
                let json = arg.to_json()?;
                set_once(&mut parsed.body, Body::Json(json), "body")?;
            }
            Value::Object(ref record) => {
                if is_options_record(record) {
                    let timeout = options_timeout(record)?;
                    set_once(&mut parsed.options, timeout, "options")?;
                } else {
                    let json = arg.to_json()?;
                    set_once(&mut parsed.body, Body::Json(json), "body")?;
                }
            }
            other => {
                return Err(RtError::invalid_args(format!(
                    "unexpected {} argument",
                    other.type_name()
                )));
            }
        }
    }
    Ok(parsed)
}

fn headers_record(headers: &reqwest::header::HeaderMap) -> Value {
    Value::object(headers.iter().map(|(name, value)| {
        (
            name.as_str().to_string(),
            Value::Str(value.to_str().unwrap_or_default().to_string()),
        )
    }))
}

pub(crate) async fn request(
    ctx: &Context,
    kind: ActionKind,
    method: Method,
    args: Vec<Value>,
) -> Result<Value, RtError> {
    let parsed = parse_request_args(args)?;
    let url = take_required(parsed.url, "url")?;
    let timeout = parsed.options.unwrap_or(DEFAULT_TIMEOUT);

    ctx.check(&Permission::Http {
        kind,
        entity: HttpEntity::Url(url.clone()),
    })?;
    ctx.take(HTTP_REQUEST, 1).await?;

    // Served endpoints use the self-signed localhost pair, so certificate
    // verification is off for the embedded client.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .map_err(|e| HttpError::Request(e.to_string()))?;

    let mut req = client.request(method.clone(), url.clone());
    if let Some(mime) = &parsed.mime {
        req = req.header(reqwest::header::CONTENT_TYPE, mime);
    }
    req = match parsed.body {
        None => req,
        Some(Body::Text(s)) => req.body(s),
        Some(Body::Bytes(b)) => req.body(b),
        Some(Body::Json(json)) => req.json(&json),
    };

    tracing::debug!(%method, %url, "http request");
    let resp = req.send().await.map_err(|e| classify(e, timeout))?;
    let status = resp.status().as_u16();
    let headers = headers_record(resp.headers());
    let bytes = resp
        .bytes()
        .await
        .map_err(|_| HttpError::Response { status })?;
    let body = match std::str::from_utf8(&bytes) {
        Ok(text) => Value::Str(text.to_string()),
        Err(_) => Value::Bytes(std::sync::Arc::new(bytes.to_vec())),
    };
    Ok(Value::object([
        ("url".into(), Value::Url(url)),
        ("status".into(), Value::Int(i64::from(status))),
        ("headers".into(), headers),
        ("body".into(), body),
    ]))
}

fn classify(err: reqwest::Error, timeout: Duration) -> RtError {
    if err.is_timeout() {
        HttpError::Timeout(timeout).into()
    } else {
        HttpError::Request(err.to_string()).into()
    }
}

macro_rules! http_verb {
    ($verb:ident, $name:literal, $kind:expr, $method:expr) => {
        pub struct $verb;

        impl Verb for $verb {
            fn name(&self) -> &'static str {
                $name
            }
            fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
                Box::pin(request(ctx, $kind, $method, args))
            }
        }
    };
}

http_verb!(GetVerb, "get", ActionKind::Read, Method::GET);
http_verb!(PostVerb, "post", ActionKind::Create, Method::POST);
http_verb!(PatchVerb, "patch", ActionKind::Update, Method::PATCH);
http_verb!(DeleteVerb, "delete", ActionKind::Delete, Method::DELETE);

#[cfg(test)]
mod tests {
    use super::{looks_like_mime, parse_request_args, GetVerb, PostVerb, HTTP_REQUEST};
    use std::time::Duration;
    use tern_engine::{Value, Verb};
    use tern_runtime::{ActionKind, Context, Limit, LimitKind, Limiter, Permission, RtError};
    use url::Url;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx_for(server_url: &str) -> Context {
        let url = Url::parse(server_url).unwrap();
        Context::new(
            vec![
                Permission::http_url(ActionKind::Read, url.clone()),
                Permission::http_url(ActionKind::Create, url),
            ],
            Limiter::default(),
        )
    }

    #[test]
    fn mime_detection() {
        assert!(looks_like_mime("application/json"));
        assert!(looks_like_mime("text/plain"));
        assert!(!looks_like_mime("hello world"));
        assert!(!looks_like_mime("a/b/c"));
        assert!(!looks_like_mime("no slash"));
    }

    #[test]
    fn duplicate_slots_are_rejected() {
        let url = Value::Url(Url::parse("https://e.com/a").unwrap());
        let err = parse_request_args(vec![url.clone(), url]).unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));

        let two_bodies = vec![
            Value::Str("body one".into()),
            Value::Str("body two".into()),
        ];
        let err = parse_request_args(two_bodies).unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));

        let two_options = vec![
            Value::object([("timeout".into(), Value::Int(1))]),
            Value::object([("timeout".into(), Value::Int(2))]),
        ];
        let err = parse_request_args(two_options).unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));
    }

    #[test]
    fn object_body_is_not_mistaken_for_options() {
        let args = vec![Value::object([("payload".into(), Value::Int(1))])];
        let parsed = parse_request_args(args).unwrap();
        assert!(parsed.body.is_some());
        assert!(parsed.options.is_none());
    }

    #[tokio::test]
    async fn get_returns_response_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server.uri());
        let url = Value::Url(Url::parse(&format!("{}/hello", server.uri())).unwrap());
        let resp = GetVerb.call(&ctx, vec![url]).await.unwrap();
        assert_eq!(resp.memb("status"), Some(Value::Int(200)));
        assert_eq!(resp.memb("body"), Some(Value::Str("hi".into())));
        assert!(matches!(resp.memb("headers"), Some(Value::Object(_))));
    }

    #[tokio::test]
    async fn post_sends_object_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .and(body_json(serde_json::json!({"n": 3})))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let ctx = ctx_for(&server.uri());
        let url = Value::Url(Url::parse(&format!("{}/items", server.uri())).unwrap());
        let body = Value::object([("n".into(), Value::Int(3))]);
        let resp = PostVerb.call(&ctx, vec![url, body]).await.unwrap();
        assert_eq!(resp.memb("status"), Some(Value::Int(201)));
    }

    #[tokio::test]
    async fn denied_request_never_reaches_the_server() {
        let server = MockServer::start().await;
        let ctx = Context::new(Vec::new(), Limiter::default());
        let url = Value::Url(Url::parse(&format!("{}/hello", server.uri())).unwrap());
        let err = GetVerb.call(&ctx, vec![url]).await.unwrap_err();
        assert!(matches!(err, RtError::PermissionDenied { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_rate_paces_sequential_calls() {
        // Scenario: 2 ops/s, four sequential requests; the bucket starts
        // empty so every reservation waits half a second. Exercised at the
        // limiter level so paused time does not race real sockets.
        let ctx = Context::new(
            Vec::new(),
            Limiter::new([Limit::new(HTTP_REQUEST, LimitKind::OpRate, 2)]),
        );
        let mut waits = Vec::new();
        for _ in 0..4 {
            let start = tokio::time::Instant::now();
            ctx.take(HTTP_REQUEST, 1).await.unwrap();
            waits.push(start.elapsed());
        }
        assert!(
            waits[2] >= Duration::from_millis(500),
            "third call should block >= 0.5s, waited {:?}",
            waits[2]
        );
    }
}
