//! Persistent KV store.
//!
//! An in-memory map flushed to a JSON file through the chunked `mkfile`
//! path, so persistence is itself permission-checked, rate-limited and
//! cancellable. A background ticker persists every [`PERSIST_INTERVAL`]
//! while the map is dirty; `close` stops the ticker and flushes once more.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tern_engine::{Value, Verb, VerbFut};
use tern_runtime::{Context, RtError};
use tern_types::Pth;

use crate::{fs, set_once, take_required};

pub const PERSIST_INTERVAL: Duration = Duration::from_millis(100);

const STORE_FILE_MODE: u32 = 0o600;

struct KvInner {
    map: RwLock<BTreeMap<String, Value>>,
    path: Pth,
    dirty: AtomicBool,
    closed: AtomicBool,
    /// Context the persister writes under; outlives `close` so the final
    /// flush still goes through.
    ctx: Context,
    ticker_stop: CancellationToken,
}

#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

impl KvStore {
    /// Load the backing file, creating it as `{}` when missing, then start
    /// the persist ticker.
    pub async fn open_or_create(ctx: &Context, path: &Pth) -> Result<KvStore, RtError> {
        let path = path.to_abs(&ctx.cwd());
        let map = if tokio::fs::metadata(path.as_str()).await.is_ok() {
            let bytes = fs::read_bytes(ctx, &path).await?;
            let json: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| RtError::Parse(format!("corrupt store file '{path}': {e}")))?;
            match json {
                serde_json::Value::Object(entries) => entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
                _ => {
                    return Err(RtError::Parse(format!(
                        "store file '{path}' must hold a single JSON object"
                    )));
                }
            }
        } else {
            fs::write_file(ctx, &path, b"{}", STORE_FILE_MODE, true).await?;
            BTreeMap::new()
        };

        let store = KvStore {
            inner: Arc::new(KvInner {
                map: RwLock::new(map),
                path,
                dirty: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                ctx: ctx.child(),
                ticker_stop: CancellationToken::new(),
            }),
        };

        let ticker = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = ticker.inner.ticker_stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = ticker.persist(false).await {
                            tracing::warn!(error = %e, "kv persist failed");
                        }
                    }
                }
            }
        });

        Ok(store)
    }

    fn ensure_open(&self) -> Result<(), RtError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RtError::invalid_args(format!(
                "store '{}' is closed",
                self.inner.path
            )));
        }
        Ok(())
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), RtError> {
        self.ensure_open()?;
        // Reject unserializable values up front rather than corrupting the
        // next persist.
        value.to_json()?;
        let mut map = self.inner.map.write().await;
        map.insert(key.to_string(), value);
        self.inner.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let map = self.inner.map.read().await;
        map.get(key).cloned()
    }

    pub async fn has(&self, key: &str) -> bool {
        let map = self.inner.map.read().await;
        map.contains_key(key)
    }

    /// Serialize and flush under the exclusive lock. Readers never observe
    /// a half-written value because marshaling happens while the lock is
    /// held; the write itself is the single intentional suspension inside
    /// a critical section.
    pub async fn persist(&self, force: bool) -> Result<(), RtError> {
        if !force && !self.inner.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let map = self.inner.map.write().await;
        let mut json = serde_json::Map::new();
        for (k, v) in map.iter() {
            json.insert(k.clone(), v.to_json()?);
        }
        let text = serde_json::Value::Object(json).to_string();
        fs::write_file(
            &self.inner.ctx,
            &self.inner.path,
            text.as_bytes(),
            STORE_FILE_MODE,
            false,
        )
        .await?;
        self.inner.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop the ticker and flush once more.
    pub async fn close(&self) -> Result<(), RtError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.ticker_stop.cancel();
        self.persist(true).await
    }

    #[must_use]
    pub fn path(&self) -> &Pth {
        &self.inner.path
    }
}

// --- script-facing adapters ---------------------------------------------

pub struct KvOpenVerb;

impl Verb for KvOpenVerb {
    fn name(&self) -> &'static str {
        "open"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
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
            let path = take_required(path, "path")?;
            let store = KvStore::open_or_create(ctx, &path).await?;
            Ok(Value::object([
                ("path".into(), Value::Path(store.path().clone())),
                (
                    "set".into(),
                    Value::native(Arc::new(KvSetVerb {
                        store: store.clone(),
                    })),
                ),
                (
                    "get".into(),
                    Value::native(Arc::new(KvGetVerb {
                        store: store.clone(),
                    })),
                ),
                (
                    "has".into(),
                    Value::native(Arc::new(KvHasVerb {
                        store: store.clone(),
                    })),
                ),
                ("close".into(), Value::native(Arc::new(KvCloseVerb { store }))),
            ]))
        })
    }
}

fn key_and_value(args: Vec<Value>) -> Result<(String, Option<Value>), RtError> {
    let mut iter = args.into_iter();
    let key = match iter.next() {
        Some(Value::Str(s)) => s,
        Some(other) => {
            return Err(RtError::invalid_args(format!(
                "store keys are strings, got {}",
                other.type_name()
            )));
        }
        None => return Err(RtError::invalid_args("missing store key")),
    };
    let value = iter.next();
    if iter.next().is_some() {
        return Err(RtError::invalid_args("too many arguments"));
    }
    Ok((key, value))
}

struct KvSetVerb {
    store: KvStore,
}

impl Verb for KvSetVerb {
    fn name(&self) -> &'static str {
        "set"
    }
    fn call<'a>(&'a self, _ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let (key, value) = key_and_value(args)?;
            let value = value.ok_or_else(|| RtError::invalid_args("missing value"))?;
            self.store.set(&key, value).await?;
            Ok(Value::Nil)
        })
    }
}

struct KvGetVerb {
    store: KvStore,
}

impl Verb for KvGetVerb {
    fn name(&self) -> &'static str {
        "get"
    }
    fn call<'a>(&'a self, _ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let (key, extra) = key_and_value(args)?;
            if extra.is_some() {
                return Err(RtError::invalid_args("get takes a single key"));
            }
            Ok(self.store.get(&key).await.unwrap_or(Value::Nil))
        })
    }
}

struct KvHasVerb {
    store: KvStore,
}

impl Verb for KvHasVerb {
    fn name(&self) -> &'static str {
        "has"
    }
    fn call<'a>(&'a self, _ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let (key, extra) = key_and_value(args)?;
            if extra.is_some() {
                return Err(RtError::invalid_args("has takes a single key"));
            }
            Ok(Value::Bool(self.store.has(&key).await))
        })
    }
}

struct KvCloseVerb {
    store: KvStore,
}

impl Verb for KvCloseVerb {
    fn name(&self) -> &'static str {
        "close"
    }
    fn call<'a>(&'a self, _ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            if !args.is_empty() {
                return Err(RtError::invalid_args("close takes no arguments"));
            }
            self.store.close().await?;
            Ok(Value::Nil)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::KvStore;
    use tern_engine::Value;
    use tern_runtime::{ActionKind, Context, Limiter, Permission, RtError};
    use tern_types::Pth;

    fn ctx_for(dir: &std::path::Path) -> Context {
        let root = Pth::new(format!("{}/", dir.display()));
        Context::new(
            vec![
                Permission::fs_path(ActionKind::Read, root.clone()),
                Permission::fs_path(ActionKind::Create, root),
            ],
            Limiter::default(),
        )
    }

    #[tokio::test]
    async fn round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let path = Pth::new(format!("{}/store.json", dir.path().display()));

        let store = KvStore::open_or_create(&ctx, &path).await.unwrap();
        store.set("a", Value::Float(1.0)).await.unwrap();
        store
            .set("b", Value::object([("n".into(), Value::Int(2))]))
            .await
            .unwrap();
        store.close().await.unwrap();

        let reopened = KvStore::open_or_create(&ctx, &path).await.unwrap();
        assert_eq!(reopened.get("a").await, Some(Value::Float(1.0)));
        assert_eq!(
            reopened.get("b").await.unwrap().memb("n"),
            Some(Value::Int(2))
        );
        assert!(reopened.has("a").await);
        assert!(!reopened.has("zzz").await);
        reopened.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ticker_persists_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let path = Pth::new(format!("{}/tick.json", dir.path().display()));

        let store = KvStore::open_or_create(&ctx, &path).await.unwrap();
        let empty_size = std::fs::metadata(path.as_str()).unwrap().len();

        store.set("a", Value::Float(1.0)).await.unwrap();
        tokio::time::sleep(super::PERSIST_INTERVAL * 3).await;
        let grown_size = std::fs::metadata(path.as_str()).unwrap().len();
        assert!(
            grown_size > empty_size,
            "expected persist to grow the file ({empty_size} -> {grown_size})"
        );
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn latest_write_wins_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let path = Pth::new(format!("{}/w.json", dir.path().display()));
        let store = KvStore::open_or_create(&ctx, &path).await.unwrap();
        store.set("k", Value::Int(1)).await.unwrap();
        store.set("k", Value::Int(2)).await.unwrap();
        assert_eq!(store.get("k").await, Some(Value::Int(2)));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let path = Pth::new(format!("{}/c.json", dir.path().display()));
        let store = KvStore::open_or_create(&ctx, &path).await.unwrap();
        store.close().await.unwrap();
        let err = store.set("k", Value::Int(1)).await.unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn unserializable_values_are_rejected_at_set() {
        use std::sync::Arc;
        use tern_engine::{Verb, VerbFut};

        struct Noop;
        impl Verb for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn call<'a>(&'a self, _ctx: &'a Context, _args: Vec<Value>) -> VerbFut<'a> {
                Box::pin(async { Ok(Value::Nil) })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path());
        let path = Pth::new(format!("{}/f.json", dir.path().display()));
        let store = KvStore::open_or_create(&ctx, &path).await.unwrap();
        let err = store
            .set("f", Value::native(Arc::new(Noop)))
            .await
            .unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));
        store.close().await.unwrap();
    }
}
