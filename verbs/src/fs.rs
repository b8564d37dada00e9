//! Filesystem verbs.
//!
//! Each verb resolves its path to absolute form, proves the matching
//! capability, reserves count buckets once, then streams the payload in
//! chunks sized by the declared byte rate. Chunk boundaries double as
//! cancellation points.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use globset::Glob;
use tokio::fs::{metadata, read_dir, remove_dir_all, remove_file, DirBuilder, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tern_engine::{Value, Verb, VerbFut};
use tern_runtime::{ActionKind, Context, FsEntity, Permission, RtError};
use tern_types::Pth;

use crate::{set_once, take_required};

pub const FS_READ: &str = "fs/read";
pub const FS_WRITE: &str = "fs/write";
pub const FS_NEW_FILE: &str = "fs/new-file";
pub const FS_TOTAL_NEW_FILE: &str = "fs/total-new-file";

/// Floor on write chunk size; keeps slow rates from degenerating into
/// per-byte syscalls.
const WRITE_MIN_CHUNK: u64 = 100_000;
const READ_MIN_CHUNK: u64 = 1_000_000;

const NEW_FILE_MODE: u32 = 0o400;
const NEW_DIR_MODE: u32 = 0o500;

fn abs(ctx: &Context, path: &Pth) -> Pth {
    path.to_abs(&ctx.cwd())
}

/// `min(rate, min(remaining, max(min_chunk, rate / 10)))`; unlimited
/// streams go in one piece.
fn chunk_len(remaining: u64, rate: Option<u64>, min_chunk: u64) -> u64 {
    match rate {
        None => remaining,
        Some(rate) => rate.min(remaining.min(min_chunk.max(rate / 10))),
    }
}

async fn write_chunked(ctx: &Context, file: &mut File, bytes: &[u8]) -> Result<(), RtError> {
    let rate = ctx.declared_rate(FS_WRITE);
    let mut offset = 0usize;
    while offset < bytes.len() {
        ctx.ensure_live()?;
        let chunk = chunk_len((bytes.len() - offset) as u64, rate, WRITE_MIN_CHUNK) as usize;
        ctx.take(FS_WRITE, chunk as u64).await?;
        file.write_all(&bytes[offset..offset + chunk]).await?;
        offset += chunk;
    }
    file.flush().await?;
    Ok(())
}

async fn read_chunked(ctx: &Context, file: &mut File, size: u64) -> Result<Vec<u8>, RtError> {
    let rate = ctx.declared_rate(FS_READ);
    let mut out = Vec::with_capacity(size as usize);
    let mut remaining = size;
    while remaining > 0 {
        ctx.ensure_live()?;
        let chunk = chunk_len(remaining, rate, READ_MIN_CHUNK);
        ctx.take(FS_READ, chunk).await?;
        let mut buf = vec![0u8; chunk as usize];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        out.extend_from_slice(&buf);
        remaining = remaining.saturating_sub(n as u64);
    }
    Ok(out)
}

fn open_options_with_mode(mode: u32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts
}

/// Shared write path for `mkfile` and the KV persister.
///
/// The count buckets (`fs/new-file`, `fs/total-new-file`) are only
/// consumed when `count_new` is set; the periodic persister rewrites an
/// existing file and pays only the byte rate.
pub async fn write_file(
    ctx: &Context,
    path: &Pth,
    content: &[u8],
    mode: u32,
    count_new: bool,
) -> Result<(), RtError> {
    let path = abs(ctx, path);
    if path.is_dir() {
        return Err(RtError::invalid_args(format!(
            "'{path}' is a directory path; mkfile takes a file path"
        )));
    }
    ctx.check(&Permission::fs_path(ActionKind::Create, path.clone()))?;
    if count_new {
        ctx.take(FS_NEW_FILE, 1).await?;
        ctx.take(FS_TOTAL_NEW_FILE, 1).await?;
    }
    // Recreate rather than reopen: the file may have been created with a
    // read-only mode by an earlier call.
    if metadata(path.as_str()).await.is_ok() {
        remove_file(path.as_str()).await?;
    }
    let mut file = open_options_with_mode(mode).open(path.as_str()).await?;
    write_chunked(ctx, &mut file, content).await?;
    tracing::debug!(path = %path, bytes = content.len(), "mkfile");
    Ok(())
}

pub async fn mkfile(ctx: &Context, path: &Pth, content: &[u8]) -> Result<(), RtError> {
    write_file(ctx, path, content, NEW_FILE_MODE, true).await
}

pub async fn mkdir(ctx: &Context, path: &Pth) -> Result<(), RtError> {
    let path = abs(ctx, path);
    if !path.is_dir() {
        return Err(RtError::invalid_args(format!(
            "'{path}' must end with '/' to name a directory"
        )));
    }
    ctx.check(&Permission::fs_path(ActionKind::Create, path.clone()))?;
    ctx.take(FS_NEW_FILE, 1).await?;
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        builder.mode(NEW_DIR_MODE);
    }
    builder.create(path.as_str().trim_end_matches('/')).await?;
    tracing::debug!(path = %path, "mkdir");
    Ok(())
}

/// Raw file bytes under the read rate limit. Used by `read`, the KV store
/// and the static file server.
pub async fn read_bytes(ctx: &Context, path: &Pth) -> Result<Vec<u8>, RtError> {
    let path = abs(ctx, path);
    ctx.check(&Permission::fs_path(ActionKind::Read, path.clone()))?;
    let meta = metadata(path.as_str()).await?;
    let mut file = File::open(path.as_str()).await?;
    read_chunked(ctx, &mut file, meta.len()).await
}

/// `read` verb: directory paths get an `ls`-shaped listing, files their
/// contents (as a string when valid UTF-8).
pub async fn read(ctx: &Context, path: &Pth) -> Result<Value, RtError> {
    let path = abs(ctx, path);
    if path.is_dir() {
        return ls(ctx, &path).await;
    }
    let bytes = read_bytes(ctx, &path).await?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => Value::Str(text),
        Err(err) => Value::Bytes(Arc::new(err.into_bytes())),
    })
}

/// One listing record per entry; directories get a trailing `/` on
/// `abs_path`.
async fn entry_record(dir: &Pth, name: &str) -> Result<Value, RtError> {
    let full = dir.join(name);
    let meta = metadata(full.as_str()).await?;
    let is_dir = meta.is_dir();
    let abs_path = if is_dir {
        Pth::new(format!("{full}/"))
    } else {
        full
    };
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        i64::from(meta.permissions().mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let mode = 0i64;
    let mod_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);
    Ok(Value::object([
        ("name".into(), Value::Str(name.to_string())),
        ("abs_path".into(), Value::Path(abs_path)),
        ("size".into(), Value::Int(meta.len() as i64)),
        ("mode".into(), Value::Int(mode)),
        ("mod_time".into(), Value::Int(mod_time)),
        ("is_dir".into(), Value::Bool(is_dir)),
    ]))
}

/// List a directory, or expand a glob pattern over its parent directory.
pub async fn ls(ctx: &Context, target: &Pth) -> Result<Value, RtError> {
    let target = abs(ctx, target);
    if target.is_pattern() {
        ctx.check(&Permission::Fs {
            kind: ActionKind::Read,
            entity: FsEntity::Pattern(target.as_str().to_string()),
        })?;
        let glob = Glob::new(target.as_str())
            .map_err(|e| RtError::invalid_args(format!("bad pattern '{target}': {e}")))?
            .compile_matcher();
        let dir = target.parent_dir();
        let mut records = Vec::new();
        let mut entries = read_dir(dir.as_str()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if glob.is_match(dir.join(&name).as_str()) {
                records.push(entry_record(&dir, &name).await?);
            }
        }
        return Ok(Value::list(records));
    }

    let dir = if target.is_dir() {
        target
    } else {
        Pth::new(format!("{target}/"))
    };
    ctx.check(&Permission::fs_path(ActionKind::Read, dir.clone()))?;
    let mut records = Vec::new();
    let mut entries = read_dir(dir.as_str()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        records.push(entry_record(&dir, &name).await?);
    }
    Ok(Value::list(records))
}

/// Recursive deletion under a `Delete` capability.
pub async fn del(ctx: &Context, path: &Pth) -> Result<(), RtError> {
    let path = abs(ctx, path);
    ctx.check(&Permission::fs_path(ActionKind::Delete, path.clone()))?;
    let meta = metadata(path.as_str().trim_end_matches('/')).await?;
    if meta.is_dir() {
        remove_dir_all(path.as_str().trim_end_matches('/')).await?;
    } else {
        remove_file(path.as_str()).await?;
    }
    tracing::debug!(path = %path, "del");
    Ok(())
}

/// Append to an existing file under the write rate limit.
pub async fn append(ctx: &Context, path: &Pth, content: &[u8]) -> Result<(), RtError> {
    let path = abs(ctx, path);
    ctx.check(&Permission::fs_path(ActionKind::Update, path.clone()))?;
    if metadata(path.as_str()).await.is_err() {
        return Err(RtError::invalid_args(format!(
            "append requires '{path}' to exist"
        )));
    }
    let mut file = OpenOptions::new().append(true).open(path.as_str()).await?;
    write_chunked(ctx, &mut file, content).await
}

// --- script-facing adapters ---------------------------------------------

fn parse_path_arg(args: Vec<Value>) -> Result<Pth, RtError> {
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
    take_required(path, "path")
}

fn parse_path_and_content(args: Vec<Value>) -> Result<(Pth, Vec<u8>), RtError> {
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

pub struct MkfileVerb;

impl Verb for MkfileVerb {
    fn name(&self) -> &'static str {
        "mkfile"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let (path, content) = parse_path_and_content(args)?;
            mkfile(ctx, &path, &content).await?;
            Ok(Value::Nil)
        })
    }
}

pub struct MkdirVerb;

impl Verb for MkdirVerb {
    fn name(&self) -> &'static str {
        "mkdir"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let path = parse_path_arg(args)?;
            mkdir(ctx, &path).await?;
            Ok(Value::Nil)
        })
    }
}

pub struct ReadVerb;

impl Verb for ReadVerb {
    fn name(&self) -> &'static str {
        "read"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let path = parse_path_arg(args)?;
            read(ctx, &path).await
        })
    }
}

pub struct LsVerb;

impl Verb for LsVerb {
    fn name(&self) -> &'static str {
        "ls"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let path = parse_path_arg(args)?;
            ls(ctx, &path).await
        })
    }
}

pub struct DelVerb;

impl Verb for DelVerb {
    fn name(&self) -> &'static str {
        "del"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let path = parse_path_arg(args)?;
            del(ctx, &path).await?;
            Ok(Value::Nil)
        })
    }
}

pub struct AppendVerb;

impl Verb for AppendVerb {
    fn name(&self) -> &'static str {
        "append"
    }
    fn call<'a>(&'a self, ctx: &'a Context, args: Vec<Value>) -> VerbFut<'a> {
        Box::pin(async move {
            let (path, content) = parse_path_and_content(args)?;
            append(ctx, &path, &content).await?;
            Ok(Value::Nil)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{append, chunk_len, del, ls, mkfile, read, MkfileVerb};
    use std::time::Duration;
    use tern_engine::{Value, Verb};
    use tern_runtime::{
        ActionKind, Context, Limit, LimitError, LimitKind, Limiter, Permission, RtError,
    };
    use tern_types::Pth;
    use tokio::time::Instant;

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

    #[test]
    fn chunk_formula() {
        // Unlimited: everything at once.
        assert_eq!(chunk_len(5_000_000, None, 100_000), 5_000_000);
        // Rate bounds the chunk.
        assert_eq!(chunk_len(5_000_000, Some(50_000), 100_000), 50_000);
        // Remaining bounds the chunk.
        assert_eq!(chunk_len(10, Some(1_000_000), 100_000), 10);
        // Large rates step in rate/10 increments.
        assert_eq!(chunk_len(5_000_000, Some(2_000_000), 100_000), 200_000);
    }

    #[tokio::test]
    async fn mkfile_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        let path = Pth::new(format!("{}/a.txt", dir.path().display()));
        mkfile(&ctx, &path, b"hello").await.unwrap();
        assert_eq!(read(&ctx, &path).await.unwrap(), Value::Str("hello".into()));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.as_str()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o400);
        }
    }

    #[tokio::test]
    async fn mkfile_rejects_directory_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        let path = Pth::new(format!("{}/sub/", dir.path().display()));
        let err = mkfile(&ctx, &path, b"x").await.unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn denied_read_fails_before_any_syscall() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        // The target does not exist: an attempted open would surface Io,
        // so PermissionDenied proves the check came first.
        let err = read(&ctx, &Pth::new("/definitely/not/granted"))
            .await
            .unwrap_err();
        assert!(matches!(err, RtError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn duplicate_path_argument_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        let p = Value::Path(Pth::new(format!("{}/a", dir.path().display())));
        let err = MkfileVerb
            .call(&ctx, vec![p.clone(), p])
            .await
            .unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn write_rate_is_linear() {
        let dir = tempfile::tempdir().unwrap();
        let rate = 100_000u64;
        let ctx = ctx_for(
            dir.path(),
            vec![Limit::new(super::FS_WRITE, LimitKind::ByteRate, rate)],
        );
        let path = Pth::new(format!("{}/one.bin", dir.path().display()));

        let start = Instant::now();
        mkfile(&ctx, &path, &vec![0u8; 100_000]).await.unwrap();
        let secs = start.elapsed().as_secs_f64();
        assert!((0.5..=1.5).contains(&secs), "100kB at 100kB/s took {secs}s");

        let start = Instant::now();
        mkfile(&ctx, &path, &vec![0u8; 200_000]).await.unwrap();
        let secs = start.elapsed().as_secs_f64();
        assert!((1.5..=2.5).contains(&secs), "200kB at 100kB/s took {secs}s");
    }

    #[tokio::test(start_paused = true)]
    async fn read_rate_is_linear() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(
            dir.path(),
            vec![Limit::new(super::FS_READ, LimitKind::ByteRate, 1_000_000)],
        );
        let path = Pth::new(format!("{}/two.bin", dir.path().display()));
        mkfile(&ctx, &path, &vec![7u8; 2_000_000]).await.unwrap();

        let start = Instant::now();
        let out = read(&ctx, &path).await.unwrap();
        let secs = start.elapsed().as_secs_f64();
        assert!((1.5..=2.5).contains(&secs), "2MB at 1MB/s took {secs}s");
        match out {
            Value::Str(s) => assert_eq!(s.len(), 2_000_000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn total_new_file_quota_blocks_further_creates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(
            dir.path(),
            vec![Limit::new(super::FS_TOTAL_NEW_FILE, LimitKind::Total, 1)],
        );
        let path = Pth::new(format!("{}/q.txt", dir.path().display()));
        mkfile(&ctx, &path, b"once").await.unwrap();
        let err = mkfile(&ctx, &path, b"once").await.unwrap_err();
        assert!(matches!(
            err,
            RtError::Limit(LimitError::QuotaExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn ls_marks_directories_with_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("f.txt"), b"x").unwrap();

        let listing = ls(&ctx, &Pth::new(format!("{}/", dir.path().display())))
            .await
            .unwrap();
        let Value::List(items) = listing else {
            panic!("expected list")
        };
        let items = items.read().unwrap();
        assert_eq!(items.len(), 2);
        for item in items.iter() {
            let name = match item.memb("name") {
                Some(Value::Str(s)) => s,
                other => panic!("bad name {other:?}"),
            };
            let abs = match item.memb("abs_path") {
                Some(Value::Path(p)) => p,
                other => panic!("bad abs_path {other:?}"),
            };
            if name == "sub" {
                assert!(abs.is_dir());
                assert_eq!(item.memb("is_dir"), Some(Value::Bool(true)));
            } else {
                assert!(!abs.is_dir());
                assert_eq!(item.memb("size"), Some(Value::Int(1)));
            }
        }
    }

    #[tokio::test]
    async fn ls_expands_glob_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();

        // Without any grant the pattern expansion is refused outright.
        let pattern = Pth::new(format!("{}/*.json", dir.path().display()));
        let deny_ctx = Context::new(Vec::new(), Limiter::default());
        let err = ls(&deny_ctx, &pattern).await.unwrap_err();
        assert!(matches!(err, RtError::PermissionDenied { .. }));

        let ctx = Context::new(
            vec![Permission::Fs {
                kind: ActionKind::Read,
                entity: tern_runtime::FsEntity::Pattern(pattern.as_str().into()),
            }],
            Limiter::default(),
        );
        let Value::List(items) = ls(&ctx, &pattern).await.unwrap() else {
            panic!("expected list")
        };
        let items = items.read().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].memb("name"), Some(Value::Str("a.json".into())));
    }

    #[tokio::test]
    async fn read_on_directory_path_lists_it() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let out = read(&ctx, &Pth::new(format!("{}/", dir.path().display())))
            .await
            .unwrap();
        assert!(matches!(out, Value::List(_)));
    }

    #[tokio::test]
    async fn append_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        let path = Pth::new(format!("{}/log.txt", dir.path().display()));
        let err = append(&ctx, &path, b"x").await.unwrap_err();
        assert!(matches!(err, RtError::InvalidArgs { .. }));

        mkfile(&ctx, &path, b"a").await.unwrap();
        // New files are read-only; loosen for the append itself.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path.as_str(), std::fs::Permissions::from_mode(0o600))
                .unwrap();
        }
        append(&ctx, &path, b"b").await.unwrap();
        assert_eq!(std::fs::read(path.as_str()).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn del_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(dir.path(), vec![]);
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("x"), b"x").unwrap();
        del(&ctx, &Pth::new(format!("{}/", sub.display())))
            .await
            .unwrap();
        assert!(!sub.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_chunked_write() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_for(
            dir.path(),
            vec![Limit::new(super::FS_WRITE, LimitKind::ByteRate, 1_000)],
        );
        let path = Pth::new(format!("{}/slow.bin", dir.path().display()));
        let write_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            mkfile(&write_ctx, &path, &vec![0u8; 1_000_000]).await
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        ctx.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RtError::Cancelled));
    }
}
