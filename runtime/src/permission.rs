//! The capability model.
//!
//! A [`Permission`] names a category of effect (filesystem, HTTP, command,
//! custom) and the entity it touches. Granted permissions are compared
//! against requested ones with [`Permission::satisfies`]; the inclusion
//! relation is entity-kind specific (directory prefixes for paths, glob
//! matching for patterns, host + path-prefix for URLs, chain prefixes for
//! commands).

use std::fmt;

use globset::Glob;
use url::Url;

use tern_types::{HttpHost, Pth};

/// Effect category on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Read,
    Create,
    Update,
    Delete,
    /// Offering a service (HTTP only).
    Provide,
}

impl ActionKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Provide => "provide",
        }
    }
}

/// Filesystem entity a permission applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEntity {
    Path(Pth),
    /// Glob over absolute paths.
    Pattern(String),
}

/// HTTP entity a permission applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEntity {
    Url(Url),
    /// Glob over full URL strings.
    Pattern(String),
    Host(HttpHost),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Permission {
    Fs {
        kind: ActionKind,
        entity: FsEntity,
    },
    Http {
        kind: ActionKind,
        entity: HttpEntity,
    },
    Command {
        name: String,
        subcommand_chain: Vec<String>,
    },
    Custom {
        kind: String,
        name: String,
        value: serde_json::Value,
    },
}

impl Permission {
    pub fn fs_path(kind: ActionKind, path: impl Into<Pth>) -> Self {
        Self::Fs {
            kind,
            entity: FsEntity::Path(path.into()),
        }
    }

    pub fn http_url(kind: ActionKind, url: Url) -> Self {
        Self::Http {
            kind,
            entity: HttpEntity::Url(url),
        }
    }

    /// Whether this granted permission covers `request`.
    #[must_use]
    pub fn satisfies(&self, request: &Permission) -> bool {
        match (self, request) {
            (
                Self::Fs { kind: gk, entity: ge },
                Self::Fs { kind: rk, entity: re },
            ) => gk == rk && fs_entity_covers(ge, re),
            (
                Self::Http { kind: gk, entity: ge },
                Self::Http { kind: rk, entity: re },
            ) => gk == rk && http_entity_covers(ge, re),
            (
                Self::Command {
                    name: gn,
                    subcommand_chain: gc,
                },
                Self::Command {
                    name: rn,
                    subcommand_chain: rc,
                },
            ) => gn == rn && rc.starts_with(gc.as_slice()),
            (
                Self::Custom {
                    kind: gk,
                    name: gn,
                    value: gv,
                },
                Self::Custom {
                    kind: rk,
                    name: rn,
                    value: rv,
                },
            ) => gk == rk && gn == rn && gv == rv,
            _ => false,
        }
    }
}

/// Directory-prefix inclusion for concrete paths: a grant on `/a/b/`
/// covers everything under it, a grant on a file covers only that file.
fn path_covers(grant: &Pth, req: &Pth) -> bool {
    if grant.is_dir() {
        req.as_str().starts_with(grant.as_str())
            || req.as_str() == grant.as_str().trim_end_matches('/')
    } else {
        grant.as_str() == req.as_str()
    }
}

fn fs_entity_covers(grant: &FsEntity, req: &FsEntity) -> bool {
    match (grant, req) {
        (FsEntity::Path(g), FsEntity::Path(r)) => path_covers(g, r),
        (FsEntity::Pattern(g), FsEntity::Path(r)) => glob_matches(g, r.as_str()),
        // Pattern-in-pattern containment is undecidable in general; require
        // the literal prefix of the requested pattern to sit inside the
        // granted directory, or the patterns to be identical.
        (FsEntity::Pattern(g), FsEntity::Pattern(r)) => g == r,
        (FsEntity::Path(g), FsEntity::Pattern(r)) => {
            g.is_dir() && literal_prefix(r).starts_with(g.as_str())
        }
    }
}

fn http_entity_covers(grant: &HttpEntity, req: &HttpEntity) -> bool {
    match (grant, req) {
        (HttpEntity::Url(g), HttpEntity::Url(r)) => url_covers(g, r),
        (HttpEntity::Host(g), HttpEntity::Url(r)) => g.covers_url(r),
        (HttpEntity::Host(g), HttpEntity::Host(r)) => g == r,
        (HttpEntity::Pattern(g), HttpEntity::Url(r)) => glob_matches(g, r.as_str()),
        (HttpEntity::Pattern(g), HttpEntity::Pattern(r)) => g == r,
        _ => false,
    }
}

/// Host + path-prefix inclusion for URLs.
fn url_covers(grant: &Url, req: &Url) -> bool {
    grant.scheme() == req.scheme()
        && grant.host_str() == req.host_str()
        && grant.port_or_known_default() == req.port_or_known_default()
        && req.path().starts_with(grant.path())
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(candidate))
        .unwrap_or(false)
}

/// Longest leading run of a glob pattern with no metacharacters.
fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '['])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fs { kind, entity } => match entity {
                FsEntity::Path(p) => write!(f, "fs {} {p}", kind.label()),
                FsEntity::Pattern(p) => write!(f, "fs {} {p}", kind.label()),
            },
            Self::Http { kind, entity } => match entity {
                HttpEntity::Url(u) => write!(f, "http {} {u}", kind.label()),
                HttpEntity::Pattern(p) => write!(f, "http {} {p}", kind.label()),
                HttpEntity::Host(h) => write!(f, "http {} {h}", kind.label()),
            },
            Self::Command {
                name,
                subcommand_chain,
            } => {
                write!(f, "command {name}")?;
                for sub in subcommand_chain {
                    write!(f, " {sub}")?;
                }
                Ok(())
            }
            Self::Custom { kind, name, value } => write!(f, "{kind} {name}: {value}"),
        }
    }
}
