//! The `require { .. }` header: declarative permissions and limits.
//!
//! The front-end parses the header into [`RequirementDecl`]s;
//! [`permissions_and_limits`] turns those into the runtime's concrete
//! [`Permission`] and [`Limit`] values, absolutizing paths against the
//! process cwd and letting the embedder veto or rewrite custom entries.

use std::path::Path;

use url::Url;

use tern_runtime::{ActionKind, FsEntity, HttpEntity, Limit, LimitKind, Permission, RtError};
use tern_types::{HttpHost, Pth};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityDecl {
    Path(String),
    PathPattern(String),
    Url(String),
    UrlPattern(String),
    Host(String),
    HostPattern(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequirementDecl {
    Perm {
        kind: ActionKind,
        entity: EntityDecl,
    },
    Command {
        name: String,
        chain: Vec<String>,
    },
    Limit {
        name: String,
        kind: LimitKind,
        rate: u64,
    },
    Custom {
        kind: String,
        name: String,
        value: serde_json::Value,
    },
}

/// Hook for `Custom` declarations (e.g. `read cli-args: true`). Returning
/// `None` keeps the declaration as a plain [`Permission::Custom`].
pub type CustomHandler<'h> = &'h dyn Fn(&str, &str, &serde_json::Value) -> Option<Permission>;

/// Resolve declarations into grantable permissions and limiter config.
///
/// `overrides` replace declared limits by name (the CLI uses this to
/// tighten a script's own declaration).
pub fn permissions_and_limits(
    decls: &[RequirementDecl],
    overrides: &[Limit],
    custom_handler: CustomHandler<'_>,
    cwd: &Path,
) -> Result<(Vec<Permission>, Vec<Limit>), RtError> {
    let mut permissions = Vec::new();
    let mut limits: Vec<Limit> = Vec::new();

    for decl in decls {
        match decl {
            RequirementDecl::Perm { kind, entity } => {
                permissions.push(resolve_perm(*kind, entity, cwd)?);
            }
            RequirementDecl::Command { name, chain } => {
                permissions.push(Permission::Command {
                    name: name.clone(),
                    subcommand_chain: chain.clone(),
                });
            }
            RequirementDecl::Limit { name, kind, rate } => {
                if limits.iter().any(|l| l.name == *name) {
                    return Err(RtError::invalid_args(format!(
                        "limit '{name}' declared more than once"
                    )));
                }
                limits.push(Limit::new(name.clone(), *kind, *rate));
            }
            RequirementDecl::Custom { kind, name, value } => {
                let perm = custom_handler(kind, name, value).unwrap_or_else(|| {
                    Permission::Custom {
                        kind: kind.clone(),
                        name: name.clone(),
                        value: value.clone(),
                    }
                });
                permissions.push(perm);
            }
        }
    }

    for over in overrides {
        match limits.iter_mut().find(|l| l.name == over.name) {
            Some(slot) => *slot = over.clone(),
            None => limits.push(over.clone()),
        }
    }

    Ok((permissions, limits))
}

fn resolve_perm(kind: ActionKind, entity: &EntityDecl, cwd: &Path) -> Result<Permission, RtError> {
    Ok(match entity {
        EntityDecl::Path(raw) => Permission::Fs {
            kind,
            entity: FsEntity::Path(Pth::new(raw.as_str()).to_abs(cwd)),
        },
        EntityDecl::PathPattern(raw) => {
            let abs = Pth::new(raw.as_str()).to_abs(cwd);
            Permission::Fs {
                kind,
                entity: FsEntity::Pattern(abs.as_str().to_string()),
            }
        }
        EntityDecl::Url(raw) => {
            let url = Url::parse(raw)
                .map_err(|e| RtError::invalid_args(format!("bad url '{raw}': {e}")))?;
            Permission::Http {
                kind,
                entity: HttpEntity::Url(url),
            }
        }
        EntityDecl::UrlPattern(raw) => Permission::Http {
            kind,
            entity: HttpEntity::Pattern(raw.clone()),
        },
        EntityDecl::Host(raw) => {
            let host = HttpHost::parse(raw)
                .map_err(|e| RtError::invalid_args(format!("bad host '{raw}': {e}")))?;
            Permission::Http {
                kind,
                entity: HttpEntity::Host(host),
            }
        }
        EntityDecl::HostPattern(raw) => Permission::Http {
            kind,
            entity: HttpEntity::Pattern(raw.clone()),
        },
    })
}
