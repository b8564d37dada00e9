//! Script-level path values.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A script path literal.
///
/// The string form carries meaning: a trailing `/` marks a directory path,
/// a leading `/` marks an absolute one. Both distinctions survive
/// normalization because the permission model keys off them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pth(String);

impl Pth {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory path iff the literal ends with `/`.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.0.ends_with('/')
    }

    #[must_use]
    pub fn is_abs(&self) -> bool {
        self.0.starts_with('/')
    }

    /// Whether the literal contains glob metacharacters.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.0.contains('*') || self.0.contains('?') || self.0.contains('[')
    }

    /// Absolute form of this path, resolving relative ones against `cwd`.
    ///
    /// `.` and `..` segments are folded lexically; the trailing-`/`
    /// directory marker is preserved.
    #[must_use]
    pub fn to_abs(&self, cwd: &Path) -> Pth {
        if self.is_abs() {
            return Pth(normalize(&self.0, self.is_dir()));
        }
        let joined = cwd.join(self.0.trim_start_matches("./"));
        Pth(normalize(&joined.to_string_lossy(), self.is_dir()))
    }

    /// Parent directory of this path, always with a trailing `/`.
    #[must_use]
    pub fn parent_dir(&self) -> Pth {
        let trimmed = self.0.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) => Pth::new("/"),
            Some(idx) => Pth::new(format!("{}/", &trimmed[..idx])),
            None => Pth::new("./"),
        }
    }

    /// Final path segment, without any trailing `/`.
    #[must_use]
    pub fn base_name(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    /// Append a segment, keeping exactly one separator between parts.
    #[must_use]
    pub fn join(&self, segment: &str) -> Pth {
        if self.0.ends_with('/') {
            Pth(format!("{}{segment}", self.0))
        } else {
            Pth(format!("{}/{segment}", self.0))
        }
    }

    #[must_use]
    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

/// Fold `.` and `..` segments out of an absolute path string.
fn normalize(raw: &str, dir: bool) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    if dir && !out.ends_with('/') {
        out.push('/');
    }
    out
}

impl fmt::Display for Pth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pth {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
