//! HTTP host values: scheme + authority, no path.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostParseError {
    #[error("invalid host literal '{0}'")]
    Invalid(String),
    #[error("host literal '{0}' must not carry a path")]
    HasPath(String),
    #[error("scheme '{0}' is not an http scheme")]
    BadScheme(String),
}

/// `scheme://host[:port]` with no path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HttpHost {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl HttpHost {
    pub fn parse(raw: &str) -> Result<Self, HostParseError> {
        let url = Url::parse(raw).map_err(|_| HostParseError::Invalid(raw.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(HostParseError::BadScheme(other.to_string())),
        }
        if url.path() != "/" && !url.path().is_empty() {
            return Err(HostParseError::HasPath(raw.to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| HostParseError::Invalid(raw.to_string()))?
            .to_string();
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port with the scheme default filled in.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.scheme == "https" { 443 } else { 80 })
    }

    /// `host:port` form suitable for a socket bind.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }

    /// Whether `url` addresses this host (scheme, host, and port all match).
    #[must_use]
    pub fn covers_url(&self, url: &Url) -> bool {
        url.scheme() == self.scheme
            && url.host_str() == Some(self.host.as_str())
            && url.port_or_known_default() == Some(self.effective_port())
    }
}

impl fmt::Display for HttpHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}://{}:{p}", self.scheme, self.host),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}
