//! Capability and rate-limit core.
//!
//! Every externally observable effect in tern flows through a [`Context`]:
//! the verb first proves it holds a [`Permission`] covering the effect, then
//! reserves tokens from the named [`limit`] buckets, and only then touches
//! the outside world.

pub mod context;
pub mod error;
pub mod limit;
pub mod permission;

pub use context::Context;
pub use error::{HttpError, LimitError, RtError};
pub use limit::{Limit, LimitKind, Limiter};
pub use permission::{ActionKind, FsEntity, HttpEntity, Permission};
