//! Upstream change sources: "watch path P, call back on every change".
//!
//! The gateway owns one [`WatchHandle`] per watched site. Dropping or
//! unwatching the handle cancels the watch.

pub mod error;
pub mod firebase;
pub mod memory;
pub mod source;
pub mod sse;
pub mod tree;

pub use error::UpstreamError;
pub use firebase::{FirebaseOptions, FirebaseSource};
pub use memory::MemorySource;
pub use source::{ChangeCallback, ChangeSource, Snapshot, WatchHandle};
