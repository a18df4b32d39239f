pub mod config;
pub mod error;
pub mod types;

pub use config::CarewatchConfig;
pub use error::{CarewatchError, Result};
pub use types::{ConnId, LiveState, SenseEvent, SiteId};
