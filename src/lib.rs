pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod source;

pub use config::CacheConfig;
pub use engine::worker::{LifecycleState, OfflineAssetCache};
pub use error::{CacheError, CacheResult};
