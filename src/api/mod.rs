// Host-facing entry points — logging setup and the one-call cache bootstrap.

pub mod cache_api;
pub mod logging;
