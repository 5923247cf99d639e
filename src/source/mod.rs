// Network transport abstraction — the fetch primitive the cache falls back to.

pub mod http_source;
pub mod traits;
