// Cache engine — request keys, stored responses, namespaced store, lifecycle.

pub mod request;
pub mod response;
pub mod stats;
pub mod store;
pub mod worker;
