// Local HTTP front-end — hosts the cache as an intercepting proxy.

pub mod handler;
