// Stored response representation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Status, headers and a fully buffered body.
///
/// The body is a `Bytes` handle, so `duplicate` yields two responses whose
/// bodies can each be read to the end independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 200 response with the given body and no headers.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, Vec::new(), body)
    }

    /// Split into the copy written to the store and the copy handed back.
    pub fn duplicate(self) -> (Self, Self) {
        (self.clone(), self)
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> u64 {
        self.body.len() as u64
    }

    pub(crate) fn meta(&self, method: &str, url: &str, seq: u64) -> EntryMeta {
        EntryMeta {
            method: method.to_string(),
            url: url.to_string(),
            status: self.status,
            headers: self.headers.clone(),
            seq,
        }
    }
}

/// On-disk metadata written beside each stored body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub seq: u64,
}
