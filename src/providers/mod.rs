//! External resolution sources.
//!
//! Every adapter returns provider-shaped JSON as a [`RawRecord`] and owns a
//! `normalize` function that maps it onto [`CanonicalRecord`]. Nothing outside
//! this module sees provider field names.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, Response};
use serde_json::Value;

use crate::error::SourceError;
use crate::identifier::CandidateIdentifier;
use crate::model::{CanonicalRecord, Category, Location};

pub mod directory;
pub mod open_data;
pub mod registry;

pub use directory::DirectoryProvider;
pub use open_data::OpenDataProvider;
pub use registry::RegistryProvider;

/// Provider-shaped payload for a single entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord(pub Value);

/// A source that can filter by municipality and activity code.
#[async_trait]
pub trait FilterSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup_by_filter(
        &self,
        location: &Location,
        category: &Category,
    ) -> Result<RawRecord, SourceError>;
    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord>;
}

/// A registry that resolves a single identifier.
#[async_trait]
pub trait IdentifierSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup_by_identifier(
        &self,
        id: &CandidateIdentifier,
    ) -> Result<RawRecord, SourceError>;
    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord>;
}

pub(crate) fn build_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
}

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps an HTTP response onto the source error taxonomy.
pub(crate) async fn read_json(resp: Response) -> Result<Value, SourceError> {
    let status = resp.status().as_u16();
    match status {
        200..=299 => resp
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string())),
        404 => Err(SourceError::NotFound),
        429 => Err(SourceError::RateLimited {
            retry_after: retry_after(resp.headers()),
        }),
        s if s >= 500 => Err(SourceError::Unavailable(format!("http {s}"))),
        s => {
            let body = resp.text().await.unwrap_or_default();
            Err(SourceError::Unavailable(format!(
                "http {s}: {}",
                truncate_for_log(body, 200)
            )))
        }
    }
}

/// First entity object in a search-style payload: a bare array, or an array
/// under one of the usual envelope keys (possibly nested one level in `data`).
pub(crate) fn first_hit(payload: &Value) -> Option<&Value> {
    const ENVELOPES: [&str; 5] = ["data", "results", "items", "cnpj", "companies"];
    if let Some(arr) = payload.as_array() {
        return arr.first();
    }
    for key in ENVELOPES {
        match payload.get(key) {
            Some(Value::Array(arr)) => return arr.first(),
            Some(inner @ Value::Object(_)) => {
                if let Some(hit) = first_hit(inner) {
                    return Some(hit);
                }
            }
            _ => {}
        }
    }
    None
}
