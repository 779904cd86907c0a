//! JSON envelope shared by every `/api/v1` response.
//!
//! Successful responses carry `data`, failed ones carry a single entry in
//! `errors`; both carry `meta` and, when known, `_links` to related
//! resources (a run links to its steps and workflow).

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub meta: ApiMeta,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorDetail>,
    #[serde(rename = "_links", skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
pub struct ApiMeta {
    pub request_id: Uuid,
    pub timestamp: String,
    pub response_time_ms: u64,
}

impl ApiMeta {
    fn since(started: Option<Instant>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            response_time_ms: started.map_or(0, |s| s.elapsed().as_millis() as u64),
        }
    }
}

/// Machine-readable error code plus a message for humans.
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap `data`, timing the response from `started`.
    pub fn timed(data: T, started: Instant) -> Self {
        Self {
            data: Some(data),
            meta: ApiMeta::since(Some(started)),
            errors: Vec::new(),
            links: BTreeMap::new(),
        }
    }

    pub fn with_link(mut self, rel: &'static str, href: &str) -> Self {
        self.links.insert(rel, href.to_string());
        self
    }
}

impl ApiResponse<()> {
    pub fn error(detail: ApiErrorDetail) -> Self {
        Self {
            data: None,
            meta: ApiMeta::since(None),
            errors: vec![detail],
            links: BTreeMap::new(),
        }
    }
}
