//! Remote connection abstraction.
//!
//! [`SalesforceConnection`] is the transport seam under the gateway: it runs
//! one query, one composite envelope or one metadata call, and exposes the
//! org's live [`UsageBudget`]. It knows nothing about rate limits,
//! pagination windows or batching; the gateway layers those on top.
//!
//! [`HttpConnection`] speaks the REST API over `reqwest`. Tests and other
//! transports implement the trait directly; only `usage`, `query` and
//! `composite` are required, the rest default to
//! [`OrgCheckError::Unsupported`].

mod http;

pub use http::HttpConnection;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::rate_guard::UsageBudget;
use crate::{OrgCheckError, Result};

/// Which REST surface a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiSurface {
    #[default]
    Standard,
    Tooling,
}

impl ApiSurface {
    /// Path segment inserted after `/services/data/vXX.X/`.
    pub fn path_prefix(self) -> &'static str {
        match self {
            ApiSurface::Standard => "",
            ApiSurface::Tooling => "tooling/",
        }
    }
}

impl fmt::Display for ApiSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiSurface::Standard => f.write_str("standard"),
            ApiSurface::Tooling => f.write_str("tooling"),
        }
    }
}

/// Transport options for a single query call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Follow `nextRecordsUrl` cursors.
    pub auto_fetch: bool,
    /// Stop following cursors once this many records are collected.
    pub max_fetch: usize,
    /// `Sforce-Query-Options: batchSize` hint.
    pub batch_size: usize,
}

impl QueryOptions {
    /// Cursor-following query bounded by `max_fetch`.
    pub fn auto_fetch(max_fetch: usize, batch_size: usize) -> Self {
        Self {
            auto_fetch: true,
            max_fetch,
            batch_size,
        }
    }

    /// Single page, no cursor following.
    pub fn single_page(size: usize) -> Self {
        Self {
            auto_fetch: false,
            max_fetch: size,
            batch_size: size,
        }
    }
}

/// One sub-request of a composite envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSubRequest {
    pub method: String,
    pub url: String,
    pub reference_id: String,
}

impl CompositeSubRequest {
    pub fn get(url: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            reference_id: reference_id.into(),
        }
    }
}

/// Composite envelope (`POST .../composite`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeRequest {
    pub all_or_none: bool,
    #[serde(rename = "compositeRequest")]
    pub sub_requests: Vec<CompositeSubRequest>,
}

impl CompositeRequest {
    /// Independent sub-requests: one failing does not roll back the others.
    pub fn new(sub_requests: Vec<CompositeSubRequest>) -> Self {
        Self {
            all_or_none: false,
            sub_requests,
        }
    }
}

/// One sub-response of a composite envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSubResponse {
    #[serde(default)]
    pub body: Value,
    pub http_status_code: u16,
    pub reference_id: String,
}

impl CompositeSubResponse {
    pub fn is_success(&self) -> bool {
        self.http_status_code == 200
    }

    /// `errorCode` of the first error in a failed sub-response body.
    pub fn error_code(&self) -> Option<&str> {
        self.body
            .get(0)
            .and_then(|e| e.get("errorCode"))
            .and_then(Value::as_str)
    }

    /// Convert a failed sub-response into an [`OrgCheckError::Api`].
    pub fn to_error(&self) -> OrgCheckError {
        let message = self
            .body
            .get(0)
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.body.to_string());
        OrgCheckError::Api {
            status: self.http_status_code,
            error_code: self.error_code().unwrap_or("UNKNOWN").to_string(),
            message,
        }
    }
}

/// Composite response envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeResponse {
    #[serde(default)]
    pub composite_response: Vec<CompositeSubResponse>,
}

/// Transport to a Salesforce org.
#[async_trait]
pub trait SalesforceConnection: Send + Sync {
    /// Latest known daily API usage. Synchronous: never issues a call.
    fn usage(&self) -> UsageBudget;

    /// Run a SOQL query and return its records.
    async fn query(&self, surface: ApiSurface, soql: &str, options: &QueryOptions)
    -> Result<Vec<Value>>;

    /// Post a composite envelope.
    async fn composite(&self, request: &CompositeRequest) -> Result<CompositeResponse>;

    /// Run a SOSL search and return its records.
    async fn search(&self, _sosl: &str) -> Result<Vec<Value>> {
        Err(OrgCheckError::Unsupported("search"))
    }

    /// List every object of the org.
    async fn describe_global(&self) -> Result<Vec<Value>> {
        Err(OrgCheckError::Unsupported("describe_global"))
    }

    /// Describe one object.
    async fn describe(&self, _surface: ApiSurface, _object: &str) -> Result<Value> {
        Err(OrgCheckError::Unsupported("describe"))
    }

    /// Full names of every member of a metadata type.
    async fn list_metadata(&self, _metadata_type: &str) -> Result<Vec<String>> {
        Err(OrgCheckError::Unsupported("list_metadata"))
    }

    /// Read named members of a metadata type.
    async fn read_metadata(&self, _metadata_type: &str, _members: &[String]) -> Result<Vec<Value>> {
        Err(OrgCheckError::Unsupported("read_metadata"))
    }
}
