//! REST transport over `reqwest`.
//!
//! Speaks the data and Tooling REST endpoints of one org with a bearer
//! token. Daily API usage is tracked from the `Sforce-Limit-Info` header the
//! platform attaches to every response (`api-usage=25/15000`), so
//! [`usage()`](SalesforceConnection::usage) stays synchronous.
//!
//! The SOAP Metadata API is out of reach for this transport; its metadata
//! operations keep the trait's `Unsupported` defaults.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ApiSurface, CompositeRequest, CompositeResponse, QueryOptions, SalesforceConnection};
use crate::gateway::rate_guard::UsageBudget;
use crate::{OrgCheckError, Result};

const LIMIT_INFO_HEADER: &str = "Sforce-Limit-Info";
const QUERY_OPTIONS_HEADER: &str = "Sforce-Query-Options";

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// REST client for one org.
pub struct HttpConnection {
    http: Client,
    instance_url: String,
    api_version: String,
    access_token: String,
    usage: Mutex<Option<(u64, u64)>>,
}

impl HttpConnection {
    /// Create a connection to `instance_url` (e.g.
    /// `https://example.my.salesforce.com`) with a session or OAuth token.
    pub fn new(
        instance_url: impl Into<String>,
        api_version: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| OrgCheckError::Http(e.to_string()))?;

        Ok(Self {
            http,
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            access_token: access_token.into(),
            usage: Mutex::new(None),
        })
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Refresh usage from the `/limits` resource.
    ///
    /// Useful before the first call of a run, when no response has carried
    /// a usage header yet.
    pub async fn fetch_limits(&self) -> Result<UsageBudget> {
        let body = self.get_json(&self.data_url("limits"), &[]).await?;
        let daily = &body["DailyApiRequests"];
        if let (Some(max), Some(remaining)) = (
            daily.get("Max").and_then(Value::as_u64),
            daily.get("Remaining").and_then(Value::as_u64),
        ) {
            self.store_usage(max.saturating_sub(remaining), max);
        }
        Ok(self.usage())
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.instance_url, self.api_version, path
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.access_token))
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        self.send(self.authorized(self.http.get(url).query(query)))
            .await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| OrgCheckError::Http(e.to_string()))?;
        self.record_usage(response.headers());
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| OrgCheckError::Http(e.to_string()))
    }

    fn record_usage(&self, headers: &HeaderMap) {
        let parsed = headers
            .get(LIMIT_INFO_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_limit_info);
        if let Some((used, max)) = parsed {
            self.store_usage(used, max);
        }
    }

    fn store_usage(&self, used: u64, max: u64) {
        if let Ok(mut usage) = self.usage.lock() {
            *usage = Some((used, max));
        }
    }
}

#[async_trait]
impl SalesforceConnection for HttpConnection {
    fn usage(&self) -> UsageBudget {
        match self.usage.lock().ok().and_then(|u| *u) {
            Some((used, max)) => UsageBudget::reported(used, max),
            None => UsageBudget::unavailable(),
        }
    }

    async fn query(
        &self,
        surface: ApiSurface,
        soql: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Value>> {
        let url = self.data_url(&format!("{}query", surface.path_prefix()));
        let request = self
            .authorized(self.http.get(&url).query(&[("q", soql)]))
            .header(
                QUERY_OPTIONS_HEADER,
                format!("batchSize={}", options.batch_size),
            );
        let mut page: QueryPage = serde_json::from_value(self.send(request).await?)?;
        let mut records = std::mem::take(&mut page.records);

        while options.auto_fetch && !page.done && records.len() < options.max_fetch {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            debug!(next = %next, fetched = records.len(), "following query cursor");
            let url = format!("{}{}", self.instance_url, next);
            page = serde_json::from_value(self.get_json(&url, &[]).await?)?;
            records.append(&mut page.records);
        }

        records.truncate(options.max_fetch);
        Ok(records)
    }

    async fn composite(&self, request: &CompositeRequest) -> Result<CompositeResponse> {
        let url = self.data_url("composite");
        let body = self
            .send(self.authorized(self.http.post(&url).json(request)))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn search(&self, sosl: &str) -> Result<Vec<Value>> {
        let body = self.get_json(&self.data_url("search"), &[("q", sosl)]).await?;
        Ok(match body {
            Value::Object(mut map) => match map.remove("searchRecords") {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            },
            // Older API versions answer with a bare array
            Value::Array(records) => records,
            _ => Vec::new(),
        })
    }

    async fn describe_global(&self) -> Result<Vec<Value>> {
        let mut body = self.get_json(&self.data_url("sobjects"), &[]).await?;
        match body.get_mut("sobjects").map(Value::take) {
            Some(Value::Array(objects)) => Ok(objects),
            _ => Err(OrgCheckError::DataError(
                "describe global response has no sobjects array".to_string(),
            )),
        }
    }

    async fn describe(&self, surface: ApiSurface, object: &str) -> Result<Value> {
        let path = format!("{}sobjects/{object}/describe", surface.path_prefix());
        self.get_json(&self.data_url(&path), &[]).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default = "default_done")]
    done: bool,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

/// One error entry of a REST error body.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestError {
    error_code: String,
    #[serde(default)]
    message: String,
}

/// Map a non-success response to [`OrgCheckError::Api`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (error_code, message) = match serde_json::from_str::<Vec<RestError>>(&body) {
        Ok(mut errors) if !errors.is_empty() => {
            let first = errors.swap_remove(0);
            (first.error_code, first.message)
        }
        _ => (format!("HTTP_{}", status.as_u16()), body),
    };
    Err(OrgCheckError::Api {
        status: status.as_u16(),
        error_code,
        message,
    })
}

/// Parse `api-usage=25/15000` out of a `Sforce-Limit-Info` header value.
fn parse_limit_info(header: &str) -> Option<(u64, u64)> {
    header.split(',').find_map(|part| {
        let usage = part.trim().strip_prefix("api-usage=")?;
        let (used, max) = usage.split_once('/')?;
        Some((used.trim().parse().ok()?, max.trim().parse().ok()?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_info_parsing() {
        assert_eq!(parse_limit_info("api-usage=25/15000"), Some((25, 15000)));
        assert_eq!(
            parse_limit_info("per-app-api-usage=2/250(appName=x), api-usage=7/100"),
            Some((7, 100))
        );
        assert_eq!(parse_limit_info("api-usage=oops"), None);
        assert_eq!(parse_limit_info(""), None);
    }

    #[test]
    fn usage_unavailable_until_reported() {
        let conn = HttpConnection::new("https://example.test/", "61.0", "token").unwrap();
        assert_eq!(conn.usage(), UsageBudget::unavailable());
        conn.store_usage(10, 100);
        assert_eq!(conn.usage(), UsageBudget::reported(10, 100));
        assert_eq!(conn.instance_url(), "https://example.test");
    }
}
