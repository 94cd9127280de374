//! Rate-governed gateway to a Salesforce org.
//!
//! [`SalesforceGateway`] is the façade dataset code talks to. It combines:
//!
//! - the [`RateGuard`](rate_guard::RateGuard), bracketing every remote call;
//! - the query executor ([`query`]), with cursor and windowed pagination;
//! - the batch planner ([`batch`]), chunking dependency lookups, metadata
//!   reads and at-scale record reads into bounded envelopes.
//!
//! ```text
//!   dataset callback
//!         │
//!         ▼
//!  ┌──────────────────┐   before_call / after_call   ┌───────────┐
//!  │ SalesforceGateway│ ───────────────────────────► │ RateGuard │
//!  └────────┬─────────┘                              └───────────┘
//!           │ query / composite / metadata
//!           ▼
//!  ┌──────────────────────┐
//!  │ SalesforceConnection │ ──► REST / Tooling / Composite
//!  └──────────────────────┘
//! ```
//!
//! The gateway holds no state beyond the guard's trip latch; usage is read
//! from the connection on every call.

pub mod batch;
mod builder;
pub mod query;
pub mod rate_guard;

pub use batch::{DependencyEdge, DependencyGraph, MetadataRequest};
pub use builder::GatewayBuilder;
pub use query::{QuerySettings, SoqlRequest, SoslRequest};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::connection::{ApiSurface, SalesforceConnection};
use crate::telemetry;
use crate::Result;
use rate_guard::{ApiLimitInformation, RateGuard, RateGuardConfig};

/// Default REST API version.
pub const DEFAULT_API_VERSION: &str = "61.0";

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// REST API version, without the leading `v` (e.g. `61.0`).
    pub api_version: String,
    pub query: QuerySettings,
    pub rate_guard: RateGuardConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            query: QuerySettings::default(),
            rate_guard: RateGuardConfig::default(),
        }
    }
}

/// Rate-governed façade over a [`SalesforceConnection`].
pub struct SalesforceGateway {
    connection: Arc<dyn SalesforceConnection>,
    guard: RateGuard,
    config: GatewayConfig,
}

impl SalesforceGateway {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn new(connection: Arc<dyn SalesforceConnection>, config: GatewayConfig) -> Self {
        Self {
            connection,
            guard: RateGuard::new(config.rate_guard.clone()),
            config,
        }
    }

    pub fn api_version(&self) -> &str {
        &self.config.api_version
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn rate_guard(&self) -> &RateGuard {
        &self.guard
    }

    /// Current daily API usage as shown to an operator.
    pub fn daily_api_request_limit(&self) -> ApiLimitInformation {
        self.guard.limit_information(&self.connection.usage())
    }

    /// List every object of the org.
    pub async fn describe_global(&self) -> Result<Vec<Value>> {
        self.guarded("describe_global", |conn| conn.describe_global())
            .await
            .map_err(|e| e.remote("describe_global", "global describe"))
    }

    /// Describe one object.
    pub async fn describe(&self, surface: ApiSurface, object: &str) -> Result<Value> {
        self.guarded("describe", |conn| conn.describe(surface, object))
            .await
            .map_err(|e| e.remote("describe", format!("{surface} object {object}")))
    }

    /// `/services/data/vXX.X/` prefix for composite sub-request urls.
    pub(crate) fn data_path(&self, path: &str) -> String {
        format!("/services/data/v{}/{path}", self.config.api_version)
    }

    /// Run one remote call between the guard's brackets.
    pub(crate) async fn guarded<'a, T, F, Fut>(
        &'a self,
        operation: &'static str,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce(&'a dyn SalesforceConnection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guard.before_call(operation, &self.connection.usage())?;

        let start = Instant::now();
        let result = call(self.connection.as_ref()).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::API_CALLS_TOTAL,
            "operation" => operation,
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::API_CALL_DURATION_SECONDS, "operation" => operation)
            .record(start.elapsed().as_secs_f64());

        self.guard.after_call(operation, &self.connection.usage())?;
        result
    }
}
