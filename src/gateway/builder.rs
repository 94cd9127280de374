//! Builder for configuring gateway instances

use std::sync::Arc;

use super::query::QuerySettings;
use super::rate_guard::RateGuardConfig;
use super::{GatewayConfig, SalesforceGateway};
use crate::connection::{HttpConnection, SalesforceConnection};
use crate::{OrgCheckError, Result};

/// Builder for [`SalesforceGateway`].
///
/// ```rust,no_run
/// # use orgcheck::{SalesforceGateway, RateGuardConfig};
/// # fn main() -> orgcheck::Result<()> {
/// let gateway = SalesforceGateway::builder()
///     .http("https://example.my.salesforce.com", "00D...!token")
///     .api_version("61.0")
///     .rate_guard(RateGuardConfig::new().fatal_threshold(0.8))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GatewayBuilder {
    connection: Option<Arc<dyn SalesforceConnection>>,
    http: Option<(String, String)>,
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            connection: None,
            http: None,
            config: GatewayConfig::default(),
        }
    }

    /// Use an existing connection.
    pub fn connection(mut self, connection: Arc<dyn SalesforceConnection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Connect over REST with an access token.
    pub fn http(
        mut self,
        instance_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        self.http = Some((instance_url.into(), access_token.into()));
        self
    }

    /// Set the REST API version (e.g. `61.0`).
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = version.into().trim_start_matches('v').to_string();
        self
    }

    /// Set the rate guard thresholds.
    pub fn rate_guard(mut self, config: RateGuardConfig) -> Self {
        self.config.rate_guard = config;
        self
    }

    /// Set query sizing.
    pub fn query_settings(mut self, settings: QuerySettings) -> Self {
        self.config.query = settings;
        self
    }

    /// Build the gateway.
    ///
    /// Fails when no connection is configured or the thresholds are not
    /// ordered `0 < warning <= fatal`.
    pub fn build(self) -> Result<SalesforceGateway> {
        let guard = &self.config.rate_guard;
        if !(guard.warning_threshold > 0.0 && guard.warning_threshold <= guard.fatal_threshold) {
            return Err(OrgCheckError::Configuration(format!(
                "rate guard thresholds must satisfy 0 < warning ({}) <= fatal ({})",
                guard.warning_threshold, guard.fatal_threshold
            )));
        }

        let connection: Arc<dyn SalesforceConnection> = match (self.connection, self.http) {
            (Some(connection), _) => connection,
            (None, Some((instance_url, token))) => Arc::new(HttpConnection::new(
                instance_url,
                self.config.api_version.clone(),
                token,
            )?),
            (None, None) => {
                return Err(OrgCheckError::Configuration(
                    "no connection configured; call .connection() or .http()".to_string(),
                ));
            }
        };

        Ok(SalesforceGateway::new(connection, self.config))
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
