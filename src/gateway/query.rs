//! Query executor.
//!
//! Two pagination strategies, chosen per request:
//!
//! - **Standard**: one call with cursor auto-continuation up to
//!   [`QuerySettings::max_fetch`]; the connection follows `nextRecordsUrl`.
//! - **Windowed**: for entities that reject cursor continuation. Repeats
//!   `... WHERE field > 'last' ORDER BY field LIMIT window` until a page comes
//!   back short. The first bound is [`PAGINATION_SENTINEL`].
//!
//! A list of requests runs concurrently. Results keep the input order, and
//! every query settles before the first failure is propagated.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::SalesforceGateway;
use crate::connection::{ApiSurface, QueryOptions};
use crate::logger::OperationLogger;
use crate::{OrgCheckError, Result};

/// Lower bound of the first window; sorts before any record id.
pub const PAGINATION_SENTINEL: &str = "000000000000000";

/// Query sizing.
///
/// ```rust
/// # use orgcheck::QuerySettings;
/// let settings = QuerySettings::new().window_size(500);
/// assert_eq!(settings.window_size, 500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Global cap on records collected by cursor continuation. Default: 500,000.
    pub max_fetch: usize,
    /// Server batch size hint. Default: 2,000.
    pub batch_size: usize,
    /// Rows per window in windowed pagination. Default: 2,000.
    pub window_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_fetch: 500_000,
            batch_size: 2_000,
            window_size: 2_000,
        }
    }
}

impl QuerySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_fetch(mut self, n: usize) -> Self {
        self.max_fetch = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn window_size(mut self, n: usize) -> Self {
        self.window_size = n;
        self
    }
}

/// One SOQL query to run.
///
/// ```rust
/// # use orgcheck::SoqlRequest;
/// let request = SoqlRequest::new("SELECT Id, Name FROM ApexClass")
///     .tooling()
///     .bypass("INVALID_TYPE")
///     .paginate_by("Id");
/// assert_eq!(request.entity_name(), "ApexClass");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoqlRequest {
    pub query: String,
    pub surface: ApiSurface,
    /// Error codes that degrade to an empty result instead of failing.
    pub bypass_codes: Vec<String>,
    /// Unique field used for windowed pagination.
    pub pagination_field: Option<String>,
}

impl SoqlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            surface: ApiSurface::Standard,
            bypass_codes: Vec::new(),
            pagination_field: None,
        }
    }

    /// Target the Tooling API.
    pub fn tooling(mut self) -> Self {
        self.surface = ApiSurface::Tooling;
        self
    }

    /// Tolerate an error code.
    pub fn bypass(mut self, code: impl Into<String>) -> Self {
        self.bypass_codes.push(code.into());
        self
    }

    /// Paginate by windows over a unique field instead of cursors.
    pub fn paginate_by(mut self, field: impl Into<String>) -> Self {
        self.pagination_field = Some(field.into());
        self
    }

    /// Entity queried, for progress reporting.
    pub fn entity_name(&self) -> &str {
        entity_name(&self.query)
    }
}

/// One SOSL search to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoslRequest {
    pub search: String,
    pub bypass_codes: Vec<String>,
}

impl SoslRequest {
    pub fn new(search: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            bypass_codes: Vec::new(),
        }
    }

    pub fn bypass(mut self, code: impl Into<String>) -> Self {
        self.bypass_codes.push(code.into());
        self
    }
}

/// Words of `query` outside parentheses and string literals.
///
/// Subqueries and quoted values are skipped, so keywords found here belong to
/// the outer statement.
fn top_level_words(query: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = None;

    for (i, c) in query.char_indices() {
        if quoted {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => quoted = false,
                _ => {}
            }
            continue;
        }
        if !(c.is_whitespace() || matches!(c, '(' | ')' | ',' | '\'')) {
            if depth == 0 && start.is_none() {
                start = Some(i);
            }
            continue;
        }
        if let Some(s) = start.take() {
            words.push(&query[s..i]);
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '\'' => quoted = true,
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push(&query[s..]);
    }
    words
}

/// Word after the outer `FROM`.
pub(crate) fn entity_name(query: &str) -> &str {
    top_level_words(query)
        .into_iter()
        .skip_while(|word| !word.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .unwrap_or("unknown")
}

/// Window query for `base`, starting after `cursor`.
fn window_query(base: &str, field: &str, cursor: &str, window: usize) -> String {
    let filtered = top_level_words(base)
        .iter()
        .any(|word| word.eq_ignore_ascii_case("WHERE"));
    let connector = if filtered { "AND" } else { "WHERE" };
    format!("{base} {connector} {field} > '{cursor}' ORDER BY {field} LIMIT {window}")
}

/// Settled/failed counters for progress messages.
struct Progress {
    total: usize,
    done: AtomicUsize,
    failed: AtomicUsize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            done: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn settle(&self, ok: bool, kind: &str, entity: &str, logger: &dyn OperationLogger) {
        if ok {
            self.done.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let done = self.done.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let pending = self.total.saturating_sub(done + failed);
        logger.log(&format!(
            "{kind} on {entity} settled. {} queries: {done} done, {failed} failed, {pending} pending",
            self.total
        ));
    }
}

/// First error in input order, or all values.
fn settle_all<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    results.into_iter().collect()
}

impl SalesforceGateway {
    /// Run SOQL queries concurrently.
    ///
    /// Returns one record list per request, in input order. A failing query
    /// does not cancel its siblings; the first failure (in input order) is
    /// returned once every query has settled.
    pub async fn soql_query(
        &self,
        requests: &[SoqlRequest],
        logger: &dyn OperationLogger,
    ) -> Result<Vec<Vec<Value>>> {
        let progress = Progress::new(requests.len());
        logger.log(&format!("Starting {} SOQL queries", requests.len()));

        let results = join_all(requests.iter().map(|request| {
            let progress = &progress;
            async move {
                let entity = request.entity_name();
                logger.debug(&format!("querying {entity}: {}", request.query));
                let result = self.execute_soql(request).await;
                progress.settle(result.is_ok(), "SOQL", entity, logger);
                result
            }
        }))
        .await;

        settle_all(results)
    }

    /// Run SOSL searches concurrently, same ordering and failure rules as
    /// [`soql_query`](Self::soql_query).
    pub async fn sosl_query(
        &self,
        requests: &[SoslRequest],
        logger: &dyn OperationLogger,
    ) -> Result<Vec<Vec<Value>>> {
        let progress = Progress::new(requests.len());

        let results = join_all(requests.iter().map(|request| {
            let progress = &progress;
            async move {
                let result = self
                    .guarded("sosl_query", |conn| conn.search(&request.search))
                    .await;
                let result = match result {
                    Err(e) if e.is_bypassed_by(&request.bypass_codes) => {
                        debug!(search = %request.search, error = %e, "bypassed search error");
                        Ok(Vec::new())
                    }
                    other => other.map_err(|e| e.remote("sosl_query", request.search.clone())),
                };
                progress.settle(result.is_ok(), "SOSL", "search", logger);
                result
            }
        }))
        .await;

        settle_all(results)
    }

    /// One request, with its by-pass policy applied.
    async fn execute_soql(&self, request: &SoqlRequest) -> Result<Vec<Value>> {
        let result = match &request.pagination_field {
            Some(field) => self.windowed_query(request, field).await,
            None => self.standard_query(request).await,
        };
        match result {
            Err(e) if e.is_bypassed_by(&request.bypass_codes) => {
                debug!(
                    entity = request.entity_name(),
                    error = %e,
                    "bypassed query error, returning no records"
                );
                Ok(Vec::new())
            }
            Err(e) => {
                let context = format!(
                    "{} query on {}: {}",
                    request.surface,
                    request.entity_name(),
                    request.query
                );
                Err(e.remote("soql_query", context))
            }
            ok => ok,
        }
    }

    async fn standard_query(&self, request: &SoqlRequest) -> Result<Vec<Value>> {
        let settings = &self.config.query;
        let options = QueryOptions::auto_fetch(settings.max_fetch, settings.batch_size);
        self.guarded("soql_query", |conn| {
            conn.query(request.surface, &request.query, &options)
        })
        .await
    }

    async fn windowed_query(&self, request: &SoqlRequest, field: &str) -> Result<Vec<Value>> {
        let window = self.config.query.window_size.max(1);
        let options = QueryOptions::single_page(window);
        let mut records = Vec::new();
        let mut cursor = PAGINATION_SENTINEL.to_string();

        loop {
            let soql = window_query(&request.query, field, &cursor, window);
            let page = self
                .guarded("soql_query", |conn| conn.query(request.surface, &soql, &options))
                .await?;
            let page_len = page.len();
            let last = page
                .last()
                .map(|row| row.get(field).and_then(Value::as_str).map(str::to_owned));
            records.extend(page);

            if page_len < window {
                break;
            }
            match last.flatten() {
                Some(next) => cursor = next,
                None => {
                    return Err(OrgCheckError::DataError(format!(
                        "window on {} returned a row without pagination field {field}",
                        request.entity_name()
                    )));
                }
            }
            debug!(
                entity = request.entity_name(),
                fetched = records.len(),
                cursor = %cursor,
                "next window"
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_name_extraction() {
        assert_eq!(entity_name("SELECT Id FROM Account"), "Account");
        assert_eq!(
            entity_name("SELECT Id, Name FROM ApexClass WHERE ManageableState = 'unmanaged'"),
            "ApexClass"
        );
        assert_eq!(entity_name("select id from user where isactive = true"), "user");
        assert_eq!(
            entity_name("SELECT Id, (SELECT Id FROM Contacts) FROM Account"),
            "Account"
        );
        assert_eq!(entity_name("FIND {acme}"), "unknown");
        assert_eq!(
            entity_name("SELECT Id FROM Account WHERE Id IN (SELECT AccountId FROM Contact)"),
            "Account"
        );
        assert_eq!(entity_name("SELECT Id\nFROM\tCustomField\nWHERE x = 1"), "CustomField");
        assert_eq!(entity_name("SELECT Id FROM"), "unknown");
    }

    #[test]
    fn top_level_words_skip_subqueries_and_literals() {
        assert_eq!(
            top_level_words("SELECT Id, (SELECT Id FROM Contacts WHERE x = 1) FROM Account"),
            ["SELECT", "Id", "FROM", "Account"]
        );
        assert_eq!(
            top_level_words("SELECT Id FROM Case WHERE Subject = 'it\\'s ( WHERE'"),
            ["SELECT", "Id", "FROM", "Case", "WHERE", "Subject", "="]
        );
    }

    #[test]
    fn window_query_appends_bound() {
        assert_eq!(
            window_query("SELECT Id FROM Field", "Id", PAGINATION_SENTINEL, 2000),
            "SELECT Id FROM Field WHERE Id > '000000000000000' ORDER BY Id LIMIT 2000"
        );
        assert_eq!(
            window_query("SELECT Id FROM Field WHERE Type = 'x'", "Id", "a01", 10),
            "SELECT Id FROM Field WHERE Type = 'x' AND Id > 'a01' ORDER BY Id LIMIT 10"
        );
        assert_eq!(
            window_query("SELECT Id\nFROM Field\nWHERE Type = 'x'", "Id", "a01", 10),
            "SELECT Id\nFROM Field\nWHERE Type = 'x' AND Id > 'a01' ORDER BY Id LIMIT 10"
        );
        assert_eq!(
            window_query(
                "SELECT Id, (SELECT Id FROM Items WHERE Ok = true) FROM Box",
                "Id",
                "a",
                5
            ),
            "SELECT Id, (SELECT Id FROM Items WHERE Ok = true) FROM Box \
             WHERE Id > 'a' ORDER BY Id LIMIT 5"
        );
        assert_eq!(
            window_query("SELECT Id FROM Note WHERE Body = ' WHERE '", "Id", "a", 5),
            "SELECT Id FROM Note WHERE Body = ' WHERE ' AND Id > 'a' ORDER BY Id LIMIT 5"
        );
    }

    #[test]
    fn request_builder() {
        let request = SoqlRequest::new("SELECT Id FROM Flow").tooling().bypass("INVALID_TYPE");
        assert_eq!(request.surface, ApiSurface::Tooling);
        assert_eq!(request.bypass_codes, vec!["INVALID_TYPE".to_string()]);
        assert!(request.pagination_field.is_none());
    }
}
