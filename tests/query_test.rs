//! Query executor tests against an in-memory org.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use orgcheck::connection::{CompositeRequest, CompositeResponse, QueryOptions};
use orgcheck::{
    ApiSurface, OrgCheckError, QuerySettings, QuietLogger, Result, SalesforceConnection,
    SalesforceGateway, SoqlRequest, SoslRequest, UsageBudget,
};

// ============================================================================
// Fake org
// ============================================================================

/// Serves `records` (sorted by Id) and understands just enough SOQL for
/// windowed pagination: `Id > '...'` and `LIMIT n`.
struct FakeOrg {
    records: Vec<Value>,
    queries: Mutex<Vec<(ApiSurface, String, QueryOptions)>>,
    completed: AtomicUsize,
}

impl FakeOrg {
    fn with_records(count: usize) -> Self {
        Self {
            records: (0..count).map(|i| json!({"Id": format!("a{i:014}")})).collect(),
            queries: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    fn queries(&self) -> Vec<(ApiSurface, String, QueryOptions)> {
        self.queries.lock().unwrap().clone()
    }
}

fn between<'a>(text: &'a str, start: &str, end: char) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let rest = &text[from..];
    Some(&rest[..rest.find(end).unwrap_or(rest.len())])
}

fn api_error(code: &str) -> OrgCheckError {
    OrgCheckError::Api {
        status: 400,
        error_code: code.to_string(),
        message: format!("{code} raised by fake org"),
    }
}

#[async_trait]
impl SalesforceConnection for FakeOrg {
    fn usage(&self) -> UsageBudget {
        UsageBudget::reported(10, 100_000)
    }

    async fn query(
        &self,
        surface: ApiSurface,
        soql: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Value>> {
        self.queries
            .lock()
            .unwrap()
            .push((surface, soql.to_string(), *options));

        if soql.contains("FROM Broken") {
            return Err(api_error("INVALID_TYPE"));
        }
        if soql.contains("FROM Slow") {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            return Ok(vec![json!({"Name": "slow"})]);
        }
        if let Some(entity) = between(soql, "FROM Named", ' ') {
            self.completed.fetch_add(1, Ordering::SeqCst);
            return Ok(vec![json!({"Name": entity})]);
        }

        let cursor = between(soql, "Id > '", '\'').unwrap_or("");
        let limit = between(soql, "LIMIT ", ' ')
            .and_then(|n| n.parse().ok())
            .unwrap_or(usize::MAX);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .iter()
            .filter(|r| r["Id"].as_str().is_some_and(|id| id > cursor))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn composite(&self, _request: &CompositeRequest) -> Result<CompositeResponse> {
        Ok(CompositeResponse::default())
    }

    async fn search(&self, sosl: &str) -> Result<Vec<Value>> {
        if sosl.contains("forbidden") {
            return Err(api_error("INSUFFICIENT_ACCESS"));
        }
        Ok(vec![json!({"Id": "001000000000001", "attributes": {"type": "Account"}})])
    }
}

fn gateway(org: Arc<FakeOrg>) -> SalesforceGateway {
    SalesforceGateway::builder().connection(org).build().unwrap()
}

// ============================================================================
// Windowed pagination
// ============================================================================

#[tokio::test]
async fn windowed_pagination_collects_every_record_in_order() {
    let org = Arc::new(FakeOrg::with_records(10_012));
    let gateway = gateway(org.clone());

    let request = SoqlRequest::new("SELECT Id FROM ApexClass")
        .tooling()
        .paginate_by("Id");
    let mut results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();
    let records = results.pop().unwrap();

    assert_eq!(records.len(), 10_012);
    let ids: Vec<&str> = records.iter().map(|r| r["Id"].as_str().unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids[0], "a00000000000000");
    assert_eq!(ids[10_011], "a00000000010011");

    let queries = org.queries();
    assert_eq!(queries.len(), 6);
    assert!(queries.iter().all(|(surface, _, _)| *surface == ApiSurface::Tooling));
    assert_eq!(
        queries[0].1,
        "SELECT Id FROM ApexClass WHERE Id > '000000000000000' ORDER BY Id LIMIT 2000"
    );
    assert_eq!(
        queries[1].1,
        "SELECT Id FROM ApexClass WHERE Id > 'a00000000001999' ORDER BY Id LIMIT 2000"
    );
    assert!(queries.iter().all(|(_, _, options)| !options.auto_fetch));
}

#[tokio::test]
async fn windowed_pagination_extends_existing_filter() {
    let org = Arc::new(FakeOrg::with_records(3));
    let gateway = gateway(org.clone());

    let request =
        SoqlRequest::new("SELECT Id FROM Flow WHERE Status = 'Active'").paginate_by("Id");
    let results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();

    assert_eq!(results[0].len(), 3);
    let queries = org.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].1.contains("WHERE Status = 'Active' AND Id > '000000000000000'"));
}

#[tokio::test]
async fn windowed_pagination_handles_multiline_filter() {
    let org = Arc::new(FakeOrg::with_records(3));
    let gateway = gateway(org.clone());

    let request = SoqlRequest::new(
        "SELECT Id, DeveloperName\nFROM CustomField\nWHERE ManageableState = 'unmanaged'",
    )
    .tooling()
    .paginate_by("Id");
    let results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();

    assert_eq!(results[0].len(), 3);
    let soql = &org.queries()[0].1;
    assert_eq!(soql.matches("WHERE").count(), 1);
    assert!(soql.ends_with(
        "WHERE ManageableState = 'unmanaged' AND Id > '000000000000000' ORDER BY Id LIMIT 2000"
    ));
}

#[tokio::test]
async fn windowed_pagination_ignores_filters_inside_subqueries() {
    let org = Arc::new(FakeOrg::with_records(3));
    let gateway = gateway(org.clone());

    let request =
        SoqlRequest::new("SELECT Id, (SELECT Id FROM Contacts WHERE IsActive = true) FROM Account")
            .paginate_by("Id");
    gateway.soql_query(&[request], &QuietLogger).await.unwrap();

    assert_eq!(
        org.queries()[0].1,
        "SELECT Id, (SELECT Id FROM Contacts WHERE IsActive = true) FROM Account \
         WHERE Id > '000000000000000' ORDER BY Id LIMIT 2000"
    );
}

#[tokio::test]
async fn window_size_is_configurable() {
    let org = Arc::new(FakeOrg::with_records(25));
    let gateway = SalesforceGateway::builder()
        .connection(org.clone())
        .query_settings(QuerySettings::new().window_size(10))
        .build()
        .unwrap();

    let request = SoqlRequest::new("SELECT Id FROM Account").paginate_by("Id");
    let results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();

    assert_eq!(results[0].len(), 25);
    assert_eq!(org.queries().len(), 3);
}

#[tokio::test]
async fn exact_multiple_needs_one_empty_window() {
    let org = Arc::new(FakeOrg::with_records(4_000));
    let gateway = gateway(org.clone());

    let request = SoqlRequest::new("SELECT Id FROM Account").paginate_by("Id");
    let results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();

    assert_eq!(results[0].len(), 4_000);
    assert_eq!(org.queries().len(), 3);
}

// ============================================================================
// Standard queries
// ============================================================================

#[tokio::test]
async fn standard_query_asks_connection_to_follow_cursors() {
    let org = Arc::new(FakeOrg::with_records(42));
    let gateway = gateway(org.clone());

    let results = gateway
        .soql_query(&[SoqlRequest::new("SELECT Id FROM Account")], &QuietLogger)
        .await
        .unwrap();
    assert_eq!(results[0].len(), 42);

    let queries = org.queries();
    assert_eq!(queries.len(), 1);
    let (surface, soql, options) = &queries[0];
    assert_eq!(*surface, ApiSurface::Standard);
    assert_eq!(soql, "SELECT Id FROM Account");
    assert!(options.auto_fetch);
    assert_eq!(options.max_fetch, 500_000);
    assert_eq!(options.batch_size, 2_000);
}

#[tokio::test]
async fn results_follow_input_order() {
    let org = Arc::new(FakeOrg::with_records(0));
    let gateway = gateway(org.clone());

    let requests = [
        SoqlRequest::new("SELECT Name FROM Slow"),
        SoqlRequest::new("SELECT Name FROM NamedFirst WHERE x = 1"),
        SoqlRequest::new("SELECT Name FROM NamedSecond WHERE x = 1"),
    ];
    let results = gateway.soql_query(&requests, &QuietLogger).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0][0]["Name"], "slow");
    assert_eq!(results[1][0]["Name"], "First");
    assert_eq!(results[2][0]["Name"], "Second");
}

// ============================================================================
// Failures and by-pass
// ============================================================================

#[tokio::test]
async fn bypassed_error_code_yields_empty_result() {
    let org = Arc::new(FakeOrg::with_records(5));
    let gateway = gateway(org.clone());

    let requests = [
        SoqlRequest::new("SELECT Id FROM Broken").bypass("INVALID_TYPE"),
        SoqlRequest::new("SELECT Id FROM Account"),
    ];
    let results = gateway.soql_query(&requests, &QuietLogger).await.unwrap();

    assert!(results[0].is_empty());
    assert_eq!(results[1].len(), 5);
}

#[tokio::test]
async fn bypass_applies_to_windowed_queries() {
    let org = Arc::new(FakeOrg::with_records(0));
    let gateway = gateway(org.clone());

    let request = SoqlRequest::new("SELECT Id FROM Broken")
        .paginate_by("Id")
        .bypass("INVALID_TYPE");
    let results = gateway.soql_query(&[request], &QuietLogger).await.unwrap();
    assert!(results[0].is_empty());
}

#[tokio::test]
async fn other_error_codes_fail_with_query_context() {
    let org = Arc::new(FakeOrg::with_records(0));
    let gateway = gateway(org.clone());

    let request = SoqlRequest::new("SELECT Id FROM Broken").bypass("INVALID_FIELD");
    let err = gateway.soql_query(&[request], &QuietLogger).await.unwrap_err();

    match &err {
        OrgCheckError::RemoteCallFailed {
            operation, context, ..
        } => {
            assert_eq!(*operation, "soql_query");
            assert!(context.contains("Broken"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.error_code(), Some("INVALID_TYPE"));
}

#[tokio::test]
async fn failure_waits_for_siblings_to_settle() {
    let org = Arc::new(FakeOrg::with_records(0));
    let gateway = gateway(org.clone());

    let requests = [
        SoqlRequest::new("SELECT Id FROM Broken"),
        SoqlRequest::new("SELECT Name FROM Slow"),
    ];
    let err = gateway.soql_query(&requests, &QuietLogger).await.unwrap_err();

    assert_eq!(err.error_code(), Some("INVALID_TYPE"));
    assert_eq!(org.completed.load(Ordering::SeqCst), 1);
}

// ============================================================================
// SOSL
// ============================================================================

#[tokio::test]
async fn sosl_search_and_bypass() {
    let org = Arc::new(FakeOrg::with_records(0));
    let gateway = gateway(org.clone());

    let requests = [
        SoslRequest::new("FIND {acme} IN ALL FIELDS"),
        SoslRequest::new("FIND {forbidden}").bypass("INSUFFICIENT_ACCESS"),
    ];
    let results = gateway.sosl_query(&requests, &QuietLogger).await.unwrap();
    assert_eq!(results[0].len(), 1);
    assert!(results[1].is_empty());

    let err = gateway
        .sosl_query(&[SoslRequest::new("FIND {forbidden}")], &QuietLogger)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some("INSUFFICIENT_ACCESS"));
}

#[test]
fn entity_name_is_taken_from_from_clause() {
    assert_eq!(SoqlRequest::new("SELECT Id FROM Account").entity_name(), "Account");
    assert_eq!(
        SoqlRequest::new("SELECT Id, (SELECT Id FROM Contacts) FROM Account WHERE x = 1")
            .entity_name(),
        "Account"
    );
    assert_eq!(
        SoqlRequest::new("SELECT Id FROM Account WHERE Id IN (SELECT AccountId FROM Contact)")
            .entity_name(),
        "Account"
    );
    assert_eq!(SoqlRequest::new("SELECT Id").entity_name(), "unknown");
}
