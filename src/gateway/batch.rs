//! Batch planner.
//!
//! Three independent protocols keep requests under platform ceilings:
//!
//! | Operation              | Chunk                | Envelope               |
//! |------------------------|----------------------|------------------------|
//! | dependency lookup      | 100 ids / sub-request| 5 sub-requests / call  |
//! | metadata read          | 10 members / read    | plain parallel reads   |
//! | at-scale record read   | 1 id / sub-request   | 5 sub-requests / call  |
//!
//! Every protocol fires its calls concurrently and merges once all of them
//! have settled.

use std::collections::{HashMap, HashSet};

use futures_util::future::join_all;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::SalesforceGateway;
use crate::connection::{CompositeRequest, CompositeResponse, CompositeSubRequest};
use crate::logger::OperationLogger;
use crate::{OrgCheckError, Result};

/// Platform ceiling on sub-requests per composite call.
pub const MAX_COMPOSITE_SUB_REQUESTS: usize = 5;

/// Ids per dependency sub-request.
pub const DEPENDENCY_IDS_PER_SUB_REQUEST: usize = 100;

/// Members per metadata read.
pub const METADATA_MEMBERS_PER_READ: usize = 10;

/// Wildcard member: every member of the type.
pub const ALL_MEMBERS: &str = "*";

/// Error code tolerated per dependency sub-request.
const DEPENDENCY_TOLERATED_CODE: &str = "UNKNOWN_EXCEPTION";

const DEPENDENCY_FIELDS: &str = "MetadataComponentId, MetadataComponentName, MetadataComponentType, \
RefMetadataComponentId, RefMetadataComponentName, RefMetadataComponentType";

/// One edge of the metadata dependency graph: `id` uses `ref_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ref_id: String,
    pub ref_name: String,
    #[serde(rename = "refType")]
    pub ref_kind: String,
}

impl DependencyEdge {
    fn from_record(record: &Value) -> Option<Self> {
        let field = |name: &str| {
            record
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let id = field("MetadataComponentId");
        let ref_id = field("RefMetadataComponentId");
        if id.is_empty() || ref_id.is_empty() {
            return None;
        }
        Some(Self {
            id,
            name: field("MetadataComponentName"),
            kind: field("MetadataComponentType"),
            ref_id,
            ref_name: field("RefMetadataComponentName"),
            ref_kind: field("RefMetadataComponentType"),
        })
    }
}

/// Result of a dependency lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Unique `(id, ref_id)` edges.
    pub edges: Vec<DependencyEdge>,
    /// Ids whose chunk failed with `UNKNOWN_EXCEPTION`.
    pub ids_in_error: Vec<String>,
}

impl DependencyGraph {
    /// Edges where `id` is the using component.
    pub fn using<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |e| e.id == id)
    }

    /// Edges where `id` is the referenced component.
    pub fn referenced_by<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |e| e.ref_id == id)
    }

    /// Whether the lookup for `id` failed.
    pub fn is_in_error(&self, id: &str) -> bool {
        self.ids_in_error.iter().any(|i| i == id)
    }
}

/// Members of one metadata type to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    pub metadata_type: String,
    pub members: Vec<String>,
}

impl MetadataRequest {
    pub fn new(metadata_type: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            metadata_type: metadata_type.into(),
            members,
        }
    }

    /// Every member of the type.
    pub fn all(metadata_type: impl Into<String>) -> Self {
        Self::new(metadata_type, vec![ALL_MEMBERS.to_string()])
    }

    fn has_wildcard(&self) -> bool {
        self.members.iter().any(|m| m == ALL_MEMBERS)
    }
}

/// Group sub-requests into envelopes of at most
/// [`MAX_COMPOSITE_SUB_REQUESTS`].
pub(crate) fn composite_envelopes(sub_requests: Vec<CompositeSubRequest>) -> Vec<CompositeRequest> {
    sub_requests
        .chunks(MAX_COMPOSITE_SUB_REQUESTS)
        .map(|chunk| CompositeRequest::new(chunk.to_vec()))
        .collect()
}

/// First occurrence of every id, order preserved.
fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn quoted_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(",")
}

impl SalesforceGateway {
    /// Relative url of a query, suitable for a composite sub-request.
    fn composite_query_url(&self, path: &str, soql: &str) -> Result<String> {
        // Only used to borrow Url's form encoding
        let mut url = Url::parse("https://composite.invalid")
            .map_err(|e| OrgCheckError::DataError(e.to_string()))?;
        url.set_path(&self.data_path(path));
        url.query_pairs_mut().append_pair("q", soql);
        Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
    }

    /// Post envelopes concurrently; every call settles before any error is
    /// returned.
    async fn composite_all(
        &self,
        operation: &'static str,
        envelopes: &[CompositeRequest],
        context: &str,
    ) -> Result<Vec<CompositeResponse>> {
        let results = join_all(
            envelopes
                .iter()
                .map(|envelope| self.guarded(operation, |conn| conn.composite(envelope))),
        )
        .await;
        results
            .into_iter()
            .map(|r| r.map_err(|e| e.remote(operation, context.to_string())))
            .collect()
    }

    /// Dependency edges touching `ids`, in either direction.
    ///
    /// Ids are queried 100 per sub-request, 5 sub-requests per composite
    /// call. A sub-request failing with `UNKNOWN_EXCEPTION` marks its ids in
    /// error and the lookup continues; any other failed sub-request aborts.
    /// An edge seen from both directions is emitted once.
    pub async fn dependencies_query(
        &self,
        ids: &[String],
        logger: &dyn OperationLogger,
    ) -> Result<DependencyGraph> {
        let ids = unique_ids(ids);
        if ids.is_empty() {
            return Ok(DependencyGraph::default());
        }

        let mut chunk_ids = HashMap::new();
        let mut sub_requests = Vec::new();
        for (i, chunk) in ids.chunks(DEPENDENCY_IDS_PER_SUB_REQUEST).enumerate() {
            let list = quoted_list(chunk);
            let soql = format!(
                "SELECT {DEPENDENCY_FIELDS} FROM MetadataComponentDependency \
                 WHERE MetadataComponentId IN ({list}) OR RefMetadataComponentId IN ({list})"
            );
            let reference_id = format!("chunk{i}");
            sub_requests.push(CompositeSubRequest::get(
                self.composite_query_url("tooling/query", &soql)?,
                reference_id.clone(),
            ));
            chunk_ids.insert(reference_id, chunk.to_vec());
        }
        let envelopes = composite_envelopes(sub_requests);
        logger.log(&format!(
            "Looking up dependencies of {} ids in {} composite calls",
            ids.len(),
            envelopes.len()
        ));

        let context = format!("{} ids", ids.len());
        let responses = self
            .composite_all("dependencies_query", &envelopes, &context)
            .await?;

        let mut graph = DependencyGraph::default();
        let mut seen = HashSet::new();
        for sub in responses.iter().flat_map(|r| &r.composite_response) {
            if sub.is_success() {
                if sub.body.get("done").and_then(Value::as_bool) == Some(false) {
                    warn!(
                        reference_id = %sub.reference_id,
                        next = ?sub.body.get("nextRecordsUrl"),
                        "dependency sub-request truncated, later pages not fetched"
                    );
                    logger.log(&format!(
                        "Dependencies of {} truncated to the first page",
                        sub.reference_id
                    ));
                }
                let records = sub.body.get("records").and_then(Value::as_array);
                for edge in records.into_iter().flatten().filter_map(DependencyEdge::from_record) {
                    if seen.insert((edge.id.clone(), edge.ref_id.clone())) {
                        graph.edges.push(edge);
                    }
                }
            } else if sub.error_code() == Some(DEPENDENCY_TOLERATED_CODE) {
                let failed = chunk_ids.get(&sub.reference_id).cloned().unwrap_or_default();
                debug!(
                    reference_id = %sub.reference_id,
                    ids = failed.len(),
                    "dependency chunk failed with UNKNOWN_EXCEPTION"
                );
                graph.ids_in_error.extend(failed);
            } else {
                let chunk = chunk_ids.get(&sub.reference_id).map(Vec::len).unwrap_or(0);
                return Err(sub.to_error().remote(
                    "dependencies_query",
                    format!(
                        "sub-request {} ({chunk} ids) returned {}",
                        sub.reference_id, sub.http_status_code
                    ),
                ));
            }
        }

        logger.log(&format!(
            "Found {} dependencies ({} ids in error)",
            graph.edges.len(),
            graph.ids_in_error.len()
        ));
        Ok(graph)
    }

    /// Read metadata members, keyed by type.
    ///
    /// A `*` member is first expanded by listing every member of the type.
    /// Members are then read 10 per call, all calls concurrently.
    pub async fn read_metadata(
        &self,
        requests: Vec<MetadataRequest>,
        logger: &dyn OperationLogger,
    ) -> Result<HashMap<String, Vec<Value>>> {
        // Phase 1: wildcard expansion
        let expanded = join_all(requests.into_iter().map(|mut request| async move {
            if !request.has_wildcard() {
                return Ok(request);
            }
            let listed = self
                .guarded("list_metadata", |conn| conn.list_metadata(&request.metadata_type))
                .await
                .map_err(|e| e.remote("list_metadata", format!("type {}", request.metadata_type)))?;
            request.members.retain(|m| m != ALL_MEMBERS);
            request.members.extend(listed);
            Ok::<_, OrgCheckError>(request)
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        // Phase 2: chunked reads
        let reads: Vec<(&str, &[String])> = expanded
            .iter()
            .flat_map(|request| {
                request
                    .members
                    .chunks(METADATA_MEMBERS_PER_READ)
                    .map(move |chunk| (request.metadata_type.as_str(), chunk))
            })
            .collect();
        logger.log(&format!(
            "Reading metadata of {} types in {} calls",
            expanded.len(),
            reads.len()
        ));

        let results = join_all(reads.iter().map(|&(metadata_type, members)| async move {
            self.guarded("read_metadata", |conn| conn.read_metadata(metadata_type, members))
                .await
                .map(|values| (metadata_type, values))
                .map_err(|e| {
                    e.remote(
                        "read_metadata",
                        format!("type {metadata_type}, members {}", members.join(",")),
                    )
                })
        }))
        .await;

        let mut by_type: HashMap<String, Vec<Value>> = expanded
            .iter()
            .map(|r| (r.metadata_type.clone(), Vec::new()))
            .collect();
        for result in results {
            let (metadata_type, values) = result?;
            by_type.entry(metadata_type.to_string()).or_default().extend(values);
        }
        Ok(by_type)
    }

    /// Read Tooling records one id per sub-request, 5 sub-requests per
    /// composite call.
    ///
    /// Failed records whose error code is in `bypass_codes` are skipped;
    /// any other failure aborts with the type, ids and failing body.
    pub async fn read_metadata_at_scale(
        &self,
        object_type: &str,
        ids: &[String],
        bypass_codes: &[String],
        logger: &dyn OperationLogger,
    ) -> Result<Vec<Value>> {
        let ids = unique_ids(ids);
        let sub_requests = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                CompositeSubRequest::get(
                    self.data_path(&format!("tooling/sobjects/{object_type}/{id}")),
                    format!("record{i}"),
                )
            })
            .collect();
        let envelopes = composite_envelopes(sub_requests);
        logger.log(&format!(
            "Reading {} {object_type} records in {} composite calls",
            ids.len(),
            envelopes.len()
        ));

        let context = format!("type {object_type}, {} ids", ids.len());
        let responses = self
            .composite_all("read_metadata_at_scale", &envelopes, &context)
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for sub in responses.into_iter().flat_map(|r| r.composite_response) {
            if sub.is_success() {
                records.push(sub.body);
                continue;
            }
            let error = sub.to_error();
            if error.is_bypassed_by(bypass_codes) {
                debug!(reference_id = %sub.reference_id, error = %error, "bypassed record error");
                continue;
            }
            return Err(error.remote(
                "read_metadata_at_scale",
                format!(
                    "type {object_type}, ids [{}], body {}",
                    ids.join(","),
                    sub.body
                ),
            ));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_hold_at_most_five() {
        let subs = (0..12)
            .map(|i| CompositeSubRequest::get(format!("/r/{i}"), format!("r{i}")))
            .collect();
        let envelopes = composite_envelopes(subs);
        let sizes: Vec<_> = envelopes.iter().map(|e| e.sub_requests.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(envelopes[2].sub_requests[1].reference_id, "r11");
    }

    #[test]
    fn unique_ids_keeps_first_occurrence() {
        let ids: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_ids(&ids), vec!["b", "a", "c"]);
    }

    #[test]
    fn edge_requires_both_ids() {
        let record =
            serde_json::json!({"MetadataComponentId": "01p1", "RefMetadataComponentId": ""});
        assert!(DependencyEdge::from_record(&record).is_none());
    }

    #[test]
    fn wildcard_detection() {
        assert!(MetadataRequest::all("Profile").has_wildcard());
        assert!(!MetadataRequest::new("Profile", vec!["Admin".into()]).has_wildcard());
    }
}
