//! Seams between the orchestrator and dataset code

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::CacheValue;
use crate::gateway::{DependencyGraph, SalesforceGateway};
use crate::logger::OperationLogger;
use crate::Result;

/// Free-form parameters passed to a dataset retrieval.
pub type DatasetParameters = BTreeMap<String, String>;

/// Builds and scores audit rows.
///
/// The orchestrator never looks inside a factory; it hands the same instance
/// to every [`Dataset`].
pub trait RowFactory: Send + Sync {
    /// Build a row from raw properties, with dependency context when the
    /// dataset looked it up.
    fn create(&self, properties: Value, dependencies: Option<&DependencyGraph>) -> Value;

    /// Attach a score to a built row.
    fn compute_score(&self, row: Value) -> Value;
}

/// Row factory that returns properties as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRowFactory;

impl RowFactory for PassthroughRowFactory {
    fn create(&self, properties: Value, _dependencies: Option<&DependencyGraph>) -> Value {
        properties
    }

    fn compute_score(&self, row: Value) -> Value {
        row
    }
}

/// A named retrieval producing one cacheable value.
#[async_trait]
pub trait Dataset: Send + Sync {
    /// Fetch and shape the dataset.
    async fn run(
        &self,
        gateway: &SalesforceGateway,
        factory: &dyn RowFactory,
        logger: &dyn OperationLogger,
        parameters: &DatasetParameters,
    ) -> Result<CacheValue>;
}
