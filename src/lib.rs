//! orgcheck - retrieval core for Salesforce org audits
//!
//! Three layers sit between audit datasets and an org:
//!
//! - [`SalesforceGateway`]: every remote call, bracketed by a [`RateGuard`]
//!   that stops the run before the daily API quota is exhausted. It runs
//!   SOQL with cursor or windowed pagination and plans composite batches
//!   for dependency lookups and metadata reads.
//! - [`DataCache`]: a persistent, compressed key-value cache with a TTL that
//!   heals itself when entries are half-written.
//! - [`DatasetManager`]: resolves named datasets through the cache, running
//!   at most one retrieval per cache key at a time.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use orgcheck::{
//!     CacheValue, DataCache, Dataset, DatasetManager, DatasetParameters, DatasetRegistry,
//!     DatasetRequest, OperationLogger, PassthroughRowFactory, RowFactory, SalesforceGateway,
//!     SoqlRequest, TracingLogger,
//! };
//!
//! struct ApexClasses;
//!
//! #[async_trait]
//! impl Dataset for ApexClasses {
//!     async fn run(
//!         &self,
//!         gateway: &SalesforceGateway,
//!         factory: &dyn RowFactory,
//!         logger: &dyn OperationLogger,
//!         _parameters: &DatasetParameters,
//!     ) -> orgcheck::Result<CacheValue> {
//!         let request = SoqlRequest::new("SELECT Id, Name FROM ApexClass")
//!             .tooling()
//!             .paginate_by("Id");
//!         let records = gateway.soql_query(&[request], logger).await?;
//!         let rows = records
//!             .into_iter()
//!             .flatten()
//!             .map(|record| factory.compute_score(factory.create(record, None)))
//!             .collect();
//!         Ok(CacheValue::Sequence(rows))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> orgcheck::Result<()> {
//!     let gateway = SalesforceGateway::builder()
//!         .http("https://example.my.salesforce.com", "00D...!token")
//!         .build()?;
//!
//!     let manager = DatasetManager::new(
//!         Arc::new(gateway),
//!         Arc::new(DataCache::in_memory()),
//!         DatasetRegistry::new().with("apex-classes", Arc::new(ApexClasses)),
//!         Arc::new(PassthroughRowFactory),
//!         Arc::new(TracingLogger),
//!     );
//!
//!     let datasets = manager.run(&[DatasetRequest::new("apex-classes")]).await?;
//!     println!("{} classes", datasets["apex-classes"].len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod logger;
pub mod orchestrator;
pub mod telemetry;
pub mod traits;
pub mod version;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheEntryDetails, CacheValue, DataCache};
pub use connection::{ApiSurface, SalesforceConnection};
pub use error::{OrgCheckError, Result};
pub use gateway::rate_guard::{
    ApiLimitInformation, RateGuard, RateGuardConfig, UsageBudget, UsageConfidence, UsageZone,
};
pub use gateway::{
    DependencyEdge, DependencyGraph, GatewayBuilder, MetadataRequest, QuerySettings,
    SalesforceGateway, SoqlRequest, SoslRequest,
};
pub use logger::{Logger, OperationLogger, QuietLogger, SectionLogger, TracingLogger};
pub use orchestrator::{DatasetManager, DatasetRegistry, DatasetRequest};
pub use traits::{Dataset, DatasetParameters, PassthroughRowFactory, RowFactory};
