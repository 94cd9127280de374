//! Dataset orchestration.
//!
//! [`DatasetManager::run`] resolves a batch of named datasets:
//!
//! 1. a fresh cache entry resolves immediately;
//! 2. otherwise the manager looks up (or creates) the pending retrieval for
//!    the cache key and waits on it.
//!
//! Pending retrievals are spawned tasks behind a [`Shared`] future, held in a
//! `moka` table whose `get_with` makes creation atomic. Every concurrent
//! caller for a key observes the same task, and a caller giving up does not
//! cancel it. Entries stay in the table until [`DatasetManager::clean`].
//! A retrieval still running when its key is cleaned returns its value to
//! existing waiters but does not write it to the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared, try_join_all};
use moka::future::Cache;
use tracing::{debug, info, warn};

use crate::cache::{CacheValue, DataCache};
use crate::gateway::SalesforceGateway;
use crate::logger::{Logger, SectionLogger};
use crate::telemetry;
use crate::traits::{Dataset, DatasetParameters, RowFactory};
use crate::{OrgCheckError, Result};

type Retrieval =
    Shared<BoxFuture<'static, std::result::Result<Arc<CacheValue>, Arc<OrgCheckError>>>>;

/// A retrieval plus the flag `clean` raises to keep its result out of the cache.
#[derive(Clone)]
struct Pending {
    retrieval: Retrieval,
    discarded: Arc<Mutex<bool>>,
}

/// One dataset to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRequest {
    pub alias: String,
    pub cache_key: String,
    pub parameters: DatasetParameters,
}

impl DatasetRequest {
    /// Request `alias`, cached under the alias itself.
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            cache_key: alias.clone(),
            alias,
            parameters: DatasetParameters::new(),
        }
    }

    /// Cache under a different key (e.g. per-parameter variants).
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = key.into();
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Alias → retrieval lookup, built by the caller.
#[derive(Clone, Default)]
pub struct DatasetRegistry {
    datasets: HashMap<String, Arc<dyn Dataset>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset, builder style.
    pub fn with(mut self, alias: impl Into<String>, dataset: Arc<dyn Dataset>) -> Self {
        self.register(alias, dataset);
        self
    }

    pub fn register(&mut self, alias: impl Into<String>, dataset: Arc<dyn Dataset>) {
        self.datasets.insert(alias.into(), dataset);
    }

    pub fn get(&self, alias: &str) -> Option<Arc<dyn Dataset>> {
        self.datasets.get(alias).cloned()
    }

    /// Registered aliases, sorted.
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<_> = self.datasets.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }
}

/// Resolves datasets through the cache, coalescing concurrent retrievals.
pub struct DatasetManager {
    gateway: Arc<SalesforceGateway>,
    cache: Arc<DataCache>,
    registry: DatasetRegistry,
    factory: Arc<dyn RowFactory>,
    logger: Arc<dyn Logger>,
    pending: Cache<String, Pending>,
}

impl DatasetManager {
    pub fn new(
        gateway: Arc<SalesforceGateway>,
        cache: Arc<DataCache>,
        registry: DatasetRegistry,
        factory: Arc<dyn RowFactory>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            gateway,
            cache,
            registry,
            factory,
            logger,
            pending: Cache::builder().build(),
        }
    }

    pub fn cache(&self) -> &DataCache {
        &self.cache
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Whether a retrieval (running or settled) is held for `cache_key`.
    pub fn has_pending(&self, cache_key: &str) -> bool {
        self.pending.contains_key(cache_key)
    }

    /// Resolve every request, keyed by alias.
    ///
    /// Fails with the first failing retrieval. Retrievals still running at
    /// that point carry on in the background and cache their results.
    pub async fn run(
        &self,
        requests: &[DatasetRequest],
    ) -> Result<HashMap<String, Arc<CacheValue>>> {
        info!(datasets = requests.len(), "resolving datasets");
        let values = try_join_all(requests.iter().map(|request| self.resolve(request))).await?;
        Ok(requests
            .iter()
            .map(|request| request.alias.clone())
            .zip(values)
            .collect())
    }

    /// Drop cached values and pending retrievals so the next run refetches.
    pub async fn clean(&self, requests: &[DatasetRequest]) {
        for request in requests {
            if let Some(pending) = self.pending.remove(&request.cache_key).await {
                *pending.discarded.lock().unwrap_or_else(PoisonError::into_inner) = true;
            }
            self.cache.remove(&request.cache_key);
            self.logger.log(
                &request.alias,
                Some(&format!("Cache and pending retrieval cleared for {}", request.cache_key)),
            );
        }
    }

    async fn resolve(&self, request: &DatasetRequest) -> Result<Arc<CacheValue>> {
        let dataset = self
            .registry
            .get(&request.alias)
            .ok_or_else(|| OrgCheckError::UnknownDataset(request.alias.clone()))?;

        if let Some(value) = self.cache.get(&request.cache_key) {
            debug!(alias = %request.alias, key = %request.cache_key, "dataset served from cache");
            return Ok(Arc::new(value));
        }

        let pending = self
            .pending
            .get_with(request.cache_key.clone(), async {
                self.logger.log(
                    &request.alias,
                    Some(&format!("Pending retrieval created for {}", request.cache_key)),
                );
                self.start_retrieval(request, dataset)
            })
            .await;

        pending
            .retrieval
            .await
            .map_err(|source| OrgCheckError::DatasetFailed {
                alias: request.alias.clone(),
                source,
            })
    }

    /// Spawn the retrieval task for one request.
    fn start_retrieval(&self, request: &DatasetRequest, dataset: Arc<dyn Dataset>) -> Pending {
        let gateway = Arc::clone(&self.gateway);
        let cache = Arc::clone(&self.cache);
        let factory = Arc::clone(&self.factory);
        let logger = Arc::clone(&self.logger);
        let request = request.clone();
        let discarded = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&discarded);

        let task = tokio::spawn(async move {
            let section = SectionLogger::new(Arc::clone(&logger), request.alias.clone());
            let result = dataset
                .run(&gateway, factory.as_ref(), &section, &request.parameters)
                .await;

            match result {
                Ok(value) => {
                    metrics::counter!(
                        telemetry::DATASET_RETRIEVALS_TOTAL,
                        "alias" => request.alias.clone(),
                        "status" => "ok"
                    )
                    .increment(1);
                    // Held across the write so `clean` cannot interleave
                    let written = {
                        let discarded = flag.lock().unwrap_or_else(PoisonError::into_inner);
                        (!*discarded).then(|| cache.set(&request.cache_key, Some(&value)))
                    };
                    let key = &request.cache_key;
                    let message = match written {
                        Some(Ok(())) => format!("Cached {} entries under {key}", value.len()),
                        Some(Err(e)) => {
                            warn!(
                                alias = %request.alias,
                                key = %key,
                                error = %e,
                                "failed to cache dataset"
                            );
                            format!("Could not cache {key}: {e}")
                        }
                        None => {
                            debug!(
                                alias = %request.alias,
                                key = %key,
                                "retrieval cleaned while running"
                            );
                            format!("Discarded result for {key}, cleaned while running")
                        }
                    };
                    logger.log(&request.alias, Some(&message));
                    logger.ended(&request.alias, None);
                    Ok(Arc::new(value))
                }
                Err(e) => {
                    metrics::counter!(
                        telemetry::DATASET_RETRIEVALS_TOTAL,
                        "alias" => request.alias.clone(),
                        "status" => "error"
                    )
                    .increment(1);
                    logger.failed(&request.alias, Some(&e));
                    Err(Arc::new(e))
                }
            }
        });

        let retrieval = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(OrgCheckError::DataError(format!(
                    "retrieval task did not complete: {e}"
                )))),
            }
        }
        .boxed()
        .shared();

        Pending {
            retrieval,
            discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_cache_key_to_alias() {
        let request = DatasetRequest::new("apex-classes").parameter("namespace", "acme");
        assert_eq!(request.cache_key, "apex-classes");
        assert_eq!(request.parameters.get("namespace").map(String::as_str), Some("acme"));

        let keyed = DatasetRequest::new("fields").cache_key("fields-Account");
        assert_eq!(keyed.alias, "fields");
        assert_eq!(keyed.cache_key, "fields-Account");
    }

    #[test]
    fn registry_lists_sorted_aliases() {
        struct Empty;

        #[async_trait::async_trait]
        impl Dataset for Empty {
            async fn run(
                &self,
                _gateway: &SalesforceGateway,
                _factory: &dyn RowFactory,
                _logger: &dyn crate::logger::OperationLogger,
                _parameters: &DatasetParameters,
            ) -> Result<CacheValue> {
                Ok(CacheValue::Sequence(Vec::new()))
            }
        }

        let registry = DatasetRegistry::new()
            .with("users", Arc::new(Empty))
            .with("apex-classes", Arc::new(Empty));
        assert_eq!(registry.aliases(), ["apex-classes", "users"]);
        assert!(registry.get("users").is_some());
        assert!(registry.get("nope").is_none());
    }
}
