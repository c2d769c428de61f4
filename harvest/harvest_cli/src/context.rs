//! Application context: one pool per configured backend.
//!
//! Pools are created once here and handed to consumers as `Arc`s. Dropping
//! the context drains every pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use harvest_backends::{
    DirectoryFactory, LocalDatasetFactory, RelationalFactory, SparqlEndpointFactory,
    TripleStoreFactory,
};
use harvest_pool::{Checkin, Factory, Label, ManagedPool, PoolConfig, PoolError, ResourcePool};
use tracing::{debug, info, warn};

use crate::config::{HarvestConfig, TripleStoreBackend};

/// A pool together with the labels it serves, behind a uniform interface
pub trait ManagedBackend: Send + Sync {
    /// Backend kind as named in the configuration file
    fn kind(&self) -> &'static str;

    /// The pool itself
    fn pool(&self) -> &dyn ManagedPool;

    /// Labels the pool is warmed with
    fn labels(&self) -> &[Label];

    /// Pre-fill the pool, returning how many handles were created
    fn warm(&self) -> Result<usize, PoolError>;

    /// Check out and return one handle per label
    fn exercise(&self) -> Result<usize, PoolError>;
}

struct Backend<F: Factory> {
    kind: &'static str,
    pool: Arc<ResourcePool<F>>,
    labels: Vec<Label>,
}

impl<F: Factory> Backend<F> {
    fn labels_or_unlabeled(&self) -> Vec<Label> {
        if self.labels.is_empty() {
            vec![Label::unlabeled()]
        } else {
            self.labels.clone()
        }
    }
}

impl<F: Factory> ManagedBackend for Backend<F> {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn pool(&self) -> &dyn ManagedPool {
        self.pool.as_ref()
    }

    fn labels(&self) -> &[Label] {
        &self.labels
    }

    fn warm(&self) -> Result<usize, PoolError> {
        self.pool.warm(self.labels.iter().cloned())
    }

    fn exercise(&self) -> Result<usize, PoolError> {
        let mut exercised = 0;
        for label in self.labels_or_unlabeled() {
            let handle = self.pool.checkout(label.clone())?;
            match handle.release()? {
                Checkin::Pooled => {}
                Checkin::Discarded(discarded) => {
                    warn!(
                        "Pool '{}' discarded the handle for {} on check-in",
                        self.pool.name(),
                        discarded.label
                    );
                }
                Checkin::Closed => return Err(PoolError::PoolShutdown),
            }
            exercised += 1;
        }
        Ok(exercised)
    }
}

/// Every backend pool of the application
#[derive(Default)]
pub struct AppContext {
    directories: BTreeMap<String, Arc<ResourcePool<DirectoryFactory>>>,
    relational: BTreeMap<String, Arc<ResourcePool<RelationalFactory>>>,
    triple_stores: BTreeMap<String, Arc<ResourcePool<TripleStoreFactory>>>,
    backends: Vec<Arc<dyn ManagedBackend>>,
}

impl AppContext {
    /// Build one pool per backend, or only the backend named `only`.
    ///
    /// Pools are created empty; call [`ManagedBackend::warm`] to pre-fill them.
    pub fn build(config: &HarvestConfig, only: Option<&str>) -> Result<Self> {
        if let Some(name) = only {
            if !config.backends().iter().any(|(_, n, _)| *n == name) {
                return Err(anyhow!("No backend named '{}' in the configuration", name));
            }
        }
        let selected = |name: &str| only.map_or(true, |only| only == name);
        let mut context = AppContext::default();

        for entry in config.directory.iter().filter(|e| selected(&e.name)) {
            let factory = DirectoryFactory::new(entry.to_backend(&config.pool)?)
                .with_context(|| format!("Failed to set up directory backend '{}'", entry.name))?;
            let pool = context.register(
                "directory",
                factory,
                config.pool.pool_config(&entry.name, entry.pool_size),
                &entry.labels,
            )?;
            context.directories.insert(entry.name.clone(), pool);
        }

        for entry in config.relational.iter().filter(|e| selected(&e.name)) {
            let factory = RelationalFactory::new(entry.to_backend(&config.pool)?)
                .with_context(|| format!("Failed to set up relational backend '{}'", entry.name))?;
            let pool = context.register(
                "relational",
                factory,
                config.pool.pool_config(&entry.name, entry.pool_size),
                &entry.labels,
            )?;
            context.relational.insert(entry.name.clone(), pool);
        }

        for entry in config.triple_store.iter().filter(|e| selected(&e.name)) {
            let factory: TripleStoreFactory = match entry.to_backend(&config.pool)? {
                TripleStoreBackend::Local(local) => LocalDatasetFactory::new(local).into(),
                TripleStoreBackend::Remote(remote) => SparqlEndpointFactory::new(remote)
                    .with_context(|| {
                        format!("Failed to set up triple store backend '{}'", entry.name)
                    })?
                    .into(),
            };
            let pool = context.register(
                "triple_store",
                factory,
                config.pool.pool_config(&entry.name, entry.pool_size),
                &entry.graphs,
            )?;
            context.triple_stores.insert(entry.name.clone(), pool);
        }

        info!("Application context ready with {} pool(s)", context.backends.len());
        Ok(context)
    }

    fn register<F: Factory>(
        &mut self,
        kind: &'static str,
        factory: F,
        pool_config: PoolConfig,
        labels: &[String],
    ) -> Result<Arc<ResourcePool<F>>> {
        let name = pool_config.name.clone();
        let pool = Arc::new(
            ResourcePool::with_config(factory, pool_config)
                .with_context(|| format!("Failed to create pool for backend '{}'", name))?,
        );
        debug!("Created {} pool '{}'", kind, name);

        self.backends.push(Arc::new(Backend {
            kind,
            pool: Arc::clone(&pool),
            labels: labels.iter().map(Label::from).collect(),
        }));
        Ok(pool)
    }

    /// Pool for the named directory backend
    pub fn directory(&self, name: &str) -> Option<Arc<ResourcePool<DirectoryFactory>>> {
        self.directories.get(name).cloned()
    }

    /// Pool for the named relational backend
    pub fn relational(&self, name: &str) -> Option<Arc<ResourcePool<RelationalFactory>>> {
        self.relational.get(name).cloned()
    }

    /// Pool for the named triple store backend
    pub fn triple_store(&self, name: &str) -> Option<Arc<ResourcePool<TripleStoreFactory>>> {
        self.triple_stores.get(name).cloned()
    }

    /// Every backend, in configuration order
    pub fn backends(&self) -> &[Arc<dyn ManagedBackend>] {
        &self.backends
    }

    /// Drain every pool; safe to call more than once
    pub fn drain_all(&self) -> usize {
        let closed: usize = self.backends.iter().map(|b| b.pool().drain()).sum();
        if closed > 0 {
            info!("Drained {} pool(s), closed {} handle(s)", self.backends.len(), closed);
        }
        closed
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.drain_all();
    }
}
