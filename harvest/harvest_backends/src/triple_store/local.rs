//! Local datasets in an embedded Oxigraph store.
//!
//! One store is opened per dataset directory and shared by every session the
//! factory creates; the storage engine allows a single opener per directory.
//! Each session addresses the named graph its label names, or the default
//! graph when unlabeled.

use log::{debug, info, warn};
use oxigraph::model::{GraphName, GraphNameRef, NamedNode, QuadRef, Triple};
use oxigraph::store::{StorageError, Store};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use harvest_pool::{Factory, FactoryError, Label};

use super::validate_graph;

/// Written by the storage engine when it initialises a store
const STORE_MARKER: &str = "CURRENT";

/// Where a local dataset lives
#[derive(Debug, Clone)]
pub struct LocalDatasetConfig {
    /// Dataset directory
    pub location: PathBuf,

    /// Initialise a new store when the directory holds none
    pub create_if_missing: bool,
}

impl LocalDatasetConfig {
    /// Configuration for an existing dataset
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            create_if_missing: false,
        }
    }
}

/// Opens sessions on a dataset
pub struct LocalDatasetFactory {
    config: LocalDatasetConfig,

    /// Opened on first use, then shared by all sessions
    store: Mutex<Option<Store>>,
}

impl LocalDatasetFactory {
    /// Create a factory; the store is opened with the first session
    pub fn new(config: LocalDatasetConfig) -> Self {
        Self {
            config,
            store: Mutex::new(None),
        }
    }

    /// The dataset directory
    pub fn location(&self) -> &Path {
        &self.config.location
    }

    fn prepare_directory(&self) -> Result<(), FactoryError> {
        let location = &self.config.location;
        if location.exists() && !location.is_dir() {
            return Err(FactoryError::Config(format!(
                "dataset {} is not a directory",
                location.display()
            )));
        }
        if location.join(STORE_MARKER).is_file() {
            return Ok(());
        }
        if !self.config.create_if_missing {
            return Err(FactoryError::Config(if location.exists() {
                format!("{} does not hold a dataset", location.display())
            } else {
                format!("dataset {} does not exist", location.display())
            }));
        }

        debug!("Creating dataset {}", location.display());
        fs::create_dir_all(location)?;
        Ok(())
    }

    fn open_store(&self) -> Result<Store, FactoryError> {
        let mut shared = self.store.lock();
        if let Some(store) = shared.as_ref() {
            return Ok(store.clone());
        }

        self.prepare_directory()?;
        let store = Store::open(&self.config.location)
            .map_err(|e| storage_error(&self.config.location, e))?;
        info!("Opened dataset {}", self.config.location.display());
        *shared = Some(store.clone());
        Ok(store)
    }
}

impl Factory for LocalDatasetFactory {
    type Handle = DatasetSession;

    fn create(&self, label: &Label) -> Result<DatasetSession, FactoryError> {
        let graph = graph_name(label)?;
        let store = self.open_store()?;
        if let GraphName::NamedNode(node) = &graph {
            store
                .insert_named_graph(node.as_ref())
                .map_err(|e| storage_error(&self.config.location, e))?;
        }

        debug!(
            "Opened dataset session on {} for graph {}",
            self.config.location.display(),
            label
        );
        Ok(DatasetSession {
            store,
            root: self.config.location.clone(),
            label: label.clone(),
            graph,
            broken: false,
        })
    }

    fn is_valid(&self, handle: &mut DatasetSession) -> bool {
        if handle.broken {
            return false;
        }
        match handle.graph_exists() {
            Ok(true) => true,
            Ok(false) => {
                debug!("Graph {} is gone from {}", handle.label, handle.root.display());
                false
            }
            Err(e) => {
                warn!("Dataset {} failed a read: {}", handle.root.display(), e);
                handle.broken = true;
                false
            }
        }
    }

    fn close(&self, handle: DatasetSession) {
        if let Err(e) = handle.store.flush() {
            warn!("Failed to flush dataset {}: {}", handle.root.display(), e);
        }
        debug!("Closed dataset session on {} ({})", handle.root.display(), handle.label);
    }
}

impl fmt::Debug for LocalDatasetFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDatasetFactory")
            .field("config", &self.config)
            .field("open", &self.store.lock().is_some())
            .finish()
    }
}

/// A session on one graph of a local dataset
pub struct DatasetSession {
    store: Store,
    root: PathBuf,
    label: Label,
    graph: GraphName,
    broken: bool,
}

impl DatasetSession {
    /// The dataset directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The label this session was created for
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// The graph this session reads and writes
    pub fn graph(&self) -> GraphNameRef<'_> {
        self.graph.as_ref()
    }

    /// The whole store, for queries across graphs
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Add a triple to this session's graph; false if it was already there
    pub fn insert(&self, triple: &Triple) -> Result<bool, FactoryError> {
        self.store
            .insert(self.quad(triple))
            .map_err(|e| storage_error(&self.root, e))
    }

    /// Whether this session's graph holds `triple`
    pub fn contains(&self, triple: &Triple) -> Result<bool, FactoryError> {
        self.store
            .contains(self.quad(triple))
            .map_err(|e| storage_error(&self.root, e))
    }

    /// Number of triples in this session's graph
    pub fn triple_count(&self) -> Result<usize, FactoryError> {
        let mut count = 0;
        for quad in self
            .store
            .quads_for_pattern(None, None, None, Some(self.graph.as_ref()))
        {
            quad.map_err(|e| storage_error(&self.root, e))?;
            count += 1;
        }
        Ok(count)
    }

    /// Flag the session so the pool discards it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the session was flagged as unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn quad<'a>(&'a self, triple: &'a Triple) -> QuadRef<'a> {
        QuadRef::new(
            triple.subject.as_ref(),
            triple.predicate.as_ref(),
            triple.object.as_ref(),
            self.graph.as_ref(),
        )
    }

    /// Cheap read that fails when the store is unusable
    fn graph_exists(&self) -> Result<bool, StorageError> {
        match &self.graph {
            GraphName::NamedNode(node) => self.store.contains_named_graph(node.as_ref()),
            _ => self
                .store
                .quads_for_pattern(None, None, None, Some(GraphNameRef::DefaultGraph))
                .next()
                .transpose()
                .map(|_| true),
        }
    }
}

impl fmt::Debug for DatasetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetSession")
            .field("root", &self.root)
            .field("label", &self.label)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// The graph a label addresses: the default graph, or a named graph IRI
fn graph_name(label: &Label) -> Result<GraphName, FactoryError> {
    validate_graph(label)?;
    if label.is_unlabeled() {
        return Ok(GraphName::DefaultGraph);
    }
    NamedNode::new(label.as_str())
        .map(GraphName::NamedNode)
        .map_err(|e| FactoryError::Config(format!("graph label '{}' is not an IRI: {}", label, e)))
}

fn storage_error(location: &Path, e: StorageError) -> FactoryError {
    match e {
        StorageError::Corruption(e) => {
            FactoryError::Config(format!("dataset {} is corrupt: {}", location.display(), e))
        }
        StorageError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            FactoryError::Config(format!("dataset {}: {}", location.display(), e))
        }
        other => FactoryError::Unavailable(format!(
            "dataset {} is unavailable: {}",
            location.display(),
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::Literal;

    const KB2: &str = "http://vitro.mannlib.cornell.edu/default/vitro-kb-2";
    const INFERENCES: &str = "http://vitro.mannlib.cornell.edu/default/vitro-kb-inf";

    fn new_dataset(dir: &Path) -> LocalDatasetFactory {
        let mut config = LocalDatasetConfig::new(dir.join("tdb"));
        config.create_if_missing = true;
        LocalDatasetFactory::new(config)
    }

    fn label_triple(name: &str) -> Triple {
        Triple::new(
            NamedNode::new_unchecked("http://vivo.example.edu/individual/n1"),
            NamedNode::new_unchecked("http://www.w3.org/2000/01/rdf-schema#label"),
            Literal::new_simple_literal(name),
        )
    }

    #[test]
    fn test_missing_dataset_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let factory = LocalDatasetFactory::new(LocalDatasetConfig::new(dir.path().join("tdb")));
        let result = factory.create(&Label::new(KB2));
        assert!(matches!(result, Err(FactoryError::Config(_))));
        assert!(!dir.path().join("tdb").exists());
    }

    #[test]
    fn test_directory_without_store_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("graphs")).unwrap();
        fs::write(dir.path().join("default.nt"), b"<a> <b> <c> .\n").unwrap();

        let factory = LocalDatasetFactory::new(LocalDatasetConfig::new(dir.path()));
        let result = factory.create(&Label::new(KB2));
        assert!(matches!(result, Err(FactoryError::Config(_))), "{:?}", result);
    }

    #[test]
    fn test_create_if_missing_initialises_store() {
        let dir = tempfile::tempdir().unwrap();
        let factory = new_dataset(dir.path());

        let session = factory.create(&Label::new(KB2)).unwrap();
        assert!(dir.path().join("tdb").join(STORE_MARKER).is_file());
        assert_eq!(session.root(), dir.path().join("tdb"));
        assert_eq!(session.label(), &Label::new(KB2));

        assert!(session.insert(&label_triple("Ada Lovelace")).unwrap());
        assert!(!session.insert(&label_triple("Ada Lovelace")).unwrap());
        assert!(session.contains(&label_triple("Ada Lovelace")).unwrap());
        assert_eq!(session.triple_count().unwrap(), 1);
        factory.close(session);
    }

    #[test]
    fn test_sessions_share_store_but_not_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let factory = new_dataset(dir.path());

        let kb2 = factory.create(&Label::new(KB2)).unwrap();
        let inferences = factory.create(&Label::new(INFERENCES)).unwrap();
        let default = factory.create(&Label::unlabeled()).unwrap();
        assert_eq!(default.graph(), GraphNameRef::DefaultGraph);

        kb2.insert(&label_triple("Grace Hopper")).unwrap();
        assert_eq!(kb2.triple_count().unwrap(), 1);
        assert_eq!(inferences.triple_count().unwrap(), 0);
        assert_eq!(default.triple_count().unwrap(), 0);
        assert!(!inferences.contains(&label_triple("Grace Hopper")).unwrap());

        // Both named graphs exist in the one store
        assert!(inferences
            .store()
            .contains_named_graph(NamedNode::new_unchecked(KB2).as_ref())
            .unwrap());

        for session in [kb2, inferences, default] {
            factory.close(session);
        }
    }

    #[test]
    fn test_reopened_dataset_keeps_triples() {
        let dir = tempfile::tempdir().unwrap();
        {
            let factory = new_dataset(dir.path());
            let session = factory.create(&Label::new(KB2)).unwrap();
            session.insert(&label_triple("Katherine Johnson")).unwrap();
            factory.close(session);
        }

        let factory = LocalDatasetFactory::new(LocalDatasetConfig::new(dir.path().join("tdb")));
        let session = factory.create(&Label::new(KB2)).unwrap();
        assert!(session.contains(&label_triple("Katherine Johnson")).unwrap());
        factory.close(session);
    }

    #[test]
    fn test_dataset_open_elsewhere_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let owner = new_dataset(dir.path());
        let session = owner.create(&Label::new(KB2)).unwrap();

        let other = new_dataset(dir.path());
        let result = other.create(&Label::new(KB2));
        assert!(matches!(result, Err(FactoryError::Unavailable(_))), "{:?}", result);

        owner.close(session);
        drop(owner);
        let session = other.create(&Label::new(KB2)).unwrap();
        other.close(session);
    }

    #[test]
    fn test_file_is_not_a_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tdb");
        fs::write(&file, b"not a directory").unwrap();
        let mut config = LocalDatasetConfig::new(file);
        config.create_if_missing = true;
        let factory = LocalDatasetFactory::new(config);
        assert!(matches!(factory.create(&Label::unlabeled()), Err(FactoryError::Config(_))));
    }

    #[test]
    fn test_non_iri_label_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let factory = new_dataset(dir.path());
        assert!(matches!(factory.create(&Label::new("kb-2")), Err(FactoryError::Config(_))));
    }

    #[test]
    fn test_dropped_graph_invalidates_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = new_dataset(dir.path());

        let mut session = factory.create(&Label::new(KB2)).unwrap();
        assert!(factory.is_valid(&mut session));
        session
            .store()
            .remove_named_graph(NamedNode::new_unchecked(KB2).as_ref())
            .unwrap();
        assert!(!factory.is_valid(&mut session));

        // A fresh session recreates the graph
        let mut replacement = factory.create(&Label::new(KB2)).unwrap();
        assert!(factory.is_valid(&mut replacement));
        factory.close(session);
        factory.close(replacement);
    }

    #[test]
    fn test_mark_broken_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let factory = new_dataset(dir.path());

        let mut session = factory.create(&Label::unlabeled()).unwrap();
        assert!(factory.is_valid(&mut session));
        session.mark_broken();
        assert!(session.is_broken());
        assert!(!factory.is_valid(&mut session));
        factory.close(session);
    }
}
