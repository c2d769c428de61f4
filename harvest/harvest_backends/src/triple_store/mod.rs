//! Triple-store sessions, either on a local dataset directory or against a
//! remote SPARQL endpoint. Labels name the graph a session works on.

mod local;
mod remote;

pub use local::{DatasetSession, LocalDatasetConfig, LocalDatasetFactory};
pub use remote::{SparqlEndpointConfig, SparqlEndpointFactory, SparqlSession};

use harvest_pool::{Factory, FactoryError, Label};

/// Check that a graph label is either unlabeled (the default graph) or an absolute IRI
pub fn validate_graph(label: &Label) -> Result<(), FactoryError> {
    if label.is_unlabeled() {
        return Ok(());
    }
    match url::Url::parse(label.as_str()) {
        Ok(iri) if !iri.cannot_be_a_base() || iri.scheme() == "urn" => Ok(()),
        Ok(_) | Err(_) => Err(FactoryError::Config(format!(
            "graph label '{}' is not an absolute IRI",
            label
        ))),
    }
}

/// Either kind of triple-store factory, so one pool type covers both modes
#[derive(Debug)]
pub enum TripleStoreFactory {
    /// Dataset directory on this machine
    Local(LocalDatasetFactory),
    /// SPARQL endpoint over HTTP
    Remote(SparqlEndpointFactory),
}

/// A session from a [`TripleStoreFactory`]
#[derive(Debug)]
pub enum TripleStoreSession {
    /// Session on a local dataset
    Local(DatasetSession),
    /// Session on a remote endpoint
    Remote(SparqlSession),
}

impl TripleStoreSession {
    /// The graph this session targets
    pub fn graph(&self) -> &Label {
        match self {
            TripleStoreSession::Local(s) => s.label(),
            TripleStoreSession::Remote(s) => s.graph(),
        }
    }

    /// Flag the session so the pool discards it
    pub fn mark_broken(&mut self) {
        match self {
            TripleStoreSession::Local(s) => s.mark_broken(),
            TripleStoreSession::Remote(s) => s.mark_broken(),
        }
    }

    /// Whether the session was flagged as unusable
    pub fn is_broken(&self) -> bool {
        match self {
            TripleStoreSession::Local(s) => s.is_broken(),
            TripleStoreSession::Remote(s) => s.is_broken(),
        }
    }
}

impl From<LocalDatasetFactory> for TripleStoreFactory {
    fn from(factory: LocalDatasetFactory) -> Self {
        TripleStoreFactory::Local(factory)
    }
}

impl From<SparqlEndpointFactory> for TripleStoreFactory {
    fn from(factory: SparqlEndpointFactory) -> Self {
        TripleStoreFactory::Remote(factory)
    }
}

impl Factory for TripleStoreFactory {
    type Handle = TripleStoreSession;

    fn create(&self, label: &Label) -> Result<TripleStoreSession, FactoryError> {
        match self {
            TripleStoreFactory::Local(f) => f.create(label).map(TripleStoreSession::Local),
            TripleStoreFactory::Remote(f) => f.create(label).map(TripleStoreSession::Remote),
        }
    }

    fn is_valid(&self, handle: &mut TripleStoreSession) -> bool {
        match (self, handle) {
            (TripleStoreFactory::Local(f), TripleStoreSession::Local(s)) => f.is_valid(s),
            (TripleStoreFactory::Remote(f), TripleStoreSession::Remote(s)) => f.is_valid(s),
            _ => false,
        }
    }

    fn close(&self, handle: TripleStoreSession) {
        match (self, handle) {
            (TripleStoreFactory::Local(f), TripleStoreSession::Local(s)) => f.close(s),
            (TripleStoreFactory::Remote(f), TripleStoreSession::Remote(s)) => f.close(s),
            (_, other) => drop(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_labels() {
        assert!(validate_graph(&Label::unlabeled()).is_ok());
        assert!(validate_graph(&Label::new("http://vitro.mannlib.cornell.edu/default/vitro-kb-2")).is_ok());
        assert!(validate_graph(&Label::new("urn:x-arq:DefaultGraph")).is_ok());

        for bad in ["kb-2", "mailto:someone@example.edu", "/graphs/kb"] {
            assert!(
                matches!(validate_graph(&Label::new(bad)), Err(FactoryError::Config(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_local_sessions_through_the_unified_factory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LocalDatasetConfig::new(dir.path().join("tdb"));
        config.create_if_missing = true;
        let factory: TripleStoreFactory = LocalDatasetFactory::new(config).into();

        let graph = Label::new("http://example.edu/graph/people");
        let mut session = factory.create(&graph).unwrap();
        assert_eq!(session.graph(), &graph);
        assert!(factory.is_valid(&mut session));

        session.mark_broken();
        assert!(session.is_broken());
        assert!(!factory.is_valid(&mut session));
        factory.close(session);
    }
}
