//! Remote SPARQL endpoints over blocking HTTP.

use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use url::Url;

use harvest_pool::{Factory, FactoryError, Label};

use super::validate_graph;
use crate::endpoint::DEFAULT_CONNECT_TIMEOUT;

const ASK_QUERY: &str = "ASK {}";
const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// Endpoint URLs and credentials
#[derive(Debug, Clone)]
pub struct SparqlEndpointConfig {
    /// SPARQL query endpoint
    pub query_url: String,

    /// SPARQL update endpoint, if writes are allowed
    pub update_url: Option<String>,

    /// Basic-auth user
    pub username: Option<String>,

    /// Basic-auth password
    pub password: Option<String>,

    /// Timeout for each HTTP request
    pub timeout: Duration,

    /// Honour proxy settings from the environment
    pub use_system_proxy: bool,
}

impl SparqlEndpointConfig {
    /// Read-only, unauthenticated endpoint
    pub fn new(query_url: impl Into<String>) -> Self {
        Self {
            query_url: query_url.into(),
            update_url: None,
            username: None,
            password: None,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            use_system_proxy: true,
        }
    }
}

#[derive(Clone)]
struct Credentials {
    username: String,
    password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn parse_http_url(raw: &str) -> Result<Url, FactoryError> {
    let url = Url::parse(raw)
        .map_err(|e| FactoryError::Config(format!("invalid SPARQL endpoint URL {}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FactoryError::Config(format!(
            "{}: unsupported scheme '{}'",
            raw, other
        ))),
    }
}

/// Opens sessions on a SPARQL endpoint, probing it each time
#[derive(Debug)]
pub struct SparqlEndpointFactory {
    query_url: Url,
    update_url: Option<Url>,
    credentials: Option<Credentials>,
    timeout: Duration,
    use_system_proxy: bool,
}

impl SparqlEndpointFactory {
    /// Create a factory, validating the endpoint URLs up front
    pub fn new(config: SparqlEndpointConfig) -> Result<Self, FactoryError> {
        let query_url = parse_http_url(&config.query_url)?;
        let update_url = config.update_url.as_deref().map(parse_http_url).transpose()?;
        let credentials = config.username.map(|username| Credentials {
            username,
            password: config.password,
        });

        Ok(Self {
            query_url,
            update_url,
            credentials,
            timeout: config.timeout,
            use_system_proxy: config.use_system_proxy,
        })
    }

    /// The query endpoint
    pub fn query_url(&self) -> &Url {
        &self.query_url
    }

    fn client(&self) -> Result<Client, FactoryError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .user_agent(concat!("harvest/", env!("CARGO_PKG_VERSION")));
        if !self.use_system_proxy {
            builder = builder.no_proxy();
        }
        builder
            .build()
            .map_err(|e| FactoryError::Config(format!("cannot build HTTP client: {}", e)))
    }
}

impl Factory for SparqlEndpointFactory {
    type Handle = SparqlSession;

    fn create(&self, label: &Label) -> Result<SparqlSession, FactoryError> {
        validate_graph(label)?;

        let session = SparqlSession {
            client: self.client()?,
            query_url: self.query_url.clone(),
            update_url: self.update_url.clone(),
            credentials: self.credentials.clone(),
            graph: label.clone(),
            broken: false,
        };
        session.ask()?;

        debug!("Opened SPARQL session on {} for graph {}", self.query_url, label);
        Ok(session)
    }

    // Called on every check-in; stays off the network
    fn is_valid(&self, handle: &mut SparqlSession) -> bool {
        !handle.broken
    }

    fn close(&self, handle: SparqlSession) {
        debug!("Closed SPARQL session on {} ({})", handle.query_url, handle.graph);
    }
}

/// An HTTP client bound to one endpoint and graph
#[derive(Debug)]
pub struct SparqlSession {
    client: Client,
    query_url: Url,
    update_url: Option<Url>,
    credentials: Option<Credentials>,
    graph: Label,
    broken: bool,
}

impl SparqlSession {
    /// The graph this session targets
    pub fn graph(&self) -> &Label {
        &self.graph
    }

    /// The query endpoint
    pub fn query_url(&self) -> &Url {
        &self.query_url
    }

    /// The update endpoint, if configured
    pub fn update_url(&self) -> Option<&Url> {
        self.update_url.as_ref()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.username, c.password.as_ref()),
            None => request,
        }
    }

    /// A GET against the query endpoint with credentials applied
    pub fn query_request(&self) -> RequestBuilder {
        self.authorize(self.client.get(self.query_url.clone()))
    }

    /// A POST against the update endpoint with credentials applied
    pub fn update_request(&self) -> Option<RequestBuilder> {
        self.update_url
            .as_ref()
            .map(|url| self.authorize(self.client.post(url.clone())))
    }

    /// Run `ASK {}` and map the answer to a factory error
    pub fn ask(&self) -> Result<(), FactoryError> {
        let response = self
            .query_request()
            .query(&[("query", ASK_QUERY)])
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .send()
            .map_err(|e| FactoryError::Unavailable(format!("{}: {}", self.query_url, e)))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FactoryError::Auth(format!(
                "{} answered {}",
                self.query_url,
                response.status()
            ))),
            StatusCode::NOT_FOUND => Err(FactoryError::Config(format!(
                "no SPARQL endpoint at {}",
                self.query_url
            ))),
            s => Err(FactoryError::Unavailable(format!(
                "{} answered {}",
                self.query_url, s
            ))),
        }
    }

    /// Flag the session so the pool discards it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the session was flagged as unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}
