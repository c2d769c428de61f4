//! TCP endpoints shared by the socket-based adapters.

use log::trace;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use harvest_pool::FactoryError;

/// Default timeout for connecting and for each read or write during setup
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A host and port to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address literal
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint, rejecting an empty host
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, FactoryError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(FactoryError::Config("host must not be empty".to_string()));
        }
        Ok(Self { host, port })
    }

    /// Take host and port from a URL, falling back to `default_port`
    pub fn from_url(url: &url::Url, default_port: u16) -> Result<Self, FactoryError> {
        let host = url
            .host_str()
            .ok_or_else(|| FactoryError::Config(format!("URL has no host: {}", url)))?;
        Self::new(host, url.port().unwrap_or(default_port))
    }

    /// Open a TCP connection, trying every resolved address in turn
    pub fn connect(&self, timeout: Duration) -> Result<TcpStream, FactoryError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| FactoryError::Unavailable(format!("cannot resolve {}: {}", self, e)))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    trace!("Connected to {} ({})", self, addr);
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => classify_io(&format!("connecting to {}", self), e),
            None => FactoryError::Unavailable(format!("{} resolved to no addresses", self)),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Map an I/O error during connection setup to a factory error
pub(crate) fn classify_io(context: &str, e: io::Error) -> FactoryError {
    use io::ErrorKind::*;

    match e.kind() {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | TimedOut | WouldBlock | AddrNotAvailable => {
            FactoryError::Unavailable(format!("{}: {}", context, e))
        }
        UnexpectedEof => FactoryError::Protocol(format!("{}: connection closed by peer", context)),
        InvalidInput => FactoryError::Config(format!("{}: {}", context, e)),
        _ => FactoryError::Io(e),
    }
}

/// A connected socket with explicit broken-state tracking
#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
    endpoint: Endpoint,
    connected_at: Instant,
    broken: bool,
}

impl TcpSession {
    pub(crate) fn new(stream: TcpStream, endpoint: Endpoint) -> Self {
        Self {
            stream,
            endpoint,
            connected_at: Instant::now(),
            broken: false,
        }
    }

    /// The remote endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// The underlying stream, for protocol layers that write to it
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Time since the connection was established
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Flag the connection as unusable so the pool will not take it back
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection was flagged as unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Check the socket and remember a failure.
    ///
    /// A pending socket error or a peer that has closed the connection marks
    /// the session broken for good, so later checks keep failing even though
    /// the socket error itself is consumed by the first one.
    pub fn check_health(&mut self) -> bool {
        if self.broken {
            return false;
        }
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                trace!("Connection to {} failed: {}", self.endpoint, e);
                self.broken = true;
                return false;
            }
        }
        if self.peer_closed() {
            trace!("Connection to {} closed by peer", self.endpoint);
            self.broken = true;
        }
        !self.broken
    }

    /// Peek without blocking; EOF means the peer hung up
    fn peer_closed(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let closed = match self.stream.peek(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        };
        closed || self.stream.set_nonblocking(false).is_err()
    }

    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("Shutdown of connection to {} failed: {}", self.endpoint, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    /// Serve exactly one connection on a loopback port with `handler`
    pub(crate) fn serve_once<F, T>(handler: F) -> (u16, JoinHandle<T>)
    where
        F: FnOnce(TcpStream) -> T + Send + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let join = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream)
        });
        (port, join)
    }

    /// A loopback port nobody listens on
    pub(crate) fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_url() {
        let url = url::Url::parse("ldap://ldap.example.edu").unwrap();
        let endpoint = Endpoint::from_url(&url, 389).unwrap();
        assert_eq!(endpoint.host, "ldap.example.edu");
        assert_eq!(endpoint.port, 389);

        let url = url::Url::parse("ldap://ldap.example.edu:10389/").unwrap();
        assert_eq!(Endpoint::from_url(&url, 389).unwrap().port, 10389);
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(matches!(Endpoint::new(" ", 5432), Err(FactoryError::Config(_))));
    }

    #[test]
    fn test_connect_refused_is_unavailable() {
        let endpoint = Endpoint::new("127.0.0.1", test_support::closed_port()).unwrap();
        let result = endpoint.connect(Duration::from_millis(500));
        assert!(matches!(result, Err(FactoryError::Unavailable(_))));
    }

    #[test]
    fn test_connect_and_session_health() {
        let (port, server) = test_support::serve_once(|_stream| {});
        let endpoint = Endpoint::new("127.0.0.1", port).unwrap();
        let stream = endpoint.connect(Duration::from_secs(1)).unwrap();
        server.join().unwrap();

        let mut session = TcpSession::new(stream, endpoint);
        assert!(!session.is_broken());
        session.mark_broken();
        assert!(session.is_broken());
        assert!(!session.check_health());
    }

    #[test]
    fn test_health_failure_is_remembered() {
        let (hang_up, hang_up_rx) = std::sync::mpsc::channel::<()>();
        let (port, server) = test_support::serve_once(move |stream| {
            let _ = hang_up_rx.recv();
            drop(stream);
        });
        let endpoint = Endpoint::new("127.0.0.1", port).unwrap();
        let stream = endpoint.connect(Duration::from_secs(1)).unwrap();
        let mut session = TcpSession::new(stream, endpoint);

        assert!(session.check_health());
        assert!(session.check_health());

        hang_up.send(()).unwrap();
        server.join().unwrap();
        while session.check_health() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(session.is_broken());
        assert!(!session.check_health());
    }

    #[test]
    fn test_classify_io() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(classify_io("x", refused), FactoryError::Unavailable(_)));
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(classify_io("x", eof), FactoryError::Protocol(_)));
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(classify_io("x", other), FactoryError::Io(_)));
    }

    #[test]
    fn test_ipv6_display() {
        let endpoint = Endpoint::new("::1", 1433).unwrap();
        assert_eq!(endpoint.to_string(), "[::1]:1433");
    }
}
