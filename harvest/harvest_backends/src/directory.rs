//! Directory service connections: LDAPv3 over plain TCP with a simple bind.

use log::{debug, trace};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

use harvest_pool::{Factory, FactoryError, Label};

use crate::endpoint::{classify_io, Endpoint, TcpSession, DEFAULT_CONNECT_TIMEOUT};

/// Default LDAP port
pub const DEFAULT_LDAP_PORT: u16 = 389;

/// Largest LDAP message accepted during the bind exchange
const MAX_MESSAGE_LEN: usize = 1 << 20;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_ENUMERATED: u8 = 0x0A;
const TAG_BIND_REQUEST: u8 = 0x60;
const TAG_BIND_RESPONSE: u8 = 0x61;
const TAG_UNBIND_REQUEST: u8 = 0x42;
const TAG_SIMPLE_AUTH: u8 = 0x80;

const RESULT_SUCCESS: u8 = 0;
const RESULT_INVALID_CREDENTIALS: u8 = 49;
const RESULT_BUSY: u8 = 51;
const RESULT_UNAVAILABLE: u8 = 52;
const RESULT_UNWILLING_TO_PERFORM: u8 = 53;

/// Connection parameters for one directory service
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// `ldap://host[:port]`
    pub url: String,

    /// DN to bind as; empty for an anonymous bind
    pub bind_dn: String,

    /// Bind password
    pub password: String,

    /// Search base for unlabeled connections
    pub base_dn: String,

    /// Named search bases selectable by label
    pub search_bases: BTreeMap<String, String>,

    /// Timeout for the connect and the bind exchange
    pub connect_timeout: Duration,
}

impl DirectoryConfig {
    /// Configuration with an anonymous bind and no named search bases
    pub fn new(url: impl Into<String>, base_dn: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bind_dn: String::new(),
            password: String::new(),
            base_dn: base_dn.into(),
            search_bases: BTreeMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Opens bound directory connections
#[derive(Debug)]
pub struct DirectoryFactory {
    config: DirectoryConfig,
    endpoint: Endpoint,
}

impl DirectoryFactory {
    /// Create a factory, validating the URL up front
    pub fn new(config: DirectoryConfig) -> Result<Self, FactoryError> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| FactoryError::Config(format!("invalid directory URL {}: {}", config.url, e)))?;

        match url.scheme() {
            "ldap" => {}
            "ldaps" => {
                return Err(FactoryError::Config(format!(
                    "{}: ldaps is not supported, use ldap://",
                    config.url
                )))
            }
            other => {
                return Err(FactoryError::Config(format!(
                    "{}: unsupported scheme '{}'",
                    config.url, other
                )))
            }
        }

        let endpoint = Endpoint::from_url(&url, DEFAULT_LDAP_PORT)?;
        Ok(Self { config, endpoint })
    }

    /// The directory server address
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The search base a label selects
    pub fn search_base(&self, label: &Label) -> Result<&str, FactoryError> {
        if label.is_unlabeled() {
            return Ok(&self.config.base_dn);
        }
        self.config
            .search_bases
            .get(label.as_str())
            .map(String::as_str)
            .ok_or_else(|| {
                FactoryError::Config(format!(
                    "no search base configured for label '{}' on {}",
                    label, self.endpoint
                ))
            })
    }
}

impl Factory for DirectoryFactory {
    type Handle = DirectoryConnection;

    fn create(&self, label: &Label) -> Result<DirectoryConnection, FactoryError> {
        let base_dn = self.search_base(label)?.to_string();
        let stream = self.endpoint.connect(self.config.connect_timeout)?;
        let mut session = TcpSession::new(stream, self.endpoint.clone());

        let message_id = 1;
        let request = encode_bind_request(message_id, &self.config.bind_dn, &self.config.password);
        session
            .stream_mut()
            .write_all(&request)
            .map_err(|e| classify_io("sending bind request", e))?;

        let response = read_message(session.stream_mut())?;
        let (code, diagnostic) = parse_bind_response(&response, message_id)?;

        match code {
            RESULT_SUCCESS => {
                debug!(
                    "Bound to {} as '{}' (base {})",
                    self.endpoint, self.config.bind_dn, base_dn
                );
                Ok(DirectoryConnection {
                    session,
                    bind_dn: self.config.bind_dn.clone(),
                    base_dn,
                    next_message_id: message_id + 1,
                })
            }
            RESULT_INVALID_CREDENTIALS => Err(FactoryError::Auth(format!(
                "bind as '{}' rejected by {}: {}",
                self.config.bind_dn, self.endpoint, diagnostic
            ))),
            RESULT_BUSY | RESULT_UNAVAILABLE | RESULT_UNWILLING_TO_PERFORM => {
                Err(FactoryError::Unavailable(format!(
                    "{} refused the bind (result code {}): {}",
                    self.endpoint, code, diagnostic
                )))
            }
            other => Err(FactoryError::Protocol(format!(
                "bind to {} failed with result code {}: {}",
                self.endpoint, other, diagnostic
            ))),
        }
    }

    fn is_valid(&self, handle: &mut DirectoryConnection) -> bool {
        handle.session.check_health()
    }

    fn close(&self, mut handle: DirectoryConnection) {
        let id = handle.next_message_id();
        if let Err(e) = handle.session.stream_mut().write_all(&encode_unbind_request(id)) {
            trace!("Unbind from {} failed: {}", self.endpoint, e);
        }
        handle.session.shutdown();
        debug!("Closed directory connection to {}", self.endpoint);
    }
}

/// A bound connection to a directory server
#[derive(Debug)]
pub struct DirectoryConnection {
    session: TcpSession,
    bind_dn: String,
    base_dn: String,
    next_message_id: u32,
}

impl DirectoryConnection {
    /// The DN this connection is bound as
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// The search base selected by the connection's label
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Allocate the next LDAP message id
    pub fn next_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// The socket, for the LDAP operation layer
    pub fn session(&mut self) -> &mut TcpSession {
        &mut self.session
    }

    /// Flag the connection so the pool discards it
    pub fn mark_broken(&mut self) {
        self.session.mark_broken();
    }

    /// Whether the connection was flagged as unusable
    pub fn is_broken(&self) -> bool {
        self.session.is_broken()
    }
}

fn push_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        buf.push(0x80 | (bytes.len() - skip) as u8);
        buf.extend_from_slice(&bytes[skip..]);
    }
}

fn push_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    push_length(buf, value.len());
    buf.extend_from_slice(value);
}

fn encode_integer(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    let mut out = bytes[skip..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

fn envelope(message_id: u32, op_tag: u8, op: &[u8]) -> Vec<u8> {
    let mut message = Vec::new();
    push_tlv(&mut message, TAG_INTEGER, &encode_integer(message_id));
    push_tlv(&mut message, op_tag, op);

    let mut out = Vec::with_capacity(message.len() + 6);
    push_tlv(&mut out, TAG_SEQUENCE, &message);
    out
}

pub(crate) fn encode_bind_request(message_id: u32, bind_dn: &str, password: &str) -> Vec<u8> {
    let mut bind = Vec::new();
    push_tlv(&mut bind, TAG_INTEGER, &[3]);
    push_tlv(&mut bind, TAG_OCTET_STRING, bind_dn.as_bytes());
    push_tlv(&mut bind, TAG_SIMPLE_AUTH, password.as_bytes());
    envelope(message_id, TAG_BIND_REQUEST, &bind)
}

pub(crate) fn encode_unbind_request(message_id: u32) -> Vec<u8> {
    envelope(message_id, TAG_UNBIND_REQUEST, &[])
}

/// Read one complete LDAP message, returning the body of the outer sequence
fn read_message(stream: &mut impl Read) -> Result<Vec<u8>, FactoryError> {
    let io = |e| classify_io("reading bind response", e);

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).map_err(io)?;
    if head[0] != TAG_SEQUENCE {
        return Err(FactoryError::Protocol(format!(
            "expected an LDAP message, got tag 0x{:02x}",
            head[0]
        )));
    }

    let len = if head[1] < 0x80 {
        head[1] as usize
    } else {
        let count = (head[1] & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(FactoryError::Protocol("unsupported BER length encoding".into()));
        }
        let mut bytes = [0u8; 4];
        stream.read_exact(&mut bytes[4 - count..]).map_err(io)?;
        u32::from_be_bytes(bytes) as usize
    };

    if len > MAX_MESSAGE_LEN {
        return Err(FactoryError::Protocol(format!("LDAP message of {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(io)?;
    Ok(body)
}

struct BerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, FactoryError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| FactoryError::Protocol("truncated BER element".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn element(&mut self) -> Result<(u8, &'a [u8]), FactoryError> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 {
                return Err(FactoryError::Protocol("unsupported BER length encoding".into()));
            }
            let mut len = 0usize;
            for _ in 0..count {
                len = (len << 8) | self.byte()? as usize;
            }
            len
        };

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| FactoryError::Protocol("truncated BER element".into()))?;
        let value = &self.buf[self.pos..end];
        self.pos = end;
        Ok((tag, value))
    }

    fn expect_tag(&mut self, expected: u8, what: &str) -> Result<&'a [u8], FactoryError> {
        let (tag, value) = self.element()?;
        if tag != expected {
            return Err(FactoryError::Protocol(format!(
                "expected {} (tag 0x{:02x}), got tag 0x{:02x}",
                what, expected, tag
            )));
        }
        Ok(value)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

fn decode_integer(bytes: &[u8]) -> Result<u32, FactoryError> {
    if bytes.is_empty() || bytes.len() > 5 {
        return Err(FactoryError::Protocol("malformed message id".into()));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64) as u32)
}

/// Decode a BindResponse into its result code and diagnostic message
fn parse_bind_response(body: &[u8], expected_id: u32) -> Result<(u8, String), FactoryError> {
    let mut message = BerReader::new(body);
    let id = decode_integer(message.expect_tag(TAG_INTEGER, "message id")?)?;
    if id != expected_id {
        return Err(FactoryError::Protocol(format!(
            "bind response for message {} while waiting for {}",
            id, expected_id
        )));
    }

    let mut op = BerReader::new(message.expect_tag(TAG_BIND_RESPONSE, "bind response")?);
    let code = match op.expect_tag(TAG_ENUMERATED, "result code")? {
        [code] => *code,
        _ => return Err(FactoryError::Protocol("malformed result code".into())),
    };

    let _matched_dn = op.expect_tag(TAG_OCTET_STRING, "matched DN")?;
    let diagnostic = if op.is_empty() {
        String::new()
    } else {
        String::from_utf8_lossy(op.expect_tag(TAG_OCTET_STRING, "diagnostic message")?).into_owned()
    };

    Ok((code, diagnostic))
}
