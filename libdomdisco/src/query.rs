use async_trait::async_trait;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Ns,
    Soa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NameError,
    ServerFailure,
    Refused,
    Other(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Answer,
    Authority,
    Additional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Ns(String),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Soa { mname: String },
}

impl RecordData {
    pub fn address(&self) -> Option<IpAddr> {
        match self {
            RecordData::A(ip) => Some(IpAddr::V4(*ip)),
            RecordData::Aaaa(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        }
    }
}

/// One resource record. Owner names are lowercase without the trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub section: Section,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub rcode: Rcode,
    pub authoritative: bool,
    pub records: Vec<Record>,
}

impl Response {
    pub fn new(rcode: Rcode) -> Self {
        Self {
            rcode,
            authoritative: false,
            records: Vec::new(),
        }
    }

    /// Authoritative NXDOMAIN.
    pub fn name_error() -> Self {
        Self::new(Rcode::NameError).authoritative()
    }

    pub fn authoritative(mut self) -> Self {
        self.authoritative = true;
        self
    }

    pub fn with_record(mut self, section: Section, name: &str, data: RecordData) -> Self {
        self.records.push(Record {
            name: normalize_owner(name),
            section,
            data,
        });
        self
    }

    pub fn records_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter(move |record| record.name == name)
    }

    pub fn has_soa(&self, section: Section) -> bool {
        self.records
            .iter()
            .any(|record| record.section == section && matches!(record.data, RecordData::Soa { .. }))
    }
}

pub(crate) fn normalize_owner(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Timed out waiting for {server}")]
    Timeout { server: IpAddr },
    #[error("Connection to {server} failed: {source}")]
    Connection {
        server: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("Malformed response from {server}: {reason}")]
    Malformed { server: IpAddr, reason: String },
    #[error("Cannot query invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Unable to open a local socket: {0}")]
    Socket(#[source] io::Error),
}

impl QueryError {
    /// Whether the failure means no further queries can be made at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueryError::Socket(_))
    }
}

/// Sends a single question to a single server.
///
/// Implementations resolve nothing themselves: `server` is always a literal
/// address, and retries beyond a truncation fallback belong to the caller.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    async fn query(
        &self,
        server: IpAddr,
        qname: &str,
        record_type: RecordType,
        timeout: Duration,
    ) -> Result<Response, QueryError>;
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    /// Canned answers keyed by (server, qname, type). Unmatched questions get
    /// an authoritative NXDOMAIN, servers marked down time out.
    #[derive(Default)]
    pub struct StubTransport {
        answers: HashMap<(IpAddr, String, RecordType), Response>,
        down: HashSet<IpAddr>,
        calls: Mutex<Vec<(IpAddr, String, RecordType)>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn answer(mut self, server: &str, qname: &str, record_type: RecordType, response: Response) -> Self {
            self.answers
                .insert((server.parse().unwrap(), qname.to_string(), record_type), response);
            self
        }

        pub fn down(mut self, server: &str) -> Self {
            self.down.insert(server.parse().unwrap());
            self
        }

        pub fn calls(&self) -> Vec<(IpAddr, String, RecordType)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DnsTransport for StubTransport {
        async fn query(
            &self,
            server: IpAddr,
            qname: &str,
            record_type: RecordType,
            _timeout: Duration,
        ) -> Result<Response, QueryError> {
            self.calls
                .lock()
                .unwrap()
                .push((server, qname.to_string(), record_type));

            if self.down.contains(&server) {
                return Err(QueryError::Timeout { server });
            }
            Ok(self
                .answers
                .get(&(server, qname.to_string(), record_type))
                .cloned()
                .unwrap_or_else(Response::name_error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_normalizes_owner_names() {
        let response = Response::new(Rcode::NoError).with_record(
            Section::Authority,
            "Google.COM.",
            RecordData::Ns("ns1.google.com".to_string()),
        );

        assert_eq!(response.records_for("google.com").count(), 1);
        assert!(!response.has_soa(Section::Authority));
    }

    #[test]
    fn only_socket_errors_are_fatal() {
        let server: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(!QueryError::Timeout { server }.is_fatal());
        assert!(!QueryError::Malformed {
            server,
            reason: "short".to_string()
        }
        .is_fatal());
        assert!(QueryError::Socket(io::Error::from(io::ErrorKind::Other)).is_fatal());
    }
}
