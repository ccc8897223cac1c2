use crate::query::{
    normalize_owner, DnsTransport, QueryError, Rcode, Record, RecordData, RecordType, Response, Section,
};
use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{self, Name, RData},
};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::Instant,
};
use tracing::debug;

const DNS_PORT: u16 = 53;
const MAX_UDP_RESPONSE: usize = 4096;

// ENFILE, EMFILE, ENOBUFS
#[cfg(target_os = "linux")]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 105];
#[cfg(all(unix, not(target_os = "linux")))]
const EXHAUSTION_CODES: &[i32] = &[23, 24, 55];
// WSAEMFILE, WSAENOBUFS
#[cfg(windows)]
const EXHAUSTION_CODES: &[i32] = &[10024, 10055];
#[cfg(not(any(unix, windows)))]
const EXHAUSTION_CODES: &[i32] = &[];

/// Out of descriptors or buffers for the moment, as opposed to not being
/// able to open sockets at all.
fn is_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
        || err
            .raw_os_error()
            .is_some_and(|code| EXHAUSTION_CODES.contains(&code))
}

/// Plain DNS over UDP, retrying once over TCP when the answer is truncated.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    port: u16,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::with_port(DNS_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self { port }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    async fn query(
        &self,
        server: IpAddr,
        qname: &str,
        record_type: RecordType,
        timeout: Duration,
    ) -> Result<Response, QueryError> {
        let id: u16 = rand::random();
        let request = encode_query(id, qname, record_type)?;
        let addr = SocketAddr::new(server, self.port);

        let bytes = exchange_udp(addr, id, &request, timeout).await?;
        let mut message = decode(server, &bytes)?;

        if message.truncated() {
            debug!(%server, qname, ?record_type, "Truncated response, retrying over TCP");
            let bytes = exchange_tcp(addr, &request, timeout).await?;
            message = decode(server, &bytes)?;
            if message.id() != id {
                return Err(QueryError::Malformed {
                    server,
                    reason: format!("expected id {}, got {}", id, message.id()),
                });
            }
        }

        Ok(to_response(&message))
    }
}

impl From<RecordType> for rr::RecordType {
    fn from(record_type: RecordType) -> Self {
        match record_type {
            RecordType::A => rr::RecordType::A,
            RecordType::Aaaa => rr::RecordType::AAAA,
            RecordType::Ns => rr::RecordType::NS,
            RecordType::Soa => rr::RecordType::SOA,
        }
    }
}

impl From<ResponseCode> for Rcode {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::NoError => Rcode::NoError,
            ResponseCode::NXDomain => Rcode::NameError,
            ResponseCode::ServFail => Rcode::ServerFailure,
            ResponseCode::Refused => Rcode::Refused,
            other => Rcode::Other(other.into()),
        }
    }
}

fn encode_query(id: u16, qname: &str, record_type: RecordType) -> Result<Vec<u8>, QueryError> {
    let invalid = |reason: String| QueryError::InvalidName {
        name: qname.to_string(),
        reason,
    };

    let name = Name::from_ascii(format!("{}.", qname.trim_end_matches('.')))
        .map_err(|e| invalid(e.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    message.add_query(Query::query(name, record_type.into()));

    message.to_vec().map_err(|e| invalid(e.to_string()))
}

fn decode(server: IpAddr, bytes: &[u8]) -> Result<Message, QueryError> {
    let message = Message::from_vec(bytes).map_err(|e| QueryError::Malformed {
        server,
        reason: e.to_string(),
    })?;

    if message.message_type() != MessageType::Response {
        return Err(QueryError::Malformed {
            server,
            reason: "not a response".to_string(),
        });
    }

    Ok(message)
}

async fn exchange_udp(
    addr: SocketAddr,
    id: u16,
    request: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, QueryError> {
    let server = addr.ip();
    let connection = |source| QueryError::Connection { server, source };

    let local: SocketAddr = match server {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = match UdpSocket::bind(local).await {
        Ok(socket) => socket,
        // hosts without IPv6 still have every IPv4 server to talk to
        Err(source) if server.is_ipv6() => return Err(connection(source)),
        Err(source) if is_exhaustion(&source) => {
            debug!(%server, error = %source, "No local socket available");
            return Err(connection(source));
        }
        Err(source) => return Err(QueryError::Socket(source)),
    };

    socket.connect(addr).await.map_err(connection)?;
    socket.send(request).await.map_err(connection)?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    loop {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(source)) => return Err(connection(source)),
            Err(_) => return Err(QueryError::Timeout { server }),
        };

        if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
            buf.truncate(len);
            return Ok(buf);
        }
        debug!(%server, "Discarding response with unexpected id");
    }
}

async fn exchange_tcp(addr: SocketAddr, request: &[u8], timeout: Duration) -> Result<Vec<u8>, QueryError> {
    let server = addr.ip();

    let exchange = async {
        let len = u16::try_from(request.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large"))?;
        let mut framed = Vec::with_capacity(request.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(request);

        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&framed).await?;

        let mut prefix = [0u8; 2];
        stream.read_exact(&mut prefix).await?;
        let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
        stream.read_exact(&mut body).await?;

        Ok::<_, io::Error>(body)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(source)) => Err(QueryError::Connection { server, source }),
        Err(_) => Err(QueryError::Timeout { server }),
    }
}

fn to_response(message: &Message) -> Response {
    let sections = [
        (Section::Answer, message.answers()),
        (Section::Authority, message.name_servers()),
        (Section::Additional, message.additionals()),
    ];

    let records = sections
        .into_iter()
        .flat_map(|(section, records)| {
            records
                .iter()
                .filter_map(move |record| convert_record(section, record))
        })
        .collect();

    Response {
        rcode: message.response_code().into(),
        authoritative: message.authoritative(),
        records,
    }
}

fn convert_record(section: Section, record: &rr::Record) -> Option<Record> {
    let data = match record.data()? {
        RData::NS(ns) => RecordData::Ns(normalize_owner(&ns.0.to_ascii())),
        RData::A(a) => RecordData::A(a.0),
        RData::AAAA(aaaa) => RecordData::Aaaa(aaaa.0),
        RData::SOA(soa) => RecordData::Soa {
            mname: normalize_owner(&soa.mname().to_ascii()),
        },
        _ => return None,
    };

    Some(Record {
        name: normalize_owner(&record.name().to_ascii()),
        section,
        data,
    })
}
