use crate::{
    directory::TldRecord,
    query::{DnsTransport, QueryError, Rcode, RecordData, RecordType, Response, Section},
    types::{DiscoverConfig, ProbeOutcome, ProbeResult},
};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Asks `servers` one at a time until `judge` accepts an answer as definitive.
///
/// Non-fatal query failures and answers `judge` rejects move on to the next
/// server. `Ok(None)` means the list (or the deadline) ran out first.
pub(crate) async fn query_in_order<T, F>(
    transport: &dyn DnsTransport,
    servers: &[IpAddr],
    qname: &str,
    record_type: RecordType,
    timeout: Duration,
    deadline: Option<Instant>,
    mut judge: F,
) -> Result<Option<T>, QueryError>
where
    F: FnMut(&Response) -> Option<T>,
{
    for &server in servers {
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!(qname, ?record_type, "Deadline reached before all nameservers were tried");
                    return Ok(None);
                }
                timeout.min(remaining)
            }
            None => timeout,
        };

        match transport.query(server, qname, record_type, timeout).await {
            Ok(response) => match judge(&response) {
                Some(verdict) => return Ok(Some(verdict)),
                None => trace!(%server, qname, rcode = ?response.rcode, "Non-definitive answer"),
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => trace!(%server, qname, error = %e, "Query failed"),
        }
    }

    Ok(None)
}

/// An NS query for `fqdn` at its TLD's servers counts as proof of
/// registration when the name is delegated (or served) by that TLD.
fn existence_verdict(response: &Response, fqdn: &str) -> Option<ProbeOutcome> {
    match response.rcode {
        Rcode::NameError => Some(ProbeOutcome::NotFound),
        Rcode::NoError => {
            let delegated = response
                .records_for(fqdn)
                .any(|record| matches!(record.data, RecordData::Ns(_) | RecordData::Soa { .. }));

            if delegated {
                Some(ProbeOutcome::Exists)
            } else if response.authoritative || response.has_soa(Section::Authority) {
                Some(ProbeOutcome::NotFound)
            } else {
                // lame server or upward referral
                None
            }
        }
        _ => None,
    }
}

#[derive(Clone)]
pub struct Prober {
    transport: Arc<dyn DnsTransport>,
    config: DiscoverConfig,
}

impl Prober {
    pub fn new(transport: Arc<dyn DnsTransport>, config: DiscoverConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &DiscoverConfig {
        &self.config
    }

    /// Checks whether `name` is registered under the TLD of `record`.
    ///
    /// Only a failure to open any local socket is returned as an error;
    /// everything else folds into [`ProbeOutcome::Indeterminate`].
    pub async fn probe(&self, name: &str, record: &TldRecord) -> Result<ProbeOutcome, QueryError> {
        if !record.is_usable() {
            return Ok(ProbeOutcome::Indeterminate);
        }

        let fqdn = format!("{}.{}", name.to_ascii_lowercase(), record.tld());
        let deadline = self.config.probe_deadline.map(|budget| Instant::now() + budget);

        let verdict = query_in_order(
            self.transport.as_ref(),
            record.nameservers(),
            &fqdn,
            RecordType::Ns,
            self.config.timeout,
            deadline,
            |response| existence_verdict(response, &fqdn),
        )
        .await?;

        Ok(verdict.unwrap_or(ProbeOutcome::Indeterminate))
    }

    pub async fn probe_one(&self, name: &str, record: &TldRecord) -> Result<ProbeResult, QueryError> {
        let start = Instant::now();
        let outcome = self.probe(name, record).await?;

        Ok(ProbeResult {
            name: name.to_string(),
            tld: record.tld().to_string(),
            outcome,
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::stub::StubTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(tld: &str, servers: &[&str]) -> TldRecord {
        TldRecord::parse(tld, servers).unwrap()
    }

    fn delegation(name: &str) -> Response {
        Response::new(Rcode::NoError).with_record(
            Section::Authority,
            name,
            RecordData::Ns(format!("ns1.{}", name)),
        )
    }

    fn prober(transport: impl DnsTransport + 'static) -> (Prober, Arc<dyn DnsTransport>) {
        let transport: Arc<dyn DnsTransport> = Arc::new(transport);
        (Prober::new(transport.clone(), DiscoverConfig::default()), transport)
    }

    #[tokio::test]
    async fn delegation_means_exists() {
        let stub = Arc::new(
            StubTransport::new().answer("192.0.2.1", "google.com", RecordType::Ns, delegation("google.com")),
        );
        let prober = Prober::new(stub.clone(), DiscoverConfig::default());

        let outcome = prober.probe("google", &record("com", &["192.0.2.1"])).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Exists);
        assert_eq!(stub.calls().len(), 1);
    }

    #[tokio::test]
    async fn name_error_short_circuits() {
        let stub = Arc::new(StubTransport::new());
        let prober = Prober::new(stub.clone(), DiscoverConfig::default());

        let outcome = prober
            .probe("zzqzzqzzq9", &record("com", &["192.0.2.1", "192.0.2.2"]))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::NotFound);
        assert_eq!(stub.calls().len(), 1);
    }

    #[tokio::test]
    async fn timeout_falls_through_to_next_nameserver() {
        let stub = Arc::new(
            StubTransport::new()
                .down("192.0.2.1")
                .answer("192.0.2.2", "google.com", RecordType::Ns, delegation("google.com")),
        );
        let prober = Prober::new(stub.clone(), DiscoverConfig::default());

        let outcome = prober
            .probe("google", &record("com", &["192.0.2.1", "192.0.2.2"]))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Exists);

        let servers: Vec<_> = stub.calls().into_iter().map(|(server, _, _)| server.to_string()).collect();
        assert_eq!(servers, vec!["192.0.2.1", "192.0.2.2"]);
    }

    #[tokio::test]
    async fn server_failure_is_not_definitive() {
        let stub = Arc::new(
            StubTransport::new()
                .answer("192.0.2.1", "google.com", RecordType::Ns, Response::new(Rcode::ServerFailure))
                .answer("192.0.2.2", "google.com", RecordType::Ns, Response::name_error()),
        );
        let prober = Prober::new(stub.clone(), DiscoverConfig::default());

        let outcome = prober
            .probe("google", &record("com", &["192.0.2.1", "192.0.2.2"]))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::NotFound);
        assert_eq!(stub.calls().len(), 2);
    }

    #[tokio::test]
    async fn authoritative_nodata_is_not_found() {
        let nodata = Response::new(Rcode::NoError).authoritative().with_record(
            Section::Authority,
            "com",
            RecordData::Soa {
                mname: "a.gtld-servers.net".to_string(),
            },
        );
        let (prober, _) = prober(StubTransport::new().answer("192.0.2.1", "empty.com", RecordType::Ns, nodata));

        let outcome = prober.probe("empty", &record("com", &["192.0.2.1"])).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::NotFound);
    }

    #[tokio::test]
    async fn lame_answers_exhaust_to_indeterminate() {
        let lame = Response::new(Rcode::NoError).with_record(
            Section::Authority,
            "",
            RecordData::Ns("a.root-servers.net".to_string()),
        );
        let (prober, _) = prober(
            StubTransport::new()
                .answer("192.0.2.1", "google.com", RecordType::Ns, lame)
                .down("192.0.2.2"),
        );

        let outcome = prober
            .probe("google", &record("com", &["192.0.2.1", "192.0.2.2"]))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Indeterminate);
    }

    #[tokio::test]
    async fn empty_record_skips_the_network() {
        let stub = Arc::new(StubTransport::new());
        let prober = Prober::new(stub.clone(), DiscoverConfig::default());

        let outcome = prober.probe("google", &record("zz", &[])).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Indeterminate);
        assert!(stub.calls().is_empty());
    }

    struct Blackhole {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DnsTransport for Blackhole {
        async fn query(
            &self,
            server: IpAddr,
            _qname: &str,
            _record_type: RecordType,
            timeout: Duration,
        ) -> Result<Response, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(timeout).await;
            Err(QueryError::Timeout { server })
        }
    }

    #[tokio::test]
    async fn probe_deadline_bounds_total_latency() {
        let blackhole = Arc::new(Blackhole {
            calls: AtomicUsize::new(0),
        });
        let config = DiscoverConfig {
            timeout: Duration::from_millis(50),
            probe_deadline: Some(Duration::from_millis(120)),
            ..DiscoverConfig::default()
        };
        let prober = Prober::new(blackhole.clone(), config);
        let servers = ["192.0.2.1", "192.0.2.2", "192.0.2.3", "192.0.2.4", "192.0.2.5"];

        let started = Instant::now();
        let outcome = prober.probe("google", &record("com", &servers)).await.unwrap();

        assert_eq!(outcome, ProbeOutcome::Indeterminate);
        assert!(blackhole.calls.load(Ordering::SeqCst) <= 3);
        assert!(started.elapsed() < Duration::from_millis(240));
    }

    struct NoSockets;

    #[async_trait]
    impl DnsTransport for NoSockets {
        async fn query(
            &self,
            _server: IpAddr,
            _qname: &str,
            _record_type: RecordType,
            _timeout: Duration,
        ) -> Result<Response, QueryError> {
            Err(QueryError::Socket(std::io::Error::from(std::io::ErrorKind::Other)))
        }
    }

    #[tokio::test]
    async fn socket_exhaustion_is_surfaced() {
        let (prober, _) = prober(NoSockets);
        let err = prober
            .probe("google", &record("com", &["192.0.2.1"]))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
