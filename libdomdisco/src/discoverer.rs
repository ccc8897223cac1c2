use crate::{
    cancel::CancellationToken,
    directory::Directory,
    prober::Prober,
    query::{DnsTransport, QueryError},
    types::{DiscoverConfig, DiscoveryResult, ProbeOutcome},
    udp::UdpTransport,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid candidate name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("Chunk size must be at least 1")]
    InvalidChunkSize,
    #[error("Discovery was cancelled")]
    Cancelled,
    #[error("Out of network resources: {0}")]
    Resource(#[source] QueryError),
}

fn validate_name(name: &str) -> Result<(), DiscoveryError> {
    let invalid = |reason| DiscoveryError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.starts_with('.') || name.ends_with('.') {
        return Err(invalid("leading or trailing dot"));
    }
    if name.split('.').any(str::is_empty) {
        return Err(invalid("empty label"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    Ok(())
}

/// Finds the TLDs in a [`Directory`] under which candidate names are
/// registered.
pub struct Discoverer {
    directory: Directory,
    prober: Prober,
}

impl Discoverer {
    pub fn new(directory: Directory) -> Self {
        Self::with_config(directory, DiscoverConfig::default())
    }

    pub fn with_config(directory: Directory, config: DiscoverConfig) -> Self {
        Self::with_transport(directory, config, Arc::new(UdpTransport::new()))
    }

    pub fn with_transport(
        directory: Directory,
        config: DiscoverConfig,
        transport: Arc<dyn DnsTransport>,
    ) -> Self {
        Self {
            directory,
            prober: Prober::new(transport, config),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    pub async fn discover(&self, names: &[String], chunk_size: usize) -> Result<DiscoveryResult, DiscoveryError> {
        self.discover_with_cancel(names, chunk_size, &CancellationToken::new())
            .await
    }

    /// Probes every name against every TLD, `chunk_size` names at a time.
    ///
    /// The probes of one chunk run as parallel tasks, at most
    /// `max_in_flight` (by default `chunk_size`) at a time; the next chunk
    /// starts once they have all finished. Individual probe failures only leave the
    /// pair out of the result.
    pub async fn discover_with_cancel(
        &self,
        names: &[String],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        if chunk_size == 0 {
            return Err(DiscoveryError::InvalidChunkSize);
        }
        for name in names {
            validate_name(name)?;
        }

        let mut result = DiscoveryResult::default();
        if names.is_empty() || self.directory.is_empty() {
            return Ok(result);
        }

        let in_flight = self.prober.config().max_in_flight.unwrap_or(chunk_size).max(1);
        info!(
            names = names.len(),
            tlds = self.directory.len(),
            chunk_size,
            in_flight,
            "Starting discovery"
        );

        for (index, chunk) in names.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            let mut pending = chunk
                .iter()
                .flat_map(|name| self.directory.iter().map(move |record| (name, record)));
            let mut tasks = JoinSet::new();
            let mut found = 0usize;

            loop {
                while tasks.len() < in_flight {
                    let Some((name, record)) = pending.next() else { break };
                    let prober = self.prober.clone();
                    let name = name.clone();
                    let record = record.clone();

                    tasks.spawn(async move {
                        let probe = prober.probe_one(&name, &record).await;
                        (name, record, probe)
                    });
                }

                let joined = tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => {
                        tasks.abort_all();
                        warn!(chunk = index, "Discovery cancelled");
                        return Err(DiscoveryError::Cancelled);
                    }
                };

                let Some(joined) = joined else { break };
                match joined {
                    Ok((name, record, Ok(probe))) => {
                        debug!(
                            name = %name,
                            tld = record.tld(),
                            outcome = ?probe.outcome,
                            elapsed_ms = probe.duration.as_millis() as u64,
                            "Probe finished"
                        );
                        if probe.outcome == ProbeOutcome::Exists {
                            found += 1;
                            result.record(&name, record.tld());
                        }
                    }
                    Ok((_, _, Err(e))) => {
                        tasks.abort_all();
                        warn!(error = %e, "Aborting discovery");
                        return Err(DiscoveryError::Resource(e));
                    }
                    Err(e) => warn!(error = %e, "Probe task failed"),
                }
            }

            info!(chunk = index, names = chunk.len(), found, "Chunk finished");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_candidate_names() {
        assert!(validate_name("google").is_ok());
        assert!(validate_name("www.google").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".google").is_err());
        assert!(validate_name("google.").is_err());
        assert!(validate_name("goo gle").is_err());
        assert!(validate_name("a..b").is_err());
    }
}
