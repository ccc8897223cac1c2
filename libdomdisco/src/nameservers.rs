use crate::{
    cancel::CancellationToken,
    directory::{normalize_tld, Directory, DirectoryError, TldRecord},
    discoverer::DiscoveryError,
    prober::query_in_order,
    query::{DnsTransport, QueryError, Rcode, RecordData, RecordType, Response, Section},
    types::NameserverConfig,
    udp::UdpTransport,
};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::{collections::HashSet, net::IpAddr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum NameserverError {
    #[error(transparent)]
    InvalidTld(#[from] DirectoryError),
    #[error("No parent of {0} in the directory")]
    NoParentTld(String),
    #[error("{tld} is not delegated from {parent}")]
    NoDelegation { tld: String, parent: String },
    #[error("No nameserver of {parent} gave a usable answer for {tld}")]
    Unreachable { tld: String, parent: String },
    #[error("None of the nameservers of {tld} resolved to an address ({})", hosts.join(", "))]
    NoAddresses { tld: String, hosts: Vec<String> },
    #[error(transparent)]
    Query(#[from] QueryError),
}

enum Delegation {
    Hosts {
        hosts: Vec<String>,
        glue: Vec<(String, IpAddr)>,
    },
    /// Handed down to a zone cut between the parent and the TLD.
    Referral {
        zone: String,
        servers: Vec<IpAddr>,
    },
    Missing,
}

enum HostLookup {
    Found(Vec<IpAddr>),
    Referral(Vec<IpAddr>),
    Missing,
}

fn is_within(name: &str, zone: &str) -> bool {
    !zone.is_empty()
        && (name == zone
            || name
                .strip_suffix(zone)
                .is_some_and(|prefix| prefix.ends_with('.')))
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Finds nameserver addresses for TLDs missing from a [`Directory`] by asking
/// the nameservers of their closest known parent.
pub struct NameserverDiscovery {
    directory: Directory,
    transport: Arc<dyn DnsTransport>,
    config: NameserverConfig,
    host_addresses: DashMap<String, Vec<IpAddr>>,
}

impl NameserverDiscovery {
    pub fn new(directory: Directory) -> Self {
        Self::with_config(directory, NameserverConfig::default())
    }

    pub fn with_config(directory: Directory, config: NameserverConfig) -> Self {
        Self::with_transport(directory, config, Arc::new(UdpTransport::new()))
    }

    pub fn with_transport(
        directory: Directory,
        config: NameserverConfig,
        transport: Arc<dyn DnsTransport>,
    ) -> Self {
        Self {
            directory,
            transport,
            config,
            host_addresses: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub async fn generate_tld_to_nameserver_ips(&self, tlds: &[String]) -> Result<Directory, DiscoveryError> {
        self.generate_with_cancel(tlds, &CancellationToken::new()).await
    }

    /// Resolves every TLD independently. TLDs that cannot be resolved are left
    /// out of the returned directory; only running out of sockets or being
    /// cancelled fails the batch.
    pub async fn generate_with_cancel(
        &self,
        tlds: &[String],
        cancel: &CancellationToken,
    ) -> Result<Directory, DiscoveryError> {
        let mut seen = HashSet::new();
        let pending: Vec<&str> = tlds
            .iter()
            .map(String::as_str)
            .filter(|tld| seen.insert(tld.to_ascii_lowercase()))
            .collect();
        let requested = pending.len();

        info!(tlds = requested, concurrency = self.config.concurrency, "Discovering nameservers");

        let results = stream::iter(pending)
            .map(|tld| async move { (tld, self.resolve_tld(tld).await) })
            .buffer_unordered(self.config.concurrency.max(1));
        let mut results = std::pin::pin!(results);

        let mut resolved = Directory::new();
        loop {
            let next = tokio::select! {
                next = results.next() => next,
                _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            };
            let Some((tld, result)) = next else { break };

            match result {
                Ok(record) => {
                    debug!(tld, nameservers = record.nameservers().len(), "Resolved nameservers");
                    resolved.insert(record);
                }
                Err(NameserverError::Query(e)) => return Err(DiscoveryError::Resource(e)),
                Err(e) => debug!(tld, error = %e, "Skipping TLD"),
            }
        }

        info!(requested, resolved = resolved.len(), "Nameserver discovery finished");
        Ok(resolved)
    }

    /// Walks from the closest known parent of `tld` to the addresses of the
    /// nameservers it delegates to.
    pub async fn resolve_tld(&self, tld: &str) -> Result<TldRecord, NameserverError> {
        let tld = normalize_tld(tld)?;
        let parent = self
            .directory
            .closest_enclosing(&tld)
            .ok_or_else(|| NameserverError::NoParentTld(tld.clone()))?;

        let mut zone = parent.tld().to_string();
        let mut servers = parent.nameservers().to_vec();
        let mut delegation = None;
        for _ in 0..=self.config.max_referrals {
            let verdict = query_in_order(
                self.transport.as_ref(),
                &servers,
                &tld,
                RecordType::Ns,
                self.config.timeout,
                None,
                |response| delegation_verdict(response, &tld, &zone, self.config.include_ipv6),
            )
            .await?;

            match verdict {
                Some(Delegation::Referral { zone: cut, servers: next }) => {
                    trace!(tld = %tld, zone = %cut, servers = next.len(), "Following referral");
                    zone = cut;
                    servers = next;
                }
                other => {
                    delegation = other;
                    break;
                }
            }
        }

        let (hosts, glue) = match delegation {
            Some(Delegation::Hosts { hosts, glue }) => (hosts, glue),
            Some(Delegation::Missing) => {
                return Err(NameserverError::NoDelegation {
                    tld,
                    parent: parent.tld().to_string(),
                })
            }
            Some(Delegation::Referral { .. }) | None => {
                return Err(NameserverError::Unreachable {
                    tld,
                    parent: parent.tld().to_string(),
                })
            }
        };

        let mut addresses = Vec::new();
        for host in &hosts {
            let glued: Vec<IpAddr> = glue
                .iter()
                .filter(|(owner, ip)| owner == host && self.wanted(ip))
                .map(|(_, ip)| *ip)
                .collect();

            let found = if glued.is_empty() {
                self.resolve_host(host).await?
            } else {
                glued
            };
            for ip in found {
                push_unique(&mut addresses, ip);
            }
        }

        if addresses.is_empty() {
            return Err(NameserverError::NoAddresses { tld, hosts });
        }

        Ok(TldRecord::new(&tld, addresses)?)
    }

    /// Addresses of a nameserver host, looked up at the servers of the
    /// directory entry enclosing it. Memoized for the lifetime of `self`.
    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, NameserverError> {
        if let Some(cached) = self.host_addresses.get(host) {
            return Ok(cached.value().clone());
        }

        let Some(enclosing) = self.directory.closest_enclosing(host) else {
            debug!(host, "Nameserver lies outside every known TLD");
            return Ok(Vec::new());
        };

        let mut addresses = Vec::new();
        for &record_type in self.address_types() {
            for ip in self.lookup_address(host, enclosing.nameservers(), record_type).await? {
                push_unique(&mut addresses, ip);
            }
        }

        self.host_addresses.insert(host.to_string(), addresses.clone());
        Ok(addresses)
    }

    async fn lookup_address(
        &self,
        host: &str,
        servers: &[IpAddr],
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, NameserverError> {
        let mut servers = servers.to_vec();

        for _ in 0..=self.config.max_referrals {
            let lookup = query_in_order(
                self.transport.as_ref(),
                &servers,
                host,
                record_type,
                self.config.timeout,
                None,
                |response| self.address_verdict(response, host, record_type),
            )
            .await?;

            match lookup {
                Some(HostLookup::Found(ips)) => return Ok(ips),
                Some(HostLookup::Referral(next)) => {
                    trace!(host, servers = next.len(), "Following referral");
                    servers = next;
                }
                Some(HostLookup::Missing) | None => return Ok(Vec::new()),
            }
        }

        debug!(host, max_referrals = self.config.max_referrals, "Too many referrals");
        Ok(Vec::new())
    }

    fn address_verdict(&self, response: &Response, host: &str, record_type: RecordType) -> Option<HostLookup> {
        match response.rcode {
            Rcode::NameError => Some(HostLookup::Missing),
            Rcode::NoError => {
                let mut found = Vec::new();
                for record in response.records_for(host) {
                    if record.section == Section::Authority {
                        continue;
                    }
                    match (&record.data, record_type) {
                        (RecordData::A(ip), RecordType::A) => push_unique(&mut found, IpAddr::V4(*ip)),
                        (RecordData::Aaaa(ip), RecordType::Aaaa) => push_unique(&mut found, IpAddr::V6(*ip)),
                        _ => {}
                    }
                }
                if !found.is_empty() {
                    return Some(HostLookup::Found(found));
                }

                let referred: Vec<&str> = response
                    .records
                    .iter()
                    .filter(|record| record.section == Section::Authority && is_within(host, &record.name))
                    .filter_map(|record| match &record.data {
                        RecordData::Ns(ns) => Some(ns.as_str()),
                        _ => None,
                    })
                    .collect();

                let mut glue = Vec::new();
                for record in &response.records {
                    if record.section == Section::Additional && referred.contains(&record.name.as_str()) {
                        if let Some(ip) = record.data.address().filter(|ip| self.wanted(ip)) {
                            push_unique(&mut glue, ip);
                        }
                    }
                }

                if !glue.is_empty() {
                    Some(HostLookup::Referral(glue))
                } else if response.authoritative || response.has_soa(Section::Authority) {
                    Some(HostLookup::Missing)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn address_types(&self) -> &'static [RecordType] {
        if self.config.include_ipv6 {
            &[RecordType::A, RecordType::Aaaa]
        } else {
            &[RecordType::A]
        }
    }

    fn wanted(&self, ip: &IpAddr) -> bool {
        ip.is_ipv4() || self.config.include_ipv6
    }
}

/// Reads an NS answer for `tld` sent by a server of `zone`.
fn delegation_verdict(response: &Response, tld: &str, zone: &str, include_ipv6: bool) -> Option<Delegation> {
    match response.rcode {
        Rcode::NameError => Some(Delegation::Missing),
        Rcode::NoError => {
            let mut hosts = Vec::new();
            for record in response.records_for(tld) {
                if let (RecordData::Ns(host), Section::Answer | Section::Authority) = (&record.data, record.section) {
                    push_unique(&mut hosts, host.clone());
                }
            }

            if hosts.is_empty() {
                if let Some(referral) = referral_below(response, tld, zone, include_ipv6) {
                    return Some(referral);
                }
                return if response.authoritative || response.has_soa(Section::Authority) {
                    Some(Delegation::Missing)
                } else {
                    None
                };
            }

            let glue = response
                .records
                .iter()
                .filter(|record| record.section == Section::Additional && hosts.contains(&record.name))
                .filter_map(|record| record.data.address().map(|ip| (record.name.clone(), ip)))
                .collect();

            Some(Delegation::Hosts { hosts, glue })
        }
        _ => None,
    }
}

/// A referral to a zone strictly between `zone` and `tld`, usable only when
/// it carries glue.
fn referral_below(response: &Response, tld: &str, zone: &str, include_ipv6: bool) -> Option<Delegation> {
    let cut = response
        .records
        .iter()
        .filter(|record| record.section == Section::Authority && matches!(record.data, RecordData::Ns(_)))
        .map(|record| record.name.as_str())
        .find(|owner| *owner != tld && *owner != zone && is_within(tld, owner) && is_within(owner, zone))?;

    let hosts: Vec<&str> = response
        .records
        .iter()
        .filter(|record| record.section == Section::Authority && record.name == cut)
        .filter_map(|record| match &record.data {
            RecordData::Ns(host) => Some(host.as_str()),
            _ => None,
        })
        .collect();

    let mut servers = Vec::new();
    for record in &response.records {
        if record.section == Section::Additional && hosts.contains(&record.name.as_str()) {
            if let Some(ip) = record.data.address().filter(|ip| include_ipv6 || ip.is_ipv4()) {
                push_unique(&mut servers, ip);
            }
        }
    }

    if servers.is_empty() {
        return None;
    }
    Some(Delegation::Referral {
        zone: cut.to_string(),
        servers,
    })
}
