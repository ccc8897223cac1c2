//! Root zone file reader.
//!
//! Turns the delegations and glue of a zone file (typically the IANA root
//! zone) into a [`Directory`].

use crate::directory::{normalize_tld, Directory, TldRecord};
use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZoneError {
    #[error("Line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
}

const CLASSES: [&str; 4] = ["IN", "CH", "HS", "CS"];

#[derive(Debug, Default)]
pub struct RootZone {
    delegations: BTreeMap<String, Vec<String>>,
    addresses: HashMap<String, Vec<IpAddr>>,
}

impl RootZone {
    pub fn parse(text: &str) -> Result<Self, ZoneError> {
        let mut zone = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split(';').next().unwrap_or_default().trim();
            if content.is_empty() || content.starts_with('$') {
                continue;
            }

            let invalid = |reason: String| ZoneError::InvalidRecord { line, reason };
            let fields: Vec<&str> = content.split_whitespace().collect();

            // owner [ttl] [class] type rdata, ttl and class in either order
            let mut at = 1;
            for _ in 0..2 {
                match fields.get(at) {
                    Some(field) if field.parse::<u32>().is_ok() => at += 1,
                    Some(field) if CLASSES.iter().any(|class| field.eq_ignore_ascii_case(class)) => at += 1,
                    _ => {}
                }
            }
            let Some(record_type) = fields.get(at) else {
                return Err(invalid(format!("missing record type in {:?}", content)));
            };
            let rdata = fields.get(at + 1).copied();

            let owner = fields[0].trim_end_matches('.').to_ascii_lowercase();
            match record_type.to_ascii_uppercase().as_str() {
                "NS" => {
                    let host = rdata.ok_or_else(|| invalid("NS record without target".to_string()))?;
                    if owner.is_empty() {
                        continue;
                    }
                    let tld = normalize_tld(&owner).map_err(|e| invalid(e.to_string()))?;
                    let host = host.trim_end_matches('.').to_ascii_lowercase();
                    let hosts = zone.delegations.entry(tld).or_default();
                    if !hosts.contains(&host) {
                        hosts.push(host);
                    }
                }
                "A" => {
                    let ip: Ipv4Addr = rdata
                        .ok_or_else(|| invalid("A record without address".to_string()))?
                        .parse()
                        .map_err(|_| invalid(format!("bad IPv4 address in {:?}", content)))?;
                    zone.addresses.entry(owner).or_default().push(IpAddr::V4(ip));
                }
                "AAAA" => {
                    let ip: Ipv6Addr = rdata
                        .ok_or_else(|| invalid("AAAA record without address".to_string()))?
                        .parse()
                        .map_err(|_| invalid(format!("bad IPv6 address in {:?}", content)))?;
                    zone.addresses.entry(owner).or_default().push(IpAddr::V6(ip));
                }
                _ => {}
            }
        }

        debug!(
            delegations = zone.delegations.len(),
            hosts = zone.addresses.len(),
            "Parsed zone file"
        );
        Ok(zone)
    }

    pub fn delegations(&self) -> &BTreeMap<String, Vec<String>> {
        &self.delegations
    }

    /// One record per delegated TLD, its addresses taken from the glue of its
    /// nameservers in the order they were listed. TLDs without any glue are
    /// kept with an empty list.
    pub fn to_directory(&self, include_ipv6: bool) -> Directory {
        self.delegations
            .iter()
            .filter_map(|(tld, hosts)| {
                let addresses = hosts
                    .iter()
                    .filter_map(|host| self.addresses.get(host))
                    .flatten()
                    .copied()
                    .filter(|ip| include_ipv6 || ip.is_ipv4());
                TldRecord::new(tld, addresses).ok()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
.\t518400\tIN\tNS\ta.root-servers.net.
a.root-servers.net.\t518400\tIN\tA\t198.41.0.4
com.\t172800\tIN\tNS\ta.gtld-servers.net.
com.\t172800\tIN\tNS\tb.gtld-servers.net.
com.\t86400\tIN\tDS\t19718 13 2 8ACBB0CD28F41250A80A491389424D341522D946B0DA0C0291F2D3D771D7805A
a.gtld-servers.net.\t172800\tIN\tA\t192.5.6.30
a.gtld-servers.net.\t172800\tIN\tAAAA\t2001:503:a83e::2:30
b.gtld-servers.net.\t172800\tIN\tA\t192.33.14.30
; no glue for this one
example.\t172800\tIN\tNS\tns.example.net.
UK.\t172800\tIN\tNS\tdns1.nic.uk.
dns1.nic.uk.\t172800\tIN\tA\t213.248.216.1
";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn builds_directory_from_delegations_and_glue() {
        let zone = RootZone::parse(SAMPLE).unwrap();
        let directory = zone.to_directory(false);

        assert_eq!(directory.tlds().collect::<Vec<_>>(), vec!["com", "example", "uk"]);
        assert_eq!(
            directory.get("com").unwrap().nameservers(),
            &[ip("192.5.6.30"), ip("192.33.14.30")]
        );
        assert!(!directory.get("example").unwrap().is_usable());
        assert_eq!(directory.get("uk").unwrap().nameservers(), &[ip("213.248.216.1")]);
    }

    #[test]
    fn ipv6_glue_is_optional() {
        let directory = RootZone::parse(SAMPLE).unwrap().to_directory(true);
        assert_eq!(
            directory.get("com").unwrap().nameservers(),
            &[ip("192.5.6.30"), ip("2001:503:a83e::2:30"), ip("192.33.14.30")]
        );
    }

    #[test]
    fn accepts_records_without_ttl_or_class() {
        let zone = RootZone::parse("$TTL 3600\nnet NS a.gtld-servers.net.\na.gtld-servers.net. A 192.5.6.30\n").unwrap();
        assert_eq!(
            zone.to_directory(false).get("net").unwrap().nameservers(),
            &[ip("192.5.6.30")]
        );
    }

    #[test]
    fn reports_bad_addresses_with_line_numbers() {
        let err = RootZone::parse("com.\t172800\tIN\tNS\ta.gtld-servers.net.\na.gtld-servers.net.\t172800\tIN\tA\t999.5.6.30\n")
            .unwrap_err();
        assert!(matches!(err, ZoneError::InvalidRecord { line: 2, .. }));
    }
}
