use crate::query::DEFAULT_TIMEOUT;
use serde::Serialize;
use std::{
    collections::{btree_map, BTreeMap},
    time::Duration,
};

pub const DEFAULT_CHUNK_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Exists,
    NotFound,
    /// Every nameserver failed, timed out or gave a non-definitive answer.
    Indeterminate,
}

impl ProbeOutcome {
    pub fn exists(&self) -> bool {
        matches!(self, ProbeOutcome::Exists)
    }

    pub fn is_definitive(&self) -> bool {
        !matches!(self, ProbeOutcome::Indeterminate)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub tld: String,
    pub outcome: ProbeOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct DiscoverConfig {
    /// Bound on each individual network round trip.
    pub timeout: Duration,
    /// Bound on all attempts for one (name, TLD) pair.
    pub probe_deadline: Option<Duration>,
    /// Probes running at once. Defaults to the chunk size.
    pub max_in_flight: Option<usize>,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            probe_deadline: None,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NameserverConfig {
    pub timeout: Duration,
    /// TLDs resolved at the same time.
    pub concurrency: usize,
    /// Also collect AAAA addresses for nameservers.
    pub include_ipv6: bool,
    /// How many glue referrals a nameserver address lookup may follow.
    pub max_referrals: usize,
}

impl Default for NameserverConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            concurrency: 64,
            include_ipv6: false,
            max_referrals: 3,
        }
    }
}

/// Candidate name → TLDs it was found registered under.
///
/// Names are keyed in lowercase and names without any confirmed TLD are
/// absent. TLD lists follow directory order and hold no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DiscoveryResult {
    entries: BTreeMap<String, Vec<String>>,
}

impl DiscoveryResult {
    pub(crate) fn record(&mut self, name: &str, tld: &str) {
        let tlds = self.entries.entry(name.to_ascii_lowercase()).or_default();
        if let Err(pos) = tlds.binary_search_by(|existing| existing.as_str().cmp(tld)) {
            tlds.insert(pos, tld.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<String>> {
        self.entries.iter()
    }

    /// Fully qualified registered domains, e.g. `google.com`.
    pub fn domains(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .flat_map(|(name, tlds)| tlds.iter().map(move |tld| format!("{}.{}", name, tld)))
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a DiscoveryResult {
    type Item = (&'a String, &'a Vec<String>);
    type IntoIter = btree_map::Iter<'a, String, Vec<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
