use std::{
    collections::{btree_map, BTreeMap},
    net::IpAddr,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Invalid TLD {tld:?}: {reason}")]
    InvalidTld { tld: String, reason: &'static str },
    #[error("Invalid nameserver address {address:?} for TLD {tld}")]
    InvalidAddress { tld: String, address: String },
}

/// Lowercases a TLD and strips a single trailing dot.
pub fn normalize_tld(tld: &str) -> Result<String, DirectoryError> {
    let trimmed = tld.trim();
    let invalid = |reason| DirectoryError::InvalidTld {
        tld: tld.to_string(),
        reason,
    };

    let stripped = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if stripped.is_empty() {
        return Err(invalid("empty"));
    }
    if stripped.starts_with('.') {
        return Err(invalid("leading dot"));
    }
    if stripped.split('.').any(str::is_empty) {
        return Err(invalid("empty label"));
    }
    if stripped.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }

    Ok(stripped.to_lowercase())
}

/// Nameserver addresses for one TLD, in the order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TldRecord {
    tld: String,
    nameservers: Vec<IpAddr>,
}

impl TldRecord {
    pub fn new<I>(tld: &str, nameservers: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut record = Self {
            tld: normalize_tld(tld)?,
            nameservers: Vec::new(),
        };
        record.extend(nameservers);
        Ok(record)
    }

    pub fn parse<I, S>(tld: &str, addresses: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tld = normalize_tld(tld)?;
        let nameservers = addresses
            .into_iter()
            .map(|address| {
                let address = address.as_ref();
                address
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| DirectoryError::InvalidAddress {
                        tld: tld.clone(),
                        address: address.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(&tld, nameservers)
    }

    pub fn tld(&self) -> &str {
        &self.tld
    }

    pub fn nameservers(&self) -> &[IpAddr] {
        &self.nameservers
    }

    pub fn is_usable(&self) -> bool {
        !self.nameservers.is_empty()
    }

    fn extend<I>(&mut self, nameservers: I)
    where
        I: IntoIterator<Item = IpAddr>,
    {
        for ip in nameservers {
            if !self.nameservers.contains(&ip) {
                self.nameservers.push(ip);
            }
        }
    }
}

/// TLD → nameserver mapping the prober and the nameserver discovery engine
/// work from. Iteration is ordered by TLD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    records: BTreeMap<String, TldRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from raw bootstrap data, rejecting malformed TLDs or
    /// addresses. Keys that normalize to the same TLD are merged.
    pub fn from_bootstrap<I, K, V, S>(data: I) -> Result<Self, DirectoryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut directory = Self::new();
        for (tld, addresses) in data {
            let record = TldRecord::parse(tld.as_ref(), addresses)?;
            match directory.records.entry(record.tld.clone()) {
                btree_map::Entry::Occupied(mut existing) => {
                    existing.get_mut().extend(record.nameservers);
                }
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(directory)
    }

    /// Replaces any existing record for the same TLD.
    pub fn insert(&mut self, record: TldRecord) -> Option<TldRecord> {
        self.records.insert(record.tld.clone(), record)
    }

    pub fn merge(&mut self, other: Directory) {
        self.records.extend(other.records);
    }

    pub fn get(&self, tld: &str) -> Option<&TldRecord> {
        match normalize_tld(tld) {
            Ok(tld) => self.records.get(&tld),
            Err(_) => None,
        }
    }

    pub fn contains(&self, tld: &str) -> bool {
        self.get(tld).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TldRecord> + '_ {
        self.records.values()
    }

    pub fn tlds(&self) -> impl Iterator<Item = &str> + '_ {
        self.records.keys().map(String::as_str)
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&TldRecord) -> bool,
    {
        self.records.retain(|_, record| keep(record));
    }

    /// Longest proper suffix of `name` that has a record here.
    ///
    /// `co.uk` resolves to `uk`, `ns1.nic.uk` to `nic.uk` when present and to
    /// `uk` otherwise.
    pub fn closest_enclosing(&self, name: &str) -> Option<&TldRecord> {
        let name = normalize_tld(name).ok()?;
        let mut rest = name.as_str();
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(record) = self.records.get(parent) {
                return Some(record);
            }
            rest = parent;
        }
        None
    }

    pub fn to_bootstrap(&self) -> BTreeMap<String, Vec<String>> {
        self.records
            .iter()
            .map(|(tld, record)| {
                let addresses = record.nameservers.iter().map(IpAddr::to_string).collect();
                (tld.clone(), addresses)
            })
            .collect()
    }
}

impl FromIterator<TldRecord> for Directory {
    fn from_iter<T: IntoIterator<Item = TldRecord>>(iter: T) -> Self {
        let mut directory = Self::new();
        for record in iter {
            directory.insert(record);
        }
        directory
    }
}

impl<'a> IntoIterator for &'a Directory {
    type Item = &'a TldRecord;
    type IntoIter = btree_map::Values<'a, String, TldRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.values()
    }
}
