//! Public Suffix List reader.

use crate::directory::{normalize_tld, Directory};
use hickory_proto::rr::Name;
use std::collections::BTreeSet;
use tracing::debug;

/// Extracts the plain suffix rules from a public suffix list, skipping
/// comments, exceptions and wildcards. Internationalized suffixes come back
/// in their punycode form. The result is sorted and free of duplicates.
pub fn parse_public_suffix_list(text: &str) -> Vec<String> {
    let mut suffixes = BTreeSet::new();

    for line in text.lines() {
        let rule = line.split_whitespace().next().unwrap_or_default();
        if rule.is_empty() || rule.starts_with("//") || rule.starts_with('!') || rule.starts_with('*') {
            continue;
        }

        match to_ascii_suffix(rule) {
            Some(suffix) => {
                suffixes.insert(suffix);
            }
            None => debug!(rule, "Skipping unparseable suffix"),
        }
    }

    suffixes.into_iter().collect()
}

fn to_ascii_suffix(rule: &str) -> Option<String> {
    if rule.is_ascii() {
        return normalize_tld(rule).ok();
    }
    let name = Name::from_utf8(rule).ok()?;
    normalize_tld(&name.to_ascii()).ok()
}

/// Suffixes that still need their nameservers discovered.
pub fn missing_from(suffixes: &[String], directory: &Directory) -> Vec<String> {
    suffixes
        .iter()
        .filter(|suffix| !directory.contains(suffix))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
// ===BEGIN ICANN DOMAINS===

// uk : https://en.wikipedia.org/wiki/.uk
uk
co.uk
*.sch.uk
!city.kawasaki.jp
公司.cn
COM
com
";

    #[test]
    fn keeps_plain_rules_only() {
        assert_eq!(
            parse_public_suffix_list(SAMPLE),
            vec!["co.uk", "com", "uk", "xn--55qx5d.cn"]
        );
    }

    #[test]
    fn finds_suffixes_missing_from_directory() {
        let directory = Directory::from_bootstrap(vec![("uk", vec!["203.0.113.1"])]).unwrap();
        let suffixes = parse_public_suffix_list(SAMPLE);

        assert_eq!(
            missing_from(&suffixes, &directory),
            vec!["co.uk", "com", "xn--55qx5d.cn"]
        );
    }
}
