//! Mitigation target model.
//!
//! A mitigation matches traffic by address prefix, port range, protocol,
//! FQDN and URI, optionally extended by named aliases. This module parses
//! and validates those criteria and builds the normalized target groups the
//! conflict resolver compares.

use std::collections::BTreeSet;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::alias::Alias;

/// Errors raised while parsing or validating target criteria
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    #[error("invalid target prefix: {0}")]
    InvalidPrefix(String),
    #[error("target prefix {0} is not an acceptable mitigation target")]
    ForbiddenPrefix(String),
    #[error("invalid port range: lower={lower}, upper={upper:?}")]
    InvalidPortRange { lower: i64, upper: Option<i64> },
    #[error("invalid protocol number: {0}")]
    InvalidProtocol(i64),
    #[error("at least one of target-prefix, target-fqdn, target-uri or alias-name must be present")]
    MissingTarget,
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub lower_port: u16,
    pub upper_port: u16,
}

impl PortRange {
    pub fn new(lower_port: u16, upper_port: u16) -> Self {
        Self { lower_port, upper_port }
    }

    /// Build a range from raw wire values; a missing upper bound means a single port.
    pub fn parse(lower: i64, upper: Option<i64>) -> Result<Self, TargetError> {
        let invalid = || TargetError::InvalidPortRange { lower, upper };
        let lower_port = u16::try_from(lower).map_err(|_| invalid())?;
        let upper_port = match upper {
            Some(upper) => u16::try_from(upper).map_err(|_| invalid())?,
            None => lower_port,
        };
        if lower_port > upper_port {
            return Err(invalid());
        }
        Ok(Self::new(lower_port, upper_port))
    }

    pub fn includes(&self, port: u16) -> bool {
        self.lower_port <= port && port <= self.upper_port
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.lower_port <= other.upper_port && other.lower_port <= self.upper_port
    }
}

/// Raw port range as received from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortRangeInput {
    pub lower_port: i64,
    #[serde(default)]
    pub upper_port: Option<i64>,
}

/// Parse a CIDR string into a prefix normalized to its network address.
pub fn parse_prefix(cidr: &str) -> Result<IpNetwork, TargetError> {
    let net: IpNetwork = cidr
        .parse()
        .map_err(|_| TargetError::InvalidPrefix(cidr.to_string()))?;
    let normalized = IpNetwork::new(net.network(), net.prefix())
        .map_err(|_| TargetError::InvalidPrefix(cidr.to_string()))?;
    let ip = normalized.ip();
    if ip.is_loopback() || ip.is_multicast() {
        return Err(TargetError::ForbiddenPrefix(cidr.to_string()));
    }
    Ok(normalized)
}

/// Two CIDR ranges intersect when one contains the other's network address.
pub fn prefixes_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// The match criteria of a mitigation scope as stored and handed to blockers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub prefixes: Vec<IpNetwork>,
    #[serde(default)]
    pub port_ranges: Vec<PortRange>,
    #[serde(default)]
    pub protocols: BTreeSet<u8>,
    #[serde(default)]
    pub fqdns: BTreeSet<String>,
    #[serde(default)]
    pub uris: BTreeSet<String>,
    #[serde(default)]
    pub alias_names: BTreeSet<String>,
}

impl TargetSpec {
    /// Parse raw client criteria. Does not enforce the "at least one target" rule;
    /// see [`TargetSpec::validate_for_activation`].
    pub fn parse(
        prefixes: &[String],
        port_ranges: &[PortRangeInput],
        protocols: &[i64],
        fqdns: &[String],
        uris: &[String],
        alias_names: &[String],
    ) -> Result<Self, TargetError> {
        let prefixes = prefixes
            .iter()
            .map(|p| parse_prefix(p))
            .collect::<Result<Vec<_>, _>>()?;
        let port_ranges = port_ranges
            .iter()
            .map(|r| PortRange::parse(r.lower_port, r.upper_port))
            .collect::<Result<Vec<_>, _>>()?;
        let protocols = protocols
            .iter()
            .map(|p| u8::try_from(*p).map_err(|_| TargetError::InvalidProtocol(*p)))
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(Self {
            prefixes,
            port_ranges,
            protocols,
            fqdns: fqdns.iter().cloned().collect(),
            uris: uris.iter().cloned().collect(),
            alias_names: alias_names.iter().cloned().collect(),
        })
    }

    pub fn validate_for_activation(&self) -> Result<(), TargetError> {
        if self.prefixes.is_empty()
            && self.fqdns.is_empty()
            && self.uris.is_empty()
            && self.alias_names.is_empty()
        {
            return Err(TargetError::MissingTarget);
        }
        Ok(())
    }

    /// Criteria with every alias appended, as handed to a blocker.
    pub fn expanded_with(&self, aliases: &[Alias]) -> TargetSpec {
        let mut expanded = self.clone();
        for alias in aliases {
            for prefix in &alias.targets.prefixes {
                if !expanded.prefixes.contains(prefix) {
                    expanded.prefixes.push(*prefix);
                }
            }
            for range in &alias.targets.port_ranges {
                if !expanded.port_ranges.contains(range) {
                    expanded.port_ranges.push(*range);
                }
            }
            expanded.protocols.extend(alias.targets.protocols.iter().copied());
            expanded.fqdns.extend(alias.targets.fqdns.iter().cloned());
            expanded.uris.extend(alias.targets.uris.iter().cloned());
        }
        expanded
    }
}

/// Where a group of resolved targets came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOrigin {
    Direct,
    Alias(String),
}

/// One prefix x port x protocol tuple set, plus its FQDNs and URIs.
///
/// Empty port or protocol lists match any port or protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub origin: TargetOrigin,
    pub prefixes: Vec<IpNetwork>,
    pub port_ranges: Vec<PortRange>,
    pub protocols: BTreeSet<u8>,
    pub fqdns: BTreeSet<String>,
    pub uris: BTreeSet<String>,
}

impl TargetGroup {
    fn from_spec(origin: TargetOrigin, spec: &TargetSpec) -> Self {
        Self {
            origin,
            prefixes: spec.prefixes.clone(),
            port_ranges: spec.port_ranges.clone(),
            protocols: spec.protocols.clone(),
            fqdns: spec.fqdns.clone(),
            uris: spec.uris.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.fqdns.is_empty() && self.uris.is_empty()
    }

    fn ports_overlap(&self, other: &TargetGroup) -> bool {
        if self.port_ranges.is_empty() || other.port_ranges.is_empty() {
            return true;
        }
        self.port_ranges
            .iter()
            .any(|a| other.port_ranges.iter().any(|b| a.overlaps(b)))
    }

    fn protocols_overlap(&self, other: &TargetGroup) -> bool {
        if self.protocols.is_empty() || other.protocols.is_empty() {
            return true;
        }
        self.protocols.intersection(&other.protocols).next().is_some()
    }

    /// Whether both groups target the same network path.
    pub fn overlaps(&self, other: &TargetGroup) -> bool {
        if self.fqdns.intersection(&other.fqdns).next().is_some()
            || self.uris.intersection(&other.uris).next().is_some()
        {
            return true;
        }
        let prefix_hit = self
            .prefixes
            .iter()
            .any(|a| other.prefixes.iter().any(|b| prefixes_overlap(a, b)));
        prefix_hit && self.ports_overlap(other) && self.protocols_overlap(other)
    }
}

/// Alias names on each side of an overlap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetOverlap {
    pub candidate_aliases: BTreeSet<String>,
    pub existing_aliases: BTreeSet<String>,
}

impl TargetOverlap {
    pub fn involves_alias(&self) -> bool {
        !self.candidate_aliases.is_empty() || !self.existing_aliases.is_empty()
    }

    pub fn alias_names(&self) -> Vec<String> {
        self.candidate_aliases
            .union(&self.existing_aliases)
            .cloned()
            .collect()
    }
}

/// Normalized, comparable expansion of a scope's targets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTargets {
    pub groups: Vec<TargetGroup>,
}

impl ResolvedTargets {
    pub fn new(spec: &TargetSpec, aliases: &[Alias]) -> Self {
        let mut groups = Vec::with_capacity(aliases.len() + 1);
        let direct = TargetGroup::from_spec(TargetOrigin::Direct, spec);
        if !direct.is_empty() {
            groups.push(direct);
        }
        for alias in aliases {
            let group = TargetGroup::from_spec(TargetOrigin::Alias(alias.name.clone()), &alias.targets);
            if !group.is_empty() {
                groups.push(group);
            }
        }
        Self { groups }
    }

    /// Compare every group pair, collecting the aliases involved in any hit.
    pub fn overlap(&self, existing: &ResolvedTargets) -> Option<TargetOverlap> {
        let mut found: Option<TargetOverlap> = None;
        for mine in &self.groups {
            for theirs in &existing.groups {
                if !mine.overlaps(theirs) {
                    continue;
                }
                let entry = found.get_or_insert_with(TargetOverlap::default);
                if let TargetOrigin::Alias(name) = &mine.origin {
                    entry.candidate_aliases.insert(name.clone());
                }
                if let TargetOrigin::Alias(name) = &theirs.origin {
                    entry.existing_aliases.insert(name.clone());
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(prefixes: &[&str]) -> TargetSpec {
        TargetSpec {
            prefixes: prefixes.iter().map(|p| parse_prefix(p).unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_port_range_without_upper_is_single_port() {
        let range = PortRange::parse(443, None).unwrap();
        assert_eq!(range, PortRange::new(443, 443));
        assert!(range.includes(443));
        assert!(!range.includes(444));
    }

    #[test]
    fn test_port_range_rejects_bad_bounds() {
        assert!(PortRange::parse(100, Some(10)).is_err());
        assert!(PortRange::parse(-1, None).is_err());
        assert!(PortRange::parse(1, Some(70000)).is_err());
    }

    #[test]
    fn test_prefix_is_normalized() {
        let prefix = parse_prefix("192.0.2.77/24").unwrap();
        assert_eq!(prefix.to_string(), "192.0.2.0/24");
    }

    #[test]
    fn test_prefix_rejects_loopback_and_multicast() {
        assert_eq!(
            parse_prefix("127.0.0.1/32"),
            Err(TargetError::ForbiddenPrefix("127.0.0.1/32".to_string()))
        );
        assert!(parse_prefix("224.0.0.0/8").is_err());
        assert!(parse_prefix("not-a-prefix").is_err());
    }

    #[test]
    fn test_nested_prefixes_overlap() {
        let a = parse_prefix("192.0.2.0/24").unwrap();
        let b = parse_prefix("192.0.2.128/25").unwrap();
        let c = parse_prefix("198.51.100.0/24").unwrap();
        let v6 = parse_prefix("2001:db8::/32").unwrap();
        assert!(prefixes_overlap(&a, &b));
        assert!(prefixes_overlap(&b, &a));
        assert!(!prefixes_overlap(&a, &c));
        assert!(!prefixes_overlap(&a, &v6));
    }

    #[test]
    fn test_disjoint_ports_do_not_overlap() {
        let mut a = spec(&["192.0.2.0/24"]);
        a.port_ranges.push(PortRange::new(80, 80));
        let mut b = spec(&["192.0.2.0/24"]);
        b.port_ranges.push(PortRange::new(443, 443));

        let left = ResolvedTargets::new(&a, &[]);
        let right = ResolvedTargets::new(&b, &[]);
        assert!(left.overlap(&right).is_none());

        b.port_ranges.push(PortRange::new(1, 100));
        let right = ResolvedTargets::new(&b, &[]);
        assert!(left.overlap(&right).is_some());
    }

    #[test]
    fn test_disjoint_protocols_do_not_overlap() {
        let mut a = spec(&["192.0.2.0/24"]);
        a.protocols.insert(6);
        let mut b = spec(&["192.0.2.0/24"]);
        b.protocols.insert(17);
        assert!(ResolvedTargets::new(&a, &[])
            .overlap(&ResolvedTargets::new(&b, &[]))
            .is_none());
    }

    #[test]
    fn test_fqdn_overlap_is_exact_match() {
        let mut a = TargetSpec::default();
        a.fqdns.insert("www.example.com".to_string());
        let mut b = TargetSpec::default();
        b.fqdns.insert("example.com".to_string());
        assert!(ResolvedTargets::new(&a, &[])
            .overlap(&ResolvedTargets::new(&b, &[]))
            .is_none());
        b.fqdns.insert("www.example.com".to_string());
        assert!(ResolvedTargets::new(&a, &[])
            .overlap(&ResolvedTargets::new(&b, &[]))
            .is_some());
    }

    #[test]
    fn test_alias_group_reports_alias_name() {
        let own = spec(&["198.51.100.0/24"]);
        let alias = Alias {
            name: "web-farm".to_string(),
            targets: spec(&["192.0.2.0/24"]),
        };
        let existing = spec(&["192.0.2.10/32"]);

        let overlap = ResolvedTargets::new(&own, &[alias])
            .overlap(&ResolvedTargets::new(&existing, &[]))
            .unwrap();
        assert!(overlap.involves_alias());
        assert_eq!(overlap.alias_names(), vec!["web-farm".to_string()]);
    }

    #[test]
    fn test_expanded_with_appends_alias_criteria() {
        let mut own = spec(&["198.51.100.0/24"]);
        own.alias_names.insert("web-farm".to_string());
        let mut alias_targets = spec(&["192.0.2.0/24", "198.51.100.0/24"]);
        alias_targets.protocols.insert(6);
        let alias = Alias {
            name: "web-farm".to_string(),
            targets: alias_targets,
        };

        let expanded = own.expanded_with(&[alias]);
        assert_eq!(expanded.prefixes.len(), 2);
        assert!(expanded.protocols.contains(&6));
        assert!(expanded.alias_names.contains("web-farm"));
    }

    #[test]
    fn test_activation_requires_a_target() {
        assert_eq!(
            TargetSpec::default().validate_for_activation(),
            Err(TargetError::MissingTarget)
        );
        let mut only_alias = TargetSpec::default();
        only_alias.alias_names.insert("a".to_string());
        assert!(only_alias.validate_for_activation().is_ok());
    }
}
