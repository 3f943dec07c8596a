//! # Mapping data model
//!
//! [`PortMapping`] is owned and persisted by an external store the Agent
//! consumes (the Web UI's CRUD layer, out of scope here). The core only
//! ever sees it as part of a [`ConfigSnapshot`] carried inside a
//! `ConfigSync` frame.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A host sentinel that must never be reachable as an `internalHost`.
const REJECTED_LITERAL_HOSTS: &[&str] = &[
    "127.0.0.1",
    "::1",
    "0.0.0.0",
    "::",
    "169.254.169.254", // AWS/GCP/Azure/DO instance-metadata endpoint
    "metadata.google.internal",
    "metadata.azure.internal",
    "localhost",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: Uuid,
    pub external_domain: String,
    pub internal_host: String,
    pub internal_port: u16,
    pub internal_use_tls: bool,
    pub allow_self_signed_certs: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingValidationError {
    DomainEmpty,
    PortOutOfRange,
    HostRejected(String),
    DuplicateDomain(String),
}

impl std::fmt::Display for MappingValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingValidationError::DomainEmpty => write!(f, "externalDomain must not be empty"),
            MappingValidationError::PortOutOfRange => {
                write!(f, "internalPort must be in [1, 65535]")
            }
            MappingValidationError::HostRejected(host) => {
                write!(f, "internalHost '{host}' is a loopback/link-local/metadata/unspecified address")
            }
            MappingValidationError::DuplicateDomain(domain) => {
                write!(f, "externalDomain '{domain}' is already used by another enabled mapping")
            }
        }
    }
}

impl std::error::Error for MappingValidationError {}

impl PortMapping {
    /// Validates the invariants from the data model: unique domain is
    /// enforced by the caller (across the whole set), this only checks the
    /// single-mapping invariants (port range, rejected host).
    pub fn validate(&self) -> Result<(), MappingValidationError> {
        if self.external_domain.trim().is_empty() {
            return Err(MappingValidationError::DomainEmpty);
        }
        if self.internal_port == 0 {
            return Err(MappingValidationError::PortOutOfRange);
        }
        if !is_internal_host_allowed(&self.internal_host) {
            return Err(MappingValidationError::HostRejected(
                self.internal_host.clone(),
            ));
        }
        Ok(())
    }
}

/// True if `host` is safe to use as an `internalHost`: not loopback, not
/// link-local (169.254.0.0/16), not a known cloud-metadata sentinel, and not
/// unspecified (0.0.0.0 / ::).
pub fn is_internal_host_allowed(host: &str) -> bool {
    let normalized = host.trim().trim_start_matches('[').trim_end_matches(']');
    if REJECTED_LITERAL_HOSTS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(normalized))
    {
        return false;
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        if ip.is_loopback() || ip.is_unspecified() {
            return false;
        }
        if let std::net::IpAddr::V4(v4) = ip {
            if v4.is_link_local() {
                return false;
            }
        }
    }

    true
}

/// Validates every mapping, then drops any *enabled* mapping whose
/// `externalDomain` collides (case-insensitively) with one already kept —
/// first occurrence in list order wins. This is the "unique across the
/// active set" invariant, enforced once here rather than per mapping, since
/// a single mapping can't know about its siblings. Returns the mappings
/// worth keeping plus a `(mapping, error)` pair per dropped entry so the
/// caller can log what was ignored and still apply the rest.
pub fn sanitize(
    mappings: &[PortMapping],
) -> (Vec<PortMapping>, Vec<(PortMapping, MappingValidationError)>) {
    let mut kept = Vec::new();
    let mut rejected = Vec::new();
    let mut seen_domains: std::collections::HashSet<String> = std::collections::HashSet::new();

    for mapping in mappings {
        if let Err(e) = mapping.validate() {
            rejected.push((mapping.clone(), e));
            continue;
        }
        if mapping.is_enabled {
            let key = mapping.external_domain.to_ascii_lowercase();
            if !seen_domains.insert(key) {
                rejected.push((
                    mapping.clone(),
                    MappingValidationError::DuplicateDomain(mapping.external_domain.clone()),
                ));
                continue;
            }
        }
        kept.push(mapping.clone());
    }

    (kept, rejected)
}

/// An ordered snapshot of the enabled mappings plus a content hash computed
/// over the canonicalized list. Two snapshots with the same mappings in the
/// same order hash identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub mappings: Vec<PortMapping>,
    pub config_hash: String,
}

impl ConfigSnapshot {
    /// Builds a snapshot from the full mapping set, keeping only the
    /// enabled entries and computing the config hash over them.
    pub fn from_enabled(all_mappings: &[PortMapping]) -> Self {
        let mappings: Vec<PortMapping> = all_mappings
            .iter()
            .filter(|m| m.is_enabled)
            .cloned()
            .collect();
        let config_hash = compute_config_hash(&mappings);
        Self {
            mappings,
            config_hash,
        }
    }

    pub fn find(&self, id: Uuid) -> Option<&PortMapping> {
        self.mappings.iter().find(|m| m.id == id)
    }

    pub fn find_by_domain(&self, domain: &str) -> Option<&PortMapping> {
        self.mappings
            .iter()
            .find(|m| m.external_domain.eq_ignore_ascii_case(domain))
    }
}

/// Computes the canonical hash of an (already-filtered) mapping list, in
/// list order: `sha256(id | domain | host | port | tls | selfSigned)` per
/// entry, concatenated.
pub fn compute_config_hash(mappings: &[PortMapping]) -> String {
    let mut hasher = Sha256::new();
    for m in mappings {
        hasher.update(m.id.as_bytes());
        hasher.update(b"|");
        hasher.update(m.external_domain.as_bytes());
        hasher.update(b"|");
        hasher.update(m.internal_host.as_bytes());
        hasher.update(b"|");
        hasher.update(m.internal_port.to_be_bytes());
        hasher.update([m.internal_use_tls as u8, m.allow_self_signed_certs as u8]);
        hasher.update(b";");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(host: &str) -> PortMapping {
        PortMapping {
            id: Uuid::new_v4(),
            external_domain: "app.example.test".into(),
            internal_host: host.into(),
            internal_port: 8080,
            internal_use_tls: false,
            allow_self_signed_certs: false,
            is_enabled: true,
        }
    }

    #[test]
    fn rejects_loopback_link_local_metadata_and_unspecified() {
        for host in ["127.0.0.1", "169.254.169.254", "::1", "0.0.0.0", "169.254.1.1"] {
            assert!(
                matches!(
                    mapping(host).validate(),
                    Err(MappingValidationError::HostRejected(_))
                ),
                "expected {host} to be rejected"
            );
        }
    }

    #[test]
    fn accepts_ordinary_private_host() {
        assert!(mapping("10.0.0.5").validate().is_ok());
        assert!(mapping("internal.service.local").validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut m = mapping("10.0.0.5");
        m.internal_port = 0;
        assert_eq!(m.validate(), Err(MappingValidationError::PortOutOfRange));
    }

    #[test]
    fn hash_is_deterministic_and_order_sensitive() {
        let a = mapping("10.0.0.5");
        let mut b = mapping("10.0.0.6");
        b.external_domain = "other.example.test".into();

        let snap1 = ConfigSnapshot::from_enabled(&[a.clone(), b.clone()]);
        let snap2 = ConfigSnapshot::from_enabled(&[a.clone(), b.clone()]);
        assert_eq!(snap1.config_hash, snap2.config_hash);

        let snap3 = ConfigSnapshot::from_enabled(&[b, a]);
        assert_ne!(snap1.config_hash, snap3.config_hash);
    }

    #[test]
    fn disabled_mappings_are_excluded() {
        let mut m = mapping("10.0.0.5");
        m.is_enabled = false;
        let snap = ConfigSnapshot::from_enabled(&[m]);
        assert!(snap.mappings.is_empty());
    }

    #[test]
    fn reapplying_same_set_is_a_noop_hash() {
        let mappings = vec![mapping("10.0.0.5")];
        let first = ConfigSnapshot::from_enabled(&mappings);
        let second = ConfigSnapshot::from_enabled(&mappings);
        assert_eq!(first, second);
    }

    #[test]
    fn sanitize_drops_only_the_invalid_entry_and_keeps_the_rest() {
        let good = mapping("10.0.0.5");
        let mut bad = mapping("10.0.0.6");
        bad.external_domain = "".into();
        bad.id = Uuid::new_v4();

        let (kept, rejected) = sanitize(&[good.clone(), bad.clone()]);
        assert_eq!(kept, vec![good]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0.id, bad.id);
        assert_eq!(rejected[0].1, MappingValidationError::DomainEmpty);
    }

    #[test]
    fn sanitize_drops_the_second_of_two_enabled_mappings_sharing_a_domain() {
        let first = mapping("10.0.0.5");
        let mut second = mapping("10.0.0.6");
        second.id = Uuid::new_v4();
        // Same external_domain as `first` (set by the `mapping` helper).

        let (kept, rejected) = sanitize(&[first.clone(), second.clone()]);
        assert_eq!(kept, vec![first]);
        assert!(matches!(
            rejected[0].1,
            MappingValidationError::DuplicateDomain(_)
        ));
    }

    #[test]
    fn sanitize_allows_a_disabled_mapping_to_share_a_domain_with_an_enabled_one() {
        let enabled = mapping("10.0.0.5");
        let mut disabled = mapping("10.0.0.6");
        disabled.id = Uuid::new_v4();
        disabled.is_enabled = false;

        let (kept, rejected) = sanitize(&[enabled, disabled]);
        assert_eq!(kept.len(), 2);
        assert!(rejected.is_empty());
    }
}
