//! Per-ingress certificate election
//!
//! For every hostname of an ingress the matcher picks one certificate from
//! the inventory; the ingress's certificate set is the union of the
//! per-hostname choices. The election rule is a total order in one
//! comparator: exact matches beat wildcards, longer wildcard suffixes beat
//! shorter ones, later expiry beats earlier, lexically smaller ARNs break
//! the remaining ties.

use std::collections::BTreeSet;

use crate::certs::{CertificateDetail, CertificateInventory};
use crate::error::Error;
use crate::ingress::IngressRecord;

/// True when a certificate hostname (literal or wildcard) covers the
/// given hostname
///
/// A wildcard covers exactly one additional DNS label.
pub fn hostname_covered(cert_host: &str, hostname: &str) -> bool {
    let cert_host = cert_host.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();

    if let Some(suffix) = cert_host.strip_prefix("*.") {
        match hostname.strip_suffix(suffix) {
            Some(prefix) => {
                // prefix is "<label>." for a one-label expansion
                let label = prefix.strip_suffix('.').unwrap_or("");
                !label.is_empty() && !label.contains('.')
            }
            None => false,
        }
    } else {
        cert_host == hostname
    }
}

/// Match specificity of one certificate hostname against a target
/// hostname; higher sorts better
fn specificity(cert_host: &str, hostname: &str) -> Option<(u8, usize)> {
    if !hostname_covered(cert_host, hostname) {
        return None;
    }
    if cert_host.starts_with("*.") {
        Some((1, cert_host.len() - 2))
    } else {
        Some((2, cert_host.len()))
    }
}

/// The best covering certificate for one hostname, None when nothing covers
fn best_for_hostname<'a>(
    hostname: &str,
    inventory: &'a CertificateInventory,
) -> Option<&'a CertificateDetail> {
    inventory
        .iter()
        .filter_map(|cert| {
            cert.hostnames
                .iter()
                .filter_map(|h| specificity(h, hostname))
                .max()
                .map(|spec| (spec, cert))
        })
        // max_by returns the last maximal element, so order the comparator
        // to leave the lexically-smallest ARN on top: better specificity,
        // then later expiry, then *greater* ARN compares Less.
        .max_by(|(spec_a, a), (spec_b, b)| {
            spec_a
                .cmp(spec_b)
                .then(a.not_after.cmp(&b.not_after))
                .then(b.arn.cmp(&a.arn))
        })
        .map(|(_, cert)| cert)
}

/// Elect the certificate set for one ingress
///
/// An explicit override is verified against the inventory and used alone;
/// a missing override is an error and the caller drops the ingress from
/// the tick. Cluster-local ingresses elect nothing.
pub fn elect_certificates(
    ingress: &IngressRecord,
    inventory: &CertificateInventory,
) -> Result<BTreeSet<String>, Error> {
    if ingress.cluster_local {
        return Ok(BTreeSet::new());
    }

    if !ingress.certificate_arn.is_empty() {
        if !inventory.contains(&ingress.certificate_arn) {
            return Err(Error::not_found(format!(
                "certificate {} requested by {} not found in inventory",
                ingress.certificate_arn,
                ingress.resource_id()
            )));
        }
        return Ok(BTreeSet::from([ingress.certificate_arn.clone()]));
    }

    let mut elected = BTreeSet::new();
    for hostname in &ingress.hostnames {
        if let Some(cert) = best_for_hostname(hostname, inventory) {
            elected.insert(cert.arn.clone());
        }
    }

    if elected.is_empty() {
        return Err(Error::not_found(format!(
            "no certificate covers any hostname of {}",
            ingress.resource_id()
        )));
    }

    Ok(elected)
}
