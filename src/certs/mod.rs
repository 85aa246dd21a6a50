//! Certificate inventory
//!
//! The matcher consumes a per-tick snapshot of the certificates visible in
//! AWS Certificate Manager: ARN, covered hostnames (literal and wildcard)
//! and expiry. Discovery is a collaborator behind [`CertificateSource`];
//! the inventory itself is plain data with a lifetime of one tick.

pub mod matcher;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// One discovered certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateDetail {
    /// Certificate ARN
    pub arn: String,
    /// Hostnames the certificate covers, literal or wildcard
    pub hostnames: Vec<String>,
    /// Expiry of the certificate
    pub not_after: DateTime<Utc>,
}

/// Snapshot of all usable certificates, keyed by ARN
#[derive(Clone, Debug, Default)]
pub struct CertificateInventory {
    certs: BTreeMap<String, CertificateDetail>,
}

impl CertificateInventory {
    /// Build an inventory from discovered certificates
    pub fn new(certs: Vec<CertificateDetail>) -> Self {
        Self {
            certs: certs.into_iter().map(|c| (c.arn.clone(), c)).collect(),
        }
    }

    /// True when the inventory holds the given ARN
    pub fn contains(&self, arn: &str) -> bool {
        self.certs.contains_key(arn)
    }

    /// Iterate the certificates in ARN order
    pub fn iter(&self) -> impl Iterator<Item = &CertificateDetail> {
        self.certs.values()
    }

    /// Number of certificates in the inventory
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// True when no certificates were discovered
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// Abstraction over certificate discovery
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Discover the currently usable certificates
    async fn inventory(&self) -> Result<CertificateInventory, Error>;
}

// =============================================================================
// ACM implementation
// =============================================================================

/// Certificate discovery backed by AWS Certificate Manager
pub struct AcmCertificateSource {
    client: aws_sdk_acm::Client,
}

impl AcmCertificateSource {
    /// Create a new ACM-backed certificate source
    pub fn new(client: aws_sdk_acm::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateSource for AcmCertificateSource {
    async fn inventory(&self) -> Result<CertificateInventory, Error> {
        use aws_sdk_acm::types::CertificateStatus;

        let mut arns = Vec::new();
        let mut pages = self
            .client
            .list_certificates()
            .certificate_statuses(CertificateStatus::Issued)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| crate::aws::sdk_error("ListCertificates", &e))?;
            for summary in page.certificate_summary_list() {
                if let Some(arn) = summary.certificate_arn() {
                    arns.push(arn.to_string());
                }
            }
        }

        let mut certs = Vec::with_capacity(arns.len());
        for arn in arns {
            let resp = self
                .client
                .describe_certificate()
                .certificate_arn(&arn)
                .send()
                .await
                .map_err(|e| crate::aws::sdk_error("DescribeCertificate", &e))?;
            let Some(cert) = resp.certificate() else {
                continue;
            };
            let mut hostnames: Vec<String> = cert
                .subject_alternative_names()
                .iter()
                .map(|s| s.to_string())
                .collect();
            if let Some(domain) = cert.domain_name() {
                if !hostnames.iter().any(|h| h == domain) {
                    hostnames.push(domain.to_string());
                }
            }
            let Some(not_after) = cert.not_after() else {
                continue;
            };
            let Some(not_after) = Utc.timestamp_opt(not_after.secs(), 0).single() else {
                continue;
            };
            certs.push(CertificateDetail {
                arn,
                hostnames,
                not_after,
            });
        }

        Ok(CertificateInventory::new(certs))
    }
}
