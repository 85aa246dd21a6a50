//! AWS-facing types and operations
//!
//! Everything the controller knows about AWS lives here: the managed-stack
//! record and its tag/parameter codecs, CloudFormation template synthesis,
//! the CloudFormation/ELBv2/EC2 client seams and target group registration.
//!
//! # Modules
//!
//! - [`stack`] - Managed stack record, stack specification, tag codecs
//! - [`cloudformation`] - CloudFormation client seam and stack operations
//! - [`template`] - CloudFormation template synthesis
//! - [`targets`] - Target group membership reconciliation
//! - [`nodes`] - EC2 node and subnet inventory

pub mod cloudformation;
pub mod nodes;
pub mod stack;
pub mod targets;
pub mod template;

use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::Error;

// =============================================================================
// Tag names persisted on managed CloudFormation stacks
// =============================================================================

/// Tag carrying the controller id on every managed stack
pub const KUBERNETES_CREATOR_TAG: &str = "kubernetes:application";
/// Prefix of the cluster ownership tag, completed by the cluster id
pub const CLUSTER_ID_TAG_PREFIX: &str = "kubernetes.io/cluster/";
/// Legacy cluster tag accepted during migration
pub const CLUSTER_ID_TAG_LEGACY: &str = "KubernetesCluster";
/// Value of the cluster ownership tag
pub const RESOURCE_LIFECYCLE_OWNED: &str = "owned";
/// Prefix of the per-certificate TTL tags, completed by the certificate ARN
pub const CERTIFICATE_ARN_TAG_PREFIX: &str = "ingress:certificate-arn/";
/// Legacy single-certificate tag accepted during migration
pub const CERTIFICATE_ARN_TAG_LEGACY: &str = "ingress:certificate-arn";
/// Tag naming the owning ingress of a non-shared stack
pub const INGRESS_OWNER_TAG: &str = "ingress:owner";
/// Tag holding the base64-encoded JSON extra listener list
pub const EXTRA_LISTENERS_TAG: &str = "ingress:extra-listeners";
/// Tag holding the hash of the CloudWatch alarm configuration
pub const CW_ALARM_CONFIG_HASH_TAG: &str = "cloudwatch:alarm-config-hash";
/// Tag on extra target groups naming the pod label selector
pub const POD_LABEL_TAG: &str = "ingress:podlabel";
/// Tag on extra target groups naming the pod namespace
pub const POD_NAMESPACE_TAG: &str = "ingress:podnamespace";

// =============================================================================
// Policy field enums
// =============================================================================

/// Load balancer scheme
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum LoadBalancerScheme {
    /// Reachable only from within the VPC
    #[serde(rename = "internal")]
    Internal,
    /// Reachable from the internet
    #[default]
    #[serde(rename = "internet-facing")]
    InternetFacing,
}

impl LoadBalancerScheme {
    /// The string AWS uses for this scheme
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::InternetFacing => "internet-facing",
        }
    }

    /// Parse the AWS scheme string; anything unrecognized is None
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internal" => Some(Self::Internal),
            "internet-facing" => Some(Self::InternetFacing),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadBalancerScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP address type of a load balancer
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum IpAddressType {
    /// IPv4 only
    #[default]
    #[serde(rename = "ipv4")]
    Ipv4,
    /// IPv4 and IPv6
    #[serde(rename = "dualstack")]
    Dualstack,
}

impl IpAddressType {
    /// The string AWS uses for this address type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Dualstack => "dualstack",
        }
    }

    /// Parse the AWS address type string; anything unrecognized is None
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ipv4" => Some(Self::Ipv4),
            "dualstack" => Some(Self::Dualstack),
            _ => None,
        }
    }
}

impl std::fmt::Display for IpAddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load balancer type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum LoadBalancerType {
    /// Application load balancer (HTTP/HTTPS listeners)
    #[default]
    #[serde(rename = "application")]
    Application,
    /// Network load balancer (TCP/UDP/TLS listeners)
    #[serde(rename = "network")]
    Network,
}

impl LoadBalancerType {
    /// The string AWS uses for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Network => "network",
        }
    }

    /// Parse the AWS type string; anything unrecognized is None
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "application" => Some(Self::Application),
            "network" => Some(Self::Network),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadBalancerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How targets are addressed in a target group
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TargetType {
    /// Targets are EC2 instance ids
    #[default]
    #[serde(rename = "instance")]
    Instance,
    /// Targets are private IP addresses
    #[serde(rename = "ip")]
    Ip,
}

impl TargetType {
    /// The string AWS uses for this target type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Ip => "ip",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol of an NLB extra listener
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum ListenerProtocol {
    /// TCP
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP
    #[serde(rename = "UDP")]
    Udp,
    /// TCP and UDP on the same port
    #[serde(rename = "TCP_UDP")]
    TcpUdp,
}

impl ListenerProtocol {
    /// The string AWS uses for this protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::TcpUdp => "TCP_UDP",
        }
    }
}

impl std::fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One additional NLB listener requested through the extra-listeners
/// annotation and persisted on the stack as a base64 JSON tag
#[derive(
    Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ExtraListener {
    /// Listener protocol; TCP, UDP or TCP_UDP only
    pub protocol: ListenerProtocol,
    /// Port the load balancer listens on
    #[serde(rename = "listenport")]
    pub listen_port: u16,
    /// Port the target group forwards to
    #[serde(rename = "targetport")]
    pub target_port: u16,
    /// Pod label selector for target registration, `key=value`
    #[serde(rename = "podlabel", default, skip_serializing_if = "String::is_empty")]
    pub pod_label: String,
    /// Namespace the pod label selector applies in; filled from the
    /// annotating resource, empty string allowed
    #[serde(default)]
    pub namespace: String,
}

// =============================================================================
// SSL policies
// =============================================================================

/// Predefined ELB security policies accepted for the ssl-policy annotation
static SSL_POLICIES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ELBSecurityPolicy-2016-08",
        "ELBSecurityPolicy-FS-2018-06",
        "ELBSecurityPolicy-TLS-1-2-2017-01",
        "ELBSecurityPolicy-TLS-1-2-Ext-2018-06",
        "ELBSecurityPolicy-TLS-1-1-2017-01",
        "ELBSecurityPolicy-2015-05",
        "ELBSecurityPolicy-TLS-1-0-2015-04",
        "ELBSecurityPolicy-FS-1-1-2019-08",
        "ELBSecurityPolicy-FS-1-2-2019-08",
        "ELBSecurityPolicy-FS-1-2-Res-2019-08",
        "ELBSecurityPolicy-FS-1-2-Res-2020-10",
        "ELBSecurityPolicy-TLS13-1-2-2021-06",
        "ELBSecurityPolicy-TLS13-1-2-Res-2021-06",
        "ELBSecurityPolicy-TLS13-1-2-Ext1-2021-06",
        "ELBSecurityPolicy-TLS13-1-2-Ext2-2021-06",
        "ELBSecurityPolicy-TLS13-1-1-2021-06",
        "ELBSecurityPolicy-TLS13-1-0-2021-06",
        "ELBSecurityPolicy-TLS13-1-3-2021-06",
    ]
    .into_iter()
    .collect()
});

/// True when the given name is a predefined ELB security policy
pub fn is_valid_ssl_policy(name: &str) -> bool {
    SSL_POLICIES.contains(name)
}

// =============================================================================
// SDK error classification
// =============================================================================

/// Map an AWS SDK error onto an [`Error`] kind
///
/// 403-class codes become PermissionDenied, absent-resource codes become
/// NotFound, everything else (throttling, 5xx, dispatch failures, timeouts)
/// is Transient and retried by the next tick.
pub(crate) fn sdk_error<E, R>(operation: &str, err: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.as_service_error() {
        Some(svc) => {
            let code = svc.code().unwrap_or_default();
            let message = svc.message().unwrap_or_default();
            if matches!(
                code,
                "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation"
            ) {
                Error::permission_denied(operation, format!("{code}: {message}"))
            } else if code.contains("NotFound") || message.contains("does not exist") {
                Error::not_found(format!("{operation}: {message}"))
            } else {
                Error::transient(operation, format!("{code}: {message}"))
            }
        }
        None => Error::transient(operation, DisplayErrorContext(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_round_trips_through_aws_strings() {
        assert_eq!(
            LoadBalancerScheme::parse("internal"),
            Some(LoadBalancerScheme::Internal)
        );
        assert_eq!(
            LoadBalancerScheme::parse("internet-facing"),
            Some(LoadBalancerScheme::InternetFacing)
        );
        assert_eq!(LoadBalancerScheme::parse("Internal"), None);
        assert_eq!(LoadBalancerScheme::Internal.as_str(), "internal");
    }

    #[test]
    fn listener_protocol_serializes_as_aws_constants() {
        let json = serde_json::to_string(&ListenerProtocol::TcpUdp).unwrap();
        assert_eq!(json, "\"TCP_UDP\"");
        let parsed: ListenerProtocol = serde_json::from_str("\"UDP\"").unwrap();
        assert_eq!(parsed, ListenerProtocol::Udp);
        assert!(serde_json::from_str::<ListenerProtocol>("\"TLS\"").is_err());
    }

    #[test]
    fn extra_listener_parses_annotation_json() {
        let raw = r#"[{"protocol":"TCP","listenport":22,"targetport":2222,"podlabel":"application=ssh-service"}]"#;
        let listeners: Vec<ExtraListener> = serde_json::from_str(raw).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].protocol, ListenerProtocol::Tcp);
        assert_eq!(listeners[0].listen_port, 22);
        assert_eq!(listeners[0].target_port, 2222);
        assert_eq!(listeners[0].pod_label, "application=ssh-service");
        assert_eq!(listeners[0].namespace, "");
    }

    #[test]
    fn ssl_policy_table_accepts_known_policies_only() {
        assert!(is_valid_ssl_policy("ELBSecurityPolicy-2016-08"));
        assert!(is_valid_ssl_policy("ELBSecurityPolicy-TLS13-1-2-2021-06"));
        assert!(!is_valid_ssl_policy("ELBSecurityPolicy-Bogus"));
        assert!(!is_valid_ssl_policy(""));
    }
}
