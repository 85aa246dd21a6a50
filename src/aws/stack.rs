//! Managed CloudFormation stack records
//!
//! A [`Stack`] mirrors one remote CloudFormation stack owned by this
//! controller. The authoritative persistent state for elected certificates
//! is the stack's tag set: one `ingress:certificate-arn/<ARN>` tag per
//! certificate, valued with the RFC3339 instant until which the election
//! holds. When every election has lapsed the stack is garbage-collected.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aws::{
    ExtraListener, IpAddressType, LoadBalancerScheme, LoadBalancerType, TargetType,
    CERTIFICATE_ARN_TAG_LEGACY, CERTIFICATE_ARN_TAG_PREFIX, CLUSTER_ID_TAG_LEGACY,
    CLUSTER_ID_TAG_PREFIX, CW_ALARM_CONFIG_HASH_TAG, EXTRA_LISTENERS_TAG, INGRESS_OWNER_TAG,
    KUBERNETES_CREATOR_TAG, RESOURCE_LIFECYCLE_OWNED,
};
use crate::config::{DenyInternalDomains, HealthCheck};
use crate::error::Error;

// =============================================================================
// Template parameter and output names (stable external interface)
// =============================================================================

/// Scheme parameter
pub const PARAM_SCHEME: &str = "LoadBalancerSchemeParameter";
/// Security group parameter
pub const PARAM_SECURITY_GROUP: &str = "LoadBalancerSecurityGroupParameter";
/// Subnets parameter
pub const PARAM_SUBNETS: &str = "LoadBalancerSubnetsParameter";
/// Health check path parameter
pub const PARAM_HEALTH_CHECK_PATH: &str = "TargetGroupHealthCheckPathParameter";
/// Health check port parameter
pub const PARAM_HEALTH_CHECK_PORT: &str = "TargetGroupHealthCheckPortParameter";
/// Health check interval parameter
pub const PARAM_HEALTH_CHECK_INTERVAL: &str = "TargetGroupHealthCheckIntervalParameter";
/// Health check timeout parameter
pub const PARAM_HEALTH_CHECK_TIMEOUT: &str = "TargetGroupHealthCheckTimeoutParameter";
/// Primary target port parameter
pub const PARAM_TARGET_PORT: &str = "TargetGroupTargetPortParameter";
/// HTTP target port parameter, present only when distinct from the primary
pub const PARAM_HTTP_TARGET_PORT: &str = "TargetGroupHTTPTargetPortParameter";
/// VPC id parameter
pub const PARAM_VPC_ID: &str = "TargetGroupVPCIDParameter";
/// SSL policy parameter
pub const PARAM_SSL_POLICY: &str = "ListenerSslPolicyParameter";
/// IP address type parameter
pub const PARAM_IP_ADDRESS_TYPE: &str = "IpAddressType";
/// Load balancer type parameter
pub const PARAM_LOAD_BALANCER_TYPE: &str = "Type";
/// WAF web ACL id parameter, present only when a WAF is associated
pub const PARAM_WAF_WEB_ACL_ID: &str = "LoadBalancerWAFWebACLIDParameter";
/// HTTP/2 parameter
pub const PARAM_HTTP2: &str = "HTTP2";

/// DNS name output
pub const OUTPUT_DNS_NAME: &str = "LoadBalancerDNSName";
/// Load balancer ARN output
pub const OUTPUT_LOAD_BALANCER_ARN: &str = "LoadBalancerARN";
/// Primary target group ARN output
pub const OUTPUT_TARGET_GROUP_ARN: &str = "TargetGroupARN";
/// HTTP target group ARN output
pub const OUTPUT_HTTP_TARGET_GROUP_ARN: &str = "HTTPTargetGroupARN";

const EXTRA_TG_OUTPUT_PREFIX: &str = "ExtraTG";

// =============================================================================
// CloudFormation stack status classification
// =============================================================================

const COMPLETE_STATUSES: [&str; 4] = [
    "CREATE_COMPLETE",
    "UPDATE_COMPLETE",
    "ROLLBACK_COMPLETE",
    "UPDATE_ROLLBACK_COMPLETE",
];

fn is_in_progress_status(status: &str) -> bool {
    status.ends_with("_IN_PROGRESS")
}

// =============================================================================
// Stack record
// =============================================================================

/// An SDK-free snapshot of a remote CloudFormation stack, as returned by the
/// [`CloudFormationApi`](crate::aws::cloudformation::CloudFormationApi) seam
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CfStackData {
    /// Stack name
    pub name: String,
    /// Stack status, e.g. `CREATE_COMPLETE`
    pub status: String,
    /// Status reason reported by CloudFormation, often empty
    pub status_reason: String,
    /// Output key to value
    pub outputs: BTreeMap<String, String>,
    /// Parameter key to value
    pub parameters: BTreeMap<String, String>,
    /// Tag key to value
    pub tags: BTreeMap<String, String>,
}

/// One CloudFormation stack managed by this controller
#[derive(Clone, Debug, PartialEq)]
pub struct Stack {
    /// Stack name
    pub name: String,
    status: String,
    status_reason: String,
    /// DNS name of the load balancer, from the stack outputs
    pub dns_name: String,
    /// ARN of the load balancer, from the stack outputs
    pub load_balancer_arn: String,
    /// Load balancer scheme
    pub scheme: LoadBalancerScheme,
    /// Security group id, empty for network load balancers
    pub security_group: String,
    /// SSL policy of the TLS listener
    pub ssl_policy: String,
    /// IP address type
    pub ip_address_type: IpAddressType,
    /// Load balancer type
    pub load_balancer_type: LoadBalancerType,
    /// Whether HTTP/2 is enabled
    pub http2: bool,
    /// Associated WAF web ACL id, empty when none
    pub waf_web_acl_id: String,
    /// Owning ingress `namespace/name`; set iff the stack is not shared
    pub owner_ingress: String,
    /// Hash of the CloudWatch alarm configuration baked into the template
    pub cw_alarm_config_hash: String,
    /// Elected certificates: ARN to election TTL; None is the zero instant
    /// (unknown/legacy), which blocks garbage collection
    pub certificate_arns: BTreeMap<String, Option<DateTime<Utc>>>,
    /// Extra listeners reconstructed from the stack tag
    pub extra_listeners: Vec<ExtraListener>,
    outputs: BTreeMap<String, String>,
    /// Full parameter set of the stack
    pub parameters: BTreeMap<String, String>,
    /// Full tag set of the stack
    pub tags: BTreeMap<String, String>,
}

/// The instant encoding an unknown/legacy certificate election
///
/// Written for preserved zero TTLs and decoded back to None; it never
/// compares as lapsed.
pub fn zero_instant() -> DateTime<Utc> {
    chrono::TimeZone::with_ymd_and_hms(&Utc, 1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Stack {
    /// True when the stack status is one of the terminal complete states
    pub fn is_complete(&self) -> bool {
        COMPLETE_STATUSES.contains(&self.status.as_str())
    }

    /// True when every certificate election has lapsed and the stack may be
    /// garbage-collected
    ///
    /// A zero (unknown) TTL blocks deletion. A stack without any election
    /// is immediately eligible once no bucket matches it.
    pub fn should_delete(&self, now: DateTime<Utc>) -> bool {
        self.certificate_arns
            .values()
            .all(|ttl| matches!(ttl, Some(t) if *t <= now))
    }

    /// None while the stack is progressing or complete; a
    /// [`Error::Stack`] for non-progressing failed states
    pub fn err(&self) -> Option<Error> {
        if self.is_complete() || is_in_progress_status(&self.status) {
            return None;
        }
        Some(Error::Stack {
            name: self.name.clone(),
            status: self.status.clone(),
            reason: self.status_reason.clone(),
        })
    }

    /// The CloudFormation status string
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Every target group ARN exposed through the stack outputs
    pub fn target_group_arns(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|(k, _)| k.contains("TargetGroupARN"))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Target group ARNs registered with node targets (primary and HTTP)
    pub fn instance_target_group_arns(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|(k, _)| {
                k.contains("TargetGroupARN") && !k.starts_with(EXTRA_TG_OUTPUT_PREFIX)
            })
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Extra-listener target groups as `(listener index, ARN)` pairs
    ///
    /// The index is the `<N>` of the `ExtraTG<N>TargetGroupARN` output and
    /// addresses the sorted extra-listener list.
    pub fn extra_target_group_arns(&self) -> Vec<(usize, String)> {
        let mut pairs: Vec<(usize, String)> = self
            .outputs
            .iter()
            .filter_map(|(k, v)| {
                let n = k
                    .strip_prefix(EXTRA_TG_OUTPUT_PREFIX)?
                    .strip_suffix(OUTPUT_TARGET_GROUP_ARN)?;
                n.parse::<usize>().ok().map(|i| (i, v.clone()))
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Decode a described stack into a managed stack record
    ///
    /// Unparseable certificate TTLs decode as the zero instant; the legacy
    /// single-certificate tag decodes as one ARN at the zero instant.
    pub fn from_cf(data: &CfStackData) -> Result<Self, Error> {
        let mut certificate_arns: BTreeMap<String, Option<DateTime<Utc>>> = BTreeMap::new();
        let mut owner_ingress = String::new();
        let mut extra_listeners: Vec<ExtraListener> = Vec::new();

        for (key, value) in &data.tags {
            if let Some(arn) = key.strip_prefix(CERTIFICATE_ARN_TAG_PREFIX) {
                let ttl = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
                    .filter(|t| *t > zero_instant());
                certificate_arns.insert(arn.to_string(), ttl);
            }
            if key == CERTIFICATE_ARN_TAG_LEGACY {
                certificate_arns.insert(value.clone(), None);
            }
            if key == INGRESS_OWNER_TAG {
                owner_ingress = value.clone();
            }
            if key == EXTRA_LISTENERS_TAG {
                let decoded = BASE64.decode(value).map_err(|e| {
                    Error::transient(
                        "DecodeExtraListenersTag",
                        format!("stack {}: {e}", data.name),
                    )
                })?;
                extra_listeners = serde_json::from_slice(&decoded).map_err(|e| {
                    Error::transient(
                        "DecodeExtraListenersTag",
                        format!("stack {}: {e}", data.name),
                    )
                })?;
            }
        }

        Ok(Stack {
            name: data.name.clone(),
            status: data.status.clone(),
            status_reason: data.status_reason.clone(),
            dns_name: data.outputs.get(OUTPUT_DNS_NAME).cloned().unwrap_or_default(),
            load_balancer_arn: data
                .outputs
                .get(OUTPUT_LOAD_BALANCER_ARN)
                .cloned()
                .unwrap_or_default(),
            scheme: data
                .parameters
                .get(PARAM_SCHEME)
                .and_then(|s| LoadBalancerScheme::parse(s))
                .unwrap_or_default(),
            security_group: data
                .parameters
                .get(PARAM_SECURITY_GROUP)
                .cloned()
                .unwrap_or_default(),
            ssl_policy: data
                .parameters
                .get(PARAM_SSL_POLICY)
                .cloned()
                .unwrap_or_default(),
            ip_address_type: data
                .parameters
                .get(PARAM_IP_ADDRESS_TYPE)
                .and_then(|s| IpAddressType::parse(s))
                .unwrap_or_default(),
            load_balancer_type: data
                .parameters
                .get(PARAM_LOAD_BALANCER_TYPE)
                .and_then(|s| LoadBalancerType::parse(s))
                .unwrap_or_default(),
            http2: data.parameters.get(PARAM_HTTP2).map(String::as_str) != Some("false"),
            waf_web_acl_id: data
                .parameters
                .get(PARAM_WAF_WEB_ACL_ID)
                .cloned()
                .unwrap_or_default(),
            owner_ingress,
            cw_alarm_config_hash: data
                .tags
                .get(CW_ALARM_CONFIG_HASH_TAG)
                .cloned()
                .unwrap_or_default(),
            certificate_arns,
            extra_listeners,
            outputs: data.outputs.clone(),
            parameters: data.parameters.clone(),
            tags: data.tags.clone(),
        })
    }
}

/// True when the tag set marks a stack as managed by this controller
///
/// Accepts the owned-cluster tag pair or the legacy cluster tag kept for
/// migration.
pub fn is_managed_stack(
    tags: &BTreeMap<String, String>,
    cluster_id: &str,
    controller_id: &str,
) -> bool {
    if tags.get(KUBERNETES_CREATOR_TAG).map(String::as_str) != Some(controller_id) {
        return false;
    }
    let owned_tag = format!("{CLUSTER_ID_TAG_PREFIX}{cluster_id}");
    tags.get(&owned_tag).map(String::as_str) == Some(RESOURCE_LIFECYCLE_OWNED)
        || tags.get(CLUSTER_ID_TAG_LEGACY).map(String::as_str) == Some(cluster_id)
}

// =============================================================================
// CloudWatch alarms
// =============================================================================

/// One CloudWatch alarm definition read from the alarm ConfigMap
///
/// Field names mirror the CloudFormation `AWS::CloudWatch::Alarm` property
/// casing so ConfigMap entries read like template fragments.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CloudWatchAlarm {
    /// Metric watched by the alarm
    pub metric_name: String,
    /// Metric namespace
    #[serde(default = "default_alarm_namespace")]
    pub namespace: String,
    /// Statistic applied to the metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    /// Evaluation period in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    /// Number of periods the threshold must be breached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_periods: Option<u32>,
    /// Alarm threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Comparison operator against the threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_operator: Option<String>,
}

fn default_alarm_namespace() -> String {
    "AWS/ApplicationELB".to_string()
}

/// Hash of an alarm list, stored in the `cloudwatch:alarm-config-hash` tag
/// and compared for drift
pub fn alarm_config_hash(alarms: &[CloudWatchAlarm]) -> String {
    if alarms.is_empty() {
        return String::new();
    }
    // serde_json maps are sorted, so the canonical JSON is deterministic.
    let canonical = serde_json::to_string(alarms).unwrap_or_default();
    sha256_hex(canonical.as_bytes())
}

// =============================================================================
// Stack specification
// =============================================================================

/// Everything template synthesis and the stack operations need to provision
/// one load balancer stack
#[derive(Clone, Debug, Default)]
pub struct StackSpec {
    /// Stack name
    pub name: String,
    /// Load balancer scheme
    pub scheme: LoadBalancerScheme,
    /// Owning ingress `namespace/name`, empty for shared stacks
    pub owner_ingress: String,
    /// Subnets the load balancer spans
    pub subnets: Vec<String>,
    /// Elected certificates and their election TTLs
    pub certificate_arns: BTreeMap<String, DateTime<Utc>>,
    /// Security group id, empty for network load balancers
    pub security_group_id: String,
    /// Cluster id written to the ownership tag
    pub cluster_id: String,
    /// VPC the target groups live in
    pub vpc_id: String,
    /// Health check settings; None leaves the target group defaults
    pub health_check: Option<HealthCheck>,
    /// ALB healthy threshold count
    pub alb_healthy_threshold_count: u32,
    /// ALB unhealthy threshold count
    pub alb_unhealthy_threshold_count: u32,
    /// NLB healthy threshold count
    pub nlb_healthy_threshold_count: u32,
    /// How targets are addressed
    pub target_type: TargetType,
    /// Primary target port
    pub target_port: u16,
    /// Disable the plain HTTP listener
    pub http_disabled: bool,
    /// Distinct HTTP target port; 0 means same as primary
    pub http_target_port: u16,
    /// Stack creation timeout
    pub timeout_minutes: u32,
    /// Whether termination protection is enabled
    pub termination_protection: bool,
    /// Idle connection timeout for ALBs
    pub idle_connection_timeout_seconds: u32,
    /// Target deregistration delay
    pub deregistration_delay_seconds: u32,
    /// Controller id written to the creator tag
    pub controller_id: String,
    /// SSL policy of the TLS listener
    pub ssl_policy: String,
    /// IP address type
    pub ip_address_type: IpAddressType,
    /// Load balancer type
    pub load_balancer_type: LoadBalancerType,
    /// S3 bucket receiving access logs, empty disables logging
    pub alb_logs_s3_bucket: String,
    /// Prefix within the access log bucket
    pub alb_logs_s3_prefix: String,
    /// WAF web ACL id, empty when none
    pub waf_web_acl_id: String,
    /// CloudWatch alarms baked into the template
    pub cloudwatch_alarms: Vec<CloudWatchAlarm>,
    /// Emit an HTTP to HTTPS redirect instead of forwarding
    pub http_redirect_to_https: bool,
    /// Enable cross-zone balancing on NLBs
    pub nlb_cross_zone: bool,
    /// Extra NLB listeners, sorted
    pub extra_listeners: Vec<ExtraListener>,
    /// HTTP/2 enabled
    pub http2: bool,
    /// Fixed-response rule for internal domains
    pub deny_internal_domains: DenyInternalDomains,
    /// Free-form tags merged onto the stack
    pub tags: BTreeMap<String, String>,
}

impl StackSpec {
    /// The CloudFormation parameter list for create and update calls
    pub fn parameters(&self) -> Vec<(String, String)> {
        let mut params = vec![
            (PARAM_SCHEME.to_string(), self.scheme.to_string()),
            (
                PARAM_SECURITY_GROUP.to_string(),
                self.security_group_id.clone(),
            ),
            (PARAM_SUBNETS.to_string(), self.subnets.join(",")),
            (PARAM_VPC_ID.to_string(), self.vpc_id.clone()),
            (PARAM_TARGET_PORT.to_string(), self.target_port.to_string()),
            (PARAM_SSL_POLICY.to_string(), self.ssl_policy.clone()),
            (
                PARAM_IP_ADDRESS_TYPE.to_string(),
                self.ip_address_type.to_string(),
            ),
            (
                PARAM_LOAD_BALANCER_TYPE.to_string(),
                self.load_balancer_type.to_string(),
            ),
            (PARAM_HTTP2.to_string(), self.http2.to_string()),
        ];

        if !self.waf_web_acl_id.is_empty() {
            params.push((PARAM_WAF_WEB_ACL_ID.to_string(), self.waf_web_acl_id.clone()));
        }

        if self.has_distinct_http_target_port() {
            params.push((
                PARAM_HTTP_TARGET_PORT.to_string(),
                self.http_target_port.to_string(),
            ));
        }

        if let Some(hc) = &self.health_check {
            params.push((PARAM_HEALTH_CHECK_PATH.to_string(), hc.path.clone()));
            params.push((PARAM_HEALTH_CHECK_PORT.to_string(), hc.port.to_string()));
            params.push((
                PARAM_HEALTH_CHECK_INTERVAL.to_string(),
                hc.interval_seconds.to_string(),
            ));
            params.push((
                PARAM_HEALTH_CHECK_TIMEOUT.to_string(),
                hc.timeout_seconds.to_string(),
            ));
        }

        params
    }

    /// The full tag set for create and update calls
    pub fn build_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(
            KUBERNETES_CREATOR_TAG.to_string(),
            self.controller_id.clone(),
        );
        tags.insert(
            format!("{CLUSTER_ID_TAG_PREFIX}{}", self.cluster_id),
            RESOURCE_LIFECYCLE_OWNED.to_string(),
        );

        for (arn, ttl) in &self.certificate_arns {
            tags.insert(
                format!("{CERTIFICATE_ARN_TAG_PREFIX}{arn}"),
                ttl.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }

        if !self.owner_ingress.is_empty() {
            tags.insert(INGRESS_OWNER_TAG.to_string(), self.owner_ingress.clone());
        }

        if !self.cloudwatch_alarms.is_empty() {
            tags.insert(
                CW_ALARM_CONFIG_HASH_TAG.to_string(),
                alarm_config_hash(&self.cloudwatch_alarms),
            );
        }

        if !self.extra_listeners.is_empty() {
            let listeners = serde_json::to_vec(&self.extra_listeners).unwrap_or_default();
            tags.insert(EXTRA_LISTENERS_TAG.to_string(), BASE64.encode(listeners));
        }

        tags
    }

    /// True when an HTTP listener with its own target group is emitted
    pub fn has_distinct_http_target_port(&self) -> bool {
        !self.http_disabled && self.http_target_port != 0 && self.http_target_port != self.target_port
    }
}

// =============================================================================
// Stack naming
// =============================================================================

/// Derive the deterministic stack name for a bucket
///
/// The name is the normalized cluster id plus a short digest of the bucket
/// discriminator, valid as a CloudFormation stack name and stable across
/// ticks.
pub fn stack_name(cluster_id: &str, discriminator: &str) -> String {
    let mut normalized: String = cluster_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if !normalized
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
    {
        normalized.insert_str(0, "lb-");
    }
    normalized.truncate(116);

    let digest = sha256_hex(format!("{cluster_id}\n{discriminator}").as_bytes());
    format!("{normalized}-{}", &digest[..10])
}

/// Lowercase hex SHA-256 of the input
pub(crate) fn sha256_hex(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn managed_tags() -> BTreeMap<String, String> {
        [
            (KUBERNETES_CREATOR_TAG, "kube-ingress-aws-controller"),
            ("kubernetes.io/cluster/prod", "owned"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn cf_stack(status: &str, tags: BTreeMap<String, String>) -> CfStackData {
        CfStackData {
            name: "prod-0123456789".to_string(),
            status: status.to_string(),
            status_reason: String::new(),
            outputs: BTreeMap::new(),
            parameters: BTreeMap::new(),
            tags,
        }
    }

    #[test]
    fn complete_states_classify_as_complete() {
        for status in [
            "CREATE_COMPLETE",
            "UPDATE_COMPLETE",
            "ROLLBACK_COMPLETE",
            "UPDATE_ROLLBACK_COMPLETE",
        ] {
            let stack = Stack::from_cf(&cf_stack(status, managed_tags())).unwrap();
            assert!(stack.is_complete(), "{status} should be complete");
            assert!(stack.err().is_none(), "{status} should not error");
        }
    }

    #[test]
    fn in_progress_states_are_neither_complete_nor_errored() {
        for status in ["CREATE_IN_PROGRESS", "UPDATE_IN_PROGRESS", "DELETE_IN_PROGRESS"] {
            let stack = Stack::from_cf(&cf_stack(status, managed_tags())).unwrap();
            assert!(!stack.is_complete());
            assert!(stack.err().is_none());
        }
    }

    #[test]
    fn failed_states_surface_a_stack_error() {
        let mut data = cf_stack("CREATE_FAILED", managed_tags());
        data.status_reason = "Resource limit exceeded".to_string();
        let stack = Stack::from_cf(&data).unwrap();
        assert!(!stack.is_complete());
        let err = stack.err().unwrap();
        assert!(err.to_string().contains("CREATE_FAILED"));
        assert!(err.to_string().contains("Resource limit exceeded"));
    }

    #[test]
    fn certificate_ttl_tags_decode() {
        let now = Utc::now();
        let mut tags = managed_tags();
        tags.insert(
            format!("{CERTIFICATE_ARN_TAG_PREFIX}arn:aws:acm::123:certificate/a"),
            (now + Duration::hours(24)).to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        tags.insert(
            format!("{CERTIFICATE_ARN_TAG_PREFIX}arn:aws:acm::123:certificate/b"),
            "not-a-timestamp".to_string(),
        );
        let stack = Stack::from_cf(&cf_stack("CREATE_COMPLETE", tags)).unwrap();
        assert_eq!(stack.certificate_arns.len(), 2);
        assert!(stack.certificate_arns["arn:aws:acm::123:certificate/a"].is_some());
        // unparseable timestamps become the zero instant
        assert!(stack.certificate_arns["arn:aws:acm::123:certificate/b"].is_none());
    }

    #[test]
    fn legacy_certificate_tag_decodes_with_zero_ttl() {
        let mut tags = managed_tags();
        tags.insert(
            CERTIFICATE_ARN_TAG_LEGACY.to_string(),
            "arn:aws:acm::123:certificate/legacy".to_string(),
        );
        let stack = Stack::from_cf(&cf_stack("CREATE_COMPLETE", tags)).unwrap();
        assert_eq!(
            stack.certificate_arns["arn:aws:acm::123:certificate/legacy"],
            None
        );
        assert!(!stack.should_delete(Utc::now()));
    }

    #[test]
    fn stack_drains_until_every_ttl_lapses() {
        let now = Utc::now();
        let mut tags = managed_tags();
        tags.insert(
            format!("{CERTIFICATE_ARN_TAG_PREFIX}arn-a"),
            (now + Duration::hours(24)).to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        tags.insert(
            format!("{CERTIFICATE_ARN_TAG_PREFIX}arn-b"),
            (now - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let stack = Stack::from_cf(&cf_stack("CREATE_COMPLETE", tags)).unwrap();
        // arn-a is still elected: not deletable
        assert!(!stack.should_delete(now));
        // after arn-a lapses too, the stack is a deletion candidate
        assert!(stack.should_delete(now + Duration::hours(25)));
    }

    #[test]
    fn zero_ttl_blocks_deletion_forever() {
        let mut tags = managed_tags();
        tags.insert(format!("{CERTIFICATE_ARN_TAG_PREFIX}arn-a"), "junk".to_string());
        let stack = Stack::from_cf(&cf_stack("CREATE_COMPLETE", tags)).unwrap();
        assert!(!stack.should_delete(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn extra_listeners_round_trip_through_the_tag() {
        let listeners = vec![ExtraListener {
            protocol: crate::aws::ListenerProtocol::Tcp,
            listen_port: 22,
            target_port: 2222,
            pod_label: "application=ssh-service".to_string(),
            namespace: "default".to_string(),
        }];
        let spec = StackSpec {
            extra_listeners: listeners.clone(),
            ..StackSpec::default()
        };
        let tags = spec.build_tags();
        let mut cf_tags = managed_tags();
        cf_tags.insert(
            EXTRA_LISTENERS_TAG.to_string(),
            tags[EXTRA_LISTENERS_TAG].clone(),
        );
        let stack = Stack::from_cf(&cf_stack("CREATE_COMPLETE", cf_tags)).unwrap();
        assert_eq!(stack.extra_listeners, listeners);
    }

    #[test]
    fn target_group_outputs_split_into_instance_and_extra() {
        let mut data = cf_stack("CREATE_COMPLETE", managed_tags());
        data.outputs.insert("TargetGroupARN".into(), "arn:primary".into());
        data.outputs
            .insert("HTTPTargetGroupARN".into(), "arn:http".into());
        data.outputs
            .insert("ExtraTG0TargetGroupARN".into(), "arn:extra0".into());
        data.outputs
            .insert("ExtraTG1TargetGroupARN".into(), "arn:extra1".into());
        data.outputs
            .insert(OUTPUT_DNS_NAME.into(), "lb.example.org".into());
        let stack = Stack::from_cf(&data).unwrap();

        let mut instance = stack.instance_target_group_arns();
        instance.sort();
        assert_eq!(instance, vec!["arn:http", "arn:primary"]);
        assert_eq!(
            stack.extra_target_group_arns(),
            vec![(0, "arn:extra0".to_string()), (1, "arn:extra1".to_string())]
        );
        assert_eq!(stack.dns_name, "lb.example.org");
    }

    #[test]
    fn managed_stack_detection_accepts_current_and_legacy_tags() {
        assert!(is_managed_stack(
            &managed_tags(),
            "prod",
            "kube-ingress-aws-controller"
        ));

        let legacy: BTreeMap<String, String> = [
            (KUBERNETES_CREATOR_TAG, "kube-ingress-aws-controller"),
            (CLUSTER_ID_TAG_LEGACY, "prod"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert!(is_managed_stack(&legacy, "prod", "kube-ingress-aws-controller"));

        assert!(!is_managed_stack(&managed_tags(), "other", "kube-ingress-aws-controller"));
        assert!(!is_managed_stack(&managed_tags(), "prod", "other-controller"));
    }

    #[test]
    fn spec_parameters_include_conditionals_only_when_set() {
        let spec = StackSpec {
            target_port: 9999,
            ..StackSpec::default()
        };
        let params = spec.parameters();
        assert!(params.iter().all(|(k, _)| k != PARAM_WAF_WEB_ACL_ID));
        assert!(params.iter().all(|(k, _)| k != PARAM_HTTP_TARGET_PORT));

        let spec = StackSpec {
            target_port: 9999,
            http_target_port: 8080,
            waf_web_acl_id: "acl-1".to_string(),
            health_check: Some(HealthCheck::default()),
            ..StackSpec::default()
        };
        let params = spec.parameters();
        assert!(params.iter().any(|(k, v)| k == PARAM_WAF_WEB_ACL_ID && v == "acl-1"));
        assert!(params.iter().any(|(k, v)| k == PARAM_HTTP_TARGET_PORT && v == "8080"));
        assert!(params.iter().any(|(k, _)| k == PARAM_HEALTH_CHECK_PATH));
    }

    #[test]
    fn stack_name_is_deterministic_and_valid() {
        let a = stack_name("aws:123:eu-central-1:prod", "shared/internet-facing");
        let b = stack_name("aws:123:eu-central-1:prod", "shared/internet-facing");
        let c = stack_name("aws:123:eu-central-1:prod", "owned/default/myapp");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= 128);
        assert!(a.chars().next().unwrap().is_ascii_alphabetic());
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-'));
    }

    #[test]
    fn numeric_cluster_id_gets_a_letter_prefix() {
        let name = stack_name("123456", "shared");
        assert!(name.starts_with("lb-"));
    }

    #[test]
    fn alarm_hash_is_stable_and_empty_for_no_alarms() {
        assert_eq!(alarm_config_hash(&[]), "");
        let alarms = vec![CloudWatchAlarm {
            metric_name: "HTTPCode_ELB_5XX_Count".to_string(),
            namespace: default_alarm_namespace(),
            statistic: Some("Sum".to_string()),
            period: Some(60),
            evaluation_periods: Some(3),
            threshold: Some(10.0),
            comparison_operator: Some("GreaterThanThreshold".to_string()),
        }];
        let h1 = alarm_config_hash(&alarms);
        let h2 = alarm_config_hash(&alarms);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
