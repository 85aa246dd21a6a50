//! Controller configuration
//!
//! The configuration struct consumed by the reconcile core. The binary maps
//! CLI flags and environment variables onto this struct; library users
//! construct it programmatically. `validate` must pass before the first tick.

use std::collections::HashSet;

use chrono::Duration;

use crate::aws::{LoadBalancerType, TargetType};
use crate::error::Error;
use crate::{
    DEFAULT_CERT_TTL_SECONDS, DEFAULT_CLUSTER_LOCAL_DOMAIN, DEFAULT_CONTROLLER_ID,
    DEFAULT_DEREGISTRATION_DELAY_SECONDS, DEFAULT_IDLE_TIMEOUT_SECONDS, DEFAULT_SSL_POLICY,
    DEFAULT_STACK_TIMEOUT_MINUTES,
};

/// Ingress API group/version the adapter lists from
pub const INGRESS_API_VERSION_NETWORKING: &str = "networking.k8s.io/v1";
/// Legacy ingress API group/version supported for migration
pub const INGRESS_API_VERSION_EXTENSIONS: &str = "extensions/v1beta1";

/// Fixed-response configuration served for denied internal domains
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DenyInternalDomains {
    /// Whether the deny rule is emitted into templates
    pub enabled: bool,
    /// HTTP status code of the fixed response
    pub status: u16,
    /// Content type of the fixed response
    pub content_type: String,
    /// Body of the fixed response
    pub body: String,
    /// Domain suffixes treated as internal
    pub suffixes: Vec<String>,
}

impl Default for DenyInternalDomains {
    fn default() -> Self {
        Self {
            enabled: false,
            status: 401,
            content_type: "text/plain".to_string(),
            body: "Unauthorized".to_string(),
            suffixes: vec![".cluster.local".to_string()],
        }
    }
}

/// Target group health check settings applied to primary target groups
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// HTTP path probed by the load balancer
    pub path: String,
    /// Port probed by the load balancer
    pub port: u16,
    /// Seconds between probes
    pub interval_seconds: u32,
    /// Probe timeout in seconds
    pub timeout_seconds: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/kube-system/healthz".to_string(),
            port: 9999,
            interval_seconds: 10,
            timeout_seconds: 5,
        }
    }
}

/// Controller configuration consumed by the reconcile core
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Identifier written to the `kubernetes:application` tag on every stack
    pub controller_id: String,
    /// Cluster identifier; stacks carry `kubernetes.io/cluster/<id>` = `owned`
    pub cluster_id: String,
    /// Ingress API group/version to list (`networking.k8s.io/v1` or
    /// `extensions/v1beta1`)
    pub ingress_api_version: String,
    /// Ingress classes acted upon; empty means all classes
    pub ingress_class_filters: HashSet<String>,
    /// Security group attached when no annotation overrides it
    pub ingress_default_security_group: String,
    /// SSL policy applied when no annotation overrides it
    pub ingress_default_ssl_policy: String,
    /// Load balancer type applied when no annotation overrides it
    pub ingress_default_load_balancer_type: LoadBalancerType,
    /// Domain suffix marking hostnames as cluster-local
    pub cluster_local_domain: String,
    /// Lifetime of a certificate election, persisted as a stack tag
    pub cert_ttl: Duration,
    /// Whether stacks are created with termination protection
    pub stack_termination_protection: bool,
    /// CloudFormation stack creation timeout
    pub stack_timeout_minutes: u32,
    /// Idle connection timeout for application load balancers
    pub idle_connection_timeout_seconds: u32,
    /// Target group deregistration delay
    pub deregistration_delay_timeout_seconds: u32,
    /// How targets are addressed in target groups
    pub target_type: TargetType,
    /// Port the primary target group forwards to
    pub target_port: u16,
    /// Health check settings for primary target groups
    pub health_check: HealthCheck,
    /// ALB healthy threshold count
    pub alb_healthy_threshold_count: u32,
    /// ALB unhealthy threshold count
    pub alb_unhealthy_threshold_count: u32,
    /// NLB healthy threshold count (NLBs use one count for both directions)
    pub nlb_healthy_threshold_count: u32,
    /// Disable the plain HTTP listener entirely
    pub http_disabled: bool,
    /// Redirect HTTP to HTTPS instead of forwarding
    pub http_redirect_to_https: bool,
    /// Distinct target port for the HTTP listener; 0 means same as primary
    pub http_target_port: u16,
    /// Fixed-response rule for internal domains
    pub deny_internal_domains: DenyInternalDomains,
    /// Enable cross-zone load balancing on NLBs
    pub nlb_cross_zone: bool,
    /// HTTP/2 setting applied when no annotation overrides it
    pub http2_default: bool,
    /// S3 bucket receiving ALB access logs; empty disables logging
    pub alb_logs_s3_bucket: String,
    /// Prefix within the access log bucket
    pub alb_logs_s3_prefix: String,
    /// ConfigMap `(namespace, name)` holding CloudWatch alarm definitions
    pub cloudwatch_alarm_config_map: Option<(String, String)>,
    /// Extra tags applied to every managed stack
    pub additional_stack_tags: std::collections::BTreeMap<String, String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: DEFAULT_CONTROLLER_ID.to_string(),
            cluster_id: String::new(),
            ingress_api_version: INGRESS_API_VERSION_NETWORKING.to_string(),
            ingress_class_filters: HashSet::new(),
            ingress_default_security_group: String::new(),
            ingress_default_ssl_policy: DEFAULT_SSL_POLICY.to_string(),
            ingress_default_load_balancer_type: LoadBalancerType::Application,
            cluster_local_domain: DEFAULT_CLUSTER_LOCAL_DOMAIN.to_string(),
            cert_ttl: Duration::seconds(DEFAULT_CERT_TTL_SECONDS),
            stack_termination_protection: false,
            stack_timeout_minutes: DEFAULT_STACK_TIMEOUT_MINUTES,
            idle_connection_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            deregistration_delay_timeout_seconds: DEFAULT_DEREGISTRATION_DELAY_SECONDS,
            target_type: TargetType::Instance,
            target_port: 9999,
            health_check: HealthCheck::default(),
            alb_healthy_threshold_count: 3,
            alb_unhealthy_threshold_count: 3,
            nlb_healthy_threshold_count: 3,
            http_disabled: false,
            http_redirect_to_https: false,
            http_target_port: 0,
            deny_internal_domains: DenyInternalDomains::default(),
            nlb_cross_zone: false,
            http2_default: true,
            alb_logs_s3_bucket: String::new(),
            alb_logs_s3_prefix: String::new(),
            cloudwatch_alarm_config_map: None,
            additional_stack_tags: std::collections::BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration
    ///
    /// Returns a [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.controller_id.is_empty() {
            return Err(Error::configuration("controller id must not be empty"));
        }
        if self.cluster_id.is_empty() {
            return Err(Error::configuration("cluster id must not be empty"));
        }
        if self.ingress_api_version != INGRESS_API_VERSION_NETWORKING
            && self.ingress_api_version != INGRESS_API_VERSION_EXTENSIONS
        {
            return Err(Error::configuration(format!(
                "unsupported ingress API version {:?}, expected {} or {}",
                self.ingress_api_version,
                INGRESS_API_VERSION_NETWORKING,
                INGRESS_API_VERSION_EXTENSIONS
            )));
        }
        if self.cert_ttl <= Duration::zero() {
            return Err(Error::configuration("certificate TTL must be positive"));
        }
        if self.target_port == 0 {
            return Err(Error::configuration("target port must not be zero"));
        }
        if self.stack_timeout_minutes == 0 {
            return Err(Error::configuration(
                "stack timeout must be at least one minute",
            ));
        }
        if self.deny_internal_domains.enabled && self.deny_internal_domains.suffixes.is_empty() {
            return Err(Error::configuration(
                "deny-internal-domains enabled without any internal domain suffix",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ControllerConfig {
        ControllerConfig {
            cluster_id: "aws:123:eu-central-1:prod".to_string(),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn default_config_with_cluster_id_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_cluster_id_is_a_configuration_error() {
        let cfg = ControllerConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("cluster id"));
    }

    #[test]
    fn unknown_ingress_api_version_is_rejected() {
        let cfg = ControllerConfig {
            ingress_api_version: "networking.k8s.io/v2".to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn legacy_ingress_api_version_is_accepted() {
        let cfg = ControllerConfig {
            ingress_api_version: INGRESS_API_VERSION_EXTENSIONS.to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deny_internal_domains_requires_suffixes() {
        let cfg = ControllerConfig {
            deny_internal_domains: DenyInternalDomains {
                enabled: true,
                suffixes: vec![],
                ..DenyInternalDomains::default()
            },
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
