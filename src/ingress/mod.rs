//! Normalized ingress records
//!
//! Ingress and RouteGroup resources are translated into one uniform
//! [`IngressRecord`] carrying the annotation-derived policy fields the
//! reconciler consumes. The resource kind survives as a tagged variant so
//! status write-back can address the right API, but nothing downstream
//! branches on it otherwise.

pub mod annotations;

use std::collections::BTreeMap;

use crate::aws::{
    ExtraListener, IpAddressType, LoadBalancerScheme, LoadBalancerType,
};
use crate::config::ControllerConfig;
use crate::error::Error;

use annotations::Annotations;

/// Kind of the Kubernetes resource an [`IngressRecord`] was built from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IngressKind {
    /// A `networking.k8s.io` (or legacy `extensions`) Ingress
    Ingress,
    /// A `zalando.org/v1` RouteGroup custom resource
    RouteGroup,
}

impl std::fmt::Display for IngressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingress => f.write_str("ingress"),
            Self::RouteGroup => f.write_str("routegroup"),
        }
    }
}

/// The raw material of normalization: the fields the adapter extracts from
/// a Kubernetes object before any policy is applied
#[derive(Clone, Debug, Default)]
pub struct RawResource {
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
    /// Resource annotations
    pub annotations: BTreeMap<String, String>,
    /// Typed ingress class field (`spec.ingressClassName`); None for
    /// RouteGroups and legacy objects
    pub class_name: Option<String>,
    /// Routing hosts declared in the spec
    pub hosts: Vec<String>,
    /// Hostname currently recorded in the resource status
    pub status_hostname: String,
}

impl RawResource {
    /// `namespace/name` identity of the resource
    pub fn resource_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The effective ingress class: typed field preferred, deprecated
    /// annotation as fallback
    pub fn ingress_class(&self) -> String {
        match self.class_name.as_deref() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self
                .annotations
                .get(annotations::INGRESS_CLASS)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// The normalized desired unit consumed by the reconciler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRecord {
    /// Kind of the originating resource
    pub kind: IngressKind,
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
    /// Externally routable hostnames; empty for cluster-local ingresses
    pub hostnames: Vec<String>,
    /// Hostname currently recorded in the resource status
    pub status_hostname: String,
    /// Whether the ingress may co-tenant on a shared stack
    pub shared: bool,
    /// HTTP/2 enabled on the load balancer
    pub http2: bool,
    /// True when the ingress has no externally routable hostnames
    pub cluster_local: bool,
    /// Explicit certificate ARN override, empty means elect from inventory
    pub certificate_arn: String,
    /// Load balancer scheme
    pub scheme: LoadBalancerScheme,
    /// Security group, possibly the controller default, may be empty
    pub security_group: String,
    /// SSL policy name
    pub ssl_policy: String,
    /// IP address type
    pub ip_address_type: IpAddressType,
    /// Load balancer type after demotion rules
    pub load_balancer_type: LoadBalancerType,
    /// WAF web ACL id, empty when unset
    pub waf_web_acl_id: String,
    /// Extra NLB listeners
    pub extra_listeners: Vec<ExtraListener>,
    /// Effective ingress class the record was admitted under
    pub ingress_class: String,
}

impl IngressRecord {
    /// `namespace/name` identity, also the value of the owner tag for
    /// non-shared stacks
    pub fn resource_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for IngressRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Translate a raw resource into an [`IngressRecord`]
///
/// Applies the annotation pipeline, the NLB demotion rules and the
/// cluster-local hostname filter. Validation failures drop the resource
/// from the tick with [`Error::Validation`].
pub fn normalize(
    kind: IngressKind,
    raw: &RawResource,
    config: &ControllerConfig,
) -> Result<IngressRecord, Error> {
    let resource = raw.resource_id();
    let ann = Annotations::new(&raw.annotations);

    // Invalid scheme values silently fall back to the default.
    let scheme = ann
        .raw(annotations::SCHEME)
        .and_then(LoadBalancerScheme::parse)
        .unwrap_or(LoadBalancerScheme::InternetFacing);

    let shared = ann.bool_unless_false(annotations::SHARED);

    let mut ip_address_type = match ann.raw(annotations::IP_ADDRESS_TYPE) {
        Some("dualstack") => IpAddressType::Dualstack,
        _ => IpAddressType::Ipv4,
    };

    let mut ssl_policy = ann.string_or(
        annotations::SSL_POLICY,
        &config.ingress_default_ssl_policy,
    );
    if !crate::aws::is_valid_ssl_policy(&ssl_policy) {
        ssl_policy = config.ingress_default_ssl_policy.clone();
    }

    let default_lb_type = match config.ingress_default_load_balancer_type {
        LoadBalancerType::Network => annotations::LB_TYPE_NLB,
        LoadBalancerType::Application => annotations::LB_TYPE_ALB,
    };
    let has_lb_annotation = ann.raw(annotations::LOAD_BALANCER_TYPE).is_some();
    let mut lb_type = match ann.raw(annotations::LOAD_BALANCER_TYPE) {
        Some(v) => v.to_string(),
        // Internal load balancers default to ALB; NLB health checks from
        // within the VPC are unreliable for hairpin traffic.
        None if scheme == LoadBalancerScheme::Internal => annotations::LB_TYPE_ALB.to_string(),
        None => default_lb_type.to_string(),
    };

    let has_sg_annotation = ann.raw(annotations::SECURITY_GROUP).is_some();
    let security_group = ann.string_or(
        annotations::SECURITY_GROUP,
        &config.ingress_default_security_group,
    );

    let has_waf_annotation = ann.raw(annotations::WAF_WEB_ACL_ID).is_some();
    let waf_web_acl_id = ann.string_or(annotations::WAF_WEB_ACL_ID, "");

    let mut extra_listeners: Vec<ExtraListener> = Vec::new();
    if let Some(raw_listeners) = ann.raw(annotations::NLB_EXTRA_LISTENERS) {
        if lb_type != annotations::LB_TYPE_NLB {
            return Err(Error::validation(
                &resource,
                "extra listeners are only supported on NLBs",
            ));
        }
        extra_listeners = serde_json::from_str(raw_listeners).map_err(|e| {
            Error::validation(
                &resource,
                format!("unable to parse {} annotation: {e}", annotations::NLB_EXTRA_LISTENERS),
            )
        })?;
        for listener in &mut extra_listeners {
            listener.namespace = raw.namespace.clone();
        }
    }

    if lb_type == annotations::LB_TYPE_NLB && (has_sg_annotation || has_waf_annotation) {
        if has_lb_annotation {
            return Err(Error::validation(
                &resource,
                "security group or WAF are not supported by NLB (configured by annotation)",
            ));
        }
        // Security group or WAF came in through controller defaults only;
        // silently fall back to ALB.
        lb_type = annotations::LB_TYPE_ALB.to_string();
        if !extra_listeners.is_empty() {
            return Err(Error::validation(
                &resource,
                "extra listeners are only supported on NLBs",
            ));
        }
    }

    let load_balancer_type = match lb_type.as_str() {
        annotations::LB_TYPE_ALB => LoadBalancerType::Application,
        annotations::LB_TYPE_NLB => LoadBalancerType::Network,
        _ => config.ingress_default_load_balancer_type,
    };

    if load_balancer_type == LoadBalancerType::Network {
        // Network load balancers only support ipv4.
        ip_address_type = IpAddressType::Ipv4;
    }

    let http2 = match ann.raw(annotations::HTTP2) {
        Some("false") => false,
        Some("true") => true,
        _ => config.http2_default,
    };

    let hostnames: Vec<String> = raw
        .hosts
        .iter()
        .filter(|h| {
            !h.is_empty()
                && (config.cluster_local_domain.is_empty()
                    || !h.ends_with(&config.cluster_local_domain))
        })
        .cloned()
        .collect();
    let cluster_local = hostnames.is_empty();

    Ok(IngressRecord {
        kind,
        namespace: raw.namespace.clone(),
        name: raw.name.clone(),
        hostnames,
        status_hostname: raw.status_hostname.clone(),
        shared,
        http2,
        cluster_local,
        certificate_arn: ann.string_or(annotations::CERTIFICATE_ARN, ""),
        scheme,
        security_group,
        ssl_policy,
        ip_address_type,
        load_balancer_type,
        waf_web_acl_id,
        extra_listeners,
        ingress_class: raw.ingress_class(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(annotations: &[(&str, &str)], hosts: &[&str]) -> RawResource {
        RawResource {
            namespace: "default".to_string(),
            name: "myapp".to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            class_name: None,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            status_hostname: String::new(),
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            cluster_id: "test-cluster".to_string(),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn defaults_apply_without_annotations() {
        let rec = normalize(IngressKind::Ingress, &raw(&[], &["foo.bar.org"]), &config()).unwrap();
        assert_eq!(rec.scheme, LoadBalancerScheme::InternetFacing);
        assert!(rec.shared);
        assert!(rec.http2);
        assert_eq!(rec.ip_address_type, IpAddressType::Ipv4);
        assert_eq!(rec.load_balancer_type, LoadBalancerType::Application);
        assert_eq!(rec.ssl_policy, crate::DEFAULT_SSL_POLICY);
        assert!(!rec.cluster_local);
        assert_eq!(rec.hostnames, vec!["foo.bar.org"]);
    }

    #[test]
    fn invalid_scheme_falls_back_to_internet_facing() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(&[(annotations::SCHEME, "Internal")], &["foo.bar.org"]),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.scheme, LoadBalancerScheme::InternetFacing);
    }

    #[test]
    fn internal_scheme_defaults_to_alb_even_with_nlb_default() {
        let cfg = ControllerConfig {
            ingress_default_load_balancer_type: LoadBalancerType::Network,
            ..config()
        };
        let rec = normalize(
            IngressKind::Ingress,
            &raw(&[(annotations::SCHEME, "internal")], &["foo.bar.org"]),
            &cfg,
        )
        .unwrap();
        assert_eq!(rec.load_balancer_type, LoadBalancerType::Application);
    }

    #[test]
    fn unknown_ssl_policy_falls_back_to_default() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(
                &[(annotations::SSL_POLICY, "ELBSecurityPolicy-Bogus")],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.ssl_policy, crate::DEFAULT_SSL_POLICY);
    }

    #[test]
    fn nlb_forces_ipv4() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(
                &[
                    (annotations::LOAD_BALANCER_TYPE, "nlb"),
                    (annotations::IP_ADDRESS_TYPE, "dualstack"),
                ],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.load_balancer_type, LoadBalancerType::Network);
        assert_eq!(rec.ip_address_type, IpAddressType::Ipv4);
    }

    #[test]
    fn nlb_with_explicit_waf_annotation_is_rejected() {
        let err = normalize(
            IngressKind::Ingress,
            &raw(
                &[
                    (annotations::LOAD_BALANCER_TYPE, "nlb"),
                    (annotations::WAF_WEB_ACL_ID, "abc"),
                ],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn nlb_by_default_with_waf_is_silently_demoted_to_alb() {
        let cfg = ControllerConfig {
            ingress_default_load_balancer_type: LoadBalancerType::Network,
            ..config()
        };
        let rec = normalize(
            IngressKind::Ingress,
            &raw(
                &[(annotations::WAF_WEB_ACL_ID, "abc")],
                &["foo.bar.org"],
            ),
            &cfg,
        )
        .unwrap();
        assert_eq!(rec.load_balancer_type, LoadBalancerType::Application);
        assert_eq!(rec.waf_web_acl_id, "abc");
    }

    #[test]
    fn extra_listeners_on_alb_are_rejected() {
        let err = normalize(
            IngressKind::Ingress,
            &raw(
                &[
                    (annotations::LOAD_BALANCER_TYPE, "alb"),
                    (
                        annotations::NLB_EXTRA_LISTENERS,
                        r#"[{"protocol":"TCP","listenport":22,"targetport":2222}]"#,
                    ),
                ],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn extra_listener_with_unsupported_protocol_is_rejected() {
        let err = normalize(
            IngressKind::Ingress,
            &raw(
                &[
                    (annotations::LOAD_BALANCER_TYPE, "nlb"),
                    (
                        annotations::NLB_EXTRA_LISTENERS,
                        r#"[{"protocol":"TLS","listenport":443,"targetport":8443}]"#,
                    ),
                ],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn extra_listeners_inherit_the_resource_namespace() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(
                &[
                    (annotations::LOAD_BALANCER_TYPE, "nlb"),
                    (
                        annotations::NLB_EXTRA_LISTENERS,
                        r#"[{"protocol":"TCP","listenport":22,"targetport":2222,"podlabel":"application=ssh-service"}]"#,
                    ),
                ],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.extra_listeners.len(), 1);
        assert_eq!(rec.extra_listeners[0].namespace, "default");
    }

    #[test]
    fn cluster_local_hosts_are_filtered_out() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(&[], &["svc.ns.svc.cluster.local", "foo.bar.org"]),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.hostnames, vec!["foo.bar.org"]);
        assert!(!rec.cluster_local);

        let rec = normalize(
            IngressKind::Ingress,
            &raw(&[], &["svc.ns.svc.cluster.local"]),
            &config(),
        )
        .unwrap();
        assert!(rec.hostnames.is_empty());
        assert!(rec.cluster_local);
    }

    #[test]
    fn typed_class_field_wins_over_annotation() {
        let mut r = raw(&[(annotations::INGRESS_CLASS, "legacy")], &["foo.bar.org"]);
        r.class_name = Some("skipper".to_string());
        assert_eq!(r.ingress_class(), "skipper");
        r.class_name = None;
        assert_eq!(r.ingress_class(), "legacy");
    }

    #[test]
    fn unknown_lb_type_value_falls_back_to_default() {
        let rec = normalize(
            IngressKind::Ingress,
            &raw(
                &[(annotations::LOAD_BALANCER_TYPE, "fantasy")],
                &["foo.bar.org"],
            ),
            &config(),
        )
        .unwrap();
        assert_eq!(rec.load_balancer_type, LoadBalancerType::Application);
    }
}
