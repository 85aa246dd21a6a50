//! Annotation keys and parsing helpers
//!
//! Every policy annotation is one `(key, parse, default)` entry applied by
//! the normalizer as a flat pipeline. Unknown annotations are ignored.

use std::collections::BTreeMap;

/// Certificate ARN override
pub const CERTIFICATE_ARN: &str = "zalando.org/aws-load-balancer-ssl-cert";
/// Load balancer scheme (`internal` or `internet-facing`)
pub const SCHEME: &str = "zalando.org/aws-load-balancer-scheme";
/// Whether the ingress may share a load balancer with others
pub const SHARED: &str = "zalando.org/aws-load-balancer-shared";
/// Security group override
pub const SECURITY_GROUP: &str = "zalando.org/aws-load-balancer-security-group";
/// SSL policy override
pub const SSL_POLICY: &str = "zalando.org/aws-load-balancer-ssl-policy";
/// Load balancer type (`alb` or `nlb`)
pub const LOAD_BALANCER_TYPE: &str = "zalando.org/aws-load-balancer-type";
/// HTTP/2 toggle
pub const HTTP2: &str = "zalando.org/aws-load-balancer-http2";
/// WAF web ACL id override
pub const WAF_WEB_ACL_ID: &str = "zalando.org/aws-waf-web-acl-id";
/// Extra NLB listeners, a JSON list
pub const NLB_EXTRA_LISTENERS: &str = "zalando.org/aws-nlb-extra-listeners";
/// IP address type, shared with external-dns
pub const IP_ADDRESS_TYPE: &str = "alb.ingress.kubernetes.io/ip-address-type";
/// Deprecated ingress class annotation
pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

/// Load balancer type annotation value for application load balancers
pub const LB_TYPE_ALB: &str = "alb";
/// Load balancer type annotation value for network load balancers
pub const LB_TYPE_NLB: &str = "nlb";

/// Read-only view over a resource's annotations
#[derive(Clone, Copy)]
pub(crate) struct Annotations<'a> {
    map: &'a BTreeMap<String, String>,
}

impl<'a> Annotations<'a> {
    pub(crate) fn new(map: &'a BTreeMap<String, String>) -> Self {
        Self { map }
    }

    /// The raw annotation value, None when absent
    pub(crate) fn raw(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).map(String::as_str)
    }

    /// The annotation value or the given default when absent
    pub(crate) fn string_or(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    /// True unless the annotation value is exactly `false`
    pub(crate) fn bool_unless_false(&self, key: &str) -> bool {
        self.raw(key) != Some("false")
    }
}
