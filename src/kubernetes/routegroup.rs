//! RouteGroup Custom Resource Definition
//!
//! RouteGroups are an alternative ingress-class resource with a richer route
//! model; this controller only consumes their hostnames and writes back the
//! load balancer hostname. The spec below models the fields the controller
//! reads, tolerating everything else.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a RouteGroup
///
/// Only the hosts are consumed; backends and routes belong to the routing
/// layer and are ignored here.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "zalando.org",
    version = "v1",
    kind = "RouteGroup",
    plural = "routegroups",
    namespaced,
    status = "RouteGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupSpec {
    /// Hostnames routed by this route group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

/// Status of a RouteGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroupStatus {
    /// Load balancers serving this route group
    #[serde(default)]
    pub load_balancer: RouteGroupLoadBalancerStatus,
}

/// Load balancer section of the RouteGroup status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RouteGroupLoadBalancerStatus {
    /// Endpoints assigned to this route group
    #[serde(default, rename = "routegroup", skip_serializing_if = "Vec::is_empty")]
    pub route_group: Vec<LoadBalancerEndpoint>,
}

/// One load balancer endpoint in a status block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LoadBalancerEndpoint {
    /// DNS name of the load balancer
    #[serde(default)]
    pub hostname: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_the_full_route_model() {
        // RouteGroups in the wild carry backends and routes; the controller
        // only reads hosts and must ignore the rest.
        let raw = serde_json::json!({
            "hosts": ["foo.bar.org"],
            "backends": [{"name": "app", "type": "service", "serviceName": "app"}],
            "routes": [{"pathSubtree": "/"}],
        });
        let spec: RouteGroupSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(spec.hosts, vec!["foo.bar.org"]);
    }

    #[test]
    fn status_round_trips_the_patch_body() {
        let status = RouteGroupStatus {
            load_balancer: RouteGroupLoadBalancerStatus {
                route_group: vec![LoadBalancerEndpoint {
                    hostname: "lb.example.org".to_string(),
                }],
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json["loadBalancer"]["routegroup"][0]["hostname"],
            "lb.example.org"
        );
    }
}
