//! Kubernetes adapter
//!
//! The adapter is the controller's only Kubernetes surface: it lists the
//! ingress-class resources (Ingress and RouteGroup), normalizes them into
//! [`IngressRecord`]s, writes load balancer hostnames back into resource
//! status, fetches ConfigMaps and collects pod IPs for extra-listener
//! target groups.
//!
//! RouteGroup support latches off the first time a listing fails because
//! the CRD is absent or forbidden; subsequent ticks skip the listing
//! entirely.

pub mod ingress;
pub mod routegroup;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::error::Error;
use crate::ingress::{normalize, IngressKind, IngressRecord, RawResource};

pub use routegroup::{RouteGroup, RouteGroupStatus};

use ingress::IngressApi;

/// Map a kube-rs error onto an [`Error`] kind
///
/// 404 and 403 become NotFound and PermissionDenied so callers can latch or
/// fall through; 5xx and transport failures become Transient; anything else
/// surfaces as a Kubernetes error.
pub(crate) fn kube_error(operation: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::not_found(format!("{operation}: {}", ae.message))
        }
        kube::Error::Api(ae) if ae.code == 403 => {
            Error::permission_denied(operation, &ae.message)
        }
        kube::Error::Api(ae) if ae.code >= 500 => Error::transient(operation, &ae.message),
        kube::Error::Service(_) | kube::Error::HyperError(_) => Error::transient(operation, &err),
        _ => Error::Kube(err),
    }
}

/// Abstraction over the Kubernetes operations the reconciler issues
///
/// This trait allows mocking the Kubernetes adapter in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// List every ingress-class resource as a normalized record
    async fn list_resources(&mut self) -> Result<Vec<IngressRecord>, Error>;

    /// Write the load balancer hostname into the resource status
    async fn update_load_balancer_hostname(
        &self,
        record: &IngressRecord,
        dns_name: &str,
    ) -> Result<(), Error>;

    /// Fetch a ConfigMap's data
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, Error>;

    /// Private IPs of the running pods matching a label selector
    async fn pod_ips(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<String>, Error>;
}

/// The controller's Kubernetes surface
pub struct Adapter {
    client: Client,
    ingress_api: IngressApi,
    config: ControllerConfig,
    route_group_support: bool,
}

impl Adapter {
    /// Create an adapter for the given client and configuration
    pub fn new(client: Client, config: ControllerConfig) -> Result<Self, Error> {
        let ingress_api = IngressApi::new(&config.ingress_api_version)?;
        Ok(Self {
            client,
            ingress_api,
            config,
            route_group_support: true,
        })
    }

    /// Whether RouteGroup listing is still attempted
    pub fn route_group_support(&self) -> bool {
        self.route_group_support
    }

    async fn list_ingresses(&self) -> Result<Vec<IngressRecord>, Error> {
        let raw = self.ingress_api.list(&self.client).await?;
        Ok(self.normalize_all(IngressKind::Ingress, raw))
    }

    async fn list_route_groups(&self) -> Result<Vec<IngressRecord>, Error> {
        let api: Api<RouteGroup> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| kube_error("list routegroups", e))?;

        let raw = list
            .items
            .iter()
            .map(|rg| {
                let status_hostname = rg
                    .status
                    .as_ref()
                    .and_then(|s| {
                        s.load_balancer
                            .route_group
                            .iter()
                            .map(|e| e.hostname.clone())
                            .find(|h| !h.is_empty())
                    })
                    .unwrap_or_default();
                RawResource {
                    namespace: rg.metadata.namespace.clone().unwrap_or_default(),
                    name: rg.metadata.name.clone().unwrap_or_default(),
                    annotations: rg.metadata.annotations.clone().unwrap_or_default(),
                    class_name: None,
                    hosts: rg.spec.hosts.clone(),
                    status_hostname,
                }
            })
            .collect();

        Ok(self.normalize_all(IngressKind::RouteGroup, raw))
    }

    fn normalize_all(&self, kind: IngressKind, raw: Vec<RawResource>) -> Vec<IngressRecord> {
        raw.into_iter()
            .filter(|r| self.supported_class(&r.ingress_class()))
            .filter_map(|r| match normalize(kind, &r, &self.config) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        kind = %kind,
                        namespace = %r.namespace,
                        name = %r.name,
                        error = %e,
                        "Dropping resource from tick"
                    );
                    None
                }
            })
            .collect()
    }

    fn supported_class(&self, class: &str) -> bool {
        self.config.ingress_class_filters.is_empty()
            || self.config.ingress_class_filters.contains(class)
    }

    async fn patch_route_group_status(
        &self,
        namespace: &str,
        name: &str,
        hostname: &str,
    ) -> Result<(), Error> {
        use kube::api::{Patch, PatchParams};

        let api: Api<RouteGroup> = Api::namespaced(self.client.clone(), namespace);
        let body = serde_json::json!({
            "status": {
                "loadBalancer": {
                    "routegroup": [ { "hostname": hostname } ]
                }
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| kube_error("patch routegroup status", e))?;
        Ok(())
    }
}

#[async_trait]
impl KubernetesApi for Adapter {
    /// List every ingress-class resource as a normalized record
    ///
    /// Resources failing validation are dropped from the tick with a logged
    /// warning. A RouteGroup listing failing with NotFound or
    /// PermissionDenied latches RouteGroup support off for the lifetime of
    /// the process.
    async fn list_resources(&mut self) -> Result<Vec<IngressRecord>, Error> {
        let mut records = self.list_ingresses().await?;

        if self.route_group_support {
            match self.list_route_groups().await {
                Ok(mut groups) => records.append(&mut groups),
                Err(e @ (Error::NotFound { .. } | Error::PermissionDenied { .. })) => {
                    self.route_group_support = false;
                    warn!(
                        error = %e,
                        "Disabling RouteGroup support because listing RouteGroups failed"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    /// Write the load balancer hostname into the resource status
    ///
    /// The cluster-local domain maps to the empty hostname. A patch that
    /// would not change the recorded hostname short-circuits with
    /// [`Error::UpdateNotNeeded`].
    async fn update_load_balancer_hostname(
        &self,
        record: &IngressRecord,
        dns_name: &str,
    ) -> Result<(), Error> {
        let hostname = resolve_status_hostname(dns_name, &self.config.cluster_local_domain);

        if record.status_hostname == hostname {
            return Err(Error::UpdateNotNeeded);
        }

        match record.kind {
            IngressKind::Ingress => {
                self.ingress_api
                    .patch_status(&self.client, &record.namespace, &record.name, hostname)
                    .await
            }
            IngressKind::RouteGroup => {
                self.patch_route_group_status(&record.namespace, &record.name, hostname)
                    .await
            }
        }
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api
            .get(name)
            .await
            .map_err(|e| kube_error("get configmap", e))?;
        Ok(cm.data.unwrap_or_default())
    }

    /// Private IPs of the running pods matching a label selector
    ///
    /// Collected fresh every tick for extra-listener target groups; nothing
    /// accumulates across ticks.
    async fn pod_ips(&self, namespace: &str, label_selector: &str) -> Result<Vec<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| kube_error("list pods", e))?;
        Ok(pods
            .items
            .iter()
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .is_some_and(|phase| phase == "Running")
            })
            .filter_map(|p| p.status.as_ref().and_then(|s| s.pod_ip.clone()))
            .collect())
    }
}

/// Map a load balancer DNS name to the hostname recorded in resource status
///
/// The cluster-local domain stands in for "no load balancer" and maps to
/// the empty hostname.
pub(crate) fn resolve_status_hostname<'a>(dns_name: &'a str, cluster_local_domain: &str) -> &'a str {
    if dns_name == cluster_local_domain {
        ""
    } else {
        dns_name
    }
}
