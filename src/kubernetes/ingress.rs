//! Versioned Ingress listing and status patching
//!
//! Two API groups are supported: `networking.k8s.io/v1` and the legacy
//! `extensions/v1beta1`. Both go through a dynamic API built from the
//! configured group/version, so the legacy group needs no generated types.

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::json;

use crate::error::Error;
use crate::ingress::RawResource;

/// The Ingress API at one configured group/version
#[derive(Clone, Debug)]
pub(crate) struct IngressApi {
    resource: ApiResource,
}

impl IngressApi {
    /// Build the dynamic API resource for `<group>/<version>` ingresses
    pub(crate) fn new(api_version: &str) -> Result<Self, Error> {
        let (group, version) = api_version.split_once('/').ok_or_else(|| {
            Error::configuration(format!(
                "ingress API version {api_version:?} is not of the form <group>/<version>"
            ))
        })?;
        let gvk = GroupVersionKind::gvk(group, version, "Ingress");
        Ok(Self {
            resource: ApiResource::from_gvk_with_plural(&gvk, "ingresses"),
        })
    }

    /// List all ingresses in the cluster as raw resources
    pub(crate) async fn list(&self, client: &Client) -> Result<Vec<RawResource>, Error> {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &self.resource);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| super::kube_error("list ingresses", e))?;
        Ok(list.items.iter().map(raw_from_dynamic).collect())
    }

    /// Patch the status hostname of one ingress
    ///
    /// The body is a strategic-merge patch replacing the load balancer
    /// ingress list with the single given hostname.
    pub(crate) async fn patch_status(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
        hostname: &str,
    ) -> Result<(), Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), namespace, &self.resource);
        let body = json!({
            "status": {
                "loadBalancer": {
                    "ingress": [ { "hostname": hostname } ]
                }
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| super::kube_error("patch ingress status", e))?;
        Ok(())
    }
}

fn raw_from_dynamic(obj: &DynamicObject) -> RawResource {
    let metadata = &obj.metadata;
    let spec = &obj.data["spec"];
    let status = &obj.data["status"];

    let hosts = spec["rules"]
        .as_array()
        .map(|rules| {
            rules
                .iter()
                .filter_map(|r| r["host"].as_str())
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let status_hostname = status["loadBalancer"]["ingress"]
        .as_array()
        .and_then(|endpoints| {
            endpoints
                .iter()
                .filter_map(|e| e["hostname"].as_str())
                .find(|h| !h.is_empty())
        })
        .unwrap_or_default()
        .to_string();

    RawResource {
        namespace: metadata.namespace.clone().unwrap_or_default(),
        name: metadata.name.clone().unwrap_or_default(),
        annotations: metadata.annotations.clone().unwrap_or_default(),
        class_name: spec["ingressClassName"].as_str().map(str::to_string),
        hosts,
        status_hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_must_carry_a_group() {
        assert!(IngressApi::new("networking.k8s.io/v1").is_ok());
        assert!(IngressApi::new("extensions/v1beta1").is_ok());
        let err = IngressApi::new("v1").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn dynamic_objects_decode_into_raw_resources() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "namespace": "default",
                "name": "myapp",
                "annotations": { "zalando.org/aws-load-balancer-scheme": "internal" },
            },
            "spec": {
                "ingressClassName": "skipper",
                "rules": [
                    { "host": "foo.bar.org" },
                    { "host": "" },
                    { "http": {} },
                ],
            },
            "status": {
                "loadBalancer": {
                    "ingress": [ { "hostname": "lb.example.org" } ]
                }
            }
        }))
        .unwrap();

        let raw = raw_from_dynamic(&obj);
        assert_eq!(raw.namespace, "default");
        assert_eq!(raw.name, "myapp");
        assert_eq!(raw.class_name.as_deref(), Some("skipper"));
        assert_eq!(raw.hosts, vec!["foo.bar.org"]);
        assert_eq!(raw.status_hostname, "lb.example.org");
        assert_eq!(
            raw.annotations["zalando.org/aws-load-balancer-scheme"],
            "internal"
        );
    }

    #[test]
    fn missing_spec_and_status_decode_to_empty() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "extensions/v1beta1",
            "kind": "Ingress",
            "metadata": { "namespace": "default", "name": "bare" },
        }))
        .unwrap();
        let raw = raw_from_dynamic(&obj);
        assert!(raw.hosts.is_empty());
        assert!(raw.status_hostname.is_empty());
        assert!(raw.class_name.is_none());
    }
}
