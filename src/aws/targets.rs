//! Target group membership reconciliation
//!
//! Keeps every managed target group's membership in sync: primary and HTTP
//! target groups receive the cluster's node pool (instance ids or node IPs
//! depending on the target type), extra-listener target groups receive the
//! private IPs of the pods matching the listener's label selector. Diffs are
//! computed against `DescribeTargetHealth`, batched per target group, and
//! each target is touched at most once per tick.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::aws::nodes::Instance;
use crate::aws::stack::Stack;
use crate::aws::TargetType;
use crate::error::Error;

/// Abstraction over the ELBv2 target operations the controller issues
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ElbApi: Send + Sync {
    /// Ids currently registered with the target group
    async fn registered_targets(&self, target_group_arn: &str) -> Result<Vec<String>, Error>;

    /// Register the given targets with the target group
    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[String],
    ) -> Result<(), Error>;

    /// Deregister the given targets from the target group
    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[String],
    ) -> Result<(), Error>;
}

/// The register/deregister batches for one target group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetDiff {
    /// Targets missing from the group
    pub register: Vec<String>,
    /// Targets registered but no longer desired
    pub deregister: Vec<String>,
}

impl TargetDiff {
    /// True when membership already matches
    pub fn is_empty(&self) -> bool {
        self.register.is_empty() && self.deregister.is_empty()
    }
}

/// Compute the minimal membership change for one target group
pub fn diff_targets(desired: &BTreeSet<String>, current: &[String]) -> TargetDiff {
    let current: BTreeSet<&str> = current.iter().map(String::as_str).collect();
    TargetDiff {
        register: desired
            .iter()
            .filter(|t| !current.contains(t.as_str()))
            .cloned()
            .collect(),
        deregister: current
            .iter()
            .filter(|t| !desired.contains(**t))
            .map(|t| t.to_string())
            .collect(),
    }
}

/// Reconcile the membership of every target group owned by the given stacks
///
/// `pod_ips` maps `(namespace, pod label)` to the running pod IPs collected
/// this tick; it is rebuilt per tick so stale endpoints never accumulate.
/// Per-group failures are transient: they are logged and the remaining
/// groups still converge. Returns the number of groups changed.
pub async fn reconcile_targets(
    elb: &dyn ElbApi,
    stacks: &[Stack],
    instances: &[Instance],
    target_type: TargetType,
    pod_ips: &BTreeMap<(String, String), Vec<String>>,
) -> usize {
    let node_targets: BTreeSet<String> = match target_type {
        TargetType::Instance => instances.iter().map(|i| i.id.clone()).collect(),
        TargetType::Ip => instances.iter().map(|i| i.private_ip.clone()).collect(),
    };

    let mut changed = 0;
    for stack in stacks {
        for arn in stack.instance_target_group_arns() {
            if apply_diff(elb, &arn, &node_targets).await {
                changed += 1;
            }
        }

        let mut listeners = stack.extra_listeners.clone();
        listeners.sort();
        for (index, arn) in stack.extra_target_group_arns() {
            let Some(listener) = listeners.get(index) else {
                warn!(
                    stack = %stack.name,
                    target_group = %arn,
                    index,
                    "Extra target group without matching listener, skipping"
                );
                continue;
            };
            let desired: BTreeSet<String> = pod_ips
                .get(&(listener.namespace.clone(), listener.pod_label.clone()))
                .map(|ips| ips.iter().cloned().collect())
                .unwrap_or_default();
            if apply_diff(elb, &arn, &desired).await {
                changed += 1;
            }
        }
    }
    changed
}

async fn apply_diff(elb: &dyn ElbApi, arn: &str, desired: &BTreeSet<String>) -> bool {
    let current = match elb.registered_targets(arn).await {
        Ok(current) => current,
        Err(e) => {
            warn!(target_group = %arn, error = %e, "Failed to describe target health");
            return false;
        }
    };

    let diff = diff_targets(desired, &current);
    if diff.is_empty() {
        return false;
    }

    debug!(
        target_group = %arn,
        register = diff.register.len(),
        deregister = diff.deregister.len(),
        "Adjusting target group membership"
    );

    let mut changed = false;
    if !diff.register.is_empty() {
        match elb.register_targets(arn, &diff.register).await {
            Ok(()) => changed = true,
            Err(e) => warn!(target_group = %arn, error = %e, "Failed to register targets"),
        }
    }
    if !diff.deregister.is_empty() {
        match elb.deregister_targets(arn, &diff.deregister).await {
            Ok(()) => changed = true,
            Err(e) => warn!(target_group = %arn, error = %e, "Failed to deregister targets"),
        }
    }
    changed
}

// =============================================================================
// SDK implementation
// =============================================================================

/// ELBv2 seam backed by the AWS SDK
pub struct SdkElb {
    client: aws_sdk_elasticloadbalancingv2::Client,
}

impl SdkElb {
    /// Create a new SDK-backed ELBv2 seam
    pub fn new(client: aws_sdk_elasticloadbalancingv2::Client) -> Self {
        Self { client }
    }

    fn target_descriptions(
        targets: &[String],
    ) -> Result<Vec<aws_sdk_elasticloadbalancingv2::types::TargetDescription>, Error> {
        targets
            .iter()
            .map(|t| {
                Ok(aws_sdk_elasticloadbalancingv2::types::TargetDescription::builder()
                    .id(t)
                    .build())
            })
            .collect()
    }
}

#[async_trait]
impl ElbApi for SdkElb {
    async fn registered_targets(&self, target_group_arn: &str) -> Result<Vec<String>, Error> {
        let resp = self
            .client
            .describe_target_health()
            .target_group_arn(target_group_arn)
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("DescribeTargetHealth", &e))?;
        Ok(resp
            .target_health_descriptions()
            .iter()
            .filter_map(|d| d.target())
            .filter_map(|t| t.id().map(str::to_string))
            .collect())
    }

    async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: &[String],
    ) -> Result<(), Error> {
        self.client
            .register_targets()
            .target_group_arn(target_group_arn)
            .set_targets(Some(Self::target_descriptions(targets)?))
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("RegisterTargets", &e))?;
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[String],
    ) -> Result<(), Error> {
        self.client
            .deregister_targets()
            .target_group_arn(target_group_arn)
            .set_targets(Some(Self::target_descriptions(targets)?))
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("DeregisterTargets", &e))?;
        Ok(())
    }
}
