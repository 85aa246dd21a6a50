//! CloudFormation client seam and stack operations
//!
//! The [`CloudFormationApi`] trait is the only surface the reconciler talks
//! to; the SDK-backed implementation translates to CloudFormation calls and
//! everything above it stays pure and mockable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_cloudformation::types::{OnFailure, Parameter, Tag};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::aws::stack::{is_managed_stack, CfStackData, Stack, StackSpec};
use crate::aws::template::generate_template;
use crate::error::Error;

/// One create or update call, fully encoded
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackOpInput {
    /// Stack name
    pub name: String,
    /// The synthesized template document
    pub template_body: String,
    /// Parameter key/value pairs
    pub parameters: Vec<(String, String)>,
    /// Full tag set
    pub tags: BTreeMap<String, String>,
    /// Stack creation timeout
    pub timeout_minutes: u32,
    /// Whether termination protection is enabled
    pub termination_protection: bool,
}

/// Abstraction over the CloudFormation operations the controller issues
///
/// This trait allows mocking CloudFormation in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudFormationApi: Send + Sync {
    /// Describe every visible stack, all pages
    async fn list_stacks(&self) -> Result<Vec<CfStackData>, Error>;

    /// Create a stack, returning the stack id
    async fn create_stack(&self, input: &StackOpInput) -> Result<String, Error>;

    /// Update a stack, returning the stack id
    async fn update_stack(&self, input: &StackOpInput) -> Result<String, Error>;

    /// Delete a stack by name
    async fn delete_stack(&self, name: &str) -> Result<(), Error>;

    /// Enable or disable termination protection on a stack
    async fn set_termination_protection(&self, name: &str, enabled: bool)
        -> Result<(), Error>;
}

// =============================================================================
// Stack operations on top of the seam
// =============================================================================

/// List every stack managed by this controller instance
///
/// A stack is managed when its tags carry the controller id plus the owned
/// cluster tag (or the legacy cluster tag). Stacks whose tags fail to decode
/// are skipped with a warning rather than failing the tick.
pub async fn find_managed_stacks(
    cf: &dyn CloudFormationApi,
    cluster_id: &str,
    controller_id: &str,
) -> Result<Vec<Stack>, Error> {
    let mut stacks = Vec::new();
    for data in cf.list_stacks().await? {
        if !is_managed_stack(&data.tags, cluster_id, controller_id) {
            continue;
        }
        match Stack::from_cf(&data) {
            Ok(stack) => stacks.push(stack),
            Err(e) => {
                warn!(stack = %data.name, error = %e, "Skipping undecodable managed stack");
            }
        }
    }
    Ok(stacks)
}

/// Create the stack described by the spec, returning the stack id
pub async fn create_stack(cf: &dyn CloudFormationApi, spec: &StackSpec) -> Result<String, Error> {
    cf.create_stack(&stack_op_input(spec)?).await
}

/// Update the stack described by the spec, returning the stack id
///
/// When termination protection is configured it is re-asserted before the
/// update so stacks created before the setting changed pick it up.
pub async fn update_stack(cf: &dyn CloudFormationApi, spec: &StackSpec) -> Result<String, Error> {
    if spec.termination_protection {
        cf.set_termination_protection(&spec.name, true).await?;
    }
    cf.update_stack(&stack_op_input(spec)?).await
}

/// Delete a stack, clearing termination protection first
pub async fn delete_stack(cf: &dyn CloudFormationApi, name: &str) -> Result<(), Error> {
    cf.set_termination_protection(name, false).await?;
    cf.delete_stack(name).await
}

fn stack_op_input(spec: &StackSpec) -> Result<StackOpInput, Error> {
    Ok(StackOpInput {
        name: spec.name.clone(),
        template_body: generate_template(spec)?,
        parameters: spec.parameters(),
        tags: spec.build_tags(),
        timeout_minutes: spec.timeout_minutes,
        termination_protection: spec.termination_protection,
    })
}

// =============================================================================
// SDK implementation
// =============================================================================

/// CloudFormation seam backed by the AWS SDK
pub struct SdkCloudFormation {
    client: aws_sdk_cloudformation::Client,
}

impl SdkCloudFormation {
    /// Create a new SDK-backed CloudFormation seam
    pub fn new(client: aws_sdk_cloudformation::Client) -> Self {
        Self { client }
    }

    fn cf_parameters(parameters: &[(String, String)]) -> Vec<Parameter> {
        parameters
            .iter()
            .map(|(k, v)| {
                Parameter::builder()
                    .parameter_key(k)
                    .parameter_value(v)
                    .build()
            })
            .collect()
    }

    fn cf_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>, Error> {
        tags.iter()
            .map(|(k, v)| {
                Ok(Tag::builder().key(k).value(v).build())
            })
            .collect()
    }
}

#[async_trait]
impl CloudFormationApi for SdkCloudFormation {
    async fn list_stacks(&self) -> Result<Vec<CfStackData>, Error> {
        let mut stacks = Vec::new();
        let mut pages = self.client.describe_stacks().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| crate::aws::sdk_error("DescribeStacks", &e))?;
            for stack in page.stacks() {
                stacks.push(CfStackData {
                    name: stack.stack_name().unwrap_or_default().to_string(),
                    status: stack
                        .stack_status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    status_reason: stack.stack_status_reason().unwrap_or_default().to_string(),
                    outputs: stack
                        .outputs()
                        .iter()
                        .filter_map(|o| {
                            Some((o.output_key()?.to_string(), o.output_value()?.to_string()))
                        })
                        .collect(),
                    parameters: stack
                        .parameters()
                        .iter()
                        .filter_map(|p| {
                            Some((
                                p.parameter_key()?.to_string(),
                                p.parameter_value()?.to_string(),
                            ))
                        })
                        .collect(),
                    tags: stack
                        .tags()
                        .iter()
                        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
                        .collect(),
                });
            }
        }
        Ok(stacks)
    }

    async fn create_stack(&self, input: &StackOpInput) -> Result<String, Error> {
        let resp = self
            .client
            .create_stack()
            .stack_name(&input.name)
            .on_failure(OnFailure::Delete)
            .template_body(&input.template_body)
            .set_parameters(Some(Self::cf_parameters(&input.parameters)))
            .set_tags(Some(Self::cf_tags(&input.tags)?))
            .timeout_in_minutes(input.timeout_minutes as i32)
            .enable_termination_protection(input.termination_protection)
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("CreateStack", &e))?;
        Ok(resp.stack_id().unwrap_or(&input.name).to_string())
    }

    async fn update_stack(&self, input: &StackOpInput) -> Result<String, Error> {
        let resp = self
            .client
            .update_stack()
            .stack_name(&input.name)
            .template_body(&input.template_body)
            .set_parameters(Some(Self::cf_parameters(&input.parameters)))
            .set_tags(Some(Self::cf_tags(&input.tags)?))
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("UpdateStack", &e))?;
        Ok(resp.stack_id().unwrap_or(&input.name).to_string())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), Error> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("DeleteStack", &e))?;
        Ok(())
    }

    async fn set_termination_protection(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        self.client
            .update_termination_protection()
            .stack_name(name)
            .enable_termination_protection(enabled)
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("UpdateTerminationProtection", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{
        CLUSTER_ID_TAG_PREFIX, KUBERNETES_CREATOR_TAG, RESOURCE_LIFECYCLE_OWNED,
    };
    use mockall::Sequence;

    fn managed(name: &str) -> CfStackData {
        CfStackData {
            name: name.to_string(),
            status: "CREATE_COMPLETE".to_string(),
            tags: [
                (KUBERNETES_CREATOR_TAG.to_string(), "ctl".to_string()),
                (
                    format!("{CLUSTER_ID_TAG_PREFIX}prod"),
                    RESOURCE_LIFECYCLE_OWNED.to_string(),
                ),
            ]
            .into_iter()
            .collect(),
            ..CfStackData::default()
        }
    }

    #[tokio::test]
    async fn unmanaged_stacks_are_filtered_out() {
        let mut cf = MockCloudFormationApi::new();
        cf.expect_list_stacks().returning(|| {
            let foreign = CfStackData {
                name: "someone-elses".to_string(),
                status: "CREATE_COMPLETE".to_string(),
                ..CfStackData::default()
            };
            Ok(vec![managed("prod-1"), foreign, managed("prod-2")])
        });

        let stacks = find_managed_stacks(&cf, "prod", "ctl").await.unwrap();
        let names: Vec<&str> = stacks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["prod-1", "prod-2"]);
    }

    #[tokio::test]
    async fn undecodable_stacks_are_skipped_not_fatal() {
        let mut cf = MockCloudFormationApi::new();
        cf.expect_list_stacks().returning(|| {
            let mut broken = managed("prod-broken");
            broken.tags.insert(
                crate::aws::EXTRA_LISTENERS_TAG.to_string(),
                "%%% not base64 %%%".to_string(),
            );
            Ok(vec![broken, managed("prod-ok")])
        });

        let stacks = find_managed_stacks(&cf, "prod", "ctl").await.unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].name, "prod-ok");
    }

    #[tokio::test]
    async fn delete_clears_termination_protection_first() {
        let mut cf = MockCloudFormationApi::new();
        let mut seq = Sequence::new();
        cf.expect_set_termination_protection()
            .withf(|name, enabled| name == "prod-1" && !enabled)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cf.expect_delete_stack()
            .withf(|name| name == "prod-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        delete_stack(&cf, "prod-1").await.unwrap();
    }

    #[tokio::test]
    async fn create_encodes_template_parameters_and_tags() {
        let spec = StackSpec {
            name: "prod-0123456789".to_string(),
            cluster_id: "prod".to_string(),
            controller_id: "ctl".to_string(),
            target_port: 9999,
            timeout_minutes: 15,
            termination_protection: true,
            ..StackSpec::default()
        };

        let mut cf = MockCloudFormationApi::new();
        cf.expect_create_stack()
            .withf(|input: &StackOpInput| {
                input.name == "prod-0123456789"
                    && input.timeout_minutes == 15
                    && input.termination_protection
                    && input.template_body.contains("AWSTemplateFormatVersion")
                    && input.tags.get(KUBERNETES_CREATOR_TAG).map(String::as_str) == Some("ctl")
                    && input
                        .parameters
                        .iter()
                        .any(|(k, v)| k == "TargetGroupTargetPortParameter" && v == "9999")
            })
            .times(1)
            .returning(|input| Ok(format!("arn:aws:cloudformation:::stack/{}", input.name)));

        let id = create_stack(&cf, &spec).await.unwrap();
        assert!(id.ends_with("prod-0123456789"));
    }

    #[tokio::test]
    async fn update_reasserts_termination_protection_when_configured() {
        let spec = StackSpec {
            name: "prod-1".to_string(),
            termination_protection: true,
            target_port: 9999,
            ..StackSpec::default()
        };

        let mut cf = MockCloudFormationApi::new();
        let mut seq = Sequence::new();
        cf.expect_set_termination_protection()
            .withf(|name, enabled| name == "prod-1" && *enabled)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cf.expect_update_stack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|input| Ok(input.name.clone()));

        update_stack(&cf, &spec).await.unwrap();
    }
}
