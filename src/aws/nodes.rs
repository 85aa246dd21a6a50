//! EC2 node and subnet inventory
//!
//! The reconciler needs two things from EC2: the running instances of the
//! cluster's node pool (target registration) and the subnets a new load
//! balancer should span (template parameters). Both are discovered through
//! the cluster ownership tags.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::aws::{LoadBalancerScheme, CLUSTER_ID_TAG_PREFIX};
use crate::error::Error;

/// One running node of the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// EC2 instance id
    pub id: String,
    /// Primary private IPv4 address
    pub private_ip: String,
    /// VPC the instance lives in
    pub vpc_id: String,
    /// Subnet the instance lives in
    pub subnet_id: String,
}

/// One subnet tagged for the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    /// Subnet id
    pub id: String,
    /// Availability zone of the subnet
    pub availability_zone: String,
    /// VPC the subnet belongs to
    pub vpc_id: String,
    /// True when the subnet routes to an internet gateway
    pub public: bool,
}

/// Abstraction over the EC2 queries the controller issues
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Running instances carrying the cluster ownership tag
    async fn running_cluster_instances(&self, cluster_id: &str) -> Result<Vec<Instance>, Error>;

    /// Subnets carrying the cluster ownership tag, classified public/private
    async fn cluster_subnets(&self, cluster_id: &str) -> Result<Vec<Subnet>, Error>;
}

/// Pick the subnets a load balancer of the given scheme should span
///
/// Internet-facing load balancers get public subnets, internal ones private
/// subnets. One subnet per availability zone, ties broken by the lexically
/// smallest id so the choice is stable across ticks.
pub fn select_subnets(subnets: &[Subnet], scheme: LoadBalancerScheme) -> Vec<String> {
    let want_public = scheme == LoadBalancerScheme::InternetFacing;
    let mut by_az: std::collections::BTreeMap<&str, &str> = std::collections::BTreeMap::new();
    for subnet in subnets.iter().filter(|s| s.public == want_public) {
        let entry = by_az
            .entry(subnet.availability_zone.as_str())
            .or_insert(subnet.id.as_str());
        if subnet.id.as_str() < *entry {
            *entry = subnet.id.as_str();
        }
    }
    by_az.values().map(|id| id.to_string()).collect()
}

// =============================================================================
// SDK implementation
// =============================================================================

/// EC2 seam backed by the AWS SDK
pub struct SdkEc2 {
    client: aws_sdk_ec2::Client,
}

impl SdkEc2 {
    /// Create a new SDK-backed EC2 seam
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn running_cluster_instances(&self, cluster_id: &str) -> Result<Vec<Instance>, Error> {
        use aws_sdk_ec2::types::Filter;

        let cluster_tag = format!("{CLUSTER_ID_TAG_PREFIX}{cluster_id}");
        let mut instances = Vec::new();
        let mut pages = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .filters(Filter::builder().name("tag-key").values(cluster_tag).build())
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| crate::aws::sdk_error("DescribeInstances", &e))?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    let (Some(id), Some(private_ip)) =
                        (instance.instance_id(), instance.private_ip_address())
                    else {
                        continue;
                    };
                    instances.push(Instance {
                        id: id.to_string(),
                        private_ip: private_ip.to_string(),
                        vpc_id: instance.vpc_id().unwrap_or_default().to_string(),
                        subnet_id: instance.subnet_id().unwrap_or_default().to_string(),
                    });
                }
            }
        }
        Ok(instances)
    }

    async fn cluster_subnets(&self, cluster_id: &str) -> Result<Vec<Subnet>, Error> {
        use aws_sdk_ec2::types::Filter;

        let cluster_tag = format!("{CLUSTER_ID_TAG_PREFIX}{cluster_id}");
        let resp = self
            .client
            .describe_subnets()
            .filters(Filter::builder().name("tag-key").values(cluster_tag).build())
            .send()
            .await
            .map_err(|e| crate::aws::sdk_error("DescribeSubnets", &e))?;

        let vpc_ids: std::collections::BTreeSet<String> = resp
            .subnets()
            .iter()
            .filter_map(|s| s.vpc_id().map(str::to_string))
            .collect();

        // Route tables classify subnets: a route to an internet gateway
        // makes the subnet public. Unassociated subnets inherit the VPC's
        // main route table.
        let mut public_subnets = std::collections::BTreeSet::new();
        let mut main_is_public = std::collections::BTreeMap::new();
        for vpc_id in &vpc_ids {
            let tables = self
                .client
                .describe_route_tables()
                .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
                .send()
                .await
                .map_err(|e| crate::aws::sdk_error("DescribeRouteTables", &e))?;
            for table in tables.route_tables() {
                let has_igw = table.routes().iter().any(|r| {
                    r.gateway_id().is_some_and(|g| g.starts_with("igw-"))
                });
                for assoc in table.associations() {
                    if assoc.main().unwrap_or(false) {
                        main_is_public.insert(vpc_id.clone(), has_igw);
                    }
                    if let Some(subnet_id) = assoc.subnet_id() {
                        if has_igw {
                            public_subnets.insert(subnet_id.to_string());
                        }
                    }
                }
            }
        }

        Ok(resp
            .subnets()
            .iter()
            .filter_map(|s| {
                let id = s.subnet_id()?.to_string();
                let vpc_id = s.vpc_id().unwrap_or_default().to_string();
                let public = public_subnets.contains(&id)
                    || *main_is_public.get(&vpc_id).unwrap_or(&false);
                Some(Subnet {
                    id,
                    availability_zone: s.availability_zone().unwrap_or_default().to_string(),
                    vpc_id,
                    public,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, az: &str, public: bool) -> Subnet {
        Subnet {
            id: id.to_string(),
            availability_zone: az.to_string(),
            vpc_id: "vpc-1".to_string(),
            public,
        }
    }

    #[test]
    fn internet_facing_selects_public_subnets_one_per_az() {
        let subnets = vec![
            subnet("subnet-pub-b", "eu-central-1a", true),
            subnet("subnet-pub-a", "eu-central-1a", true),
            subnet("subnet-pub-c", "eu-central-1b", true),
            subnet("subnet-priv-a", "eu-central-1a", false),
        ];
        let selected = select_subnets(&subnets, LoadBalancerScheme::InternetFacing);
        assert_eq!(selected, vec!["subnet-pub-a", "subnet-pub-c"]);
    }

    #[test]
    fn internal_selects_private_subnets() {
        let subnets = vec![
            subnet("subnet-pub-a", "eu-central-1a", true),
            subnet("subnet-priv-a", "eu-central-1a", false),
            subnet("subnet-priv-b", "eu-central-1b", false),
        ];
        let selected = select_subnets(&subnets, LoadBalancerScheme::Internal);
        assert_eq!(selected, vec!["subnet-priv-a", "subnet-priv-b"]);
    }

    #[test]
    fn selection_is_stable_regardless_of_input_order() {
        let mut subnets = vec![
            subnet("subnet-2", "eu-central-1a", true),
            subnet("subnet-1", "eu-central-1a", true),
        ];
        let a = select_subnets(&subnets, LoadBalancerScheme::InternetFacing);
        subnets.reverse();
        let b = select_subnets(&subnets, LoadBalancerScheme::InternetFacing);
        assert_eq!(a, b);
        assert_eq!(a, vec!["subnet-1"]);
    }
}
