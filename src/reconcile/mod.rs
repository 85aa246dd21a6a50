//! Bucketing and the per-tick reconciliation algorithm
//!
//! Every tick the reconciler observes the normalized ingress records, the
//! certificate inventory and the managed stacks, then converges: ingresses
//! group into buckets by compatibility key, each bucket gets exactly one
//! stack (created or updated), stacks no bucket elects drain until their
//! certificate elections lapse and are then garbage-collected, and the
//! load balancer hostnames are written back into resource status.
//!
//! Ticks are serial; per-ingress failures are logged and never abort the
//! tick. Only configuration errors are fatal.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::aws::cloudformation::{self, CloudFormationApi};
use crate::aws::nodes::{select_subnets, Ec2Api, Subnet};
use crate::aws::stack::{
    alarm_config_hash, stack_name, zero_instant, CloudWatchAlarm, Stack, StackSpec,
};
use crate::aws::targets::{reconcile_targets, ElbApi};
use crate::aws::{
    ExtraListener, IpAddressType, ListenerProtocol, LoadBalancerScheme, LoadBalancerType,
    CERTIFICATE_ARN_TAG_LEGACY, CERTIFICATE_ARN_TAG_PREFIX,
};
use crate::certs::matcher::elect_certificates;
use crate::certs::CertificateSource;
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::ingress::IngressRecord;
use crate::kubernetes::KubernetesApi;

// =============================================================================
// Buckets
// =============================================================================

/// The sorted, deduplicated shape of an extra-listener set
///
/// The namespace is deliberately absent: listeners agreeing on protocol,
/// ports and pod label are the same listener for co-tenancy purposes.
pub type ListenerSignature = Vec<(ListenerProtocol, u16, u16, String)>;

/// Compute the signature of an extra-listener list
pub fn listener_signature(listeners: &[ExtraListener]) -> ListenerSignature {
    let mut sig: ListenerSignature = listeners
        .iter()
        .map(|l| (l.protocol, l.listen_port, l.target_port, l.pod_label.clone()))
        .collect();
    sig.sort();
    sig.dedup();
    sig
}

/// The compatibility key deciding stack co-tenancy
///
/// Two ingress records with equal keys may share a stack; unequal keys
/// never may. Non-shared records carry their own identity in `owner`,
/// forcing a bucket of size one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Load balancer scheme
    pub scheme: LoadBalancerScheme,
    /// Security group
    pub security_group: String,
    /// SSL policy
    pub ssl_policy: String,
    /// IP address type
    pub ip_address_type: IpAddressType,
    /// Load balancer type
    pub load_balancer_type: LoadBalancerType,
    /// HTTP/2 flag
    pub http2: bool,
    /// WAF web ACL id
    pub waf_web_acl_id: String,
    /// True when the bucket's members have no external hostnames
    pub cluster_local: bool,
    /// Owning ingress identity, set iff not shared
    pub owner: Option<String>,
    /// Extra-listener signature
    pub listener_signature: ListenerSignature,
    /// Hash of the CloudWatch alarm configuration (ALB only)
    pub cw_alarm_config_hash: String,
}

impl BucketKey {
    /// Build the key for one normalized record
    pub fn from_record(record: &IngressRecord, alarm_hash: &str) -> Self {
        let cw_alarm_config_hash = match record.load_balancer_type {
            LoadBalancerType::Application => alarm_hash.to_string(),
            LoadBalancerType::Network => String::new(),
        };
        Self {
            scheme: record.scheme,
            security_group: record.security_group.clone(),
            ssl_policy: record.ssl_policy.clone(),
            ip_address_type: record.ip_address_type,
            load_balancer_type: record.load_balancer_type,
            http2: record.http2,
            waf_web_acl_id: record.waf_web_acl_id.clone(),
            cluster_local: record.cluster_local,
            owner: (!record.shared).then(|| record.resource_id()),
            listener_signature: listener_signature(&record.extra_listeners),
            cw_alarm_config_hash,
        }
    }

    /// True when an existing managed stack can back this bucket
    pub fn matches_stack(&self, stack: &Stack) -> bool {
        self.scheme == stack.scheme
            && self.security_group == stack.security_group
            && self.ssl_policy == stack.ssl_policy
            && self.ip_address_type == stack.ip_address_type
            && self.load_balancer_type == stack.load_balancer_type
            && self.http2 == stack.http2
            && self.waf_web_acl_id == stack.waf_web_acl_id
            && self.owner.as_deref().unwrap_or("") == stack.owner_ingress
            && self.listener_signature == listener_signature(&stack.extra_listeners)
            && self.cw_alarm_config_hash == stack.cw_alarm_config_hash
    }

    /// Stable textual encoding of the key, hashed into the stack name
    pub fn discriminator(&self) -> String {
        let listeners: Vec<String> = self
            .listener_signature
            .iter()
            .map(|(proto, listen, target, label)| format!("{proto}:{listen}:{target}:{label}"))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
            self.scheme,
            self.security_group,
            self.ssl_policy,
            self.ip_address_type,
            self.load_balancer_type,
            self.http2,
            self.waf_web_acl_id,
            self.cluster_local,
            self.owner.as_deref().unwrap_or(""),
            listeners.join(","),
            self.cw_alarm_config_hash,
        )
    }
}

/// A set of ingresses compatible enough to share one stack
#[derive(Clone, Debug)]
pub struct Bucket {
    /// The compatibility key
    pub key: BucketKey,
    /// The member records
    pub ingresses: Vec<IngressRecord>,
    /// Union of the members' elected certificate ARNs
    pub certificates: BTreeSet<String>,
    /// Union of the members' extra listeners, deduplicated on signature
    pub extra_listeners: Vec<ExtraListener>,
}

/// Group elected records into buckets
///
/// Each record appears in exactly one bucket; non-shared records always
/// form a bucket of size one through their owner identity.
pub fn build_buckets(
    records: Vec<(IngressRecord, BTreeSet<String>)>,
    alarm_hash: &str,
) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut index: HashMap<BucketKey, usize> = HashMap::new();

    for (record, certificates) in records {
        let key = BucketKey::from_record(&record, alarm_hash);
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            buckets.push(Bucket {
                key,
                ingresses: Vec::new(),
                certificates: BTreeSet::new(),
                extra_listeners: Vec::new(),
            });
            buckets.len() - 1
        });
        let bucket = &mut buckets[slot];
        bucket.certificates.extend(certificates);
        for listener in &record.extra_listeners {
            let sig = (
                listener.protocol,
                listener.listen_port,
                listener.target_port,
                listener.pod_label.clone(),
            );
            if !bucket
                .extra_listeners
                .iter()
                .any(|l| (l.protocol, l.listen_port, l.target_port, l.pod_label.clone()) == sig)
            {
                bucket.extra_listeners.push(listener.clone());
            }
        }
        bucket.extra_listeners.sort();
        bucket.ingresses.push(record);
    }

    buckets
}

// =============================================================================
// Reconciler
// =============================================================================

/// The per-tick reconciliation driver
pub struct Reconciler {
    config: ControllerConfig,
}

impl Reconciler {
    /// Create a reconciler for a validated configuration
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    /// Run one reconcile tick
    ///
    /// Per-ingress and per-stack failures are logged and skipped; an error
    /// return means the tick could not observe its inputs and should be
    /// retried by the next tick.
    pub async fn tick(
        &self,
        kube: &mut dyn KubernetesApi,
        cf: &dyn CloudFormationApi,
        elb: &dyn ElbApi,
        ec2: &dyn Ec2Api,
        certs: &dyn CertificateSource,
    ) -> Result<(), Error> {
        let records = kube.list_resources().await?;
        let inventory = certs.inventory().await?;
        let alarms = self.load_alarms(&*kube).await;
        let alarm_hash = alarm_config_hash(&alarms);

        let mut elected = Vec::with_capacity(records.len());
        for record in records {
            match elect_certificates(&record, &inventory) {
                Ok(set) => elected.push((record, set)),
                Err(e) => warn!(
                    kind = %record.kind,
                    namespace = %record.namespace,
                    name = %record.name,
                    error = %e,
                    "Skipping ingress without usable certificate"
                ),
            }
        }

        let buckets = build_buckets(elected, &alarm_hash);
        let stacks = cloudformation::find_managed_stacks(
            cf,
            &self.config.cluster_id,
            &self.config.controller_id,
        )
        .await?;

        let subnets = match ec2.cluster_subnets(&self.config.cluster_id).await {
            Ok(subnets) => subnets,
            Err(e) => {
                warn!(error = %e, "Failed to discover cluster subnets");
                Vec::new()
            }
        };
        let instances = match ec2.running_cluster_instances(&self.config.cluster_id).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(error = %e, "Failed to discover cluster instances");
                Vec::new()
            }
        };
        let vpc_id = subnets
            .first()
            .map(|s| s.vpc_id.clone())
            .or_else(|| instances.first().map(|i| i.vpc_id.clone()))
            .unwrap_or_default();

        let now = Utc::now();

        // Converge every bucket onto a stack.
        let mut matched_names: BTreeSet<String> = BTreeSet::new();
        let mut backing: Vec<Option<Stack>> = Vec::with_capacity(buckets.len());
        for bucket in &buckets {
            if bucket.key.cluster_local {
                backing.push(None);
                continue;
            }
            let existing = stacks.iter().find(|s| bucket.key.matches_stack(s));
            if let Some(stack) = existing {
                matched_names.insert(stack.name.clone());
            }
            if let Err(e) = self
                .converge_bucket(cf, bucket, existing, &subnets, &vpc_id, &alarms, now)
                .await
            {
                warn!(error = %e, "Failed to converge bucket");
            }
            backing.push(existing.cloned());
        }

        // Garbage-collect stacks no bucket elects once every certificate
        // election has lapsed; everything else drains.
        for stack in &stacks {
            if matched_names.contains(&stack.name) {
                if let Some(e) = stack.err() {
                    error!(stack = %stack.name, error = %e, "Stack requires operator intervention");
                }
                continue;
            }
            if stack.should_delete(now) {
                info!(stack = %stack.name, "Deleting stack without valid certificates");
                if let Err(e) = cloudformation::delete_stack(cf, &stack.name).await {
                    warn!(stack = %stack.name, error = %e, "Failed to delete stack");
                }
            } else if let Some(e) = stack.err() {
                error!(stack = %stack.name, error = %e, "Stack requires operator intervention");
            } else {
                debug!(stack = %stack.name, "Stack draining until certificate elections lapse");
            }
        }

        // Target registration runs against the observed stacks; freshly
        // created stacks expose no target groups yet and are picked up by
        // the next tick.
        let pod_ips = self.collect_pod_ips(&*kube, &stacks).await;
        let changed =
            reconcile_targets(elb, &stacks, &instances, self.config.target_type, &pod_ips).await;
        if changed > 0 {
            info!(target_groups = changed, "Adjusted target group membership");
        }

        // Status write-back fires last, gated on the backing stack being
        // complete.
        for (bucket, stack) in buckets.iter().zip(backing.iter()) {
            let dns_name = if bucket.key.cluster_local {
                self.config.cluster_local_domain.clone()
            } else {
                match stack {
                    Some(stack) if stack.is_complete() && !stack.dns_name.is_empty() => {
                        stack.dns_name.clone()
                    }
                    _ => continue,
                }
            };
            for ingress in &bucket.ingresses {
                match kube.update_load_balancer_hostname(ingress, &dns_name).await {
                    Ok(()) => info!(
                        kind = %ingress.kind,
                        namespace = %ingress.namespace,
                        name = %ingress.name,
                        hostname = %dns_name,
                        "Updated load balancer hostname"
                    ),
                    Err(e) if e.is_update_not_needed() => {
                        debug!(
                            kind = %ingress.kind,
                            namespace = %ingress.namespace,
                            name = %ingress.name,
                            "Hostname already current"
                        );
                    }
                    Err(e) => warn!(
                        kind = %ingress.kind,
                        namespace = %ingress.namespace,
                        name = %ingress.name,
                        error = %e,
                        "Failed to update status hostname"
                    ),
                }
            }
        }

        Ok(())
    }

    async fn converge_bucket(
        &self,
        cf: &dyn CloudFormationApi,
        bucket: &Bucket,
        existing: Option<&Stack>,
        subnets: &[Subnet],
        vpc_id: &str,
        alarms: &[CloudWatchAlarm],
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let certificates = desired_certificates(
            &bucket.certificates,
            existing,
            now,
            self.config.cert_ttl,
        );

        match existing {
            None => {
                let name = stack_name(&self.config.cluster_id, &bucket.key.discriminator());
                let spec = self.build_spec(bucket, name, certificates, subnets, vpc_id, alarms);
                if spec.subnets.is_empty() {
                    return Err(Error::transient(
                        "CreateStack",
                        format!("no subnets discovered for scheme {}", bucket.key.scheme),
                    ));
                }
                info!(stack = %spec.name, "Creating stack");
                cloudformation::create_stack(cf, &spec).await?;
                Ok(())
            }
            Some(stack) => {
                let spec = self.build_spec(
                    bucket,
                    stack.name.clone(),
                    certificates,
                    subnets,
                    vpc_id,
                    alarms,
                );
                if !stack_drifted(&spec, stack, &bucket.certificates, now, self.config.cert_ttl) {
                    return Ok(());
                }
                info!(stack = %stack.name, "Updating drifted stack");
                match cloudformation::update_stack(cf, &spec).await {
                    Ok(_) => Ok(()),
                    Err(Error::NotFound { .. }) => {
                        // The stack vanished between list and update; fall
                        // through to create.
                        let name =
                            stack_name(&self.config.cluster_id, &bucket.key.discriminator());
                        let spec = StackSpec { name, ..spec };
                        info!(stack = %spec.name, "Stack vanished, recreating");
                        cloudformation::create_stack(cf, &spec).await?;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn build_spec(
        &self,
        bucket: &Bucket,
        name: String,
        certificate_arns: BTreeMap<String, DateTime<Utc>>,
        subnets: &[Subnet],
        vpc_id: &str,
        alarms: &[CloudWatchAlarm],
    ) -> StackSpec {
        let key = &bucket.key;
        let cloudwatch_alarms = match key.load_balancer_type {
            LoadBalancerType::Application => alarms.to_vec(),
            LoadBalancerType::Network => Vec::new(),
        };
        StackSpec {
            name,
            scheme: key.scheme,
            owner_ingress: key.owner.clone().unwrap_or_default(),
            subnets: select_subnets(subnets, key.scheme),
            certificate_arns,
            security_group_id: key.security_group.clone(),
            cluster_id: self.config.cluster_id.clone(),
            vpc_id: vpc_id.to_string(),
            health_check: Some(self.config.health_check.clone()),
            alb_healthy_threshold_count: self.config.alb_healthy_threshold_count,
            alb_unhealthy_threshold_count: self.config.alb_unhealthy_threshold_count,
            nlb_healthy_threshold_count: self.config.nlb_healthy_threshold_count,
            target_type: self.config.target_type,
            target_port: self.config.target_port,
            http_disabled: self.config.http_disabled,
            http_target_port: self.config.http_target_port,
            timeout_minutes: self.config.stack_timeout_minutes,
            termination_protection: self.config.stack_termination_protection,
            idle_connection_timeout_seconds: self.config.idle_connection_timeout_seconds,
            deregistration_delay_seconds: self.config.deregistration_delay_timeout_seconds,
            controller_id: self.config.controller_id.clone(),
            ssl_policy: key.ssl_policy.clone(),
            ip_address_type: key.ip_address_type,
            load_balancer_type: key.load_balancer_type,
            alb_logs_s3_bucket: self.config.alb_logs_s3_bucket.clone(),
            alb_logs_s3_prefix: self.config.alb_logs_s3_prefix.clone(),
            waf_web_acl_id: key.waf_web_acl_id.clone(),
            cloudwatch_alarms,
            http_redirect_to_https: self.config.http_redirect_to_https,
            nlb_cross_zone: self.config.nlb_cross_zone,
            extra_listeners: bucket.extra_listeners.clone(),
            http2: key.http2,
            deny_internal_domains: self.config.deny_internal_domains.clone(),
            tags: self.config.additional_stack_tags.clone(),
        }
    }

    async fn load_alarms(&self, kube: &dyn KubernetesApi) -> Vec<CloudWatchAlarm> {
        let Some((namespace, name)) = &self.config.cloudwatch_alarm_config_map else {
            return Vec::new();
        };
        match kube.get_config_map(namespace, name).await {
            Ok(data) => {
                let mut alarms = Vec::new();
                for (key, value) in data {
                    match serde_json::from_str::<Vec<CloudWatchAlarm>>(&value) {
                        Ok(mut list) => alarms.append(&mut list),
                        Err(e) => warn!(
                            configmap = %name,
                            entry = %key,
                            error = %e,
                            "Ignoring unparseable alarm entry"
                        ),
                    }
                }
                alarms
            }
            Err(e) => {
                warn!(configmap = %name, error = %e, "Failed to load alarm ConfigMap");
                Vec::new()
            }
        }
    }

    /// Collect pod IPs for every extra-listener selector, fresh per tick
    async fn collect_pod_ips(
        &self,
        kube: &dyn KubernetesApi,
        stacks: &[Stack],
    ) -> BTreeMap<(String, String), Vec<String>> {
        let mut selectors: BTreeSet<(String, String)> = BTreeSet::new();
        for stack in stacks {
            for listener in &stack.extra_listeners {
                if !listener.pod_label.is_empty() {
                    selectors.insert((listener.namespace.clone(), listener.pod_label.clone()));
                }
            }
        }

        let mut pod_ips = BTreeMap::new();
        for (namespace, label) in selectors {
            match kube.pod_ips(&namespace, &label).await {
                Ok(ips) => {
                    pod_ips.insert((namespace, label), ips);
                }
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        selector = %label,
                        error = %e,
                        "Failed to list pods for extra listener"
                    );
                }
            }
        }
        pod_ips
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Merge the bucket's elections with the stack's persisted certificate set
///
/// Elected ARNs get a fresh TTL; ARNs the stack still carries but nothing
/// elects keep their persisted TTL so their natural expiry governs
/// garbage collection.
fn desired_certificates(
    elected: &BTreeSet<String>,
    existing: Option<&Stack>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> BTreeMap<String, DateTime<Utc>> {
    let mut certificates = BTreeMap::new();
    if let Some(stack) = existing {
        for (arn, persisted) in &stack.certificate_arns {
            if !elected.contains(arn) {
                certificates.insert(arn.clone(), persisted.unwrap_or_else(zero_instant));
            }
        }
    }
    for arn in elected {
        certificates.insert(arn.clone(), now + ttl);
    }
    certificates
}

/// True when the existing stack no longer matches the desired spec
///
/// Parameters and non-certificate tags compare literally. Certificate
/// elections count as drift when an elected ARN is missing, carries a
/// legacy zero TTL, or has burned through half its TTL (refreshing on
/// every tick would update the stack continuously).
fn stack_drifted(
    spec: &StackSpec,
    stack: &Stack,
    elected: &BTreeSet<String>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    let desired_parameters: BTreeMap<String, String> = spec.parameters().into_iter().collect();
    if desired_parameters != stack.parameters {
        return true;
    }

    let strip_certificates = |tags: &BTreeMap<String, String>| -> BTreeMap<String, String> {
        tags.iter()
            .filter(|(k, _)| {
                !k.starts_with(CERTIFICATE_ARN_TAG_PREFIX)
                    && k.as_str() != CERTIFICATE_ARN_TAG_LEGACY
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    if strip_certificates(&spec.build_tags()) != strip_certificates(&stack.tags) {
        return true;
    }

    let refresh_below = now + ttl / 2;
    for arn in elected {
        match stack.certificate_arns.get(arn) {
            None => return true,
            Some(None) => return true,
            Some(Some(persisted)) if *persisted < refresh_below => return true,
            Some(Some(_)) => {}
        }
    }

    false
}
