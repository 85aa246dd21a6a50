//! Skylift controller entrypoint
//!
//! Parses flags into the controller configuration, wires up the AWS and
//! Kubernetes clients and drives the serial reconcile loop until shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use skylift::aws::cloudformation::SdkCloudFormation;
use skylift::aws::nodes::SdkEc2;
use skylift::aws::targets::SdkElb;
use skylift::aws::{LoadBalancerType, TargetType};
use skylift::certs::AcmCertificateSource;
use skylift::config::{ControllerConfig, DenyInternalDomains, HealthCheck};
use skylift::kubernetes::Adapter;
use skylift::reconcile::Reconciler;

/// Skylift - Kubernetes ingress to AWS load balancer operator
#[derive(Parser, Debug)]
#[command(name = "skylift", version, about, long_about = None)]
struct Cli {
    /// Identifier written to the kubernetes:application tag on every stack
    #[arg(long, env = "CONTROLLER_ID", default_value = skylift::DEFAULT_CONTROLLER_ID)]
    controller_id: String,

    /// Cluster identifier the managed stacks belong to
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: String,

    /// Ingress API group/version to list
    #[arg(long, default_value = "networking.k8s.io/v1")]
    ingress_api_version: String,

    /// Ingress classes acted upon; repeatable, empty means all classes
    #[arg(long = "ingress-class-filter", value_delimiter = ',')]
    ingress_class_filters: Vec<String>,

    /// Security group attached when no annotation overrides it
    #[arg(long, default_value = "")]
    default_security_group: String,

    /// SSL policy applied when no annotation overrides it
    #[arg(long, default_value = skylift::DEFAULT_SSL_POLICY)]
    default_ssl_policy: String,

    /// Load balancer type applied when no annotation overrides it
    /// (application or network)
    #[arg(long, default_value = "application")]
    default_load_balancer_type: String,

    /// Domain suffix marking hostnames as cluster-local
    #[arg(long, default_value = skylift::DEFAULT_CLUSTER_LOCAL_DOMAIN)]
    cluster_local_domain: String,

    /// Lifetime of a certificate election in seconds
    #[arg(long, default_value_t = skylift::DEFAULT_CERT_TTL_SECONDS)]
    cert_ttl_seconds: i64,

    /// Create stacks with termination protection
    #[arg(long)]
    stack_termination_protection: bool,

    /// CloudFormation stack creation timeout in minutes
    #[arg(long, default_value_t = skylift::DEFAULT_STACK_TIMEOUT_MINUTES)]
    stack_timeout_minutes: u32,

    /// Idle connection timeout for application load balancers
    #[arg(long, default_value_t = skylift::DEFAULT_IDLE_TIMEOUT_SECONDS)]
    idle_connection_timeout_seconds: u32,

    /// Target group deregistration delay in seconds
    #[arg(long, default_value_t = skylift::DEFAULT_DEREGISTRATION_DELAY_SECONDS)]
    deregistration_delay_timeout_seconds: u32,

    /// How targets are addressed in target groups (instance or ip)
    #[arg(long, default_value = "instance")]
    target_type: String,

    /// Port the primary target group forwards to
    #[arg(long, default_value_t = 9999)]
    target_port: u16,

    /// Health check path probed by the load balancer
    #[arg(long, default_value = "/kube-system/healthz")]
    health_check_path: String,

    /// Health check port probed by the load balancer
    #[arg(long, default_value_t = 9999)]
    health_check_port: u16,

    /// Seconds between health check probes
    #[arg(long, default_value_t = 10)]
    health_check_interval_seconds: u32,

    /// Health check probe timeout in seconds
    #[arg(long, default_value_t = 5)]
    health_check_timeout_seconds: u32,

    /// ALB healthy threshold count
    #[arg(long, default_value_t = 3)]
    alb_healthy_threshold_count: u32,

    /// ALB unhealthy threshold count
    #[arg(long, default_value_t = 3)]
    alb_unhealthy_threshold_count: u32,

    /// NLB healthy threshold count
    #[arg(long, default_value_t = 3)]
    nlb_healthy_threshold_count: u32,

    /// Disable the plain HTTP listener entirely
    #[arg(long)]
    http_disabled: bool,

    /// Redirect HTTP to HTTPS instead of forwarding
    #[arg(long)]
    http_redirect_to_https: bool,

    /// Distinct target port for the HTTP listener; 0 means same as primary
    #[arg(long, default_value_t = 0)]
    http_target_port: u16,

    /// Serve a fixed response for internal domains on external traffic
    #[arg(long)]
    deny_internal_domains: bool,

    /// Status code of the deny-internal-domains response
    #[arg(long, default_value_t = 401)]
    deny_internal_domains_status: u16,

    /// Content type of the deny-internal-domains response
    #[arg(long, default_value = "text/plain")]
    deny_internal_domains_content_type: String,

    /// Body of the deny-internal-domains response
    #[arg(long, default_value = "Unauthorized")]
    deny_internal_domains_body: String,

    /// Domain suffixes treated as internal; repeatable
    #[arg(long = "internal-domain", value_delimiter = ',', default_value = ".cluster.local")]
    internal_domains: Vec<String>,

    /// Enable cross-zone load balancing on network load balancers
    #[arg(long)]
    nlb_cross_zone: bool,

    /// HTTP/2 setting applied when no annotation overrides it
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    http2: bool,

    /// S3 bucket receiving ALB access logs
    #[arg(long, default_value = "")]
    alb_logs_s3_bucket: String,

    /// Prefix within the access log bucket
    #[arg(long, default_value = "")]
    alb_logs_s3_prefix: String,

    /// ConfigMap holding CloudWatch alarm definitions, as namespace/name
    #[arg(long)]
    cloudwatch_alarm_config_map: Option<String>,

    /// Additional stack tags, as key=value; repeatable
    #[arg(long = "stack-tag", value_delimiter = ',')]
    stack_tags: Vec<String>,

    /// Seconds between reconcile ticks
    #[arg(long, default_value_t = 30)]
    polling_interval_seconds: u64,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<ControllerConfig> {
        let target_type = match self.target_type.as_str() {
            "instance" => TargetType::Instance,
            "ip" => TargetType::Ip,
            other => anyhow::bail!("unsupported target type {other:?}, expected instance or ip"),
        };
        let default_lb_type = match self.default_load_balancer_type.as_str() {
            "application" | "alb" => LoadBalancerType::Application,
            "network" | "nlb" => LoadBalancerType::Network,
            other => anyhow::bail!(
                "unsupported load balancer type {other:?}, expected application or network"
            ),
        };
        let cloudwatch_alarm_config_map = self
            .cloudwatch_alarm_config_map
            .map(|location| {
                location
                    .split_once('/')
                    .map(|(ns, name)| (ns.to_string(), name.to_string()))
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "alarm ConfigMap location {location:?} is not of the form namespace/name"
                        )
                    })
            })
            .transpose()?;
        let mut additional_stack_tags = BTreeMap::new();
        for tag in &self.stack_tags {
            let Some((key, value)) = tag.split_once('=') else {
                anyhow::bail!("stack tag {tag:?} is not of the form key=value");
            };
            additional_stack_tags.insert(key.to_string(), value.to_string());
        }

        Ok(ControllerConfig {
            controller_id: self.controller_id,
            cluster_id: self.cluster_id,
            ingress_api_version: self.ingress_api_version,
            ingress_class_filters: self.ingress_class_filters.into_iter().collect(),
            ingress_default_security_group: self.default_security_group,
            ingress_default_ssl_policy: self.default_ssl_policy,
            ingress_default_load_balancer_type: default_lb_type,
            cluster_local_domain: self.cluster_local_domain,
            cert_ttl: chrono::Duration::seconds(self.cert_ttl_seconds),
            stack_termination_protection: self.stack_termination_protection,
            stack_timeout_minutes: self.stack_timeout_minutes,
            idle_connection_timeout_seconds: self.idle_connection_timeout_seconds,
            deregistration_delay_timeout_seconds: self.deregistration_delay_timeout_seconds,
            target_type,
            target_port: self.target_port,
            health_check: HealthCheck {
                path: self.health_check_path,
                port: self.health_check_port,
                interval_seconds: self.health_check_interval_seconds,
                timeout_seconds: self.health_check_timeout_seconds,
            },
            alb_healthy_threshold_count: self.alb_healthy_threshold_count,
            alb_unhealthy_threshold_count: self.alb_unhealthy_threshold_count,
            nlb_healthy_threshold_count: self.nlb_healthy_threshold_count,
            http_disabled: self.http_disabled,
            http_redirect_to_https: self.http_redirect_to_https,
            http_target_port: self.http_target_port,
            deny_internal_domains: DenyInternalDomains {
                enabled: self.deny_internal_domains,
                status: self.deny_internal_domains_status,
                content_type: self.deny_internal_domains_content_type,
                body: self.deny_internal_domains_body,
                suffixes: self.internal_domains,
            },
            nlb_cross_zone: self.nlb_cross_zone,
            http2_default: self.http2,
            alb_logs_s3_bucket: self.alb_logs_s3_bucket,
            alb_logs_s3_prefix: self.alb_logs_s3_prefix,
            cloudwatch_alarm_config_map,
            additional_stack_tags,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let polling_interval = Duration::from_secs(cli.polling_interval_seconds);
    let config = cli.into_config()?;
    config.validate()?;

    info!(
        controller_id = %config.controller_id,
        cluster_id = %config.cluster_id,
        "Starting skylift controller"
    );

    let aws_config = aws_config::load_from_env().await;
    let cf = SdkCloudFormation::new(aws_sdk_cloudformation::Client::new(&aws_config));
    let elb = SdkElb::new(aws_sdk_elasticloadbalancingv2::Client::new(&aws_config));
    let ec2 = SdkEc2::new(aws_sdk_ec2::Client::new(&aws_config));
    let certs = AcmCertificateSource::new(aws_sdk_acm::Client::new(&aws_config));

    let kube_client = kube::Client::try_default().await?;
    let mut adapter = Adapter::new(kube_client, config.clone())?;
    let reconciler = Reconciler::new(config);

    let mut interval = tokio::time::interval(polling_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match reconciler.tick(&mut adapter, &cf, &elb, &ec2, &certs).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => error!(error = %e, "Reconcile tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
