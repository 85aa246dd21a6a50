//! Skylift - Kubernetes ingress to AWS load balancer operator
//!
//! Skylift watches ingress-class resources (Ingress and RouteGroup) in a
//! Kubernetes cluster and reconciles them against AWS Elastic Load Balancers
//! provisioned through CloudFormation stacks. Each reconcile tick observes the
//! desired ingress endpoints, the existing managed stacks, the node pool and
//! the certificate inventory, then issues the CloudFormation and ELBv2 calls
//! required to converge.
//!
//! # Architecture
//!
//! The controller runs a single serial reconcile loop:
//! - The Kubernetes adapter normalizes Ingress and RouteGroup resources into
//!   one uniform record with annotation-derived policy fields
//! - The certificate matcher elects one certificate set per ingress
//! - Compatible ingresses are grouped into buckets that share a load balancer
//! - The reconciler diffs buckets against managed stacks and creates, updates
//!   or garbage-collects stacks; certificate TTLs persisted as stack tags
//!   drive garbage collection
//! - The target registrar keeps every target group membership in sync with
//!   the node pool (and pod IPs for NLB extra listeners)
//! - Load balancer hostnames are written back to the owning resources
//!
//! # Modules
//!
//! - [`config`] - Controller configuration and validation
//! - [`ingress`] - Normalized ingress records and annotation parsing
//! - [`kubernetes`] - Kubernetes adapter (listing, status write-back)
//! - [`aws`] - CloudFormation stacks, template synthesis, target groups
//! - [`certs`] - Certificate inventory and per-ingress election
//! - [`reconcile`] - Bucketing and the per-tick reconciliation algorithm
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod aws;
pub mod certs;
pub mod config;
pub mod error;
pub mod ingress;
pub mod kubernetes;
pub mod reconcile;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default controller identifier written to the `kubernetes:application` tag
pub const DEFAULT_CONTROLLER_ID: &str = "kube-ingress-aws-controller";

/// Domain suffix marking hostnames as cluster-local
pub const DEFAULT_CLUSTER_LOCAL_DOMAIN: &str = ".cluster.local";

/// Default SSL policy attached to HTTPS/TLS listeners
pub const DEFAULT_SSL_POLICY: &str = "ELBSecurityPolicy-2016-08";

/// Default lifetime of a certificate election, persisted as a stack tag
pub const DEFAULT_CERT_TTL_SECONDS: i64 = 30 * 24 * 3600;

/// Default CloudFormation stack creation timeout
pub const DEFAULT_STACK_TIMEOUT_MINUTES: u32 = 15;

/// Default idle connection timeout for application load balancers
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u32 = 60;

/// Default target group deregistration delay
pub const DEFAULT_DEREGISTRATION_DELAY_SECONDS: u32 = 300;
