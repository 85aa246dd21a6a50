//! CloudFormation template synthesis
//!
//! Builds the JSON template document for one load balancer stack from a
//! [`StackSpec`]. Synthesis is deterministic: all maps are serde_json maps
//! (BTree-backed, alphabetically ordered), so identical specs serialize to
//! byte-identical documents. Resource logical names, parameter names and
//! output names are a stable external interface consumed by DNS and
//! monitoring controllers.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::aws::stack::{
    sha256_hex, StackSpec, OUTPUT_DNS_NAME, OUTPUT_HTTP_TARGET_GROUP_ARN,
    OUTPUT_LOAD_BALANCER_ARN, OUTPUT_TARGET_GROUP_ARN, PARAM_HEALTH_CHECK_INTERVAL,
    PARAM_HEALTH_CHECK_PATH, PARAM_HEALTH_CHECK_PORT, PARAM_HEALTH_CHECK_TIMEOUT, PARAM_HTTP2,
    PARAM_HTTP_TARGET_PORT, PARAM_IP_ADDRESS_TYPE, PARAM_LOAD_BALANCER_TYPE, PARAM_SCHEME,
    PARAM_SECURITY_GROUP, PARAM_SSL_POLICY, PARAM_SUBNETS, PARAM_TARGET_PORT, PARAM_VPC_ID,
    PARAM_WAF_WEB_ACL_ID,
};
use crate::aws::{LoadBalancerType, POD_LABEL_TAG, POD_NAMESPACE_TAG};
use crate::error::Error;

const LOAD_BALANCER: &str = "LB";
const TARGET_GROUP: &str = "TG";
const HTTP_TARGET_GROUP: &str = "HTTPTargetGroup";
const HTTP_LISTENER: &str = "HTTPListener";
const HTTPS_LISTENER: &str = "HTTPSListener";

#[derive(Serialize)]
struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,
    #[serde(rename = "Description")]
    description: &'static str,
    #[serde(rename = "Parameters")]
    parameters: BTreeMap<String, Value>,
    #[serde(rename = "Resources")]
    resources: BTreeMap<String, Value>,
    #[serde(rename = "Outputs")]
    outputs: BTreeMap<String, Value>,
}

/// Synthesize the CloudFormation JSON document for a stack specification
pub fn generate_template(spec: &StackSpec) -> Result<String, Error> {
    let template = Template {
        format_version: "2010-09-09",
        description: "Load Balancer for Kubernetes Ingress",
        parameters: parameters(spec),
        resources: resources(spec),
        outputs: outputs(spec),
    };
    serde_json::to_string(&template)
        .map_err(|e| Error::transient("GenerateTemplate", format!("serialize template: {e}")))
}

fn parameters(spec: &StackSpec) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    let mut p = |name: &str, type_: &str| {
        params.insert(name.to_string(), json!({ "Type": type_ }));
    };

    p(PARAM_SCHEME, "String");
    p(PARAM_SECURITY_GROUP, "CommaDelimitedList");
    p(PARAM_SUBNETS, "List<AWS::EC2::Subnet::Id>");
    p(PARAM_VPC_ID, "AWS::EC2::VPC::Id");
    p(PARAM_TARGET_PORT, "Number");
    p(PARAM_SSL_POLICY, "String");
    p(PARAM_IP_ADDRESS_TYPE, "String");
    p(PARAM_LOAD_BALANCER_TYPE, "String");
    p(PARAM_HTTP2, "String");

    if !spec.waf_web_acl_id.is_empty() {
        p(PARAM_WAF_WEB_ACL_ID, "String");
    }
    if spec.has_distinct_http_target_port() {
        p(PARAM_HTTP_TARGET_PORT, "Number");
    }
    if spec.health_check.is_some() {
        p(PARAM_HEALTH_CHECK_PATH, "String");
        p(PARAM_HEALTH_CHECK_PORT, "Number");
        p(PARAM_HEALTH_CHECK_INTERVAL, "Number");
        p(PARAM_HEALTH_CHECK_TIMEOUT, "Number");
    }

    params
}

fn resources(spec: &StackSpec) -> BTreeMap<String, Value> {
    let mut resources = BTreeMap::new();
    let nlb = spec.load_balancer_type == LoadBalancerType::Network;

    resources.insert(LOAD_BALANCER.to_string(), load_balancer(spec, nlb));
    resources.insert(TARGET_GROUP.to_string(), primary_target_group(spec, nlb));

    let certificates: Vec<&String> = spec.certificate_arns.keys().collect();
    if let Some((primary, rest)) = certificates.split_first() {
        resources.insert(HTTPS_LISTENER.to_string(), https_listener(primary, nlb));
        for arn in rest {
            resources.insert(
                format!("HTTPSListenerCertificate{}", sha256_hex(arn.as_bytes())),
                json!({
                    "Type": "AWS::ElasticLoadBalancingV2::ListenerCertificate",
                    "Properties": {
                        "Certificates": [{ "CertificateArn": arn }],
                        "ListenerArn": { "Ref": HTTPS_LISTENER },
                    },
                }),
            );
        }
    }

    if !nlb && !spec.http_disabled {
        resources.insert(HTTP_LISTENER.to_string(), http_listener(spec));
        if spec.has_distinct_http_target_port() && !spec.http_redirect_to_https {
            resources.insert(
                HTTP_TARGET_GROUP.to_string(),
                http_target_group(spec),
            );
        }
    }

    if !nlb && !spec.waf_web_acl_id.is_empty() {
        resources.insert(
            "WAFAssociation".to_string(),
            json!({
                "Type": "AWS::WAFRegional::WebACLAssociation",
                "Properties": {
                    "ResourceArn": { "Ref": LOAD_BALANCER },
                    "WebACLId": { "Ref": PARAM_WAF_WEB_ACL_ID },
                },
            }),
        );
    }

    if !nlb && spec.deny_internal_domains.enabled {
        for (rule, listener) in [
            ("HTTPListenerRuleDenyInternalDomains", HTTP_LISTENER),
            ("HTTPSListenerRuleDenyInternalDomains", HTTPS_LISTENER),
        ] {
            if resources.contains_key(listener) {
                resources.insert(rule.to_string(), deny_internal_domains_rule(spec, listener));
            }
        }
    }

    if !nlb {
        for (n, alarm) in spec.cloudwatch_alarms.iter().enumerate() {
            resources.insert(format!("CloudWatchAlarm{n}"), cloudwatch_alarm(alarm));
        }
    }

    if nlb {
        for (n, listener) in spec.extra_listeners.iter().enumerate() {
            let tg_name = format!("ExtraTG{n}");
            resources.insert(
                format!("ExtraListener{n}"),
                json!({
                    "Type": "AWS::ElasticLoadBalancingV2::Listener",
                    "Properties": {
                        "DefaultActions": [
                            { "TargetGroupArn": { "Ref": tg_name }, "Type": "forward" }
                        ],
                        "LoadBalancerArn": { "Ref": LOAD_BALANCER },
                        "Port": listener.listen_port,
                        "Protocol": listener.protocol.as_str(),
                    },
                }),
            );
            resources.insert(tg_name, extra_target_group(spec, listener));
        }
    }

    resources
}

fn load_balancer(spec: &StackSpec, nlb: bool) -> Value {
    let mut attributes = Vec::new();
    if nlb {
        attributes.push(json!({
            "Key": "load_balancing.cross_zone.enabled",
            "Value": spec.nlb_cross_zone.to_string(),
        }));
    } else {
        attributes.push(json!({
            "Key": "idle_timeout.timeout_seconds",
            "Value": spec.idle_connection_timeout_seconds.to_string(),
        }));
        attributes.push(json!({
            "Key": "routing.http2.enabled",
            "Value": spec.http2.to_string(),
        }));
        if !spec.alb_logs_s3_bucket.is_empty() {
            attributes.push(json!({
                "Key": "access_logs.s3.enabled",
                "Value": "true",
            }));
            attributes.push(json!({
                "Key": "access_logs.s3.bucket",
                "Value": spec.alb_logs_s3_bucket,
            }));
            attributes.push(json!({
                "Key": "access_logs.s3.prefix",
                "Value": spec.alb_logs_s3_prefix,
            }));
        }
    }

    let mut properties = json!({
        "IpAddressType": { "Ref": PARAM_IP_ADDRESS_TYPE },
        "LoadBalancerAttributes": attributes,
        "Scheme": { "Ref": PARAM_SCHEME },
        "Subnets": { "Ref": PARAM_SUBNETS },
        "Tags": [
            { "Key": "StackName", "Value": { "Ref": "AWS::StackName" } }
        ],
        "Type": { "Ref": PARAM_LOAD_BALANCER_TYPE },
    });
    if !nlb {
        properties["SecurityGroups"] = json!({ "Ref": PARAM_SECURITY_GROUP });
    }

    json!({
        "Type": "AWS::ElasticLoadBalancingV2::LoadBalancer",
        "Properties": properties,
    })
}

fn primary_target_group(spec: &StackSpec, nlb: bool) -> Value {
    let mut properties = json!({
        "Port": { "Ref": PARAM_TARGET_PORT },
        "Protocol": if nlb { "TCP" } else { "HTTP" },
        "TargetGroupAttributes": [
            {
                "Key": "deregistration_delay.timeout_seconds",
                "Value": spec.deregistration_delay_seconds.to_string(),
            }
        ],
        "TargetType": spec.target_type.as_str(),
        "VpcId": { "Ref": PARAM_VPC_ID },
    });

    if nlb {
        properties["HealthyThresholdCount"] = json!(spec.nlb_healthy_threshold_count);
        properties["UnhealthyThresholdCount"] = json!(spec.nlb_healthy_threshold_count);
    } else {
        properties["HealthyThresholdCount"] = json!(spec.alb_healthy_threshold_count);
        properties["UnhealthyThresholdCount"] = json!(spec.alb_unhealthy_threshold_count);
    }

    if spec.health_check.is_some() {
        properties["HealthCheckIntervalSeconds"] = json!({ "Ref": PARAM_HEALTH_CHECK_INTERVAL });
        properties["HealthCheckPath"] = json!({ "Ref": PARAM_HEALTH_CHECK_PATH });
        properties["HealthCheckPort"] = json!({ "Ref": PARAM_HEALTH_CHECK_PORT });
        if nlb {
            properties["HealthCheckProtocol"] = json!("HTTP");
        } else {
            properties["HealthCheckTimeoutSeconds"] =
                json!({ "Ref": PARAM_HEALTH_CHECK_TIMEOUT });
        }
    }

    json!({
        "Type": "AWS::ElasticLoadBalancingV2::TargetGroup",
        "Properties": properties,
    })
}

fn https_listener(primary_certificate: &str, nlb: bool) -> Value {
    json!({
        "Type": "AWS::ElasticLoadBalancingV2::Listener",
        "Properties": {
            "Certificates": [{ "CertificateArn": primary_certificate }],
            "DefaultActions": [
                { "TargetGroupArn": { "Ref": TARGET_GROUP }, "Type": "forward" }
            ],
            "LoadBalancerArn": { "Ref": LOAD_BALANCER },
            "Port": 443,
            "Protocol": if nlb { "TLS" } else { "HTTPS" },
            "SslPolicy": { "Ref": PARAM_SSL_POLICY },
        },
    })
}

fn http_listener(spec: &StackSpec) -> Value {
    let default_actions = if spec.http_redirect_to_https {
        json!([
            {
                "RedirectConfig": {
                    "Host": "#{host}",
                    "Path": "/#{path}",
                    "Port": "443",
                    "Protocol": "HTTPS",
                    "Query": "#{query}",
                    "StatusCode": "HTTP_301",
                },
                "Type": "redirect",
            }
        ])
    } else if spec.has_distinct_http_target_port() {
        json!([{ "TargetGroupArn": { "Ref": HTTP_TARGET_GROUP }, "Type": "forward" }])
    } else {
        json!([{ "TargetGroupArn": { "Ref": TARGET_GROUP }, "Type": "forward" }])
    };

    json!({
        "Type": "AWS::ElasticLoadBalancingV2::Listener",
        "Properties": {
            "DefaultActions": default_actions,
            "LoadBalancerArn": { "Ref": LOAD_BALANCER },
            "Port": 80,
            "Protocol": "HTTP",
        },
    })
}

fn http_target_group(spec: &StackSpec) -> Value {
    let mut properties = json!({
        "HealthyThresholdCount": spec.alb_healthy_threshold_count,
        "Port": { "Ref": PARAM_HTTP_TARGET_PORT },
        "Protocol": "HTTP",
        "TargetGroupAttributes": [
            {
                "Key": "deregistration_delay.timeout_seconds",
                "Value": spec.deregistration_delay_seconds.to_string(),
            }
        ],
        "TargetType": spec.target_type.as_str(),
        "UnhealthyThresholdCount": spec.alb_unhealthy_threshold_count,
        "VpcId": { "Ref": PARAM_VPC_ID },
    });

    if spec.health_check.is_some() {
        properties["HealthCheckIntervalSeconds"] = json!({ "Ref": PARAM_HEALTH_CHECK_INTERVAL });
        properties["HealthCheckPath"] = json!({ "Ref": PARAM_HEALTH_CHECK_PATH });
        properties["HealthCheckPort"] = json!({ "Ref": PARAM_HEALTH_CHECK_PORT });
        properties["HealthCheckTimeoutSeconds"] = json!({ "Ref": PARAM_HEALTH_CHECK_TIMEOUT });
    }

    json!({
        "Type": "AWS::ElasticLoadBalancingV2::TargetGroup",
        "Properties": properties,
    })
}

fn deny_internal_domains_rule(spec: &StackSpec, listener: &str) -> Value {
    let deny = &spec.deny_internal_domains;
    let values: Vec<String> = deny
        .suffixes
        .iter()
        .map(|s| {
            if s.starts_with('.') {
                format!("*{s}")
            } else {
                s.clone()
            }
        })
        .collect();

    json!({
        "Type": "AWS::ElasticLoadBalancingV2::ListenerRule",
        "Properties": {
            "Actions": [
                {
                    "FixedResponseConfig": {
                        "ContentType": deny.content_type,
                        "MessageBody": deny.body,
                        "StatusCode": deny.status.to_string(),
                    },
                    "Type": "fixed-response",
                }
            ],
            "Conditions": [
                {
                    "Field": "host-header",
                    "HostHeaderConfig": { "Values": values },
                }
            ],
            "ListenerArn": { "Ref": listener },
            "Priority": 1,
        },
    })
}

fn cloudwatch_alarm(alarm: &crate::aws::stack::CloudWatchAlarm) -> Value {
    let mut properties = json!({
        "Dimensions": [
            {
                "Name": "LoadBalancer",
                "Value": { "Fn::GetAtt": [LOAD_BALANCER, "LoadBalancerFullName"] },
            }
        ],
        "MetricName": alarm.metric_name,
        "Namespace": alarm.namespace,
    });
    if let Some(v) = &alarm.statistic {
        properties["Statistic"] = json!(v);
    }
    if let Some(v) = alarm.period {
        properties["Period"] = json!(v);
    }
    if let Some(v) = alarm.evaluation_periods {
        properties["EvaluationPeriods"] = json!(v);
    }
    if let Some(v) = alarm.threshold {
        properties["Threshold"] = json!(v);
    }
    if let Some(v) = &alarm.comparison_operator {
        properties["ComparisonOperator"] = json!(v);
    }

    json!({
        "Type": "AWS::CloudWatch::Alarm",
        "Properties": properties,
    })
}

fn extra_target_group(spec: &StackSpec, listener: &crate::aws::ExtraListener) -> Value {
    json!({
        "Type": "AWS::ElasticLoadBalancingV2::TargetGroup",
        "Properties": {
            // extra listeners fix their target port per listener, so the
            // health check port is a literal rather than a parameter Ref
            "HealthCheckPort": listener.target_port.to_string(),
            "HealthCheckProtocol": "TCP",
            "HealthyThresholdCount": 0,
            "Port": listener.target_port,
            "Protocol": listener.protocol.as_str(),
            "Tags": [
                { "Key": POD_LABEL_TAG, "Value": listener.pod_label },
                { "Key": POD_NAMESPACE_TAG, "Value": listener.namespace },
            ],
            "TargetGroupAttributes": [
                { "Key": "deregistration_delay.timeout_seconds", "Value": "0" }
            ],
            "TargetType": "ip",
            "UnhealthyThresholdCount": 0,
            "VpcId": { "Ref": PARAM_VPC_ID },
        },
    })
}

fn outputs(spec: &StackSpec) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    outputs.insert(
        OUTPUT_DNS_NAME.to_string(),
        json!({
            "Description": "DNS name of the load balancer",
            "Value": { "Fn::GetAtt": [LOAD_BALANCER, "DNSName"] },
        }),
    );
    outputs.insert(
        OUTPUT_LOAD_BALANCER_ARN.to_string(),
        json!({
            "Description": "ARN of the load balancer",
            "Value": { "Ref": LOAD_BALANCER },
        }),
    );
    outputs.insert(
        OUTPUT_TARGET_GROUP_ARN.to_string(),
        json!({
            "Description": "ARN of the primary target group",
            "Value": { "Ref": TARGET_GROUP },
        }),
    );
    if spec.load_balancer_type != LoadBalancerType::Network
        && !spec.http_disabled
        && spec.has_distinct_http_target_port()
        && !spec.http_redirect_to_https
    {
        outputs.insert(
            OUTPUT_HTTP_TARGET_GROUP_ARN.to_string(),
            json!({
                "Description": "ARN of the HTTP target group",
                "Value": { "Ref": HTTP_TARGET_GROUP },
            }),
        );
    }
    if spec.load_balancer_type == LoadBalancerType::Network {
        for n in 0..spec.extra_listeners.len() {
            outputs.insert(
                format!("ExtraTG{n}TargetGroupARN"),
                json!({
                    "Description": "ARN of an extra listener target group",
                    "Value": { "Ref": format!("ExtraTG{n}") },
                }),
            );
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{ExtraListener, IpAddressType, ListenerProtocol, TargetType};
    use crate::config::{DenyInternalDomains, HealthCheck};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn base_spec() -> StackSpec {
        let mut certificate_arns = BTreeMap::new();
        certificate_arns.insert(
            "arn:aws:acm:eu-central-1:123:certificate/abc".to_string(),
            Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap(),
        );
        StackSpec {
            name: "prod-0123456789".to_string(),
            subnets: vec!["subnet-1".to_string(), "subnet-2".to_string()],
            certificate_arns,
            security_group_id: "sg-1".to_string(),
            cluster_id: "prod".to_string(),
            vpc_id: "vpc-1".to_string(),
            health_check: Some(HealthCheck::default()),
            alb_healthy_threshold_count: 3,
            alb_unhealthy_threshold_count: 4,
            nlb_healthy_threshold_count: 3,
            target_type: TargetType::Instance,
            target_port: 9999,
            timeout_minutes: 15,
            idle_connection_timeout_seconds: 60,
            deregistration_delay_seconds: 300,
            controller_id: "kube-ingress-aws-controller".to_string(),
            ssl_policy: "ELBSecurityPolicy-2016-08".to_string(),
            ip_address_type: IpAddressType::Ipv4,
            load_balancer_type: crate::aws::LoadBalancerType::Application,
            http2: true,
            ..StackSpec::default()
        }
    }

    fn parse(spec: &StackSpec) -> serde_json::Value {
        serde_json::from_str(&generate_template(spec).unwrap()).unwrap()
    }

    #[test]
    fn synthesis_is_byte_deterministic() {
        let spec = base_spec();
        assert_eq!(
            generate_template(&spec).unwrap(),
            generate_template(&spec).unwrap()
        );
    }

    #[test]
    fn base_skeleton_has_stable_names() {
        let doc = parse(&base_spec());
        assert_eq!(doc["AWSTemplateFormatVersion"], "2010-09-09");
        for name in ["LB", "TG", "HTTPSListener", "HTTPListener"] {
            assert!(
                doc["Resources"].get(name).is_some(),
                "missing resource {name}"
            );
        }
        for param in [
            PARAM_SCHEME,
            PARAM_SUBNETS,
            PARAM_VPC_ID,
            PARAM_TARGET_PORT,
            PARAM_SSL_POLICY,
            PARAM_IP_ADDRESS_TYPE,
            PARAM_LOAD_BALANCER_TYPE,
            PARAM_HTTP2,
        ] {
            assert!(
                doc["Parameters"].get(param).is_some(),
                "missing parameter {param}"
            );
        }
        assert!(doc["Outputs"].get(OUTPUT_DNS_NAME).is_some());
        assert!(doc["Outputs"].get(OUTPUT_LOAD_BALANCER_ARN).is_some());
        assert!(doc["Outputs"].get(OUTPUT_TARGET_GROUP_ARN).is_some());
    }

    #[test]
    fn additional_certificates_become_listener_certificate_resources() {
        let mut spec = base_spec();
        spec.certificate_arns.insert(
            "arn:aws:acm:eu-central-1:123:certificate/zzz".to_string(),
            Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap(),
        );
        let doc = parse(&spec);

        // the lexically-first ARN is attached to the listener itself
        let listener_certs = &doc["Resources"]["HTTPSListener"]["Properties"]["Certificates"];
        assert_eq!(
            listener_certs[0]["CertificateArn"],
            "arn:aws:acm:eu-central-1:123:certificate/abc"
        );

        // every further ARN is a ListenerCertificate named by its SHA-256
        let logical = format!(
            "HTTPSListenerCertificate{}",
            sha256_hex("arn:aws:acm:eu-central-1:123:certificate/zzz".as_bytes())
        );
        let resource = &doc["Resources"][&logical];
        assert_eq!(
            resource["Type"],
            "AWS::ElasticLoadBalancingV2::ListenerCertificate"
        );
        assert_eq!(
            resource["Properties"]["Certificates"][0]["CertificateArn"],
            "arn:aws:acm:eu-central-1:123:certificate/zzz"
        );
    }

    #[test]
    fn nlb_with_extra_listener_emits_listener_and_target_group_pair() {
        let mut spec = base_spec();
        spec.load_balancer_type = crate::aws::LoadBalancerType::Network;
        spec.security_group_id = String::new();
        spec.extra_listeners = vec![ExtraListener {
            protocol: ListenerProtocol::Tcp,
            listen_port: 22,
            target_port: 2222,
            pod_label: "application=ssh-service".to_string(),
            namespace: "default".to_string(),
        }];
        let doc = parse(&spec);

        let listener = &doc["Resources"]["ExtraListener0"]["Properties"];
        assert_eq!(listener["Port"], 22);
        assert_eq!(listener["Protocol"], "TCP");
        assert_eq!(listener["DefaultActions"][0]["TargetGroupArn"]["Ref"], "ExtraTG0");

        let tg = &doc["Resources"]["ExtraTG0"]["Properties"];
        assert_eq!(tg["Port"], 2222);
        assert_eq!(tg["Protocol"], "TCP");
        assert_eq!(tg["HealthCheckPort"], "2222");
        assert_eq!(tg["HealthyThresholdCount"], 0);
        assert_eq!(tg["UnhealthyThresholdCount"], 0);
        let tags = tg["Tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| {
            t["Key"] == POD_LABEL_TAG && t["Value"] == "application=ssh-service"
        }));

        assert!(doc["Outputs"].get("ExtraTG0TargetGroupARN").is_some());

        // NLB terminates TLS on 443
        let https = &doc["Resources"]["HTTPSListener"]["Properties"];
        assert_eq!(https["Port"], 443);
        assert_eq!(https["Protocol"], "TLS");

        // no HTTP listener and no security groups on a network load balancer
        assert!(doc["Resources"].get("HTTPListener").is_none());
        assert!(doc["Resources"]["LB"]["Properties"].get("SecurityGroups").is_none());
    }

    #[test]
    fn http_redirect_replaces_forwarding() {
        let mut spec = base_spec();
        spec.http_redirect_to_https = true;
        let doc = parse(&spec);
        let action = &doc["Resources"]["HTTPListener"]["Properties"]["DefaultActions"][0];
        assert_eq!(action["Type"], "redirect");
        assert_eq!(action["RedirectConfig"]["StatusCode"], "HTTP_301");
        assert_eq!(action["RedirectConfig"]["Port"], "443");
        assert!(doc["Resources"].get(HTTP_TARGET_GROUP).is_none());
    }

    #[test]
    fn distinct_http_target_port_gets_its_own_target_group() {
        let mut spec = base_spec();
        spec.http_target_port = 8080;
        let doc = parse(&spec);
        let action = &doc["Resources"]["HTTPListener"]["Properties"]["DefaultActions"][0];
        assert_eq!(action["TargetGroupArn"]["Ref"], HTTP_TARGET_GROUP);
        assert!(doc["Parameters"].get(PARAM_HTTP_TARGET_PORT).is_some());
        assert!(doc["Outputs"].get(OUTPUT_HTTP_TARGET_GROUP_ARN).is_some());
    }

    #[test]
    fn http_disabled_omits_the_http_listener() {
        let mut spec = base_spec();
        spec.http_disabled = true;
        let doc = parse(&spec);
        assert!(doc["Resources"].get(HTTP_LISTENER).is_none());
        assert!(doc["Resources"].get(HTTP_TARGET_GROUP).is_none());
    }

    #[test]
    fn deny_internal_domains_adds_fixed_response_rules() {
        let mut spec = base_spec();
        spec.deny_internal_domains = DenyInternalDomains {
            enabled: true,
            status: 401,
            content_type: "text/plain".to_string(),
            body: "Unauthorized".to_string(),
            suffixes: vec![".cluster.local".to_string()],
        };
        let doc = parse(&spec);
        for rule in [
            "HTTPListenerRuleDenyInternalDomains",
            "HTTPSListenerRuleDenyInternalDomains",
        ] {
            let props = &doc["Resources"][rule]["Properties"];
            assert_eq!(props["Actions"][0]["Type"], "fixed-response");
            assert_eq!(props["Actions"][0]["FixedResponseConfig"]["StatusCode"], "401");
            assert_eq!(
                props["Conditions"][0]["HostHeaderConfig"]["Values"][0],
                "*.cluster.local"
            );
        }
    }

    #[test]
    fn waf_association_is_parameterized_only_when_set() {
        let doc = parse(&base_spec());
        assert!(doc["Parameters"].get(PARAM_WAF_WEB_ACL_ID).is_none());
        assert!(doc["Resources"].get("WAFAssociation").is_none());

        let mut spec = base_spec();
        spec.waf_web_acl_id = "web-acl-1".to_string();
        let doc = parse(&spec);
        assert!(doc["Parameters"].get(PARAM_WAF_WEB_ACL_ID).is_some());
        assert_eq!(
            doc["Resources"]["WAFAssociation"]["Properties"]["WebACLId"]["Ref"],
            PARAM_WAF_WEB_ACL_ID
        );
    }

    #[test]
    fn cloudwatch_alarms_are_emitted_in_order() {
        let mut spec = base_spec();
        spec.cloudwatch_alarms = vec![
            crate::aws::stack::CloudWatchAlarm {
                metric_name: "HTTPCode_ELB_5XX_Count".to_string(),
                namespace: "AWS/ApplicationELB".to_string(),
                statistic: Some("Sum".to_string()),
                period: Some(60),
                evaluation_periods: Some(3),
                threshold: Some(10.0),
                comparison_operator: Some("GreaterThanThreshold".to_string()),
            },
            crate::aws::stack::CloudWatchAlarm {
                metric_name: "TargetResponseTime".to_string(),
                namespace: "AWS/ApplicationELB".to_string(),
                statistic: None,
                period: None,
                evaluation_periods: None,
                threshold: None,
                comparison_operator: None,
            },
        ];
        let doc = parse(&spec);
        assert_eq!(
            doc["Resources"]["CloudWatchAlarm0"]["Properties"]["MetricName"],
            "HTTPCode_ELB_5XX_Count"
        );
        assert_eq!(
            doc["Resources"]["CloudWatchAlarm1"]["Properties"]["MetricName"],
            "TargetResponseTime"
        );
        assert_eq!(
            doc["Resources"]["CloudWatchAlarm0"]["Properties"]["Dimensions"][0]["Value"]
                ["Fn::GetAtt"][1],
            "LoadBalancerFullName"
        );
    }

    #[test]
    fn cluster_local_spec_without_certificates_has_no_tls_listener() {
        let mut spec = base_spec();
        spec.certificate_arns.clear();
        let doc = parse(&spec);
        assert!(doc["Resources"].get(HTTPS_LISTENER).is_none());
        // plain HTTP keeps working inside the cluster
        assert!(doc["Resources"].get(HTTP_LISTENER).is_some());
    }
}
