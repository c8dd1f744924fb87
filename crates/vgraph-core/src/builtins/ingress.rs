//! AWS security-group ingress rule: revoke fix and resource refresh.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::{ComponentType, SchemaVariant};
use crate::func::{
    Func, FuncContext, FuncKind, FuncResult, InputSnapshot, PipelineResult, ResourceResult,
};

pub const REVOKE_INGRESS_FIX: &str = "si:awsIngressRevokeFix";
pub const REFRESH_INGRESS: &str = "si:awsIngressRefresh";

pub const INGRESS_VARIANT: &str = "AWS Ingress";

pub fn aws_ingress_variant() -> SchemaVariant {
    SchemaVariant::new(INGRESS_VARIANT, ComponentType::Component).with_input_socket("region")
}

/// The rule the component describes, in `--ip-permissions` shape.
fn ip_permission(input: &InputSnapshot) -> PipelineResult<Value> {
    let domain = input.domain()?;
    let port = |key: &str| domain.get(key).and_then(Value::as_i64);
    Ok(json!({
        "IpProtocol": input.domain_str("IpProtocol")?,
        "FromPort": port("FromPort"),
        "ToPort": port("ToPort"),
        "IpRanges": [{"CidrIp": input.domain_str("CidrIp")?}],
    }))
}

fn same_rule(candidate: &Value, wanted: &Value) -> bool {
    let cidr = &wanted["IpRanges"][0]["CidrIp"];
    candidate["IpProtocol"] == wanted["IpProtocol"]
        && candidate["FromPort"] == wanted["FromPort"]
        && candidate["ToPort"] == wanted["ToPort"]
        && candidate["IpRanges"]
            .as_array()
            .is_some_and(|ranges| ranges.iter().any(|r| &r["CidrIp"] == cidr))
}

fn failure_message(stderr: &str, exit_code: i32) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("aws exited with {exit_code}")
    } else {
        stderr.to_string()
    }
}

/// Revokes the ingress rule. On success the resource no longer exists.
pub struct AwsIngressRevokeFix;

#[async_trait]
impl Func for AwsIngressRevokeFix {
    fn name(&self) -> &str {
        REVOKE_INGRESS_FIX
    }

    fn kind(&self) -> FuncKind {
        FuncKind::Fix
    }

    async fn run(&self, ctx: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let permission = ip_permission(input)?;
        let args = vec![
            "ec2".to_string(),
            "revoke-security-group-ingress".to_string(),
            "--region".to_string(),
            input.domain_str("region")?.to_string(),
            "--group-id".to_string(),
            input.domain_str("GroupId")?.to_string(),
            "--ip-permissions".to_string(),
            json!([permission]).to_string(),
        ];
        let output = ctx.run("aws", &args, None).await?;

        let result = if output.is_success() {
            ResourceResult::ok(Value::Null)
        } else {
            ResourceResult::error(
                input.resource.clone(),
                failure_message(&output.stderr, output.exit_code),
            )
        };
        Ok(FuncResult::Fix(result))
    }
}

/// Reads the live rule back from the security group.
pub struct AwsIngressRefresh;

#[async_trait]
impl Func for AwsIngressRefresh {
    fn name(&self) -> &str {
        REFRESH_INGRESS
    }

    fn kind(&self) -> FuncKind {
        FuncKind::Refresh
    }

    async fn run(&self, ctx: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let wanted = ip_permission(input)?;
        let args = vec![
            "ec2".to_string(),
            "describe-security-groups".to_string(),
            "--region".to_string(),
            input.domain_str("region")?.to_string(),
            "--group-ids".to_string(),
            input.domain_str("GroupId")?.to_string(),
        ];
        let output = ctx.run("aws", &args, None).await?;
        if !output.is_success() {
            return Ok(FuncResult::Refresh(ResourceResult::error(
                input.resource.clone(),
                failure_message(&output.stderr, output.exit_code),
            )));
        }

        let described: Value = match serde_json::from_str(&output.stdout) {
            Ok(v) => v,
            Err(err) => {
                return Ok(FuncResult::Refresh(ResourceResult::error(
                    input.resource.clone(),
                    format!("unreadable describe-security-groups output: {err}"),
                )))
            }
        };
        let live = described["SecurityGroups"][0]["IpPermissions"]
            .as_array()
            .and_then(|perms| perms.iter().find(|p| same_rule(p, &wanted)))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(FuncResult::Refresh(ResourceResult::ok(live)))
    }
}
