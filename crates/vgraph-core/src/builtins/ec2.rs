//! AWS EC2 instance: launch JSON generation and a dry-run qualification.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::attribute::DOMAIN_PATH;
use crate::domain::{ComponentType, SchemaVariant};
use crate::func::{
    CodeFormat, CodeGenerationResult, ExecutionFault, Func, FuncContext, FuncKind, FuncResult,
    InputSnapshot, PipelineResult, QualificationResult,
};

pub const GENERATE_EC2_JSON: &str = "si:generateAwsEc2Json";
pub const QUALIFY_EC2_DRY_RUN: &str = "si:qualificationAwsEc2DryRun";

pub const EC2_INSTANCE_VARIANT: &str = "AWS EC2 Instance";
pub const REGION_FRAME_VARIANT: &str = "AWS Region";

pub const CODE_PATH: &str = "/root/code";
pub const DRY_RUN_QUALIFICATION_PATH: &str = "/root/qualification/ec2DryRun";

// The AWS CLI reports a dry run that would have succeeded as an error with
// this code.
const DRY_RUN_PASS_MARKER: &str = "DryRunOperation";

/// An EC2 instance. Takes its region from a configuration frame.
pub fn aws_ec2_instance_variant() -> SchemaVariant {
    SchemaVariant::new(EC2_INSTANCE_VARIANT, ComponentType::Component)
        .with_input_socket("region")
        .with_func(CODE_PATH, GENERATE_EC2_JSON, &[DOMAIN_PATH])
        .with_func(
            DRY_RUN_QUALIFICATION_PATH,
            QUALIFY_EC2_DRY_RUN,
            &[DOMAIN_PATH, CODE_PATH],
        )
}

/// A region frame; children inherit its `region`.
pub fn aws_region_variant() -> SchemaVariant {
    SchemaVariant::new(REGION_FRAME_VARIANT, ComponentType::ConfigurationFrame)
        .with_output_socket("region", "region")
}

// -- code generation ----------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    security_group_ids: Vec<String>,
    min_count: u32,
    max_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tag_specifications: Vec<TagSpecification>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TagSpecification {
    resource_type: &'static str,
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

/// `aws ec2 run-instances --cli-input-json` payload from the domain tree.
///
/// Field order is fixed by the struct and tags are sorted by key, so the
/// same domain always renders the same bytes.
pub struct GenerateAwsEc2Json;

#[async_trait]
impl Func for GenerateAwsEc2Json {
    fn name(&self) -> &str {
        GENERATE_EC2_JSON
    }

    fn kind(&self) -> FuncKind {
        FuncKind::CodeGeneration
    }

    async fn run(&self, _ctx: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let domain = input.domain()?;
        let string = |key: &str| domain.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let security_group_ids = match domain.get("SecurityGroupIds") {
            Some(serde_json::Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let mut tags: BTreeMap<String, String> = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = domain.get("tags") {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                tags.insert(key.clone(), value);
            }
        }
        tags.entry("Name".to_string())
            .or_insert_with(|| input.component_name.clone());

        let payload = RunInstancesInput {
            image_id: string("ImageId"),
            instance_type: string("InstanceType"),
            key_name: string("KeyName"),
            security_group_ids,
            min_count: 1,
            max_count: 1,
            tag_specifications: vec![TagSpecification {
                resource_type: "instance",
                tags: tags
                    .into_iter()
                    .map(|(key, value)| Tag { key, value })
                    .collect(),
            }],
        };

        let code = serde_json::to_string_pretty(&payload).map_err(|err| {
            ExecutionFault::MalformedInput {
                reason: err.to_string(),
            }
        })?;
        Ok(FuncResult::CodeGeneration(CodeGenerationResult {
            code,
            format: CodeFormat::Json,
        }))
    }
}

// -- qualification ------------------------------------------------------------

/// Asks AWS whether the generated launch request would succeed.
pub struct QualificationAwsEc2DryRun;

impl QualificationAwsEc2DryRun {
    fn fail(message: impl Into<String>) -> FuncResult {
        FuncResult::Qualification(QualificationResult {
            qualified: false,
            message: Some(message.into()),
        })
    }
}

#[async_trait]
impl Func for QualificationAwsEc2DryRun {
    fn name(&self) -> &str {
        QUALIFY_EC2_DRY_RUN
    }

    fn kind(&self) -> FuncKind {
        FuncKind::Qualification
    }

    async fn run(&self, ctx: &FuncContext, input: &InputSnapshot) -> PipelineResult<FuncResult> {
        let code = input
            .input(CODE_PATH)
            .and_then(|v| v.get("code"))
            .and_then(|v| v.as_str())
            .filter(|c| !c.is_empty());
        let Some(code) = code else {
            return Ok(Self::fail("no generated code to check"));
        };
        let Ok(region) = input.domain_str("region") else {
            return Ok(Self::fail("region is not set"));
        };

        let args: Vec<String> = [
            "ec2",
            "run-instances",
            "--region",
            region,
            "--cli-input-json",
            code,
            "--dry-run",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let output = ctx.run("aws", &args, None).await?;

        let qualified = output.is_success() || output.stderr.contains(DRY_RUN_PASS_MARKER);
        let message = if qualified {
            None
        } else {
            let diagnostic = output.stderr.trim();
            Some(if diagnostic.is_empty() {
                format!("dry run exited with {}", output.exit_code)
            } else {
                diagnostic.to_string()
            })
        };
        Ok(FuncResult::Qualification(QualificationResult {
            qualified,
            message,
        }))
    }
}
