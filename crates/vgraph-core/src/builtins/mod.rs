//! Built-in leaf functions and the schema variants that bind them.

pub mod ec2;
pub mod ingress;

use std::sync::Arc;

use crate::domain::SchemaVariant;
use crate::func::FuncRegistry;

pub use ec2::{
    aws_ec2_instance_variant, aws_region_variant, GenerateAwsEc2Json, QualificationAwsEc2DryRun,
    CODE_PATH, DRY_RUN_QUALIFICATION_PATH, EC2_INSTANCE_VARIANT, GENERATE_EC2_JSON,
    QUALIFY_EC2_DRY_RUN, REGION_FRAME_VARIANT,
};
pub use ingress::{
    aws_ingress_variant, AwsIngressRefresh, AwsIngressRevokeFix, INGRESS_VARIANT,
    REFRESH_INGRESS, REVOKE_INGRESS_FIX,
};

/// Every built-in function.
pub fn builtin_registry() -> FuncRegistry {
    FuncRegistry::new()
        .with_func(Arc::new(GenerateAwsEc2Json))
        .with_func(Arc::new(QualificationAwsEc2DryRun))
        .with_func(Arc::new(AwsIngressRevokeFix))
        .with_func(Arc::new(AwsIngressRefresh))
}

/// Every built-in schema variant.
pub fn builtin_variants() -> Vec<SchemaVariant> {
    vec![
        aws_ec2_instance_variant(),
        aws_region_variant(),
        aws_ingress_variant(),
    ]
}
