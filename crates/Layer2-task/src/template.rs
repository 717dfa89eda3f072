//! Infrastructure template rendering
//!
//! Renders the CloudFormation template for a set of containers: state bucket,
//! cluster, log group, roles, task definition, networking and security group.
//! Rendering is deterministic: identical inputs give a byte-identical body.

use crate::api::StackParameter;
use crate::container::{common_platform, ContainerSpec};
use crate::outputs::{
    OUTPUT_BUCKET_NAME, OUTPUT_CLUSTER_NAME, OUTPUT_LOG_GROUP_ARN, OUTPUT_SECURITY_GROUP_ID,
    OUTPUT_SUBNET_ID, OUTPUT_TASK_DEF_ARN, OUTPUT_TEMPLATE_VERSION,
};
use crate::sizing::task_size;
use crun_foundation::{Error, Result, DEFAULT_CONTAINER_NAME, PROJECT_NAME};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Bump whenever the rendered template changes shape
pub const TEMPLATE_REVISION: u32 = 1;

pub const PARAM_EXISTING_VPC_ID: &str = "ExistingVpcId";
pub const PARAM_RETAIN_BUCKET: &str = "RetainBucket";

const CREATED_BY_TAG_KEY: &str = "CreatedBy";

const BUCKET: &str = "Bucket";
const CLUSTER: &str = "Cluster";
const CAPACITY_PROVIDER: &str = "CapacityProvider";
const LOG_GROUP: &str = "LogGroup";
const EXECUTION_ROLE: &str = "ExecutionRole";
const TASK_ROLE: &str = "TaskRole";
const TASK_DEFINITION: &str = "TaskDefinition";
const VPC: &str = "VPC";
const INTERNET_GATEWAY: &str = "InternetGateway";
const INTERNET_GATEWAY_ATTACHMENT: &str = "InternetGatewayAttachment";
const ROUTE_TABLE: &str = "RouteTable";
const ROUTE: &str = "Route";
const SUBNET: &str = "Subnet";
const SUBNET_ROUTE_TABLE_ASSOCIATION: &str = "SubnetRouteTableAssociation";
const S3_GATEWAY_ENDPOINT: &str = "S3GatewayEndpoint";
const SECURITY_GROUP: &str = "SecurityGroup";

/// Knobs that change the rendered template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateOptions {
    /// FARGATE_SPOT instead of FARGATE
    pub spot: bool,
    /// Existing VPC; when unset the template creates one
    pub vpc_id: Option<String>,
    /// Keep the bucket on stack deletion (it is still removed on failed creation)
    pub retain_bucket: bool,
    /// `awslogs-stream-prefix`
    pub stream_prefix: String,
    /// Name given to containers without one
    pub default_container_name: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            spot: false,
            vpc_id: None,
            retain_bucket: true,
            stream_prefix: PROJECT_NAME.to_string(),
            default_container_name: DEFAULT_CONTAINER_NAME.to_string(),
        }
    }
}

impl TemplateOptions {
    /// Parameter values sent with create/update
    pub fn parameters(&self) -> Vec<StackParameter> {
        vec![
            StackParameter::value(
                PARAM_EXISTING_VPC_ID,
                self.vpc_id.clone().unwrap_or_default(),
            ),
            StackParameter::value(PARAM_RETAIN_BUCKET, self.retain_bucket.to_string()),
        ]
    }
}

fn reference(name: &str) -> Value {
    json!({ "Ref": name })
}

fn get_att(name: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [name, attribute] })
}

fn sub(expression: &str) -> Value {
    json!({ "Fn::Sub": expression })
}

fn tags(name: Option<String>) -> Value {
    let mut tags = Vec::new();
    if let Some(name) = name {
        tags.push(json!({ "Key": "Name", "Value": name }));
    }
    tags.push(json!({ "Key": CREATED_BY_TAG_KEY, "Value": PROJECT_NAME }));
    Value::Array(tags)
}

fn resource(kind: &str, properties: Value) -> Value {
    json!({ "Type": kind, "Properties": properties })
}

fn assume_role_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": ["ecs-tasks.amazonaws.com"] },
            "Action": ["sts:AssumeRole"]
        }]
    })
}

fn container_definitions(containers: &[ContainerSpec], options: &TemplateOptions) -> Vec<Value> {
    let init_names: Vec<&str> = containers
        .iter()
        .filter(|c| c.is_init)
        .map(|c| c.name_or(&options.default_container_name))
        .collect();

    containers
        .iter()
        .map(|container| {
            let mut def = serde_json::Map::new();
            def.insert(
                "Name".into(),
                json!(container.name_or(&options.default_container_name)),
            );
            def.insert("Image".into(), json!(container.image));
            def.insert("StopTimeout".into(), json!(120));
            def.insert("Essential".into(), json!(!container.is_init));
            if container.cpus > 0.0 {
                def.insert(
                    "Cpu".into(),
                    json!((container.cpus as f64 * 1024.0) as u32),
                );
            }
            def.insert(
                "LogConfiguration".into(),
                json!({
                    "LogDriver": "awslogs",
                    "Options": {
                        "awslogs-group": reference(LOG_GROUP),
                        "awslogs-region": reference("AWS::Region"),
                        "awslogs-stream-prefix": options.stream_prefix,
                    }
                }),
            );
            if !container.entrypoint.is_empty() {
                def.insert("EntryPoint".into(), json!(container.entrypoint));
            }
            if !container.command.is_empty() {
                def.insert("Command".into(), json!(container.command));
            }
            if let Some(dir) = container.working_dir.as_deref().filter(|d| !d.is_empty()) {
                def.insert("WorkingDirectory".into(), json!(dir));
            }

            let mount_points: Vec<Value> = container
                .volumes
                .iter()
                .map(|v| {
                    json!({
                        "ContainerPath": v.target,
                        "SourceVolume": v.source,
                        "ReadOnly": v.read_only,
                    })
                })
                .collect();
            if !mount_points.is_empty() {
                def.insert("MountPoints".into(), Value::Array(mount_points));
            }

            let volumes_from: Vec<Value> = container
                .volumes_from
                .iter()
                .map(|v| {
                    let (source, mode) = v.split_once(':').unwrap_or((v.as_str(), ""));
                    json!({ "SourceContainer": source, "ReadOnly": mode == "ro" })
                })
                .collect();
            if !volumes_from.is_empty() {
                def.insert("VolumesFrom".into(), Value::Array(volumes_from));
            }

            if !container.is_init && !init_names.is_empty() {
                let depends_on: Vec<Value> = init_names
                    .iter()
                    .map(|name| json!({ "Condition": "COMPLETE", "ContainerName": name }))
                    .collect();
                def.insert("DependsOn".into(), Value::Array(depends_on));
            }

            Value::Object(def)
        })
        .collect()
}

/// Render the stack template for `containers`
pub fn render(stack: &str, containers: &[ContainerSpec], options: &TemplateOptions) -> Result<String> {
    if containers.is_empty() {
        return Err(Error::Config("at least one container is required".into()));
    }
    let platform = common_platform(containers)?;
    let (cpu, memory) = task_size(containers);
    let prefix = format!("{}-", stack);
    let capacity_provider = if options.spot { "FARGATE_SPOT" } else { "FARGATE" };

    let mut resources: BTreeMap<&str, Value> = BTreeMap::new();
    let mut outputs: BTreeMap<&str, Value> = BTreeMap::new();

    // State bucket; removed with the stack when creation fails
    let mut bucket = resource(
        "AWS::S3::Bucket",
        json!({
            "Tags": tags(None),
            "VersioningConfiguration": { "Status": "Enabled" }
        }),
    );
    if options.retain_bucket {
        bucket["DeletionPolicy"] = json!("RetainExceptOnCreate");
    }
    resources.insert(BUCKET, bucket);

    resources.insert(
        CLUSTER,
        resource("AWS::ECS::Cluster", json!({ "Tags": tags(None) })),
    );
    resources.insert(
        CAPACITY_PROVIDER,
        resource(
            "AWS::ECS::ClusterCapacityProviderAssociations",
            json!({
                "Cluster": reference(CLUSTER),
                "CapacityProviders": [capacity_provider],
                "DefaultCapacityProviderStrategy": [
                    { "CapacityProvider": capacity_provider, "Weight": 1 }
                ]
            }),
        ),
    );

    let mut log_group = resource(
        "AWS::Logs::LogGroup",
        json!({ "Tags": tags(None), "RetentionInDays": 1 }),
    );
    log_group["DependsOn"] = json!([CLUSTER]);
    resources.insert(LOG_GROUP, log_group);

    resources.insert(
        EXECUTION_ROLE,
        resource(
            "AWS::IAM::Role",
            json!({
                "Tags": tags(None),
                "ManagedPolicyArns": [
                    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy"
                ],
                "AssumeRolePolicyDocument": assume_role_policy()
            }),
        ),
    );
    resources.insert(
        TASK_ROLE,
        resource(
            "AWS::IAM::Role",
            json!({
                "Tags": tags(None),
                "AssumeRolePolicyDocument": assume_role_policy(),
                "Policies": [{
                    "PolicyName": "AllowExecuteCommand",
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": [
                                "ssmmessages:CreateDataChannel",
                                "ssmmessages:OpenDataChannel",
                                "ssmmessages:OpenControlChannel",
                                "ssmmessages:CreateControlChannel"
                            ],
                            "Resource": "*"
                        }]
                    }
                }]
            }),
        ),
    );

    let volume_names: BTreeSet<&str> = containers
        .iter()
        .flat_map(|c| c.volumes.iter().map(|v| v.source.as_str()))
        .collect();
    let mut runtime_platform = serde_json::Map::new();
    if let Some(platform) = &platform {
        runtime_platform.insert("CpuArchitecture".into(), json!(platform.cpu_architecture()));
        if let Some(os) = platform.os_family() {
            runtime_platform.insert("OperatingSystemFamily".into(), json!(os));
        }
    }
    resources.insert(
        TASK_DEFINITION,
        resource(
            "AWS::ECS::TaskDefinition",
            json!({
                "Tags": tags(None),
                "RuntimePlatform": runtime_platform,
                "Volumes": volume_names.iter().map(|name| json!({ "Name": name })).collect::<Vec<_>>(),
                "ContainerDefinitions": container_definitions(containers, options),
                "Cpu": cpu.to_string(),
                "Memory": memory.to_string(),
                "ExecutionRoleArn": reference(EXECUTION_ROLE),
                "TaskRoleArn": reference(TASK_ROLE),
                "NetworkMode": "awsvpc",
                "RequiresCompatibilities": ["FARGATE"]
            }),
        ),
    );

    let vpc_id = match options.vpc_id.as_deref().filter(|v| !v.is_empty()) {
        Some(vpc_id) => json!(vpc_id),
        None => {
            resources.insert(
                VPC,
                resource(
                    "AWS::EC2::VPC",
                    json!({ "Tags": tags(Some(format!("{}vpc", prefix))), "CidrBlock": "10.0.0.0/16" }),
                ),
            );
            resources.insert(
                INTERNET_GATEWAY,
                resource(
                    "AWS::EC2::InternetGateway",
                    json!({ "Tags": tags(Some(format!("{}igw", prefix))) }),
                ),
            );
            resources.insert(
                INTERNET_GATEWAY_ATTACHMENT,
                resource(
                    "AWS::EC2::VPCGatewayAttachment",
                    json!({ "VpcId": reference(VPC), "InternetGatewayId": reference(INTERNET_GATEWAY) }),
                ),
            );
            resources.insert(
                ROUTE_TABLE,
                resource(
                    "AWS::EC2::RouteTable",
                    json!({ "Tags": tags(Some(format!("{}routetable", prefix))), "VpcId": reference(VPC) }),
                ),
            );
            resources.insert(
                ROUTE,
                resource(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": reference(ROUTE_TABLE),
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "GatewayId": reference(INTERNET_GATEWAY)
                    }),
                ),
            );
            resources.insert(
                SUBNET,
                resource(
                    "AWS::EC2::Subnet",
                    json!({
                        "Tags": tags(Some(format!("{}subnet", prefix))),
                        "CidrBlock": "10.0.0.0/20",
                        "VpcId": reference(VPC),
                        "MapPublicIpOnLaunch": true
                    }),
                ),
            );
            resources.insert(
                SUBNET_ROUTE_TABLE_ASSOCIATION,
                resource(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({ "SubnetId": reference(SUBNET), "RouteTableId": reference(ROUTE_TABLE) }),
                ),
            );
            resources.insert(
                S3_GATEWAY_ENDPOINT,
                resource(
                    "AWS::EC2::VPCEndpoint",
                    json!({
                        "VpcEndpointType": "Gateway",
                        "VpcId": reference(VPC),
                        "ServiceName": sub("com.amazonaws.${AWS::Region}.s3")
                    }),
                ),
            );
            outputs.insert(
                OUTPUT_SUBNET_ID,
                json!({ "Description": "ID of the subnet", "Value": reference(SUBNET) }),
            );
            reference(VPC)
        }
    };

    resources.insert(
        SECURITY_GROUP,
        resource(
            "AWS::EC2::SecurityGroup",
            json!({
                "Tags": tags(None),
                "GroupDescription": "Security group for the ECS task that allows all outbound and inbound traffic",
                "VpcId": vpc_id,
                "SecurityGroupIngress": [{
                    "IpProtocol": "tcp",
                    "FromPort": 1,
                    "ToPort": 65535,
                    "CidrIp": "0.0.0.0/0"
                }]
            }),
        ),
    );

    outputs.insert(
        OUTPUT_TASK_DEF_ARN,
        json!({ "Description": "ARN of the ECS task definition", "Value": reference(TASK_DEFINITION) }),
    );
    outputs.insert(
        OUTPUT_CLUSTER_NAME,
        json!({ "Description": "Name of the ECS cluster", "Value": reference(CLUSTER) }),
    );
    outputs.insert(
        OUTPUT_LOG_GROUP_ARN,
        json!({ "Description": "ARN of the CloudWatch log group", "Value": get_att(LOG_GROUP, "Arn") }),
    );
    outputs.insert(
        OUTPUT_SECURITY_GROUP_ID,
        json!({ "Description": "ID of the security group", "Value": reference(SECURITY_GROUP) }),
    );
    outputs.insert(
        OUTPUT_BUCKET_NAME,
        json!({ "Description": "Name of the S3 bucket", "Value": reference(BUCKET) }),
    );
    outputs.insert(
        OUTPUT_TEMPLATE_VERSION,
        json!({
            "Description": "Version of this CloudFormation template",
            "Value": TEMPLATE_REVISION.to_string()
        }),
    );

    let template = json!({
        "AWSTemplateFormatVersion": "2010-09-09",
        "Description": "crun CloudFormation template for an ECS task. Don't delete: use the CLI instead.",
        "Parameters": {
            PARAM_EXISTING_VPC_ID: { "Type": "String", "Default": "" },
            PARAM_RETAIN_BUCKET: { "Type": "String", "Default": "true", "AllowedValues": ["true", "false"] }
        },
        "Resources": resources,
        "Outputs": outputs,
    });

    Ok(serde_json::to_string_pretty(&template)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::VolumeMount;

    fn parse(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_render_is_deterministic() {
        let containers = vec![ContainerSpec::new("nginx").with_platform("linux/amd64")];
        let options = TemplateOptions::default();
        let a = render("crun", &containers, &options).unwrap();
        let b = render("crun", &containers, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_default_network() {
        let body = render("crun", &[ContainerSpec::new("nginx")], &TemplateOptions::default()).unwrap();
        let template = parse(&body);

        for name in [BUCKET, CLUSTER, LOG_GROUP, TASK_DEFINITION, VPC, SUBNET, SECURITY_GROUP] {
            assert!(template["Resources"].get(name).is_some(), "missing {}", name);
        }
        assert_eq!(template["Resources"][BUCKET]["DeletionPolicy"], "RetainExceptOnCreate");
        assert_eq!(template["Resources"][LOG_GROUP]["DependsOn"], json!([CLUSTER]));
        assert_eq!(template["Outputs"][OUTPUT_TEMPLATE_VERSION]["Value"], "1");
        assert!(template["Outputs"].get(OUTPUT_SUBNET_ID).is_some());
        assert_eq!(
            template["Resources"][VPC]["Properties"]["Tags"][0]["Value"],
            "crun-vpc"
        );

        let task_def = &template["Resources"][TASK_DEFINITION]["Properties"];
        assert_eq!(task_def["Cpu"], "256");
        assert_eq!(task_def["Memory"], "512");
        let main = &task_def["ContainerDefinitions"][0];
        assert_eq!(main["Name"], "main");
        assert_eq!(main["Essential"], true);
        assert_eq!(
            main["LogConfiguration"]["Options"]["awslogs-stream-prefix"],
            "crun"
        );
    }

    #[test]
    fn test_render_existing_vpc_and_spot() {
        let options = TemplateOptions {
            spot: true,
            vpc_id: Some("vpc-123".into()),
            retain_bucket: false,
            ..Default::default()
        };
        let template = parse(&render("crun", &[ContainerSpec::new("nginx")], &options).unwrap());

        assert!(template["Resources"].get(VPC).is_none());
        assert!(template["Outputs"].get(OUTPUT_SUBNET_ID).is_none());
        assert!(template["Resources"][BUCKET].get("DeletionPolicy").is_none());
        assert_eq!(
            template["Resources"][SECURITY_GROUP]["Properties"]["VpcId"],
            "vpc-123"
        );
        assert_eq!(
            template["Resources"][CAPACITY_PROVIDER]["Properties"]["CapacityProviders"][0],
            "FARGATE_SPOT"
        );
    }

    #[test]
    fn test_render_init_containers_and_volumes() {
        let containers = vec![
            ContainerSpec::new("busybox")
                .with_name("setup")
                .init()
                .with_volume(VolumeMount::new("data", "/data")),
            ContainerSpec::new("app")
                .with_name("app")
                .with_volumes_from("setup:ro")
                .with_platform(""),
        ];
        let template = parse(&render("crun", &containers, &TemplateOptions::default()).unwrap());
        let task_def = &template["Resources"][TASK_DEFINITION]["Properties"];

        assert_eq!(task_def["Volumes"], json!([{ "Name": "data" }]));
        let setup = &task_def["ContainerDefinitions"][0];
        assert_eq!(setup["Essential"], false);
        assert!(setup.get("DependsOn").is_none());

        let app = &task_def["ContainerDefinitions"][1];
        assert_eq!(
            app["DependsOn"],
            json!([{ "Condition": "COMPLETE", "ContainerName": "setup" }])
        );
        assert_eq!(
            app["VolumesFrom"],
            json!([{ "SourceContainer": "setup", "ReadOnly": true }])
        );
    }

    #[test]
    fn test_render_rejects_bad_input() {
        assert!(render("crun", &[], &TemplateOptions::default()).is_err());

        let mixed = vec![
            ContainerSpec::new("a").with_platform("linux/amd64"),
            ContainerSpec::new("b").with_platform("linux/arm64"),
        ];
        assert!(matches!(
            render("crun", &mixed, &TemplateOptions::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_parameters() {
        let params = TemplateOptions::default().parameters();
        assert_eq!(params[0].key, PARAM_EXISTING_VPC_ID);
        assert_eq!(params[0].value.as_deref(), Some(""));
        assert_eq!(params[1].value.as_deref(), Some("true"));
    }
}
