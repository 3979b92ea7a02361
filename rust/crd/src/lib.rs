//! Custom resource types for the Flink operator.
//!
//! The `FlinkCluster` resource declares a Flink cluster (a JobManager, a
//! TaskManager fleet and optionally a single job the operator submits).
//! The controller in `flink-operator` drives the actual cluster towards
//! this declaration.

pub mod quantity;
pub mod validation;

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        EnvVar, PodSecurityContext, ResourceRequirements, Toleration, Volume, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const APP_NAME: &str = "flink";
pub const API_GROUP: &str = "flinkoperator.k8s.io";

/// Annotation through which users request an imperative operation
/// (`savepoint` or `job-cancel`) on top of the declarative spec.
pub const CONTROL_ANNOTATION: &str = "flinkclusters.flinkoperator.k8s.io/user-control";
/// Name of the spec revision a workload object was rendered from.
pub const REVISION_NAME_ANNOTATION: &str = "flinkclusters.flinkoperator.k8s.io/revision-name";
/// Hash of the spec revision a workload object was rendered from.
pub const REVISION_HASH_ANNOTATION: &str = "flinkclusters.flinkoperator.k8s.io/revision-hash";
/// Label tying ControllerRevision objects to their owning cluster.
pub const CLUSTER_NAME_LABEL: &str = "flinkoperator.k8s.io/cluster-name";
pub const FINALIZER_NAME: &str = "flinkclusters.flinkoperator.k8s.io/finalizer";

pub const JM_RPC_PORT_NAME: &str = "rpc";
pub const JM_BLOB_PORT_NAME: &str = "blob";
pub const JM_QUERY_PORT_NAME: &str = "query";
pub const JM_UI_PORT_NAME: &str = "ui";
pub const TM_RPC_PORT_NAME: &str = "rpc";
pub const TM_DATA_PORT_NAME: &str = "data";
pub const TM_QUERY_PORT_NAME: &str = "query";

pub const DEFAULT_JM_RPC_PORT: i32 = 6123;
pub const DEFAULT_JM_BLOB_PORT: i32 = 6124;
pub const DEFAULT_JM_QUERY_PORT: i32 = 6125;
pub const DEFAULT_JM_UI_PORT: i32 = 8081;
pub const DEFAULT_TM_DATA_PORT: i32 = 6121;
pub const DEFAULT_TM_RPC_PORT: i32 = 6122;
pub const DEFAULT_TM_QUERY_PORT: i32 = 6125;

pub const DEFAULT_JOB_MANAGER_REPLICAS: i32 = 1;
pub const DEFAULT_TASK_MANAGER_REPLICAS: i32 = 3;
pub const DEFAULT_MAX_STATE_AGE_TO_RESTORE_SECONDS: i32 = 300;

/// A Flink cluster: a JobManager, a TaskManager fleet and, for job
/// clusters, a single job the operator submits and supervises.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "flinkoperator.k8s.io",
    version = "v1beta1",
    kind = "FlinkCluster",
    plural = "flinkclusters",
    shortname = "fc",
    status = "FlinkClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","jsonPath":".status.state","type":"string"}"#,
    printcolumn = r#"{"name":"Age","jsonPath":".metadata.creationTimestamp","type":"date"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlinkClusterSpec {
    /// Flink version deployed in the image, e.g. `1.12`.
    pub flink_version: String,

    pub image: ImageSpec,

    pub job_manager: JobManagerSpec,

    pub task_manager: TaskManagerSpec,

    /// Job to run on the cluster. Presence of this field classifies the
    /// cluster as a job cluster; absence as a session cluster. The
    /// classification cannot change after creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_config: Option<GcpConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hadoop_config: Option<HadoopConfig>,

    /// Environment variables shared by all containers of the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVar>,

    /// Extra entries for `flink-conf.yaml`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flink_properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image name, e.g. `flink:1.12.1`.
    pub name: String,

    /// One of `Always`, `IfNotPresent`, `Never`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secrets: Vec<String>,
}

/// How the JobManager service is exposed.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum AccessScope {
    #[default]
    Cluster,
    #[serde(rename = "VPC")]
    #[strum(serialize = "VPC")]
    Vpc,
    External,
    NodePort,
    Headless,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManagerSpec {
    /// Number of JobManager replicas, at least 1. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub access_scope: AccessScope,

    #[serde(default)]
    pub ports: JobManagerPorts,

    /// Additional named container ports. Names and numbers must be
    /// unique across the union of `ports` and `extraPorts`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_ports: Vec<NamedPort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<JobManagerIngressSpec>,

    /// Compute resources. Requests and limits are both required.
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Percentage of container memory reserved for off-heap use, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_off_heap_ratio: Option<i32>,

    /// Lower bound for off-heap memory regardless of the ratio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_off_heap_min: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManagerPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<i32>,
}

impl JobManagerPorts {
    /// Standard ports with defaults applied.
    pub fn named_ports(&self) -> Vec<NamedPort> {
        vec![
            NamedPort {
                name: JM_RPC_PORT_NAME.to_string(),
                container_port: self.rpc.unwrap_or(DEFAULT_JM_RPC_PORT),
            },
            NamedPort {
                name: JM_BLOB_PORT_NAME.to_string(),
                container_port: self.blob.unwrap_or(DEFAULT_JM_BLOB_PORT),
            },
            NamedPort {
                name: JM_QUERY_PORT_NAME.to_string(),
                container_port: self.query.unwrap_or(DEFAULT_JM_QUERY_PORT),
            },
            NamedPort {
                name: JM_UI_PORT_NAME.to_string(),
                container_port: self.ui.unwrap_or(DEFAULT_JM_UI_PORT),
            },
        ]
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskManagerPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<i32>,
}

impl TaskManagerPorts {
    pub fn named_ports(&self) -> Vec<NamedPort> {
        vec![
            NamedPort {
                name: TM_RPC_PORT_NAME.to_string(),
                container_port: self.rpc.unwrap_or(DEFAULT_TM_RPC_PORT),
            },
            NamedPort {
                name: TM_DATA_PORT_NAME.to_string(),
                container_port: self.data.unwrap_or(DEFAULT_TM_DATA_PORT),
            },
            NamedPort {
                name: TM_QUERY_PORT_NAME.to_string(),
                container_port: self.query.unwrap_or(DEFAULT_TM_QUERY_PORT),
            },
        ]
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedPort {
    pub name: String,
    pub container_port: i32,
}

/// Ingress for the JobManager UI.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManagerIngressSpec {
    /// Host template; `{{$clusterName}}` is replaced with the cluster name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_format: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tls: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

/// Workload kind running the TaskManager fleet. Cannot change once set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum DeploymentType {
    #[default]
    StatefulSet,
    Deployment,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskManagerSpec {
    /// Number of TaskManager replicas, at least 1. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<DeploymentType>,

    #[serde(default)]
    pub ports: TaskManagerPorts,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_ports: Vec<NamedPort>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_off_heap_ratio: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_off_heap_min: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Enable a HorizontalPodAutoscaler targeting the TaskManager
    /// workload, scaling between `replicas` and `maxReplicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum JobRestartPolicy {
    Never,
    FromSavepointOnFailure,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum CleanupAction {
    KeepCluster,
    DeleteCluster,
    DeleteTaskManager,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPolicy {
    pub after_job_succeeds: CleanupAction,
    pub after_job_fails: CleanupAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_job_cancelled: Option<CleanupAction>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum JobMode {
    Blocking,
    #[default]
    Detached,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// JAR file of the job, e.g. `gs://my-bucket/myjob.jar`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jar_file: Option<String>,

    /// Fully qualified name of the entry point class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Python file of the job, e.g. `gs://my-bucket/myjob.py`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_file: Option<String>,

    /// Additional python files or archives, comma separated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_files: Option<String>,

    /// Python module path of the job entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_module: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_logging_to_stdout: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<JobRestartPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_policy: Option<CleanupPolicy>,

    /// Directory for savepoints. Once set it cannot be removed; spec
    /// updates of a running job require it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoints_dir: Option<String>,

    /// Savepoint to restore the job from, overriding any recorded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_savepoint: Option<String>,

    /// Interval for automatic savepoints; disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_savepoint_seconds: Option<i32>,

    /// Maximum age a savepoint may have to be restored from. Defaults
    /// to 300 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_state_age_to_restore_seconds: Option<i32>,

    /// Increment by exactly one (and change nothing else) to request a
    /// savepoint declaratively.
    #[serde(default)]
    pub savepoint_generation: i32,

    /// Take a savepoint before stopping the job for a spec update.
    /// Unset means true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_savepoint_on_update: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<JobMode>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,
}

impl JobSpec {
    /// True when `takeSavepointOnUpdate` is unset or true.
    pub fn take_savepoint_on_update(&self) -> bool {
        self.take_savepoint_on_update.unwrap_or(true)
    }

    pub fn max_state_age_to_restore_seconds(&self) -> i32 {
        self.max_state_age_to_restore_seconds
            .unwrap_or(DEFAULT_MAX_STATE_AGE_TO_RESTORE_SECONDS)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<GcpServiceAccount>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccount {
    pub secret_name: String,
    pub key_file: String,
    /// Directory the secret is mounted at. Must not name the key file.
    pub mount_path: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HadoopConfig {
    pub config_map_name: String,
    pub mount_path: String,
}

/// Overall state of the cluster as reconciled by the operator.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ClusterState {
    #[default]
    Creating,
    Running,
    Updating,
    Stopping,
    Stopped,
    Failed,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ComponentState {
    #[default]
    NotReady,
    Ready,
    Updating,
    Deleted,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum JobState {
    #[default]
    Pending,
    Deploying,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Lost,
    Unknown,
}

impl JobState {
    /// Job has not reached the engine yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Deploying)
    }

    /// Job reached a stopped state on the engine.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled | JobState::Lost
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum ControlState {
    Requested,
    InProgress,
    Succeeded,
    Failed,
}

/// The imperative operation requested through the control annotation.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum UserControl {
    #[serde(rename = "savepoint")]
    #[strum(serialize = "savepoint")]
    Savepoint,
    #[serde(rename = "job-cancel")]
    #[strum(serialize = "job-cancel")]
    JobCancel,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum SavepointState {
    InProgress,
    TriggerFailed,
    Failed,
    Succeeded,
}

/// Why a savepoint was triggered.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum SavepointReason {
    /// Drain before a rolling update.
    Update,
    /// `user-control: savepoint` annotation.
    UserRequested,
    /// `savepointGeneration` was bumped in the spec.
    Generation,
    /// Periodic savepoint per `autoSavepointSeconds`.
    Scheduled,
    /// Final savepoint while cancelling the job.
    JobCancel,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlinkClusterStatus {
    #[serde(default)]
    pub state: ClusterState,

    #[serde(default)]
    pub components: FlinkClusterComponentsStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint: Option<SavepointStatus>,

    #[serde(default)]
    pub revision: RevisionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlinkClusterComponentsStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ComponentState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_manager_stateful_set: Option<ComponentState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_manager_service: Option<ComponentState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_manager_ingress: Option<ComponentState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_manager: Option<ComponentState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_savepoint: Option<String>,

    /// Last savepoint generation the operator completed for this job.
    #[serde(default)]
    pub savepoint_generation: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savepoint_location: Option<String>,

    /// The recorded savepoint was taken while stopping the job.
    #[serde(default)]
    pub final_savepoint: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(default)]
    pub restart_count: i32,
}

impl JobStatus {
    pub fn should_restart(&self, restart_policy: Option<JobRestartPolicy>) -> bool {
        self.state == JobState::Failed
            && matches!(
                restart_policy,
                Some(JobRestartPolicy::FromSavepointOnFailure)
            )
    }
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub name: UserControl,
    pub state: ControlState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavepointStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<String>,
    pub trigger_reason: SavepointReason,
    pub state: SavepointState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    /// Revision the observed workloads run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    /// Most recently accepted revision; equals `currentRevision` when
    /// no update is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl FlinkCluster {
    /// A cluster without a job spec is a session cluster.
    pub fn is_session_cluster(&self) -> bool {
        self.spec.job.is_none()
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-configmap", self.name_any())
    }

    pub fn job_manager_stateful_set_name(&self) -> String {
        format!("{}-jobmanager", self.name_any())
    }

    pub fn job_manager_service_name(&self) -> String {
        format!("{}-jobmanager", self.name_any())
    }

    pub fn job_manager_ingress_name(&self) -> String {
        format!("{}-jobmanager", self.name_any())
    }

    pub fn task_manager_name(&self) -> String {
        format!("{}-taskmanager", self.name_any())
    }

    pub fn task_manager_service_name(&self) -> String {
        format!("{}-taskmanager", self.name_any())
    }

    pub fn pod_disruption_budget_name(&self) -> String {
        format!("{}-jobmanager", self.name_any())
    }

    pub fn autoscaler_name(&self) -> String {
        format!("{}-taskmanager", self.name_any())
    }

    pub fn submitter_job_name(&self) -> String {
        format!("{}-job-submitter", self.name_any())
    }

    /// The in-cluster JobManager REST endpoint.
    pub fn job_manager_endpoint(&self) -> String {
        let ui_port = self.spec.job_manager.ports.ui.unwrap_or(DEFAULT_JM_UI_PORT);
        format!(
            "http://{}.{}.svc:{}",
            self.job_manager_service_name(),
            self.namespace().unwrap_or_else(|| "default".to_string()),
            ui_port
        )
    }

    /// Value of the user-control annotation, if any.
    pub fn control_annotation(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(CONTROL_ANNOTATION))
            .map(String::as_str)
    }

    pub fn job_status(&self) -> Option<&JobStatus> {
        self.status.as_ref().and_then(|s| s.components.job.as_ref())
    }
}

/// Content-addressed hash of a cluster spec, used as revision identity.
pub fn spec_revision_hash(spec: &FlinkClusterSpec) -> String {
    let serialized = serde_json::to_vec(spec).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
