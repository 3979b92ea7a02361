//! Admission validation for `FlinkCluster` create and update requests.
//!
//! Create validation checks the spec in isolation. Update validation
//! additionally enforces the mutability rules of the resource: the
//! session/job classification is frozen, `savepointsDir` cannot be
//! removed, the TaskManager deployment type cannot change, and spec
//! changes that would lose job state are refused unless an up-to-date
//! savepoint exists or one will be taken before the update.
//!
//! Savepoint freshness is time sensitive, so every `now()` flows
//! through the [`Clock`] trait and tests pin the time.

use chrono::{DateTime, Duration, Utc};
use snafu::Snafu;

use crate::{
    quantity, ControlState, FlinkCluster, GcpConfig, HadoopConfig, JobManagerSpec, JobSpec,
    JobStatus, NamedPort, TaskManagerSpec, UserControl, CONTROL_ANNOTATION,
};

const MAX_CLUSTER_NAME_LENGTH: usize = 49;
const MAX_LABEL_NAME_LENGTH: usize = 63;

/// Source of the current time for freshness checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock used outside of tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A rejected admission request. The message is a single line naming
/// the offending field and constraint.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
        }
    }
}

fn reject<T>(message: impl Into<String>) -> Result<T, ValidationError> {
    Err(ValidationError::new(message))
}

pub struct Validator<'a> {
    clock: &'a dyn Clock,
}

impl<'a> Validator<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Validator { clock }
    }

    /// Validate a cluster on creation.
    pub fn validate_create(&self, cluster: &FlinkCluster) -> Result<(), ValidationError> {
        let name = cluster.metadata.name.as_deref().unwrap_or_default();
        validate_cluster_name(name)?;
        validate_image(&cluster.spec.image)?;
        validate_flink_version(&cluster.spec.flink_version)?;
        validate_job_manager(&cluster.spec.job_manager)?;
        validate_task_manager(&cluster.spec.task_manager)?;
        if let Some(job) = &cluster.spec.job {
            validate_job(job)?;
        }
        if let Some(gcp) = &cluster.spec.gcp_config {
            validate_gcp_config(gcp)?;
        }
        if let Some(hadoop) = &cluster.spec.hadoop_config {
            validate_hadoop_config(hadoop)?;
        }
        Ok(())
    }

    /// Validate an update. Returns the first failing condition; pure
    /// status changes are always allowed.
    pub fn validate_update(
        &self,
        old: &FlinkCluster,
        new: &FlinkCluster,
    ) -> Result<(), ValidationError> {
        // A newly set user-control annotation is an imperative request
        // and is validated on its own.
        if let Some(value) = new.control_annotation() {
            if old.control_annotation() != Some(value) {
                return validate_user_control(old, value);
            }
        }

        if old.spec == new.spec {
            return Ok(());
        }

        if control_in_progress(old) {
            return reject(format!(
                "change is not allowed for control in progress, annotation: {CONTROL_ANNOTATION}"
            ));
        }

        if old.spec.job.is_none() != new.spec.job.is_none() {
            let old_json = serde_json::to_string(&old.spec.job).unwrap_or_default();
            let new_json = serde_json::to_string(&new.spec.job).unwrap_or_default();
            return reject(format!(
                "you cannot change cluster type between session cluster and job cluster, \
                 old spec.job: {old_json:?}, new spec.job: {new_json:?}"
            ));
        }

        if let (Some(old_job), Some(new_job)) = (&old.spec.job, &new.spec.job) {
            if old_job.savepoints_dir.is_some() && new_job.savepoints_dir.is_none() {
                return reject("removing savepointsDir is not allowed");
            }
        }

        if let Some(old_type) = old.spec.task_manager.deployment_type {
            if new.spec.task_manager.deployment_type != Some(old_type) {
                return reject("updating deploymentType is not allowed");
            }
        }

        if let (Some(old_job), Some(new_job)) = (&old.spec.job, &new.spec.job) {
            if job_spec_changed(old_job, new_job) && old_job.savepoints_dir.is_none() {
                return reject(
                    "updating job is not allowed when spec.job.savepointsDir was not provided",
                );
            }

            if new_job.savepoint_generation != old_job.savepoint_generation {
                return self.validate_savepoint_generation(old, new);
            }
        }

        if let (Some(new_job), Some(job_status)) = (&new.spec.job, old.job_status()) {
            if !self.savepoint_usable_for_update(new_job, job_status) {
                let take = new_job
                    .take_savepoint_on_update
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "nil".to_string());
                let max_age = new_job
                    .max_state_age_to_restore_seconds
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "nil".to_string());
                let status_json = serde_json::to_string(job_status).unwrap_or_default();
                return reject(format!(
                    "cannot update spec: taking savepoint is skipped but no up-to-date savepoint, \
                     spec.job.takeSavepointOnUpdate: {take}, \
                     spec.job.maxStateAgeToRestoreSeconds: {max_age}, job status: {status_json:?}"
                ));
            }
        }

        self.validate_create(new)
    }

    /// `savepointGeneration` may only move to exactly
    /// `status.components.job.savepointGeneration + 1`, and only alone.
    fn validate_savepoint_generation(
        &self,
        old: &FlinkCluster,
        new: &FlinkCluster,
    ) -> Result<(), ValidationError> {
        let expected = old
            .job_status()
            .map(|job| job.savepoint_generation)
            .unwrap_or(0)
            + 1;
        let requested = new
            .spec
            .job
            .as_ref()
            .map(|job| job.savepoint_generation)
            .unwrap_or(0);
        if requested != expected {
            return reject(format!(
                "you can only update savepointGeneration to {expected}"
            ));
        }

        let mut old_rest = old.spec.clone();
        let mut new_rest = new.spec.clone();
        if let Some(job) = old_rest.job.as_mut() {
            job.savepoint_generation = 0;
        }
        if let Some(job) = new_rest.job.as_mut() {
            job.savepoint_generation = 0;
        }
        if old_rest != new_rest {
            return reject("you cannot update savepointGeneration with others at the same time");
        }
        Ok(())
    }

    /// Whether a spec-changing update may proceed without losing state.
    fn savepoint_usable_for_update(&self, new_job: &JobSpec, job_status: &JobStatus) -> bool {
        if new_job.from_savepoint.is_some() {
            return true;
        }
        if job_status.state.is_pending() {
            // Nothing has run yet, there is no state to lose.
            return true;
        }
        if job_status.state.is_active()
            && new_job.take_savepoint_on_update()
            && !job_status.final_savepoint
        {
            // A savepoint will be taken while draining the job.
            return true;
        }

        let Some(savepoint_time) = job_status
            .savepoint_time
            .as_deref()
            .and_then(parse_timestamp)
        else {
            return false;
        };
        if job_status.savepoint_location.is_none() {
            return false;
        }
        let reference = if job_status.state.is_stopped() {
            job_status
                .completion_time
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(|| self.clock.now())
        } else {
            self.clock.now()
        };
        let max_age = Duration::seconds(new_job.max_state_age_to_restore_seconds() as i64);
        reference - savepoint_time <= max_age
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn control_in_progress(cluster: &FlinkCluster) -> bool {
    cluster
        .status
        .as_ref()
        .and_then(|status| status.control.as_ref())
        .map(|control| control.state == ControlState::InProgress)
        .unwrap_or(false)
}

/// Validate a `user-control` annotation newly set on the cluster.
fn validate_user_control(old: &FlinkCluster, value: &str) -> Result<(), ValidationError> {
    let control: UserControl = match value.parse() {
        Ok(control) => control,
        Err(_) => {
            return reject(format!(
                "invalid value for annotation key: {CONTROL_ANNOTATION}, value: {value}, \
                 available values: savepoint, job-cancel"
            ));
        }
    };

    if control_in_progress(old) {
        return reject(format!(
            "change is not allowed for control in progress, annotation: {CONTROL_ANNOTATION}"
        ));
    }

    let job_running = old
        .job_status()
        .map(|job| job.state.is_active())
        .unwrap_or(false);

    match control {
        UserControl::Savepoint => {
            if old.is_session_cluster() {
                return reject(format!(
                    "savepoint is not allowed for session cluster, annotation: {CONTROL_ANNOTATION}"
                ));
            }
            let savepoints_dir = old
                .spec
                .job
                .as_ref()
                .and_then(|job| job.savepoints_dir.as_ref());
            if savepoints_dir.is_none() {
                return reject(format!(
                    "savepoint is not allowed without spec.job.savepointsDir, \
                     annotation: {CONTROL_ANNOTATION}"
                ));
            }
            if !job_running {
                return reject(format!(
                    "savepoint is not allowed because job is not started yet or already stopped, \
                     annotation: {CONTROL_ANNOTATION}"
                ));
            }
        }
        UserControl::JobCancel => {
            if old.is_session_cluster() {
                return reject(format!(
                    "job-cancel is not allowed for session cluster, annotation: {CONTROL_ANNOTATION}"
                ));
            }
            if !job_running {
                return reject(format!(
                    "job-cancel is not allowed because job is not started yet or already \
                     terminated, annotation: {CONTROL_ANNOTATION}"
                ));
            }
        }
    }
    Ok(())
}

/// The job spec changed in a way that is not just a generation bump.
fn job_spec_changed(old_job: &JobSpec, new_job: &JobSpec) -> bool {
    let mut old_rest = old_job.clone();
    let mut new_rest = new_job.clone();
    old_rest.savepoint_generation = 0;
    new_rest.savepoint_generation = 0;
    old_rest != new_rest
}

fn validate_cluster_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LENGTH {
        return reject("cluster name size needs to greater than 0 and less than 50");
    }
    if !is_dns1035_label(name) {
        return reject(format!(
            "invalid cluster name {name}, a DNS-1035 label must consist of lower case \
             alphanumeric characters or '-', start with an alphabetic character, and end \
             with an alphanumeric character"
        ));
    }
    Ok(())
}

fn is_dns1035_label(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return false;
    }
    name.chars()
        .last()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false)
}

fn validate_image(image: &crate::ImageSpec) -> Result<(), ValidationError> {
    if image.name.is_empty() {
        return reject("image name is unspecified");
    }
    if let Some(policy) = image.pull_policy.as_deref() {
        if !matches!(policy, "Always" | "IfNotPresent" | "Never") {
            return reject(format!("invalid image pullPolicy: {policy}"));
        }
    }
    Ok(())
}

fn validate_flink_version(version: &str) -> Result<(), ValidationError> {
    if version.is_empty() {
        return reject("flinkVersion is unspecified");
    }
    let mut parts = version.splitn(2, '.');
    let major = parts.next().unwrap_or_default();
    let minor = parts.next().unwrap_or_default();
    if major.parse::<u32>().is_err() || minor.parse::<u32>().is_err() {
        return reject(format!("invalid flinkVersion: {version}"));
    }
    Ok(())
}

fn validate_job_manager(job_manager: &JobManagerSpec) -> Result<(), ValidationError> {
    if let Some(replicas) = job_manager.replicas {
        if replicas < 1 {
            return reject("jobmanager replicas must not be less than 1");
        }
    }
    let mut ports = job_manager.ports.named_ports();
    ports.extend(job_manager.extra_ports.iter().cloned());
    validate_ports("jobmanager", &ports)?;
    validate_resources(
        "jobmanager",
        &job_manager.resources,
        job_manager.memory_off_heap_ratio,
        job_manager.memory_off_heap_min.as_ref(),
    )?;
    validate_meta_keys("spec.jobManager.podLabels", &job_manager.pod_labels)?;
    validate_meta_keys(
        "spec.jobManager.podAnnotations",
        &job_manager.pod_annotations,
    )?;
    Ok(())
}

fn validate_task_manager(task_manager: &TaskManagerSpec) -> Result<(), ValidationError> {
    if let Some(replicas) = task_manager.replicas {
        if replicas < 1 {
            return reject("taskmanager replicas must not be less than 1");
        }
    }
    let mut ports = task_manager.ports.named_ports();
    ports.extend(task_manager.extra_ports.iter().cloned());
    validate_ports("taskmanager", &ports)?;
    validate_resources(
        "taskmanager",
        &task_manager.resources,
        task_manager.memory_off_heap_ratio,
        task_manager.memory_off_heap_min.as_ref(),
    )?;
    if let Some(max_replicas) = task_manager.max_replicas {
        let min = task_manager
            .replicas
            .unwrap_or(crate::DEFAULT_TASK_MANAGER_REPLICAS);
        if max_replicas < min {
            return reject("taskmanager maxReplicas must not be less than replicas");
        }
    }
    validate_meta_keys("spec.taskManager.podLabels", &task_manager.pod_labels)?;
    validate_meta_keys(
        "spec.taskManager.podAnnotations",
        &task_manager.pod_annotations,
    )?;
    Ok(())
}

fn validate_ports(component: &str, ports: &[NamedPort]) -> Result<(), ValidationError> {
    let mut seen_names: Vec<&str> = Vec::new();
    let mut seen_numbers: Vec<i32> = Vec::new();
    for port in ports {
        if seen_names.contains(&port.name.as_str()) {
            return reject(format!(
                "duplicate port name {} in {component}, each port name of ports and \
                 extraPorts must be unique",
                port.name
            ));
        }
        if seen_numbers.contains(&port.container_port) {
            return reject(format!(
                "duplicate containerPort {} in {component}, each port number of ports and \
                 extraPorts must be unique",
                port.container_port
            ));
        }
        seen_names.push(&port.name);
        seen_numbers.push(port.container_port);
    }
    Ok(())
}

fn validate_resources(
    component: &str,
    resources: &k8s_openapi::api::core::v1::ResourceRequirements,
    memory_off_heap_ratio: Option<i32>,
    memory_off_heap_min: Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> Result<(), ValidationError> {
    let requests_missing = resources
        .requests
        .as_ref()
        .map(|requests| requests.is_empty())
        .unwrap_or(true);
    let limits_missing = resources
        .limits
        .as_ref()
        .map(|limits| limits.is_empty())
        .unwrap_or(true);
    if requests_missing || limits_missing {
        return reject(format!(
            "{component} resource requests/limits are unspecified"
        ));
    }

    if let Some(ratio) = memory_off_heap_ratio {
        if !(0..=100).contains(&ratio) {
            return reject(format!(
                "invalid {component} memoryOffHeapRatio, must be between 0 and 100"
            ));
        }
    }

    if let Some(off_heap_min) = memory_off_heap_min {
        let min_bytes = quantity::to_bytes(off_heap_min).map_err(|_| {
            ValidationError::new(format!(
                "invalid {component} memoryOffHeapMin quantity: {}",
                off_heap_min.0
            ))
        })?;
        let memory_limit = resources
            .limits
            .as_ref()
            .and_then(|limits| limits.get("memory"));
        let limit_bytes = match memory_limit {
            Some(limit) => quantity::to_bytes(limit).map_err(|_| {
                ValidationError::new(format!(
                    "invalid {component} memory limit quantity: {}",
                    limit.0
                ))
            })?,
            None => 0.0,
        };
        if limit_bytes < min_bytes {
            return reject(format!(
                "invalid {component} memory configuration, memory limit must be larger than \
                 MemoryOffHeapMin, memory limit: {} bytes, memoryOffHeapMin: {} bytes",
                limit_bytes as i64, min_bytes as i64
            ));
        }
    }
    Ok(())
}

fn validate_job(job: &JobSpec) -> Result<(), ValidationError> {
    if job.jar_file.is_none() && job.python_file.is_none() && job.python_module.is_none() {
        return reject("job jarFile or pythonFile or pythonModule is unspecified");
    }
    if let Some(parallelism) = job.parallelism {
        if parallelism < 1 {
            return reject("job parallelism must not be less than 1");
        }
    }
    if let Some(interval) = job.auto_savepoint_seconds {
        if interval < 1 {
            return reject("job autoSavepointSeconds must not be less than 1");
        }
        if job.savepoints_dir.is_none() {
            return reject("job autoSavepointSeconds requires spec.job.savepointsDir");
        }
    }
    validate_meta_keys("spec.job.podLabels", &job.pod_labels)?;
    validate_meta_keys("spec.job.podAnnotations", &job.pod_annotations)?;
    Ok(())
}

fn validate_gcp_config(gcp: &GcpConfig) -> Result<(), ValidationError> {
    if let Some(service_account) = &gcp.service_account {
        if service_account.secret_name.is_empty() {
            return reject("GCP service account secret name is unspecified");
        }
        if service_account.key_file.is_empty() {
            return reject("GCP service account key file is unspecified");
        }
        // The mount path must be a directory, not the key file itself.
        if service_account
            .mount_path
            .ends_with(&service_account.key_file)
        {
            return reject("invalid GCP service account volume mount path");
        }
    }
    Ok(())
}

fn validate_hadoop_config(hadoop: &HadoopConfig) -> Result<(), ValidationError> {
    if hadoop.config_map_name.is_empty() {
        return reject("hadoop configMapName is unspecified");
    }
    if hadoop.mount_path.is_empty() {
        return reject("hadoop mountPath is unspecified");
    }
    Ok(())
}

/// Label and annotation keys follow Kubernetes qualified-name rules;
/// the name part is limited to 63 characters.
fn validate_meta_keys(
    field_path: &str,
    entries: &std::collections::BTreeMap<String, String>,
) -> Result<(), ValidationError> {
    for key in entries.keys() {
        let name_part = key.rsplit('/').next().unwrap_or(key);
        if name_part.len() > MAX_LABEL_NAME_LENGTH {
            return reject(format!(
                "{field_path}: Invalid value: \"{key}\": name part must be no more than \
                 63 characters"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::{
        AccessScope, CleanupAction, CleanupPolicy, ControlStatus, DeploymentType,
        FlinkClusterComponentsStatus, FlinkClusterSpec, FlinkClusterStatus, GcpServiceAccount,
        ImageSpec, JobManagerPorts, JobMode, JobRestartPolicy, JobState, TaskManagerPorts,
    };

    const MAX_STATE_AGE_TO_RESTORE: i32 = 60;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    // Mutable shared clock for tests that move time forward.
    struct SettableClock(Mutex<DateTime<Utc>>);

    impl Clock for SettableClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 1, 12, 0, 0).unwrap()
    }

    fn default_resources() -> ResourceRequirements {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("200m".to_string()));
        requests.insert("memory".to_string(), Quantity("512Mi".to_string()));
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity("2".to_string()));
        limits.insert("memory".to_string(), Quantity("2Gi".to_string()));
        ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..ResourceRequirements::default()
        }
    }

    fn simple_cluster() -> FlinkCluster {
        let spec = FlinkClusterSpec {
            flink_version: "1.8".to_string(),
            image: ImageSpec {
                name: "flink:1.8.1".to_string(),
                pull_policy: Some("Always".to_string()),
                ..ImageSpec::default()
            },
            job_manager: JobManagerSpec {
                replicas: Some(crate::DEFAULT_JOB_MANAGER_REPLICAS),
                access_scope: AccessScope::Vpc,
                ports: JobManagerPorts {
                    rpc: Some(8001),
                    blob: Some(8002),
                    query: Some(8003),
                    ui: Some(8004),
                },
                memory_off_heap_ratio: Some(25),
                memory_off_heap_min: Some(Quantity("600M".to_string())),
                resources: default_resources(),
                ..JobManagerSpec::default()
            },
            task_manager: TaskManagerSpec {
                replicas: Some(crate::DEFAULT_TASK_MANAGER_REPLICAS),
                ports: TaskManagerPorts {
                    rpc: Some(8001),
                    data: Some(8005),
                    query: Some(8003),
                },
                memory_off_heap_ratio: Some(25),
                memory_off_heap_min: Some(Quantity("600M".to_string())),
                resources: default_resources(),
                ..TaskManagerSpec::default()
            },
            job: Some(JobSpec {
                jar_file: Some("gs://my-bucket/myjob.jar".to_string()),
                parallelism: Some(2),
                max_state_age_to_restore_seconds: Some(MAX_STATE_AGE_TO_RESTORE),
                restart_policy: Some(JobRestartPolicy::FromSavepointOnFailure),
                savepoints_dir: Some("/savepoint_dir".to_string()),
                cleanup_policy: Some(CleanupPolicy {
                    after_job_succeeds: CleanupAction::KeepCluster,
                    after_job_fails: CleanupAction::DeleteTaskManager,
                    after_job_cancelled: None,
                }),
                mode: Some(JobMode::Detached),
                ..JobSpec::default()
            }),
            ..FlinkClusterSpec::default()
        };
        let mut cluster = FlinkCluster::new("mycluster", spec);
        cluster.metadata.namespace = Some("default".to_string());
        cluster
    }

    fn with_annotation(mut cluster: FlinkCluster, value: &str) -> FlinkCluster {
        cluster
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CONTROL_ANNOTATION.to_string(), value.to_string());
        cluster
    }

    fn running_job_status(savepoint_age_seconds: i64) -> JobStatus {
        JobStatus {
            state: JobState::Running,
            savepoint_time: Some((now() - Duration::seconds(savepoint_age_seconds)).to_rfc3339()),
            savepoint_location: Some("gs://my-bucket/my-sp-123".to_string()),
            ..JobStatus::default()
        }
    }

    fn set_job_status(cluster: &mut FlinkCluster, job: JobStatus) {
        cluster.status = Some(FlinkClusterStatus {
            components: FlinkClusterComponentsStatus {
                job: Some(job),
                ..FlinkClusterComponentsStatus::default()
            },
            ..FlinkClusterStatus::default()
        });
    }

    #[test]
    fn create_valid_cluster() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut cluster = simple_cluster();
        cluster.spec.gcp_config = Some(GcpConfig {
            service_account: Some(GcpServiceAccount {
                secret_name: "gcp-service-account-secret".to_string(),
                key_file: "gcp_service_account_key.json".to_string(),
                mount_path: "/etc/gcp_service_account".to_string(),
            }),
        });
        cluster.spec.hadoop_config = Some(HadoopConfig {
            config_map_name: "hadoop-configmap".to_string(),
            mount_path: "/etc/hadoop/conf".to_string(),
        });
        assert!(validator.validate_create(&cluster).is_ok());
    }

    #[test]
    fn create_valid_session_cluster() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut cluster = simple_cluster();
        cluster.spec.job = None;
        assert!(validator.validate_create(&cluster).is_ok());
    }

    #[test]
    fn create_missing_jobmanager_resources() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut cluster = simple_cluster();
        cluster.spec.job_manager.resources = ResourceRequirements::default();
        cluster.spec.job_manager.memory_off_heap_min = None;
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "jobmanager resource requests/limits are unspecified"
        );
    }

    #[test]
    fn create_taskmanager_memory_below_off_heap_min() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut cluster = simple_cluster();
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity("1".to_string()));
        limits.insert("memory".to_string(), Quantity("500M".to_string()));
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("1".to_string()));
        requests.insert("memory".to_string(), Quantity("500M".to_string()));
        cluster.spec.task_manager.resources = ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..ResourceRequirements::default()
        };
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid taskmanager memory configuration, memory limit must be larger than \
             MemoryOffHeapMin, memory limit: 500000000 bytes, memoryOffHeapMin: 600000000 bytes"
        );
    }

    #[test]
    fn create_job_without_source() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut cluster = simple_cluster();
        cluster.spec.job = Some(JobSpec {
            restart_policy: Some(JobRestartPolicy::FromSavepointOnFailure),
            max_state_age_to_restore_seconds: Some(300),
            ..JobSpec::default()
        });
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "job jarFile or pythonFile or pythonModule is unspecified"
        );
    }

    #[test]
    fn status_only_update_is_allowed() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let old = simple_cluster();
        let mut new = simple_cluster();
        new.status = Some(FlinkClusterStatus {
            state: crate::ClusterState::Running,
            ..FlinkClusterStatus::default()
        });
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn noop_update_is_allowed() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let cluster = simple_cluster();
        assert!(validator.validate_update(&cluster, &cluster).is_ok());
    }

    #[test]
    fn savepoint_generation_must_increment_by_one() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                savepoint_generation: 2,
                ..JobStatus::default()
            },
        );

        let mut new = simple_cluster();
        new.spec.job.as_mut().unwrap().savepoint_generation = 4;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            "you can only update savepointGeneration to 3"
        );

        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.savepoint_generation = 3;
            job.jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
        }
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            "you cannot update savepointGeneration with others at the same time"
        );

        let mut new = simple_cluster();
        new.spec.job.as_mut().unwrap().savepoint_generation = 3;
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn savepoints_dir_removal_is_rejected_before_generation_checks() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                savepoint_generation: 2,
                ..JobStatus::default()
            },
        );

        // A valid generation bump combined with removing savepointsDir
        // fails on the savepointsDir rule, the earlier condition.
        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.savepoint_generation = 3;
            job.savepoints_dir = None;
        }
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(err.to_string(), "removing savepointsDir is not allowed");
    }

    #[test]
    fn deployment_type_cannot_change() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        old.spec.task_manager.deployment_type = Some(DeploymentType::StatefulSet);
        let mut new = simple_cluster();
        new.spec.task_manager.deployment_type = Some(DeploymentType::Deployment);
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(err.to_string(), "updating deploymentType is not allowed");
    }

    #[test]
    fn savepoints_dir_cannot_be_removed() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let old = simple_cluster();
        let mut new = simple_cluster();
        new.spec.job.as_mut().unwrap().savepoints_dir = None;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(err.to_string(), "removing savepointsDir is not allowed");
    }

    #[test]
    fn cluster_type_cannot_flip() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let old = simple_cluster();
        let mut new = simple_cluster();
        new.spec.job = None;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("you cannot change cluster type between session cluster and job cluster"));
    }

    #[test]
    fn job_update_requires_savepoints_dir() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        old.spec.job.as_mut().unwrap().savepoints_dir = None;
        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.savepoints_dir = None;
            job.jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
        }
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            "updating job is not allowed when spec.job.savepointsDir was not provided"
        );
    }

    #[test]
    fn update_with_stale_savepoint_and_skipped_savepoint_is_rejected() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            running_job_status((MAX_STATE_AGE_TO_RESTORE + 10) as i64),
        );
        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
            job.take_savepoint_on_update = Some(false);
        }
        let err = validator.validate_update(&old, &new).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with(
            "cannot update spec: taking savepoint is skipped but no up-to-date savepoint"
        ));
        assert!(message.contains("spec.job.takeSavepointOnUpdate: false"));
        assert!(message.contains("spec.job.maxStateAgeToRestoreSeconds: 60"));
    }

    #[test]
    fn update_with_fresh_savepoint_and_skipped_savepoint_is_allowed() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            running_job_status((MAX_STATE_AGE_TO_RESTORE - 10) as i64),
        );
        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
            job.take_savepoint_on_update = Some(false);
        }
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn update_allowed_when_savepoint_will_be_taken() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Running,
                final_savepoint: false,
                savepoint_location: Some("gs://my-bucket/my-sp-123".to_string()),
                ..JobStatus::default()
            },
        );
        let mut new = simple_cluster();
        new.spec.job.as_mut().unwrap().jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn update_of_stopped_job_checks_age_against_completion_time() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let completion_time = now();

        // Stale relative to completion: rejected.
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Failed,
                savepoint_time: Some(
                    (completion_time - Duration::seconds((MAX_STATE_AGE_TO_RESTORE + 10) as i64))
                        .to_rfc3339(),
                ),
                savepoint_location: Some("gs://my-bucket/my-sp-123".to_string()),
                completion_time: Some(completion_time.to_rfc3339()),
                ..JobStatus::default()
            },
        );
        let mut new = simple_cluster();
        new.spec.job.as_mut().unwrap().jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert!(err
            .to_string()
            .contains("spec.job.takeSavepointOnUpdate: nil"));

        // Fresh relative to completion: allowed.
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Failed,
                savepoint_time: Some(
                    (completion_time - Duration::seconds((MAX_STATE_AGE_TO_RESTORE - 10) as i64))
                        .to_rfc3339(),
                ),
                savepoint_location: Some("gs://my-bucket/my-sp-123".to_string()),
                completion_time: Some(completion_time.to_rfc3339()),
                ..JobStatus::default()
            },
        );
        assert!(validator.validate_update(&old, &new).is_ok());

        // Stale, but an explicit fromSavepoint is provided: allowed.
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Failed,
                savepoint_time: Some(
                    (completion_time - Duration::seconds((MAX_STATE_AGE_TO_RESTORE + 10) as i64))
                        .to_rfc3339(),
                ),
                savepoint_location: Some("gs://my-bucket/my-sp-123".to_string()),
                completion_time: Some(completion_time.to_rfc3339()),
                ..JobStatus::default()
            },
        );
        new.spec.job.as_mut().unwrap().from_savepoint = Some("gs://my-bucket/sp-123".to_string());
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn update_of_unrelated_fields_is_allowed() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let old = simple_cluster();

        let mut new = simple_cluster();
        new.spec.image = ImageSpec {
            name: "flink:1.9.3".to_string(),
            pull_policy: Some("IfNotPresent".to_string()),
            ..ImageSpec::default()
        };
        assert!(validator.validate_update(&old, &new).is_ok());

        let mut new = simple_cluster();
        new.spec.job_manager.memory_off_heap_ratio = Some(20);
        assert!(validator.validate_update(&old, &new).is_ok());

        let mut new = simple_cluster();
        new.spec.task_manager.replicas = Some(5);
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn gcp_mount_path_must_not_name_the_key_file() {
        let gcp = GcpConfig {
            service_account: Some(GcpServiceAccount {
                secret_name: "my-secret".to_string(),
                key_file: "my_service_account.json".to_string(),
                mount_path: "/etc/gcp/my_service_account.json".to_string(),
            }),
        };
        let err = validate_gcp_config(&gcp).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid GCP service account volume mount path"
        );
    }

    #[test]
    fn user_control_savepoint_preconditions() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let new = with_annotation(simple_cluster(), "savepoint");

        // Control in progress.
        let mut old = simple_cluster();
        old.status = Some(FlinkClusterStatus {
            control: Some(ControlStatus {
                name: UserControl::Savepoint,
                state: ControlState::InProgress,
                details: None,
                update_time: None,
            }),
            ..FlinkClusterStatus::default()
        });
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "change is not allowed for control in progress, annotation: {CONTROL_ANNOTATION}"
            )
        );

        // Session cluster.
        let mut old = simple_cluster();
        old.spec.job = None;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "savepoint is not allowed for session cluster, annotation: {CONTROL_ANNOTATION}"
            )
        );

        // Missing savepointsDir.
        let mut old = simple_cluster();
        old.spec.job.as_mut().unwrap().savepoints_dir = None;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "savepoint is not allowed without spec.job.savepointsDir, annotation: {CONTROL_ANNOTATION}"
            )
        );

        // Job not started.
        let old = simple_cluster();
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "savepoint is not allowed because job is not started yet or already stopped, \
                 annotation: {CONTROL_ANNOTATION}"
            )
        );

        // Job already stopped.
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Succeeded,
                ..JobStatus::default()
            },
        );
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "savepoint is not allowed because job is not started yet or already stopped, \
                 annotation: {CONTROL_ANNOTATION}"
            )
        );

        // Running job: allowed.
        let mut old = simple_cluster();
        set_job_status(&mut old, running_job_status(0));
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn user_control_job_cancel_preconditions() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let new = with_annotation(simple_cluster(), "job-cancel");

        let mut old = simple_cluster();
        old.spec.job = None;
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "job-cancel is not allowed for session cluster, annotation: {CONTROL_ANNOTATION}"
            )
        );

        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            JobStatus {
                state: JobState::Succeeded,
                completion_time: Some(now().to_rfc3339()),
                ..JobStatus::default()
            },
        );
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "job-cancel is not allowed because job is not started yet or already terminated, \
                 annotation: {CONTROL_ANNOTATION}"
            )
        );

        let mut old = simple_cluster();
        set_job_status(&mut old, running_job_status(0));
        assert!(validator.validate_update(&old, &new).is_ok());
    }

    #[test]
    fn user_control_invalid_value() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let old = simple_cluster();
        let new = with_annotation(simple_cluster(), "cancel");
        let err = validator.validate_update(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "invalid value for annotation key: {CONTROL_ANNOTATION}, value: cancel, \
                 available values: savepoint, job-cancel"
            )
        );
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);

        let mut cluster = simple_cluster();
        cluster.spec.job_manager.extra_ports = vec![NamedPort {
            name: "rpc".to_string(),
            container_port: 9001,
        }];
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate port name rpc in jobmanager, each port name of ports and extraPorts \
             must be unique"
        );

        let mut cluster = simple_cluster();
        cluster.spec.job_manager.extra_ports = vec![
            NamedPort {
                name: "monitoring".to_string(),
                container_port: 9249,
            },
            NamedPort {
                name: "monitoring".to_string(),
                container_port: 9259,
            },
        ];
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate port name monitoring in jobmanager, each port name of ports and \
             extraPorts must be unique"
        );

        let mut cluster = simple_cluster();
        cluster.spec.job_manager.extra_ports = vec![NamedPort {
            name: "rpc2".to_string(),
            container_port: 8001,
        }];
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate containerPort 8001 in jobmanager, each port number of ports and \
             extraPorts must be unique"
        );

        let mut cluster = simple_cluster();
        cluster.spec.job_manager.extra_ports = vec![
            NamedPort {
                name: "monitoring".to_string(),
                container_port: 9249,
            },
            NamedPort {
                name: "prometheus".to_string(),
                container_port: 9249,
            },
        ];
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicate containerPort 9249 in jobmanager, each port number of ports and \
             extraPorts must be unique"
        );
    }

    #[test]
    fn meta_key_name_parts_are_length_limited() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);
        let long_name = "a".repeat(254);

        let mut cluster = simple_cluster();
        cluster
            .spec
            .job_manager
            .pod_annotations
            .insert(long_name.clone(), "bar".to_string());
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "spec.jobManager.podAnnotations: Invalid value: \"{long_name}\": name part \
                 must be no more than 63 characters"
            )
        );

        let mut cluster = simple_cluster();
        cluster
            .spec
            .task_manager
            .pod_labels
            .insert(long_name.clone(), "bar".to_string());
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "spec.taskManager.podLabels: Invalid value: \"{long_name}\": name part \
                 must be no more than 63 characters"
            )
        );

        // Keys with a prefix are measured on the name part only.
        let mut cluster = simple_cluster();
        cluster
            .spec
            .job
            .as_mut()
            .unwrap()
            .pod_labels
            .insert("example.com/team".to_string(), "bar".to_string());
        assert!(validator.validate_create(&cluster).is_ok());
    }

    #[test]
    fn cluster_name_rules() {
        let clock = FixedClock(now());
        let validator = Validator::new(&clock);

        let mut cluster = simple_cluster();
        cluster.metadata.name = Some("1-invalid-name".to_string());
        let err = validator.validate_create(&cluster).unwrap_err();
        assert!(err.to_string().contains("DNS-1035"));

        let mut cluster = simple_cluster();
        cluster.metadata.name = Some("a".repeat(254));
        let err = validator.validate_create(&cluster).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cluster name size needs to greater than 0 and less than 50"
        );
    }

    #[test]
    fn savepoint_freshness_follows_injected_clock() {
        let clock = SettableClock(Mutex::new(now()));
        let mut old = simple_cluster();
        set_job_status(
            &mut old,
            running_job_status((MAX_STATE_AGE_TO_RESTORE - 5) as i64),
        );
        let mut new = simple_cluster();
        {
            let job = new.spec.job.as_mut().unwrap();
            job.jar_file = Some("gs://my-bucket/myjob-v2.jar".to_string());
            job.take_savepoint_on_update = Some(false);
        }

        {
            let validator = Validator::new(&clock);
            assert!(validator.validate_update(&old, &new).is_ok());
        }

        // The same savepoint goes stale once the clock moves on.
        *clock.0.lock().unwrap() = now() + Duration::seconds(30);
        {
            let validator = Validator::new(&clock);
            assert!(validator.validate_update(&old, &new).is_err());
        }
    }
}
