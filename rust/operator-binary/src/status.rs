//! Status derivation and the status barrier.
//!
//! The declared status is a pure function of the observation. When the
//! derived status differs from the persisted one, the new status is
//! committed and the reconcile stops with a short requeue instead of
//! proceeding to workload mutation: actions are only ever taken once
//! the persisted status reflects what was observed.

use chrono::{DateTime, Duration, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{EventType, Reporter};
use kube::{Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::info;

use flink_crd::{
    ClusterState, ComponentState, ControlState, ControlStatus, FlinkCluster,
    FlinkClusterComponentsStatus, FlinkClusterStatus, JobState, JobStatus, RevisionStatus,
    SavepointReason, SavepointState, UserControl,
};

use crate::event::{self, reasons};
use crate::observer::ObservedState;

/// A savepoint trigger that has not completed within this window is
/// considered failed.
pub const SAVEPOINT_TIMEOUT_SECONDS: i64 = 900;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to patch cluster status"))]
    PatchStatus { source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn workload_state(present: bool, ready: bool, deleting: bool) -> ComponentState {
    if present {
        if ready {
            ComponentState::Ready
        } else {
            ComponentState::NotReady
        }
    } else if deleting {
        ComponentState::Deleted
    } else {
        ComponentState::NotReady
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// Derive the declared status from the observation alone.
pub fn derive_status(observed: &ObservedState) -> FlinkClusterStatus {
    let cluster = &observed.cluster;
    let old = cluster.status.clone().unwrap_or_default();
    let deleting = observed.is_deleting();

    let components = FlinkClusterComponentsStatus {
        config_map: Some(workload_state(
            observed.config_map.is_some(),
            true,
            deleting,
        )),
        job_manager_stateful_set: Some(workload_state(
            observed.jm_stateful_set.is_some(),
            observed.jm_ready(),
            deleting,
        )),
        job_manager_service: Some(workload_state(
            observed.jm_service.is_some(),
            true,
            deleting,
        )),
        job_manager_ingress: observed
            .jm_ingress
            .as_ref()
            .map(|_| ComponentState::Ready)
            .or_else(|| old.components.job_manager_ingress),
        task_manager: Some(workload_state(
            observed.tm_stateful_set.is_some() || observed.tm_deployment.is_some(),
            observed.tm_ready(),
            deleting,
        )),
        job: derive_job_status(observed, &old),
    };

    let (savepoint, components) = progress_savepoint(observed, &old, components);
    let control = progress_control(observed, &old, &savepoint, components.job.as_ref());

    let revision = RevisionStatus {
        current_revision: observed
            .current_revision
            .as_ref()
            .map(|revision| revision.name.clone()),
        next_revision: observed
            .next_revision
            .as_ref()
            .map(|revision| revision.name.clone()),
        collision_count: old.revision.collision_count,
    };

    let state = derive_cluster_state(observed, &components, &control);

    FlinkClusterStatus {
        state,
        components,
        control,
        savepoint,
        revision,
        last_update_time: old.last_update_time,
    }
}

fn derive_job_status(observed: &ObservedState, old: &FlinkClusterStatus) -> Option<JobStatus> {
    let cluster = &observed.cluster;
    cluster.spec.job.as_ref()?;

    let mut job = old.components.job.clone().unwrap_or_default();

    if let Some(flink_job) = &observed.flink_job {
        job.id = Some(flink_job.id.clone());
        job.name = Some(flink_job.name.clone());
        if job.start_time.is_none() {
            job.start_time =
                DateTime::from_timestamp_millis(flink_job.start_time).map(|time| time.to_rfc3339());
        }
        let new_state = crate::observer::job_state_from_flink(&flink_job.state);
        if new_state.is_stopped() && !job.state.is_stopped() {
            job.completion_time = DateTime::from_timestamp_millis(flink_job.end_time)
                .filter(|_| flink_job.end_time > 0)
                .map(|time| time.to_rfc3339())
                .or_else(|| Some(observed.observe_time.to_rfc3339()));
        }
        job.state = new_state;
    } else if observed.flink_reachable && job.state.is_active() {
        // The engine no longer knows the job the status says is running.
        job.state = JobState::Lost;
        job.completion_time
            .get_or_insert_with(|| observed.observe_time.to_rfc3339());
    } else if !observed.flink_reachable && observed.jm_ready() && job.state.is_active() {
        job.state = JobState::Unknown;
    } else if let Some(submitter) = &observed.submitter_job {
        let status = submitter.status.clone().unwrap_or_default();
        if status.failed.unwrap_or(0) > 0 && !job.state.is_stopped() {
            job.state = JobState::Failed;
            job.completion_time
                .get_or_insert_with(|| observed.observe_time.to_rfc3339());
        } else if job.state == JobState::Pending || job.state == JobState::Unknown {
            job.state = JobState::Deploying;
            job.deploy_time
                .get_or_insert_with(|| observed.observe_time.to_rfc3339());
        }
    }

    Some(job)
}

/// Drive the savepoint status machine from the observed trigger
/// progress, folding a completed savepoint into the job status.
fn progress_savepoint(
    observed: &ObservedState,
    old: &FlinkClusterStatus,
    mut components: FlinkClusterComponentsStatus,
) -> (
    Option<flink_crd::SavepointStatus>,
    FlinkClusterComponentsStatus,
) {
    let mut savepoint = old.savepoint.clone();

    if let Some(current) = savepoint.as_mut() {
        if current.state == SavepointState::InProgress {
            let progress = observed
                .savepoint_progress
                .as_ref()
                .filter(|progress| Some(&progress.trigger_id) == current.trigger_id.as_ref());

            if let Some(progress) = progress {
                if let Some(failure) = &progress.failure {
                    current.state = SavepointState::Failed;
                    current.message = Some(failure.clone());
                } else if progress.completed {
                    if let Some(location) = &progress.location {
                        current.state = SavepointState::Succeeded;
                        current.message = None;
                        if let Some(job) = components.job.as_mut() {
                            job.savepoint_location = Some(location.clone());
                            job.savepoint_time = Some(observed.observe_time.to_rfc3339());
                            job.final_savepoint = matches!(
                                current.trigger_reason,
                                SavepointReason::Update | SavepointReason::JobCancel
                            );
                            if current.trigger_reason == SavepointReason::Generation {
                                job.savepoint_generation = observed
                                    .cluster
                                    .spec
                                    .job
                                    .as_ref()
                                    .map(|spec| spec.savepoint_generation)
                                    .unwrap_or(job.savepoint_generation + 1);
                            }
                        }
                    } else {
                        current.state = SavepointState::Failed;
                        current.message = Some("savepoint completed without location".to_string());
                    }
                }
            } else if let Some(trigger_time) =
                current.trigger_time.as_deref().and_then(parse_timestamp)
            {
                if observed.observe_time - trigger_time
                    > Duration::seconds(SAVEPOINT_TIMEOUT_SECONDS)
                {
                    current.state = SavepointState::Failed;
                    current.message = Some("savepoint timed out".to_string());
                }
            }
        }
    }

    (savepoint, components)
}

/// Record requested controls and resolve in-flight ones.
fn progress_control(
    observed: &ObservedState,
    old: &FlinkClusterStatus,
    savepoint: &Option<flink_crd::SavepointStatus>,
    job: Option<&JobStatus>,
) -> Option<ControlStatus> {
    let mut control = old.control.clone();

    if let Some(pending) = observed.pending_control {
        control = Some(ControlStatus {
            name: pending,
            state: ControlState::Requested,
            details: None,
            update_time: Some(observed.observe_time.to_rfc3339()),
        });
        return control;
    }

    if let Some(current) = control.as_mut() {
        if current.state == ControlState::InProgress {
            let resolved = match current.name {
                UserControl::Savepoint => match savepoint
                    .as_ref()
                    .filter(|sp| sp.trigger_reason == SavepointReason::UserRequested)
                    .map(|sp| sp.state)
                {
                    Some(SavepointState::Succeeded) => Some((ControlState::Succeeded, None)),
                    Some(SavepointState::Failed) | Some(SavepointState::TriggerFailed) => Some((
                        ControlState::Failed,
                        savepoint.as_ref().and_then(|sp| sp.message.clone()),
                    )),
                    _ => None,
                },
                UserControl::JobCancel => {
                    let stopped = job.map(|job| job.state.is_stopped()).unwrap_or(false);
                    stopped.then_some((ControlState::Succeeded, None))
                }
            };
            if let Some((state, details)) = resolved {
                current.state = state;
                current.details = details;
                current.update_time = Some(observed.observe_time.to_rfc3339());
            }
        }
    }

    control
}

fn derive_cluster_state(
    observed: &ObservedState,
    components: &FlinkClusterComponentsStatus,
    control: &Option<ControlStatus>,
) -> ClusterState {
    if observed.is_deleting() {
        return ClusterState::Stopping;
    }
    if observed.is_updating() {
        return ClusterState::Updating;
    }
    if control
        .as_ref()
        .map(|control| {
            control.name == UserControl::JobCancel && control.state == ControlState::InProgress
        })
        .unwrap_or(false)
    {
        return ClusterState::Stopping;
    }

    let infrastructure_ready = observed.infrastructure_ready();
    if let Some(job) = &components.job {
        let restart_policy = observed
            .cluster
            .spec
            .job
            .as_ref()
            .and_then(|spec| spec.restart_policy);
        if job.state.is_stopped() && !job.should_restart(restart_policy) {
            return match job.state {
                JobState::Failed | JobState::Lost => ClusterState::Failed,
                _ if infrastructure_ready => ClusterState::Running,
                _ => ClusterState::Stopped,
            };
        }
    }

    if infrastructure_ready {
        ClusterState::Running
    } else {
        ClusterState::Creating
    }
}

/// Commit the derived status when it differs from the persisted one.
/// Returns true when a write happened (the caller then requeues).
pub async fn update_status_if_changed(
    client: &Client,
    reporter: &Reporter,
    observed: &ObservedState,
) -> Result<bool> {
    let derived = derive_status(observed);
    let old = observed.cluster.status.clone().unwrap_or_default();

    if derived == old {
        return Ok(false);
    }

    let mut new_status = derived;
    new_status.last_update_time = Some(observed.observe_time.to_rfc3339());

    let namespace = observed.cluster.namespace().ok_or(Error::NoNamespace)?;
    let api: Api<FlinkCluster> = Api::namespaced(client.clone(), &namespace);
    let patch = serde_json::json!({ "status": &new_status });
    api.patch_status(
        &observed.cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .context(PatchStatusSnafu)?;

    info!(
        cluster = %observed.cluster.name_any(),
        old_state = %old.state,
        new_state = %new_status.state,
        "cluster status updated"
    );
    event::publish(
        client,
        reporter,
        &observed.cluster,
        EventType::Normal,
        reasons::STATUS_UPDATE,
        format!("Cluster status: {} -> {}", old.state, new_status.state),
    )
    .await;
    emit_transition_events(client, reporter, observed, &old, &new_status).await;

    Ok(true)
}

/// Events for the transitions a status commit surfaced.
async fn emit_transition_events(
    client: &Client,
    reporter: &Reporter,
    observed: &ObservedState,
    old: &FlinkClusterStatus,
    new: &FlinkClusterStatus,
) {
    let cluster = &observed.cluster;

    let old_job_state = old.components.job.as_ref().map(|job| job.state);
    if let Some(job) = &new.components.job {
        if Some(job.state) != old_job_state {
            let job_name = job.id.as_deref().unwrap_or("unknown");
            match job.state {
                JobState::Succeeded => {
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Normal,
                        reasons::JOB_SUCCEEDED,
                        format!("Job {job_name} finished successfully"),
                    )
                    .await;
                }
                JobState::Failed | JobState::Lost => {
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Warning,
                        reasons::JOB_FAILED,
                        format!("Job {job_name} failed"),
                    )
                    .await;
                }
                _ => {}
            }
        }
    }

    let old_savepoint_state = old.savepoint.as_ref().map(|savepoint| savepoint.state);
    if let Some(savepoint) = &new.savepoint {
        if Some(savepoint.state) != old_savepoint_state {
            match savepoint.state {
                SavepointState::Succeeded => {
                    let location = new
                        .components
                        .job
                        .as_ref()
                        .and_then(|job| job.savepoint_location.as_deref())
                        .unwrap_or("unknown");
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Normal,
                        reasons::SAVEPOINT_COMPLETED,
                        format!("Savepoint completed at {location}"),
                    )
                    .await;
                }
                SavepointState::Failed | SavepointState::TriggerFailed => {
                    let message = savepoint.message.as_deref().unwrap_or("savepoint failed");
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Warning,
                        reasons::SAVEPOINT_FAILED,
                        message.to_string(),
                    )
                    .await;
                    if observed.is_updating() {
                        event::publish(
                            client,
                            reporter,
                            cluster,
                            EventType::Warning,
                            reasons::UPDATE_BLOCKED,
                            "Rollout is waiting: no usable savepoint to drain the job",
                        )
                        .await;
                    }
                }
                _ => {}
            }
        }
    }

    let old_control_state = old.control.as_ref().map(|control| control.state);
    if let Some(control) = &new.control {
        if Some(control.state) != old_control_state {
            match control.state {
                ControlState::Succeeded => {
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Normal,
                        reasons::CONTROL_SUCCEEDED,
                        format!("User control {} succeeded", control.name),
                    )
                    .await;
                }
                ControlState::Failed => {
                    event::publish(
                        client,
                        reporter,
                        cluster,
                        EventType::Warning,
                        reasons::CONTROL_FAILED,
                        format!("User control {} failed", control.name),
                    )
                    .await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};

    use flink_crd::{FlinkClusterSpec, JobSpec, SavepointStatus};

    use super::*;
    use crate::observer::SavepointProgress;

    fn job_cluster() -> FlinkCluster {
        let mut cluster = FlinkCluster::new(
            "mycluster",
            FlinkClusterSpec {
                flink_version: "1.12".to_string(),
                job: Some(JobSpec {
                    jar_file: Some("gs://bucket/job.jar".to_string()),
                    savepoints_dir: Some("gs://bucket/savepoints".to_string()),
                    ..JobSpec::default()
                }),
                ..FlinkClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster
    }

    fn observed(cluster: FlinkCluster) -> ObservedState {
        ObservedState {
            cluster,
            revisions: Vec::new(),
            current_revision: None,
            next_revision: None,
            config_map: None,
            jm_stateful_set: None,
            jm_service: None,
            jm_ingress: None,
            tm_stateful_set: None,
            tm_deployment: None,
            tm_service: None,
            pod_disruption_budget: None,
            horizontal_pod_autoscaler: None,
            submitter_job: None,
            pods: Vec::new(),
            flink_job: None,
            flink_reachable: false,
            savepoint_progress: None,
            pending_control: None,
            observe_time: chrono::Utc::now(),
        }
    }

    fn ready_stateful_set(replicas: i32) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..StatefulSetSpec::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(replicas),
                replicas,
                ..StatefulSetStatus::default()
            }),
            ..StatefulSet::default()
        }
    }

    #[test]
    fn fresh_cluster_is_creating() {
        let status = derive_status(&observed(job_cluster()));
        assert_eq!(status.state, ClusterState::Creating);
        assert_eq!(
            status.components.job_manager_stateful_set,
            Some(ComponentState::NotReady)
        );
    }

    #[test]
    fn ready_components_mean_running() {
        let mut state = observed(job_cluster());
        state.config_map = Some(Default::default());
        state.jm_service = Some(Default::default());
        state.jm_stateful_set = Some(ready_stateful_set(1));
        state.tm_stateful_set = Some(ready_stateful_set(3));
        let status = derive_status(&state);
        assert_eq!(status.state, ClusterState::Running);
        assert_eq!(
            status.components.job_manager_stateful_set,
            Some(ComponentState::Ready)
        );
        assert_eq!(status.components.task_manager, Some(ComponentState::Ready));
    }

    #[test]
    fn flink_job_state_is_mirrored() {
        let mut state = observed(job_cluster());
        state.flink_reachable = true;
        state.flink_job = Some(crate::flink::JobOverview {
            id: "jid-1".to_string(),
            name: "myjob".to_string(),
            state: "RUNNING".to_string(),
            start_time: 1_638_360_000_000,
            end_time: -1,
            last_modification: 0,
        });
        let status = derive_status(&state);
        let job = status.components.job.unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.id.as_deref(), Some("jid-1"));
        assert!(job.start_time.is_some());
    }

    #[test]
    fn job_missing_from_reachable_engine_is_lost() {
        let mut cluster = job_cluster();
        cluster.status = Some(FlinkClusterStatus {
            components: FlinkClusterComponentsStatus {
                job: Some(JobStatus {
                    id: Some("jid-1".to_string()),
                    state: JobState::Running,
                    ..JobStatus::default()
                }),
                ..FlinkClusterComponentsStatus::default()
            },
            ..FlinkClusterStatus::default()
        });
        let mut state = observed(cluster);
        state.flink_reachable = true;
        let status = derive_status(&state);
        let job = status.components.job.unwrap();
        assert_eq!(job.state, JobState::Lost);
        assert!(job.completion_time.is_some());
    }

    #[test]
    fn completed_savepoint_updates_job_and_control() {
        let mut cluster = job_cluster();
        cluster.status = Some(FlinkClusterStatus {
            components: FlinkClusterComponentsStatus {
                job: Some(JobStatus {
                    id: Some("jid-1".to_string()),
                    state: JobState::Running,
                    ..JobStatus::default()
                }),
                ..FlinkClusterComponentsStatus::default()
            },
            control: Some(ControlStatus {
                name: UserControl::Savepoint,
                state: ControlState::InProgress,
                details: None,
                update_time: None,
            }),
            savepoint: Some(SavepointStatus {
                trigger_id: Some("trigger-1".to_string()),
                trigger_time: Some(chrono::Utc::now().to_rfc3339()),
                trigger_reason: SavepointReason::UserRequested,
                state: SavepointState::InProgress,
                message: None,
            }),
            ..FlinkClusterStatus::default()
        });
        let mut state = observed(cluster);
        state.flink_reachable = true;
        state.flink_job = Some(crate::flink::JobOverview {
            id: "jid-1".to_string(),
            name: "myjob".to_string(),
            state: "RUNNING".to_string(),
            start_time: 0,
            end_time: -1,
            last_modification: 0,
        });
        state.savepoint_progress = Some(SavepointProgress {
            trigger_id: "trigger-1".to_string(),
            completed: true,
            location: Some("gs://bucket/savepoints/sp-1".to_string()),
            failure: None,
        });

        let status = derive_status(&state);
        assert_eq!(
            status.savepoint.as_ref().unwrap().state,
            SavepointState::Succeeded
        );
        let job = status.components.job.unwrap();
        assert_eq!(
            job.savepoint_location.as_deref(),
            Some("gs://bucket/savepoints/sp-1")
        );
        assert!(!job.final_savepoint);
        assert_eq!(status.control.unwrap().state, ControlState::Succeeded);
    }

    #[test]
    fn stale_savepoint_trigger_times_out() {
        let mut cluster = job_cluster();
        cluster.status = Some(FlinkClusterStatus {
            savepoint: Some(SavepointStatus {
                trigger_id: Some("trigger-1".to_string()),
                trigger_time: Some(
                    (chrono::Utc::now() - Duration::seconds(SAVEPOINT_TIMEOUT_SECONDS + 60))
                        .to_rfc3339(),
                ),
                trigger_reason: SavepointReason::Update,
                state: SavepointState::InProgress,
                message: None,
            }),
            ..FlinkClusterStatus::default()
        });
        let state = observed(cluster);
        let status = derive_status(&state);
        assert_eq!(status.savepoint.unwrap().state, SavepointState::Failed);
    }

    #[test]
    fn pending_control_is_recorded_as_requested() {
        let mut state = observed(job_cluster());
        state.pending_control = Some(UserControl::Savepoint);
        let status = derive_status(&state);
        let control = status.control.unwrap();
        assert_eq!(control.name, UserControl::Savepoint);
        assert_eq!(control.state, ControlState::Requested);
    }

    #[test]
    fn job_cancel_control_succeeds_once_job_stops() {
        let mut cluster = job_cluster();
        cluster.status = Some(FlinkClusterStatus {
            components: FlinkClusterComponentsStatus {
                job: Some(JobStatus {
                    id: Some("jid-1".to_string()),
                    state: JobState::Running,
                    ..JobStatus::default()
                }),
                ..FlinkClusterComponentsStatus::default()
            },
            control: Some(ControlStatus {
                name: UserControl::JobCancel,
                state: ControlState::InProgress,
                details: None,
                update_time: None,
            }),
            ..FlinkClusterStatus::default()
        });
        let mut state = observed(cluster);
        state.flink_reachable = true;
        state.flink_job = Some(crate::flink::JobOverview {
            id: "jid-1".to_string(),
            name: "myjob".to_string(),
            state: "CANCELED".to_string(),
            start_time: 0,
            end_time: 1_638_360_100_000,
            last_modification: 0,
        });
        let status = derive_status(&state);
        let job = status.components.job.as_ref().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(status.control.unwrap().state, ControlState::Succeeded);
    }

    #[test]
    fn deleting_cluster_is_stopping() {
        let mut cluster = job_cluster();
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let status = derive_status(&observed(cluster));
        assert_eq!(status.state, ClusterState::Stopping);
    }
}
