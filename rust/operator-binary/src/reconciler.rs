//! The reconciliation state machine.
//!
//! [`plan`] derives the single next corrective action from the observed
//! and desired state; it is a pure function with no hidden state, so
//! the whole machine is unit-testable on fixed observations. The
//! [`Executor`] then performs that one action and hands control back to
//! the host runtime with a requeue hint. No action is ever applied
//! twice without an intervening re-observation.
//!
//! Phase order (first match wins): teardown on deletion, user-control
//! processing, declaratively requested savepoints, the rollout drain,
//! resource synchronisation, job submission and outcome handling,
//! steady state.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Service},
    networking::v1::Ingress,
    policy::v1::PodDisruptionBudget,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{EventType, Reporter};
use kube::{Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

use flink_crd::{
    ControlState, FlinkCluster, JobSpec, SavepointReason, SavepointState, UserControl,
    REVISION_HASH_ANNOTATION,
};

use crate::event::{self, reasons};
use crate::flink::{self, FlinkApi};
use crate::model::{only_scaling_changed, Desired, DesiredState};
use crate::observer::ObservedState;

const FIELD_MANAGER: &str = "flink-operator";

/// Base delay for job restarts, doubled per recorded restart.
const RESTART_BACKOFF_BASE_SECONDS: i64 = 10;
const RESTART_BACKOFF_MAX_SECONDS: i64 = 300;

const SHORT_REQUEUE: StdDuration = StdDuration::from_secs(3);
const PROGRESS_REQUEUE: StdDuration = StdDuration::from_secs(10);
const POLL_REQUEUE: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to apply {kind} {name}"))]
    ApplyResource {
        kind: &'static str,
        name: String,
        source: kube::Error,
    },

    #[snafu(display("failed to delete {kind} {name}"))]
    DeleteResource {
        kind: &'static str,
        name: String,
        source: kube::Error,
    },

    #[snafu(display("failed to delete persistent volume claims"))]
    DeletePvcs { source: kube::Error },

    #[snafu(display("failed to create submitter job {name}"))]
    CreateSubmitterJob { name: String, source: kube::Error },

    #[snafu(display("failed to patch cluster status"))]
    PatchStatus { source: kube::Error },

    #[snafu(display("failed to stop job {job_id}"))]
    StopJob {
        job_id: String,
        source: flink::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Workload kinds the reconciler deletes by name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkloadKind {
    ConfigMap,
    StatefulSet,
    Deployment,
    Service,
    Ingress,
    PodDisruptionBudget,
    HorizontalPodAutoscaler,
    Job,
}

impl WorkloadKind {
    fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::ConfigMap => "ConfigMap",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Service => "Service",
            WorkloadKind::Ingress => "Ingress",
            WorkloadKind::PodDisruptionBudget => "PodDisruptionBudget",
            WorkloadKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            WorkloadKind::Job => "Job",
        }
    }
}

/// A typed object the reconciler applies with server-side apply.
#[derive(Clone, Debug)]
pub enum OwnedResource {
    ConfigMap(ConfigMap),
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    PodDisruptionBudget(PodDisruptionBudget),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
}

impl OwnedResource {
    pub fn kind(&self) -> &'static str {
        match self {
            OwnedResource::ConfigMap(_) => "ConfigMap",
            OwnedResource::StatefulSet(_) => "StatefulSet",
            OwnedResource::Deployment(_) => "Deployment",
            OwnedResource::Service(_) => "Service",
            OwnedResource::Ingress(_) => "Ingress",
            OwnedResource::PodDisruptionBudget(_) => "PodDisruptionBudget",
            OwnedResource::HorizontalPodAutoscaler(_) => "HorizontalPodAutoscaler",
        }
    }

    pub fn name(&self) -> String {
        match self {
            OwnedResource::ConfigMap(object) => object.name_any(),
            OwnedResource::StatefulSet(object) => object.name_any(),
            OwnedResource::Deployment(object) => object.name_any(),
            OwnedResource::Service(object) => object.name_any(),
            OwnedResource::Ingress(object) => object.name_any(),
            OwnedResource::PodDisruptionBudget(object) => object.name_any(),
            OwnedResource::HorizontalPodAutoscaler(object) => object.name_any(),
        }
    }
}

/// The bounded set of corrective actions; one per reconcile.
#[derive(Clone, Debug)]
pub enum Action {
    NoOp {
        requeue_after: Option<StdDuration>,
    },
    Apply {
        resource: Box<OwnedResource>,
        created: bool,
    },
    Delete {
        kind: WorkloadKind,
        name: String,
    },
    /// Delete PVCs left behind by StatefulSets; the final teardown step.
    DeletePvcs,
    MarkControlInProgress(UserControl),
    TriggerSavepoint {
        job_id: String,
        directory: String,
        reason: SavepointReason,
        cancel_job: bool,
    },
    StopJob {
        job_id: String,
    },
    SubmitJob {
        job: Box<Job>,
        resubmit: bool,
    },
}

impl Action {
    fn noop(requeue_after: Option<StdDuration>) -> Action {
        Action::NoOp { requeue_after }
    }

    /// The teardown is finished once the last step ran.
    pub fn completes_teardown(&self) -> bool {
        matches!(self, Action::DeletePvcs)
    }
}

/// Compute the single next action for this observation.
pub fn plan(observed: &ObservedState, desired: &DesiredState) -> Action {
    if observed.is_deleting() {
        return plan_teardown(observed);
    }
    if let Some(action) = plan_control(observed) {
        return action;
    }
    if let Some(action) = plan_requested_savepoints(observed) {
        return action;
    }
    if observed.is_updating() {
        if let Some(action) = plan_drain(observed) {
            return action;
        }
    }
    if let Some(action) = plan_sync(observed, desired) {
        return action;
    }
    if let Some(action) = plan_job(observed, desired) {
        return action;
    }
    plan_steady(observed)
}

fn job_status(observed: &ObservedState) -> Option<&flink_crd::JobStatus> {
    observed.recorded_job_status()
}

fn savepoint_status(observed: &ObservedState) -> Option<&flink_crd::SavepointStatus> {
    observed
        .cluster
        .status
        .as_ref()
        .and_then(|status| status.savepoint.as_ref())
}

fn savepoint_in_progress(observed: &ObservedState) -> bool {
    savepoint_status(observed)
        .map(|savepoint| savepoint.state == SavepointState::InProgress)
        .unwrap_or(false)
}

fn savepoints_dir(observed: &ObservedState) -> Option<&str> {
    observed
        .cluster
        .spec
        .job
        .as_ref()
        .and_then(|job| job.savepoints_dir.as_deref())
}

/// A recorded savepoint young enough to restore from.
fn savepoint_is_fresh(job_spec: &JobSpec, job: &flink_crd::JobStatus, now: DateTime<Utc>) -> bool {
    if job.savepoint_location.is_none() {
        return false;
    }
    let Some(savepoint_time) = job
        .savepoint_time
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|time| time.with_timezone(&Utc))
    else {
        return false;
    };
    let max_age = Duration::seconds(job_spec.max_state_age_to_restore_seconds() as i64);
    now - savepoint_time <= max_age
}

/// Graceful teardown: final savepoint, stop the job, delete workloads,
/// then the PVCs the StatefulSets left behind.
fn plan_teardown(observed: &ObservedState) -> Action {
    if let Some(job) = job_status(observed) {
        if job.state.is_active() {
            if let Some(job_id) = job.id.as_deref() {
                if savepoint_in_progress(observed) {
                    return Action::noop(Some(PROGRESS_REQUEUE));
                }
                if let Some(directory) = savepoints_dir(observed) {
                    if !job.final_savepoint {
                        return Action::TriggerSavepoint {
                            job_id: job_id.to_string(),
                            directory: directory.to_string(),
                            reason: SavepointReason::JobCancel,
                            cancel_job: true,
                        };
                    }
                }
                return Action::StopJob {
                    job_id: job_id.to_string(),
                };
            }
        }
    }

    let cluster = &observed.cluster;
    let doomed: [(WorkloadKind, String, bool); 10] = [
        (
            WorkloadKind::Job,
            cluster.submitter_job_name(),
            observed.submitter_job.is_some(),
        ),
        (
            WorkloadKind::HorizontalPodAutoscaler,
            cluster.autoscaler_name(),
            observed.horizontal_pod_autoscaler.is_some(),
        ),
        (
            WorkloadKind::PodDisruptionBudget,
            cluster.pod_disruption_budget_name(),
            observed.pod_disruption_budget.is_some(),
        ),
        (
            WorkloadKind::Ingress,
            cluster.job_manager_ingress_name(),
            observed.jm_ingress.is_some(),
        ),
        (
            WorkloadKind::StatefulSet,
            cluster.task_manager_name(),
            observed.tm_stateful_set.is_some(),
        ),
        (
            WorkloadKind::Deployment,
            cluster.task_manager_name(),
            observed.tm_deployment.is_some(),
        ),
        (
            WorkloadKind::Service,
            cluster.task_manager_service_name(),
            observed.tm_service.is_some(),
        ),
        (
            WorkloadKind::StatefulSet,
            cluster.job_manager_stateful_set_name(),
            observed.jm_stateful_set.is_some(),
        ),
        (
            WorkloadKind::Service,
            cluster.job_manager_service_name(),
            observed.jm_service.is_some(),
        ),
        (
            WorkloadKind::ConfigMap,
            cluster.config_map_name(),
            observed.config_map.is_some(),
        ),
    ];
    for (kind, name, present) in doomed {
        if present {
            return Action::Delete { kind, name };
        }
    }

    Action::DeletePvcs
}

/// Drive a requested user control to in-progress and issue its action.
fn plan_control(observed: &ObservedState) -> Option<Action> {
    let control = observed
        .cluster
        .status
        .as_ref()
        .and_then(|status| status.control.as_ref())?;

    match control.state {
        ControlState::Requested => Some(Action::MarkControlInProgress(control.name)),
        ControlState::InProgress => match control.name {
            UserControl::Savepoint => {
                let job = job_status(observed)?;
                let job_id = job.id.as_deref()?;
                match savepoint_status(observed) {
                    Some(savepoint)
                        if savepoint.trigger_reason == SavepointReason::UserRequested =>
                    {
                        // In flight or resolving; the status updater
                        // finishes the control.
                        Some(Action::noop(Some(PROGRESS_REQUEUE)))
                    }
                    _ => {
                        let directory = savepoints_dir(observed)?;
                        Some(Action::TriggerSavepoint {
                            job_id: job_id.to_string(),
                            directory: directory.to_string(),
                            reason: SavepointReason::UserRequested,
                            cancel_job: false,
                        })
                    }
                }
            }
            UserControl::JobCancel => {
                let job = job_status(observed)?;
                if job.state.is_stopped() {
                    return Some(Action::noop(Some(SHORT_REQUEUE)));
                }
                let job_id = job.id.as_deref()?;
                if savepoint_in_progress(observed) {
                    return Some(Action::noop(Some(PROGRESS_REQUEUE)));
                }
                match savepoints_dir(observed) {
                    Some(directory) if !job.final_savepoint => Some(Action::TriggerSavepoint {
                        job_id: job_id.to_string(),
                        directory: directory.to_string(),
                        reason: SavepointReason::JobCancel,
                        cancel_job: true,
                    }),
                    _ => Some(Action::StopJob {
                        job_id: job_id.to_string(),
                    }),
                }
            }
        },
        // Terminal controls wait for the user to clear the annotation.
        ControlState::Succeeded | ControlState::Failed => None,
    }
}

/// Savepoints requested declaratively: a `savepointGeneration` bump or
/// the periodic `autoSavepointSeconds` schedule.
fn plan_requested_savepoints(observed: &ObservedState) -> Option<Action> {
    let job_spec = observed.cluster.spec.job.as_ref()?;
    let job = job_status(observed)?;
    if !job.state.is_active() || savepoint_in_progress(observed) {
        return None;
    }
    let job_id = job.id.as_deref()?;
    let directory = job_spec.savepoints_dir.as_deref()?;

    if job_spec.savepoint_generation > job.savepoint_generation {
        return Some(Action::TriggerSavepoint {
            job_id: job_id.to_string(),
            directory: directory.to_string(),
            reason: SavepointReason::Generation,
            cancel_job: false,
        });
    }

    if let Some(interval) = job_spec.auto_savepoint_seconds {
        let last = job
            .savepoint_time
            .as_deref()
            .or(job.start_time.as_deref())
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|time| time.with_timezone(&Utc));
        if let Some(last) = last {
            if observed.observe_time - last >= Duration::seconds(interval as i64) {
                return Some(Action::TriggerSavepoint {
                    job_id: job_id.to_string(),
                    directory: directory.to_string(),
                    reason: SavepointReason::Scheduled,
                    cancel_job: false,
                });
            }
        }
    }

    None
}

/// The drain protocol: obtain a usable savepoint, then stop the job,
/// before any workload of the old revision is touched.
fn plan_drain(observed: &ObservedState) -> Option<Action> {
    let job = job_status(observed)?;
    if !job.state.is_active() {
        // Job already stopped cleanly; the sync phase rolls out the
        // next revision.
        return None;
    }

    // Scaling-only changes are applied in place without a drain.
    if let (Some(current), Some(next)) = (&observed.current_revision, &observed.next_revision) {
        if only_scaling_changed(&current.spec, &next.spec) {
            return None;
        }
    }

    let job_id = job.id.as_deref()?;
    let job_spec = observed.cluster.spec.job.as_ref()?;

    if job.final_savepoint {
        // The update savepoint completed; stop on it.
        return Some(Action::StopJob {
            job_id: job_id.to_string(),
        });
    }

    match savepoint_status(observed) {
        Some(savepoint) if savepoint.state == SavepointState::InProgress => {
            Some(Action::noop(Some(PROGRESS_REQUEUE)))
        }
        Some(savepoint)
            if savepoint.trigger_reason == SavepointReason::Update
                && matches!(
                    savepoint.state,
                    SavepointState::Failed | SavepointState::TriggerFailed
                ) =>
        {
            // Savepoint failed: fall back to a recent one, otherwise
            // hold the rollout rather than lose state.
            if savepoint_is_fresh(job_spec, job, observed.observe_time) {
                Some(Action::StopJob {
                    job_id: job_id.to_string(),
                })
            } else {
                Some(Action::noop(Some(POLL_REQUEUE)))
            }
        }
        _ => {
            if job_spec.take_savepoint_on_update() {
                if let Some(directory) = job_spec.savepoints_dir.as_deref() {
                    return Some(Action::TriggerSavepoint {
                        job_id: job_id.to_string(),
                        directory: directory.to_string(),
                        reason: SavepointReason::Update,
                        cancel_job: false,
                    });
                }
            }
            if savepoint_is_fresh(job_spec, job, observed.observe_time) {
                Some(Action::StopJob {
                    job_id: job_id.to_string(),
                })
            } else if job_spec.savepoints_dir.is_none() {
                // No savepoint support configured at all; stop as-is.
                Some(Action::StopJob {
                    job_id: job_id.to_string(),
                })
            } else {
                Some(Action::noop(Some(POLL_REQUEUE)))
            }
        }
    }
}

fn revision_hash(metadata: &kube::api::ObjectMeta) -> Option<&str> {
    metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(REVISION_HASH_ANNOTATION))
        .map(String::as_str)
}

fn hash_differs<L, R>(desired: &L, observed: &R) -> bool
where
    L: kube::Resource,
    R: kube::Resource,
{
    match (
        revision_hash(desired.meta()),
        revision_hash(observed.meta()),
    ) {
        (Some(wanted), Some(actual)) => wanted != actual,
        (Some(_), None) => true,
        _ => false,
    }
}

fn scale_only_update(observed: &ObservedState) -> bool {
    match (&observed.current_revision, &observed.next_revision) {
        (Some(current), Some(next)) => only_scaling_changed(&current.spec, &next.spec),
        _ => false,
    }
}

/// Synchronise the owned infrastructure objects with the desired set:
/// create what is missing, delete what must not exist, replace or
/// update what drifted.
fn plan_sync(observed: &ObservedState, desired: &DesiredState) -> Option<Action> {
    let scale_only = scale_only_update(observed);

    // Apply-in-place resources.
    if let Some(action) = sync_apply(&desired.config_map, &observed.config_map, |cm| {
        OwnedResource::ConfigMap(cm.clone())
    }) {
        return Some(action);
    }
    if let Some(action) = sync_apply(&desired.jm_service, &observed.jm_service, |svc| {
        OwnedResource::Service(svc.clone())
    }) {
        return Some(action);
    }
    if let Some(action) = sync_apply(&desired.jm_ingress, &observed.jm_ingress, |ingress| {
        OwnedResource::Ingress(ingress.clone())
    }) {
        return Some(action);
    }
    if let Some(action) = sync_apply(&desired.tm_service, &observed.tm_service, |svc| {
        OwnedResource::Service(svc.clone())
    }) {
        return Some(action);
    }
    if let Some(action) = sync_apply(
        &desired.pod_disruption_budget,
        &observed.pod_disruption_budget,
        |pdb| OwnedResource::PodDisruptionBudget(pdb.clone()),
    ) {
        return Some(action);
    }
    if let Some(action) = sync_apply(
        &desired.horizontal_pod_autoscaler,
        &observed.horizontal_pod_autoscaler,
        |hpa| OwnedResource::HorizontalPodAutoscaler(hpa.clone()),
    ) {
        return Some(action);
    }

    // Workloads are replaced on revision change (after the drain) and
    // scaled in place otherwise.
    if let Some(action) = sync_workload(
        &desired.jm_stateful_set,
        &observed.jm_stateful_set,
        WorkloadKind::StatefulSet,
        scale_only,
        |sts| OwnedResource::StatefulSet(sts.clone()),
        stateful_set_replicas_differ,
    ) {
        return Some(action);
    }
    if let Some(action) = sync_workload(
        &desired.tm_stateful_set,
        &observed.tm_stateful_set,
        WorkloadKind::StatefulSet,
        scale_only,
        |sts| OwnedResource::StatefulSet(sts.clone()),
        stateful_set_replicas_differ,
    ) {
        return Some(action);
    }
    if let Some(action) = sync_workload(
        &desired.tm_deployment,
        &observed.tm_deployment,
        WorkloadKind::Deployment,
        scale_only,
        |deployment| OwnedResource::Deployment(deployment.clone()),
        deployment_replicas_differ,
    ) {
        return Some(action);
    }

    None
}

fn stateful_set_replicas_differ(desired: &StatefulSet, observed: &StatefulSet) -> bool {
    let wanted = desired.spec.as_ref().and_then(|spec| spec.replicas);
    let actual = observed.spec.as_ref().and_then(|spec| spec.replicas);
    wanted != actual
}

fn deployment_replicas_differ(desired: &Deployment, observed: &Deployment) -> bool {
    let wanted = desired.spec.as_ref().and_then(|spec| spec.replicas);
    let actual = observed.spec.as_ref().and_then(|spec| spec.replicas);
    wanted != actual
}

fn sync_apply<T>(
    desired: &Desired<T>,
    observed: &Option<T>,
    wrap: impl Fn(&T) -> OwnedResource,
) -> Option<Action>
where
    T: kube::Resource + Clone,
{
    match (desired, observed) {
        (Desired::Present(wanted), None) => Some(Action::Apply {
            resource: Box::new(wrap(wanted)),
            created: true,
        }),
        (Desired::Absent, Some(actual)) => Some(Action::Delete {
            kind: kind_of(&wrap(actual)),
            name: actual.meta().name.clone().unwrap_or_default(),
        }),
        (Desired::Present(wanted), Some(actual)) if hash_differs(wanted, actual) => {
            Some(Action::Apply {
                resource: Box::new(wrap(wanted)),
                created: false,
            })
        }
        _ => None,
    }
}

fn kind_of(resource: &OwnedResource) -> WorkloadKind {
    match resource {
        OwnedResource::ConfigMap(_) => WorkloadKind::ConfigMap,
        OwnedResource::StatefulSet(_) => WorkloadKind::StatefulSet,
        OwnedResource::Deployment(_) => WorkloadKind::Deployment,
        OwnedResource::Service(_) => WorkloadKind::Service,
        OwnedResource::Ingress(_) => WorkloadKind::Ingress,
        OwnedResource::PodDisruptionBudget(_) => WorkloadKind::PodDisruptionBudget,
        OwnedResource::HorizontalPodAutoscaler(_) => WorkloadKind::HorizontalPodAutoscaler,
    }
}

fn sync_workload<T>(
    desired: &Desired<T>,
    observed: &Option<T>,
    kind: WorkloadKind,
    scale_only: bool,
    wrap: impl Fn(&T) -> OwnedResource,
    replicas_differ: impl Fn(&T, &T) -> bool,
) -> Option<Action>
where
    T: kube::Resource + Clone,
{
    match (desired, observed) {
        (Desired::Present(wanted), None) => Some(Action::Apply {
            resource: Box::new(wrap(wanted)),
            created: true,
        }),
        (Desired::Absent, Some(actual)) => Some(Action::Delete {
            kind,
            name: actual.meta().name.clone().unwrap_or_default(),
        }),
        (Desired::Present(wanted), Some(actual)) => {
            if hash_differs(wanted, actual) {
                if scale_only {
                    Some(Action::Apply {
                        resource: Box::new(wrap(wanted)),
                        created: false,
                    })
                } else {
                    // Replace: delete now, recreate on the next pass.
                    Some(Action::Delete {
                        kind,
                        name: actual.meta().name.clone().unwrap_or_default(),
                    })
                }
            } else if replicas_differ(wanted, actual) {
                Some(Action::Apply {
                    resource: Box::new(wrap(wanted)),
                    created: false,
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Submit, resubmit or remove the submitter job.
fn plan_job(observed: &ObservedState, desired: &DesiredState) -> Option<Action> {
    match (&desired.job, &observed.submitter_job) {
        (Desired::Absent, Some(submitter)) => Some(Action::Delete {
            kind: WorkloadKind::Job,
            name: submitter.name_any(),
        }),
        (Desired::Present(wanted), None) => {
            if !observed.infrastructure_ready() {
                return Some(Action::noop(Some(PROGRESS_REQUEUE)));
            }
            if let Some(job) = job_status(observed) {
                if job.state.is_stopped() {
                    let job_spec = observed.cluster.spec.job.as_ref()?;
                    if !job.should_restart(job_spec.restart_policy) {
                        return None;
                    }
                    // Restart with exponential backoff keyed off the
                    // recorded restart count.
                    if let Some(wait) = restart_backoff_remaining(observed, job) {
                        return Some(Action::noop(Some(wait)));
                    }
                    return Some(Action::SubmitJob {
                        job: Box::new(wanted.clone()),
                        resubmit: true,
                    });
                }
                if job.state.is_active() {
                    // The engine still runs the job; nothing to submit.
                    return None;
                }
            }
            Some(Action::SubmitJob {
                job: Box::new(wanted.clone()),
                resubmit: false,
            })
        }
        (Desired::Present(wanted), Some(submitter)) => {
            if hash_differs(wanted, submitter) {
                let drained = job_status(observed)
                    .map(|job| job.state.is_stopped())
                    .unwrap_or(true);
                if drained {
                    return Some(Action::Delete {
                        kind: WorkloadKind::Job,
                        name: submitter.name_any(),
                    });
                }
            }
            // Resubmission after failure replaces the finished
            // submitter object first.
            if let Some(job) = job_status(observed) {
                let job_spec = observed.cluster.spec.job.as_ref()?;
                if job.should_restart(job_spec.restart_policy) {
                    if let Some(wait) = restart_backoff_remaining(observed, job) {
                        return Some(Action::noop(Some(wait)));
                    }
                    return Some(Action::Delete {
                        kind: WorkloadKind::Job,
                        name: submitter.name_any(),
                    });
                }
            }
            None
        }
        _ => None,
    }
}

/// Remaining wait before the next restart attempt, if any.
fn restart_backoff_remaining(
    observed: &ObservedState,
    job: &flink_crd::JobStatus,
) -> Option<StdDuration> {
    let completion_time = job
        .completion_time
        .as_deref()
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|time| time.with_timezone(&Utc))?;
    let exponent = job.restart_count.clamp(0, 10) as u32;
    let backoff_seconds =
        (RESTART_BACKOFF_BASE_SECONDS << exponent).min(RESTART_BACKOFF_MAX_SECONDS);
    let ready_at = completion_time + Duration::seconds(backoff_seconds);
    if observed.observe_time >= ready_at {
        return None;
    }
    let remaining = (ready_at - observed.observe_time).num_seconds().max(1);
    Some(StdDuration::from_secs(remaining as u64))
}

fn plan_steady(observed: &ObservedState) -> Action {
    let polling = job_status(observed)
        .map(|job| job.state.is_active() || job.state.is_pending())
        .unwrap_or(false)
        || savepoint_in_progress(observed);
    if polling {
        Action::noop(Some(POLL_REQUEUE))
    } else {
        Action::noop(None)
    }
}

/// Performs exactly one planned action.
pub struct Executor<'a> {
    pub client: &'a Client,
    pub flink: &'a dyn FlinkApi,
    pub reporter: &'a Reporter,
}

impl<'a> Executor<'a> {
    /// Execute the action; returns the requeue hint for the host.
    pub async fn act(
        &self,
        observed: &ObservedState,
        action: Action,
    ) -> Result<Option<StdDuration>> {
        let cluster = &observed.cluster;
        let namespace = cluster.namespace().ok_or(Error::NoNamespace)?;

        match action {
            Action::NoOp { requeue_after } => Ok(requeue_after),

            Action::Apply { resource, created } => {
                self.apply(&namespace, *resource, created, cluster).await?;
                Ok(Some(SHORT_REQUEUE))
            }

            Action::Delete { kind, name } => {
                self.delete(&namespace, kind, &name, cluster).await?;
                Ok(Some(SHORT_REQUEUE))
            }

            Action::DeletePvcs => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), &namespace);
                let selector = format!(
                    "app.kubernetes.io/name=flink,app.kubernetes.io/instance={}",
                    cluster.name_any()
                );
                api.delete_collection(
                    &DeleteParams::default(),
                    &ListParams::default().labels(&selector),
                )
                .await
                .context(DeletePvcsSnafu)?;
                info!(cluster = %cluster.name_any(), "deleted persistent volume claims");
                Ok(None)
            }

            Action::MarkControlInProgress(name) => {
                // Clear any stale savepoint status so the control is
                // resolved by its own trigger only.
                let patch = serde_json::json!({
                    "status": {
                        "control": {
                            "name": name,
                            "state": ControlState::InProgress,
                            "updateTime": observed.observe_time.to_rfc3339(),
                        },
                        "savepoint": null,
                    }
                });
                self.patch_status(&namespace, cluster, &patch).await?;
                event::publish(
                    self.client,
                    self.reporter,
                    cluster,
                    EventType::Normal,
                    reasons::CONTROL_REQUESTED,
                    format!("User control {name} in progress"),
                )
                .await;
                Ok(Some(SHORT_REQUEUE))
            }

            Action::TriggerSavepoint {
                job_id,
                directory,
                reason,
                cancel_job,
            } => {
                let endpoint = cluster.job_manager_endpoint();
                match self
                    .flink
                    .trigger_savepoint(&endpoint, &job_id, &directory, cancel_job)
                    .await
                {
                    Ok(trigger_id) => {
                        let patch = serde_json::json!({
                            "status": {
                                "savepoint": {
                                    "triggerId": trigger_id,
                                    "triggerTime": observed.observe_time.to_rfc3339(),
                                    "triggerReason": reason,
                                    "state": SavepointState::InProgress,
                                    "message": null,
                                }
                            }
                        });
                        self.patch_status(&namespace, cluster, &patch).await?;
                        event::publish(
                            self.client,
                            self.reporter,
                            cluster,
                            EventType::Normal,
                            reasons::SAVEPOINT_TRIGGERED,
                            format!("Savepoint triggered for job {job_id} ({reason})"),
                        )
                        .await;
                    }
                    Err(error) => {
                        warn!(%job_id, %error, "failed to trigger savepoint");
                        let patch = serde_json::json!({
                            "status": {
                                "savepoint": {
                                    "triggerId": null,
                                    "triggerTime": observed.observe_time.to_rfc3339(),
                                    "triggerReason": reason,
                                    "state": SavepointState::TriggerFailed,
                                    "message": error.to_string(),
                                }
                            }
                        });
                        self.patch_status(&namespace, cluster, &patch).await?;
                        event::publish(
                            self.client,
                            self.reporter,
                            cluster,
                            EventType::Warning,
                            reasons::SAVEPOINT_FAILED,
                            format!("Savepoint trigger failed for job {job_id}"),
                        )
                        .await;
                    }
                }
                Ok(Some(PROGRESS_REQUEUE))
            }

            Action::StopJob { job_id } => {
                let endpoint = cluster.job_manager_endpoint();
                self.flink
                    .stop_job(&endpoint, &job_id)
                    .await
                    .map_err(|source| Error::StopJob {
                        job_id: job_id.clone(),
                        source,
                    })?;
                info!(cluster = %cluster.name_any(), %job_id, "job cancellation requested");
                Ok(Some(PROGRESS_REQUEUE))
            }

            Action::SubmitJob { job, resubmit } => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
                let name = job.name_any();
                match api.create(&PostParams::default(), &job).await {
                    Ok(_) => {}
                    // A concurrent pass created it; re-observe.
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        return Ok(Some(SHORT_REQUEUE));
                    }
                    Err(source) => {
                        return Err(Error::CreateSubmitterJob { name, source });
                    }
                }
                if resubmit {
                    let restart_count = job_status(observed)
                        .map(|job| job.restart_count + 1)
                        .unwrap_or(1);
                    let patch = serde_json::json!({
                        "status": {
                            "components": {
                                "job": {
                                    "state": flink_crd::JobState::Deploying,
                                    "restartCount": restart_count,
                                    "completionTime": null,
                                }
                            }
                        }
                    });
                    self.patch_status(&namespace, cluster, &patch).await?;
                }
                event::publish(
                    self.client,
                    self.reporter,
                    cluster,
                    EventType::Normal,
                    reasons::JOB_SUBMITTED,
                    format!("Submitter job {name} created"),
                )
                .await;
                Ok(Some(PROGRESS_REQUEUE))
            }
        }
    }

    async fn apply(
        &self,
        namespace: &str,
        resource: OwnedResource,
        created: bool,
        cluster: &FlinkCluster,
    ) -> Result<()> {
        let kind = resource.kind();
        let name = resource.name();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        match &resource {
            OwnedResource::ConfigMap(object) => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::StatefulSet(object) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::Deployment(object) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::Service(object) => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::Ingress(object) => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::PodDisruptionBudget(object) => {
                let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
            OwnedResource::HorizontalPodAutoscaler(object) => {
                let api: Api<HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), namespace);
                api.patch(&name, &params, &Patch::Apply(object))
                    .await
                    .map(|_| ())
            }
        }
        .map_err(|source| Error::ApplyResource {
            kind,
            name: name.clone(),
            source,
        })?;

        info!(cluster = %cluster.name_any(), kind, %name, created, "applied workload object");
        if created {
            event::publish(
                self.client,
                self.reporter,
                cluster,
                EventType::Normal,
                reasons::CREATED_WORKLOAD,
                format!("Created {kind} {name}"),
            )
            .await;
        }
        Ok(())
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        cluster: &FlinkCluster,
    ) -> Result<()> {
        let params = DeleteParams::default();
        let result = match kind {
            WorkloadKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::Ingress => {
                let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::PodDisruptionBudget => {
                let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::HorizontalPodAutoscaler => {
                let api: Api<HorizontalPodAutoscaler> =
                    Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
            WorkloadKind::Job => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &params).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => {}
            // Already gone; the next observation settles it.
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
            Err(source) => {
                return Err(Error::DeleteResource {
                    kind: kind.as_str(),
                    name: name.to_string(),
                    source,
                });
            }
        }

        info!(cluster = %cluster.name_any(), kind = kind.as_str(), %name, "deleted workload object");
        event::publish(
            self.client,
            self.reporter,
            cluster,
            EventType::Normal,
            reasons::DELETED_WORKLOAD,
            format!("Deleted {} {name}", kind.as_str()),
        )
        .await;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        cluster: &FlinkCluster,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<FlinkCluster> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(patch),
        )
        .await
        .context(PatchStatusSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flink_crd::{
        CleanupAction, CleanupPolicy, ControlStatus, FlinkClusterComponentsStatus,
        FlinkClusterSpec, FlinkClusterStatus, JobRestartPolicy, JobState, JobStatus,
        SavepointStatus,
    };

    use super::*;
    use crate::history::Revision;
    use crate::model::build_desired;

    fn job_cluster() -> FlinkCluster {
        let mut cluster = FlinkCluster::new(
            "mycluster",
            FlinkClusterSpec {
                flink_version: "1.12".to_string(),
                job: Some(JobSpec {
                    jar_file: Some("gs://bucket/job.jar".to_string()),
                    savepoints_dir: Some("gs://bucket/savepoints".to_string()),
                    restart_policy: Some(JobRestartPolicy::FromSavepointOnFailure),
                    max_state_age_to_restore_seconds: Some(300),
                    cleanup_policy: Some(CleanupPolicy {
                        after_job_succeeds: CleanupAction::KeepCluster,
                        after_job_fails: CleanupAction::DeleteTaskManager,
                        after_job_cancelled: None,
                    }),
                    ..JobSpec::default()
                }),
                ..FlinkClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.uid = Some("uid-1".to_string());
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
            observe_time: Utc::now(),
        }
    }

    fn running_job(id: &str) -> JobStatus {
        JobStatus {
            id: Some(id.to_string()),
            state: JobState::Running,
            ..JobStatus::default()
        }
    }

    fn set_status(cluster: &mut FlinkCluster, status: FlinkClusterStatus) {
        cluster.status = Some(status);
    }

    fn revision(name: &str, number: i64, spec: &FlinkClusterSpec) -> Revision {
        Revision {
            name: name.to_string(),
            number,
            hash: flink_crd::spec_revision_hash(spec),
            spec: spec.clone(),
        }
    }

    fn updating_observed(job_state: JobState) -> ObservedState {
        let mut cluster = job_cluster();
        let current_spec = cluster.spec.clone();
        let mut next_spec = cluster.spec.clone();
        next_spec.image.name = "flink:1.13.0".to_string();
        cluster.spec = next_spec.clone();
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(JobStatus {
                        id: Some("jid-1".to_string()),
                        state: job_state,
                        ..JobStatus::default()
                    }),
                    ..FlinkClusterComponentsStatus::default()
                },
                ..FlinkClusterStatus::default()
            },
        );
        let mut state = observed(cluster);
        state.current_revision = Some(revision("mycluster-r1", 1, &current_spec));
        state.next_revision = Some(revision("mycluster-r2", 2, &next_spec));
        state
    }

    #[test]
    fn fresh_cluster_creates_config_map_first() {
        let state = observed(job_cluster());
        let desired = build_desired(&state);
        let action = plan(&state, &desired);
        match action {
            Action::Apply { resource, created } => {
                assert!(created);
                assert_eq!(resource.kind(), "ConfigMap");
            }
            other => panic!("expected ConfigMap creation, got {other:?}"),
        }
    }

    #[test]
    fn plan_is_a_function_of_its_inputs() {
        let state = observed(job_cluster());
        let desired = build_desired(&state);
        let first = format!("{:?}", plan(&state, &desired));
        let second = format!("{:?}", plan(&state, &desired));
        assert_eq!(first, second);
    }

    #[test]
    fn rollout_triggers_drain_savepoint_first() {
        let state = updating_observed(JobState::Running);
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::TriggerSavepoint {
                job_id,
                reason,
                cancel_job,
                ..
            } => {
                assert_eq!(job_id, "jid-1");
                assert_eq!(reason, SavepointReason::Update);
                assert!(!cancel_job);
            }
            other => panic!("expected drain savepoint, got {other:?}"),
        }
    }

    #[test]
    fn rollout_waits_while_savepoint_in_progress() {
        let mut state = updating_observed(JobState::Running);
        if let Some(status) = state.cluster.status.as_mut() {
            status.savepoint = Some(SavepointStatus {
                trigger_id: Some("trigger-1".to_string()),
                trigger_time: Some(state.observe_time.to_rfc3339()),
                trigger_reason: SavepointReason::Update,
                state: SavepointState::InProgress,
                message: None,
            });
        }
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::NoOp { requeue_after } => assert!(requeue_after.is_some()),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn rollout_cancels_job_once_savepoint_completed() {
        let mut state = updating_observed(JobState::Running);
        if let Some(status) = state.cluster.status.as_mut() {
            if let Some(job) = status.components.job.as_mut() {
                job.final_savepoint = true;
                job.savepoint_location = Some("gs://bucket/savepoints/sp-1".to_string());
            }
        }
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::StopJob { job_id } => assert_eq!(job_id, "jid-1"),
            other => panic!("expected job cancellation, got {other:?}"),
        }
    }

    #[test]
    fn drain_safety_no_taskmanager_deletion_while_job_runs() {
        // Even with old-revision workloads in place, a running job
        // keeps the reconciler in the drain phase.
        let mut state = updating_observed(JobState::Running);
        let desired = build_desired(&state);
        let current_hash = state.current_revision.as_ref().map(|r| r.hash.clone());
        state.tm_stateful_set = Some(StatefulSet {
            metadata: kube::api::ObjectMeta {
                name: Some("mycluster-taskmanager".to_string()),
                annotations: current_hash.map(|hash| {
                    [(REVISION_HASH_ANNOTATION.to_string(), hash)]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            ..StatefulSet::default()
        });
        match plan(&state, &desired) {
            Action::TriggerSavepoint { .. } | Action::NoOp { .. } => {}
            Action::Delete { kind, name } => {
                panic!("deleted {kind:?} {name} while the job was running")
            }
            _ => {}
        }
    }

    #[test]
    fn rollout_replaces_workloads_after_job_stopped() {
        // Job cancelled, old-revision JobManager still running: the
        // old workload is deleted so the next pass recreates it from
        // the next revision.
        let mut state = updating_observed(JobState::Cancelled);
        let current_hash = state.current_revision.as_ref().map(|r| r.hash.clone());
        state.jm_stateful_set = Some(StatefulSet {
            metadata: kube::api::ObjectMeta {
                name: Some("mycluster-jobmanager".to_string()),
                annotations: current_hash.map(|hash| {
                    [(REVISION_HASH_ANNOTATION.to_string(), hash)]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            ..StatefulSet::default()
        });
        // The config map is applied in place first; delete it from the
        // observation to focus on the workload replacement.
        state.config_map = None;
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::Apply { resource, .. } if resource.kind() == "ConfigMap" => {}
            Action::Delete { kind, name } => {
                assert_eq!(kind, WorkloadKind::StatefulSet);
                assert_eq!(name, "mycluster-jobmanager");
            }
            other => panic!("expected config map apply or statefulset replace, got {other:?}"),
        }
    }

    #[test]
    fn requested_control_is_marked_in_progress() {
        let mut cluster = job_cluster();
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(running_job("jid-1")),
                    ..FlinkClusterComponentsStatus::default()
                },
                control: Some(ControlStatus {
                    name: UserControl::Savepoint,
                    state: ControlState::Requested,
                    details: None,
                    update_time: None,
                }),
                ..FlinkClusterStatus::default()
            },
        );
        let state = observed(cluster);
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::MarkControlInProgress(name) => assert_eq!(name, UserControl::Savepoint),
            other => panic!("expected control transition, got {other:?}"),
        }
    }

    #[test]
    fn in_progress_savepoint_control_triggers_savepoint() {
        let mut cluster = job_cluster();
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(running_job("jid-1")),
                    ..FlinkClusterComponentsStatus::default()
                },
                control: Some(ControlStatus {
                    name: UserControl::Savepoint,
                    state: ControlState::InProgress,
                    details: None,
                    update_time: None,
                }),
                ..FlinkClusterStatus::default()
            },
        );
        let state = observed(cluster);
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::TriggerSavepoint {
                reason, cancel_job, ..
            } => {
                assert_eq!(reason, SavepointReason::UserRequested);
                assert!(!cancel_job);
            }
            other => panic!("expected savepoint trigger, got {other:?}"),
        }
    }

    #[test]
    fn job_cancel_control_takes_final_savepoint() {
        let mut cluster = job_cluster();
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(running_job("jid-1")),
                    ..FlinkClusterComponentsStatus::default()
                },
                control: Some(ControlStatus {
                    name: UserControl::JobCancel,
                    state: ControlState::InProgress,
                    details: None,
                    update_time: None,
                }),
                ..FlinkClusterStatus::default()
            },
        );
        let state = observed(cluster);
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::TriggerSavepoint {
                reason, cancel_job, ..
            } => {
                assert_eq!(reason, SavepointReason::JobCancel);
                assert!(cancel_job);
            }
            other => panic!("expected cancel-with-savepoint, got {other:?}"),
        }
    }

    #[test]
    fn generation_bump_triggers_savepoint() {
        let mut cluster = job_cluster();
        if let Some(job) = cluster.spec.job.as_mut() {
            job.savepoint_generation = 3;
        }
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(JobStatus {
                        savepoint_generation: 2,
                        ..running_job("jid-1")
                    }),
                    ..FlinkClusterComponentsStatus::default()
                },
                ..FlinkClusterStatus::default()
            },
        );
        let state = observed(cluster);
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::TriggerSavepoint { reason, .. } => {
                assert_eq!(reason, SavepointReason::Generation)
            }
            other => panic!("expected generation savepoint, got {other:?}"),
        }
    }

    #[test]
    fn teardown_takes_final_savepoint_before_deleting() {
        let mut cluster = job_cluster();
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(running_job("jid-1")),
                    ..FlinkClusterComponentsStatus::default()
                },
                ..FlinkClusterStatus::default()
            },
        );
        let mut state = observed(cluster);
        state.tm_stateful_set = Some(StatefulSet::default());
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::TriggerSavepoint {
                reason, cancel_job, ..
            } => {
                assert_eq!(reason, SavepointReason::JobCancel);
                assert!(cancel_job);
            }
            other => panic!("expected final savepoint, got {other:?}"),
        }
    }

    #[test]
    fn teardown_deletes_workloads_once_job_stopped() {
        let mut cluster = job_cluster();
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        let mut state = observed(cluster);
        state.tm_stateful_set = Some(StatefulSet {
            metadata: kube::api::ObjectMeta {
                name: Some("mycluster-taskmanager".to_string()),
                ..Default::default()
            },
            ..StatefulSet::default()
        });
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::Delete { kind, name } => {
                assert_eq!(kind, WorkloadKind::StatefulSet);
                assert_eq!(name, "mycluster-taskmanager");
            }
            other => panic!("expected workload deletion, got {other:?}"),
        }
    }

    #[test]
    fn teardown_finishes_with_pvc_cleanup() {
        let mut cluster = job_cluster();
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        let state = observed(cluster);
        let desired = build_desired(&state);
        let action = plan(&state, &desired);
        assert!(action.completes_teardown(), "got {action:?}");
    }

    #[test]
    fn failed_job_restarts_after_backoff() {
        let mut cluster = job_cluster();
        let completion = Utc::now() - Duration::seconds(3600);
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(JobStatus {
                        id: Some("jid-1".to_string()),
                        state: JobState::Failed,
                        restart_count: 1,
                        completion_time: Some(completion.to_rfc3339()),
                        savepoint_location: Some("gs://bucket/savepoints/sp-9".to_string()),
                        savepoint_time: Some(completion.to_rfc3339()),
                        ..JobStatus::default()
                    }),
                    ..FlinkClusterComponentsStatus::default()
                },
                ..FlinkClusterStatus::default()
            },
        );
        let mut state = observed(cluster);
        // Infrastructure is up; only the submitter needs replacing.
        state.config_map = Some(Default::default());
        state.jm_service = Some(Default::default());
        state.tm_service = Some(Default::default());
        state.jm_stateful_set = Some(ready_sts(1));
        state.tm_stateful_set = Some(ready_sts(3));
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::SubmitJob { resubmit, job } => {
                assert!(resubmit);
                let args = job
                    .spec
                    .as_ref()
                    .unwrap()
                    .template
                    .spec
                    .as_ref()
                    .unwrap()
                    .containers[0]
                    .args
                    .clone()
                    .unwrap();
                let position = args
                    .iter()
                    .position(|arg| arg == "--fromSavepoint")
                    .unwrap();
                assert_eq!(args[position + 1], "gs://bucket/savepoints/sp-9");
            }
            other => panic!("expected resubmission, got {other:?}"),
        }
    }

    #[test]
    fn failed_job_waits_out_the_backoff() {
        let mut cluster = job_cluster();
        let completion = Utc::now() - Duration::seconds(2);
        set_status(
            &mut cluster,
            FlinkClusterStatus {
                components: FlinkClusterComponentsStatus {
                    job: Some(JobStatus {
                        id: Some("jid-1".to_string()),
                        state: JobState::Failed,
                        restart_count: 3,
                        completion_time: Some(completion.to_rfc3339()),
                        savepoint_location: Some("gs://bucket/savepoints/sp-9".to_string()),
                        ..JobStatus::default()
                    }),
                    ..FlinkClusterComponentsStatus::default()
                },
                ..FlinkClusterStatus::default()
            },
        );
        let mut state = observed(cluster);
        state.config_map = Some(Default::default());
        state.jm_service = Some(Default::default());
        state.tm_service = Some(Default::default());
        state.jm_stateful_set = Some(ready_sts(1));
        state.tm_stateful_set = Some(ready_sts(3));
        let desired = build_desired(&state);
        match plan(&state, &desired) {
            Action::NoOp { requeue_after } => assert!(requeue_after.is_some()),
            other => panic!("expected backoff wait, got {other:?}"),
        }
    }

    fn ready_sts(replicas: i32) -> StatefulSet {
        use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
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
    fn session_cluster_never_submits_a_job() {
        let mut cluster = job_cluster();
        cluster.spec.job = None;
        let mut state = observed(cluster);
        state.config_map = Some(Default::default());
        state.jm_service = Some(Default::default());
        state.jm_stateful_set = Some(ready_sts(1));
        state.tm_stateful_set = Some(ready_sts(3));
        state.tm_service = Some(Default::default());
        let desired = build_desired(&state);
        assert!(!desired.job.is_present());
        match plan(&state, &desired) {
            Action::NoOp { .. } | Action::Apply { .. } => {}
            other => panic!("unexpected action for session cluster: {other:?}"),
        }
    }
}
