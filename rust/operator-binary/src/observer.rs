//! Observation of the current cluster state.
//!
//! One reconcile works off exactly one immutable [`ObservedState`]: the
//! owner resource, every owned workload object, the revision history
//! and, when the JobManager is reachable, the live job and savepoint
//! state from the Flink REST API.
//!
//! Optional objects are fetched with `get_opt`: a missing object is
//! `None`, any other failure aborts the reconcile so the host runtime
//! retries with backoff. Flink REST failures are never fatal; they are
//! recorded as an unreachable endpoint.

use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::Job,
    core::v1::{ConfigMap, Pod, Service},
    networking::v1::Ingress,
    policy::v1::PodDisruptionBudget,
};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use flink_crd::{
    spec_revision_hash, FlinkCluster, JobState, SavepointState, UserControl,
    REVISION_HASH_ANNOTATION,
};

use crate::flink::{FlinkApi, JobOverview};
use crate::history::{self, classify, ClusterHistory, Revision, DEFAULT_HISTORY_LIMIT};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to fetch owner FlinkCluster"))]
    GetCluster { source: kube::Error },

    /// The owner resource disappeared between trigger and observation.
    #[snafu(display("owner FlinkCluster is gone"))]
    ClusterGone,

    #[snafu(display("failed to fetch {kind} {name}"))]
    GetWorkload {
        kind: &'static str,
        name: String,
        source: kube::Error,
    },

    #[snafu(display("failed to list cluster pods"))]
    ListPods { source: kube::Error },

    #[snafu(display("failed to sync revision history"))]
    History { source: history::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Progress of the savepoint trigger recorded in status.
#[derive(Clone, Debug, Default)]
pub struct SavepointProgress {
    pub trigger_id: String,
    pub completed: bool,
    pub location: Option<String>,
    pub failure: Option<String>,
}

/// Immutable snapshot of everything one reconcile acts on.
#[derive(Clone, Debug)]
pub struct ObservedState {
    pub cluster: FlinkCluster,
    pub revisions: Vec<Revision>,
    pub current_revision: Option<Revision>,
    pub next_revision: Option<Revision>,
    pub config_map: Option<ConfigMap>,
    pub jm_stateful_set: Option<StatefulSet>,
    pub jm_service: Option<Service>,
    pub jm_ingress: Option<Ingress>,
    pub tm_stateful_set: Option<StatefulSet>,
    pub tm_deployment: Option<Deployment>,
    pub tm_service: Option<Service>,
    pub pod_disruption_budget: Option<PodDisruptionBudget>,
    pub horizontal_pod_autoscaler: Option<HorizontalPodAutoscaler>,
    pub submitter_job: Option<Job>,
    pub pods: Vec<Pod>,
    /// Live job as reported by the JobManager, when reachable.
    pub flink_job: Option<JobOverview>,
    /// False when the JobManager REST endpoint could not be queried.
    pub flink_reachable: bool,
    pub savepoint_progress: Option<SavepointProgress>,
    /// A user-control annotation without a matching control status.
    pub pending_control: Option<UserControl>,
    pub observe_time: DateTime<Utc>,
}

impl ObservedState {
    pub fn is_deleting(&self) -> bool {
        self.cluster.metadata.deletion_timestamp.is_some()
    }

    /// Revision hash the observed JobManager workload was rendered from.
    pub fn workload_revision_hash(&self) -> Option<&str> {
        self.jm_stateful_set
            .as_ref()
            .and_then(|sts| sts.metadata.annotations.as_ref())
            .and_then(|annotations| annotations.get(REVISION_HASH_ANNOTATION))
            .map(String::as_str)
    }

    /// A rollout is in flight when the workloads run an older revision
    /// than the most recently accepted one.
    pub fn is_updating(&self) -> bool {
        match (&self.current_revision, &self.next_revision) {
            (Some(current), Some(next)) => current.name != next.name,
            _ => false,
        }
    }

    pub fn jm_ready(&self) -> bool {
        stateful_set_ready(self.jm_stateful_set.as_ref())
    }

    pub fn tm_ready(&self) -> bool {
        match (&self.tm_stateful_set, &self.tm_deployment) {
            (Some(sts), _) => stateful_set_ready(Some(sts)),
            (None, Some(deployment)) => {
                let desired = deployment
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.replicas)
                    .unwrap_or(0);
                let ready = deployment
                    .status
                    .as_ref()
                    .and_then(|status| status.ready_replicas)
                    .unwrap_or(0);
                desired > 0 && ready >= desired
            }
            (None, None) => false,
        }
    }

    pub fn infrastructure_ready(&self) -> bool {
        self.config_map.is_some() && self.jm_service.is_some() && self.jm_ready() && self.tm_ready()
    }

    /// Job status persisted on the cluster before this observation.
    pub fn recorded_job_status(&self) -> Option<&flink_crd::JobStatus> {
        self.cluster.job_status()
    }
}

fn stateful_set_ready(sts: Option<&StatefulSet>) -> bool {
    let Some(sts) = sts else {
        return false;
    };
    let desired = sts
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0);
    let ready = sts
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    desired > 0 && ready >= desired
}

/// Map a Flink REST job state onto the declared job state.
pub fn job_state_from_flink(state: &str) -> JobState {
    match state {
        "FINISHED" => JobState::Succeeded,
        "FAILED" => JobState::Failed,
        "CANCELED" => JobState::Cancelled,
        _ => JobState::Running,
    }
}

/// A user-control annotation is pending while no control status of the
/// same name exists. Once the status is recorded (in flight or
/// terminal) the annotation stays until the user clears it.
pub fn pending_control(cluster: &FlinkCluster) -> Option<UserControl> {
    let value = cluster.control_annotation()?;
    let control: UserControl = value.parse().ok()?;
    let recorded = cluster
        .status
        .as_ref()
        .and_then(|status| status.control.as_ref());
    match recorded {
        Some(status) if status.name == control => None,
        _ => Some(control),
    }
}

fn select_job(jobs: Vec<JobOverview>, known_id: Option<&str>) -> Option<JobOverview> {
    if let Some(id) = known_id {
        if let Some(job) = jobs.iter().find(|job| job.id == id) {
            return Some(job.clone());
        }
    }
    // Prefer a live job over terminal leftovers, then the most recent.
    jobs.into_iter()
        .max_by_key(|job| (!job.is_terminal(), job.start_time))
}

pub struct Observer<'a> {
    pub client: &'a Client,
    pub flink: &'a dyn FlinkApi,
    pub history: &'a dyn ClusterHistory,
}

impl<'a> Observer<'a> {
    pub async fn observe(
        &self,
        cluster: &FlinkCluster,
        now: DateTime<Utc>,
    ) -> Result<ObservedState> {
        let namespace = cluster.namespace().ok_or(Error::NoNamespace)?;
        let name = cluster.name_any();

        // Re-fetch the owner so the barrier sees the status written by
        // the previous reconcile rather than a stale cache entry.
        let clusters: Api<FlinkCluster> = Api::namespaced(self.client.clone(), &namespace);
        let cluster = clusters
            .get_opt(&name)
            .await
            .context(GetClusterSnafu)?
            .ok_or(Error::ClusterGone)?;

        let config_map = self
            .get_opt::<ConfigMap>(&namespace, &cluster.config_map_name(), "ConfigMap")
            .await?;
        let jm_stateful_set = self
            .get_opt::<StatefulSet>(
                &namespace,
                &cluster.job_manager_stateful_set_name(),
                "StatefulSet",
            )
            .await?;
        let jm_service = self
            .get_opt::<Service>(&namespace, &cluster.job_manager_service_name(), "Service")
            .await?;
        let jm_ingress = self
            .get_opt::<Ingress>(&namespace, &cluster.job_manager_ingress_name(), "Ingress")
            .await?;
        let tm_stateful_set = self
            .get_opt::<StatefulSet>(&namespace, &cluster.task_manager_name(), "StatefulSet")
            .await?;
        let tm_deployment = self
            .get_opt::<Deployment>(&namespace, &cluster.task_manager_name(), "Deployment")
            .await?;
        let tm_service = self
            .get_opt::<Service>(&namespace, &cluster.task_manager_service_name(), "Service")
            .await?;
        let pod_disruption_budget = self
            .get_opt::<PodDisruptionBudget>(
                &namespace,
                &cluster.pod_disruption_budget_name(),
                "PodDisruptionBudget",
            )
            .await?;
        let horizontal_pod_autoscaler = self
            .get_opt::<HorizontalPodAutoscaler>(
                &namespace,
                &cluster.autoscaler_name(),
                "HorizontalPodAutoscaler",
            )
            .await?;
        let submitter_job = self
            .get_opt::<Job>(&namespace, &cluster.submitter_job_name(), "Job")
            .await?;

        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let selector = format!("app.kubernetes.io/name=flink,app.kubernetes.io/instance={name}");
        let pods = pods_api
            .list(&ListParams::default().labels(&selector))
            .await
            .context(ListPodsSnafu)?
            .items;

        // Revision history: record the present spec, then classify.
        let mut revisions = self.history.list(&cluster).await.context(HistorySnafu)?;
        if let Some(created) = self
            .history
            .snapshot(&cluster, &revisions)
            .await
            .context(HistorySnafu)?
        {
            if !revisions
                .iter()
                .any(|revision| revision.name == created.name)
            {
                revisions.push(created);
                revisions.sort_by_key(|revision| revision.number);
            }
        }
        let workload_hash = jm_stateful_set
            .as_ref()
            .and_then(|sts| sts.metadata.annotations.as_ref())
            .and_then(|annotations| annotations.get(REVISION_HASH_ANNOTATION))
            .cloned();
        let cluster_hash = spec_revision_hash(&cluster.spec);
        let (current_revision, next_revision) =
            classify(&revisions, &cluster_hash, workload_hash.as_deref());
        let current_revision = current_revision.cloned();
        let next_revision = next_revision.cloned();
        self.history
            .prune(
                &cluster,
                &revisions,
                DEFAULT_HISTORY_LIMIT,
                current_revision
                    .as_ref()
                    .map(|revision| revision.name.as_str()),
            )
            .await
            .context(HistorySnafu)?;

        // Live job state, only when a JobManager answers.
        let mut flink_job = None;
        let mut flink_reachable = false;
        let mut savepoint_progress = None;
        if stateful_set_ready(jm_stateful_set.as_ref()) {
            let endpoint = cluster.job_manager_endpoint();
            let known_id = cluster
                .job_status()
                .and_then(|job| job.id.as_deref())
                .map(str::to_string);
            match self.flink.get_jobs(&endpoint).await {
                Ok(jobs) => {
                    flink_reachable = true;
                    flink_job = select_job(jobs, known_id.as_deref());
                }
                Err(error) => {
                    debug!(%endpoint, %error, "JobManager REST endpoint not reachable");
                }
            }

            let in_progress_trigger = cluster.status.as_ref().and_then(|status| {
                status.savepoint.as_ref().and_then(|savepoint| {
                    (savepoint.state == SavepointState::InProgress)
                        .then(|| savepoint.trigger_id.clone())
                        .flatten()
                })
            });
            if let (Some(trigger_id), Some(job_id)) = (in_progress_trigger, known_id) {
                match self
                    .flink
                    .get_savepoint(&endpoint, &job_id, &trigger_id)
                    .await
                {
                    Ok(operation) => {
                        savepoint_progress = Some(SavepointProgress {
                            trigger_id,
                            completed: operation.completed,
                            location: operation.location,
                            failure: operation.failure_cause,
                        });
                    }
                    Err(error) => {
                        warn!(%trigger_id, %error, "failed to poll savepoint trigger");
                    }
                }
            }
        }

        let pending_control = pending_control(&cluster);

        Ok(ObservedState {
            revisions,
            current_revision,
            next_revision,
            config_map,
            jm_stateful_set,
            jm_service,
            jm_ingress,
            tm_stateful_set,
            tm_deployment,
            tm_service,
            pod_disruption_budget,
            horizontal_pod_autoscaler,
            submitter_job,
            pods,
            flink_job,
            flink_reachable,
            savepoint_progress,
            pending_control,
            observe_time: now,
            cluster,
        })
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str, kind: &'static str) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.context(GetWorkloadSnafu {
            kind,
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use flink_crd::{
        ControlState, ControlStatus, FlinkClusterSpec, FlinkClusterStatus, CONTROL_ANNOTATION,
    };

    use super::*;

    fn overview(id: &str, state: &str, start_time: i64) -> JobOverview {
        JobOverview {
            id: id.to_string(),
            name: "job".to_string(),
            state: state.to_string(),
            start_time,
            end_time: -1,
            last_modification: 0,
        }
    }

    #[test]
    fn flink_states_map_onto_job_states() {
        assert_eq!(job_state_from_flink("RUNNING"), JobState::Running);
        assert_eq!(job_state_from_flink("RESTARTING"), JobState::Running);
        assert_eq!(job_state_from_flink("FINISHED"), JobState::Succeeded);
        assert_eq!(job_state_from_flink("FAILED"), JobState::Failed);
        assert_eq!(job_state_from_flink("CANCELED"), JobState::Cancelled);
    }

    #[test]
    fn select_job_prefers_the_recorded_id() {
        let jobs = vec![
            overview("old", "FINISHED", 10),
            overview("known", "RUNNING", 5),
        ];
        let selected = select_job(jobs.clone(), Some("known")).unwrap();
        assert_eq!(selected.id, "known");

        // Unknown id falls back to the live job over terminal leftovers.
        let selected = select_job(jobs, Some("other")).unwrap();
        assert_eq!(selected.id, "known");

        let terminal_only = vec![
            overview("first", "FINISHED", 10),
            overview("second", "FAILED", 20),
        ];
        let selected = select_job(terminal_only, None).unwrap();
        assert_eq!(selected.id, "second");
    }

    fn cluster_with_annotation(value: &str) -> FlinkCluster {
        let mut cluster = FlinkCluster::new("mycluster", FlinkClusterSpec::default());
        cluster
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CONTROL_ANNOTATION.to_string(), value.to_string());
        cluster
    }

    #[test]
    fn annotation_without_control_status_is_pending() {
        let cluster = cluster_with_annotation("savepoint");
        assert_eq!(pending_control(&cluster), Some(UserControl::Savepoint));
    }

    #[test]
    fn recorded_control_is_not_re_requested() {
        let mut cluster = cluster_with_annotation("savepoint");
        cluster.status = Some(FlinkClusterStatus {
            control: Some(ControlStatus {
                name: UserControl::Savepoint,
                state: ControlState::Succeeded,
                details: None,
                update_time: None,
            }),
            ..FlinkClusterStatus::default()
        });
        assert_eq!(pending_control(&cluster), None);
    }

    #[test]
    fn invalid_annotation_value_is_ignored() {
        let cluster = cluster_with_annotation("cancel");
        assert_eq!(pending_control(&cluster), None);
    }
}
