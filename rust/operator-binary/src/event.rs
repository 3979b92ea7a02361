//! Kubernetes Event emission.
//!
//! Events are fire-and-forget: a failed publish is logged and never
//! fails the reconcile that produced it.

use flink_crd::FlinkCluster;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Event reasons, as shown in the REASON column of `kubectl get events`.
pub mod reasons {
    pub const STATUS_UPDATE: &str = "StatusUpdate";
    pub const CREATED_WORKLOAD: &str = "CreatedWorkload";
    pub const DELETED_WORKLOAD: &str = "DeletedWorkload";
    pub const JOB_SUBMITTED: &str = "JobSubmitted";
    pub const JOB_FAILED: &str = "JobFailed";
    pub const JOB_SUCCEEDED: &str = "JobSucceeded";
    pub const SAVEPOINT_TRIGGERED: &str = "SavepointTriggered";
    pub const SAVEPOINT_COMPLETED: &str = "SavepointCompleted";
    pub const SAVEPOINT_FAILED: &str = "SavepointFailed";
    pub const CONTROL_REQUESTED: &str = "ControlRequested";
    pub const CONTROL_SUCCEEDED: &str = "ControlSucceeded";
    pub const CONTROL_FAILED: &str = "ControlFailed";
    pub const UPDATE_BLOCKED: &str = "UpdateBlocked";
}

/// Publish an event on the cluster, swallowing publish failures.
pub async fn publish(
    client: &Client,
    reporter: &Reporter,
    cluster: &FlinkCluster,
    type_: EventType,
    reason: &str,
    note: impl Into<String>,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note.into()),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    let reference = cluster.object_ref(&());
    let recorder = Recorder::new(client.clone(), reporter.clone(), reference);
    if let Err(error) = recorder.publish(event).await {
        warn!(reason, error = %error, "failed to publish event");
    }
}
