//! The reconcile pipeline for each [`FlinkCluster`].
//!
//! Every invocation runs the same four steps: observe the current
//! state, commit the derived status (stopping early when it changed,
//! so no action is taken before the persisted status reflects
//! reality), compute the desired state, then plan and execute at most
//! one corrective action. Deletion runs through the same pipeline via
//! the finalizer; the cleanup branch keeps the finalizer until the
//! graceful teardown finished.

use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use kube::runtime::controller::Action as ReconcilerAction;
use kube::runtime::events::Reporter;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use flink_crd::validation::Clock;
use flink_crd::{FlinkCluster, FINALIZER_NAME};

use crate::flink::FlinkApi;
use crate::history::ControllerRevisionHistory;
use crate::model::build_desired;
use crate::observer::{self, Observer};
use crate::reconciler::{self, Executor};
use crate::status;

pub const OPERATOR_NAME: &str = "flink-operator";
pub const CONTROLLER_NAME: &str = "flinkcluster";

/// The barrier requeue after a status write.
const STATUS_BARRIER_REQUEUE: Duration = Duration::from_secs(5);
const ERROR_REQUEUE: Duration = Duration::from_secs(10);
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub client: Client,
    pub flink: Arc<dyn FlinkApi>,
    pub history: ControllerRevisionHistory,
    pub reporter: Reporter,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to observe the current state"))]
    Observe { source: observer::Error },

    #[snafu(display("failed to update cluster status"))]
    UpdateStatus { source: status::Error },

    #[snafu(display("failed to apply the corrective action"))]
    Act { source: reconciler::Error },

    /// Not a failure: cleanup returns this to keep the finalizer in
    /// place until the graceful teardown finished.
    #[snafu(display("teardown still in progress"))]
    TeardownInProgress,

    #[snafu(display("finalizer handling failed: {message}"))]
    Finalizer { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub async fn reconcile(cluster: Arc<FlinkCluster>, ctx: Arc<Ctx>) -> Result<ReconcilerAction> {
    let namespace = cluster.namespace().ok_or(Error::NoNamespace)?;
    let api: Api<FlinkCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER_NAME, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => run(cluster, ctx.clone(), false).await,
            FinalizerEvent::Cleanup(cluster) => run(cluster, ctx.clone(), true).await,
        }
    })
    .await
    .map_err(|error| match error {
        kube::runtime::finalizer::Error::ApplyFailed(source)
        | kube::runtime::finalizer::Error::CleanupFailed(source) => source,
        other => Error::Finalizer {
            message: other.to_string(),
        },
    })
}

/// Observe, update status (barrier), build desired, act once.
async fn run(cluster: Arc<FlinkCluster>, ctx: Arc<Ctx>, cleanup: bool) -> Result<ReconcilerAction> {
    let observer = Observer {
        client: &ctx.client,
        flink: ctx.flink.as_ref(),
        history: &ctx.history,
    };
    let observed = match observer.observe(&cluster, ctx.clock.now()).await {
        // Deleted between trigger and observation; nothing to do.
        Err(observer::Error::ClusterGone) => return Ok(ReconcilerAction::await_change()),
        other => other.context(ObserveSnafu)?,
    };

    let status_changed = status::update_status_if_changed(&ctx.client, &ctx.reporter, &observed)
        .await
        .context(UpdateStatusSnafu)?;
    if status_changed {
        debug!(
            cluster = %observed.cluster.name_any(),
            "status changed, waiting for it to settle before taking actions"
        );
        return Ok(ReconcilerAction::requeue(STATUS_BARRIER_REQUEUE));
    }

    let desired = build_desired(&observed);
    let action = reconciler::plan(&observed, &desired);
    debug!(cluster = %observed.cluster.name_any(), ?action, "planned action");

    let teardown_complete = action.completes_teardown();
    let executor = Executor {
        client: &ctx.client,
        flink: ctx.flink.as_ref(),
        reporter: &ctx.reporter,
    };
    let requeue_after = executor.act(&observed, action).await.context(ActSnafu)?;

    if cleanup {
        if teardown_complete {
            // Returning cleanly lets the finalizer be released.
            return Ok(ReconcilerAction::await_change());
        }
        return Err(Error::TeardownInProgress);
    }

    Ok(match requeue_after {
        Some(after) => ReconcilerAction::requeue(after),
        None => ReconcilerAction::await_change(),
    })
}

pub fn error_policy(cluster: Arc<FlinkCluster>, error: &Error, _ctx: Arc<Ctx>) -> ReconcilerAction {
    match error {
        Error::TeardownInProgress => ReconcilerAction::requeue(TEARDOWN_REQUEUE),
        _ => {
            warn!(
                cluster = %cluster.name_any(),
                %error,
                "reconcile failed, requeueing"
            );
            ReconcilerAction::requeue(ERROR_REQUEUE)
        }
    }
}
