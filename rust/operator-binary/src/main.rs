mod controller;
mod event;
mod flink;
mod history;
mod model;
mod observer;
mod reconciler;
mod status;
mod webhook;

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::{ConfigMap, Service},
};
use kube::api::Api;
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flink_crd::validation::SystemClock;
use flink_crd::FlinkCluster;

use crate::controller::{Ctx, CONTROLLER_NAME, OPERATOR_NAME};
use crate::flink::HttpFlinkApi;
use crate::history::ControllerRevisionHistory;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Kubernetes operator for Apache Flink clusters"
)]
struct Opts {
    /// Namespace to watch; all namespaces when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Port the admission webhook listens on; 0 disables the webhook.
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8443)]
    webhook_port: u16,

    /// Reconcile workers running in parallel.
    #[arg(long, default_value_t = 4)]
    max_concurrent_reconciles: u16,
}

fn namespaced_or_all<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = Opts::parse();
    let client = Client::try_default().await?;
    let namespace = opts.watch_namespace.as_deref();

    let clusters: Api<FlinkCluster> = namespaced_or_all(&client, namespace);
    let stateful_sets: Api<StatefulSet> = namespaced_or_all(&client, namespace);
    let deployments: Api<Deployment> = namespaced_or_all(&client, namespace);
    let services: Api<Service> = namespaced_or_all(&client, namespace);
    let config_maps: Api<ConfigMap> = namespaced_or_all(&client, namespace);
    let jobs: Api<Job> = namespaced_or_all(&client, namespace);

    let reporter = Reporter {
        controller: format!("{CONTROLLER_NAME}.{OPERATOR_NAME}"),
        instance: None,
    };
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        flink: Arc::new(HttpFlinkApi::new()?),
        history: ControllerRevisionHistory::new(client.clone()),
        reporter,
        clock: Arc::new(SystemClock),
    });

    info!(
        namespace = namespace.unwrap_or("all"),
        workers = opts.max_concurrent_reconciles,
        "starting FlinkCluster controller"
    );

    let cluster_controller = Controller::new(clusters, watcher::Config::default())
        .owns(stateful_sets, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .owns(config_maps, watcher::Config::default())
        .owns(jobs, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(opts.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    debug!(name = %object.name, namespace = ?object.namespace, ?action, "reconciled");
                }
                Err(err) => {
                    error!(error = %err, "reconcile failed");
                }
            }
        });

    if opts.webhook_port > 0 {
        tokio::join!(cluster_controller, webhook::run(opts.webhook_port));
    } else {
        cluster_controller.await;
    }

    info!("controller shut down");
    Ok(())
}
