//! Desired state of a cluster, rendered as the full set of Kubernetes
//! objects that should exist for one observation.
//!
//! [`build_desired`] is a pure function of the [`ObservedState`]; the
//! reconciler diffs its output against the observation and applies at
//! most one corrective action per pass. A slot that is [`Desired::Absent`]
//! means "ensure this object does not exist".
//!
//! During a rolling update the objects are rendered from the *current*
//! revision while the running job drains, and from the *next* revision
//! once the job is cleanly stopped. This is what keeps updates from
//! deleting infrastructure a running job still needs.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
        autoscaling::v2::{
            CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
            MetricSpec, MetricTarget, ResourceMetricSource,
        },
        batch::v1::{Job, JobSpec as BatchJobSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
            LocalObjectReference, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, Service,
            ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
        policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

use flink_crd::{
    quantity, AccessScope, CleanupAction, ControlState, DeploymentType, FlinkCluster,
    FlinkClusterSpec, JobManagerSpec, JobSpec, NamedPort, TaskManagerSpec, UserControl, APP_NAME,
    DEFAULT_JM_UI_PORT, DEFAULT_JOB_MANAGER_REPLICAS, DEFAULT_TASK_MANAGER_REPLICAS,
    JM_RPC_PORT_NAME, REVISION_HASH_ANNOTATION, REVISION_NAME_ANNOTATION,
};

use crate::history::Revision;
use crate::observer::ObservedState;

pub const COMPONENT_JOB_MANAGER: &str = "jobmanager";
pub const COMPONENT_TASK_MANAGER: &str = "taskmanager";
pub const COMPONENT_SUBMITTER: &str = "submitter";

const FLINK_CONF_DIR: &str = "/opt/flink/conf";
const FLINK_CONFIG_VOLUME: &str = "flink-config";

const LOG4J_CONSOLE_PROPERTIES: &str = "\
rootLogger.level = INFO
rootLogger.appenderRef.console.ref = ConsoleAppender
appender.console.name = ConsoleAppender
appender.console.type = CONSOLE
appender.console.layout.type = PatternLayout
appender.console.layout.pattern = %d{yyyy-MM-dd HH:mm:ss,SSS} %-5p %-60c %x - %m%n
";

const LOGBACK_CONSOLE_XML: &str = "\
<configuration>
  <appender name=\"console\" class=\"ch.qos.logback.core.ConsoleAppender\">
    <encoder>
      <pattern>%d{yyyy-MM-dd HH:mm:ss.SSS} [%thread] %-5level %logger{60} %X{sourceThread} - %msg%n</pattern>
    </encoder>
  </appender>
  <root level=\"INFO\">
    <appender-ref ref=\"console\"/>
  </root>
</configuration>
";

/// A slot of the desired state: the object that should exist, or the
/// explicit statement that it should not.
#[derive(Clone, Debug, PartialEq)]
pub enum Desired<T> {
    Present(T),
    Absent,
}

impl<T> Desired<T> {
    pub fn as_option(&self) -> Option<&T> {
        match self {
            Desired::Present(value) => Some(value),
            Desired::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Desired::Present(_))
    }

    fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Desired::Present(value),
            None => Desired::Absent,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DesiredState {
    pub config_map: Desired<ConfigMap>,
    pub pod_disruption_budget: Desired<PodDisruptionBudget>,
    pub jm_stateful_set: Desired<StatefulSet>,
    pub jm_service: Desired<Service>,
    pub jm_ingress: Desired<Ingress>,
    pub tm_stateful_set: Desired<StatefulSet>,
    pub tm_deployment: Desired<Deployment>,
    pub tm_service: Desired<Service>,
    pub horizontal_pod_autoscaler: Desired<HorizontalPodAutoscaler>,
    pub job: Desired<Job>,
}

impl DesiredState {
    pub fn teardown() -> Self {
        DesiredState {
            config_map: Desired::Absent,
            pod_disruption_budget: Desired::Absent,
            jm_stateful_set: Desired::Absent,
            jm_service: Desired::Absent,
            jm_ingress: Desired::Absent,
            tm_stateful_set: Desired::Absent,
            tm_deployment: Desired::Absent,
            tm_service: Desired::Absent,
            horizontal_pod_autoscaler: Desired::Absent,
            job: Desired::Absent,
        }
    }
}

/// The revision to render from: *current* while a running job drains,
/// *next* otherwise.
pub fn render_revision(observed: &ObservedState) -> Option<&Revision> {
    if observed.is_updating() && draining(observed) {
        observed.current_revision.as_ref()
    } else {
        observed.next_revision.as_ref()
    }
}

/// A rollout has to wait while the job is still running.
pub fn draining(observed: &ObservedState) -> bool {
    observed
        .recorded_job_status()
        .map(|job| job.state.is_active())
        .unwrap_or(false)
}

fn job_cancel_in_progress(observed: &ObservedState) -> bool {
    observed
        .cluster
        .status
        .as_ref()
        .and_then(|status| status.control.as_ref())
        .map(|control| {
            control.name == UserControl::JobCancel
                && matches!(
                    control.state,
                    ControlState::InProgress | ControlState::Succeeded
                )
        })
        .unwrap_or(false)
}

/// Build the full desired object set for one observation.
pub fn build_desired(observed: &ObservedState) -> DesiredState {
    if observed.is_deleting() {
        return DesiredState::teardown();
    }

    let cluster = &observed.cluster;
    let revision = render_revision(observed);
    let spec = revision
        .map(|revision| &revision.spec)
        .unwrap_or(&cluster.spec);

    let deployment_type = observed_deployment_type(observed, spec);

    let mut desired = DesiredState {
        config_map: Desired::Present(build_config_map(cluster, spec, revision)),
        pod_disruption_budget: Desired::from_option(build_pod_disruption_budget(
            cluster, spec, revision,
        )),
        jm_stateful_set: Desired::Present(build_jm_stateful_set(cluster, spec, revision)),
        jm_service: Desired::Present(build_jm_service(cluster, spec, revision)),
        jm_ingress: Desired::from_option(build_jm_ingress(cluster, spec, revision)),
        tm_stateful_set: Desired::Absent,
        tm_deployment: Desired::Absent,
        tm_service: Desired::Present(build_tm_service(cluster, spec, revision)),
        horizontal_pod_autoscaler: Desired::from_option(build_autoscaler(
            cluster,
            spec,
            revision,
            deployment_type,
        )),
        job: Desired::Absent,
    };

    match deployment_type {
        DeploymentType::StatefulSet => {
            desired.tm_stateful_set =
                Desired::Present(build_tm_stateful_set(cluster, spec, revision));
        }
        DeploymentType::Deployment => {
            desired.tm_deployment = Desired::Present(build_tm_deployment(cluster, spec, revision));
        }
    }

    // The submitter job exists only for job clusters, and not while a
    // job-cancel control is being processed.
    if let Some(job_spec) = &spec.job {
        if !job_cancel_in_progress(observed) {
            let from_savepoint = resolve_from_savepoint(observed, job_spec);
            desired.job = Desired::Present(build_submitter_job(
                cluster,
                spec,
                job_spec,
                revision,
                from_savepoint,
            ));
        }
    }

    // After a terminal job outcome the cleanup policy shrinks the
    // desired set.
    if let Some(action) = effective_cleanup_action(observed, spec) {
        match action {
            CleanupAction::KeepCluster => {}
            CleanupAction::DeleteTaskManager => {
                desired.tm_stateful_set = Desired::Absent;
                desired.tm_deployment = Desired::Absent;
                desired.horizontal_pod_autoscaler = Desired::Absent;
            }
            CleanupAction::DeleteCluster => {
                let job = desired.job;
                desired = DesiredState::teardown();
                // Keep the submitter record until the cluster itself is
                // deleted by the user.
                desired.job = job;
            }
        }
    }

    desired
}

/// The cleanup action that applies once the job reached a terminal
/// outcome that the restart policy will not retry.
pub fn effective_cleanup_action(
    observed: &ObservedState,
    spec: &FlinkClusterSpec,
) -> Option<CleanupAction> {
    let job_spec = spec.job.as_ref()?;
    let job_status = observed.recorded_job_status()?;
    if observed.is_updating() {
        return None;
    }
    if !job_status.state.is_stopped() || job_status.should_restart(job_spec.restart_policy) {
        return None;
    }
    let policy = job_spec.cleanup_policy.as_ref()?;
    let action = match job_status.state {
        flink_crd::JobState::Succeeded => policy.after_job_succeeds,
        flink_crd::JobState::Failed | flink_crd::JobState::Lost => policy.after_job_fails,
        flink_crd::JobState::Cancelled => policy
            .after_job_cancelled
            .unwrap_or(CleanupAction::DeleteCluster),
        _ => return None,
    };
    Some(action)
}

/// Preserve the deployment type of the observed TaskManager workload.
fn observed_deployment_type(observed: &ObservedState, spec: &FlinkClusterSpec) -> DeploymentType {
    if observed.tm_deployment.is_some() && observed.tm_stateful_set.is_none() {
        return DeploymentType::Deployment;
    }
    if observed.tm_stateful_set.is_some() {
        return DeploymentType::StatefulSet;
    }
    spec.task_manager.deployment_type.unwrap_or_default()
}

/// Savepoint the submitted job should restore from, if any.
pub fn resolve_from_savepoint(observed: &ObservedState, job_spec: &JobSpec) -> Option<String> {
    if let Some(path) = &job_spec.from_savepoint {
        return Some(path.clone());
    }
    let status = observed.recorded_job_status()?;
    let restorable = status.final_savepoint
        || observed.is_updating()
        || status.should_restart(job_spec.restart_policy);
    status.savepoint_location.clone().filter(|_| restorable)
}

pub fn cluster_labels(cluster: &FlinkCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), APP_NAME.to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "flink-operator".to_string(),
    );
    labels
}

fn component_labels(cluster: &FlinkCluster, component: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        component.to_string(),
    );
    labels
}

fn revision_annotations(revision: Option<&Revision>) -> Option<BTreeMap<String, String>> {
    revision.map(|revision| {
        let mut annotations = BTreeMap::new();
        annotations.insert(REVISION_NAME_ANNOTATION.to_string(), revision.name.clone());
        annotations.insert(REVISION_HASH_ANNOTATION.to_string(), revision.hash.clone());
        annotations
    })
}

fn object_meta(
    cluster: &FlinkCluster,
    name: String,
    component: &str,
    revision: Option<&Revision>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(component_labels(cluster, component)),
        annotations: revision_annotations(revision),
        owner_references: cluster
            .controller_owner_ref(&())
            .map(|reference| vec![reference]),
        ..ObjectMeta::default()
    }
}

fn container_ports(standard: &[NamedPort], extra: &[NamedPort]) -> Vec<ContainerPort> {
    standard
        .iter()
        .chain(extra.iter())
        .map(|port| ContainerPort {
            name: Some(port.name.clone()),
            container_port: port.container_port,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        })
        .collect()
}

fn service_ports(ports: &[NamedPort]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|port| ServicePort {
            name: Some(port.name.clone()),
            port: port.container_port,
            target_port: Some(IntOrString::Int(port.container_port)),
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        })
        .collect()
}

/// Heap size in mebibytes after subtracting the off-heap share.
fn heap_size_mb(
    resources: &k8s_openapi::api::core::v1::ResourceRequirements,
    off_heap_ratio: Option<i32>,
    off_heap_min: Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> Option<i64> {
    let limit = resources.limits.as_ref()?.get("memory")?;
    let limit_bytes = quantity::to_bytes(limit).ok()?;
    let ratio = off_heap_ratio.unwrap_or(25) as f64 / 100.0;
    let mut off_heap = limit_bytes * ratio;
    if let Some(min) = off_heap_min {
        if let Ok(min_bytes) = quantity::to_bytes(min) {
            off_heap = off_heap.max(min_bytes);
        }
    }
    let heap = (limit_bytes - off_heap).max(0.0);
    Some((heap / (1024.0 * 1024.0)) as i64)
}

pub fn build_config_map(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> ConfigMap {
    let jm = &spec.job_manager;
    let tm = &spec.task_manager;

    let mut properties: BTreeMap<String, String> = BTreeMap::new();
    properties.insert(
        "jobmanager.rpc.address".to_string(),
        cluster.job_manager_service_name(),
    );
    for port in jm.ports.named_ports() {
        let key = match port.name.as_str() {
            "rpc" => "jobmanager.rpc.port",
            "blob" => "blob.server.port",
            "query" => "queryable-state.proxy.ports",
            "ui" => "rest.port",
            _ => continue,
        };
        properties.insert(key.to_string(), port.container_port.to_string());
    }
    for port in tm.ports.named_ports() {
        let key = match port.name.as_str() {
            "rpc" => "taskmanager.rpc.port",
            "data" => "taskmanager.data.port",
            _ => continue,
        };
        properties.insert(key.to_string(), port.container_port.to_string());
    }
    properties.insert("taskmanager.numberOfTaskSlots".to_string(), "1".to_string());
    if let Some(heap) = heap_size_mb(
        &jm.resources,
        jm.memory_off_heap_ratio,
        jm.memory_off_heap_min.as_ref(),
    ) {
        properties.insert("jobmanager.heap.size".to_string(), format!("{heap}m"));
    }
    if let Some(heap) = heap_size_mb(
        &tm.resources,
        tm.memory_off_heap_ratio,
        tm.memory_off_heap_min.as_ref(),
    ) {
        properties.insert("taskmanager.heap.size".to_string(), format!("{heap}m"));
    }
    if let Some(job) = &spec.job {
        if let Some(dir) = &job.savepoints_dir {
            properties.insert("state.savepoints.dir".to_string(), dir.clone());
        }
    }
    // User-provided properties win.
    for (key, value) in &spec.flink_properties {
        properties.insert(key.clone(), value.clone());
    }

    let flink_conf = properties
        .iter()
        .map(|(key, value)| format!("{key}: {value}\n"))
        .collect::<String>();

    let mut data = BTreeMap::new();
    data.insert("flink-conf.yaml".to_string(), flink_conf);
    data.insert(
        "log4j-console.properties".to_string(),
        LOG4J_CONSOLE_PROPERTIES.to_string(),
    );
    data.insert(
        "logback-console.xml".to_string(),
        LOGBACK_CONSOLE_XML.to_string(),
    );

    ConfigMap {
        metadata: object_meta(
            cluster,
            cluster.config_map_name(),
            COMPONENT_JOB_MANAGER,
            revision,
        ),
        data: Some(data),
        ..ConfigMap::default()
    }
}

/// Volumes and mounts shared by all cluster containers: the rendered
/// configuration plus optional Hadoop and GCP credentials.
fn common_volumes(
    spec: &FlinkClusterSpec,
    cluster: &FlinkCluster,
) -> (Vec<Volume>, Vec<VolumeMount>, Vec<EnvVar>) {
    let mut volumes = vec![Volume {
        name: FLINK_CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: cluster.config_map_name(),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: FLINK_CONFIG_VOLUME.to_string(),
        mount_path: FLINK_CONF_DIR.to_string(),
        ..VolumeMount::default()
    }];
    let mut env = spec.env_vars.clone();

    if let Some(hadoop) = &spec.hadoop_config {
        volumes.push(Volume {
            name: "hadoop-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: hadoop.config_map_name.clone(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "hadoop-config".to_string(),
            mount_path: hadoop.mount_path.clone(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
        env.push(EnvVar {
            name: "HADOOP_CONF_DIR".to_string(),
            value: Some(hadoop.mount_path.clone()),
            ..EnvVar::default()
        });
    }

    if let Some(service_account) = spec
        .gcp_config
        .as_ref()
        .and_then(|gcp| gcp.service_account.as_ref())
    {
        volumes.push(Volume {
            name: "gcp-service-account".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(service_account.secret_name.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "gcp-service-account".to_string(),
            mount_path: service_account.mount_path.clone(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
        let key_path = format!(
            "{}/{}",
            service_account.mount_path.trim_end_matches('/'),
            service_account.key_file
        );
        env.push(EnvVar {
            name: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
            value: Some(key_path),
            ..EnvVar::default()
        });
    }

    (volumes, mounts, env)
}

fn image_pull_secrets(spec: &FlinkClusterSpec) -> Option<Vec<LocalObjectReference>> {
    if spec.image.pull_secrets.is_empty() {
        return None;
    }
    Some(
        spec.image
            .pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect(),
    )
}

fn manager_pod_template(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    component: &str,
    args: &str,
    ports: Vec<ContainerPort>,
    resources: &k8s_openapi::api::core::v1::ResourceRequirements,
    extra_volumes: &[Volume],
    extra_mounts: &[VolumeMount],
    node_selector: &BTreeMap<String, String>,
    tolerations: &[k8s_openapi::api::core::v1::Toleration],
    pod_labels: &BTreeMap<String, String>,
    pod_annotations: &BTreeMap<String, String>,
    readiness_port: Option<i32>,
) -> PodTemplateSpec {
    let (mut volumes, mut mounts, env) = common_volumes(spec, cluster);
    volumes.extend(extra_volumes.iter().cloned());
    mounts.extend(extra_mounts.iter().cloned());

    let mut labels = component_labels(cluster, component);
    for (key, value) in pod_labels {
        labels.insert(key.clone(), value.clone());
    }

    let readiness_probe = readiness_port.map(|port| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            host: None,
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Probe::default()
    });

    let container = Container {
        name: component.to_string(),
        image: Some(spec.image.name.clone()),
        image_pull_policy: spec.image.pull_policy.clone(),
        args: Some(vec![args.to_string()]),
        ports: Some(ports),
        env: if env.is_empty() { None } else { Some(env) },
        resources: Some(resources.clone()),
        volume_mounts: Some(mounts),
        readiness_probe,
        ..Container::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: if pod_annotations.is_empty() {
                None
            } else {
                Some(pod_annotations.clone())
            },
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            node_selector: if node_selector.is_empty() {
                None
            } else {
                Some(node_selector.clone())
            },
            tolerations: if tolerations.is_empty() {
                None
            } else {
                Some(tolerations.to_vec())
            },
            image_pull_secrets: image_pull_secrets(spec),
            ..PodSpec::default()
        }),
    }
}

pub fn build_jm_stateful_set(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> StatefulSet {
    let jm: &JobManagerSpec = &spec.job_manager;
    let rpc_port = jm
        .ports
        .named_ports()
        .iter()
        .find(|port| port.name == JM_RPC_PORT_NAME)
        .map(|port| port.container_port);

    let template = manager_pod_template(
        cluster,
        spec,
        COMPONENT_JOB_MANAGER,
        "jobmanager",
        container_ports(&jm.ports.named_ports(), &jm.extra_ports),
        &jm.resources,
        &jm.volumes,
        &jm.volume_mounts,
        &jm.node_selector,
        &jm.tolerations,
        &jm.pod_labels,
        &jm.pod_annotations,
        rpc_port,
    );

    StatefulSet {
        metadata: object_meta(
            cluster,
            cluster.job_manager_stateful_set_name(),
            COMPONENT_JOB_MANAGER,
            revision,
        ),
        spec: Some(StatefulSetSpec {
            replicas: Some(jm.replicas.unwrap_or(DEFAULT_JOB_MANAGER_REPLICAS)),
            selector: LabelSelector {
                match_labels: Some(component_labels(cluster, COMPONENT_JOB_MANAGER)),
                ..LabelSelector::default()
            },
            service_name: cluster.job_manager_service_name(),
            pod_management_policy: Some("Parallel".to_string()),
            template,
            ..StatefulSetSpec::default()
        }),
        status: None,
    }
}

pub fn build_jm_service(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> Service {
    let jm = &spec.job_manager;
    let mut metadata = object_meta(
        cluster,
        cluster.job_manager_service_name(),
        COMPONENT_JOB_MANAGER,
        revision,
    );

    let (service_type, cluster_ip) = match jm.access_scope {
        AccessScope::Cluster => (Some("ClusterIP".to_string()), None),
        AccessScope::Vpc => (Some("LoadBalancer".to_string()), None),
        AccessScope::External => (Some("LoadBalancer".to_string()), None),
        AccessScope::NodePort => (Some("NodePort".to_string()), None),
        AccessScope::Headless => (Some("ClusterIP".to_string()), Some("None".to_string())),
    };
    if jm.access_scope == AccessScope::Vpc {
        metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                "networking.gke.io/load-balancer-type".to_string(),
                "Internal".to_string(),
            );
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: service_type,
            cluster_ip,
            selector: Some(component_labels(cluster, COMPONENT_JOB_MANAGER)),
            ports: Some(service_ports(&jm.ports.named_ports())),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

pub fn build_jm_ingress(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> Option<Ingress> {
    let ingress_spec = spec.job_manager.ingress.as_ref()?;
    let host = ingress_spec
        .host_format
        .as_ref()
        .map(|format| format.replace("{{$clusterName}}", &cluster.name_any()));
    let ui_port = spec.job_manager.ports.ui.unwrap_or(DEFAULT_JM_UI_PORT);

    let mut metadata = object_meta(
        cluster,
        cluster.job_manager_ingress_name(),
        COMPONENT_JOB_MANAGER,
        revision,
    );
    if !ingress_spec.annotations.is_empty() {
        metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(ingress_spec.annotations.clone());
    }

    let tls = if ingress_spec.use_tls.unwrap_or(false) {
        Some(vec![IngressTLS {
            hosts: host.clone().map(|host| vec![host]),
            secret_name: ingress_spec.tls_secret_name.clone(),
        }])
    } else {
        None
    };

    Some(Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host,
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: cluster.job_manager_service_name(),
                                port: Some(ServiceBackendPort {
                                    number: Some(ui_port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            tls,
            ..IngressSpec::default()
        }),
        status: None,
    })
}

pub fn build_tm_stateful_set(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> StatefulSet {
    let tm: &TaskManagerSpec = &spec.task_manager;
    let template = task_manager_pod_template(cluster, spec, tm);

    StatefulSet {
        metadata: object_meta(
            cluster,
            cluster.task_manager_name(),
            COMPONENT_TASK_MANAGER,
            revision,
        ),
        spec: Some(StatefulSetSpec {
            replicas: Some(tm.replicas.unwrap_or(DEFAULT_TASK_MANAGER_REPLICAS)),
            selector: LabelSelector {
                match_labels: Some(component_labels(cluster, COMPONENT_TASK_MANAGER)),
                ..LabelSelector::default()
            },
            service_name: cluster.task_manager_service_name(),
            pod_management_policy: Some("Parallel".to_string()),
            template,
            ..StatefulSetSpec::default()
        }),
        status: None,
    }
}

pub fn build_tm_deployment(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> Deployment {
    let tm = &spec.task_manager;
    let template = task_manager_pod_template(cluster, spec, tm);

    Deployment {
        metadata: object_meta(
            cluster,
            cluster.task_manager_name(),
            COMPONENT_TASK_MANAGER,
            revision,
        ),
        spec: Some(DeploymentSpec {
            replicas: Some(tm.replicas.unwrap_or(DEFAULT_TASK_MANAGER_REPLICAS)),
            selector: LabelSelector {
                match_labels: Some(component_labels(cluster, COMPONENT_TASK_MANAGER)),
                ..LabelSelector::default()
            },
            template,
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

fn task_manager_pod_template(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    tm: &TaskManagerSpec,
) -> PodTemplateSpec {
    let rpc_port = tm
        .ports
        .named_ports()
        .iter()
        .find(|port| port.name == flink_crd::TM_RPC_PORT_NAME)
        .map(|port| port.container_port);
    manager_pod_template(
        cluster,
        spec,
        COMPONENT_TASK_MANAGER,
        "taskmanager",
        container_ports(&tm.ports.named_ports(), &tm.extra_ports),
        &tm.resources,
        &tm.volumes,
        &tm.volume_mounts,
        &tm.node_selector,
        &tm.tolerations,
        &tm.pod_labels,
        &tm.pod_annotations,
        rpc_port,
    )
}

pub fn build_tm_service(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            cluster.task_manager_service_name(),
            COMPONENT_TASK_MANAGER,
            revision,
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(component_labels(cluster, COMPONENT_TASK_MANAGER)),
            ports: Some(service_ports(&spec.task_manager.ports.named_ports())),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

/// One JobManager may be disrupted only when another remains.
pub fn build_pod_disruption_budget(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
) -> Option<PodDisruptionBudget> {
    let replicas = spec
        .job_manager
        .replicas
        .unwrap_or(DEFAULT_JOB_MANAGER_REPLICAS);
    if replicas <= 1 {
        return None;
    }
    Some(PodDisruptionBudget {
        metadata: object_meta(
            cluster,
            cluster.pod_disruption_budget_name(),
            COMPONENT_JOB_MANAGER,
            revision,
        ),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(replicas - 1)),
            selector: Some(LabelSelector {
                match_labels: Some(component_labels(cluster, COMPONENT_JOB_MANAGER)),
                ..LabelSelector::default()
            }),
            ..PodDisruptionBudgetSpec::default()
        }),
        status: None,
    })
}

pub fn build_autoscaler(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    revision: Option<&Revision>,
    deployment_type: DeploymentType,
) -> Option<HorizontalPodAutoscaler> {
    let max_replicas = spec.task_manager.max_replicas?;
    let min_replicas = spec
        .task_manager
        .replicas
        .unwrap_or(DEFAULT_TASK_MANAGER_REPLICAS);
    let kind = match deployment_type {
        DeploymentType::StatefulSet => "StatefulSet",
        DeploymentType::Deployment => "Deployment",
    };
    Some(HorizontalPodAutoscaler {
        metadata: object_meta(
            cluster,
            cluster.autoscaler_name(),
            COMPONENT_TASK_MANAGER,
            revision,
        ),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: kind.to_string(),
                name: cluster.task_manager_name(),
            },
            min_replicas: Some(min_replicas),
            max_replicas,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(80),
                        ..MetricTarget::default()
                    },
                }),
                ..MetricSpec::default()
            }]),
            ..HorizontalPodAutoscalerSpec::default()
        }),
        status: None,
    })
}

/// The submitter runs `flink run` against the JobManager REST endpoint.
pub fn build_submitter_job(
    cluster: &FlinkCluster,
    spec: &FlinkClusterSpec,
    job_spec: &JobSpec,
    revision: Option<&Revision>,
    from_savepoint: Option<String>,
) -> Job {
    let ui_port = spec.job_manager.ports.ui.unwrap_or(DEFAULT_JM_UI_PORT);
    let jobmanager_address = format!("{}:{ui_port}", cluster.job_manager_service_name());

    let mut args = vec![
        "run".to_string(),
        "--jobmanager".to_string(),
        jobmanager_address,
    ];
    if job_spec.mode.unwrap_or_default() == flink_crd::JobMode::Detached {
        args.push("--detached".to_string());
    }
    if let Some(parallelism) = job_spec.parallelism {
        args.push("--parallelism".to_string());
        args.push(parallelism.to_string());
    }
    if let Some(class_name) = &job_spec.class_name {
        args.push("--class".to_string());
        args.push(class_name.clone());
    }
    if let Some(path) = &from_savepoint {
        args.push("--fromSavepoint".to_string());
        args.push(path.clone());
    }
    if let Some(python_file) = &job_spec.python_file {
        args.push("--python".to_string());
        args.push(python_file.clone());
    }
    if let Some(python_files) = &job_spec.python_files {
        args.push("--pyFiles".to_string());
        args.push(python_files.clone());
    }
    if let Some(python_module) = &job_spec.python_module {
        args.push("--pyModule".to_string());
        args.push(python_module.clone());
    }
    if let Some(jar_file) = &job_spec.jar_file {
        args.push(jar_file.clone());
    }
    args.extend(job_spec.args.iter().cloned());

    let (volumes, mounts, env) = common_volumes(spec, cluster);
    let mut labels = component_labels(cluster, COMPONENT_SUBMITTER);
    for (key, value) in &job_spec.pod_labels {
        labels.insert(key.clone(), value.clone());
    }

    let container = Container {
        name: COMPONENT_SUBMITTER.to_string(),
        image: Some(spec.image.name.clone()),
        image_pull_policy: spec.image.pull_policy.clone(),
        command: Some(vec!["/opt/flink/bin/flink".to_string()]),
        args: Some(args),
        env: if env.is_empty() { None } else { Some(env) },
        resources: Some(job_spec.resources.clone()),
        volume_mounts: Some(mounts),
        ..Container::default()
    };

    Job {
        metadata: object_meta(
            cluster,
            cluster.submitter_job_name(),
            COMPONENT_SUBMITTER,
            revision,
        ),
        spec: Some(BatchJobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: if job_spec.pod_annotations.is_empty() {
                        None
                    } else {
                        Some(job_spec.pod_annotations.clone())
                    },
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(volumes),
                    image_pull_secrets: image_pull_secrets(spec),
                    security_context: job_spec.security_context.clone(),
                    ..PodSpec::default()
                }),
            },
            ..BatchJobSpec::default()
        }),
        status: None,
    }
}

/// True when the only difference between two specs is manager scaling
/// (replicas or resources), which can be applied in place without
/// draining the job.
pub fn only_scaling_changed(current: &FlinkClusterSpec, next: &FlinkClusterSpec) -> bool {
    if current == next {
        return false;
    }
    let mut normalized_current = current.clone();
    let mut normalized_next = next.clone();
    normalized_current.job_manager.replicas = None;
    normalized_next.job_manager.replicas = None;
    normalized_current.task_manager.replicas = None;
    normalized_next.task_manager.replicas = None;
    normalized_current.job_manager.resources = Default::default();
    normalized_next.job_manager.resources = Default::default();
    normalized_current.task_manager.resources = Default::default();
    normalized_next.task_manager.resources = Default::default();
    normalized_current == normalized_next
}
