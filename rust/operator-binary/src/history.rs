//! Revision history for accepted cluster specs.
//!
//! Every accepted spec is persisted as an `apps/v1 ControllerRevision`
//! owned by the cluster, numbered strictly increasing. The history is
//! what makes rolling updates traceable and lets an interrupted update
//! resume: the *current* revision is the one the live workloads were
//! rendered from (matched by hash annotation), the *next* revision is
//! the most recently accepted spec.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};

use flink_crd::{
    spec_revision_hash, FlinkCluster, FlinkClusterSpec, CLUSTER_NAME_LABEL,
    REVISION_HASH_ANNOTATION,
};

/// Revisions kept per cluster before pruning.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to list revisions"))]
    ListRevisions { source: kube::Error },

    #[snafu(display("failed to create revision {name}"))]
    CreateRevision { name: String, source: kube::Error },

    #[snafu(display("failed to delete revision {name}"))]
    DeleteRevision { name: String, source: kube::Error },

    #[snafu(display("failed to decode revision data"))]
    DecodeRevision { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A persisted snapshot of an accepted spec.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    pub name: String,
    pub number: i64,
    pub hash: String,
    pub spec: FlinkClusterSpec,
}

#[async_trait]
pub trait ClusterHistory: Send + Sync {
    /// Revisions of the cluster, oldest first.
    async fn list(&self, cluster: &FlinkCluster) -> Result<Vec<Revision>>;

    /// Persist the cluster's spec as a new revision if its hash is not
    /// recorded yet. Returns the revision the spec maps to, or `None`
    /// when the latest revision already matches.
    async fn snapshot(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
    ) -> Result<Option<Revision>>;

    /// Delete the oldest revisions exceeding `keep`, never the current.
    async fn prune(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
        keep: usize,
        current: Option<&str>,
    ) -> Result<()>;
}

/// Yield `(current, next)` for a revision list.
///
/// `next` is the revision recording the cluster's present spec (always
/// present after a snapshot). `current` is the revision the observed
/// workloads were rendered from; before anything is deployed it equals
/// `next`.
pub fn classify<'a>(
    revisions: &'a [Revision],
    cluster_spec_hash: &str,
    workload_hash: Option<&str>,
) -> (Option<&'a Revision>, Option<&'a Revision>) {
    let next = revisions
        .iter()
        .rev()
        .find(|revision| revision.hash == cluster_spec_hash)
        .or_else(|| revisions.last());
    let current = workload_hash
        .and_then(|hash| {
            revisions
                .iter()
                .rev()
                .find(|revision| revision.hash == hash)
        })
        .or(next);
    (current, next)
}

/// History backed by ControllerRevision objects in the cluster's
/// namespace.
#[derive(Clone)]
pub struct ControllerRevisionHistory {
    client: Client,
}

impl ControllerRevisionHistory {
    pub fn new(client: Client) -> Self {
        ControllerRevisionHistory { client }
    }

    fn api(&self, cluster: &FlinkCluster) -> Result<Api<ControllerRevision>> {
        let namespace = cluster.namespace().context(NoNamespaceSnafu)?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

fn revision_from_object(object: &ControllerRevision) -> Result<Revision> {
    let hash = object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(REVISION_HASH_ANNOTATION))
        .cloned()
        .unwrap_or_default();
    let spec = match &object.data {
        Some(RawExtension(value)) => {
            serde_json::from_value(value.clone()).context(DecodeRevisionSnafu)?
        }
        None => FlinkClusterSpec::default(),
    };
    Ok(Revision {
        name: object.name_any(),
        number: object.revision,
        hash,
        spec,
    })
}

#[async_trait]
impl ClusterHistory for ControllerRevisionHistory {
    async fn list(&self, cluster: &FlinkCluster) -> Result<Vec<Revision>> {
        let api = self.api(cluster)?;
        let selector = format!("{CLUSTER_NAME_LABEL}={}", cluster.name_any());
        let params = ListParams::default().labels(&selector);
        let objects = api.list(&params).await.context(ListRevisionsSnafu)?;
        let mut revisions = objects
            .items
            .iter()
            .map(revision_from_object)
            .collect::<Result<Vec<_>>>()?;
        revisions.sort_by_key(|revision| revision.number);
        Ok(revisions)
    }

    async fn snapshot(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
    ) -> Result<Option<Revision>> {
        let hash = spec_revision_hash(&cluster.spec);
        if revisions
            .last()
            .map(|revision| revision.hash == hash)
            .unwrap_or(false)
        {
            return Ok(None);
        }
        // A rollback to an already recorded spec needs no new object.
        if let Some(existing) = revisions.iter().find(|revision| revision.hash == hash) {
            return Ok(Some(existing.clone()));
        }

        let number = revisions
            .last()
            .map(|revision| revision.number + 1)
            .unwrap_or(1);
        let name = format!("{}-{hash}", cluster.name_any());
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
        let mut annotations = BTreeMap::new();
        annotations.insert(REVISION_HASH_ANNOTATION.to_string(), hash.clone());

        let object = ControllerRevision {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: cluster.namespace(),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: cluster
                    .controller_owner_ref(&())
                    .map(|reference| vec![reference]),
                ..ObjectMeta::default()
            },
            revision: number,
            data: Some(RawExtension(
                serde_json::to_value(&cluster.spec).context(DecodeRevisionSnafu)?,
            )),
        };

        let api = self.api(cluster)?;
        match api.create(&PostParams::default(), &object).await {
            Ok(created) => Ok(Some(revision_from_object(&created)?)),
            // Lost a race against a concurrent write; the next
            // observation picks the winner up.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(None),
            Err(source) => Err(Error::CreateRevision { name, source }),
        }
    }

    async fn prune(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
        keep: usize,
        current: Option<&str>,
    ) -> Result<()> {
        if revisions.len() <= keep {
            return Ok(());
        }
        let api = self.api(cluster)?;
        let excess = revisions.len() - keep;
        for revision in revisions
            .iter()
            .filter(|revision| Some(revision.name.as_str()) != current)
            .take(excess)
        {
            api.delete(&revision.name, &DeleteParams::default())
                .await
                .map_err(|source| Error::DeleteRevision {
                    name: revision.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

/// In-memory history for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryHistory {
    revisions: std::sync::Mutex<BTreeMap<String, Vec<Revision>>>,
}

#[cfg(test)]
impl MemoryHistory {
    fn key(cluster: &FlinkCluster) -> String {
        format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        )
    }
}

#[cfg(test)]
#[async_trait]
impl ClusterHistory for MemoryHistory {
    async fn list(&self, cluster: &FlinkCluster) -> Result<Vec<Revision>> {
        let revisions = self.revisions.lock().expect("poisoned");
        Ok(revisions
            .get(&Self::key(cluster))
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
    ) -> Result<Option<Revision>> {
        let hash = spec_revision_hash(&cluster.spec);
        if revisions
            .last()
            .map(|revision| revision.hash == hash)
            .unwrap_or(false)
        {
            return Ok(None);
        }
        if let Some(existing) = revisions.iter().find(|revision| revision.hash == hash) {
            return Ok(Some(existing.clone()));
        }
        let number = revisions
            .last()
            .map(|revision| revision.number + 1)
            .unwrap_or(1);
        let revision = Revision {
            name: format!("{}-{hash}", cluster.name_any()),
            number,
            hash,
            spec: cluster.spec.clone(),
        };
        let mut store = self.revisions.lock().expect("poisoned");
        store
            .entry(Self::key(cluster))
            .or_default()
            .push(revision.clone());
        Ok(Some(revision))
    }

    async fn prune(
        &self,
        cluster: &FlinkCluster,
        revisions: &[Revision],
        keep: usize,
        current: Option<&str>,
    ) -> Result<()> {
        if revisions.len() <= keep {
            return Ok(());
        }
        let excess = revisions.len() - keep;
        let doomed: Vec<String> = revisions
            .iter()
            .filter(|revision| Some(revision.name.as_str()) != current)
            .take(excess)
            .map(|revision| revision.name.clone())
            .collect();
        let mut store = self.revisions.lock().expect("poisoned");
        if let Some(entries) = store.get_mut(&Self::key(cluster)) {
            entries.retain(|revision| !doomed.contains(&revision.name));
        }
        Ok(())
    }
}
