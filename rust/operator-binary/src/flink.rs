//! REST client for the Flink JobManager API.
//!
//! Only the four calls the reconciler needs are modelled: listing jobs,
//! triggering a savepoint (optionally cancelling the job with it),
//! polling a savepoint trigger and stopping a job. The trait keeps the
//! client pluggable so tests can observe calls without a JobManager.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Per-call timeout towards the JobManager.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build http client"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("request to {url} failed"))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("failed to decode response from {url}"))]
    Decode { url: String, source: reqwest::Error },

    #[snafu(display("unexpected status {status} from {url}"))]
    UnexpectedStatus {
        url: String,
        status: reqwest::StatusCode,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One entry of `/jobs/overview`.
#[derive(Clone, Debug, Deserialize)]
pub struct JobOverview {
    #[serde(rename = "jid")]
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(rename = "start-time", default)]
    pub start_time: i64,
    #[serde(rename = "end-time", default)]
    pub end_time: i64,
    #[serde(rename = "last-modification", default)]
    pub last_modification: i64,
}

impl JobOverview {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "FINISHED" | "FAILED" | "CANCELED")
    }
}

/// Result of polling a savepoint trigger.
#[derive(Clone, Debug, Default)]
pub struct SavepointOperation {
    pub completed: bool,
    pub location: Option<String>,
    pub failure_cause: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsOverviewResponse {
    jobs: Vec<JobOverview>,
}

#[derive(Debug, Serialize)]
struct SavepointTriggerRequest<'a> {
    #[serde(rename = "target-directory")]
    target_directory: &'a str,
    #[serde(rename = "cancel-job")]
    cancel_job: bool,
}

#[derive(Debug, Deserialize)]
struct SavepointTriggerResponse {
    #[serde(rename = "request-id")]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct SavepointInfoResponse {
    status: OperationQueueStatus,
    #[serde(default)]
    operation: Option<OperationResult>,
}

#[derive(Debug, Deserialize)]
struct OperationQueueStatus {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OperationResult {
    #[serde(default)]
    location: Option<String>,
    #[serde(rename = "failure-cause", default)]
    failure_cause: Option<FailureCause>,
}

#[derive(Debug, Deserialize)]
struct FailureCause {
    #[serde(rename = "class", default)]
    class: Option<String>,
    #[serde(rename = "stack-trace", default)]
    stack_trace: Option<String>,
}

#[async_trait]
pub trait FlinkApi: Send + Sync {
    /// Jobs currently known to the JobManager.
    async fn get_jobs(&self, endpoint: &str) -> Result<Vec<JobOverview>>;

    /// Trigger a savepoint, optionally cancelling the job with it.
    /// Returns the trigger id to poll with [`FlinkApi::get_savepoint`].
    async fn trigger_savepoint(
        &self,
        endpoint: &str,
        job_id: &str,
        directory: &str,
        cancel_job: bool,
    ) -> Result<String>;

    async fn get_savepoint(
        &self,
        endpoint: &str,
        job_id: &str,
        trigger_id: &str,
    ) -> Result<SavepointOperation>;

    /// Cancel a job without taking a savepoint.
    async fn stop_job(&self, endpoint: &str, job_id: &str) -> Result<()>;
}

pub struct HttpFlinkApi {
    client: reqwest::Client,
}

impl HttpFlinkApi {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildClientSnafu)?;
        Ok(HttpFlinkApi { client })
    }
}

#[async_trait]
impl FlinkApi for HttpFlinkApi {
    async fn get_jobs(&self, endpoint: &str) -> Result<Vec<JobOverview>> {
        let url = format!("{endpoint}/jobs/overview");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return UnexpectedStatusSnafu {
                url,
                status: response.status(),
            }
            .fail();
        }
        let overview: JobsOverviewResponse = response
            .json()
            .await
            .context(DecodeSnafu { url: url.clone() })?;
        Ok(overview.jobs)
    }

    async fn trigger_savepoint(
        &self,
        endpoint: &str,
        job_id: &str,
        directory: &str,
        cancel_job: bool,
    ) -> Result<String> {
        let url = format!("{endpoint}/jobs/{job_id}/savepoints");
        let body = SavepointTriggerRequest {
            target_directory: directory,
            cancel_job,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return UnexpectedStatusSnafu {
                url,
                status: response.status(),
            }
            .fail();
        }
        let trigger: SavepointTriggerResponse = response
            .json()
            .await
            .context(DecodeSnafu { url: url.clone() })?;
        Ok(trigger.request_id)
    }

    async fn get_savepoint(
        &self,
        endpoint: &str,
        job_id: &str,
        trigger_id: &str,
    ) -> Result<SavepointOperation> {
        let url = format!("{endpoint}/jobs/{job_id}/savepoints/{trigger_id}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return UnexpectedStatusSnafu {
                url,
                status: response.status(),
            }
            .fail();
        }
        let info: SavepointInfoResponse = response
            .json()
            .await
            .context(DecodeSnafu { url: url.clone() })?;
        let completed = info.status.id == "COMPLETED";
        let (location, failure_cause) = match info.operation {
            Some(operation) => {
                let failure = operation.failure_cause.map(|cause| {
                    cause
                        .class
                        .or(cause.stack_trace)
                        .unwrap_or_else(|| "savepoint failed".to_string())
                });
                (operation.location, failure)
            }
            None => (None, None),
        };
        Ok(SavepointOperation {
            completed,
            location,
            failure_cause,
        })
    }

    async fn stop_job(&self, endpoint: &str, job_id: &str) -> Result<()> {
        let url = format!("{endpoint}/jobs/{job_id}?mode=cancel");
        let response = self
            .client
            .patch(&url)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        if !response.status().is_success() {
            return UnexpectedStatusSnafu {
                url,
                status: response.status(),
            }
            .fail();
        }
        Ok(())
    }
}
