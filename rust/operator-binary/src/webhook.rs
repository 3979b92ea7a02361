//! Admission webhook gating create and update requests.
//!
//! The orchestrator posts an `AdmissionReview` to `/validate`; the
//! validator from the CRD crate decides, and denials carry a single
//! field-qualified line. TLS is terminated in front of the operator.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{info, warn};
use warp::Filter;

use flink_crd::validation::{SystemClock, Validator};
use flink_crd::FlinkCluster;

pub async fn run(port: u16) {
    let validate = warp::path("validate")
        .and(warp::post())
        .and(warp::body::json())
        .map(|review: AdmissionReview<FlinkCluster>| {
            let response = handle(review);
            warp::reply::json(&response.into_review())
        });
    let health = warp::path("healthz").map(|| "ok");

    info!(port, "starting admission webhook");
    warp::serve(validate.or(health))
        .run(([0, 0, 0, 0], port))
        .await;
}

fn handle(review: AdmissionReview<FlinkCluster>) -> AdmissionResponse {
    let request: AdmissionRequest<FlinkCluster> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "malformed admission review");
            return AdmissionResponse::invalid(error.to_string());
        }
    };

    let response = AdmissionResponse::from(&request);
    let clock = SystemClock;
    let validator = Validator::new(&clock);

    let verdict = match request.operation {
        Operation::Create => match request.object.as_ref() {
            Some(new) => validator.validate_create(new),
            None => Ok(()),
        },
        Operation::Update => match (request.old_object.as_ref(), request.object.as_ref()) {
            (Some(old), Some(new)) => validator.validate_update(old, new),
            _ => Ok(()),
        },
        _ => Ok(()),
    };

    match verdict {
        Ok(()) => response,
        Err(error) => {
            info!(cluster = ?request.name, reason = %error, "admission denied");
            response.deny(error.to_string())
        }
    }
}
