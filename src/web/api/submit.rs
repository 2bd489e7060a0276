//! Envelope submission endpoint.

use std::sync::Arc;

use axum::{extract::rejection::JsonRejection, extract::State, http::StatusCode, Json};

use crate::bureau::BureauState;
use crate::error::Error;
use crate::message::Envelope;
use crate::transport::{RejectReason, SubmitResponse};

/// HTTP status for a rejection.
pub fn status_for(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::BadSignature => StatusCode::UNAUTHORIZED,
        RejectReason::Expired => StatusCode::GONE,
        RejectReason::UnknownTarget => StatusCode::NOT_FOUND,
        RejectReason::Busy => StatusCode::SERVICE_UNAVAILABLE,
        RejectReason::Malformed => StatusCode::BAD_REQUEST,
    }
}

/// Map an inbound-path error to a reject response.
pub fn reject(error: &Error) -> (StatusCode, Json<SubmitResponse>) {
    let reason = RejectReason::from_error(error);
    (
        status_for(reason),
        Json(SubmitResponse::rejected(reason, error.to_string())),
    )
}

pub(crate) fn malformed(rejection: JsonRejection) -> (StatusCode, Json<SubmitResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(SubmitResponse::rejected(RejectReason::Malformed, rejection.body_text())),
    )
}

/// Accept one envelope for a hosted agent.
///
/// An envelope for a schema the agent has no handler for is still
/// reported as delivered; the agent drops it.
pub async fn submit(
    State(state): State<Arc<BureauState>>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> (StatusCode, Json<SubmitResponse>) {
    let Json(envelope) = match payload {
        Ok(envelope) => envelope,
        Err(rejection) => return malformed(rejection),
    };

    let sender = envelope.sender;
    match state.submit(envelope).await {
        Ok(()) => (StatusCode::OK, Json(SubmitResponse::delivered())),
        Err(e) => {
            tracing::debug!("Rejected envelope from {}: {}", sender.short(), e);
            reject(&e)
        }
    }
}
