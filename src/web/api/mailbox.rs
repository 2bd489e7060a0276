//! Mailbox relay endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use super::submit::{malformed, reject};
use crate::bureau::BureauState;
use crate::error::Error;
use crate::identity::Address;
use crate::message::envelope::current_timestamp;
use crate::message::Envelope;
use crate::transport::mailbox::{self, DrainResponse, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::transport::SubmitResponse;

/// Store an envelope until its target polls for it.
pub async fn relay_submit(
    State(state): State<Arc<BureauState>>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> (StatusCode, Json<SubmitResponse>) {
    let Json(envelope) = match payload {
        Ok(envelope) => envelope,
        Err(rejection) => return malformed(rejection),
    };
    let Some(store) = state.mailbox() else {
        return reject(&Error::Routing(envelope.target.to_string()));
    };

    match store.deliver(envelope) {
        Ok(_) => (StatusCode::OK, Json(SubmitResponse::delivered())),
        Err(e) => reject(&e),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Hand over everything pending for an address to its owner.
pub async fn relay_drain(
    State(state): State<Arc<BureauState>>,
    Path(address): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DrainResponse>, StatusCode> {
    let store = state.mailbox().ok_or(StatusCode::NOT_FOUND)?;
    let address: Address = address.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let timestamp: i64 = header(&headers, TIMESTAMP_HEADER)
        .and_then(|t| t.parse().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let signature = header(&headers, SIGNATURE_HEADER).ok_or(StatusCode::UNAUTHORIZED)?;

    mailbox::verify_request(&address, timestamp, signature, current_timestamp()).map_err(|e| {
        tracing::warn!("Refused mailbox drain for {}: {}", address.short(), e);
        StatusCode::UNAUTHORIZED
    })?;

    let envelopes = store.drain(&address).map_err(|e| {
        tracing::error!("Mailbox drain for {} failed: {}", address.short(), e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(DrainResponse { envelopes }))
}
