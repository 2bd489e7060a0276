//! API endpoints for hosted agents.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::agent::{AgentManifest, AgentState};
use crate::bureau::BureauState;
use crate::identity::Address;

/// Agent API response.
#[derive(Serialize)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub manifest: AgentManifest,
    pub state: Option<AgentState>,
}

fn describe(state: &BureauState, manifest: &AgentManifest) -> AgentResponse {
    AgentResponse {
        manifest: manifest.clone(),
        state: state.agent_state(&manifest.address),
    }
}

/// List all hosted agents.
pub async fn list_agents(State(state): State<Arc<BureauState>>) -> Json<Vec<AgentResponse>> {
    let agents = state
        .agents()
        .iter()
        .map(|manifest| describe(&state, manifest))
        .collect();

    Json(agents)
}

/// Get a single agent.
pub async fn get_agent(
    State(state): State<Arc<BureauState>>,
    Path(address): Path<String>,
) -> Result<Json<AgentResponse>, StatusCode> {
    let address: Address = address.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let manifest = state.agent(&address).ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(describe(&state, manifest)))
}
