//! API endpoints module.

pub mod agents;
pub mod mailbox;
pub mod submit;

pub use agents::{get_agent, list_agents};
pub use mailbox::{relay_drain, relay_submit};
pub use submit::submit;
