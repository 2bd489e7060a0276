//! Envelope delivery: co-hosted agents, direct HTTP endpoints and mailbox relays.

pub mod directory;
pub mod mailbox;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::message::Envelope;

pub use directory::Directory;
pub use mailbox::{MailboxClient, MailboxStore};

/// Outcome of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Enqueued in a co-hosted agent's inbox.
    Delivered,
    /// Accepted by a remote bureau.
    Sent,
    /// Stored by a mailbox relay for later pickup.
    Queued,
}

/// Where a remote agent can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum Endpoint {
    /// Submit URL of the bureau hosting the agent.
    Direct(String),
    /// Base URL of the relay holding the agent's mailbox.
    Mailbox(String),
}

/// Inbox senders of the agents hosted by one bureau.
#[derive(Clone, Default)]
pub struct LocalRouter {
    inboxes: Arc<HashMap<Address, mpsc::Sender<Envelope>>>,
}

impl LocalRouter {
    pub fn new(inboxes: HashMap<Address, mpsc::Sender<Envelope>>) -> Self {
        Self {
            inboxes: Arc::new(inboxes),
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.inboxes.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.inboxes.keys()
    }

    /// Enqueue into the target's inbox, waiting at most `timeout` for room.
    pub async fn deliver(&self, envelope: Envelope, timeout: Duration) -> Result<()> {
        let target = envelope.target;
        let inbox = self
            .inboxes
            .get(&target)
            .ok_or_else(|| Error::Routing(target.to_string()))?;

        match tokio::time::timeout(timeout, inbox.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Delivery(format!("inbox of {} is closed", target.short()))),
            Err(_) => Err(Error::DeliveryTimeout(target.to_string())),
        }
    }
}

/// Resolves destinations and moves envelopes to them.
pub struct Dispatcher {
    local: LocalRouter,
    directory: Directory,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(local: LocalRouter, directory: Directory) -> Self {
        Self {
            local,
            directory,
            client: reqwest::Client::new(),
        }
    }

    pub fn local(&self) -> &LocalRouter {
        &self.local
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub async fn dispatch(&self, envelope: Envelope, timeout: Duration) -> Result<DeliveryStatus> {
        let target = envelope.target;

        if self.local.contains(&target) {
            self.local.deliver(envelope, timeout).await?;
            return Ok(DeliveryStatus::Delivered);
        }

        let endpoint = self
            .directory
            .lookup(&target)
            .ok_or_else(|| Error::Delivery(format!("no endpoint known for {}", target)))?
            .clone();

        let request = async {
            match &endpoint {
                Endpoint::Direct(url) => {
                    self.post(url, &envelope).await?;
                    Ok::<_, Error>(DeliveryStatus::Sent)
                }
                Endpoint::Mailbox(base) => {
                    let url = format!("{}/v1/mailbox/submit", base.trim_end_matches('/'));
                    self.post(&url, &envelope).await?;
                    Ok::<_, Error>(DeliveryStatus::Queued)
                }
            }
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| Error::DeliveryTimeout(target.to_string()))?
    }

    async fn post(&self, url: &str, envelope: &Envelope) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("unreadable reply from {} ({}): {}", url, status, e)))?;

        match body.status {
            SubmitStatus::Delivered => Ok(()),
            SubmitStatus::Rejected => Err(Error::Delivery(format!(
                "{} rejected envelope: {}",
                url,
                body.detail
                    .or_else(|| body.reason.map(|r| r.as_str().to_string()))
                    .unwrap_or_else(|| status.to_string())
            ))),
        }
    }
}

/// Body returned by submit endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SubmitResponse {
    pub fn delivered() -> Self {
        Self {
            status: SubmitStatus::Delivered,
            reason: None,
            detail: None,
        }
    }

    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            status: SubmitStatus::Rejected,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Delivered,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadSignature,
    Expired,
    UnknownTarget,
    Busy,
    Malformed,
}

impl RejectReason {
    /// Classify an inbound-path error.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::BadSignature(_) => Self::BadSignature,
            Error::Expired(_) => Self::Expired,
            Error::Routing(_) => Self::UnknownTarget,
            Error::Validation(_) | Error::Json(_) => Self::Malformed,
            _ => Self::Busy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadSignature => "bad_signature",
            Self::Expired => "expired",
            Self::UnknownTarget => "unknown_target",
            Self::Busy => "busy",
            Self::Malformed => "malformed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::message::{FieldKind, Schema};

    fn envelope(from: &Identity, to: &Identity) -> Envelope {
        let schema = Schema::builder("Ping").field("n", FieldKind::Int).build();
        Envelope::builder(from.address())
            .to(to.address())
            .schema(schema.digest())
            .payload(br#"{"n":1}"#.to_vec())
            .build_signed(from)
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let router = LocalRouter::new(HashMap::from([(bob.address(), tx)]));
        let dispatcher = Dispatcher::new(router, Directory::default());

        let status = dispatcher
            .dispatch(envelope(&alice, &bob), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(rx.recv().await.unwrap().sender, alice.address());
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let alice = Identity::from_seed("alice").unwrap();
        let nobody = Identity::from_seed("nobody").unwrap();
        let dispatcher = Dispatcher::new(LocalRouter::default(), Directory::default());

        let err = dispatcher
            .dispatch(envelope(&alice, &nobody), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_inbox_times_out() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let router = LocalRouter::new(HashMap::from([(bob.address(), tx)]));

        router
            .deliver(envelope(&alice, &bob), Duration::from_millis(100))
            .await
            .unwrap();
        let err = router
            .deliver(envelope(&alice, &bob), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliveryTimeout(_)));
    }

    #[tokio::test]
    async fn test_routing_error_for_foreign_target() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let router = LocalRouter::default();
        let err = router
            .deliver(envelope(&alice, &bob), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[test]
    fn test_submit_response_wire_format() {
        let ok = serde_json::to_value(SubmitResponse::delivered()).unwrap();
        assert_eq!(ok, serde_json::json!({"status": "delivered"}));

        let rejected = SubmitResponse::rejected(RejectReason::UnknownTarget, "no agent");
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["reason"], "unknown_target");
        assert_eq!(
            RejectReason::from_error(&Error::BadSignature("x".into())),
            RejectReason::BadSignature
        );
        assert_eq!(RejectReason::from_error(&Error::Expired(0)), RejectReason::Expired);
    }

    #[test]
    fn test_endpoint_wire_format() {
        let endpoint = Endpoint::Mailbox("http://relay:8000".to_string());
        let json = serde_json::to_value(&endpoint).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "mailbox", "url": "http://relay:8000"}));
    }
}
