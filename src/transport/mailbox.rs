//! Mailbox relay: holds envelopes for agents that do not listen directly.
//!
//! The relay side is a [`MailboxStore`] served over HTTP by the web layer.
//! Agents in mailbox mode run a [`MailboxClient`] that periodically drains
//! their mailbox with a signed timestamp proving ownership of the address.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{self, Address, Identity};
use crate::message::envelope::current_timestamp;
use crate::message::Envelope;

/// Maximum envelopes held per mailbox; the oldest are dropped beyond this.
pub const MAX_MAILBOX_SIZE: usize = 1000;

/// Accepted clock skew for signed drain requests (ms).
pub const AUTH_WINDOW_MS: u64 = 60_000;

pub const TIMESTAMP_HEADER: &str = "x-mailbox-timestamp";
pub const SIGNATURE_HEADER: &str = "x-mailbox-signature";

const MAILBOX_DIR: &str = "mailboxes";

/// An envelope waiting in a mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub id: String,
    pub received_at: i64,
    pub envelope: Envelope,
}

/// One address's pending envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: Address,
    pub entries: VecDeque<MailboxEntry>,
    pub total_received: u64,
    pub total_dropped: u64,
    pub last_activity: i64,
    /// Entry lines appended to the journal since its last snapshot.
    #[serde(skip)]
    journal_len: usize,
}

impl Mailbox {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            entries: VecDeque::new(),
            total_received: 0,
            total_dropped: 0,
            last_activity: current_timestamp(),
            journal_len: 0,
        }
    }

    /// Append an envelope, returning its entry id.
    pub fn deliver(&mut self, envelope: Envelope) -> String {
        let entry = MailboxEntry {
            id: ulid::Ulid::new().to_string(),
            received_at: current_timestamp(),
            envelope,
        };
        let id = entry.id.clone();
        self.push(entry);
        id
    }

    fn push(&mut self, entry: MailboxEntry) {
        self.last_activity = entry.received_at;
        self.entries.push_back(entry);
        self.total_received += 1;
        self.prune_if_needed();
    }

    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.envelope.is_expired());
        before - self.entries.len()
    }

    /// Remove and return every live envelope, oldest first.
    pub fn take_all(&mut self) -> Vec<Envelope> {
        self.purge_expired();
        self.last_activity = current_timestamp();
        self.entries.drain(..).map(|e| e.envelope).collect()
    }

    fn prune_if_needed(&mut self) {
        while self.entries.len() > MAX_MAILBOX_SIZE {
            self.entries.pop_front();
            self.total_dropped += 1;
        }
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            address: self.address,
            pending: self.entries.len(),
            total_received: self.total_received,
            total_dropped: self.total_dropped,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxStats {
    pub address: Address,
    pub pending: usize,
    pub total_received: u64,
    pub total_dropped: u64,
    pub last_activity: i64,
}

/// One line of a mailbox journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JournalLine {
    Snapshot(Mailbox),
    Entry(MailboxEntry),
}

/// All mailboxes served by one relay, optionally persisted as JSONL.
///
/// Each delivery appends its entry as one line; loading replays entries on
/// top of the last snapshot line. Draining, or `MAX_MAILBOX_SIZE` appends,
/// rewrites the file as a single snapshot.
#[derive(Debug)]
pub struct MailboxStore {
    base_path: Option<PathBuf>,
    cache: Mutex<HashMap<Address, Mailbox>>,
}

impl MailboxStore {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().join(MAILBOX_DIR);
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path: Some(base_path),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            base_path: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Address, Mailbox>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_mailbox<T>(&self, address: &Address, f: impl FnOnce(&mut Mailbox) -> T) -> T {
        let mut cache = self.lock();
        let mailbox = cache
            .entry(*address)
            .or_insert_with(|| self.load_mailbox(address).unwrap_or_else(|| Mailbox::new(*address)));
        f(mailbox)
    }

    /// Verify and store an envelope for its target.
    pub fn deliver(&self, envelope: Envelope) -> Result<String> {
        envelope.verify()?;
        let target = envelope.target;
        let id = self.with_mailbox(&target, |mailbox| {
            mailbox.purge_expired();
            let id = mailbox.deliver(envelope);
            if mailbox.journal_len >= MAX_MAILBOX_SIZE {
                self.write_snapshot(mailbox)?;
            } else if let Some(entry) = mailbox.entries.back() {
                self.append_entry(mailbox, entry)?;
                mailbox.journal_len += 1;
            }
            Ok::<_, Error>(id)
        })?;
        tracing::debug!("Stored envelope {} for {}", id, target.short());
        Ok(id)
    }

    /// Remove and return everything pending for `address`.
    pub fn drain(&self, address: &Address) -> Result<Vec<Envelope>> {
        self.with_mailbox(address, |mailbox| {
            let envelopes = mailbox.take_all();
            if !envelopes.is_empty() || mailbox.journal_len > 0 {
                self.write_snapshot(mailbox)?;
            }
            Ok::<_, Error>(envelopes)
        })
    }

    pub fn pending(&self, address: &Address) -> usize {
        self.with_mailbox(address, |mailbox| mailbox.entries.len())
    }

    pub fn all_stats(&self) -> Vec<MailboxStats> {
        self.lock().values().map(|m| m.stats()).collect()
    }

    pub fn purge_all_expired(&self) -> usize {
        self.lock().values_mut().map(|m| m.purge_expired()).sum()
    }

    /// Rewrite a mailbox file to its current state only.
    pub fn compact(&self, address: &Address) -> Result<()> {
        self.with_mailbox(address, |mailbox| self.write_snapshot(mailbox))
    }

    fn mailbox_path(&self, address: &Address) -> Option<PathBuf> {
        self.base_path
            .as_ref()
            .map(|base| base.join(format!("{}.jsonl", address)))
    }

    fn load_mailbox(&self, address: &Address) -> Option<Mailbox> {
        let path = self.mailbox_path(address)?;
        let file = File::open(&path).ok()?;
        let mut mailbox = Mailbox::new(*address);

        for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
            match serde_json::from_str(&line) {
                Ok(JournalLine::Snapshot(snapshot)) => mailbox = snapshot,
                Ok(JournalLine::Entry(entry)) => {
                    mailbox.push(entry);
                    mailbox.journal_len += 1;
                }
                Err(e) => tracing::warn!("Skipping unreadable line in {}: {}", path.display(), e),
            }
        }
        Some(mailbox)
    }

    fn append_entry(&self, mailbox: &Mailbox, entry: &MailboxEntry) -> Result<()> {
        let Some(path) = self.mailbox_path(&mailbox.address) else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(&JournalLine::Entry(entry.clone()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn write_snapshot(&self, mailbox: &mut Mailbox) -> Result<()> {
        mailbox.journal_len = 0;
        let Some(path) = self.mailbox_path(&mailbox.address) else {
            return Ok(());
        };
        let mut file = File::create(&path)?;
        let line = serde_json::to_string(&JournalLine::Snapshot(mailbox.clone()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

fn auth_payload(address: &Address, timestamp: i64) -> Vec<u8> {
    format!("tinybureau-mailbox:{}:{}", address, timestamp).into_bytes()
}

/// Hex signature proving control of `identity`'s address at `timestamp`.
pub fn sign_request(identity: &Identity, timestamp: i64) -> String {
    hex::encode(identity.sign(&auth_payload(&identity.address(), timestamp)))
}

/// Check a drain request's signed timestamp against `now` (unix ms).
pub fn verify_request(address: &Address, timestamp: i64, signature: &str, now: i64) -> Result<()> {
    if now.abs_diff(timestamp) > AUTH_WINDOW_MS {
        return Err(Error::Expired(timestamp));
    }
    let signature = hex::decode(signature).map_err(|_| Error::BadSignature(address.to_string()))?;
    if !identity::verify(address, &auth_payload(address, timestamp), &signature) {
        return Err(Error::BadSignature(address.to_string()));
    }
    Ok(())
}

/// Body of a drain response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainResponse {
    pub envelopes: Vec<Envelope>,
}

/// Polls a relay for one agent's mailbox.
#[derive(Clone)]
pub struct MailboxClient {
    base_url: String,
    identity: Identity,
    client: reqwest::Client,
}

impl MailboxClient {
    pub fn new(base_url: impl Into<String>, identity: Identity) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn poll(&self) -> Result<Vec<Envelope>> {
        let timestamp = current_timestamp();
        let url = format!("{}/v1/mailbox/{}", self.base_url, self.identity.address());
        let response = self
            .client
            .get(&url)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, sign_request(&self.identity, timestamp))
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("mailbox poll of {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Delivery(format!(
                "mailbox poll of {} returned {}",
                url,
                response.status()
            )));
        }

        let body: DrainResponse = response
            .json()
            .await
            .map_err(|e| Error::Delivery(format!("unreadable mailbox reply from {}: {}", url, e)))?;
        Ok(body.envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FieldKind, Schema};

    fn envelope(from: &Identity, to: &Identity, ttl: Option<u64>) -> Envelope {
        let schema = Schema::builder("Note").field("text", FieldKind::String).build();
        let mut builder = Envelope::builder(from.address())
            .to(to.address())
            .schema(schema.digest())
            .payload(br#"{"text":"hello"}"#.to_vec());
        if let Some(ttl) = ttl {
            builder = builder.ttl(ttl);
        }
        builder.build_signed(from).unwrap()
    }

    #[test]
    fn test_deliver_and_drain() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let store = MailboxStore::in_memory();

        store.deliver(envelope(&alice, &bob, None)).unwrap();
        store.deliver(envelope(&alice, &bob, Some(60))).unwrap();
        assert_eq!(store.pending(&bob.address()), 2);

        let drained = store.drain(&bob.address()).unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|e| e.sender == alice.address()));
        assert_eq!(store.pending(&bob.address()), 0);
        assert!(store.drain(&bob.address()).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_signature() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let store = MailboxStore::in_memory();

        let mut forged = envelope(&alice, &bob, None);
        forged.payload = br#"{"text":"forged"}"#.to_vec();
        assert!(matches!(store.deliver(forged), Err(Error::BadSignature(_))));
        assert_eq!(store.pending(&bob.address()), 0);
    }

    #[test]
    fn test_expired_entries_are_purged() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let mut mailbox = Mailbox::new(bob.address());

        let mut stale = envelope(&alice, &bob, Some(60));
        stale.expires_at = Some(current_timestamp() - 1);
        mailbox.deliver(stale);
        mailbox.deliver(envelope(&alice, &bob, None));

        assert_eq!(mailbox.purge_expired(), 1);
        assert_eq!(mailbox.take_all().len(), 1);
    }

    #[test]
    fn test_size_cap_drops_oldest() {
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let mut mailbox = Mailbox::new(bob.address());
        let template = envelope(&alice, &bob, None);

        let first = mailbox.deliver(template.clone());
        for _ in 0..MAX_MAILBOX_SIZE {
            mailbox.deliver(template.clone());
        }

        assert_eq!(mailbox.entries.len(), MAX_MAILBOX_SIZE);
        assert_eq!(mailbox.total_dropped, 1);
        assert!(mailbox.entries.iter().all(|e| e.id != first));
    }

    #[test]
    fn test_persistence_and_compaction() {
        let temp_dir = tempfile::tempdir().unwrap();
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();

        {
            let store = MailboxStore::new(temp_dir.path()).unwrap();
            store.deliver(envelope(&alice, &bob, None)).unwrap();
            store.deliver(envelope(&alice, &bob, None)).unwrap();
        }

        let path = temp_dir
            .path()
            .join("mailboxes")
            .join(format!("{}.jsonl", bob.address()));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        let store = MailboxStore::new(temp_dir.path()).unwrap();
        assert_eq!(store.pending(&bob.address()), 2);
        store.compact(&bob.address()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);

        assert_eq!(store.drain(&bob.address()).unwrap().len(), 2);
        let reopened = MailboxStore::new(temp_dir.path()).unwrap();
        assert_eq!(reopened.pending(&bob.address()), 0);
    }

    #[test]
    fn test_journal_stays_bounded_without_drain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let alice = Identity::from_seed("alice").unwrap();
        let bob = Identity::from_seed("bob").unwrap();
        let template = envelope(&alice, &bob, None);
        let deliveries = 2 * MAX_MAILBOX_SIZE + 5;

        {
            let store = MailboxStore::new(temp_dir.path()).unwrap();
            for _ in 0..deliveries {
                store.deliver(template.clone()).unwrap();
            }
        }

        let path = temp_dir
            .path()
            .join("mailboxes")
            .join(format!("{}.jsonl", bob.address()));
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.lines().count() <= MAX_MAILBOX_SIZE + 1);

        let entry_len = serde_json::to_string(&MailboxEntry {
            id: ulid::Ulid::new().to_string(),
            received_at: current_timestamp(),
            envelope: template.clone(),
        })
        .unwrap()
        .len();
        assert!(contents.len() < 2 * (MAX_MAILBOX_SIZE + 1) * (entry_len + 64));

        let reopened = MailboxStore::new(temp_dir.path()).unwrap();
        assert_eq!(reopened.pending(&bob.address()), MAX_MAILBOX_SIZE);
        let stats = reopened.all_stats();
        assert_eq!(stats[0].total_received, deliveries as u64);
        assert_eq!(stats[0].total_dropped, (deliveries - MAX_MAILBOX_SIZE) as u64);
    }

    #[test]
    fn test_drain_timestamp_extremes_are_expired() {
        let bob = Identity::from_seed("bob").unwrap();
        let now = current_timestamp();

        for timestamp in [i64::MIN, i64::MAX] {
            let signature = sign_request(&bob, timestamp);
            assert!(matches!(
                verify_request(&bob.address(), timestamp, &signature, now),
                Err(Error::Expired(_))
            ));
        }
        assert!(matches!(
            verify_request(&bob.address(), 0, "00", i64::MIN),
            Err(Error::Expired(_))
        ));
    }

    #[test]
    fn test_signed_drain_request() {
        let bob = Identity::from_seed("bob").unwrap();
        let mallory = Identity::from_seed("mallory").unwrap();
        let now = current_timestamp();

        let signature = sign_request(&bob, now);
        assert!(verify_request(&bob.address(), now, &signature, now + 1_000).is_ok());

        assert!(matches!(
            verify_request(&bob.address(), now, &signature, now + AUTH_WINDOW_MS as i64 + 1),
            Err(Error::Expired(_))
        ));

        let forged = sign_request(&mallory, now);
        assert!(matches!(
            verify_request(&bob.address(), now, &forged, now),
            Err(Error::BadSignature(_))
        ));
        assert!(matches!(
            verify_request(&bob.address(), now, "not hex", now),
            Err(Error::BadSignature(_))
        ));
    }
}
