//! Static address book for agents hosted elsewhere.

use std::collections::HashMap;

use crate::config::DirectoryEntry;
use crate::error::{Error, Result};
use crate::identity::Address;

use super::Endpoint;

#[derive(Debug, Clone, Default)]
pub struct Directory {
    entries: HashMap<Address, Endpoint>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration entries; a malformed address is a config error.
    pub fn from_entries(entries: &[DirectoryEntry]) -> Result<Self> {
        let mut directory = Self::new();
        for entry in entries {
            let address: Address = entry
                .address
                .parse()
                .map_err(|e| Error::Config(format!("directory entry '{}': {}", entry.address, e)))?;
            directory.register(address, entry.endpoint.clone());
        }
        Ok(directory)
    }

    /// Last registration for an address wins.
    pub fn register(&mut self, address: Address, endpoint: Endpoint) {
        if let Some(previous) = self.entries.insert(address, endpoint) {
            tracing::debug!("Replaced directory entry for {} (was {:?})", address.short(), previous);
        }
    }

    pub fn lookup(&self, address: &Address) -> Option<&Endpoint> {
        self.entries.get(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_from_entries() {
        let remote = Identity::from_seed("remote").unwrap().address();
        let entries = vec![DirectoryEntry {
            address: remote.to_string(),
            endpoint: Endpoint::Direct("http://10.0.0.2:8000/submit".to_string()),
        }];

        let directory = Directory::from_entries(&entries).unwrap();
        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.lookup(&remote),
            Some(&Endpoint::Direct("http://10.0.0.2:8000/submit".to_string()))
        );
    }

    #[test]
    fn test_bad_address_rejected() {
        let entries = vec![DirectoryEntry {
            address: "agentzz".to_string(),
            endpoint: Endpoint::Mailbox("http://relay".to_string()),
        }];
        assert!(matches!(Directory::from_entries(&entries), Err(Error::Config(_))));
    }

    #[test]
    fn test_register_replaces() {
        let remote = Identity::from_seed("remote").unwrap().address();
        let mut directory = Directory::new();
        directory.register(remote, Endpoint::Direct("http://a/submit".to_string()));
        directory.register(remote, Endpoint::Mailbox("http://relay".to_string()));
        assert_eq!(directory.lookup(&remote), Some(&Endpoint::Mailbox("http://relay".to_string())));
    }
}
