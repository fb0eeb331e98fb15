//! Connected Wi-Fi-Direct clients of a group owner, keyed by supplicant object path.

use std::collections::BTreeMap;

use crate::control::{MacAddr, PeerProperties};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub path: String,
    pub device_address: Option<MacAddr>,
    pub device_name: String,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.peers.contains_key(path)
    }

    /// Track a peer. Returns false if the path was already tracked.
    pub fn insert(&mut self, path: &str, props: PeerProperties) -> bool {
        if self.peers.contains_key(path) {
            return false;
        }
        self.peers.insert(
            path.to_string(),
            Peer {
                path: path.to_string(),
                device_address: props.device_address,
                device_name: props.device_name,
            },
        );
        true
    }

    pub fn remove(&mut self, path: &str) -> Option<Peer> {
        self.peers.remove(path)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Drop every peer, returning them in path order.
    pub fn drain(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_is_noop() {
        let mut table = PeerTable::new();
        assert!(table.insert("/peers/a", PeerProperties::default()));
        assert!(!table.insert(
            "/peers/a",
            PeerProperties {
                device_address: None,
                device_name: "other".into(),
            }
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().next().unwrap().device_name, "");
    }

    #[test]
    fn drain_empties_table() {
        let mut table = PeerTable::new();
        table.insert("/peers/b", PeerProperties::default());
        table.insert("/peers/a", PeerProperties::default());
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].path, "/peers/a");
        assert!(table.is_empty());
        assert!(table.remove("/peers/a").is_none());
    }
}
