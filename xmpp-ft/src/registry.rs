//! Registry of live transfers for one account
//!
//! Records are keyed by negotiation id, with a secondary index on the
//! bytestream id so that IBB and SOCKS5 traffic can find its transfer.
//! Only the controller inserts and removes records; other components look
//! them up and mutate them in place.

use std::collections::HashMap;

use xmpp_ft_common::Jid;

use crate::record::FileTransferRecord;

#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<String, FileTransferRecord>,
    /// transport sid -> sid
    by_transport: HashMap<String, String>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous record with the same sid
    pub(crate) fn insert(&mut self, record: FileTransferRecord) {
        if let Some(old) = self.transfers.get(&record.sid) {
            self.by_transport.remove(&old.transport_sid);
        }
        self.by_transport
            .insert(record.transport_sid.clone(), record.sid.clone());
        self.transfers.insert(record.sid.clone(), record);
    }

    /// Remove a record; returns `None` if it was already gone
    pub(crate) fn remove(&mut self, sid: &str) -> Option<FileTransferRecord> {
        let record = self.transfers.remove(sid)?;
        self.by_transport.remove(&record.transport_sid);
        Some(record)
    }

    /// Re-index after a record's transport sid changed
    pub(crate) fn reindex(&mut self, sid: &str) {
        self.by_transport.retain(|_, v| v != sid);
        if let Some(record) = self.transfers.get(sid) {
            self.by_transport
                .insert(record.transport_sid.clone(), sid.to_string());
        }
    }

    pub fn get(&self, sid: &str) -> Option<&FileTransferRecord> {
        self.transfers.get(sid)
    }

    pub fn get_mut(&mut self, sid: &str) -> Option<&mut FileTransferRecord> {
        self.transfers.get_mut(sid)
    }

    /// Look up by bytestream id, falling back to the negotiation id
    pub fn get_by_transport_mut(&mut self, transport_sid: &str) -> Option<&mut FileTransferRecord> {
        let sid = self
            .by_transport
            .get(transport_sid)
            .cloned()
            .unwrap_or_else(|| transport_sid.to_string());
        self.transfers.get_mut(&sid)
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.transfers.contains_key(sid)
    }

    /// Ids of transfers whose peer matches the predicate
    pub fn sids_matching<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&FileTransferRecord) -> bool,
    {
        self.transfers
            .values()
            .filter(|r| predicate(r))
            .map(|r| r.sid.clone())
            .collect()
    }

    /// Ids of transfers with the given contact on either side
    pub fn sids_for_contact(&self, contact: &Jid) -> Vec<String> {
        self.sids_matching(|r| r.sender.same_bare(contact) || r.receiver.same_bare(contact))
    }

    pub fn sids(&self) -> Vec<String> {
        self.transfers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileTransferRecord> {
        self.transfers.values()
    }

    /// Transfers that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.transfers.values().filter(|r| !r.is_stopped()).count()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StateEvent;

    fn jid(s: &str) -> Jid {
        Jid::parse(s).unwrap()
    }

    fn record(sid: &str, sender: &str) -> FileTransferRecord {
        FileTransferRecord::incoming(sid, jid(sender), jid("me@example.com/r"), "f.bin", 3)
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = TransferRegistry::new();
        registry.insert(record("a", "alice@example.com/x"));
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_transport_index() {
        let mut registry = TransferRegistry::new();
        let mut r = record("a", "alice@example.com/x");
        r.transport_sid = "jingle-ibb-1".into();
        registry.insert(r);

        assert!(registry.get_by_transport_mut("jingle-ibb-1").is_some());
        // negotiation id also resolves
        assert!(registry.get_by_transport_mut("a").is_some());
        assert!(registry.get_by_transport_mut("other").is_none());

        registry.get_mut("a").unwrap().transport_sid = "jingle-ibb-2".into();
        registry.reindex("a");
        assert!(registry.get_by_transport_mut("jingle-ibb-2").is_some());

        registry.remove("a");
        assert!(registry.get_by_transport_mut("jingle-ibb-2").is_none());
    }

    #[test]
    fn test_sids_for_contact_ignores_resource() {
        let mut registry = TransferRegistry::new();
        registry.insert(record("a", "alice@example.com/phone"));
        registry.insert(record("b", "alice@example.com/desktop"));
        registry.insert(record("c", "carol@example.com/x"));

        let mut sids = registry.sids_for_contact(&jid("alice@example.com"));
        sids.sort();
        assert_eq!(sids, vec!["a", "b"]);
    }

    #[test]
    fn test_active_count() {
        let mut registry = TransferRegistry::new();
        registry.insert(record("a", "alice@example.com/x"));
        registry.insert(record("b", "alice@example.com/x"));
        registry
            .get_mut("b")
            .unwrap()
            .transition(StateEvent::Stop)
            .unwrap();
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.len(), 2);
    }
}
