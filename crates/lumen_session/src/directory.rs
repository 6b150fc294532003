//! # Master Directory
//!
//! Maps identifier ranges to the node that is master for that range.
//!
//! The directory is an append-only record list: remote answers and local
//! declarations are appended, never deduplicated. Lookup is a linear scan
//! with first-match-wins. Duplicate or stale records are tolerated by
//! design - a known imprecision of the protocol: after a master handoff a
//! node may keep acting on an outdated record until it is told otherwise.
//! Callers go through this interface so a future implementation can swap
//! the scan for an interval map.

use parking_lot::Mutex;

use lumen_core::Identifier;

use crate::node::NodeId;

/// One delegation record: `[start, end)` is mastered by `master`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterRecord {
    /// First identifier of the range.
    pub start: Identifier,
    /// One past the last identifier of the range.
    pub end: Identifier,
    /// The node owning the range.
    pub master: NodeId,
}

impl MasterRecord {
    /// Returns true if `id` falls inside this record's range.
    #[must_use]
    pub const fn contains(&self, id: Identifier) -> bool {
        id >= self.start && id < self.end
    }
}

/// Session-local view of identifier-range ownership.
///
/// The dispatch context appends; any context may read under the lock.
pub struct MasterDirectory {
    records: Mutex<Vec<MasterRecord>>,
}

impl MasterDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self { records: Mutex::new(Vec::new()) }
    }

    /// Appends a record. Existing overlapping records are kept; the
    /// earlier record keeps winning lookups.
    pub fn add(&self, record: MasterRecord) {
        self.records.lock().push(record);
    }

    /// Local, non-blocking lookup of the master node for `id`.
    ///
    /// # Returns
    ///
    /// The first matching record's node, or [`NodeId::ZERO`] when no
    /// record matches.
    #[must_use]
    pub fn poll(&self, id: Identifier) -> NodeId {
        self.find(id).map_or(NodeId::ZERO, |record| record.master)
    }

    /// Local lookup of the full owning record for `id`, used to answer
    /// remote queries with the whole range.
    #[must_use]
    pub fn find(&self, id: Identifier) -> Option<MasterRecord> {
        self.records
            .lock()
            .iter()
            .find(|record| record.contains(id))
            .copied()
    }

    /// Number of records, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the directory holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for MasterDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_range_boundaries() {
        let directory = MasterDirectory::new();
        directory.add(MasterRecord { start: 1024, end: 2048, master: NodeId(7) });

        assert_eq!(directory.poll(1023), NodeId::ZERO);
        assert_eq!(directory.poll(1024), NodeId(7));
        assert_eq!(directory.poll(2047), NodeId(7));
        assert_eq!(directory.poll(2048), NodeId::ZERO);
    }

    #[test]
    fn test_find_returns_whole_range() {
        let directory = MasterDirectory::new();
        let record = MasterRecord { start: 16, end: 32, master: NodeId(3) };
        directory.add(record);

        assert_eq!(directory.find(20), Some(record));
        assert_eq!(directory.find(32), None);
    }

    #[test]
    fn test_duplicate_records_resolve_first_match() {
        // Known limitation: overlapping records are tolerated and the
        // first-registered record wins, even if a later one is fresher.
        let directory = MasterDirectory::new();
        directory.add(MasterRecord { start: 0, end: 100, master: NodeId(1) });
        directory.add(MasterRecord { start: 50, end: 150, master: NodeId(2) });

        assert_eq!(directory.poll(75), NodeId(1));
        assert_eq!(directory.poll(120), NodeId(2));
        assert_eq!(directory.len(), 2);
    }
}
