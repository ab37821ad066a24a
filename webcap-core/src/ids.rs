use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Import ID - an entry in the import table.
///
/// Positive IDs (1, 2, 3...) are chosen by the importing side, negative IDs
/// (-1, -2, -3...) by the exporting side. ID 0 is reserved for the "main"
/// capability. The same signed integer names the sender's import entry and
/// the recipient's export entry; IDs are never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub i64);

impl ImportId {
    /// The main (root) capability ID.
    pub fn main() -> Self {
        ImportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// Was this ID allocated by us, the importing side (positive)?
    pub fn is_local(&self) -> bool {
        self.0 > 0
    }

    /// Was this ID allocated by the peer, the exporting side (negative)?
    pub fn is_remote(&self) -> bool {
        self.0 < 0
    }

    /// The peer's export-table entry carrying the same number.
    pub fn as_export(&self) -> ExportId {
        ExportId(self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Import#{}", self.0)
    }
}

/// Export ID - an entry in the export table.
///
/// Mirror of [`ImportId`]: negative IDs are chosen by the exporting side,
/// positive IDs arrive from the peer's pushes, 0 is the main capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub i64);

impl ExportId {
    pub fn main() -> Self {
        ExportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// Was this ID allocated by us, the exporting side (negative)?
    pub fn is_local(&self) -> bool {
        self.0 < 0
    }

    pub fn is_remote(&self) -> bool {
        self.0 > 0
    }

    /// The peer's import-table entry carrying the same number.
    pub fn as_import(&self) -> ImportId {
        ImportId(self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Export#{}", self.0)
    }
}

/// Monotonic ID allocator for one session. No ID is ever recycled.
#[derive(Debug)]
pub struct IdAllocator {
    next_positive: AtomicI64,
    next_negative: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_positive: AtomicI64::new(1),
            next_negative: AtomicI64::new(-1),
        }
    }

    /// Allocate the next importer-chosen ID (positive, stepping +1 from 1).
    pub fn allocate_import(&self) -> ImportId {
        ImportId(self.next_positive.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocate the next exporter-chosen ID (negative, stepping -1 from -1).
    pub fn allocate_export(&self) -> ExportId {
        ExportId(self.next_negative.fetch_sub(1, Ordering::SeqCst))
    }

    /// Counter positions, for session snapshots.
    pub fn positions(&self) -> (i64, i64) {
        (
            self.next_positive.load(Ordering::SeqCst),
            self.next_negative.load(Ordering::SeqCst),
        )
    }

    /// Restore counter positions from a session snapshot.
    pub fn restore(next_positive: i64, next_negative: i64) -> Self {
        Self {
            next_positive: AtomicI64::new(next_positive),
            next_negative: AtomicI64::new(next_negative),
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn main_ids() {
        assert!(ImportId::main().is_main());
        assert!(ExportId::main().is_main());
        assert_eq!(ImportId::main().0, 0);
    }

    #[test]
    fn sign_discipline() {
        let local_import = ImportId(5);
        let remote_import = ImportId(-3);
        let local_export = ExportId(-2);
        let remote_export = ExportId(4);

        assert!(local_import.is_local() && !local_import.is_remote());
        assert!(remote_import.is_remote() && !remote_import.is_local());
        assert!(local_export.is_local() && !local_export.is_remote());
        assert!(remote_export.is_remote() && !remote_export.is_local());
    }

    #[test]
    fn corresponding_entries_share_the_number() {
        assert_eq!(ImportId(5).as_export(), ExportId(5));
        assert_eq!(ExportId(-7).as_import(), ImportId(-7));
        assert_eq!(ImportId(1).as_export().as_import(), ImportId(1));
    }

    #[test]
    fn allocation_is_monotone_from_one() {
        let allocator = IdAllocator::new();
        assert_eq!(allocator.allocate_import(), ImportId(1));
        assert_eq!(allocator.allocate_import(), ImportId(2));
        assert_eq!(allocator.allocate_export(), ExportId(-1));
        assert_eq!(allocator.allocate_export(), ExportId(-2));
    }

    #[test]
    fn no_id_is_ever_reused_across_threads() {
        let allocator = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    ids.push(allocator.allocate_import().0);
                    ids.push(allocator.allocate_export().0);
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "ID {} allocated twice", id);
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn snapshot_positions_round_trip() {
        let allocator = IdAllocator::new();
        allocator.allocate_import();
        allocator.allocate_import();
        allocator.allocate_export();

        let (pos, neg) = allocator.positions();
        let restored = IdAllocator::restore(pos, neg);
        assert_eq!(restored.allocate_import(), ImportId(3));
        assert_eq!(restored.allocate_export(), ExportId(-2));
    }
}
