//! Import and export tables.
//!
//! One side's imports are the other side's exports, keyed by the same signed
//! integer. Import entries carry two counters: `refcount` counts local
//! handles (stub dups), `remote_refs` counts how many times the peer has
//! announced the ID and therefore what total must be reported in the
//! eventual `release`. Export entries carry `introductions`, the mirror of
//! the peer's `remote_refs`; the entry lives exactly while it is positive.

use crate::hooks::StubHook;
use crate::ids::{ExportId, ImportId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("duplicate import ID: {0}")]
    DuplicateImport(ImportId),

    #[error("duplicate export ID: {0}")]
    DuplicateExport(ExportId),

    #[error("unknown import ID: {0}")]
    UnknownImport(ImportId),

    #[error("unknown export ID: {0}")]
    UnknownExport(ExportId),
}

#[derive(Debug)]
pub struct ImportEntry {
    pub hook: Arc<dyn StubHook>,
    pub refcount: AtomicU32,
    pub remote_refs: AtomicU32,
}

/// Table of capabilities we reference on the peer.
#[derive(Debug, Default)]
pub struct ImportTable {
    entries: DashMap<ImportId, ImportEntry>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Install a new entry with one local handle and one peer announcement.
    pub fn insert(&self, id: ImportId, hook: Arc<dyn StubHook>) -> Result<(), TableError> {
        self.insert_counted(id, hook, 1)
    }

    pub fn insert_counted(
        &self,
        id: ImportId,
        hook: Arc<dyn StubHook>,
        remote_refs: u32,
    ) -> Result<(), TableError> {
        let entry = ImportEntry {
            hook,
            refcount: AtomicU32::new(1),
            remote_refs: AtomicU32::new(remote_refs),
        };
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateImport(id));
        }
        Ok(())
    }

    /// Reinstall an entry from a session snapshot with both counters intact.
    pub fn insert_restored(
        &self,
        id: ImportId,
        hook: Arc<dyn StubHook>,
        refcount: u32,
        remote_refs: u32,
    ) -> Result<(), TableError> {
        let entry = ImportEntry {
            hook,
            refcount: AtomicU32::new(refcount),
            remote_refs: AtomicU32::new(remote_refs),
        };
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateImport(id));
        }
        Ok(())
    }

    pub fn get(&self, id: ImportId) -> Option<Arc<dyn StubHook>> {
        self.entries.get(&id).map(|entry| entry.hook.clone())
    }

    pub fn contains(&self, id: ImportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// A new local handle shares the entry.
    pub fn add_ref(&self, id: ImportId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// The peer announced this ID again; one more ref to release later.
    pub fn note_remote_ref(&self, id: ImportId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.remote_refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop one local handle. When the last goes, the entry is removed and
    /// the total announcement count to report in `release` is returned.
    /// Extra disposes against a dead handle are ignored rather than allowed
    /// to underflow.
    pub fn release_local(&self, id: ImportId) -> Option<u32> {
        let remove = match self.entries.get(&id) {
            Some(entry) => {
                let mut current = entry.refcount.load(Ordering::SeqCst);
                loop {
                    if current == 0 {
                        break false;
                    }
                    match entry.refcount.compare_exchange(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break current == 1,
                        Err(observed) => current = observed,
                    }
                }
            }
            None => false,
        };
        if remove {
            self.entries.remove(&id).map(|(_, entry)| {
                trace!(%id, "import entry dropped");
                entry.remote_refs.load(Ordering::SeqCst)
            })
        } else {
            None
        }
    }

    /// Remove every entry, returning the hooks for disposal.
    pub fn drain(&self) -> Vec<(ImportId, Arc<dyn StubHook>)> {
        let ids: Vec<ImportId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(id, e)| (id, e.hook)))
            .collect()
    }

    /// `(id, refcount, remote_refs)` triples for session snapshots.
    pub fn snapshot(&self) -> Vec<(i64, u32, u32)> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.key().0,
                    e.refcount.load(Ordering::SeqCst),
                    e.remote_refs.load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
pub struct ExportEntry {
    pub hook: Arc<dyn StubHook>,
    pub introductions: AtomicU32,
}

/// Table of capabilities we expose to the peer.
#[derive(Debug, Default)]
pub struct ExportTable {
    entries: DashMap<ExportId, ExportEntry>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Install a new entry with a single introduction.
    pub fn insert(&self, id: ExportId, hook: Arc<dyn StubHook>) -> Result<(), TableError> {
        let entry = ExportEntry {
            hook,
            introductions: AtomicU32::new(1),
        };
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateExport(id));
        }
        Ok(())
    }

    pub fn get(&self, id: ExportId) -> Option<Arc<dyn StubHook>> {
        self.entries.get(&id).map(|entry| entry.hook.clone())
    }

    pub fn contains(&self, id: ExportId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Find an existing export of the same hook, for re-announcement.
    pub fn find_by_hook(&self, hook: &Arc<dyn StubHook>) -> Option<ExportId> {
        self.entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.hook, hook))
            .map(|entry| *entry.key())
    }

    /// The serializer announced this export once more.
    pub fn bump_introductions(&self, id: ExportId) -> Result<(), TableError> {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.introductions.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or(TableError::UnknownExport(id))
    }

    pub fn introductions(&self, id: ExportId) -> Option<u32> {
        self.entries
            .get(&id)
            .map(|e| e.introductions.load(Ordering::SeqCst))
    }

    /// Apply a `release` for `count` introductions. Returns the hook when
    /// the entry reaches zero and is dropped. Releases that would underflow
    /// are clamped; a stale release never revives or double-frees an entry.
    pub fn release(&self, id: ExportId, count: u32) -> Option<Arc<dyn StubHook>> {
        let remove = match self.entries.get(&id) {
            Some(entry) => {
                let mut current = entry.introductions.load(Ordering::SeqCst);
                loop {
                    let next = current.saturating_sub(count);
                    match entry.introductions.compare_exchange(
                        current,
                        next,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break next == 0,
                        Err(observed) => current = observed,
                    }
                }
            }
            None => false,
        };
        if remove {
            self.entries.remove(&id).map(|(_, entry)| {
                trace!(%id, "export entry dropped");
                entry.hook
            })
        } else {
            None
        }
    }

    pub fn drain(&self) -> Vec<(ExportId, Arc<dyn StubHook>)> {
        let ids: Vec<ExportId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(id, e)| (id, e.hook)))
            .collect()
    }

    /// `(id, introductions)` pairs for session snapshots.
    pub fn snapshot(&self) -> Vec<(i64, u32)> {
        self.entries
            .iter()
            .map(|e| (e.key().0, e.introductions.load(Ordering::SeqCst)))
            .collect()
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
    use crate::error::RpcError;
    use crate::hooks::ErrorHook;

    fn hook() -> Arc<dyn StubHook> {
        ErrorHook::new(RpcError::internal("placeholder"))
    }

    #[test]
    fn import_refcounting() {
        let table = ImportTable::new();
        let id = ImportId(1);
        table.insert(id, hook()).unwrap();

        table.add_ref(id);
        assert_eq!(table.release_local(id), None);
        assert_eq!(table.release_local(id), Some(1));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn import_remote_refs_accumulate() {
        let table = ImportTable::new();
        let id = ImportId(-2);
        table.insert(id, hook()).unwrap();
        table.note_remote_ref(id);
        table.note_remote_ref(id);
        assert_eq!(table.release_local(id), Some(3));
    }

    #[test]
    fn duplicate_import_is_rejected() {
        let table = ImportTable::new();
        table.insert(ImportId(1), hook()).unwrap();
        assert!(matches!(
            table.insert(ImportId(1), hook()),
            Err(TableError::DuplicateImport(_))
        ));
    }

    #[test]
    fn export_release_sums_to_total() {
        // Two introductions, two separate single releases: the entry must
        // survive the first and drop on the second.
        let table = ExportTable::new();
        let id = ExportId(5);
        table.insert(id, hook()).unwrap();
        table.bump_introductions(id).unwrap();

        assert!(table.release(id, 1).is_none());
        assert!(table.contains(id));
        assert!(table.release(id, 1).is_some());
        assert!(!table.contains(id));
    }

    #[test]
    fn stale_release_is_ignored() {
        let table = ExportTable::new();
        let id = ExportId(7);
        table.insert(id, hook()).unwrap();
        assert!(table.release(id, 10).is_some());
        // Entry already gone; further releases are no-ops.
        assert!(table.release(id, 1).is_none());
    }

    #[test]
    fn find_by_hook_reuses_entries() {
        let table = ExportTable::new();
        let shared = hook();
        table.insert(ExportId(-1), shared.clone()).unwrap();
        table.insert(ExportId(-2), hook()).unwrap();

        assert_eq!(table.find_by_hook(&shared), Some(ExportId(-1)));
        assert_eq!(table.introductions(ExportId(-1)), Some(1));
    }

    #[test]
    fn drain_empties_the_table() {
        let table = ExportTable::new();
        table.insert(ExportId(1), hook()).unwrap();
        table.insert(ExportId(2), hook()).unwrap();
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
