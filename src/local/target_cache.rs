use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::core::{ListenSequenceNumber, TargetId, TargetIdGenerator};
use crate::core::Target;
use crate::local::persistence::{OrphanedDocuments, PersistenceTransaction};
use crate::local::persistence_promise::PersistencePromise;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::util::assert::hard_assert;

/// Tracks allocated targets: their bookkeeping data and the set of document
/// keys the backend last reported as matching each of them.
pub struct MemoryTargetCache {
    orphaned: Rc<OrphanedDocuments>,
    inner: RefCell<Inner>,
}

struct Inner {
    targets: HashMap<String, TargetData>,
    references: ReferenceSet,
    id_generator: TargetIdGenerator,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    target_count: usize,
}

impl MemoryTargetCache {
    pub fn new(orphaned: Rc<OrphanedDocuments>) -> Self {
        Self {
            orphaned,
            inner: RefCell::new(Inner {
                targets: HashMap::new(),
                references: ReferenceSet::new(),
                id_generator: TargetIdGenerator::for_target_cache(0),
                highest_target_id: 0,
                highest_sequence_number: 0,
                last_remote_snapshot_version: SnapshotVersion::min(),
                target_count: 0,
            }),
        }
    }

    pub fn allocate_target_id(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<TargetId> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.id_generator.next();
        inner.highest_target_id = inner.highest_target_id.max(id);
        PersistencePromise::resolve(id)
    }

    pub fn get_highest_sequence_number(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<ListenSequenceNumber> {
        PersistencePromise::resolve(self.inner.borrow().highest_sequence_number)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        _txn: &PersistenceTransaction,
    ) -> PersistencePromise<SnapshotVersion> {
        PersistencePromise::resolve(self.inner.borrow().last_remote_snapshot_version.clone())
    }

    /// Advances the metadata the cache keeps across snapshots. The remote
    /// snapshot version only moves forward.
    pub fn set_targets_metadata(
        &self,
        _txn: &PersistenceTransaction,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        inner.highest_sequence_number = inner.highest_sequence_number.max(highest_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            inner.last_remote_snapshot_version = version;
        }
        PersistencePromise::resolve(())
    }

    pub fn add_target_data(
        &self,
        _txn: &PersistenceTransaction,
        data: TargetData,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        let canonical_id = data.target().canonical_id();
        hard_assert(
            !inner.targets.contains_key(&canonical_id),
            "Adding a target that already exists",
        );
        inner.highest_target_id = inner.highest_target_id.max(data.target_id());
        inner.highest_sequence_number = inner.highest_sequence_number.max(data.sequence_number());
        inner.targets.insert(canonical_id, data);
        inner.target_count += 1;
        PersistencePromise::resolve(())
    }

    pub fn update_target_data(
        &self,
        _txn: &PersistenceTransaction,
        data: TargetData,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        let canonical_id = data.target().canonical_id();
        hard_assert(
            inner.targets.contains_key(&canonical_id),
            "Updating a target that does not exist",
        );
        inner.highest_sequence_number = inner.highest_sequence_number.max(data.sequence_number());
        inner.targets.insert(canonical_id, data);
        PersistencePromise::resolve(())
    }

    pub fn remove_target_data(
        &self,
        _txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        let removed = inner.targets.remove(&data.target().canonical_id());
        hard_assert(removed.is_some(), "Removing a target that does not exist");
        inner.references.remove_references_for_id(data.target_id());
        inner.target_count -= 1;
        PersistencePromise::resolve(())
    }

    /// Removes all targets with a sequence number at or below `upper_bound`
    /// that are not in `active_target_ids`. Returns the number removed.
    pub fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> PersistencePromise<usize> {
        let mut inner = self.inner.borrow_mut();
        let doomed: Vec<TargetData> = inner
            .targets
            .values()
            .filter(|data| {
                data.sequence_number() <= upper_bound
                    && !active_target_ids.contains(&data.target_id())
            })
            .cloned()
            .collect();
        for data in &doomed {
            inner.targets.remove(&data.target().canonical_id());
            for key in inner.references.remove_references_for_id(data.target_id()) {
                self.orphaned.mark(&key, txn.current_sequence_number());
            }
            inner.target_count -= 1;
        }
        PersistencePromise::resolve(doomed.len())
    }

    pub fn get_target_data(
        &self,
        _txn: &PersistenceTransaction,
        target: &Target,
    ) -> PersistencePromise<Option<TargetData>> {
        let inner = self.inner.borrow();
        PersistencePromise::resolve(inner.targets.get(&target.canonical_id()).cloned())
    }

    pub fn for_each_target(
        &self,
        _txn: &PersistenceTransaction,
        mut f: impl FnMut(&TargetData),
    ) -> PersistencePromise<()> {
        for data in self.inner.borrow().targets.values() {
            f(data);
        }
        PersistencePromise::resolve(())
    }

    pub fn get_target_count(&self, _txn: &PersistenceTransaction) -> PersistencePromise<usize> {
        PersistencePromise::resolve(self.inner.borrow().target_count)
    }

    /// The serialized footprint of every cached target, counted against the
    /// garbage collector's size threshold.
    pub fn byte_size(&self) -> u64 {
        self.inner.borrow().targets.values().map(entry_size).sum()
    }

    pub fn add_matching_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> PersistencePromise<()> {
        self.inner
            .borrow_mut()
            .references
            .add_references(keys, target_id);
        PersistencePromise::resolve(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        target_id: TargetId,
    ) -> PersistencePromise<()> {
        let mut inner = self.inner.borrow_mut();
        inner.references.remove_references(keys, target_id);
        for key in keys {
            self.orphaned.mark(key, txn.current_sequence_number());
        }
        PersistencePromise::resolve(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        _txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> PersistencePromise<BTreeSet<DocumentKey>> {
        PersistencePromise::resolve(self.inner.borrow().references.references_for_id(target_id))
    }

    pub fn contains_key(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> PersistencePromise<bool> {
        PersistencePromise::resolve(self.inner.borrow().references.contains_key(key))
    }
}

/// Size of one target as it would be persisted.
fn entry_size(data: &TargetData) -> u64 {
    let payload = serde_json::json!({
        "target": data.target().canonical_id(),
        "targetId": data.target_id(),
        "sequenceNumber": data.sequence_number(),
        "snapshotVersion": data.snapshot_version(),
        "lastLimboFreeSnapshotVersion": data.last_limbo_free_snapshot_version(),
        "resumeToken": BASE64_STANDARD.encode(data.resume_token()),
    });
    serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0) as u64
}
