use bytes::Bytes;

use crate::core::{ListenSequenceNumber, TargetId};
use crate::core::Target;
use crate::model::SnapshotVersion;

/// A target actively being listened to, together with the local bookkeeping
/// the cache maintains for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    target: Target,
    target_id: TargetId,
    sequence_number: ListenSequenceNumber,
    /// The latest snapshot version the backend has told us this target is
    /// consistent at.
    snapshot_version: SnapshotVersion,
    /// The last version at which the target was known to have no limbo
    /// documents; query results cached at or before this version can be
    /// trusted.
    last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque backend token that allows resuming the target without
    /// re-downloading its result set.
    resume_token: Bytes,
}

impl TargetData {
    pub fn new(target: Target, target_id: TargetId, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            target,
            target_id,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Bytes::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn snapshot_version(&self) -> &SnapshotVersion {
        &self.snapshot_version
    }

    pub fn last_limbo_free_snapshot_version(&self) -> &SnapshotVersion {
        &self.last_limbo_free_snapshot_version
    }

    pub fn resume_token(&self) -> &Bytes {
        &self.resume_token
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_resume_token(mut self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}
