use crate::core::Target;
use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch that could not be
    /// resolved by the bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter itself failed to reconcile counts.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// A target plus the bookkeeping needed to resume it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest snapshot version the target was consistent at.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the view for this target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the server should report for a resumed target.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume point; a new token invalidates any expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{query, version};

    #[test]
    fn resume_token_clears_expected_count() {
        let data = TargetData::new(query("rooms").to_target(), 2, TargetPurpose::Listen, 1).with_expected_count(3);
        assert_eq!(data.expected_count, Some(3));
        let resumed = data.with_resume_token(vec![9], version(4));
        assert_eq!(resumed.expected_count, None);
        assert_eq!(resumed.snapshot_version, version(4));
        assert_eq!(resumed.target_id, 2);
    }
}
