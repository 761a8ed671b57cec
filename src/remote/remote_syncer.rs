use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::core::OnlineState;
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{BatchId, DocumentKey, MutationBatchResult, TargetId, User};
use crate::remote::remote_event::RemoteEvent;

/// What the remote store hands results to. Implemented by the sync engine.
///
/// All calls happen on the async queue.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend refused or dropped a listen target.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the backend last confirmed for `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState);
}
