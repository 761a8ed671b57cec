use std::collections::BTreeSet;

use crate::core::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCHID_UNKNOWN};

/// Ordered queue of the local writes one user has not yet had acknowledged.
///
/// Batches are only ever removed from the front.
pub trait MutationQueue: Send + Sync {
    fn is_empty(&self) -> bool;

    /// Records the stream token that came with the acknowledgement of the
    /// head batch.
    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn last_stream_token(&self) -> Vec<u8>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>);

    fn add_mutation_batch(&mut self, local_write_time: Timestamp, mutations: Vec<Mutation>) -> MutationBatch;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id strictly greater than `batch_id`.
    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    fn highest_unacknowledged_batch_id(&self) -> BatchId;

    fn all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    fn all_mutation_batches_affecting_document_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<MutationBatch>;

    /// Batches touching documents directly inside a collection query's path.
    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    batches_by_document_key: BTreeSet<(DocumentKey, BatchId)>,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: BTreeSet::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Option<usize> {
        self.queue.binary_search_by_key(&batch_id, |batch| batch.batch_id).ok()
    }

    fn find_batches(&self, batch_ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> impl Iterator<Item = BatchId> + '_ {
        let key = key.clone();
        self.batches_by_document_key
            .range((key.clone(), BatchId::MIN)..)
            .take_while(move |(existing, _)| *existing == key)
            .map(|(_, batch_id)| *batch_id)
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        match self.index_of_batch_id(batch.batch_id) {
            Some(0) => {
                self.last_stream_token = stream_token;
                Ok(())
            }
            Some(_) => Err(internal_error("Can only acknowledge the first batch in the mutation queue")),
            None => Err(internal_error(format!(
                "Batches must exist to be acknowledged (batch id {})",
                batch.batch_id
            ))),
        }
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.last_stream_token.clone()
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    fn add_mutation_batch(&mut self, local_write_time: Timestamp, mutations: Vec<Mutation>) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        for mutation in &batch.mutations {
            self.batches_by_document_key.insert((mutation.key().clone(), batch_id));
        }
        self.queue.push(batch.clone());
        batch
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.index_of_batch_id(batch_id).map(|index| self.queue[index].clone())
    }

    fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = self.queue.partition_point(|batch| batch.batch_id <= batch_id);
        self.queue.get(index).cloned()
    }

    fn highest_unacknowledged_batch_id(&self) -> BatchId {
        if self.queue.is_empty() {
            BATCHID_UNKNOWN
        } else {
            self.next_batch_id - 1
        }
    }

    fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.queue.clone()
    }

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        let ids = self.batch_ids_for_key(key).collect();
        self.find_batches(ids)
    }

    fn all_mutation_batches_affecting_document_keys(&self, keys: &BTreeSet<DocumentKey>) -> Vec<MutationBatch> {
        let ids = keys.iter().flat_map(|key| self.batch_ids_for_key(key)).collect();
        self.find_batches(ids)
    }

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let prefix = query.path();
        let immediate_children = prefix.len() + 1;
        let start = if DocumentKey::is_document_key(prefix) {
            match DocumentKey::from_path(prefix.clone()) {
                Ok(key) => key,
                Err(_) => return Vec::new(),
            }
        } else {
            DocumentKey::collection_scan_start(prefix)
        };

        let ids = self
            .batches_by_document_key
            .range((start, BatchId::MIN)..)
            .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
            .filter(|(key, _)| key.path().len() == immediate_children)
            .map(|(_, batch_id)| *batch_id)
            .collect();
        self.find_batches(ids)
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        match self.index_of_batch_id(batch.batch_id) {
            Some(0) => {
                self.queue.remove(0);
                for mutation in &batch.mutations {
                    self.batches_by_document_key
                        .remove(&(mutation.key().clone(), batch.batch_id));
                }
                Ok(())
            }
            Some(_) => Err(internal_error("Can only remove the first entry of the mutation queue")),
            None => Err(internal_error(format!(
                "Batches must exist to be removed (batch id {})",
                batch.batch_id
            ))),
        }
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{key, map, query, set_mutation};
    use crate::value::FirestoreValue;

    fn write(queue: &mut MemoryMutationQueue, path: &str) -> MutationBatch {
        queue.add_mutation_batch(
            Timestamp::now(),
            vec![set_mutation(path, map(&[("v", FirestoreValue::from_integer(1))]))],
        )
    }

    #[test]
    fn batch_ids_increase() {
        let mut queue = MemoryMutationQueue::new();
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCHID_UNKNOWN);
        let first = write(&mut queue, "rooms/a");
        let second = write(&mut queue, "rooms/b");
        assert!(first.batch_id < second.batch_id);
        assert_eq!(queue.highest_unacknowledged_batch_id(), second.batch_id);
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(BATCHID_UNKNOWN).map(|b| b.batch_id),
            Some(first.batch_id)
        );
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(first.batch_id).map(|b| b.batch_id),
            Some(second.batch_id)
        );
        assert!(queue.next_mutation_batch_after_batch_id(second.batch_id).is_none());
    }

    #[test]
    fn only_head_batch_can_be_removed() {
        let mut queue = MemoryMutationQueue::new();
        let first = write(&mut queue, "rooms/a");
        let second = write(&mut queue, "rooms/a");

        assert!(queue.remove_mutation_batch(&second).is_err());
        assert!(queue.acknowledge_batch(&second, vec![1]).is_err());
        queue.acknowledge_batch(&first, vec![1]).unwrap();
        queue.remove_mutation_batch(&first).unwrap();

        assert_eq!(queue.last_stream_token(), vec![1]);
        assert_eq!(queue.all_mutation_batches_affecting_document_key(&key("rooms/a")).len(), 1);
        queue.remove_mutation_batch(&second).unwrap();
        assert!(queue.is_empty());
        assert!(!queue.contains_key(&key("rooms/a")));
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCHID_UNKNOWN);
    }

    #[test]
    fn query_lookup_skips_subcollections() {
        let mut queue = MemoryMutationQueue::new();
        write(&mut queue, "rooms/a");
        write(&mut queue, "rooms/a/messages/m");
        write(&mut queue, "roomsx/b");

        let batches = queue.all_mutation_batches_affecting_query(&query("rooms"));
        assert_eq!(batches.len(), 1);
        assert!(batches[0].affects(&key("rooms/a")));
    }
}
