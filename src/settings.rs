use std::time::Duration;

/// Default number of limbo documents resolved against the backend at once.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
/// Maximum number of mutation batches in flight on the write stream.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;

/// How documents no longer referenced by targets, views or pending writes are evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GarbageCollectionMode {
    /// Documents are removed as soon as their last reference goes away.
    Eager,
    /// Documents are only removed by an explicit garbage-collection sweep.
    Manual,
}

/// Timing knobs shared by the Listen and Write persistent streams.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub idle_timeout: Duration,
    pub health_check_timeout: Duration,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Fraction of the current delay applied as +/- random jitter.
    pub backoff_jitter: f64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_backoff: Duration::from_secs(60),
            backoff_jitter: 0.5,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    /// Scans reading fewer documents than this never create an index.
    pub min_collection_size: usize,
    /// An index is created once a scan reads this many documents per result.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
        }
    }
}

/// Client-wide configuration.
#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub max_concurrent_limbo_resolutions: usize,
    pub max_pending_writes: usize,
    pub garbage_collection: GarbageCollectionMode,
    pub stream: StreamSettings,
    /// How long the client waits for the watch stream before reporting offline.
    pub online_state_timeout: Duration,
    /// Backoff used when retrying operations that failed on a storage transaction.
    pub retry_backoff: StreamSettings,
    pub index_auto_creation: IndexAutoCreationSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            garbage_collection: GarbageCollectionMode::Eager,
            stream: StreamSettings::default(),
            online_state_timeout: Duration::from_secs(10),
            retry_backoff: StreamSettings::default(),
            index_auto_creation: IndexAutoCreationSettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn with_max_concurrent_limbo_resolutions(mut self, limit: usize) -> Self {
        self.max_concurrent_limbo_resolutions = limit.max(1);
        self
    }

    pub fn with_max_pending_writes(mut self, limit: usize) -> Self {
        self.max_pending_writes = limit.max(1);
        self
    }

    pub fn with_garbage_collection(mut self, mode: GarbageCollectionMode) -> Self {
        self.garbage_collection = mode;
        self
    }

    pub fn with_stream_settings(mut self, stream: StreamSettings) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: StreamSettings) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_index_auto_creation(mut self, settings: IndexAutoCreationSettings) -> Self {
        self.index_auto_creation = settings;
        self
    }
}
