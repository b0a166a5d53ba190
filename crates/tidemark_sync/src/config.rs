//! Configuration for the sync engine.

/// Configuration for a sync context.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Page size used by pull when the caller does not supply one.
    pub default_page_size: u64,
    /// Per-item ceiling on push error-handling attempts. Once an item has
    /// been handed to the policy this many times it is reported unresolved.
    pub max_push_retries: u32,
    /// Maximum number of rows removed per store batch during a purge.
    pub purge_batch_size: usize,
}

impl SyncConfig {
    /// Creates a configuration with the default values.
    pub fn new() -> Self {
        Self {
            default_page_size: 50,
            max_push_retries: 5,
            purge_batch_size: 512,
        }
    }

    /// Sets the default pull page size.
    pub fn with_default_page_size(mut self, size: u64) -> Self {
        self.default_page_size = size;
        self
    }

    /// Sets the per-item push retry ceiling.
    pub fn with_max_push_retries(mut self, retries: u32) -> Self {
        self.max_push_retries = retries;
        self
    }

    /// Sets the purge batch size.
    pub fn with_purge_batch_size(mut self, size: usize) -> Self {
        self.purge_batch_size = size;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for a single pull call.
#[derive(Debug, Clone, Default)]
pub struct PullSettings {
    /// Number of records to request per page. Must be a positive integer
    /// when supplied; `None` uses [`SyncConfig::default_page_size`].
    pub page_size: Option<i64>,
}

impl PullSettings {
    /// Creates settings with the given page size.
    pub fn with_page_size(size: i64) -> Self {
        Self {
            page_size: Some(size),
        }
    }
}
