//! A thread-safe in-memory storage for currently active configuration. [`ConfigurationStore`]
//! provides concurrent access for readers (flag evaluation) and the writer (synchronizer).
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use crate::model::Configuration;

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for configuration that allows
/// concurrent access for readers and writers.
///
/// `Configuration` itself is always immutable and can only be replaced completely, so a reader
/// holding a snapshot never observes data from two different fetches.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Arc<Configuration>>,
    ready: AtomicBool,
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Get the latest published snapshot, or the initial empty one if nothing was published yet.
    pub fn current(&self) -> Arc<Configuration> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen.
        let configuration = self
            .configuration
            .read()
            .expect("thread holding configuration lock should not panic");

        configuration.clone()
    }

    /// Get currently-active configuration. Returns None if configuration hasn't been published
    /// yet.
    pub fn get_configuration(&self) -> Option<Arc<Configuration>> {
        self.is_ready().then(|| self.current())
    }

    /// Publish a new configuration, replacing the previous one as a whole.
    pub fn publish(&self, config: Arc<Configuration>) {
        {
            let mut configuration_slot = self
                .configuration
                .write()
                .expect("thread holding configuration lock should not panic");

            *configuration_slot = config;
        }

        self.ready.store(true, Ordering::Release);
    }

    /// Return `true` once at least one configuration has been published.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
