//! An explicit registry holding one [`Client`] per SDK id.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{Client, ClientConfig, Result};

/// Holds at most one [`Client`] per SDK id, so that independent parts of an application share
/// background threads and caches for the same credentials.
///
/// The registry is an ordinary value owned by the application. Construct it once at startup and
/// pass it (or an `Arc` of it) wherever clients are needed.
///
/// # Examples
/// ```no_run
/// # use flagsense::{ClientConfig, Registry};
/// let registry = Registry::new();
/// let a = registry.get_or_create(ClientConfig::new("sdk-id", "sdk-secret"))?;
/// let b = registry.get_or_create(ClientConfig::new("sdk-id", "sdk-secret"))?;
/// assert!(std::sync::Arc::ptr_eq(&a, &b));
/// registry.shutdown()?;
/// # Ok::<(), flagsense::Error>(())
/// ```
#[derive(Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Return the client registered for the SDK id of `config`, creating and registering one if
    /// there is none.
    ///
    /// When a client already exists, `config` is ignored.
    ///
    /// # Errors
    ///
    /// Returns errors of [`Client::new`]. Nothing is registered in that case.
    pub fn get_or_create(&self, config: ClientConfig) -> Result<Arc<Client>> {
        let mut clients = self.lock_clients();
        if let Some(client) = clients.get(&config.sdk_id) {
            return Ok(Arc::clone(client));
        }

        let sdk_id = config.sdk_id.clone();
        let client = Arc::new(Client::new(config)?);
        clients.insert(sdk_id, Arc::clone(&client));
        Ok(client)
    }

    /// Return the client registered for `sdk_id`, if any.
    pub fn get(&self, sdk_id: &str) -> Option<Arc<Client>> {
        self.lock_clients().get(sdk_id).cloned()
    }

    /// Remove the client registered for `sdk_id` and return it. The client keeps working for
    /// whoever still holds it.
    pub fn remove(&self, sdk_id: &str) -> Option<Arc<Client>> {
        self.lock_clients().remove(sdk_id)
    }

    /// Return the number of registered clients.
    pub fn len(&self) -> usize {
        self.lock_clients().len()
    }

    /// Return `true` if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.lock_clients().is_empty()
    }

    /// Unregister all clients and shut each of them down.
    ///
    /// Every client is shut down even if an earlier one fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Client::shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        let clients = std::mem::take(&mut *self.lock_clients());

        let mut result = Ok(());
        for (sdk_id, client) in clients {
            if let Err(err) = client.shutdown() {
                log::warn!(target: "flagsense", sdk_id = sdk_id.as_str(); "failed to shut down client: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients
            .lock()
            .expect("thread holding registry lock should not panic")
    }
}
