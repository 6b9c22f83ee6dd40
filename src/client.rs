//! The public client: flag evaluation against the latest configuration snapshot, event recording
//! and the lifecycle of the background threads.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    configuration_store::ConfigurationStore,
    dispatcher::Dispatcher,
    eval::{self, Variation},
    events::EventAggregator,
    model::{FlagStatus, TryParse},
    synchronizer::Synchronizer,
    transport::Transport,
    AttributeValue, Attributes, ClientConfig, Error, Result,
};

/// A user flags are evaluated for.
///
/// # Examples
/// ```
/// # use flagsense::User;
/// let user = User::new("user-42")
///     .with_attribute("country", "IN")
///     .with_attribute("age", 30.0)
///     .with_attribute("beta", true);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

impl User {
    /// Create a user without attributes.
    pub fn new(id: impl Into<String>) -> User {
        User {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Create a user with the given attributes.
    pub fn with_attributes(id: impl Into<String>, attributes: Attributes) -> User {
        User {
            id: id.into(),
            attributes,
        }
    }

    /// Add an attribute. Attributes with an empty key are ignored.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> User {
        self.add_attribute(key, value);
        self
    }

    /// Add an attribute in place. Attributes with an empty key are ignored.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        if !key.is_empty() {
            self.attributes.insert(key, value.into());
        }
    }

    /// User id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// User attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// A flag reference together with the variation served when the flag cannot be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRef {
    id: String,
    default_variation: Variation,
}

impl FlagRef {
    /// Key of the default variation when none is given.
    pub const FALLBACK_KEY: &'static str = "default";

    /// Create a flag reference with an explicit default variation.
    ///
    /// An empty `default_key` is replaced with [`FlagRef::FALLBACK_KEY`].
    pub fn new(
        id: impl Into<String>,
        default_key: impl Into<String>,
        default_value: impl Into<serde_json::Value>,
    ) -> FlagRef {
        let mut default_key = default_key.into();
        if default_key.is_empty() {
            default_key = FlagRef::FALLBACK_KEY.to_owned();
        }
        FlagRef {
            id: id.into(),
            default_variation: Variation::new(default_key, default_value),
        }
    }

    /// Create a flag reference whose default variation is `{key: "default", value: null}`.
    pub fn from_id(id: impl Into<String>) -> FlagRef {
        FlagRef::new(id, FlagRef::FALLBACK_KEY, serde_json::Value::Null)
    }

    /// Flag id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Variation served when the flag cannot be evaluated.
    pub fn default_variation(&self) -> &Variation {
        &self.default_variation
    }
}

struct BackgroundTasks {
    synchronizer: Synchronizer,
    dispatcher: Option<Dispatcher>,
}

impl BackgroundTasks {
    fn shutdown(self) -> Result<()> {
        log::debug!(target: "flagsense", "shutting down flagsense client");
        let synchronizer_result = self.synchronizer.shutdown();
        let dispatcher_result = self.dispatcher.map_or(Ok(()), Dispatcher::shutdown);
        synchronizer_result.and(dispatcher_result)
    }
}

/// A client for the Flagsense API.
///
/// Creating a client starts two background threads: one fetches configuration periodically, the
/// other sends aggregated events. Flag evaluation is purely local and never blocks on the network.
///
/// Dropping the client performs the same shutdown as [`Client::shutdown`]: it flushes pending
/// events and blocks for at most the shutdown grace period. Call [`Client::shutdown`] directly to
/// observe errors.
///
/// # Examples
/// ```no_run
/// # use flagsense::{ClientConfig, FlagRef, User};
/// let client = ClientConfig::new("sdk-id", "sdk-secret").to_client()?;
/// client.wait_for_initialization()?;
///
/// let variation = client.get_variation(&FlagRef::new("checkout", "off", false), &User::new("u1"));
/// println!("serving {}", variation.key);
/// # Ok::<(), flagsense::Error>(())
/// ```
pub struct Client {
    configuration_store: Arc<ConfigurationStore>,
    aggregator: Arc<EventAggregator>,
    max_initialization_wait: Mutex<Duration>,
    background: Mutex<Option<BackgroundTasks>>,
}

impl Client {
    const INITIALIZATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Create a new client and start its background threads.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] if SDK id or secret is empty.
    /// - [`Error::InvalidBaseUrl`] if a base URL cannot be parsed.
    /// - [`Error::Io`] if a background thread failed to start.
    pub fn new(config: ClientConfig) -> Result<Client> {
        if config.sdk_id.is_empty() || config.sdk_secret.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let transport = Transport::new(&config)?;
        let configuration_store = Arc::new(ConfigurationStore::new());
        let aggregator = Arc::new(EventAggregator::new(
            config.event_flush_interval,
            config.environment,
            config.capture_events,
        ));

        let synchronizer = Synchronizer::start(
            transport.clone(),
            configuration_store.clone(),
            config.environment,
            config.data_refresh_interval,
        )?;
        let dispatcher = if config.capture_events {
            Some(Dispatcher::start(
                transport,
                aggregator.clone(),
                config.event_flush_interval,
                config.shutdown_grace_period,
            )?)
        } else {
            None
        };

        log::debug!(target: "flagsense",
                    environment:display = config.environment,
                    machine_id:display = aggregator.machine_id();
                    "flagsense client started");

        Ok(Client {
            configuration_store,
            aggregator,
            max_initialization_wait: Mutex::new(config.max_initialization_wait),
            background: Mutex::new(Some(BackgroundTasks {
                synchronizer,
                dispatcher,
            })),
        })
    }

    #[cfg(test)]
    fn new_with_parts(
        configuration_store: Arc<ConfigurationStore>,
        aggregator: Arc<EventAggregator>,
    ) -> Client {
        Client {
            configuration_store,
            aggregator,
            max_initialization_wait: Mutex::new(ClientConfig::DEFAULT_MAX_INITIALIZATION_WAIT),
            background: Mutex::new(None),
        }
    }

    /// Return `true` once the first configuration has been fetched.
    pub fn is_initialized(&self) -> bool {
        self.configuration_store.is_ready()
    }

    /// Block until the first configuration is fetched, for at most the configured maximum
    /// initialization wait.
    ///
    /// # Errors
    ///
    /// - [`Error::InitializationTimeout`] if configuration wasn't fetched in time.
    pub fn wait_for_initialization(&self) -> Result<()> {
        self.wait_for_initialization_with_timeout(self.max_initialization_wait())
    }

    /// Block until the first configuration is fetched, for at most `timeout`.
    ///
    /// Safe to call from several threads at once; each caller observes its own timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::InitializationTimeout`] if configuration wasn't fetched in time.
    pub fn wait_for_initialization_with_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_initialized() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(target: "flagsense", "timed out waiting for initialization");
                return Err(Error::InitializationTimeout);
            }
            std::thread::sleep(Client::INITIALIZATION_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Default timeout of [`Client::wait_for_initialization`].
    pub fn max_initialization_wait(&self) -> Duration {
        *self
            .max_initialization_wait
            .lock()
            .expect("thread holding max_initialization_wait lock should not panic")
    }

    /// Change the default timeout of [`Client::wait_for_initialization`]. Calls already waiting
    /// keep their timeout.
    pub fn set_max_initialization_wait(&self, timeout: Duration) {
        *self
            .max_initialization_wait
            .lock()
            .expect("thread holding max_initialization_wait lock should not panic") = timeout;
    }

    /// Get the variation of `flag` served to `user`.
    ///
    /// This function never fails. If the flag cannot be evaluated (configuration isn't fetched
    /// yet, flag is unknown, etc.), the default variation of `flag` is returned and the failure is
    /// counted in reported events.
    pub fn get_variation(&self, flag: &FlagRef, user: &User) -> Variation {
        let configuration = self.configuration_store.get_configuration();
        match eval::evaluate(
            configuration.as_deref(),
            &user.id,
            &user.attributes,
            &flag.id,
        ) {
            Ok(variation) => {
                self.aggregator.add_evaluation_count(&flag.id, &variation.key);
                variation
            }
            Err(err) => {
                if err.is_normal() {
                    log::debug!(target: "flagsense",
                                flag_id = flag.id(),
                                user_id = user.id();
                                "serving default variation: {err}");
                } else {
                    log::warn!(target: "flagsense",
                               flag_id = flag.id(),
                               user_id = user.id();
                               "serving default variation: {err}");
                }
                let default = flag.default_variation.clone();
                self.aggregator.add_evaluation_count(&flag.id, &default.key);
                self.aggregator.add_error_count(&flag.id);
                default
            }
        }
    }

    /// Record an occurrence of experiment event `event_name` for `user`. Same as
    /// [`Client::record_event_with_value`] with a value of `1`.
    pub fn record_event(&self, user: &User, flag_id: &str, event_name: &str) {
        self.record_event_with_value(user, flag_id, event_name, 1.0);
    }

    /// Record `value` for experiment event `event_name` against the variant `user` is currently
    /// served for `flag_id`.
    ///
    /// Nothing is recorded unless `flag_id` is an active flag with an experiment that lists
    /// `event_name`.
    pub fn record_event_with_value(&self, user: &User, flag_id: &str, event_name: &str, value: f64) {
        let Some(configuration) = self.configuration_store.get_configuration() else {
            return;
        };

        let registered = configuration
            .experiment(flag_id)
            .is_some_and(|experiment| experiment.event_names.contains(event_name));
        let active = matches!(
            configuration.flags.get(flag_id),
            Some(TryParse::Parsed(flag)) if flag.env_data.status == FlagStatus::Active
        );
        if !registered || !active {
            log::trace!(target: "flagsense",
                        flag_id,
                        event_name;
                        "event is not registered for an active experiment, ignoring");
            return;
        }

        match eval::evaluate(Some(&*configuration), &user.id, &user.attributes, flag_id) {
            Ok(variation) => {
                self.aggregator
                    .record_experiment_event(flag_id, event_name, &variation.key, value);
            }
            Err(err) => {
                log::debug!(target: "flagsense",
                            flag_id,
                            user_id = user.id(),
                            event_name;
                            "not recording event: {err}");
            }
        }
    }

    /// Report an application error that happened while serving `flag` to `user`.
    ///
    /// The error is counted against the variant `user` is currently served, or against the
    /// default variation if the flag cannot be evaluated.
    pub fn record_code_error(&self, flag: &FlagRef, user: &User) {
        if flag.id.is_empty() {
            return;
        }

        let configuration = self.configuration_store.get_configuration();
        let variant_key = eval::evaluate(
            configuration.as_deref(),
            &user.id,
            &user.attributes,
            &flag.id,
        )
        .map(|variation| variation.key)
        .unwrap_or_else(|_| flag.default_variation.key.clone());

        self.aggregator.add_code_bug_count(&flag.id, &variant_key);
    }

    /// Stop background threads, flushing pending events first.
    ///
    /// Blocks for at most the configured shutdown grace period (plus a little bookkeeping).
    /// Calling it more than once is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::BackgroundThreadPanicked`] if a background thread has panicked.
    pub fn shutdown(&self) -> Result<()> {
        let background = self
            .background
            .lock()
            .expect("thread holding background lock should not panic")
            .take();
        background.map_or(Ok(()), BackgroundTasks::shutdown)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let background = self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(background) = background {
            if let Err(err) = background.shutdown() {
                log::warn!(target: "flagsense", "failed to shut down flagsense client: {err}");
            }
        }
    }
}
