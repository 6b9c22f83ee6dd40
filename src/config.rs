use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Client, Result};

/// Environment the flags are evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Environment {
    Dev,
    Stage,
    Uat,
    #[default]
    Prod,
}

impl Environment {
    /// Name of the environment as the server knows it.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "DEV",
            Environment::Stage => "STAGE",
            Environment::Uat => "UAT",
            Environment::Prod => "PROD",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a name that is not in the environment allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown environment: {0}")]
pub struct UnknownEnvironment(String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DEV" => Ok(Environment::Dev),
            "STAGE" => Ok(Environment::Stage),
            "UAT" => Ok(Environment::Uat),
            "PROD" => Ok(Environment::Prod),
            other => Err(UnknownEnvironment(other.to_owned())),
        }
    }
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagsense::ClientConfig;
/// let config = ClientConfig::new("sdk-id", "sdk-secret")
///     .environment("DEV")
///     .max_initialization_wait(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) sdk_id: String,
    pub(crate) sdk_secret: String,
    pub(crate) environment: Environment,
    pub(crate) data_refresh_interval: Duration,
    pub(crate) event_flush_interval: Duration,
    pub(crate) max_initialization_wait: Duration,
    pub(crate) shutdown_grace_period: Duration,
    pub(crate) base_url: String,
    pub(crate) events_base_url: String,
    pub(crate) capture_events: bool,
}

impl ClientConfig {
    /// Default base URL for configuration API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://app-apis.flagsense.com/v1/sdk-service/";
    /// Default base URL for event API calls.
    pub const DEFAULT_EVENTS_BASE_URL: &'static str =
        "https://app-events.flagsense.com/v1/event-service/";
    /// Default value for [`ClientConfig::data_refresh_interval`]. Also used instead of intervals
    /// shorter than [`ClientConfig::MIN_DATA_REFRESH_INTERVAL`].
    pub const DEFAULT_DATA_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Shortest allowed data refresh interval.
    pub const MIN_DATA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`ClientConfig::event_flush_interval`].
    pub const DEFAULT_EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Shortest allowed event flush interval.
    pub const MIN_EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`ClientConfig::max_initialization_wait`].
    pub const DEFAULT_MAX_INITIALIZATION_WAIT: Duration = Duration::from_secs(30);
    /// Default value for [`ClientConfig::shutdown_grace_period`].
    pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

    /// Create a default configuration using the specified SDK credentials.
    ///
    /// Empty credentials are rejected when the client is created.
    pub fn new(sdk_id: impl Into<String>, sdk_secret: impl Into<String>) -> Self {
        ClientConfig {
            sdk_id: sdk_id.into(),
            sdk_secret: sdk_secret.into(),
            environment: Environment::default(),
            data_refresh_interval: ClientConfig::DEFAULT_DATA_REFRESH_INTERVAL,
            event_flush_interval: ClientConfig::DEFAULT_EVENT_FLUSH_INTERVAL,
            max_initialization_wait: ClientConfig::DEFAULT_MAX_INITIALIZATION_WAIT,
            shutdown_grace_period: ClientConfig::DEFAULT_SHUTDOWN_GRACE_PERIOD,
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            events_base_url: ClientConfig::DEFAULT_EVENTS_BASE_URL.to_owned(),
            capture_events: true,
        }
    }

    /// Set environment by name. Names outside of `DEV`, `STAGE`, `UAT`, `PROD` fall back to
    /// `PROD`.
    pub fn environment(mut self, environment: impl AsRef<str>) -> Self {
        self.environment = environment.as_ref().parse().unwrap_or_else(|err| {
            log::warn!(target: "flagsense", "{err}, falling back to {}", Environment::Prod);
            Environment::Prod
        });
        self
    }

    /// Set how often configuration is fetched from the server.
    ///
    /// Intervals shorter than a minute are replaced with the default of five minutes.
    pub fn data_refresh_interval(mut self, interval: Duration) -> Self {
        self.data_refresh_interval = if interval >= ClientConfig::MIN_DATA_REFRESH_INTERVAL {
            interval
        } else {
            ClientConfig::DEFAULT_DATA_REFRESH_INTERVAL
        };
        self
    }

    /// Set the width of event aggregation slots, which is also how often events are sent.
    ///
    /// Intervals shorter than a minute are raised to one minute.
    pub fn event_flush_interval(mut self, interval: Duration) -> Self {
        self.event_flush_interval = interval.max(ClientConfig::MIN_EVENT_FLUSH_INTERVAL);
        self
    }

    /// Set the default time [`Client::wait_for_initialization`] waits for. Can be changed later
    /// with [`Client::set_max_initialization_wait`].
    pub fn max_initialization_wait(mut self, timeout: Duration) -> Self {
        self.max_initialization_wait = timeout;
        self
    }

    /// Set how long shutdown waits for in-flight event requests.
    pub fn shutdown_grace_period(mut self, grace_period: Duration) -> Self {
        self.shutdown_grace_period = grace_period;
        self
    }

    /// Override base URL for configuration API calls. Clients should use the default setting in
    /// most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override base URL for event API calls. Clients should use the default setting in most
    /// cases.
    pub fn events_base_url(mut self, events_base_url: impl Into<String>) -> Self {
        self.events_base_url = events_base_url.into();
        self
    }

    /// Enable or disable collection of evaluation counts and experiment events.
    pub fn capture_events(mut self, capture_events: bool) -> Self {
        self.capture_events = capture_events;
        self
    }

    /// Create a new [`Client`] using the specified configuration and start its background
    /// tasks.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`](crate::Error::InvalidCredentials) if SDK id or secret is
    ///   empty.
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if a base URL cannot be parsed.
    /// - [`Error::Io`](crate::Error::Io) if a background thread failed to start.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ClientConfig, Environment};

    #[test]
    fn defaults() {
        let config = ClientConfig::new("id", "secret");
        assert_eq!(config.environment, Environment::Prod);
        assert_eq!(config.data_refresh_interval, Duration::from_secs(300));
        assert_eq!(config.event_flush_interval, Duration::from_secs(300));
        assert!(config.capture_events);
    }

    #[test]
    fn environment_allow_list() {
        assert_eq!(
            ClientConfig::new("id", "secret").environment("UAT").environment,
            Environment::Uat
        );
        assert_eq!(
            ClientConfig::new("id", "secret").environment("staging").environment,
            Environment::Prod
        );
        assert_eq!(
            ClientConfig::new("id", "secret").environment("").environment,
            Environment::Prod
        );
    }

    #[test]
    fn short_refresh_interval_falls_back_to_default() {
        let config = ClientConfig::new("id", "secret").data_refresh_interval(Duration::from_secs(10));
        assert_eq!(config.data_refresh_interval, Duration::from_secs(300));

        let config = ClientConfig::new("id", "secret").data_refresh_interval(Duration::from_secs(90));
        assert_eq!(config.data_refresh_interval, Duration::from_secs(90));
    }

    #[test]
    fn short_flush_interval_is_raised_to_minimum() {
        let config = ClientConfig::new("id", "secret").event_flush_interval(Duration::from_secs(1));
        assert_eq!(config.event_flush_interval, Duration::from_secs(60));
    }
}
