//! A background thread that periodically fetches configuration changes from the server and
//! publishes new snapshots into a [`ConfigurationStore`].
use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::MissedTickBehavior};

use crate::{
    config::Environment,
    configuration_store::ConfigurationStore,
    model::{Configuration, Experiment, Flag, Segment, TryParse},
    transport::{Endpoint, Transport},
    Error, Result,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    environment: Environment,
    last_updated_on: i64,
}

/// Body of a `fetchLatest` response.
///
/// The server omits (or sends empty) collections that haven't changed since the requested
/// timestamp.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FetchResponse {
    pub last_updated_on: Option<i64>,
    pub segments: Option<HashMap<String, TryParse<Segment>>>,
    pub flags: Option<HashMap<String, TryParse<Flag>>>,
    pub experiments: Option<HashMap<String, Experiment>>,
}

/// Decode a `fetchLatest` response body. An empty or `null` body means "no changes".
pub(crate) fn parse_fetch_response(body: &[u8]) -> Result<Option<FetchResponse>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(serde_json::from_slice(body)?)
}

/// Build the snapshot that should replace `previous`, or `None` if the response must not be
/// published.
///
/// A response is published only if it carries a timestamp newer than `previous` and all three
/// collections are present. Empty collections mean "unchanged" and are carried over from
/// `previous`.
pub(crate) fn apply_fetch_response(
    previous: &Configuration,
    response: FetchResponse,
) -> Option<Configuration> {
    let FetchResponse {
        last_updated_on,
        segments,
        flags,
        experiments,
    } = response;

    let last_updated_on = last_updated_on.filter(|&ts| ts > previous.last_updated_on)?;
    let (segments, flags, experiments) = (segments?, flags?, experiments?);

    Some(Configuration {
        last_updated_on,
        segments: overlay(&previous.segments, segments),
        flags: overlay(&previous.flags, flags),
        experiments: overlay(&previous.experiments, experiments),
    })
}

fn overlay<T>(
    previous: &Arc<HashMap<String, T>>,
    received: HashMap<String, T>,
) -> Arc<HashMap<String, T>> {
    if received.is_empty() {
        Arc::clone(previous)
    } else {
        Arc::new(received)
    }
}

/// Fetch changes since the currently published snapshot and publish the result.
///
/// Must only be called from the synchronizer runtime: the store is read again after the request
/// completes and there is no await point between that read and the publish, so concurrent fetches
/// on the same current-thread runtime cannot overwrite a newer snapshot.
async fn fetch_latest(
    transport: &Transport,
    store: &ConfigurationStore,
    environment: Environment,
) -> Result<()> {
    let request = FetchRequest {
        environment,
        last_updated_on: store.current().last_updated_on,
    };
    log::debug!(target: "flagsense",
                last_updated_on = request.last_updated_on;
                "fetching configuration");

    let body = transport.post(Endpoint::FetchLatest, &request).await?;
    let Some(response) = parse_fetch_response(&body)? else {
        log::debug!(target: "flagsense", "no configuration changes");
        return Ok(());
    };

    match apply_fetch_response(&store.current(), response) {
        Some(configuration) => {
            log::debug!(target: "flagsense",
                        last_updated_on = configuration.last_updated_on;
                        "publishing new configuration");
            store.publish(Arc::new(configuration));
        }
        None => {
            log::debug!(target: "flagsense", "fetched configuration is stale or incomplete");
        }
    }
    Ok(())
}

/// Handle to the synchronizer thread.
///
/// The thread performs the first fetch immediately after start and then one fetch every
/// `interval`. Each fetch runs as a separate task, so a slow request never delays the next tick.
pub(crate) struct Synchronizer {
    join_handle: std::thread::JoinHandle<()>,
    /// Used to send a stop command to the thread. Dropping it stops the thread as well.
    stop_sender: mpsc::Sender<()>,
}

impl Synchronizer {
    /// Start the synchronizer thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread failed to start.
    pub(crate) fn start(
        transport: Transport,
        store: Arc<ConfigurationStore>,
        environment: Environment,
        interval: Duration,
    ) -> std::io::Result<Synchronizer> {
        // Buffer of 1 is enough: a stop command is only ever sent once, and `try_send()` failing
        // on a full buffer means another stop is already queued.
        let (stop_sender, stop_receiver) = mpsc::channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("flagsense-synchronizer".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::warn!(target: "flagsense", "failed to start synchronizer runtime: {err}");
                        return;
                    }
                };

                runtime.block_on(run(transport, store, environment, interval, stop_receiver));
                // Dropping the runtime cancels fetches that are still in flight.
            })?;

        Ok(Synchronizer {
            join_handle,
            stop_sender,
        })
    }

    /// Ask the thread to stop without waiting for it.
    pub(crate) fn stop(&self) {
        // Error means the thread has already exited or a stop command is already queued. Either
        // way, there's nothing left to do.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the thread and block until it exits.
    ///
    /// # Errors
    ///
    /// - [`Error::BackgroundThreadPanicked`] if the thread has panicked.
    pub(crate) fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::BackgroundThreadPanicked)
    }
}

async fn run(
    transport: Transport,
    store: Arc<ConfigurationStore>,
    environment: Environment,
    interval: Duration,
    mut stop_receiver: mpsc::Receiver<()>,
) {
    // First tick completes immediately, which gives us the initial fetch.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let transport = transport.clone();
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(err) = fetch_latest(&transport, &store, environment).await {
                        log::warn!(target: "flagsense",
                                   api = "fetchLatest";
                                   "failed to fetch configuration: {err}");
                    }
                });
            }
            // `None` means the handle was dropped, which is a stop command too.
            _ = stop_receiver.recv() => {
                log::debug!(target: "flagsense", "synchronizer received stop command");
                return;
            }
        }
    }
}
