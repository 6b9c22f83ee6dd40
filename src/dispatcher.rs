//! A background thread that sends archived event slots to the server.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinSet, time::MissedTickBehavior};

use crate::{events::EventAggregator, transport::Transport, Error, Result};

/// Handle to the dispatcher thread.
///
/// Every flush interval the thread sends one request per archived slot and category. Delivery is
/// at-most-once: a slot is removed from the aggregator before it is sent and is not re-queued if
/// sending fails.
///
/// A tick calls [`EventAggregator::rollover_if_due`], which archives the current slot only once
/// its end boundary has passed. Ticks are offset by half an interval from slot boundaries, so each
/// tick finds exactly one slot that has just ended and is complete. Shutdown archives the current
/// slot unconditionally through [`EventAggregator::force_rollover`] before the final send.
pub(crate) struct Dispatcher {
    join_handle: std::thread::JoinHandle<()>,
    /// Used to send a stop command to the thread. Dropping it stops the thread as well.
    stop_sender: mpsc::Sender<()>,
}

impl Dispatcher {
    /// Start the dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread failed to start.
    pub(crate) fn start(
        transport: Transport,
        aggregator: Arc<EventAggregator>,
        interval: Duration,
        grace_period: Duration,
    ) -> std::io::Result<Dispatcher> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("flagsense-dispatcher".to_owned())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::warn!(target: "flagsense", "failed to start dispatcher runtime: {err}");
                        return;
                    }
                };

                runtime.block_on(run(
                    transport,
                    aggregator,
                    interval,
                    grace_period,
                    stop_receiver,
                ));
            })?;

        Ok(Dispatcher {
            join_handle,
            stop_sender,
        })
    }

    /// Ask the thread to perform the final flush and stop, without waiting for it.
    pub(crate) fn stop(&self) {
        let _ = self.stop_sender.try_send(());
    }

    /// Perform the final flush and block until the thread exits.
    ///
    /// Blocks for at most the configured grace period plus however long the final rollover
    /// takes.
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
    aggregator: Arc<EventAggregator>,
    interval: Duration,
    grace_period: Duration,
    mut stop_receiver: mpsc::Receiver<()>,
) {
    let start = tokio::time::Instant::now() + initial_delay(Utc::now(), interval);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                aggregator.rollover_if_due(Utc::now());
                send_pending(&transport, &aggregator, &mut in_flight);
            }
            // Reap finished sends so the set doesn't grow.
            Some(_) = in_flight.join_next() => {}
            _ = stop_receiver.recv() => {
                log::debug!(target: "flagsense", "dispatcher received stop command");
                break;
            }
        }
    }

    aggregator.force_rollover(Utc::now());
    send_pending(&transport, &aggregator, &mut in_flight);

    let drained = tokio::time::timeout(grace_period, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        log::warn!(target: "flagsense",
                   requests = in_flight.len();
                   "event requests still in flight after shutdown grace period, discarding");
    }
}

/// Drain archived slots from `aggregator` and spawn one send per request.
fn send_pending(
    transport: &Transport,
    aggregator: &EventAggregator,
    in_flight: &mut JoinSet<()>,
) {
    let requests = aggregator.drain_pending();
    if !requests.is_empty() {
        log::debug!(target: "flagsense", requests = requests.len(); "flushing events");
    }

    for request in requests {
        let transport = transport.clone();
        in_flight.spawn(async move {
            let endpoint = request.endpoint();
            if let Err(err) = transport.post(endpoint, &request).await {
                log::warn!(target: "flagsense",
                           api = endpoint.path(),
                           slot = request.time();
                           "failed to send events, discarding: {err}");
            }
        });
    }
}

/// Time until the next point that lies half an interval after a slot boundary.
fn initial_delay(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = i64::try_from(interval.as_millis())
        .unwrap_or(i64::MAX)
        .max(1);
    let delay_ms = (interval_ms / 2 - now.timestamp_millis()).rem_euclid(interval_ms);
    Duration::from_millis(delay_ms.unsigned_abs())
}
