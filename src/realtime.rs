//! Server-sent events subscription that triggers snapshot refreshes on upstream changes.
//!
//! The stream is consumed on a dedicated thread running its own single-threaded tokio runtime.
//! Refreshes are blocking and run on that runtime's blocking pool, so neither the stream nor a
//! slow refresh can ever block evaluation.
use std::{
    fmt::Display,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{config::RealtimeConfig, model::FlagId, Error, Result};

const STREAM_ENDPOINT: &str = "/api/v1/realtime/sse";

/// Event names that signal a change of flag configuration.
const CHANGE_EVENTS: &[&str] = &[
    "flag.created",
    "flag.updated",
    "flag.deleted",
    "flag.toggled",
    "segment.updated",
    "variant.updated",
];

type OnChange = Arc<dyn Fn() -> ControlFlow<()> + Send + Sync>;

/// Connection counters of a [`RealtimeInvalidator`].
#[derive(Debug, Default)]
pub struct RealtimeStatus {
    connected: AtomicBool,
    reconnect_attempts: AtomicU64,
    events_received: AtomicU64,
}

impl RealtimeStatus {
    /// Returns `true` while the stream is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of reconnection attempts since the subscription was started.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of events received since the subscription was started.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::SeqCst)
    }
}

/// Payload of a change event. Only used for filtering, the cache always refetches everything.
#[derive(Debug, Deserialize)]
struct ChangeEvent {
    #[serde(rename = "flagID")]
    flag_id: Option<FlagId>,
    #[serde(rename = "flagKey")]
    flag_key: Option<String>,
}

/// Subscribes to the change stream and calls `on_change` once per relevant event.
pub struct RealtimeInvalidator {
    status: Arc<RealtimeStatus>,
    shutdown_tx: mpsc::Sender<()>,
    join_handle: std::thread::JoinHandle<()>,
}

impl RealtimeInvalidator {
    /// Start the subscription. `on_change` runs on a blocking thread; returning
    /// [`ControlFlow::Break`] ends the subscription.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if the stream URL cannot be built.
    /// - [`Error::Io`] if the thread failed to start.
    pub fn start<F>(config: RealtimeConfig, on_change: F) -> Result<RealtimeInvalidator>
    where
        F: Fn() -> ControlFlow<()> + Send + Sync + 'static,
    {
        let url = stream_url(&config)?;
        let status = Arc::new(RealtimeStatus::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let join_handle = {
            let status = status.clone();
            let on_change: OnChange = Arc::new(on_change);
            std::thread::Builder::new()
                .name("flagent-realtime".to_owned())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(err) => {
                            log::warn!(target: "flagent", "failed to start realtime runtime: {err}");
                            return;
                        }
                    };
                    runtime.block_on(run_stream_loop(url, config, on_change, status, shutdown_rx));
                })?
        };

        Ok(RealtimeInvalidator {
            status,
            shutdown_tx,
            join_handle,
        })
    }

    pub fn status(&self) -> Arc<RealtimeStatus> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.status.reconnect_attempts()
    }

    pub fn events_received(&self) -> u64 {
        self.status.events_received()
    }

    /// Stop the subscription and wait for its thread to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Full buffer means a stop command is already pending, closed channel means the loop has
        // already exited.
        let _ = self.shutdown_tx.try_send(());
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;
        self.status.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn stream_url(config: &RealtimeConfig) -> Result<Url> {
    let mut url = Url::parse(&format!(
        "{}{}",
        config.base_url.trim_end_matches('/'),
        STREAM_ENDPOINT
    ))
    .map_err(Error::InvalidBaseUrl)?;

    if !config.flag_keys.is_empty() || !config.flag_ids.is_empty() {
        let mut query = url.query_pairs_mut();
        for key in &config.flag_keys {
            query.append_pair("flagKey", key);
        }
        for id in &config.flag_ids {
            query.append_pair("flagID", &id.to_string());
        }
    }

    Ok(url)
}

/// Reconnection delay after `consecutive_failures` failures: `base * 2^failures`, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(consecutive_failures.min(10));
    base.saturating_mul(factor).min(max)
}

async fn run_stream_loop(
    url: Url,
    config: RealtimeConfig,
    on_change: OnChange,
    status: Arc<RealtimeStatus>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(err) => {
            log::warn!(target: "flagent", "failed to build realtime http client: {err}");
            return;
        }
    };

    let mut consecutive_failures: u32 = 0;

    loop {
        log::info!(target: "flagent", url:display = url; "connecting to realtime stream");

        let outcome = tokio::select! {
            outcome = connect_and_process(&client, &url, &config, &on_change, &status) => outcome,
            _ = shutdown_rx.recv() => {
                log::info!(target: "flagent", "realtime stream received shutdown signal");
                break;
            }
        };
        status.connected.store(false, Ordering::SeqCst);

        match outcome {
            Ok(ControlFlow::Continue(())) => {
                log::info!(target: "flagent", "realtime stream ended");
                consecutive_failures = 0;
            }
            Ok(ControlFlow::Break(())) => {
                log::debug!(target: "flagent", "snapshot cache is gone, closing realtime stream");
                break;
            }
            Err(err) => {
                log::warn!(target: "flagent", "realtime stream error: {err}");
                consecutive_failures = consecutive_failures.saturating_add(1);
            }
        }

        let delay = backoff_delay(
            config.reconnect_base_delay,
            config.reconnect_max_delay,
            consecutive_failures,
        );
        status.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        log::warn!(target: "flagent",
                   delay_ms = delay.as_millis() as u64,
                   attempts = consecutive_failures;
                   "reconnecting to realtime stream");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                log::info!(target: "flagent", "realtime stream received shutdown signal during reconnect wait");
                break;
            }
        }
    }
}

async fn connect_and_process(
    client: &reqwest::Client,
    url: &Url,
    config: &RealtimeConfig,
    on_change: &OnChange,
    status: &RealtimeStatus,
) -> Result<ControlFlow<()>> {
    let response = client
        .get(url.clone())
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(Error::UnexpectedStatus(response.status().as_u16()));
    }

    status.connected.store(true, Ordering::SeqCst);
    log::info!(target: "flagent", "realtime stream connected");

    process_events(response.bytes_stream().eventsource(), config, on_change, status).await
}

/// Consume events until the stream ends. Each relevant event triggers one `on_change` call.
async fn process_events<S, E>(
    events: S,
    config: &RealtimeConfig,
    on_change: &OnChange,
    status: &RealtimeStatus,
) -> Result<ControlFlow<()>>
where
    S: Stream<Item = std::result::Result<Event, E>>,
    E: Display,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        let event = event.map_err(|err| Error::InvalidationStream(err.to_string()))?;
        status.events_received.fetch_add(1, Ordering::SeqCst);

        if !is_relevant(&event, config) {
            log::trace!(target: "flagent", event:display = event.event; "ignoring realtime event");
            continue;
        }

        log::debug!(target: "flagent", event:display = event.event; "flag change received, refreshing snapshot");
        let on_change = on_change.clone();
        match tokio::task::spawn_blocking(move || on_change()).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => return Ok(ControlFlow::Break(())),
            Err(err) => {
                log::warn!(target: "flagent", "refresh triggered by realtime event failed: {err}");
            }
        }
    }

    Ok(ControlFlow::Continue(()))
}

fn is_relevant(event: &Event, config: &RealtimeConfig) -> bool {
    if !CHANGE_EVENTS.contains(&event.event.as_str()) {
        return false;
    }

    if config.flag_keys.is_empty() && config.flag_ids.is_empty() {
        return true;
    }

    // Events that don't say which flag changed are always relevant.
    let Ok(change) = serde_json::from_str::<ChangeEvent>(&event.data) else {
        return true;
    };
    if change.flag_id.is_none() && change.flag_key.is_none() {
        return true;
    }

    change
        .flag_key
        .is_some_and(|key| config.flag_keys.contains(&key))
        || change
            .flag_id
            .is_some_and(|id| config.flag_ids.contains(&id))
}
