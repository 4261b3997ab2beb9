//! Action providers and the per-channel registry.
//!
//! Each channel is served by one provider. The registry bounds in-flight
//! dispatches per channel with a semaphore so a slow gateway cannot starve
//! the other channels of workers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use loadout_core::config::ProvidersConfig;
use loadout_core::dispatch::{ActionProvider, DispatchError, DispatchReceipt, DispatchRequest};
use loadout_core::domain::agent::Channel;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Posts the dispatch request as JSON to a channel gateway. The dedup key
/// travels as the `Idempotency-Key` header.
pub struct HttpProvider {
    channel: Channel,
    endpoint: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayReceipt {
    #[serde(alias = "id", alias = "message_id")]
    external_ref: String,
}

impl HttpProvider {
    pub fn new(
        channel: Channel,
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        client: reqwest::Client,
    ) -> Self {
        Self { channel, endpoint: endpoint.into(), api_key, client }
    }
}

#[async_trait]
impl ActionProvider for HttpProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let mut outgoing = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_HEADER, request.dedup_key.as_str())
            .json(request);
        if let Some(api_key) = &self.api_key {
            outgoing = outgoing.bearer_auth(api_key.expose_secret());
        }

        let response = outgoing.send().await.map_err(|error| {
            DispatchError::Transient(format!("{} gateway unreachable: {error}", self.channel))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.channel, status, &body));
        }

        let receipt = response.json::<GatewayReceipt>().await.map_err(|error| {
            let channel = self.channel;
            DispatchError::Permanent(format!("{channel} gateway returned no receipt: {error}"))
        })?;
        Ok(DispatchReceipt { external_ref: receipt.external_ref })
    }
}

/// Throttling, timeouts and server faults are worth retrying; any other
/// rejection will fail the same way again.
fn classify_status(channel: Channel, status: StatusCode, body: &str) -> DispatchError {
    let detail = format!("{channel} gateway responded {status}: {}", body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        DispatchError::Transient(detail)
    } else {
        DispatchError::Permanent(detail)
    }
}

// ---------------------------------------------------------------------------
// Recording provider
// ---------------------------------------------------------------------------

/// Dry-run provider. Records every request, answers repeat keys with the
/// same reference and can be scripted to fail.
pub struct RecordingProvider {
    channel: Channel,
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    requests: Vec<DispatchRequest>,
    issued: HashMap<String, String>,
    scripted_failures: VecDeque<DispatchError>,
}

impl RecordingProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel, state: Mutex::new(RecordingState::default()) }
    }

    /// Queue a failure for the next dispatch.
    pub async fn fail_next(&self, error: DispatchError) {
        self.state.lock().await.scripted_failures.push_back(error);
    }

    pub async fn requests(&self) -> Vec<DispatchRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Distinct external references handed out so far.
    pub async fn issued_count(&self) -> usize {
        self.state.lock().await.issued.len()
    }
}

#[async_trait]
impl ActionProvider for RecordingProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let mut state = self.state.lock().await;
        state.requests.push(request.clone());
        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }

        let key = request.dedup_key.as_str();
        let next = state.issued.len() + 1;
        let channel = self.channel;
        let external_ref = state
            .issued
            .entry(key.to_string())
            .or_insert_with(|| format!("dry-{channel}-{next:06}"))
            .clone();

        debug!(
            event_name = "provider.recording.dispatch",
            channel = %channel,
            dedup_key = %key,
            external_ref = %external_ref,
            "dry-run dispatch recorded"
        );
        Ok(DispatchReceipt { external_ref })
    }
}

/// Holds the first dispatch open until the test releases it, then delegates
/// to a recording provider.
#[cfg(test)]
pub(crate) struct GatedProvider {
    inner: Arc<RecordingProvider>,
    armed: std::sync::atomic::AtomicBool,
    pub entered: tokio::sync::Notify,
    pub release: tokio::sync::Notify,
}

#[cfg(test)]
impl GatedProvider {
    pub fn new(inner: Arc<RecordingProvider>) -> Self {
        Self {
            inner,
            armed: std::sync::atomic::AtomicBool::new(true),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ActionProvider for GatedProvider {
    fn channel(&self) -> Channel {
        self.inner.channel()
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.dispatch(request).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ChannelSlot {
    provider: Arc<dyn ActionProvider>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

#[derive(Default)]
pub struct ProviderRegistry {
    slots: BTreeMap<Channel, ChannelSlot>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from configuration: recording providers for every
    /// channel in dry-run mode, otherwise one HTTP provider per configured
    /// endpoint. Channels without an endpoint stay unserved.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, reqwest::Error> {
        let mut registry = Self::new();
        if config.dry_run {
            for channel in Channel::ALL {
                registry.register(
                    Arc::new(RecordingProvider::new(channel)),
                    config.concurrency_for(channel),
                );
            }
            return Ok(registry);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        for (channel, endpoint) in &config.endpoints {
            registry.register(
                Arc::new(HttpProvider::new(
                    *channel,
                    endpoint.clone(),
                    config.api_key.clone(),
                    client.clone(),
                )),
                config.concurrency_for(*channel),
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn ActionProvider>, max_concurrency: usize) {
        let max_concurrency = max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrency));
        self.slots.insert(provider.channel(), ChannelSlot { provider, permits, max_concurrency });
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.slots.keys().copied().collect()
    }

    pub fn max_concurrency(&self, channel: Channel) -> Option<usize> {
        self.slots.get(&channel).map(|slot| slot.max_concurrency)
    }

    /// Dispatches through the channel's provider once a permit is free.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<DispatchReceipt, DispatchError> {
        let slot = self.slots.get(&request.channel).ok_or_else(|| {
            DispatchError::Permanent(format!("no provider configured for {}", request.channel))
        })?;

        let _permit = slot.permits.acquire().await.map_err(|_| {
            DispatchError::Transient(format!("{} provider is shutting down", request.channel))
        })?;
        slot.provider.dispatch(request).await
    }
}
