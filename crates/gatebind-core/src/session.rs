//! Provisioning session - the connect orchestrator.
//!
//! Drives scan → connect → subscribe → set token → verify token and keeps
//! the resulting link for the feature operations.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use data_encoding::HEXUPPER;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::advertisement::{DeviceRecord, MacAddress};
use crate::error::ProvisionError;
use crate::events::{ConnectStep, ProvisionEvent, ProvisionObserver, StepStatus, TracingObserver};
use crate::protocol::CommandSet;
use crate::protocol::constants::*;
use crate::radio::{ChannelId, DiscoveryOptions, Radio, RadioEvent};
use crate::scan::{ScanCoordinator, ScanTarget};
use crate::state::handlers::{self, HandlerContext, TokenStep};
use crate::state::{ConnectionState, StateMachineContext};
use crate::transport::{CommandTransport, TransportConfig};

/// GATT layout of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattProfile {
    /// Service shared by both characteristic pairs.
    pub service: Uuid,
    pub base_write: Uuid,
    pub base_notify: Uuid,
    pub device_write: Uuid,
    pub device_notify: Uuid,
    /// Service-data UUID of the advertisement.
    pub advertisement_service: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: DEVICE_SERVICE_UUID,
            base_write: BASE_WRITE_UUID,
            base_notify: BASE_NOTIFY_UUID,
            device_write: DEVICE_WRITE_UUID,
            device_notify: DEVICE_NOTIFY_UUID,
            advertisement_service: ADVERTISEMENT_SERVICE_UUID,
        }
    }
}

/// Configuration for a provisioning session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub scan_timeout_ms: u64,
    /// Link connect timeout, unless the connect options override it.
    pub connect_timeout_ms: u64,
    /// Default command deadline (token handshake).
    pub command_timeout_ms: u64,
    pub wifi_list_timeout_ms: u64,
    pub set_wifi_timeout_ms: u64,
    /// Deadline of each MQTT part.
    pub mqtt_timeout_ms: u64,
    /// Link chunk size.
    pub max_write_len: usize,
    /// Settle delay of fire-and-forget writes.
    pub no_response_delay_ms: u64,
    pub discovery_interval_ms: u64,
    pub profile: GattProfile,
    pub commands: CommandSet,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            wifi_list_timeout_ms: WIFI_LIST_TIMEOUT_MS,
            set_wifi_timeout_ms: SET_WIFI_TIMEOUT_MS,
            mqtt_timeout_ms: MQTT_TIMEOUT_MS,
            max_write_len: MAX_WRITE_LEN,
            no_response_delay_ms: NO_RESPONSE_DELAY_MS,
            discovery_interval_ms: DISCOVERY_INTERVAL_MS,
            profile: GattProfile::default(),
            commands: CommandSet::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.max_write_len < FRAME_HEADER_LEN {
            return Err(ProvisionError::InvalidConfig(format!(
                "max_write_len must be at least {FRAME_HEADER_LEN}, got {}",
                self.max_write_len
            )));
        }
        let timeouts = [
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("wifi_list_timeout_ms", self.wifi_list_timeout_ms),
            ("set_wifi_timeout_ms", self.set_wifi_timeout_ms),
            ("mqtt_timeout_ms", self.mqtt_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ProvisionError::InvalidConfig(format!("{name} must be non-zero")));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn wifi_list_timeout(&self) -> Duration {
        Duration::from_millis(self.wifi_list_timeout_ms)
    }

    pub fn set_wifi_timeout(&self) -> Duration {
        Duration::from_millis(self.set_wifi_timeout_ms)
    }

    pub fn mqtt_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_timeout_ms)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            interval: Duration::from_millis(self.discovery_interval_ms),
            ..DiscoveryOptions::default()
        }
    }

    fn transport_config(&self, radio_limit: usize) -> TransportConfig {
        TransportConfig {
            exec_marker: self.commands.exec_result,
            max_write_len: self.max_write_len.min(radio_limit),
            no_response_delay: Duration::from_millis(self.no_response_delay_ms),
        }
    }
}

/// 16-byte shared secret of the token handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXUPPER.encode(&self.0)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to tell tokens apart in logs.
        write!(f, "SessionToken({}…)", &self.to_hex()[..4])
    }
}

impl FromStr for SessionToken {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXUPPER
            .decode(s.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| ProvisionError::InvalidConfig(format!("token: {e}")))?;
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            ProvisionError::InvalidConfig(format!("token must be {TOKEN_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

/// Parameters of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Connect to this device; without it, the first unbound device of
    /// `product_id` is taken.
    pub mac: Option<MacAddress>,
    pub product_id: u8,
    /// Token of an earlier session with the same device.
    pub token: Option<SessionToken>,
    /// Overrides the configured connect timeout.
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn product(product_id: u8) -> Self {
        Self {
            mac: None,
            product_id,
            token: None,
            timeout: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_token(mut self, token: SessionToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Holds the keep-awake hint; released on drop.
struct KeepAwake<'a, R: Radio>(&'a R);

impl<'a, R: Radio> KeepAwake<'a, R> {
    fn hold(radio: &'a R) -> Self {
        radio.set_keep_awake(true);
        Self(radio)
    }
}

impl<R: Radio> Drop for KeepAwake<'_, R> {
    fn drop(&mut self) {
        self.0.set_keep_awake(false);
    }
}

/// An open link: the command transport plus the task watching for drops.
pub(crate) struct Link<R: Radio> {
    pub(crate) transport: CommandTransport<R>,
    watcher: JoinHandle<()>,
    /// Set by whoever reports the end of the link, so it is reported once.
    ended: Arc<AtomicBool>,
}

/// How a torn-down link ended.
struct LinkEnd {
    /// Nobody reported the end yet; the caller owns the report.
    unreported: bool,
    /// The radio had already lost the link.
    dropped: bool,
}

fn lock(ctx: &Mutex<StateMachineContext>) -> MutexGuard<'_, StateMachineContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move to `next` and report the change.
fn transition<O: ProvisionObserver>(ctx: &Mutex<StateMachineContext>, observer: &O, next: ConnectionState) {
    let from = lock(ctx).goto_state(next);
    if from != next {
        observer.on_event(&ProvisionEvent::StateChanged { from, to: next });
    }
}

/// Report a link drop of `channel` once, then stop.
async fn watch_link<O: ProvisionObserver>(
    mut events: broadcast::Receiver<RadioEvent>,
    channel: ChannelId,
    ended: Arc<AtomicBool>,
    ctx: Arc<Mutex<StateMachineContext>>,
    observer: Arc<O>,
) {
    loop {
        match events.recv().await {
            Ok(RadioEvent::ConnectionChanged {
                channel: from,
                connected: false,
            }) if from == channel => {
                if ended.swap(true, Ordering::SeqCst) {
                    return;
                }
                warn!(channel = %channel, "Link lost");
                let device = lock(&ctx).device.take();
                transition(&ctx, &*observer, ConnectionState::Disconnected);
                observer.on_event(&ProvisionEvent::Step {
                    step: ConnectStep::Disconnected,
                    status: StepStatus::Success,
                    device,
                });
                return;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Link watcher lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

/// Provisioning session - orchestrates connect and owns the link.
pub struct ProvisionSession<R: Radio + 'static, O: ProvisionObserver + 'static> {
    pub(crate) radio: Arc<R>,
    pub(crate) config: SessionConfig,
    pub(crate) observer: Arc<O>,
    ctx: Arc<Mutex<StateMachineContext>>,
    pub(crate) link: Option<Link<R>>,
    token: Option<SessionToken>,
}

impl<R: Radio + 'static> ProvisionSession<R, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(radio: Arc<R>, config: SessionConfig) -> Self {
        Self::with_observer(radio, config, Arc::new(TracingObserver))
    }
}

impl<R: Radio + 'static, O: ProvisionObserver + 'static> ProvisionSession<R, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(radio: Arc<R>, config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            radio,
            config,
            observer,
            ctx: Arc::new(Mutex::new(StateMachineContext::new())),
            link: None,
            token: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.ctx).state
    }

    /// Device of the current link, if any.
    pub fn device(&self) -> Option<DeviceRecord> {
        lock(&self.ctx).device.clone()
    }

    /// Token accepted by the device in the last successful connect.
    ///
    /// Store it to reconnect to the same device later.
    pub fn token(&self) -> Option<SessionToken> {
        self.token
    }

    pub(crate) fn emit_step(&self, step: ConnectStep, status: StepStatus) {
        self.observer.on_event(&ProvisionEvent::Step {
            step,
            status,
            device: self.device(),
        });
    }

    fn emit_step_with(&self, step: ConnectStep, status: StepStatus, device: Option<DeviceRecord>) {
        self.observer.on_event(&ProvisionEvent::Step {
            step,
            status,
            device,
        });
    }

    /// Enter the state of `step` and announce it.
    ///
    /// Fails with `Disconnected` when the link dropped under the chain.
    fn advance(&self, next: ConnectionState) -> Result<(), ProvisionError> {
        if !self.state().can_transition_to(next) {
            return Err(ProvisionError::Disconnected);
        }
        transition(&self.ctx, &*self.observer, next);
        if let Some(step) = next.step() {
            self.emit_step(step, StepStatus::InProgress);
        }
        Ok(())
    }

    /// Forget the device and settle in `resting`.
    fn rest(&self, resting: ConnectionState) {
        let from = lock(&self.ctx).reset(resting);
        if from != resting {
            self.observer.on_event(&ProvisionEvent::StateChanged { from, to: resting });
        }
    }

    /// Stop the watcher and transport and close the radio link.
    ///
    /// Returns `None` when no link was open.
    async fn teardown_link(&mut self) -> Option<LinkEnd> {
        let link = self.link.take()?;
        let unreported = !link.ended.swap(true, Ordering::SeqCst);
        link.watcher.abort();
        let dropped = !link.transport.is_connected();
        link.transport.shutdown();
        if !dropped {
            if let Err(e) = self.radio.disconnect(link.transport.channel()).await {
                warn!(error = %e, "Failed to close link");
            }
        }
        Some(LinkEnd { unreported, dropped })
    }

    /// Unwind a failed attempt and report `step` as failed.
    ///
    /// When the link dropped under the step, `Disconnected` closes the
    /// report; a drop the watcher already reported suppresses the failure.
    async fn abort(&mut self, step: ConnectStep, err: ProvisionError) -> ProvisionError {
        let device = self.device();
        let end = self.teardown_link().await;
        self.rest(if end.is_some() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Idle
        });
        warn!(step = %step, error = %err, "Connect attempt failed");
        match end {
            Some(LinkEnd { unreported: false, .. }) => {
                debug!(step = %step, "Link drop already reported");
            }
            Some(LinkEnd { dropped: true, .. }) => {
                self.emit_step_with(step, StepStatus::Failed, device.clone());
                self.emit_step_with(ConnectStep::Disconnected, StepStatus::Success, device);
            }
            _ => self.emit_step_with(step, StepStatus::Failed, device),
        }
        err
    }

    /// Find, connect and authenticate a gateway.
    ///
    /// Every step reports `InProgress` then `Success` or `Failed`; the first
    /// failure ends the attempt and is returned. The keep-awake hint is held
    /// for the whole attempt.
    #[instrument(skip(self), fields(product = format!("0x{:02X}", options.product_id)))]
    pub async fn start_connect(&mut self, options: ConnectOptions) -> Result<DeviceRecord, ProvisionError> {
        self.config.validate()?;
        if self.link.is_some() {
            debug!("Closing previous link");
            self.teardown_link().await;
        }
        self.rest(ConnectionState::Idle);

        let radio = Arc::clone(&self.radio);
        let _awake = KeepAwake::hold(&*radio);
        let token = options.token.unwrap_or_else(SessionToken::generate);

        // Scan
        self.advance(ConnectionState::Scanning)?;
        let mut scanner = ScanCoordinator::new(
            Arc::clone(&self.radio),
            self.config.profile.advertisement_service,
            self.config.discovery_options(),
        );
        let target = ScanTarget::new(options.mac, options.product_id);
        let device = match scanner.find(target, self.config.scan_timeout()).await {
            Ok(device) => device,
            Err(e) => return Err(self.abort(ConnectStep::Scan, e).await),
        };
        lock(&self.ctx).device = Some(device.clone());
        self.emit_step(ConnectStep::Scan, StepStatus::Success);

        // Connect
        if let Err(e) = self.advance(ConnectionState::Connecting) {
            return Err(self.abort(ConnectStep::Connect, e).await);
        }
        let watcher_events = self.radio.events();
        let timeout = options.timeout.unwrap_or_else(|| self.config.connect_timeout());
        let connected = {
            let ctx = HandlerContext {
                radio: &*self.radio,
                config: &self.config,
                device: &device,
            };
            handlers::connect(&ctx, timeout).await
        };
        if let Err(e) = connected {
            // Nothing to close, but the radio may hold a half-open link.
            if let Err(close) = self.radio.disconnect(&device.channel).await {
                debug!(error = %close, "Cleanup after failed connect");
            }
            return Err(self.abort(ConnectStep::Connect, e).await);
        }
        let transport = CommandTransport::attach(
            Arc::clone(&self.radio),
            device.channel.clone(),
            self.config.profile.service,
            self.config.transport_config(self.radio.max_write_len()),
        );
        let ended = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_link(
            watcher_events,
            device.channel.clone(),
            Arc::clone(&ended),
            Arc::clone(&self.ctx),
            Arc::clone(&self.observer),
        ));
        self.link = Some(Link {
            transport,
            watcher,
            ended,
        });
        self.emit_step(ConnectStep::Connect, StepStatus::Success);

        // Subscribe
        if let Err(e) = self.advance(ConnectionState::SubscribingNotifications) {
            return Err(self.abort(ConnectStep::Subscribe, e).await);
        }
        let subscribed = {
            let ctx = HandlerContext {
                radio: &*self.radio,
                config: &self.config,
                device: &device,
            };
            handlers::subscribe_notifications(&ctx).await
        };
        if let Err(e) = subscribed {
            return Err(self.abort(ConnectStep::Subscribe, e).await);
        }
        self.emit_step(ConnectStep::Subscribe, StepStatus::Success);

        // Token handshake
        for (state, step, half) in [
            (ConnectionState::SettingToken, ConnectStep::SetToken, TokenStep::Set),
            (ConnectionState::VerifyingToken, ConnectStep::VerifyToken, TokenStep::Verify),
        ] {
            if let Err(e) = self.advance(state) {
                return Err(self.abort(step, e).await);
            }
            let result = match &self.link {
                Some(link) => handlers::exchange_token(&link.transport, &self.config, half, &token).await,
                None => Err(ProvisionError::Disconnected),
            };
            if let Err(e) = result {
                return Err(self.abort(step, e).await);
            }
            self.emit_step(step, StepStatus::Success);
        }

        if let Err(e) = self.advance(ConnectionState::Ready) {
            return Err(self.abort(ConnectStep::VerifyToken, e).await);
        }
        self.token = Some(token);
        info!(mac = %device.mac, name = %device.name, "Gateway ready");
        Ok(device)
    }

    /// Close the link and forget the device.
    ///
    /// Safe to call at any time; reports `Disconnected` when a link was open.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) {
        let device = self.device();
        match self.teardown_link().await {
            Some(end) => {
                self.rest(ConnectionState::Disconnected);
                if end.unreported {
                    self.emit_step_with(ConnectStep::Disconnected, StepStatus::Success, device);
                }
            }
            None => self.rest(ConnectionState::Idle),
        }
    }

    /// Transport of a ready link.
    pub(crate) fn transport(&self) -> Result<&CommandTransport<R>, ProvisionError> {
        match &self.link {
            Some(link) if link.transport.is_connected() => Ok(&link.transport),
            _ => Err(ProvisionError::Disconnected),
        }
    }
}

impl<R: Radio + 'static, O: ProvisionObserver + 'static> Drop for ProvisionSession<R, O> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.watcher.abort();
            link.transport.shutdown();
        }
    }
}
