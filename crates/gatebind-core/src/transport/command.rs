//! Command transport bound to one connected channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::table::{CommandResponse, CorrelationKey, CorrelationTable, PendingCommand};
use crate::error::ProvisionError;
use crate::protocol::constants::{DEFAULT_COMMAND_TIMEOUT_MS, MAX_WRITE_LEN, NO_RESPONSE_DELAY_MS};
use crate::protocol::frame;
use crate::radio::{ChannelId, Radio, RadioEvent};

/// Link-level transport settings.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub exec_marker: u8,
    pub max_write_len: usize,
    pub no_response_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exec_marker: 0xFF,
            max_write_len: MAX_WRITE_LEN,
            no_response_delay: Duration::from_millis(NO_RESPONSE_DELAY_MS),
        }
    }
}

/// Per-call options of [`CommandTransport::invoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeOptions {
    pub timeout: Duration,
    pub expects_response: bool,
    pub fragmented: bool,
}

impl InvokeOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expects_response: true,
            fragmented: false,
        }
    }

    /// The reply arrives as indexed fragments.
    pub fn fragmented(mut self) -> Self {
        self.fragmented = true;
        self
    }

    /// Fire-and-forget: succeed shortly after the write.
    pub fn no_response(mut self) -> Self {
        self.expects_response = false;
        self
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS))
    }
}

/// Sends commands on one channel and correlates their replies.
///
/// Owns the correlation table and a pump task that feeds radio
/// notifications into it. Dropping the transport stops the pump.
pub struct CommandTransport<R: Radio> {
    radio: Arc<R>,
    channel: ChannelId,
    service: Uuid,
    config: TransportConfig,
    table: Arc<Mutex<CorrelationTable>>,
    connected: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl<R: Radio + 'static> CommandTransport<R> {
    /// Attach to a connected channel. Must be called inside a tokio runtime.
    pub fn attach(radio: Arc<R>, channel: ChannelId, service: Uuid, config: TransportConfig) -> Self {
        let table = Arc::new(Mutex::new(CorrelationTable::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump(
            radio.events(),
            channel.clone(),
            config.exec_marker,
            Arc::clone(&table),
            Arc::clone(&connected),
        ));
        Self {
            radio,
            channel,
            service,
            config,
            table,
            connected,
            pump,
        }
    }
}

impl<R: Radio> CommandTransport<R> {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of commands waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, CorrelationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `command` on `write` and wait for its reply on `notify`.
    #[instrument(
        skip(self, payload, options),
        fields(code = format!("0x{:02X}", command), len = payload.len())
    )]
    pub async fn invoke(
        &self,
        write: Uuid,
        notify: Uuid,
        command: u8,
        payload: &[u8],
        options: InvokeOptions,
    ) -> Result<CommandResponse, ProvisionError> {
        if !self.is_connected() {
            return Err(ProvisionError::Disconnected);
        }
        let key = CorrelationKey::new(notify, command);
        let chunks = frame::encode_chunks(command, payload, self.config.max_write_len)?;
        let deadline = Instant::now() + options.timeout;

        let registration = if options.expects_response {
            let (tx, rx) = oneshot::channel();
            let id = self
                .table()
                .register(PendingCommand::new(key, options.fragmented, deadline, tx))?;
            Some((Registration::new(&self.table, key, id), rx))
        } else {
            if self.table().contains(&key) {
                return Err(ProvisionError::InProgress { command });
            }
            None
        };
        let timed_out = || {
            let timeout_ms = options.timeout.as_millis() as u64;
            warn!(timeout_ms, "Command timed out");
            ProvisionError::Timeout { command, timeout_ms }
        };

        // The deadline covers the writes as well as the reply.
        match timeout_at(deadline, self.write_chunks(write, &chunks)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(timed_out()),
        }

        let Some((_registration, rx)) = registration else {
            sleep(self.config.no_response_delay).await;
            return Ok(CommandResponse::ok(Vec::new()));
        };

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(ProvisionError::Disconnected),
            Err(_) => Err(timed_out()),
        }
    }

    async fn write_chunks(&self, write: Uuid, chunks: &[Vec<u8>]) -> Result<(), ProvisionError> {
        for chunk in chunks {
            trace!(chunk = %frame::to_hex(chunk), "TX");
            self.radio
                .write_characteristic(&self.channel, self.service, write, chunk)
                .await?;
        }
        Ok(())
    }

    /// Fail every outstanding command and stop listening.
    pub fn shutdown(&self) {
        self.pump.abort();
        self.connected.store(false, Ordering::SeqCst);
        self.table().fail_all(|| ProvisionError::Disconnected);
    }
}

impl<R: Radio> Drop for CommandTransport<R> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Removes a registration from the table on every exit of `invoke`,
/// including cancellation.
struct Registration<'a> {
    table: &'a Mutex<CorrelationTable>,
    key: CorrelationKey,
    id: u64,
}

impl<'a> Registration<'a> {
    fn new(table: &'a Mutex<CorrelationTable>, key: CorrelationKey, id: u64) -> Self {
        Self { table, key, id }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        // Already gone when the reply completed it.
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key, self.id);
    }
}

async fn pump(
    mut events: broadcast::Receiver<RadioEvent>,
    channel: ChannelId,
    exec_marker: u8,
    table: Arc<Mutex<CorrelationTable>>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Ok(RadioEvent::ValueChanged {
                channel: from,
                characteristic,
                value,
            }) if from == channel => {
                trace!(value = %frame::to_hex(&value), "RX");
                table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dispatch(characteristic, &value, exec_marker, Instant::now());
            }
            Ok(RadioEvent::ConnectionChanged {
                channel: from,
                connected: up,
            }) if from == channel => {
                connected.store(up, Ordering::SeqCst);
                if !up {
                    debug!(channel = %channel, "Link lost, failing pending commands");
                    table
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .fail_all(|| ProvisionError::Disconnected);
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Radio event receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
