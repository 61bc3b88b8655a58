//! Mock radio for testing and simulation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    AdapterState, ChannelId, CharacteristicInfo, DiscoveryOptions, Radio, RadioError,
    RadioEvent, RawAdvertisement,
};
use crate::advertisement::{MacAddress, encode_service_data};
use crate::payload::{WiFiItem, encode_wifi_list};
use crate::protocol::constants::*;
use crate::protocol::frame::{encode_exec_result, encode_fragments};
use crate::protocol::{CommandSet, frame};

const EVENT_CAPACITY: usize = 256;

/// One captured characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub channel: ChannelId,
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
}

/// Scripted reply to one command.
#[derive(Debug, Clone)]
struct Reply {
    notify: Uuid,
    frames: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct MockState {
    available: bool,
    discovering: bool,
    powered: bool,
    connect_error: Option<RadioError>,
    /// Writes never complete while set.
    stall_writes: bool,
    advertisements: Vec<RawAdvertisement>,
    connected: HashSet<ChannelId>,
    services: Vec<Uuid>,
    characteristics: Vec<CharacteristicInfo>,
    /// One-shot replies, consumed in order.
    replies: HashMap<(Uuid, u8), VecDeque<Reply>>,
    /// Replies used whenever no one-shot reply is queued.
    standing_replies: HashMap<(Uuid, u8), Reply>,
    partial_frames: HashMap<Uuid, Vec<u8>>,
    writes: Vec<WriteRecord>,
    frames: Vec<(Uuid, Vec<u8>)>,
    subscriptions: Vec<Uuid>,
    keep_awake_log: Vec<bool>,
    discovery_starts: usize,
    discovery_stops: usize,
    max_write_len: usize,
}

/// Mock radio with scripted advertisements and replies.
pub struct MockRadio {
    state: Mutex<MockState>,
    events: broadcast::Sender<RadioEvent>,
}

impl MockRadio {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(MockState {
                available: true,
                discovering: false,
                powered: false,
                connect_error: None,
                stall_writes: false,
                advertisements: Vec::new(),
                connected: HashSet::new(),
                services: vec![DEVICE_SERVICE_UUID],
                characteristics: vec![
                    CharacteristicInfo { uuid: BASE_WRITE_UUID, notify: false, write: true },
                    CharacteristicInfo { uuid: BASE_NOTIFY_UUID, notify: true, write: false },
                    CharacteristicInfo { uuid: DEVICE_WRITE_UUID, notify: false, write: true },
                    CharacteristicInfo { uuid: DEVICE_NOTIFY_UUID, notify: true, write: false },
                ],
                replies: HashMap::new(),
                standing_replies: HashMap::new(),
                partial_frames: HashMap::new(),
                writes: Vec::new(),
                frames: Vec::new(),
                subscriptions: Vec::new(),
                keep_awake_log: Vec::new(),
                discovery_starts: 0,
                discovery_stops: 0,
                max_write_len: MAX_WRITE_LEN,
            }),
            events,
        }
    }

    /// A gateway that advertises as an unbound Sparrow and accepts every
    /// command of `commands`.
    pub fn simulated_gateway(commands: CommandSet) -> Self {
        let radio = Self::new();
        let mac = MacAddress::new([0x50, 0xEC, 0x50, 0x87, 0x96, 0xA2]);
        radio.add_advertisement(RawAdvertisement {
            channel: Some(ChannelId::new("sim-0")),
            name: Some("Qingping Gateway".into()),
            local_name: None,
            rssi: -52,
            connectable: true,
            service_data: HashMap::from([(
                ADVERTISEMENT_SERVICE_UUID,
                encode_service_data(0x00, PRODUCT_GATEWAY_SPARROW, &mac, Some(87)),
            )]),
        });

        let ok = |code| vec![encode_exec_result(commands.exec_result, code, STATUS_OK, &[])];
        for code in [
            commands.set_token,
            commands.verify_token,
            commands.set_mqtt_part1,
            commands.set_mqtt_part2,
        ] {
            radio.respond_always(BASE_WRITE_UUID, BASE_NOTIFY_UUID, code, ok(code));
        }
        radio.respond_always(
            DEVICE_WRITE_UUID,
            DEVICE_NOTIFY_UUID,
            commands.set_wifi,
            ok(commands.set_wifi),
        );

        let networks = [
            WiFiItem::new("HomeNet", true, -48),
            WiFiItem::new("Guest", false, -67),
            WiFiItem::new("Workshop 5G", true, -80),
        ];
        let listing = encode_wifi_list(&networks).unwrap_or_default();
        let frames = encode_fragments(commands.get_wifi_list, &listing, 14).unwrap_or_default();
        radio.respond_always(DEVICE_WRITE_UUID, DEVICE_NOTIFY_UUID, commands.get_wifi_list, frames);
        radio
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RadioEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Advertisement reported when discovery starts.
    pub fn add_advertisement(&self, adv: RawAdvertisement) {
        self.state().advertisements.push(adv);
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Pretend another client already started discovery.
    pub fn set_discovering(&self, discovering: bool) {
        self.state().discovering = discovering;
    }

    pub fn fail_connect(&self, error: Option<RadioError>) {
        self.state().connect_error = error;
    }

    /// Make every later write hang, as a wedged host stack does.
    pub fn stall_writes(&self, stall: bool) {
        self.state().stall_writes = stall;
    }

    pub fn set_services(&self, services: Vec<Uuid>) {
        self.state().services = services;
    }

    pub fn set_characteristics(&self, characteristics: Vec<CharacteristicInfo>) {
        self.state().characteristics = characteristics;
    }

    /// Queue a one-shot reply: when `command` is written to `write`, the
    /// `frames` are notified on `notify`.
    pub fn respond(&self, write: Uuid, notify: Uuid, command: u8, frames: Vec<Vec<u8>>) {
        self.state()
            .replies
            .entry((write, command))
            .or_default()
            .push_back(Reply { notify, frames });
    }

    /// Reply used every time `command` is written and no one-shot reply is queued.
    pub fn respond_always(&self, write: Uuid, notify: Uuid, command: u8, frames: Vec<Vec<u8>>) {
        self.state()
            .standing_replies
            .insert((write, command), Reply { notify, frames });
    }

    /// Report a batch of advertisements now.
    pub fn push_advertisements(&self, batch: Vec<RawAdvertisement>) {
        self.emit(RadioEvent::DevicesFound(batch));
    }

    /// Inject a notification.
    pub fn notify(&self, channel: &ChannelId, characteristic: Uuid, value: Vec<u8>) {
        self.emit(RadioEvent::ValueChanged {
            channel: channel.clone(),
            characteristic,
            value,
        });
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, channel: &ChannelId) {
        self.state().connected.remove(channel);
        self.emit(RadioEvent::ConnectionChanged {
            channel: channel.clone(),
            connected: false,
        });
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Complete frames written to `characteristic`, reassembled from chunks.
    pub fn frames_written(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.state()
            .frames
            .iter()
            .filter(|(c, _)| *c == characteristic)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Command codes written to `characteristic`, in order.
    pub fn commands_written(&self, characteristic: Uuid) -> Vec<u8> {
        self.frames_written(characteristic)
            .iter()
            .filter_map(|f| f.get(1).copied())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.state().subscriptions.clone()
    }

    pub fn keep_awake_log(&self) -> Vec<bool> {
        self.state().keep_awake_log.clone()
    }

    pub fn discovery_starts(&self) -> usize {
        self.state().discovery_starts
    }

    pub fn discovery_stops(&self) -> usize {
        self.state().discovery_stops
    }

    pub fn is_discovering(&self) -> bool {
        self.state().discovering
    }

    pub fn is_powered(&self) -> bool {
        self.state().powered
    }

    pub fn is_connected(&self, channel: &ChannelId) -> bool {
        self.state().connected.contains(channel)
    }

    /// Receivers still attached to the event stream.
    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Collect chunks into frames and fire the scripted reply of each
    /// complete frame.
    fn absorb_chunk(&self, channel: &ChannelId, characteristic: Uuid, bytes: &[u8]) {
        let mut replies = Vec::new();
        {
            let mut state = self.state();
            let buf = state.partial_frames.entry(characteristic).or_default();
            buf.extend_from_slice(bytes);

            let mut complete = Vec::new();
            while let Some(&len) = buf.first() {
                let frame_len = len as usize + 1;
                if buf.len() < frame_len {
                    break;
                }
                complete.push(buf.drain(..frame_len).collect::<Vec<u8>>());
            }

            for frame in complete {
                if let Some(&command) = frame.get(1) {
                    let key = (characteristic, command);
                    let reply = state
                        .replies
                        .get_mut(&key)
                        .and_then(VecDeque::pop_front)
                        .or_else(|| state.standing_replies.get(&key).cloned());
                    if let Some(reply) = reply {
                        replies.push(reply);
                    }
                }
                state.frames.push((characteristic, frame));
            }
        }

        for reply in replies {
            for value in reply.frames {
                debug!(value = %frame::to_hex(&value), "Mock reply");
                self.notify(channel, reply.notify, value);
            }
        }
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Radio for MockRadio {
    async fn power_on(&self) -> Result<(), RadioError> {
        let mut state = self.state();
        if !state.available {
            return Err(RadioError::AdapterUnavailable("adapter disabled".into()));
        }
        state.powered = true;
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterState, RadioError> {
        let state = self.state();
        Ok(AdapterState {
            available: state.available,
            discovering: state.discovering,
        })
    }

    async fn start_discovery(&self, _options: &DiscoveryOptions) -> Result<(), RadioError> {
        let batch = {
            let mut state = self.state();
            if !state.available {
                return Err(RadioError::AdapterUnavailable("adapter disabled".into()));
            }
            state.discovering = true;
            state.discovery_starts += 1;
            state.advertisements.clone()
        };
        if !batch.is_empty() {
            self.push_advertisements(batch);
        }
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        let mut state = self.state();
        state.discovering = false;
        state.discovery_stops += 1;
        Ok(())
    }

    async fn connect(&self, channel: &ChannelId, _timeout: Duration) -> Result<(), RadioError> {
        {
            let mut state = self.state();
            if let Some(err) = state.connect_error.clone() {
                return Err(err);
            }
            state.connected.insert(channel.clone());
        }
        self.emit(RadioEvent::ConnectionChanged {
            channel: channel.clone(),
            connected: true,
        });
        Ok(())
    }

    async fn disconnect(&self, channel: &ChannelId) -> Result<(), RadioError> {
        let was_connected = self.state().connected.remove(channel);
        if was_connected {
            self.emit(RadioEvent::ConnectionChanged {
                channel: channel.clone(),
                connected: false,
            });
        }
        Ok(())
    }

    async fn list_services(&self, channel: &ChannelId) -> Result<Vec<Uuid>, RadioError> {
        let state = self.state();
        if !state.connected.contains(channel) {
            return Err(RadioError::NotConnected);
        }
        Ok(state.services.clone())
    }

    async fn list_characteristics(
        &self,
        channel: &ChannelId,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, RadioError> {
        let state = self.state();
        if !state.connected.contains(channel) {
            return Err(RadioError::NotConnected);
        }
        if !state.services.contains(&service) {
            return Err(RadioError::ServiceNotFound(service));
        }
        Ok(state.characteristics.clone())
    }

    async fn subscribe_notify(
        &self,
        channel: &ChannelId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        let mut state = self.state();
        if !state.connected.contains(channel) {
            return Err(RadioError::NotConnected);
        }
        if !state.characteristics.iter().any(|c| c.uuid == characteristic) {
            return Err(RadioError::CharacteristicNotFound(characteristic));
        }
        state.subscriptions.push(characteristic);
        Ok(())
    }

    async fn write_characteristic(
        &self,
        channel: &ChannelId,
        _service: Uuid,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> Result<(), RadioError> {
        let stalled = {
            let mut state = self.state();
            if !state.connected.contains(channel) {
                return Err(RadioError::NotConnected);
            }
            if bytes.len() > state.max_write_len {
                return Err(RadioError::WriteFailed(format!(
                    "{} bytes exceeds the {}-byte limit",
                    bytes.len(),
                    state.max_write_len
                )));
            }
            if !state.stall_writes {
                state.writes.push(WriteRecord {
                    channel: channel.clone(),
                    characteristic,
                    bytes: bytes.to_vec(),
                });
            }
            state.stall_writes
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        self.absorb_chunk(channel, characteristic, bytes);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    fn set_keep_awake(&self, on: bool) {
        self.state().keep_awake_log.push(on);
    }

    fn max_write_len(&self) -> usize {
        self.state().max_write_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelId {
        ChannelId::new("mock-1")
    }

    #[tokio::test]
    async fn test_mock_write_capture_and_reply() {
        let mock = MockRadio::new();
        let mut events = mock.events();
        mock.connect(&channel(), Duration::from_secs(1)).await.unwrap();
        mock.respond(
            BASE_WRITE_UUID,
            BASE_NOTIFY_UUID,
            0x01,
            vec![encode_exec_result(0xFF, 0x01, STATUS_OK, &[])],
        );

        // 18-byte payload -> 20-byte frame in one chunk plus nothing else.
        let frame = frame::encode_command(0x01, &[0u8; 18]).unwrap();
        mock.write_characteristic(&channel(), DEVICE_SERVICE_UUID, BASE_WRITE_UUID, &frame)
            .await
            .unwrap();

        assert_eq!(mock.writes().len(), 1);
        assert_eq!(mock.commands_written(BASE_WRITE_UUID), vec![0x01]);

        assert!(matches!(
            events.recv().await.unwrap(),
            RadioEvent::ConnectionChanged { connected: true, .. }
        ));
        match events.recv().await.unwrap() {
            RadioEvent::ValueChanged { characteristic, value, .. } => {
                assert_eq!(characteristic, BASE_NOTIFY_UUID);
                assert_eq!(value, vec![0x03, 0xFF, 0x01, 0x00]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mock_reassembles_chunks() {
        let mock = MockRadio::new();
        mock.connect(&channel(), Duration::from_secs(1)).await.unwrap();
        let chunks = frame::encode_chunks(0x17, &[7u8; 30], MAX_WRITE_LEN).unwrap();
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            mock.write_characteristic(&channel(), DEVICE_SERVICE_UUID, BASE_WRITE_UUID, chunk)
                .await
                .unwrap();
        }
        assert_eq!(mock.frames_written(BASE_WRITE_UUID), vec![chunks.concat()]);
    }

    #[tokio::test]
    async fn test_mock_rejects_oversized_chunk() {
        let mock = MockRadio::new();
        mock.connect(&channel(), Duration::from_secs(1)).await.unwrap();
        let err = mock
            .write_characteristic(&channel(), DEVICE_SERVICE_UUID, BASE_WRITE_UUID, &[0u8; 21])
            .await
            .unwrap_err();
        assert!(matches!(err, RadioError::WriteFailed(_)));
    }

    #[tokio::test]
    async fn test_mock_disconnect() {
        let mock = MockRadio::new();
        mock.connect(&channel(), Duration::from_secs(1)).await.unwrap();
        assert!(mock.is_connected(&channel()));

        mock.drop_link(&channel());
        assert!(!mock.is_connected(&channel()));
        assert!(
            mock.write_characteristic(&channel(), DEVICE_SERVICE_UUID, BASE_WRITE_UUID, b"x")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unavailable_adapter() {
        let mock = MockRadio::new();
        mock.set_available(false);
        assert!(matches!(
            mock.power_on().await,
            Err(RadioError::AdapterUnavailable(_))
        ));
        assert!(!mock.is_powered());

        mock.set_available(true);
        mock.power_on().await.unwrap();
        assert!(mock.is_powered());
    }
}
