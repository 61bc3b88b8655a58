//! Feature operations on a ready link.
//!
//! Each operation reports its own step events like the connect chain.
//! `Ok(false)` means the gateway answered with a failure status; transport
//! failures come back as errors.

use tracing::{info, instrument, warn};

use crate::error::ProvisionError;
use crate::events::{ConnectStep, ProvisionObserver, StepStatus};
use crate::payload::{self, MqttConfig, WiFiItem};
use crate::radio::Radio;
use crate::session::ProvisionSession;
use crate::transport::{CommandResponse, InvokeOptions};

impl<R: Radio + 'static, O: ProvisionObserver + 'static> ProvisionSession<R, O> {
    /// Report the outcome of a feature step.
    fn finish_step(&self, step: ConnectStep, result: &Result<bool, ProvisionError>) {
        let status = match result {
            Ok(true) => StepStatus::Success,
            Ok(false) | Err(_) => StepStatus::Failed,
        };
        if let Err(e) = result {
            warn!(step = %step, error = %e, "Feature step failed");
        }
        self.emit_step(step, status);
    }

    async fn invoke_device(
        &self,
        command: u8,
        payload: &[u8],
        options: InvokeOptions,
    ) -> Result<CommandResponse, ProvisionError> {
        let profile = &self.config.profile;
        self.transport()?
            .invoke(profile.device_write, profile.device_notify, command, payload, options)
            .await
    }

    async fn invoke_base(
        &self,
        command: u8,
        payload: &[u8],
        options: InvokeOptions,
    ) -> Result<CommandResponse, ProvisionError> {
        let profile = &self.config.profile;
        self.transport()?
            .invoke(profile.base_write, profile.base_notify, command, payload, options)
            .await
    }

    /// Networks the gateway can see, in the order it reports them.
    ///
    /// Any failure yields an empty list.
    #[instrument(skip(self))]
    pub async fn list_wifi_networks(&self) -> Vec<WiFiItem> {
        self.emit_step(ConnectStep::GetWifiList, StepStatus::InProgress);
        let options = InvokeOptions::new(self.config.wifi_list_timeout()).fragmented();
        let result = self
            .invoke_device(self.config.commands.get_wifi_list, &[], options)
            .await;

        let networks = match &result {
            Ok(response) if response.status => payload::decode_wifi_list(&response.data),
            _ => Vec::new(),
        };
        self.finish_step(ConnectStep::GetWifiList, &result.map(|r| r.status));
        info!(count = networks.len(), "Wi-Fi networks");
        networks
    }

    /// Send Wi-Fi credentials. Pass an empty password for an open network.
    #[instrument(skip(self, password))]
    pub async fn set_wifi(&self, ssid: &str, password: &str) -> Result<bool, ProvisionError> {
        self.emit_step(ConnectStep::SetWifi, StepStatus::InProgress);
        let result = self.send_wifi(ssid, password).await;
        self.finish_step(ConnectStep::SetWifi, &result);
        result
    }

    async fn send_wifi(&self, ssid: &str, password: &str) -> Result<bool, ProvisionError> {
        let body = payload::encode_set_wifi(ssid, password)?;
        let options = InvokeOptions::new(self.config.set_wifi_timeout());
        let response = self
            .invoke_device(self.config.commands.set_wifi, &body, options)
            .await?;
        Ok(response.status)
    }

    /// Send the broker configuration as two sequential parts.
    ///
    /// Part 2 is only sent after part 1 succeeded. A failed part 2 leaves
    /// part 1 applied on the gateway.
    #[instrument(skip(self, config), fields(host = %config.host))]
    pub async fn set_mqtt(&self, config: &MqttConfig) -> Result<bool, ProvisionError> {
        self.emit_step(ConnectStep::SetMqtt, StepStatus::InProgress);
        let result = self.send_mqtt(config).await;
        self.finish_step(ConnectStep::SetMqtt, &result);
        result
    }

    async fn send_mqtt(&self, config: &MqttConfig) -> Result<bool, ProvisionError> {
        let part1 = config.encode_part1()?;
        let part2 = config.encode_part2()?;
        let options = InvokeOptions::new(self.config.mqtt_timeout());

        let first = self
            .invoke_base(self.config.commands.set_mqtt_part1, &part1, options)
            .await?;
        if !first.status {
            warn!("Gateway rejected MQTT part 1");
            return Ok(false);
        }
        let second = self
            .invoke_base(self.config.commands.set_mqtt_part2, &part2, options)
            .await?;
        Ok(second.status)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::advertisement::{MacAddress, encode_service_data};
    use crate::error::ErrorKind;
    use crate::events::RecordingObserver;
    use crate::protocol::CommandSet;
    use crate::protocol::constants::*;
    use crate::protocol::frame::{encode_exec_result, encode_fragments};
    use crate::radio::{ChannelId, MockRadio, RawAdvertisement};
    use crate::session::{ConnectOptions, SessionConfig};

    type Session = ProvisionSession<MockRadio, RecordingObserver>;

    async fn ready_session(radio: &Arc<MockRadio>) -> (Session, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::new());
        let mut session = ProvisionSession::with_observer(
            Arc::clone(radio),
            SessionConfig::default(),
            Arc::clone(&observer),
        );
        session
            .start_connect(ConnectOptions::product(PRODUCT_GATEWAY_SPARROW))
            .await
            .unwrap();
        (session, observer)
    }

    fn mqtt() -> MqttConfig {
        MqttConfig {
            host: "mqtt.local".into(),
            port: 1883,
            username: "user".into(),
            password: "secret".into(),
            client_id: "gw-1".into(),
            sub_topic: "gw/in".into(),
            pub_topic: "gw/out".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_wifi_from_simulated_gateway() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let (session, observer) = ready_session(&radio).await;

        let networks = session.list_wifi_networks().await;
        let ssids: Vec<_> = networks.iter().map(|n| n.ssid.as_str()).collect();
        assert_eq!(ssids, vec!["HomeNet", "Guest", "Workshop 5G"]);
        assert!(!networks[1].auth_required);
        assert_eq!(networks[2].rssi, -80);
        assert_eq!(
            observer.steps().last(),
            Some(&(ConnectStep::GetWifiList, StepStatus::Success))
        );
        assert_eq!(radio.commands_written(DEVICE_WRITE_UUID), vec![0x2F]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_wifi_timeout_is_empty() {
        let commands = CommandSet::default();
        let radio = Arc::new(MockRadio::simulated_gateway(commands));
        let (session, observer) = ready_session(&radio).await;

        // Only the first of two fragments arrives.
        let frames = encode_fragments(commands.get_wifi_list, &[3, b'a', b'b', b'c', 1, 0xC0], 3).unwrap();
        radio.respond(DEVICE_WRITE_UUID, DEVICE_NOTIFY_UUID, commands.get_wifi_list, vec![frames[0].clone()]);

        assert!(session.list_wifi_networks().await.is_empty());
        assert_eq!(
            observer.steps().last(),
            Some(&(ConnectStep::GetWifiList, StepStatus::Failed))
        );
        assert_eq!(session.transport().unwrap().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_wifi_payload_and_status() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let (session, _observer) = ready_session(&radio).await;

        assert!(session.set_wifi("HomeNet", "hunter22").await.unwrap());
        let frame = radio.frames_written(DEVICE_WRITE_UUID).pop().unwrap();
        assert_eq!(frame[1], 0x09);
        assert_eq!(&frame[2..], b"\"HomeNet\",\"hunter22\"");

        radio.respond(
            DEVICE_WRITE_UUID,
            DEVICE_NOTIFY_UUID,
            0x09,
            vec![encode_exec_result(0xFF, 0x09, 0x01, &[])],
        );
        assert!(!session.set_wifi("HomeNet", "wrong").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_wifi_rejects_bad_payload() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let (session, observer) = ready_session(&radio).await;

        let err = session.set_wifi("", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(radio.frames_written(DEVICE_WRITE_UUID).is_empty());
        assert_eq!(
            observer.steps().last(),
            Some(&(ConnectStep::SetWifi, StepStatus::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_mqtt_sends_both_parts() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let (session, observer) = ready_session(&radio).await;

        assert!(session.set_mqtt(&mqtt()).await.unwrap());
        let frames = radio.frames_written(BASE_WRITE_UUID);
        let mqtt_frames: Vec<_> = frames.iter().filter(|f| f[1] == 0x17 || f[1] == 0x18).collect();
        assert_eq!(mqtt_frames.len(), 2);
        assert_eq!(&mqtt_frames[0][2..], b"mqtt.local 1883 user secret");
        assert_eq!(&mqtt_frames[1][2..], b"gw-1 gw/in gw/out");
        assert_eq!(
            observer.steps().last(),
            Some(&(ConnectStep::SetMqtt, StepStatus::Success))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_mqtt_part2_timeout_keeps_part1() {
        let radio = Arc::new(MockRadio::new());
        radio.add_advertisement(RawAdvertisement {
            channel: Some(ChannelId::new("gw-2")),
            name: None,
            local_name: Some("Sparrow".into()),
            rssi: -60,
            connectable: true,
            service_data: HashMap::from([(
                ADVERTISEMENT_SERVICE_UUID,
                encode_service_data(0x00, PRODUCT_GATEWAY_SPARROW, &MacAddress::new([1, 2, 3, 4, 5, 6]), None),
            )]),
        });
        for code in [0x01, 0x02, 0x17] {
            radio.respond(
                BASE_WRITE_UUID,
                BASE_NOTIFY_UUID,
                code,
                vec![encode_exec_result(0xFF, code, STATUS_OK, &[])],
            );
        }
        let (session, observer) = ready_session(&radio).await;

        let err = session.set_mqtt(&mqtt()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { command: 0x18, timeout_ms: 30000 }));
        assert_eq!(
            radio.commands_written(BASE_WRITE_UUID),
            vec![0x01, 0x02, 0x17, 0x18]
        );
        assert_eq!(
            observer.steps().last(),
            Some(&(ConnectStep::SetMqtt, StepStatus::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_mqtt_part1_rejected_skips_part2() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let (session, _observer) = ready_session(&radio).await;
        radio.respond(
            BASE_WRITE_UUID,
            BASE_NOTIFY_UUID,
            0x17,
            vec![encode_exec_result(0xFF, 0x17, 0x02, &[])],
        );

        assert!(!session.set_mqtt(&mqtt()).await.unwrap());
        assert!(!radio.commands_written(BASE_WRITE_UUID).contains(&0x18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_need_a_link() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let session = ProvisionSession::new(Arc::clone(&radio), SessionConfig::default());

        assert!(session.list_wifi_networks().await.is_empty());
        let err = session.set_wifi("HomeNet", "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected);
        assert!(radio.writes().is_empty());
    }
}
