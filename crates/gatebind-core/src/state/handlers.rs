//! Step handlers of the connect chain.
//!
//! Each handler performs one step against the radio or the command
//! transport. Event emission and state bookkeeping stay in the session.

use std::time::Duration;

use tracing::{debug, info};

use crate::advertisement::DeviceRecord;
use crate::error::ProvisionError;
use crate::radio::{Radio, RadioError};
use crate::session::{SessionConfig, SessionToken};
use crate::transport::{CommandTransport, InvokeOptions};

/// Resources a step handler works with.
pub struct HandlerContext<'a, R: Radio> {
    pub radio: &'a R,
    pub config: &'a SessionConfig,
    pub device: &'a DeviceRecord,
}

/// Which half of the token handshake to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStep {
    Set,
    Verify,
}

impl TokenStep {
    fn command(&self, config: &SessionConfig) -> u8 {
        match self {
            TokenStep::Set => config.commands.set_token,
            TokenStep::Verify => config.commands.verify_token,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            TokenStep::Set => "set",
            TokenStep::Verify => "verify",
        }
    }
}

/// Open the link to the device.
pub async fn connect<R: Radio>(ctx: &HandlerContext<'_, R>, timeout: Duration) -> Result<(), ProvisionError> {
    info!(mac = %ctx.device.mac, channel = %ctx.device.channel, "Connecting");
    ctx.radio.connect(&ctx.device.channel, timeout).await?;
    Ok(())
}

/// Subscribe to every notify characteristic of the gateway service.
///
/// Fails when the service is missing or the base notify characteristic is
/// not among the subscribed ones.
pub async fn subscribe_notifications<R: Radio>(ctx: &HandlerContext<'_, R>) -> Result<usize, ProvisionError> {
    let profile = &ctx.config.profile;
    let channel = &ctx.device.channel;

    let services = ctx.radio.list_services(channel).await?;
    debug!(services = ?services, "Services");
    if !services.contains(&profile.service) {
        return Err(RadioError::ServiceNotFound(profile.service).into());
    }

    let characteristics = ctx.radio.list_characteristics(channel, profile.service).await?;
    let mut subscribed = Vec::new();
    for c in characteristics.iter().filter(|c| c.notify) {
        ctx.radio
            .subscribe_notify(channel, profile.service, c.uuid)
            .await?;
        subscribed.push(c.uuid);
    }
    if !subscribed.contains(&profile.base_notify) {
        return Err(RadioError::CharacteristicNotFound(profile.base_notify).into());
    }
    debug!(count = subscribed.len(), "Subscribed to notifications");
    Ok(subscribed.len())
}

/// Send the token under the set or verify command.
///
/// A failure status from the device is a rejection.
pub async fn exchange_token<R: Radio>(
    transport: &CommandTransport<R>,
    config: &SessionConfig,
    step: TokenStep,
    token: &SessionToken,
) -> Result<(), ProvisionError> {
    let profile = &config.profile;
    let response = transport
        .invoke(
            profile.base_write,
            profile.base_notify,
            step.command(config),
            token.as_bytes(),
            InvokeOptions::new(config.command_timeout()),
        )
        .await?;
    if !response.status {
        return Err(ProvisionError::TokenRejected { step: step.name() });
    }
    debug!(step = step.name(), "Token accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::MacAddress;
    use crate::protocol::constants::*;
    use crate::radio::{ChannelId, CharacteristicInfo, MockRadio};

    fn device() -> DeviceRecord {
        DeviceRecord {
            channel: ChannelId::new("gw-1"),
            name: "Gateway".into(),
            mac: MacAddress::new([0x50, 0xEC, 0x50, 0x87, 0x96, 0xA2]),
            product_id: PRODUCT_GATEWAY_SPARROW,
            is_bound: false,
            rssi: -55,
            battery_percent: 100,
            raw_advertisement: Vec::new(),
        }
    }

    async fn connected(radio: &MockRadio, device: &DeviceRecord) {
        radio
            .connect(&device.channel, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_every_notify_characteristic() {
        let radio = MockRadio::new();
        let device = device();
        let config = SessionConfig::default();
        connected(&radio, &device).await;
        let ctx = HandlerContext { radio: &radio, config: &config, device: &device };

        assert_eq!(subscribe_notifications(&ctx).await.unwrap(), 2);
        assert_eq!(radio.subscriptions(), vec![BASE_NOTIFY_UUID, DEVICE_NOTIFY_UUID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_missing_service() {
        let radio = MockRadio::new();
        radio.set_services(Vec::new());
        let device = device();
        let config = SessionConfig::default();
        connected(&radio, &device).await;
        let ctx = HandlerContext { radio: &radio, config: &config, device: &device };

        let err = subscribe_notifications(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Radio(RadioError::ServiceNotFound(uuid)) if uuid == DEVICE_SERVICE_UUID
        ));
        assert!(radio.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_missing_base_notify() {
        let radio = MockRadio::new();
        radio.set_characteristics(vec![
            CharacteristicInfo { uuid: BASE_WRITE_UUID, notify: false, write: true },
            CharacteristicInfo { uuid: DEVICE_NOTIFY_UUID, notify: true, write: false },
        ]);
        let device = device();
        let config = SessionConfig::default();
        connected(&radio, &device).await;
        let ctx = HandlerContext { radio: &radio, config: &config, device: &device };

        let err = subscribe_notifications(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Radio(RadioError::CharacteristicNotFound(uuid)) if uuid == BASE_NOTIFY_UUID
        ));
        // The other notify characteristic was still subscribed.
        assert_eq!(radio.subscriptions(), vec![DEVICE_NOTIFY_UUID]);
    }
}
