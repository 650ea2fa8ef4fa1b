//! Homie device lifecycle events.

use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HomieEventType {
    StandaloneMode = 1,
    ConfigurationMode,
    NormalMode,
    OtaStarted,
    OtaSuccessful,
    OtaFailed,
    AboutToReset,
    WifiConnected,
    WifiDisconnected,
    MqttConnected,
    MqttDisconnected,
    MqttPacketAcknowledged,
    ReadyToSleep,
}

impl HomieEventType {
    const ALL: [Self; 13] = [
        Self::StandaloneMode,
        Self::ConfigurationMode,
        Self::NormalMode,
        Self::OtaStarted,
        Self::OtaSuccessful,
        Self::OtaFailed,
        Self::AboutToReset,
        Self::WifiConnected,
        Self::WifiDisconnected,
        Self::MqttConnected,
        Self::MqttDisconnected,
        Self::MqttPacketAcknowledged,
        Self::ReadyToSleep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StandaloneMode => "STANDALONE_MODE",
            Self::ConfigurationMode => "CONFIGURATION_MODE",
            Self::NormalMode => "NORMAL_MODE",
            Self::OtaStarted => "OTA_STARTED",
            Self::OtaSuccessful => "OTA_SUCCESSFUL",
            Self::OtaFailed => "OTA_FAILED",
            Self::AboutToReset => "ABOUT_TO_RESET",
            Self::WifiConnected => "WIFI_CONNECTED",
            Self::WifiDisconnected => "WIFI_DISCONNECTED",
            Self::MqttConnected => "MQTT_CONNECTED",
            Self::MqttDisconnected => "MQTT_DISCONNECTED",
            Self::MqttPacketAcknowledged => "MQTT_PACKET_ACKNOWLEDGED",
            Self::ReadyToSleep => "READY_TO_SLEEP",
        }
    }
}

impl TryFrom<u8> for HomieEventType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u8 == code)
            .ok_or(code)
    }
}

/// Station disconnect reasons as reported by the ESP WiFi driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiDisconnectReason {
    Unspecified,
    AuthExpire,
    AuthLeave,
    AssocExpire,
    AssocTooMany,
    NotAuthed,
    NotAssoced,
    AssocLeave,
    AssocNotAuthed,
    MicFailure,
    FourWayHandshakeTimeout,
    GroupKeyUpdateTimeout,
    BeaconTimeout,
    NoApFound,
    AuthFail,
    AssocFail,
    HandshakeTimeout,
    Other(u8),
}

impl WifiDisconnectReason {
    /// Maps a driver reason code. Zero means no reason was recorded.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 | 1 => Self::Unspecified,
            2 => Self::AuthExpire,
            3 => Self::AuthLeave,
            4 => Self::AssocExpire,
            5 => Self::AssocTooMany,
            6 => Self::NotAuthed,
            7 => Self::NotAssoced,
            8 => Self::AssocLeave,
            9 => Self::AssocNotAuthed,
            14 => Self::MicFailure,
            15 => Self::FourWayHandshakeTimeout,
            16 => Self::GroupKeyUpdateTimeout,
            200 => Self::BeaconTimeout,
            201 => Self::NoApFound,
            202 => Self::AuthFail,
            203 => Self::AssocFail,
            204 => Self::HandshakeTimeout,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Unspecified => 1,
            Self::AuthExpire => 2,
            Self::AuthLeave => 3,
            Self::AssocExpire => 4,
            Self::AssocTooMany => 5,
            Self::NotAuthed => 6,
            Self::NotAssoced => 7,
            Self::AssocLeave => 8,
            Self::AssocNotAuthed => 9,
            Self::MicFailure => 14,
            Self::FourWayHandshakeTimeout => 15,
            Self::GroupKeyUpdateTimeout => 16,
            Self::BeaconTimeout => 200,
            Self::NoApFound => 201,
            Self::AuthFail => 202,
            Self::AssocFail => 203,
            Self::HandshakeTimeout => 204,
            Self::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttDisconnectReason {
    TcpDisconnected,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    MalformedCredentials,
    NotAuthorized,
    NotEnoughSpace,
    TlsBadFingerprint,
}

impl MqttDisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TcpDisconnected => "TCP_DISCONNECTED",
            Self::UnacceptableProtocolVersion => "MQTT_UNACCEPTABLE_PROTOCOL_VERSION",
            Self::IdentifierRejected => "MQTT_IDENTIFIER_REJECTED",
            Self::ServerUnavailable => "MQTT_SERVER_UNAVAILABLE",
            Self::MalformedCredentials => "MQTT_MALFORMED_CREDENTIALS",
            Self::NotAuthorized => "MQTT_NOT_AUTHORIZED",
            Self::NotEnoughSpace => "NOT_ENOUGH_SPACE",
            Self::TlsBadFingerprint => "TLS_BAD_FINGERPRINT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomieEvent {
    StandaloneMode,
    ConfigurationMode,
    NormalMode,
    OtaStarted,
    OtaSuccessful,
    OtaFailed,
    AboutToReset,
    WifiConnected {
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
    },
    WifiDisconnected {
        reason: WifiDisconnectReason,
    },
    MqttConnected,
    MqttDisconnected {
        reason: MqttDisconnectReason,
    },
    MqttPacketAcknowledged {
        packet_id: u16,
    },
    ReadyToSleep,
}

impl HomieEvent {
    pub fn kind(&self) -> HomieEventType {
        match self {
            Self::StandaloneMode => HomieEventType::StandaloneMode,
            Self::ConfigurationMode => HomieEventType::ConfigurationMode,
            Self::NormalMode => HomieEventType::NormalMode,
            Self::OtaStarted => HomieEventType::OtaStarted,
            Self::OtaSuccessful => HomieEventType::OtaSuccessful,
            Self::OtaFailed => HomieEventType::OtaFailed,
            Self::AboutToReset => HomieEventType::AboutToReset,
            Self::WifiConnected { .. } => HomieEventType::WifiConnected,
            Self::WifiDisconnected { .. } => HomieEventType::WifiDisconnected,
            Self::MqttConnected => HomieEventType::MqttConnected,
            Self::MqttDisconnected { .. } => HomieEventType::MqttDisconnected,
            Self::MqttPacketAcknowledged { .. } => HomieEventType::MqttPacketAcknowledged,
            Self::ReadyToSleep => HomieEventType::ReadyToSleep,
        }
    }

    /// Value for the device's `$state` attribute, if the event changes it.
    pub fn device_state(&self) -> Option<&'static str> {
        match self {
            Self::NormalMode | Self::WifiConnected { .. } => Some("init"),
            Self::MqttConnected => Some("ready"),
            Self::WifiDisconnected { .. }
            | Self::MqttDisconnected { .. }
            | Self::AboutToReset => Some("disconnected"),
            Self::ReadyToSleep => Some("sleeping"),
            Self::OtaFailed => Some("alert"),
            _ => None,
        }
    }
}

impl core::fmt::Display for HomieEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.kind().as_str())?;
        match self {
            Self::WifiConnected { ip, mask, gateway } => {
                write!(f, " ip={ip} mask={mask} gateway={gateway}")
            }
            Self::WifiDisconnected { reason } => write!(f, " reason={}", reason.code()),
            Self::MqttDisconnected { reason } => write!(f, " reason={}", reason.as_str()),
            Self::MqttPacketAcknowledged { packet_id } => write!(f, " packet={packet_id}"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn discriminants_run_from_one_in_order() {
        assert_eq!(HomieEventType::StandaloneMode as u8, 1);
        assert_eq!(HomieEventType::WifiConnected as u8, 8);
        assert_eq!(HomieEventType::ReadyToSleep as u8, 13);
        assert_eq!(
            HomieEventType::try_from(12),
            Ok(HomieEventType::MqttPacketAcknowledged)
        );
        assert_eq!(HomieEventType::try_from(0), Err(0));
        assert_eq!(HomieEventType::try_from(14), Err(14));
    }

    #[test]
    fn variants_carry_only_their_payload() {
        let connected = HomieEvent::WifiConnected {
            ip: Ipv4Addr::new(192, 168, 1, 42),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        };
        let acked = HomieEvent::MqttPacketAcknowledged { packet_id: 7 };

        assert_eq!(connected.kind(), HomieEventType::WifiConnected);
        assert_eq!(
            connected.to_string(),
            "WIFI_CONNECTED ip=192.168.1.42 mask=255.255.255.0 gateway=192.168.1.1"
        );
        assert_eq!(acked.to_string(), "MQTT_PACKET_ACKNOWLEDGED packet=7");
        assert_eq!(acked.device_state(), None);
    }

    #[test]
    fn unknown_wifi_reason_is_preserved() {
        assert_eq!(
            WifiDisconnectReason::from_code(201),
            WifiDisconnectReason::NoApFound
        );
        assert_eq!(
            WifiDisconnectReason::from_code(77),
            WifiDisconnectReason::Other(77)
        );
        assert_eq!(WifiDisconnectReason::from_code(77).code(), 77);
    }

    #[test]
    fn missing_wifi_reason_is_unspecified() {
        assert_eq!(
            WifiDisconnectReason::from_code(0),
            WifiDisconnectReason::Unspecified
        );
        assert_eq!(
            HomieEvent::WifiDisconnected {
                reason: WifiDisconnectReason::from_code(202)
            }
            .to_string(),
            "WIFI_DISCONNECTED reason=202"
        );
    }

    #[test]
    fn lifecycle_events_drive_device_state() {
        assert_eq!(HomieEvent::MqttConnected.device_state(), Some("ready"));
        assert_eq!(
            HomieEvent::MqttDisconnected {
                reason: MqttDisconnectReason::TcpDisconnected
            }
            .device_state(),
            Some("disconnected")
        );
        assert_eq!(HomieEvent::ReadyToSleep.device_state(), Some("sleeping"));
        assert_eq!(HomieEvent::OtaStarted.device_state(), None);
    }
}
