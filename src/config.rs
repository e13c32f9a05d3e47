//! Configuration options consumed by the server and the client.
//!
//! [Config] deserializes from JSON with camel case keys and durations given in
//! milliseconds:
//!
//! ```json
//! {
//!     "observableAckTimeout": 5000,
//!     "heartbeatInterval": 1000,
//!     "callTimeout": 10000,
//!     "streamIdleTimeout": 3000
//! }
//! ```
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Maximum wait for the client's acknowledgement of a stream element.
    #[serde(with = "millis")]
    pub observable_ack_timeout: Duration,
    /// Period between heartbeats of an active stream.
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Maximum wait for the response to a function call.
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    /// Fail a subscription that receives neither elements nor heartbeats for
    /// this long.
    #[serde(default, with = "optional_millis", skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration")]
    Parse(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Configuration option \"{option}\" must not be zero")]
    ZeroDuration { option: &'static str },
}

impl Config {
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let config = serde_json::from_slice::<Self>(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("observableAckTimeout", Some(self.observable_ack_timeout)),
            ("heartbeatInterval", Some(self.heartbeat_interval)),
            ("callTimeout", Some(self.call_timeout)),
            ("streamIdleTimeout", self.stream_idle_timeout),
        ];
        for (option, duration) in durations.iter() {
            if *duration == Some(Duration::from_millis(0)) {
                return Err(ConfigError::ZeroDuration { option: *option });
            }
        }
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            ack_timeout: self.observable_ack_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            call_timeout: self.call_timeout,
            stream_idle_timeout: self.stream_idle_timeout,
        }
    }
}

/// Options of a server side streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub ack_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Options of the client correlation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub call_timeout: Duration,
    pub stream_idle_timeout: Option<Duration>,
}

mod millis {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}
