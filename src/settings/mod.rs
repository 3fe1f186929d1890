//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::message::{MessageCodec, DEFAULT_HEADER_WIDTH, DEFAULT_MAX_MESSAGE_SIZE};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub model: ModelSettings,
    #[validate]
    pub storage: StorageSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedavg").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Listener settings.
pub struct ApiSettings {
    /// The address to which the coordinator should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:5000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_API__BIND_ADDRESS=127.0.0.1:5000
    /// ```
    pub bind_address: SocketAddr,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_protocol"))]
/// Wire protocol settings. Participants must use the same values.
pub struct ProtocolSettings {
    /// The width of the frame header in bytes. Defaults to `10`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// header_width = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_PROTOCOL__HEADER_WIDTH=10
    /// ```
    #[serde(default = "default_header_width")]
    pub header_width: usize,

    /// The largest accepted message body in bytes. Its decimal representation must fit into
    /// `header_width` bytes. Defaults to 100 MiB.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// max_message_size = 104857600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_PROTOCOL__MAX_MESSAGE_SIZE=104857600
    /// ```
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_header_width() -> usize {
    DEFAULT_HEADER_WIDTH
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            header_width: DEFAULT_HEADER_WIDTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ProtocolSettings {
    /// Checks that every accepted message length can be written into a header.
    fn validate_protocol(&self) -> Result<(), ValidationError> {
        if self.header_width == 0 {
            return Err(ValidationError::new("header width must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(ValidationError::new("max message size must be positive"));
        }
        if self.max_message_size.to_string().len() > self.header_width {
            return Err(ValidationError::new(
                "max message size does not fit into the header",
            ));
        }
        Ok(())
    }

    /// The codec for these settings.
    pub fn codec(&self) -> MessageCodec {
        MessageCodec::new(self.header_width, self.max_message_size)
    }
}

/// A wrapper for validate derive.
fn validate_protocol(s: &ProtocolSettings) -> Result<(), ValidationError> {
    s.validate_protocol()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// What happens to a round when a client that has not reported yet goes away.
pub enum ClientLossPolicy {
    /// The round keeps waiting for the configured number of clients. It only completes if enough
    /// clients connect later on.
    Wait,
    /// The round waits for the clients that are still connected. This only applies once the
    /// configured number of clients has been connected at the same time.
    Shrink,
}

impl Default for ClientLossPolicy {
    fn default() -> Self {
        ClientLossPolicy::Wait
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// What happens when the partition sizes of a complete round sum up to zero.
pub enum EmptyRoundPolicy {
    /// Training stops with an error.
    Abort,
    /// The round is discarded and the current global model is sent again.
    Retry,
}

impl Default for EmptyRoundPolicy {
    fn default() -> Self {
        EmptyRoundPolicy::Abort
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round settings.
pub struct RoundSettings {
    /// The number of clients a round waits for. The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// clients = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_ROUND__CLIENTS=3
    /// ```
    #[validate(range(min = 1))]
    pub clients: usize,

    /// The number of rounds to train. The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// rounds = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_ROUND__ROUNDS=10
    /// ```
    #[validate(range(min = 1))]
    pub rounds: u64,

    /// Either `wait` (default) or `shrink`, see [`ClientLossPolicy`].
    #[serde(default)]
    pub on_client_loss: ClientLossPolicy,

    /// Either `abort` (default) or `retry`, see [`EmptyRoundPolicy`].
    #[serde(default)]
    pub on_empty_round: EmptyRoundPolicy,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Global model settings.
pub struct ModelSettings {
    /// The number of weights of the model. The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// length = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_MODEL__LENGTH=100
    /// ```
    #[validate(range(min = 1))]
    pub length: usize,

    /// A model file written by the coordinator, used as initial global model. Leave this out to
    /// start from a model of zeros.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// initial_path = "snapshots/weights_run-1_v10.bin"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_MODEL__INITIAL_PATH=snapshots/weights_run-1_v10.bin
    /// ```
    pub initial_path: Option<PathBuf>,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Snapshot storage settings.
pub struct StorageSettings {
    /// The directory the global model of every round is written to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// dir = "snapshots"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_STORAGE__DIR=snapshots
    /// ```
    pub dir: PathBuf,

    /// The identifier of the training run. It is part of the snapshot file names.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// run_id = "run-1"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_STORAGE__RUN_ID=run-1
    /// ```
    #[validate(length(min = 1))]
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDAVG_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
