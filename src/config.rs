//! Device configuration in three tiers.
//!
//! [`DeviceIdentity`] is captured once when the device is discovered.
//! [`OperationalParams`] are the user adjustable polling settings.
//! [`DeviceConfig`] is the explicit merge of the two that the runtime uses.
//! [`ConfigEntry`] is the persisted JSON form the host stores for us.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::session::DeviceRecognizer;
use crate::util::mask_address;

pub const DEFAULT_POLLING_INTERVAL_S: u64 = 20;
pub const DEFAULT_POLLING_TIMEOUT_S: u64 = 45;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const MAX_POLLING_INTERVAL_S: u64 = 24 * 60 * 60;
pub const MAX_POLLING_TIMEOUT_S: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
    pub dev_type: String,
    pub use_encryption: bool,
}

impl DeviceIdentity {
    /// Identify a freshly discovered device. Returns `None` for unsupported models.
    pub async fn discover(
        address: &str,
        name: &str,
        recognizer: &dyn DeviceRecognizer,
    ) -> anyhow::Result<Option<Self>> {
        let Some(recognition) = recognizer.recognize_device(address, name).await? else {
            debug!(address = %mask_address(address), device = name, "device not supported");
            return Ok(None);
        };

        debug!(
            address = %mask_address(address),
            dev_type = %recognition.device_type,
            encryption = recognition.requires_encryption,
            "device recognized"
        );

        Ok(Some(Self {
            address: address.to_string(),
            name: name.to_string(),
            dev_type: recognition.device_type,
            use_encryption: recognition.requires_encryption,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalParams {
    /// Seconds between scheduled reads
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Seconds before a read or write is abandoned
    #[serde(default = "default_polling_timeout")]
    pub polling_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_S
}

fn default_polling_timeout() -> u64 {
    DEFAULT_POLLING_TIMEOUT_S
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for OperationalParams {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL_S,
            polling_timeout: DEFAULT_POLLING_TIMEOUT_S,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl OperationalParams {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.polling_timeout)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=MAX_POLLING_INTERVAL_S).contains(&self.polling_interval) {
            return Err(ConfigError::Invalid {
                field: "polling_interval",
                constraint: "between 1 second and 1 day",
            });
        }
        if !(1..=MAX_POLLING_TIMEOUT_S).contains(&self.polling_timeout) {
            return Err(ConfigError::Invalid {
                field: "polling_timeout",
                constraint: "between 1 second and 1 hour",
            });
        }
        Ok(self)
    }

    /// Apply a partial user update, leaving unset fields as they are
    pub fn apply(self, update: &OptionsUpdate) -> Result<Self, ConfigError> {
        Self {
            polling_interval: update.polling_interval.unwrap_or(self.polling_interval),
            polling_timeout: update.polling_timeout.unwrap_or(self.polling_timeout),
            max_retries: update.max_retries.unwrap_or(self.max_retries),
        }
        .validate()
    }
}

/// A settings change submitted by the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsUpdate {
    pub polling_interval: Option<u64>,
    pub polling_timeout: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Runtime configuration: identity merged with the current parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub identity: DeviceIdentity,
    pub params: OperationalParams,
}

impl DeviceConfig {
    pub fn merge(identity: DeviceIdentity, options: Option<OperationalParams>) -> Result<Self, ConfigError> {
        Ok(Self {
            identity,
            params: options.unwrap_or_default().validate()?,
        })
    }
}

/// The persisted form of one configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub data: DeviceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<OperationalParams>,
}

impl ConfigEntry {
    pub fn new(data: DeviceIdentity) -> Self {
        Self { data, options: None }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn runtime(&self) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::merge(self.data.clone(), self.options)
    }

    /// The entry to persist after the user changed settings
    pub fn with_options(&self, options: OperationalParams) -> Self {
        Self {
            data: self.data.clone(),
            options: Some(options),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Recognition;
    use async_trait::async_trait;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            address: "AC:BF:71:12:34:56".into(),
            name: "AC200M2237".into(),
            dev_type: "AC200M".into(),
            use_encryption: false,
        }
    }

    #[test]
    fn test_merge_uses_defaults_without_options() {
        let config = DeviceConfig::merge(identity(), None).unwrap();
        assert_eq!(config.params.interval(), Duration::from_secs(20));
        assert_eq!(config.params.timeout(), Duration::from_secs(45));
        assert_eq!(config.params.max_retries, 5);
    }

    #[test]
    fn test_entry_from_json_fills_missing_options() {
        let entry = ConfigEntry::from_json(
            r#"{
                "data": {"address": "AC:BF:71:12:34:56", "name": "AC200M2237", "dev_type": "AC200M", "use_encryption": false},
                "options": {"polling_interval": 60}
            }"#,
        )
        .unwrap();

        let config = entry.runtime().unwrap();
        assert_eq!(config.identity, identity());
        assert_eq!(config.params.polling_interval, 60);
        assert_eq!(config.params.polling_timeout, DEFAULT_POLLING_TIMEOUT_S);
    }

    #[test]
    fn test_entry_round_trips_through_with_options() {
        let entry = ConfigEntry::new(identity());
        assert!(!entry.to_json().unwrap().contains("options"));

        let params = OperationalParams::default().apply(&OptionsUpdate {
            max_retries: Some(2),
            ..Default::default()
        });
        let updated = entry.with_options(params.unwrap());
        let parsed = ConfigEntry::from_json(&updated.to_json().unwrap()).unwrap();
        assert_eq!(parsed.runtime().unwrap().params.max_retries, 2);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let update = OptionsUpdate {
            polling_interval: Some(0),
            ..Default::default()
        };
        let err = OperationalParams::default().apply(&update).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "polling_interval", .. }));

        assert!(matches!(ConfigEntry::from_json("{}"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_oversized_options_rejected() {
        let params = OperationalParams::default();

        let err = params
            .apply(&OptionsUpdate {
                polling_interval: Some(u64::MAX),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "polling_interval", .. }));

        let err = params
            .apply(&OptionsUpdate {
                polling_timeout: Some(MAX_POLLING_TIMEOUT_S + 1),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "polling_timeout", .. }));

        let longest = params.apply(&OptionsUpdate {
            polling_interval: Some(MAX_POLLING_INTERVAL_S),
            polling_timeout: Some(MAX_POLLING_TIMEOUT_S),
            ..Default::default()
        });
        assert!(longest.is_ok());

        let stored = r#"{"data": {"address": "AC:BF:71:12:34:56", "name": "AC200M2237", "dev_type": "AC200M", "use_encryption": false},
            "options": {"polling_interval": 18446744073709551615}}"#;
        assert!(matches!(
            ConfigEntry::from_json(stored).unwrap().runtime(),
            Err(ConfigError::Invalid { field: "polling_interval", .. })
        ));
    }

    struct OnlyAc200;

    #[async_trait]
    impl DeviceRecognizer for OnlyAc200 {
        async fn recognize_device(&self, _address: &str, name: &str) -> anyhow::Result<Option<Recognition>> {
            Ok(name.starts_with("AC200M").then(|| Recognition {
                device_type: "AC200M".into(),
                requires_encryption: false,
            }))
        }
    }

    #[tokio::test]
    async fn test_discover() {
        let found = DeviceIdentity::discover("AC:BF:71:12:34:56", "AC200M2237", &OnlyAc200).await.unwrap();
        assert_eq!(found, Some(identity()));

        let unsupported = DeviceIdentity::discover("AC:BF:71:12:34:57", "Speaker", &OnlyAc200).await.unwrap();
        assert_eq!(unsupported, None);
    }
}
