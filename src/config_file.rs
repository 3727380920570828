use crate::commandline::CliArgs;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use zetarabms_lib::ManagerConfig;

/// Settings read from the optional YAML file. Command-line flags win.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Serial port device path
    pub device: Option<String>,
    pub ble: Option<BleConfig>,
    pub manager: ManagerConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BleConfig {
    pub name: String,
    pub service: Option<String>,
    pub write_characteristic: Option<String>,
    pub notify_characteristic: Option<String>,
    #[serde(default = "BleConfig::default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,
}

impl BleConfig {
    fn default_scan_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

/// Where to reach the BMS.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Serial(String),
    Ble(String),
}

impl AppConfig {
    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn manager_config(&self, args: &CliArgs) -> ManagerConfig {
        let mut config = self.manager.clone();
        if let Some(timeout) = args.timeout {
            config = config.with_request_timeout(timeout);
        }
        if let Some(delay) = args.delay {
            config = config.with_request_spacing(delay);
        }
        if let Some(retries) = args.retries {
            config = config.with_get_retries(retries);
        }
        config
    }

    pub fn endpoint(&self, args: &CliArgs) -> Endpoint {
        if let Some(name) = &args.ble {
            return Endpoint::Ble(name.clone());
        }
        if let Some(device) = &args.device {
            return Endpoint::Serial(device.clone());
        }
        if let Some(ble) = &self.ble {
            return Endpoint::Ble(ble.name.clone());
        }
        Endpoint::Serial(
            self.device
                .clone()
                .unwrap_or_else(crate::commandline::default_device_name),
        )
    }

    #[cfg(feature = "ble")]
    pub fn ble_settings(&self) -> Result<zetarabms_lib::ble::BleSettings> {
        use zetarabms_lib::ble::BleSettings;

        let mut settings = BleSettings::default();
        let Some(ble) = &self.ble else {
            return Ok(settings);
        };
        let parse = |uuid: &Option<String>, default| -> Result<bluest::Uuid> {
            match uuid {
                Some(uuid) => bluest::Uuid::parse_str(uuid)
                    .with_context(|| format!("Invalid UUID {uuid:?} in config file")),
                None => Ok(default),
            }
        };
        settings.service = parse(&ble.service, settings.service)?;
        settings.write_characteristic = parse(&ble.write_characteristic, settings.write_characteristic)?;
        settings.notify_characteristic =
            parse(&ble.notify_characteristic, settings.notify_characteristic)?;
        settings.scan_timeout = ble.scan_timeout;
        Ok(settings)
    }
}
