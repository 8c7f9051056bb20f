use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// DeviceConfig is built once at startup (file + environment) and handed to
// each component's constructor by reference. Every field has a default, so a
// config file only needs to list the values it wants to change.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub hardware: HardwareMode,
    pub api: ApiConfig,
    pub pump: PumpConfig,
    pub timing: TimingConfig,
    pub watering: WateringConfig,
    pub safety: SafetyConfig,
    pub sensors: SensorConfig,
    pub camera: CameraConfig,
}

// Selects which capability implementations the daemon wires up. There is no
// silent fallback: if gpio is requested and the pins can't be opened, startup
// fails.
#[derive(Serialize, Deserialize, PartialEq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    #[default]
    Mock,
    Gpio,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct ApiConfig {
    // Base url of the backend, no trailing slash needed.
    pub base_url: String,
    pub device_token: String,
    pub device_id: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    // Delay before the second attempt. Doubles for every following attempt.
    pub retry_delay_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".into(),
            device_token: "your-device-token-secret-here".into(),
            device_id: "raspberry-pi-001".into(),
            request_timeout_secs: 30,
            max_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct PumpConfig {
    pub gpio_pin: u32,
    // True if the relay closes when the pin is driven high.
    pub active_high: bool,
    // Hardware ceiling for a single activation, in seconds.
    pub max_duration_secs: f64,
    // Minimum idle time between the end of one activation and the start of
    // the next.
    pub min_interval_secs: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 18,
            active_high: true,
            max_duration_secs: 10.0,
            min_interval_secs: 300,
        }
    }
}

impl PumpConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct TimingConfig {
    pub telemetry_interval_secs: u64,
    pub image_capture_interval_secs: u64,
    pub command_poll_interval_secs: u64,
    pub status_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_secs: 15,
            image_capture_interval_secs: 300,
            command_poll_interval_secs: 10,
            status_interval_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct WateringConfig {
    // Enables local watering decisions. Remote water commands are always
    // handled.
    pub enabled: bool,
    pub duration_secs: f64,
    pub check_interval_secs: u64,
    // How long to let the soil absorb water before taking a follow-up
    // reading.
    pub settle_delay_secs: u64,
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: 5.0,
            check_interval_secs: 60,
            settle_delay_secs: 2,
        }
    }
}

impl WateringConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct SafetyConfig {
    pub enabled: bool,
    pub max_temp_c: f64,
    pub max_humidity_pct: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_temp_c: 50.0,
            max_humidity_pct: 100.0,
        }
    }
}

// Digital (D0) sensor wiring and the two-level calibration used to turn a
// single bit into a percentage or lux value.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct SensorConfig {
    pub soil_enabled: bool,
    pub temperature_enabled: bool,
    pub humidity_enabled: bool,
    pub light_enabled: bool,
    pub soil_pin: u32,
    pub light_pin: u32,
    pub soil_wet_pct: f64,
    pub soil_dry_pct: f64,
    pub light_bright_lux: f64,
    pub light_dark_lux: f64,
    // Root of the sysfs gpio tree and the number of the first line of the
    // gpio chip. Newer Raspberry Pi kernels number the header pins from 512.
    pub sysfs_root: String,
    pub sysfs_base: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            soil_enabled: true,
            temperature_enabled: true,
            humidity_enabled: true,
            light_enabled: true,
            soil_pin: 27,
            light_pin: 17,
            soil_wet_pct: 80.0,
            soil_dry_pct: 20.0,
            light_bright_lux: 2000.0,
            light_dark_lux: 100.0,
            sysfs_root: "/sys/class/gpio".into(),
            sysfs_base: 0,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
#[serde(default)]
pub struct CameraConfig {
    pub enabled: bool,
    // Program + arguments that write a single JPEG frame to stdout.
    pub capture_command: Vec<String>,
    // The capture program is killed if it runs longer than this.
    pub capture_timeout_secs: u64,
}

impl CameraConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_command: [
                "libcamera-still",
                "--nopreview",
                "--timeout",
                "1",
                "--width",
                "1024",
                "--height",
                "768",
                "--quality",
                "85",
                "--output",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            capture_timeout_secs: 30,
        }
    }
}

pub const ENV_API_BASE_URL: &str = "API_BASE_URL";
pub const ENV_DEVICE_TOKEN: &str = "DEVICE_TOKEN";
pub const ENV_DEVICE_ID: &str = "DEVICE_ID";

impl DeviceConfig {
    // Reads the config file if one is given (defaults otherwise), then applies
    // the environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_BASE_URL) {
            self.api.base_url = url;
        }
        if let Some(token) = lookup(ENV_DEVICE_TOKEN) {
            self.api.device_token = token;
        }
        if let Some(id) = lookup(ENV_DEVICE_ID) {
            self.api.device_id = id;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(anyhow!("api.base_url can not be empty"));
        }
        if self.api.device_id.trim().is_empty() {
            return Err(anyhow!("api.device_id can not be empty"));
        }
        if self.api.max_retries == 0 {
            return Err(anyhow!("api.max_retries must be at least 1"));
        }
        if !(self.pump.max_duration_secs.is_finite() && self.pump.max_duration_secs > 0.0) {
            return Err(anyhow!(
                "pump.max_duration_secs must be a positive number, got {}",
                self.pump.max_duration_secs
            ));
        }
        if !(self.watering.duration_secs.is_finite() && self.watering.duration_secs > 0.0) {
            return Err(anyhow!(
                "watering.duration_secs must be a positive number, got {}",
                self.watering.duration_secs
            ));
        }
        let intervals = [
            ("timing.telemetry_interval_secs", self.timing.telemetry_interval_secs),
            (
                "timing.image_capture_interval_secs",
                self.timing.image_capture_interval_secs,
            ),
            (
                "timing.command_poll_interval_secs",
                self.timing.command_poll_interval_secs,
            ),
            ("timing.status_interval_secs", self.timing.status_interval_secs),
            ("watering.check_interval_secs", self.watering.check_interval_secs),
            ("camera.capture_timeout_secs", self.camera.capture_timeout_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(anyhow!("{name} must be greater than zero"));
            }
        }
        if !self.safety.max_temp_c.is_finite() || !self.safety.max_humidity_pct.is_finite() {
            return Err(anyhow!("safety ceilings must be finite numbers"));
        }
        if self.camera.enabled
            && self.hardware == HardwareMode::Gpio
            && self.camera.capture_command.is_empty()
        {
            return Err(anyhow!("camera.capture_command can not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod device_config {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = DeviceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.pump.max_duration_secs, 10.0);
        assert_eq!(cfg.pump.min_interval_secs, 300);
        assert_eq!(cfg.api.max_retries, 3);
        assert_eq!(cfg.hardware, HardwareMode::Mock);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = DeviceConfig::from_toml(
            r#"
            hardware = "gpio"

            [pump]
            max_duration_secs = 4.5

            [timing]
            telemetry_interval_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hardware, HardwareMode::Gpio);
        assert_eq!(cfg.pump.max_duration_secs, 4.5);
        assert_eq!(cfg.pump.min_interval_secs, 300);
        assert_eq!(cfg.timing.telemetry_interval_secs, 30);
        assert_eq!(cfg.timing.command_poll_interval_secs, 10);
        assert_eq!(cfg.api, ApiConfig::default());
    }

    #[test]
    fn unknown_hardware_mode_is_rejected() {
        assert!(DeviceConfig::from_toml("hardware = \"magic\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let env = HashMap::from([
            (ENV_API_BASE_URL, "https://plants.example.com/api"),
            (ENV_DEVICE_ID, "greenhouse-2"),
        ]);
        let mut cfg = DeviceConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.api.base_url, "https://plants.example.com/api");
        assert_eq!(cfg.api.device_id, "greenhouse-2");
        assert_eq!(cfg.api.device_token, ApiConfig::default().device_token);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = DeviceConfig::default();
        cfg.api.max_retries = 0;
        assert_eq!(
            cfg.validate().unwrap_err().to_string(),
            "api.max_retries must be at least 1"
        );

        let mut cfg = DeviceConfig::default();
        cfg.pump.max_duration_secs = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = DeviceConfig::default();
        cfg.timing.command_poll_interval_secs = 0;
        assert_eq!(
            cfg.validate().unwrap_err().to_string(),
            "timing.command_poll_interval_secs must be greater than zero"
        );

        let mut cfg = DeviceConfig::default();
        cfg.api.device_id = "  ".into();
        assert!(cfg.validate().is_err());

        let mut cfg = DeviceConfig::default();
        cfg.camera.capture_timeout_secs = 0;
        assert_eq!(
            cfg.validate().unwrap_err().to_string(),
            "camera.capture_timeout_secs must be greater than zero"
        );
    }
}
