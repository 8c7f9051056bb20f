use crate::config::SafetyConfig;
use crate::thresholds::ThresholdsUpdate;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WATER_COMMAND: &str = "water";

// One sample of every sensor. A field is None when that sensor is disabled or
// failed to read.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct SensorReading {
    // Soil moisture, 0-100%
    pub soil_pct: Option<f64>,
    pub temperature_c: Option<f64>,
    // Relative humidity, 0-100%
    pub humidity_pct: Option<f64>,
    pub lux: Option<f64>,
    pub timestamp: jiff::Timestamp,
}

// Why a reading was rejected before being reported.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReadingFault {
    NoData,
    TemperatureTooHigh(f64),
    HumidityTooHigh(f64),
}

impl fmt::Display for ReadingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingFault::NoData => write!(f, "no valid sensor data"),
            ReadingFault::TemperatureTooHigh(t) => write!(f, "temperature too high: {t}°C"),
            ReadingFault::HumidityTooHigh(h) => write!(f, "humidity too high: {h}%"),
        }
    }
}

impl SensorReading {
    pub fn has_data(&self) -> bool {
        self.soil_pct.is_some()
            || self.temperature_c.is_some()
            || self.humidity_pct.is_some()
            || self.lux.is_some()
    }

    // A reading is reportable if at least one sensor produced a value and
    // nothing exceeds the configured safety ceilings.
    pub fn check(&self, safety: &SafetyConfig) -> Result<(), ReadingFault> {
        if !safety.enabled {
            return Ok(());
        }
        if !self.has_data() {
            return Err(ReadingFault::NoData);
        }
        if let Some(temp) = self.temperature_c {
            if temp > safety.max_temp_c {
                return Err(ReadingFault::TemperatureTooHigh(temp));
            }
        }
        if let Some(humid) = self.humidity_pct {
            if humid > safety.max_humidity_pct {
                return Err(ReadingFault::HumidityTooHigh(humid));
            }
        }
        Ok(())
    }

    pub fn is_reading_valid(&self, safety: &SafetyConfig) -> bool {
        self.check(safety).is_ok()
    }
}

// Outcome of a pump activation attempt. Rejections and faults are reported
// here too, never as an error.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ActivationResult {
    pub success: bool,
    pub reason: Option<String>,
    // Seconds the relay was held closed.
    pub duration_executed: f64,
    pub timestamp: jiff::Timestamp,
}

impl ActivationResult {
    pub fn completed(duration_executed: f64) -> Self {
        Self {
            success: true,
            reason: None,
            duration_executed,
            timestamp: jiff::Timestamp::now(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            duration_executed: 0.0,
            timestamp: jiff::Timestamp::now(),
        }
    }
}

// The backend hands out either numeric or string ids depending on its store.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum CommandId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandId::Number(n) => write!(f, "{n}"),
            CommandId::Text(s) => write!(f, "{s}"),
        }
    }
}

// A remote command. The payload is left as raw json; only the dispatcher
// knows how to interpret it for a given command type.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Command {
    pub id: CommandId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct WaterPayload {
    #[serde(default, alias = "duration")]
    pub duration_seconds: Option<f64>,
}

impl WaterPayload {
    pub fn from_command(cmd: &Command) -> anyhow::Result<Self> {
        if cmd.payload.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(cmd.payload.clone())?)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Started,
    Completed,
    Failed,
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Started => write!(f, "started"),
            AckStatus::Completed => write!(f, "completed"),
            AckStatus::Failed => write!(f, "failed"),
        }
    }
}

// Body of a successful image upload: the backend's plant detections.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DetectionResult {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Detection {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, rename = "plantType")]
    pub plant_type: Option<PlantType>,
}

impl Detection {
    pub fn confidence(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PlantType {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub thresholds: Option<ThresholdsUpdate>,
}


#[cfg(test)]
mod json_format {
    use super::*;

    #[test]
    fn command_ids() {
        let cmd: Command =
            serde_json::from_str(r#"{"id":42,"type":"water","payload":{"duration":3}}"#).unwrap();
        assert_eq!(cmd.id, CommandId::Number(42));
        assert_eq!(cmd.kind, WATER_COMMAND);
        assert_eq!(
            WaterPayload::from_command(&cmd).unwrap().duration_seconds,
            Some(3.0)
        );

        let cmd: Command =
            serde_json::from_str(r#"{"id":"c-17","type":"reboot"}"#).unwrap();
        assert_eq!(cmd.id.to_string(), "c-17");
        assert_eq!(WaterPayload::from_command(&cmd).unwrap(), WaterPayload::default());
    }

    #[test]
    fn water_payload_keys() {
        let p: WaterPayload = serde_json::from_str(r#"{"duration_seconds":7.5}"#).unwrap();
        assert_eq!(p.duration_seconds, Some(7.5));
        let cmd = Command {
            id: CommandId::Number(1),
            kind: WATER_COMMAND.into(),
            payload: serde_json::json!({"duration": "soon"}),
        };
        assert!(WaterPayload::from_command(&cmd).is_err());
    }

    #[test]
    fn ack_status() {
        assert_eq!(
            serde_json::to_string(&AckStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn detections() {
        let json = r#"{
            "detections": [
                {"label": "basil", "confidence": 0.8,
                 "plantType": {"name": "Basil", "thresholds": {"soil_min": 40, "soil_max": 75}}},
                {"label": "weed", "confidence": null}
            ]
        }"#;
        let result: DetectionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.detections.len(), 2);
        let basil = &result.detections[0];
        assert_eq!(
            basil.plant_type.as_ref().unwrap().name.as_deref(),
            Some("Basil")
        );
        assert_eq!(result.detections[1].confidence(), 0.0);
    }
}
