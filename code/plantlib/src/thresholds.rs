use crate::types::{Detection, DetectionResult};
use serde::{Deserialize, Serialize};

// Watering/environment thresholds for the plant being monitored. Always fully
// populated: the defaults below are used until the backend identifies the
// plant.
#[derive(Serialize, Deserialize, PartialEq, Clone, Copy, Debug)]
pub struct Thresholds {
    // Soil moisture, %. Watering starts below soil_min.
    pub soil_min: f64,
    pub soil_max: f64,
    // Degrees Celsius
    pub temp_min: f64,
    pub temp_max: f64,
    // Relative humidity, %
    pub humidity_min: f64,
    pub humidity_max: f64,
    pub light_min: f64,
    pub light_max: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            soil_min: 30.0,
            soil_max: 70.0,
            temp_min: 15.0,
            temp_max: 30.0,
            humidity_min: 40.0,
            humidity_max: 80.0,
            light_min: 200.0,
            light_max: 2000.0,
        }
    }
}

// Partial thresholds as sent by the backend. Fields that are missing (or
// null) leave the current value alone; there is no way to clear a threshold.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ThresholdsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_max: Option<f64>,
}

impl Thresholds {
    pub fn update(&mut self, update: &ThresholdsUpdate) {
        let fields = [
            (&mut self.soil_min, update.soil_min),
            (&mut self.soil_max, update.soil_max),
            (&mut self.temp_min, update.temp_min),
            (&mut self.temp_max, update.temp_max),
            (&mut self.humidity_min, update.humidity_min),
            (&mut self.humidity_max, update.humidity_max),
            (&mut self.light_min, update.light_min),
            (&mut self.light_max, update.light_max),
        ];
        for (field, value) in fields {
            if let Some(v) = value {
                *field = v;
            }
        }
    }
}

// Holds the active thresholds and the name of the plant they came from. The
// only way to change them is merge().
#[derive(Debug, Default)]
pub struct ThresholdStore {
    current: Thresholds,
    identified_plant: Option<String>,
}

impl ThresholdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &Thresholds {
        &self.current
    }

    pub fn identified_plant(&self) -> Option<&str> {
        self.identified_plant.as_deref()
    }

    // Applies the thresholds of the most confident detection. Returns true if
    // any thresholds were applied.
    pub fn merge(&mut self, result: &DetectionResult) -> bool {
        let Some(dominant) = dominant_detection(&result.detections) else {
            log::info!("No plant detections in upload response");
            return false;
        };

        let Some(plant_type) = &dominant.plant_type else {
            log::info!("Dominant detection has no plant type");
            return false;
        };

        let name = plant_type.name.clone().unwrap_or_else(|| "Unknown".to_string());
        self.identified_plant = Some(name.clone());

        match &plant_type.thresholds {
            Some(update) => {
                self.current.update(update);
                let t = &self.current;
                log::info!(
                    "Updated thresholds for {name}: soil {}-{}%, temp {}-{}°C, humidity {}-{}%, light {}-{} lux",
                    t.soil_min,
                    t.soil_max,
                    t.temp_min,
                    t.temp_max,
                    t.humidity_min,
                    t.humidity_max,
                    t.light_min,
                    t.light_max,
                );
                true
            }
            None => {
                log::info!("No thresholds for plant type {name}");
                false
            }
        }
    }
}

// Highest confidence wins; on a tie the earlier detection is kept.
fn dominant_detection(detections: &[Detection]) -> Option<&Detection> {
    let mut best: Option<&Detection> = None;
    for d in detections {
        match best {
            Some(b) if d.confidence() <= b.confidence() => {}
            _ => best = Some(d),
        }
    }
    best
}

#[cfg(test)]
mod threshold_store {
    use super::*;
    use crate::types::PlantType;

    fn detection(label: &str, confidence: f64, update: Option<ThresholdsUpdate>) -> Detection {
        Detection {
            label: Some(label.to_string()),
            confidence: Some(confidence),
            plant_type: Some(PlantType {
                name: Some(label.to_string()),
                thresholds: update,
            }),
        }
    }

    #[test]
    fn most_confident_detection_wins() {
        let mut store = ThresholdStore::new();
        let result = DetectionResult {
            detections: vec![
                detection(
                    "fern",
                    0.6,
                    Some(ThresholdsUpdate {
                        soil_min: Some(50.0),
                        ..Default::default()
                    }),
                ),
                detection(
                    "cactus",
                    0.9,
                    Some(ThresholdsUpdate {
                        soil_min: Some(10.0),
                        temp_max: Some(38.0),
                        ..Default::default()
                    }),
                ),
            ],
        };
        assert!(store.merge(&result));
        assert_eq!(store.current().soil_min, 10.0);
        assert_eq!(store.current().temp_max, 38.0);
        // untouched fields keep their defaults
        assert_eq!(store.current().soil_max, 70.0);
        assert_eq!(store.current().light_min, 200.0);
        assert_eq!(store.identified_plant(), Some("cactus"));
    }

    #[test]
    fn ties_keep_first_detection() {
        let detections = vec![
            detection("first", 0.7, None),
            detection("second", 0.7, None),
        ];
        assert_eq!(
            dominant_detection(&detections).unwrap().label.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn no_detections_is_a_noop() {
        let mut store = ThresholdStore::new();
        assert!(!store.merge(&DetectionResult::default()));
        assert_eq!(*store.current(), Thresholds::default());
        assert_eq!(store.identified_plant(), None);
    }

    #[test]
    fn unnamed_plant_type_is_unknown() {
        let mut store = ThresholdStore::new();
        let mut unnamed = detection("leaf", 0.8, None);
        unnamed.plant_type.as_mut().unwrap().name = None;
        store.merge(&DetectionResult {
            detections: vec![unnamed],
        });
        assert_eq!(store.identified_plant(), Some("Unknown"));
    }

    #[test]
    fn plant_without_thresholds_only_records_name() {
        let mut store = ThresholdStore::new();
        let result = DetectionResult {
            detections: vec![detection("moss", 0.5, None)],
        };
        assert!(!store.merge(&result));
        assert_eq!(*store.current(), Thresholds::default());
        assert_eq!(store.identified_plant(), Some("moss"));
    }

    #[test]
    fn null_fields_do_not_clear() {
        let update: ThresholdsUpdate =
            serde_json::from_str(r#"{"soil_min": null, "humidity_max": 65}"#).unwrap();
        let mut t = Thresholds::default();
        t.update(&update);
        assert_eq!(t.soil_min, 30.0);
        assert_eq!(t.humidity_max, 65.0);
    }

    #[test]
    fn last_merge_wins() {
        let mut store = ThresholdStore::new();
        for soil_min in [25.0, 45.0] {
            let result = DetectionResult {
                detections: vec![detection(
                    "basil",
                    0.8,
                    Some(ThresholdsUpdate {
                        soil_min: Some(soil_min),
                        ..Default::default()
                    }),
                )],
            };
            store.merge(&result);
        }
        assert_eq!(store.current().soil_min, 45.0);
    }
}
