use crate::config::SensorConfig;
use crate::types::SensorReading;
use embedded_hal::digital::InputPin;

// Interface for the plant's sensors. Reads never fail: a sensor that is
// disabled or that errors out is simply absent from the reading.
pub trait SensorSource {
    fn read_all(&mut self) -> SensorReading;

    // Called once during shutdown.
    fn release(&mut self) {}
}

// FakeSensors implements the SensorSource interface and is used for testing and
// for running without hardware. Every read returns `reading`, stamped with
// the current time.
pub struct FakeSensors {
    pub reading: SensorReading,
    pub reads: u32,
    pub released: bool,
}

impl FakeSensors {
    pub fn new() -> Self {
        Self {
            reading: SensorReading {
                soil_pct: Some(45.0),
                temperature_c: Some(22.5),
                humidity_pct: Some(55.0),
                lux: Some(800.0),
                ..Default::default()
            },
            reads: 0,
            released: false,
        }
    }
}

impl Default for FakeSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for FakeSensors {
    fn read_all(&mut self) -> SensorReading {
        self.reads += 1;
        SensorReading {
            timestamp: jiff::Timestamp::now(),
            ..self.reading
        }
    }

    fn release(&mut self) {
        self.released = true;
    }
}

// Soil and light modules that only expose their comparator output (D0). Each
// level maps to one of two calibrated values:
//   soil:  low = wet, high = dry
//   light: low = bright, high = dark
// There is no temperature/humidity sensor on this wiring, so those are always
// absent.
pub struct DigitalSensorSource<S: InputPin, L: InputPin> {
    soil: Option<S>,
    light: Option<L>,
    soil_wet_pct: f64,
    soil_dry_pct: f64,
    light_bright_lux: f64,
    light_dark_lux: f64,
}

impl<S: InputPin, L: InputPin> DigitalSensorSource<S, L> {
    // Pins for disabled sensors are dropped here and never read.
    pub fn new(config: &SensorConfig, soil: S, light: L) -> Self {
        Self {
            soil: config.soil_enabled.then_some(soil),
            light: config.light_enabled.then_some(light),
            soil_wet_pct: config.soil_wet_pct,
            soil_dry_pct: config.soil_dry_pct,
            light_bright_lux: config.light_bright_lux,
            light_dark_lux: config.light_dark_lux,
        }
    }

    fn read_soil(&mut self) -> Option<f64> {
        let pin = self.soil.as_mut()?;
        match pin.is_low() {
            Ok(true) => Some(self.soil_wet_pct),
            Ok(false) => Some(self.soil_dry_pct),
            Err(err) => {
                log::warn!("Error reading soil moisture: {err:?}");
                None
            }
        }
    }

    fn read_light(&mut self) -> Option<f64> {
        let pin = self.light.as_mut()?;
        match pin.is_low() {
            Ok(true) => Some(self.light_bright_lux),
            Ok(false) => Some(self.light_dark_lux),
            Err(err) => {
                log::warn!("Error reading light level: {err:?}");
                None
            }
        }
    }
}

impl<S: InputPin, L: InputPin> SensorSource for DigitalSensorSource<S, L> {
    fn read_all(&mut self) -> SensorReading {
        let reading = SensorReading {
            soil_pct: self.read_soil(),
            temperature_c: None,
            humidity_pct: None,
            lux: self.read_light(),
            timestamp: jiff::Timestamp::now(),
        };
        log::debug!(
            "Sensor readings: soil={:?}% light={:?} lux",
            reading.soil_pct,
            reading.lux
        );
        reading
    }

    fn release(&mut self) {
        self.soil = None;
        self.light = None;
        log::info!("Sensor pins released");
    }
}
