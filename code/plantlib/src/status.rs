use crate::pump::PumpStatus;
use crate::thresholds::Thresholds;
use crate::types::SensorReading;
use serde::Serialize;

// Snapshot of everything the status panel shows. Building one has no side
// effects.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct DeviceStatus {
    pub device_id: String,
    pub identified_plant: Option<String>,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub pump: PumpStatus,
    pub last_reading: Option<SensorReading>,
    pub thresholds: Thresholds,
    // Why the last reading was rejected, if it was.
    pub safety_fault: Option<String>,
}

fn opt(v: Option<f64>, unit: &str) -> String {
    match v {
        Some(v) => format!("{v:.1}{unit}"),
        None => "--".to_string(),
    }
}

pub fn print_device_status(s: &DeviceStatus) {
    println!("==== {} ====", s.device_id);
    println!(
        "Plant:       {}",
        s.identified_plant.as_deref().unwrap_or("not identified")
    );
    println!(
        "Backend:     {} ({} consecutive failures)",
        if s.connected { "connected" } else { "disconnected" },
        s.consecutive_failures
    );
    let since = match s.pump.seconds_since_last {
        Some(secs) => format!("{secs}s ago"),
        None => "never".to_string(),
    };
    println!(
        "Pump:        {} | activations: {} | last: {since} | ready: {}",
        if s.pump.is_running { "RUNNING" } else { "idle" },
        s.pump.total_activations,
        s.pump.can_activate
    );
    if let Some(r) = &s.last_reading {
        println!("Soil:        {}", opt(r.soil_pct, "%"));
        println!("Temp:        {}", opt(r.temperature_c, "C"));
        println!("Humid:       {}", opt(r.humidity_pct, "%"));
        println!("Light:       {}", opt(r.lux, " lux"));
    } else {
        println!("<no sensor reading yet>");
    }
    let t = &s.thresholds;
    println!(
        "Thresholds:  soil {}-{}% | temp {}-{}C | humid {}-{}% | light {}-{} lux",
        t.soil_min,
        t.soil_max,
        t.temp_min,
        t.temp_max,
        t.humidity_min,
        t.humidity_max,
        t.light_min,
        t.light_max
    );
    if let Some(fault) = &s.safety_fault {
        println!("SAFETY:      {fault}");
    }
}

#[cfg(test)]
mod device_status {
    use super::*;

    #[test]
    fn serializes_for_display() {
        let status = DeviceStatus {
            device_id: "pi".into(),
            identified_plant: Some("Basil".into()),
            connected: true,
            consecutive_failures: 0,
            pump: PumpStatus {
                is_running: false,
                total_activations: 2,
                seconds_since_last: Some(40),
                can_activate: false,
            },
            last_reading: None,
            thresholds: Thresholds::default(),
            safety_fault: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["identified_plant"], "Basil");
        assert_eq!(json["pump"]["total_activations"], 2);
        assert_eq!(json["thresholds"]["soil_min"], 30.0);
        print_device_status(&status);
    }

    #[test]
    fn formats_missing_values() {
        assert_eq!(opt(None, "%"), "--");
        assert_eq!(opt(Some(41.26), "%"), "41.3%");
    }
}
