use crate::camera::ImageSource;
use crate::cancel_context::CancelContext;
use crate::client::ResilientClient;
use crate::config::{DeviceConfig, SafetyConfig, TimingConfig, WateringConfig};
use crate::pump::{Actuator, PumpSafetyController, lock};
use crate::sensors::SensorSource;
use crate::status::{DeviceStatus, print_device_status};
use crate::thresholds::ThresholdStore;
use crate::transport::Transport;
use crate::types::{AckStatus, Command, ReadingFault, SensorReading, WATER_COMMAND, WaterPayload};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

pub const TICK: Duration = Duration::from_secs(1);

// Periodic tasks driven by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Telemetry,
    Image,
    Commands,
    Status,
}

#[derive(Default)]
struct LastRuns {
    telemetry: Option<Instant>,
    image: Option<Instant>,
    commands: Option<Instant>,
    status: Option<Instant>,
    water_check: Option<Instant>,
}

fn is_due(last: Option<Instant>, interval: Duration) -> bool {
    match last {
        Some(t) => t.elapsed() >= interval,
        None => true,
    }
}

// The Orchestrator owns every component of the device and runs the periodic
// tasks from a single loop: one task body runs to completion before the next
// one is considered, so pump activations and threshold updates never
// interleave.
pub struct Orchestrator<T: Transport> {
    sensors: Arc<Mutex<dyn SensorSource + Send>>,
    camera: Arc<AsyncMutex<dyn ImageSource>>,
    pump: PumpSafetyController,
    client: ResilientClient<T>,
    thresholds: ThresholdStore,
    ctx: Arc<CancelContext>,
    timing: TimingConfig,
    watering: WateringConfig,
    safety: SafetyConfig,
    last_runs: LastRuns,
    last_reading: Option<SensorReading>,
    safety_fault: Option<ReadingFault>,
    shut_down: bool,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        config: &DeviceConfig,
        sensors: Arc<Mutex<dyn SensorSource + Send>>,
        camera: Arc<AsyncMutex<dyn ImageSource>>,
        actuator: Box<dyn Actuator + Send>,
        transport: T,
        ctx: Arc<CancelContext>,
    ) -> Self {
        Self {
            sensors,
            camera,
            pump: PumpSafetyController::new(&config.pump, actuator),
            client: ResilientClient::new(&config.api, transport),
            thresholds: ThresholdStore::new(),
            ctx,
            timing: config.timing.clone(),
            watering: config.watering.clone(),
            safety: config.safety.clone(),
            last_runs: LastRuns::default(),
            last_reading: None,
            safety_fault: None,
            shut_down: false,
        }
    }

    pub fn pump(&self) -> &PumpSafetyController {
        &self.pump
    }

    pub fn client(&self) -> &ResilientClient<T> {
        &self.client
    }

    pub fn thresholds(&self) -> &ThresholdStore {
        &self.thresholds
    }

    pub fn last_reading(&self) -> Option<&SensorReading> {
        self.last_reading.as_ref()
    }

    pub fn safety_fault(&self) -> Option<ReadingFault> {
        self.safety_fault
    }

    // Runs ticks until the cancel context fires. Cancellation drops whatever
    // task is in progress (an activation hold, a retry backoff, a settle
    // delay), which leaves the pump relay off. Call shutdown() afterwards.
    pub async fn run(&mut self) {
        log::info!("Starting main loop");
        let ctx = self.ctx.clone();
        loop {
            if ctx.run_until_cancelled(self.tick()).await.is_none() {
                log::info!("Main loop cancelled during a tick");
                break;
            }
            if !ctx.sleep(TICK).await {
                break;
            }
        }
        log::info!("Main loop stopped");
        ctx.done();
    }

    // Runs every task whose interval has elapsed and returns the ones that
    // ran. A task's last-run time is stamped after its body completes.
    pub async fn tick(&mut self) -> Vec<Task> {
        let mut ran = Vec::new();

        if is_due(self.last_runs.telemetry, secs(self.timing.telemetry_interval_secs)) {
            self.process_telemetry().await;
            self.last_runs.telemetry = Some(Instant::now());
            ran.push(Task::Telemetry);
        }
        if is_due(self.last_runs.image, secs(self.timing.image_capture_interval_secs)) {
            self.process_image().await;
            self.last_runs.image = Some(Instant::now());
            ran.push(Task::Image);
        }
        if is_due(self.last_runs.commands, secs(self.timing.command_poll_interval_secs)) {
            self.process_commands().await;
            self.last_runs.commands = Some(Instant::now());
            ran.push(Task::Commands);
        }
        if is_due(self.last_runs.status, secs(self.timing.status_interval_secs)) {
            print_device_status(&self.status());
            self.last_runs.status = Some(Instant::now());
            ran.push(Task::Status);
        }
        ran
    }

    fn read_sensors(&mut self) -> SensorReading {
        let reading = lock(&*self.sensors).read_all();
        self.last_reading = Some(reading);
        reading
    }

    // Returns true if the reading may be reported and acted on.
    fn check_reading(&mut self, reading: &SensorReading) -> bool {
        match reading.check(&self.safety) {
            Ok(()) => {
                self.safety_fault = None;
                true
            }
            Err(fault) => {
                log::error!("SAFETY: {fault}, skipping telemetry");
                self.safety_fault = Some(fault);
                false
            }
        }
    }

    async fn process_telemetry(&mut self) {
        let reading = self.read_sensors();
        if !self.check_reading(&reading) {
            return;
        }

        if self.client.send_telemetry(&reading).await {
            log::info!("Telemetry sent");
        } else {
            log::warn!("Telemetry send failed");
        }

        if self.watering.enabled
            && is_due(self.last_runs.water_check, self.watering.check_interval())
        {
            self.check_and_water(&reading).await;
            self.last_runs.water_check = Some(Instant::now());
        }
    }

    // Waters the plant if the soil is drier than the current minimum. Returns
    // true if the pump ran.
    pub async fn check_and_water(&mut self, reading: &SensorReading) -> bool {
        let Some(soil) = reading.soil_pct else {
            return false;
        };
        let soil_min = self.thresholds.current().soil_min;
        if soil >= soil_min {
            return false;
        }

        log::info!("Soil moisture low: {soil}% < {soil_min}%, watering");
        let result = self.pump.activate(self.watering.duration_secs, "auto").await;
        if !result.success {
            log::warn!(
                "Auto-watering failed: {}",
                result.reason.as_deref().unwrap_or("unknown")
            );
            return false;
        }
        log::info!("Auto-watering completed: {:.1}s", result.duration_executed);
        self.report_after_watering().await;
        true
    }

    // Gives the soil time to absorb the water, then reports a fresh reading.
    async fn report_after_watering(&mut self) {
        tokio::time::sleep(self.watering.settle_delay()).await;
        let reading = self.read_sensors();
        if self.check_reading(&reading) {
            self.client.send_telemetry(&reading).await;
        }
    }

    async fn process_image(&mut self) {
        let frame = self.camera.lock().await.capture().await;
        let Some(jpeg) = frame else {
            log::warn!("Image capture failed");
            return;
        };
        log::info!("Uploading image ({} bytes) for analysis", jpeg.len());
        match self.client.upload_image(jpeg).await {
            Some(result) => {
                for d in &result.detections {
                    log::info!(
                        "Detected {} ({:.1}% confidence)",
                        d.label.as_deref().unwrap_or("Unknown"),
                        d.confidence() * 100.0
                    );
                }
                self.thresholds.merge(&result);
            }
            None => log::warn!("Image upload failed"),
        }
    }

    async fn process_commands(&mut self) {
        let commands = self.client.poll_commands().await;
        if !commands.is_empty() {
            log::info!("Processing {} command(s)", commands.len());
        }
        for cmd in &commands {
            self.execute_command(cmd).await;
        }
    }

    pub async fn execute_command(&mut self, cmd: &Command) {
        log::info!("Executing command {}: {}", cmd.id, cmd.kind);
        self.client
            .acknowledge_command(&cmd.id, AckStatus::Started, None)
            .await;

        if cmd.kind != WATER_COMMAND {
            log::warn!("Unknown command type: {}", cmd.kind);
            self.fail_command(cmd, format!("Unknown command type: {}", cmd.kind))
                .await;
            return;
        }

        let duration = match WaterPayload::from_command(cmd) {
            Ok(payload) => payload
                .duration_seconds
                .unwrap_or(self.watering.duration_secs),
            Err(err) => {
                log::warn!("Bad payload for command {}: {err}", cmd.id);
                self.fail_command(cmd, format!("Invalid payload: {err}")).await;
                return;
            }
        };

        let result = self.pump.activate(duration, "command").await;
        if result.success {
            self.client
                .acknowledge_command(
                    &cmd.id,
                    AckStatus::Completed,
                    Some(json!({
                        "duration_executed": result.duration_executed,
                        "timestamp": result.timestamp,
                    })),
                )
                .await;
            log::info!("Water command completed: {:.1}s", result.duration_executed);
            self.report_after_watering().await;
        } else {
            let reason = result.reason.unwrap_or_else(|| "unknown".to_string());
            log::warn!("Water command failed: {reason}");
            self.fail_command(cmd, reason).await;
        }
    }

    async fn fail_command(&self, cmd: &Command, error: String) {
        self.client
            .acknowledge_command(&cmd.id, AckStatus::Failed, Some(json!({ "error": error })))
            .await;
    }

    pub fn status(&self) -> DeviceStatus {
        let health = self.client.connection_health();
        DeviceStatus {
            device_id: self.client.device_id().to_string(),
            identified_plant: self.thresholds.identified_plant().map(str::to_string),
            connected: self.client.is_connected(),
            consecutive_failures: health.consecutive_failures,
            pump: self.pump.status(),
            last_reading: self.last_reading,
            thresholds: *self.thresholds.current(),
            safety_fault: self.safety_fault.map(|f| f.to_string()),
        }
    }

    // Relay off first, then every hardware handle is released. Safe to call
    // at any point, including after a cancelled tick. Runs from Drop if it
    // wasn't called, e.g. when the main loop panics.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down");
        self.pump.emergency_stop();
        lock(&*self.sensors).release();
        match self.camera.try_lock() {
            Ok(mut camera) => camera.release(),
            Err(_) => log::warn!("Camera still busy, not released"),
        }
        self.pump.release();
        log::info!("Shutdown complete");
    }
}

impl<T: Transport> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}
