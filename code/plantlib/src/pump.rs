// Water pump control. PumpSafetyController is the only thing allowed to touch
// the pump relay: every activation goes through its interlocks (one activation
// at a time, cooldown between activations, capped duration) and every exit
// path, including a dropped future, leaves the relay off.

use crate::config::PumpConfig;
use crate::types::ActivationResult;
use anyhow::anyhow;
use embedded_hal::digital::OutputPin;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// Interface for the pump relay. One implementation drives a real gpio pin, the
// other is a fake used for tests and for running without hardware.
pub trait Actuator {
    fn set(&mut self, on: bool) -> anyhow::Result<()>;

    // Called once during shutdown, after the relay has been turned off.
    fn release(&mut self) {}
}

// Relay driven by a digital output pin.
pub struct RelayActuator<P: OutputPin> {
    pin: P,
    active_high: bool,
}

impl<P: OutputPin> RelayActuator<P> {
    // The relay is driven off as part of construction.
    pub fn new(pin: P, active_high: bool) -> anyhow::Result<Self> {
        let mut relay = Self { pin, active_high };
        relay.set(false)?;
        Ok(relay)
    }
}

impl<P: OutputPin> Actuator for RelayActuator<P> {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        let result = if on == self.active_high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|err| anyhow!("relay write failed: {err:?}"))
    }

    fn release(&mut self) {
        if let Err(err) = self.set(false) {
            log::warn!("Relay off during release failed: {err}");
        }
        log::info!("Pump relay released");
    }
}

#[derive(Debug, Default)]
pub struct FakeActuatorState {
    pub on: bool,
    // Every successful write, in order.
    pub writes: Vec<bool>,
    // Fail every write.
    pub fail_all: bool,
    // Fail only writes that would turn the relay on.
    pub fail_on: bool,
    pub released: bool,
}

// FakeActuator implements the Actuator interface in memory. Clones share
// state, so a test can keep one handle and give the other to the controller.
#[derive(Clone, Default)]
pub struct FakeActuator {
    state: Arc<Mutex<FakeActuatorState>>,
}

impl FakeActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeActuatorState> {
        lock(&self.state)
    }

    pub fn is_on(&self) -> bool {
        self.state().on
    }
}

impl Actuator for FakeActuator {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        let mut state = self.state();
        if state.fail_all || (on && state.fail_on) {
            return Err(anyhow!("simulated relay fault"));
        }
        log::debug!("[fake] pump {}", if on { "ON" } else { "OFF" });
        state.on = on;
        state.writes.push(on);
        Ok(())
    }

    fn release(&mut self) {
        self.state().released = true;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PumpState {
    pub is_running: bool,
    // End of the last completed activation.
    pub last_activation_time: Option<Instant>,
    pub total_activations: u64,
}

#[derive(Clone, Copy, Serialize, Debug, PartialEq)]
pub struct PumpStatus {
    pub is_running: bool,
    pub total_activations: u64,
    pub seconds_since_last: Option<u64>,
    pub can_activate: bool,
}

pub struct PumpSafetyController {
    max_duration_secs: f64,
    min_interval: Duration,
    state: Mutex<PumpState>,
    actuator: Mutex<Box<dyn Actuator + Send>>,
    // Bumped by every emergency stop. An activation aborts as soon as the value
    // changes under it.
    stops: watch::Sender<u64>,
}

// Relay-off paths must work even if some other holder of the lock panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PumpSafetyController {
    pub fn new(config: &PumpConfig, actuator: Box<dyn Actuator + Send>) -> Self {
        Self {
            max_duration_secs: config.max_duration_secs,
            min_interval: config.min_interval(),
            state: Mutex::new(PumpState::default()),
            actuator: Mutex::new(actuator),
            stops: watch::Sender::new(0),
        }
    }

    pub fn state(&self) -> PumpState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).is_running
    }

    pub fn can_activate(&self) -> (bool, Option<String>) {
        match self.check_interlocks(&lock(&self.state), Instant::now()) {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        }
    }

    fn check_interlocks(&self, state: &PumpState, now: Instant) -> Result<(), String> {
        if state.is_running {
            return Err("already running".to_string());
        }
        if let Some(last) = state.last_activation_time {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                let remaining = (self.min_interval - elapsed).as_secs();
                return Err(format!("cooldown: wait {remaining}s"));
            }
        }
        Ok(())
    }

    // Runs the pump for `requested_secs` (capped at the configured maximum) if
    // the interlocks allow it. Holds the caller for the whole activation, or
    // until an emergency stop.
    pub async fn activate(&self, requested_secs: f64, reason: &str) -> ActivationResult {
        if !(requested_secs.is_finite() && requested_secs > 0.0) {
            log::warn!("Rejecting pump activation with duration {requested_secs}");
            return ActivationResult::rejected(format!("invalid duration: {requested_secs}"));
        }
        let duration = requested_secs.min(self.max_duration_secs);

        // The interlock check, the generation and the relay-on write happen
        // under one lock, so an emergency stop lands either before all of them
        // or after the relay is on.
        let mut stops = self.stops.subscribe();
        let (generation, on) = {
            let mut state = lock(&self.state);
            if let Err(why) = self.check_interlocks(&state, Instant::now()) {
                log::warn!("Cannot activate pump ({reason}): {why}");
                return ActivationResult::rejected(why);
            }
            state.is_running = true;
            log::info!("Activating pump for {duration:.1}s ({reason})");
            (*stops.borrow_and_update(), self.drive(true))
        };
        let run = RunGuard {
            pump: self,
            generation,
        };
        if let Err(err) = on {
            return run.fault(err);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(duration)) => {}
            _ = stops.changed() => return run.stopped(),
        }
        run.finish(duration)
    }

    fn drive(&self, on: bool) -> anyhow::Result<()> {
        lock(&self.actuator).set(on)
    }

    fn write_off(&self) {
        if let Err(err) = self.drive(false) {
            log::error!("Failed to turn pump relay off: {err}");
        }
    }

    // Turns the relay off no matter what state the controller is in, and ends
    // any activation in flight. Write errors are logged, never returned.
    pub fn emergency_stop(&self) {
        log::warn!("EMERGENCY STOP: shutting down pump");
        let mut state = lock(&self.state);
        self.write_off();
        state.is_running = false;
        self.stops.send_modify(|n| *n += 1);
    }

    fn force_off(&self) {
        let mut state = lock(&self.state);
        self.write_off();
        state.is_running = false;
    }

    fn stop_generation(&self) -> u64 {
        *self.stops.borrow()
    }

    pub fn status(&self) -> PumpStatus {
        let state = self.state();
        PumpStatus {
            is_running: state.is_running,
            total_activations: state.total_activations,
            seconds_since_last: state.last_activation_time.map(|t| t.elapsed().as_secs()),
            can_activate: self.can_activate().0,
        }
    }

    // Relay off, then hand the actuator its chance to clean up.
    pub fn release(&self) {
        self.force_off();
        lock(&self.actuator).release();
    }
}

impl Drop for PumpSafetyController {
    fn drop(&mut self) {
        if self.is_running() {
            self.force_off();
        }
    }
}

// Marks an activation in flight. If the activation future is dropped before
// it finishes (e.g. on shutdown), dropping the guard turns the relay off,
// unless an emergency stop already ended this activation and another one may
// own the relay now.
struct RunGuard<'a> {
    pump: &'a PumpSafetyController,
    generation: u64,
}

impl RunGuard<'_> {
    fn finish(self, duration: f64) -> ActivationResult {
        let mut state = lock(&self.pump.state);
        if self.pump.stop_generation() != self.generation {
            drop(state);
            return self.stopped();
        }
        if let Err(err) = self.pump.drive(false) {
            drop(state);
            return self.fault(err);
        }
        state.last_activation_time = Some(Instant::now());
        state.total_activations += 1;
        state.is_running = false;
        drop(state);
        std::mem::forget(self);

        log::info!("Pump activation complete: {duration:.1}s");
        ActivationResult::completed(duration)
    }

    fn fault(self, err: anyhow::Error) -> ActivationResult {
        log::error!("Error during pump activation: {err}");
        self.pump.force_off();
        std::mem::forget(self);
        ActivationResult::rejected(format!("error: {err}"))
    }

    // The emergency stop already turned the relay off and cleared the
    // running flag. Nothing is stamped.
    fn stopped(self) -> ActivationResult {
        log::warn!("Pump activation ended by emergency stop");
        std::mem::forget(self);
        ActivationResult::rejected("emergency stop".to_string())
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.pump.state);
        if self.pump.stop_generation() != self.generation {
            return;
        }
        log::warn!("Pump activation interrupted, forcing relay off");
        self.pump.write_off();
        state.is_running = false;
    }
}

#[cfg(test)]
mod pump_controller {
    use super::*;

    fn controller() -> (PumpSafetyController, FakeActuator) {
        let relay = FakeActuator::new();
        let pump = PumpSafetyController::new(&PumpConfig::default(), Box::new(relay.clone()));
        (pump, relay)
    }

    #[tokio::test(start_paused = true)]
    async fn activation_runs_for_requested_duration() {
        let (pump, relay) = controller();
        let start = Instant::now();
        let result = pump.activate(3.0, "test").await;
        assert!(result.success);
        assert_eq!(result.reason, None);
        assert_eq!(result.duration_executed, 3.0);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(relay.state().writes, vec![true, false]);
        assert!(!relay.is_on());

        let state = pump.state();
        assert!(!state.is_running);
        assert_eq!(state.total_activations, 1);
        assert!(state.last_activation_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_is_capped() {
        let (pump, _relay) = controller();
        let start = Instant::now();
        let result = pump.activate(45.0, "test").await;
        assert!(result.success);
        assert_eq!(result.duration_executed, 10.0);
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_durations_are_rejected() {
        let (pump, relay) = controller();
        for d in [0.0, -3.0, f64::NAN] {
            let result = pump.activate(d, "test").await;
            assert!(!result.success);
            assert!(result.reason.unwrap().starts_with("invalid duration"));
        }
        assert!(relay.state().writes.is_empty());
        assert_eq!(pump.state().total_activations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_activation_is_rejected() {
        let (pump, relay) = controller();
        let (first, second) = tokio::join!(pump.activate(5.0, "a"), pump.activate(5.0, "b"));
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.reason.as_deref(), Some("already running"));
        assert_eq!(relay.state().writes, vec![true, false]);
        assert_eq!(pump.state().total_activations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_reports_remaining_seconds() {
        let (pump, _relay) = controller();
        assert!(pump.activate(2.0, "test").await.success);

        let result = pump.activate(2.0, "test").await;
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("cooldown: wait 300s"));

        tokio::time::advance(Duration::from_millis(100_500)).await;
        let (ok, reason) = pump.can_activate();
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("cooldown: wait 199s"));

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(pump.can_activate(), (true, None));
        assert!(pump.activate(2.0, "test").await.success);
        assert_eq!(pump.state().total_activations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_starts_at_end_of_activation() {
        let (pump, _relay) = controller();
        assert!(pump.activate(10.0, "test").await.success);
        tokio::time::advance(Duration::from_secs(295)).await;
        // 305s since the start, but only 295s since the relay turned off.
        assert_eq!(
            pump.activate(1.0, "test").await.reason.as_deref(),
            Some("cooldown: wait 5s")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fault_turning_on_leaves_pump_off() {
        let (pump, relay) = controller();
        relay.state().fail_on = true;
        let result = pump.activate(3.0, "test").await;
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("error: simulated relay fault"));
        assert!(!pump.is_running());
        assert!(!relay.is_on());
        assert_eq!(relay.state().writes, vec![false]);
        // a fault is not a completed activation, so no cooldown
        assert_eq!(pump.state().last_activation_time, None);
        assert_eq!(pump.can_activate(), (true, None));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_activation_turns_relay_off() {
        let (pump, relay) = controller();
        let result = tokio::time::timeout(Duration::from_secs(1), pump.activate(8.0, "test")).await;
        assert!(result.is_err());
        assert!(!pump.is_running());
        assert!(!relay.is_on());
        assert_eq!(pump.state().total_activations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_ends_activation() {
        let (pump, relay) = controller();
        let start = Instant::now();
        let (result, ()) = tokio::join!(pump.activate(8.0, "test"), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(pump.is_running());
            assert!(relay.is_on());
            pump.emergency_stop();
            assert!(!pump.is_running());
            assert!(!relay.is_on());
        });
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("emergency stop"));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(relay.state().writes, vec![true, false]);
        let state = pump.state();
        assert_eq!(state.total_activations, 0);
        assert_eq!(state.last_activation_time, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_activation_does_not_touch_the_next_one() {
        let (pump, relay) = controller();
        let (first, (second, midway)) = tokio::join!(pump.activate(8.0, "first"), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            pump.emergency_stop();
            tokio::join!(pump.activate(10.0, "second"), async {
                // past the end of the first activation's hold
                tokio::time::sleep(Duration::from_secs(7)).await;
                (relay.is_on(), pump.is_running())
            })
        });
        assert_eq!(first.reason.as_deref(), Some("emergency stop"));
        assert!(second.success);
        assert_eq!(second.duration_executed, 10.0);
        assert_eq!(midway, (true, true));
        assert_eq!(relay.state().writes, vec![true, false, true, false]);
        assert_eq!(pump.state().total_activations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_does_not_abort_later_activation() {
        let (pump, _relay) = controller();
        pump.emergency_stop();
        let result = pump.activate(2.0, "test").await;
        assert!(result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn nan_is_not_clamped_into_a_valid_duration() {
        let (pump, relay) = controller();
        let result = pump.activate(f64::NAN, "test").await;
        assert_eq!(result.reason.as_deref(), Some("invalid duration: NaN"));
        let result = pump.activate(f64::INFINITY, "test").await;
        assert_eq!(result.reason.as_deref(), Some("invalid duration: inf"));
        assert!(relay.state().writes.is_empty());
    }

    #[test]
    fn emergency_stop_swallows_errors() {
        let (pump, relay) = controller();
        relay.state().fail_all = true;
        pump.emergency_stop();
        assert!(!pump.is_running());
    }

    #[test]
    fn release_turns_off_and_releases() {
        let (pump, relay) = controller();
        relay.state().on = true;
        pump.release();
        assert!(!relay.is_on());
        assert!(relay.state().released);
    }

    #[test]
    fn status_before_any_activation() {
        let (pump, _relay) = controller();
        assert_eq!(
            pump.status(),
            PumpStatus {
                is_running: false,
                total_activations: 0,
                seconds_since_last: None,
                can_activate: true,
            }
        );
    }
}
