// plantmon is the device daemon: it samples the plant's sensors, reports to the
// backend, takes photos for plant identification, runs remote water commands,
// and waters the plant on its own when the soil gets too dry.

use anyhow::Context;
use clap::{ArgAction, Parser};
use plantlib::camera::{CommandCamera, FakeCamera, ImageSource};
use plantlib::cancel_context::CancelContext;
use plantlib::config::{DeviceConfig, HardwareMode};
use plantlib::gpio::SysfsPin;
use plantlib::orchestrator::Orchestrator;
use plantlib::pump::{Actuator, FakeActuator, RelayActuator};
use plantlib::sensors::{DigitalSensorSource, FakeSensors, SensorSource};
use plantlib::transport::ReqwestTransport;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Parser, Debug)]
#[command(about = "Plant monitor device daemon")]
struct Args {
    #[arg(long, help = "Path to a TOML config file. Defaults are used for anything not set")]
    config: Option<PathBuf>,

    #[arg(long, help = "Use fake sensors, camera, and pump regardless of the config")]
    mock: bool,

    #[arg(short, long, action = ArgAction::Count, help = "More logging (-v debug, -vv trace)")]
    verbose: u8,
}

struct Devices {
    sensors: Arc<Mutex<dyn SensorSource + Send>>,
    camera: Arc<AsyncMutex<dyn ImageSource>>,
    actuator: Box<dyn Actuator + Send>,
}

// Fake devices that honor the config's enable flags, so a mock run reports
// the same set of values the real wiring would.
fn fake_devices(cfg: &DeviceConfig) -> Devices {
    let mut sensors = FakeSensors::new();
    let r = &mut sensors.reading;
    if !cfg.sensors.soil_enabled {
        r.soil_pct = None;
    }
    if !cfg.sensors.temperature_enabled {
        r.temperature_c = None;
    }
    if !cfg.sensors.humidity_enabled {
        r.humidity_pct = None;
    }
    if !cfg.sensors.light_enabled {
        r.lux = None;
    }

    let mut camera = FakeCamera::new();
    if !cfg.camera.enabled {
        camera.frame = None;
    }

    Devices {
        sensors: Arc::new(Mutex::new(sensors)),
        camera: Arc::new(AsyncMutex::new(camera)),
        actuator: Box::new(FakeActuator::new()),
    }
}

fn gpio_devices(cfg: &DeviceConfig) -> anyhow::Result<Devices> {
    let root = &cfg.sensors.sysfs_root;
    let line = |pin: u32| cfg.sensors.sysfs_base + pin;

    let relay_pin = SysfsPin::output(root, line(cfg.pump.gpio_pin))
        .with_context(|| format!("opening pump relay pin {}", cfg.pump.gpio_pin))?;
    let actuator = RelayActuator::new(relay_pin, cfg.pump.active_high)?;

    let soil = SysfsPin::input(root, line(cfg.sensors.soil_pin))
        .with_context(|| format!("opening soil sensor pin {}", cfg.sensors.soil_pin))?;
    let light = SysfsPin::input(root, line(cfg.sensors.light_pin))
        .with_context(|| format!("opening light sensor pin {}", cfg.sensors.light_pin))?;

    Ok(Devices {
        sensors: Arc::new(Mutex::new(DigitalSensorSource::new(&cfg.sensors, soil, light))),
        camera: Arc::new(AsyncMutex::new(CommandCamera::new(&cfg.camera))),
        actuator: Box::new(actuator),
    })
}

// Resolves on Ctrl-C or SIGTERM.
async fn wait_for_stop_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    stderrlog::new()
        .module(module_path!())
        .module("plantlib")
        .verbosity(level)
        .init()?;

    let mut cfg = DeviceConfig::load(args.config.as_deref())?;
    if args.mock {
        cfg.hardware = HardwareMode::Mock;
    }
    cfg.validate().context("invalid configuration")?;

    log::info!("Starting plantmon");
    log::info!("Device ID: {}", cfg.api.device_id);
    log::info!("API URL: {}", cfg.api.base_url);
    log::info!("Hardware: {:?}", cfg.hardware);
    if cfg.hardware == HardwareMode::Gpio {
        log::info!("  Soil moisture D0 -> GPIO {}", cfg.sensors.soil_pin);
        log::info!("  Light sensor D0  -> GPIO {}", cfg.sensors.light_pin);
        log::info!("  Water pump relay -> GPIO {}", cfg.pump.gpio_pin);
    }

    let devices = match cfg.hardware {
        HardwareMode::Mock => fake_devices(&cfg),
        HardwareMode::Gpio => gpio_devices(&cfg)?,
    };
    let transport = ReqwestTransport::new(&cfg.api)?;

    let ctx = Arc::new(CancelContext::new());
    let mut orchestrator = Orchestrator::new(
        &cfg,
        devices.sensors,
        devices.camera,
        devices.actuator,
        transport,
        ctx.clone(),
    );

    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if let Err(err) = wait_for_stop_signal().await {
                log::error!("Failed to listen for stop signals: {err}");
            }
            log::info!("Stop requested");
            ctx.cancel();
        }
    });

    orchestrator.run().await;
    orchestrator.shutdown();
    Ok(())
}
