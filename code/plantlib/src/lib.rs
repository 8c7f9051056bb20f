pub mod camera;
pub mod cancel_context;
pub mod client;
pub mod config;
pub mod gpio;
pub mod orchestrator;
pub mod pump;
pub mod sensors;
pub mod status;
pub mod thresholds;
pub mod transport;
pub mod types;
