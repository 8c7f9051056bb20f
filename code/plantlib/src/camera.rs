use crate::config::CameraConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

// Smallest byte sequence that still starts and ends like a JPEG.
pub const MINIMAL_JPEG: &[u8] = &[
    0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xff, 0xd9,
];

// Interface for the plant camera. Capturing can take seconds, so it is async
// and the main loop can drop it on shutdown.
#[async_trait]
pub trait ImageSource: Send {
    // Returns one JPEG frame, or None if no image could be taken.
    async fn capture(&mut self) -> Option<Vec<u8>>;

    // Called once during shutdown.
    fn release(&mut self) {}
}

pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xff, 0xd8])
}

// FakeCamera implements the ImageSource interface and is used for testing and
// for running without hardware. A None frame simulates a camera that can't
// capture.
pub struct FakeCamera {
    pub frame: Option<Vec<u8>>,
    // How long each capture takes.
    pub delay: Duration,
    pub captures: u32,
    pub released: bool,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self {
            frame: Some(MINIMAL_JPEG.to_vec()),
            delay: Duration::ZERO,
            captures: 0,
            released: false,
        }
    }
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageSource for FakeCamera {
    async fn capture(&mut self) -> Option<Vec<u8>> {
        self.captures += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.frame.clone()
    }

    fn release(&mut self) {
        self.released = true;
    }
}

// Captures frames by running an external program (libcamera-still by default)
// that writes a JPEG to stdout. A capture that outlives the configured timeout,
// or whose future is dropped, kills the program.
pub struct CommandCamera {
    enabled: bool,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCamera {
    pub fn new(config: &CameraConfig) -> Self {
        let mut argv = config.capture_command.iter().cloned();
        let program = argv.next().unwrap_or_default();
        Self {
            enabled: config.enabled && !program.is_empty(),
            program,
            args: argv.collect(),
            timeout: config.capture_timeout(),
        }
    }

    async fn run(&self) -> anyhow::Result<Vec<u8>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let Ok(output) = tokio::time::timeout(self.timeout, child).await else {
            anyhow::bail!("{} timed out after {:?}", self.program, self.timeout);
        };
        let output = output?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !is_jpeg(&output.stdout) {
            anyhow::bail!("{} did not produce a JPEG image", self.program);
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageSource for CommandCamera {
    async fn capture(&mut self) -> Option<Vec<u8>> {
        if !self.enabled {
            log::debug!("Camera disabled in config");
            return None;
        }
        match self.run().await {
            Ok(jpeg) => {
                log::info!("Image captured: {} bytes", jpeg.len());
                Some(jpeg)
            }
            Err(err) => {
                log::error!("Error capturing image: {err}");
                None
            }
        }
    }
}
