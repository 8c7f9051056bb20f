// Linux sysfs gpio pins (/sys/class/gpio). A pin is exported when opened and
// unexported when dropped, so a crashed or stopped daemon does not leave
// lines claimed.

use embedded_hal::digital::{ErrorKind, ErrorType, InputPin, OutputPin};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct GpioError(pub io::Error);

impl fmt::Display for GpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio error: {}", self.0)
    }
}

impl std::error::Error for GpioError {}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

impl From<io::Error> for GpioError {
    fn from(err: io::Error) -> Self {
        GpioError(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Direction {
    In,
    Out,
}

pub struct SysfsPin {
    root: PathBuf,
    line: u32,
    // True if this pin did the export and should undo it.
    exported: bool,
}

impl SysfsPin {
    // `line` is the kernel's gpio number, i.e. chip base + header pin.
    pub fn output(root: impl AsRef<Path>, line: u32) -> Result<Self, GpioError> {
        Self::open(root.as_ref(), line, Direction::Out)
    }

    pub fn input(root: impl AsRef<Path>, line: u32) -> Result<Self, GpioError> {
        Self::open(root.as_ref(), line, Direction::In)
    }

    fn open(root: &Path, line: u32, direction: Direction) -> Result<Self, GpioError> {
        let mut pin = SysfsPin {
            root: root.to_path_buf(),
            line,
            exported: false,
        };
        if !pin.dir().exists() {
            fs::write(root.join("export"), line.to_string())?;
            pin.exported = true;
        }
        // "low" sets the direction to out with the line already driven low,
        // so an output never glitches high while being configured.
        let dir = match direction {
            Direction::In => "in",
            Direction::Out => "low",
        };
        fs::write(pin.dir().join("direction"), dir)?;
        log::debug!("Opened gpio{line} as {direction:?}");
        Ok(pin)
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    fn dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.line))
    }

    fn write_value(&mut self, high: bool) -> Result<(), GpioError> {
        fs::write(self.dir().join("value"), if high { "1" } else { "0" })?;
        Ok(())
    }

    fn read_value(&self) -> Result<bool, GpioError> {
        let value = fs::read_to_string(self.dir().join("value"))?;
        match value.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(GpioError(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected value {other:?} for gpio{}", self.line),
            ))),
        }
    }
}

impl ErrorType for SysfsPin {
    type Error = GpioError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_value(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_value(true)
    }
}

impl InputPin for SysfsPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.read_value()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.read_value()?)
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        if !self.exported {
            return;
        }
        if let Err(err) = fs::write(self.root.join("unexport"), self.line.to_string()) {
            log::warn!("Failed to unexport gpio{}: {err}", self.line);
        }
    }
}
