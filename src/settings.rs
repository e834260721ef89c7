//! Settings related to the patchcom serial link, transfer tuning and the
//! external toolchain.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::path::PathBuf;
use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings related to the serial port, the transfer protocol
/// tuning knobs and the external toolchain used by `patchcom`, and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// Transfer chunk size in bytes. The echo probe can revise this at
    /// runtime for a device whose receive buffer turns out smaller.
    pub chunk_size: usize,
    /// Bounded retry count for protocol exchanges and transfer chunks.
    pub max_retries: usize,
    /// Per-exchange timeout while waiting for a complete response.
    pub command_timeout: Duration,
    /// Delay inserted between command chunks for slow receivers. Zero
    /// disables chunked command writes.
    pub inter_chunk_delay: Duration,
    /// Capacity of the bounded diagnostic ring log of raw exchanges.
    pub diag_log_capacity: usize,

    /// Directory holding the cross toolchain binaries. When not set, the
    /// tools are located on the search path.
    pub toolchain_dir: Option<PathBuf>,
    /// Path to the build-commands database used to recover compile flags
    /// for patch fragments.
    pub build_commands: Option<PathBuf>,
    /// Path to the firmware ELF image used for symbol resolution and Thumb
    /// classification.
    pub firmware_elf: Option<PathBuf>,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                chunk_size: 256,
                max_retries: 3,
                command_timeout: Duration::from_millis(2_000),
                inter_chunk_delay: Duration::from_millis(5),
                diag_log_capacity: 256,
                toolchain_dir: None,
                build_commands: None,
                firmware_elf: None,
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Set the transfer chunk size in bytes
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.settings.chunk_size = chunk_size;
        self
    }

    /// Set the bounded retry count for exchanges and transfer chunks
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    /// Set the per-exchange response timeout
    pub fn command_timeout(mut self, command_timeout: Duration) -> Self {
        self.settings.command_timeout = command_timeout;
        self
    }

    /// Set the delay between command chunks for slow receivers
    pub fn inter_chunk_delay(mut self, inter_chunk_delay: Duration) -> Self {
        self.settings.inter_chunk_delay = inter_chunk_delay;
        self
    }

    /// Set the capacity of the diagnostic ring log
    pub fn diag_log_capacity(mut self, diag_log_capacity: usize) -> Self {
        self.settings.diag_log_capacity = diag_log_capacity;
        self
    }

    /// Set the directory holding the cross toolchain binaries
    pub fn toolchain_dir(mut self, toolchain_dir: impl Into<PathBuf>) -> Self {
        self.settings.toolchain_dir = Some(toolchain_dir.into());
        self
    }

    /// Set the path to the build-commands database
    pub fn build_commands(mut self, build_commands: impl Into<PathBuf>) -> Self {
        self.settings.build_commands = Some(build_commands.into());
        self
    }

    /// Set the path to the firmware ELF image
    pub fn firmware_elf(mut self, firmware_elf: impl Into<PathBuf>) -> Self {
        self.settings.firmware_elf = Some(firmware_elf.into());
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_default() {
        let settings = SettingsBuilder::new().finalize();
        assert_eq!(settings.path, None);
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.flow_control, FlowControl::None);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.chunk_size, 256);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.command_timeout, Duration::from_millis(2_000));
        assert_eq!(settings.toolchain_dir, None);
        assert_eq!(settings.build_commands, None);
        assert_eq!(settings.firmware_elf, None);
    }

    #[test]
    fn path() {
        let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
        assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
    }

    #[test]
    fn baud_rate() {
        let baud_rate = 230_400;
        let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
        assert_eq!(settings.baud_rate, baud_rate);
    }

    #[test]
    fn chunk_size() {
        let settings = SettingsBuilder::new().chunk_size(64).finalize();
        assert_eq!(settings.chunk_size, 64);
    }

    #[test]
    fn max_retries() {
        let settings = SettingsBuilder::new().max_retries(5).finalize();
        assert_eq!(settings.max_retries, 5);
    }

    #[test]
    fn command_timeout() {
        let settings = SettingsBuilder::new()
            .command_timeout(Duration::from_secs(10))
            .finalize();
        assert_eq!(settings.command_timeout, Duration::from_secs(10));
    }

    #[test]
    fn toolchain_dir() {
        let settings = SettingsBuilder::new()
            .toolchain_dir("/opt/gcc-arm/bin")
            .finalize();
        assert_eq!(
            settings.toolchain_dir.unwrap(),
            PathBuf::from("/opt/gcc-arm/bin")
        );
    }

    #[test]
    fn firmware_elf() {
        let settings = SettingsBuilder::new()
            .firmware_elf("build/app.elf")
            .finalize();
        assert_eq!(settings.firmware_elf.unwrap(), PathBuf::from("build/app.elf"));
    }
}
