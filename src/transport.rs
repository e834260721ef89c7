//! Byte-level transport under the serial protocol engine.
//!
//! The engine only needs timeout-bounded, half-duplex byte I/O, so it talks
//! to a narrow [`Transport`] trait instead of `serialport` directly. The
//! production implementation wraps an open serial port; unit tests script a
//! mock with canned responses.

use std::io::{Read, Write};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use crate::error::{Error, Result};
use crate::settings::Settings;

// =============================================================================
// Public Interface
// =============================================================================

/// Timeout-bounded byte I/O over a half-duplex link.
///
/// All methods map a vanished link to [`Error::TransportUnavailable`], which
/// the layers above treat as fatal and never retry.
pub trait Transport: Send {
    /// Write all of `bytes` to the link.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Number of bytes already received and waiting to be read.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Read whatever is available into `buf`, returning the count. Never
    /// blocks longer than the port's own byte timeout.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discard any unread input.
    fn clear_input(&mut self) -> Result<()>;

    /// Port name for diagnostics, when known.
    fn name(&self) -> Option<String>;
}

/// [`Transport`] over a configured, open serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open and configure the port named in `settings`, retrying a few
    /// times since USB serial devices are often slow to enumerate after
    /// plug-in.
    pub fn open(settings: &Settings) -> Result<Self> {
        use retry::{delay, retry_with_index};

        let path = settings
            .path
            .clone()
            .ok_or_else(|| Error::TransportUnavailable("no serial port configured".into()))?;

        let result = retry_with_index(
            delay::Fixed::from_millis(1000).take(4),
            |index| -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
                debug!("Trying to connect {}", index);
                serialport::new(&path, settings.baud_rate)
                    .data_bits(settings.data_bits)
                    .stop_bits(settings.stop_bits)
                    .parity(settings.parity)
                    .flow_control(settings.flow_control)
                    .open()
            },
        );

        match result {
            Ok(mut port) => {
                port.set_timeout(std::time::Duration::from_millis(50))
                    .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
                info!(
                    "Connected to {} at {} baud",
                    port.name().unwrap_or_else(|| path.clone()),
                    settings.baud_rate
                );
                Ok(SerialTransport { port })
            }
            Err(err) => {
                let detail = match err {
                    retry::Error::Operation {
                        error,
                        total_delay,
                        tries,
                    } => {
                        info!(
                            "Failed to open the port after {:?} and {} tries: {}",
                            total_delay, tries, error,
                        );
                        error.to_string()
                    }
                    retry::Error::Internal(msg) => msg,
                };
                Err(Error::TransportUnavailable(detail))
            }
        }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port
            .write_all(bytes)
            .map_err(|e| Error::TransportUnavailable(e.to_string()))
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| Error::TransportUnavailable(e.to_string()))
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A byte-timeout with nothing available is not an error at this
            // layer; the poll loop above owns the deadline.
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::TransportUnavailable(e.to_string())),
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| Error::TransportUnavailable(e.to_string()))
    }

    fn name(&self) -> Option<String> {
        self.port.name()
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// One scripted device reaction to a newline-terminated command write.
    pub(crate) enum ScriptItem {
        /// Bytes that become readable after the command is written.
        Reply(Vec<u8>),
        /// The device stays quiet; the poll loop will run into its timeout.
        Silence,
    }

    /// A scripted [`Transport`]: every newline-terminated write pops the
    /// next script item and queues its bytes for reading. Writes are
    /// recorded for assertions.
    pub(crate) struct MockTransport {
        script: VecDeque<ScriptItem>,
        pending: Vec<u8>,
        pub writes: Vec<Vec<u8>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                script: VecDeque::new(),
                pending: Vec::new(),
                writes: Vec::new(),
            }
        }

        pub fn reply(mut self, text: &str) -> Self {
            self.script.push_back(ScriptItem::Reply(text.as_bytes().to_vec()));
            self
        }

        pub fn silence(mut self) -> Self {
            self.script.push_back(ScriptItem::Silence);
            self
        }

        /// The reassembled command stream (chunked writes joined).
        pub fn command_stream(&self) -> String {
            let mut all = String::new();
            for w in &self.writes {
                all.push_str(&String::from_utf8_lossy(w));
            }
            all
        }
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.writes.push(bytes.to_vec());
            if bytes.ends_with(b"\n") {
                match self.script.pop_front() {
                    Some(ScriptItem::Reply(bytes)) => self.pending.extend_from_slice(&bytes),
                    Some(ScriptItem::Silence) | None => {}
                }
            }
            Ok(())
        }

        fn bytes_to_read(&mut self) -> Result<usize> {
            Ok(self.pending.len())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn clear_input(&mut self) -> Result<()> {
            self.pending.clear();
            Ok(())
        }

        fn name(&self) -> Option<String> {
            Some("mock".into())
        }
    }
}
