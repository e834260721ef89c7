//! The serial protocol engine: command exchanges and the operations built
//! on top of them.
//!
//! An exchange clears the input buffer, writes one namespaced command line
//! (optionally chunked with a small delay for slow receivers), then polls
//! the link until the explicit end marker shows up or the timeout expires.
//! A response is accepted only if it carries an `[OK]`/`[ERR]` tag and its
//! payload shows no interleaved device-log line; anything else is retried
//! a bounded number of times with a fixed backoff. A reply asking for
//! interactive mode triggers one automatic mode entry plus a single
//! resend, which is itself not retried.

use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info, warn};

use super::state_machine;
use super::wire::{self, PatchMode, Response};
use crate::error::{Error, Result};
use crate::inject::Slot;
use crate::session::{DeviceMode, Session};
use crate::settings::Settings;
use crate::transport::Transport;
use crate::utils;

/// Commands longer than this are written in chunks when an inter-chunk
/// delay is configured.
const CMD_CHUNK_BYTES: usize = 64;

/// Pause between polls of the input buffer while waiting for a response.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fixed backoff between retries of one exchange.
const RETRY_BACKOFF_MS: u64 = 100;

/// Smallest echo-probe payload; also the floor of the recommendation.
const ECHO_PROBE_FLOOR: usize = 16;

/// The probe stops doubling past this payload size.
const ECHO_PROBE_CEILING: usize = 8192;

/// The recommended chunk size is this fraction of the largest echo size
/// that worked. Empirical, not a contract.
const CHUNK_RECOMMEND_NUM: usize = 3;
const CHUNK_RECOMMEND_DEN: usize = 4;

// =============================================================================
// Public Interface
// =============================================================================

/// Scope of an unpatch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpatchScope {
    /// Remove the redirect in one comparator slot.
    Slot(usize),
    /// Remove every active redirect.
    All,
}

/// Structured device information out of the info query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Firmware build timestamp, verbatim.
    pub build: String,
    /// Bytes of patch RAM currently in use.
    pub used_bytes: u32,
    pub active_slots: usize,
    pub total_slots: usize,
    pub slots: Vec<Slot>,
}

impl DeviceInfo {
    /// Parse the multi-line key:value info payload.
    fn parse(payload: &str) -> Result<DeviceInfo> {
        let mut build = String::new();
        let mut used_bytes = 0;
        let mut active_slots = 0;
        let mut total_slots = 0;
        let mut slots = Vec::new();

        for line in payload.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Build:") {
                build = rest.trim().to_owned();
            } else if let Some(rest) = line.strip_prefix("Used:") {
                used_bytes = rest
                    .split_whitespace()
                    .next()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("Slots:") {
                if let Some((active, total)) = rest.trim().split_once('/') {
                    active_slots = active.trim().parse().unwrap_or(0);
                    total_slots = total.trim().parse().unwrap_or(0);
                }
            } else if let Some(slot) = Slot::parse_line(line) {
                slots.push(slot);
            }
        }

        if total_slots == 0 && slots.is_empty() {
            return Err(Error::Device(format!(
                "malformed info response: {}",
                payload
            )));
        }
        slots.sort_by_key(|s| s.id);
        Ok(DeviceInfo {
            build,
            used_bytes,
            active_slots,
            total_slots,
            slots,
        })
    }
}

/// The protocol engine: owns the transport and issues exchanges against a
/// session passed by reference into every operation.
pub struct ProtocolEngine<T: Transport> {
    transport: T,
    settings: Settings,
}

impl<T: Transport> ProtocolEngine<T> {
    pub fn new(transport: T, settings: Settings) -> Self {
        ProtocolEngine {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub(crate) fn transport_for_tests(&self) -> &T {
        &self.transport
    }

    // -------------------------------------------------------------------------
    // Mode management
    // -------------------------------------------------------------------------

    /// Probe the link and enter interactive mode when the device offers
    /// it. A no-op when the session is already interactive.
    pub fn enter_interactive_mode(&mut self, session: &mut Session) -> Result<()> {
        if session.mode.is_interactive() {
            return Ok(());
        }
        let mode = state_machine::factory().run(&mut self.transport)?;
        info!("link mode detected: {:?}", mode);
        session.mode = mode;
        Ok(())
    }

    /// Leave interactive mode. Callers invoke this unconditionally as
    /// cleanup, so it is a no-op success when the session is not
    /// interactive.
    pub fn exit_interactive_mode(&mut self, session: &mut Session) -> Result<()> {
        if !session.mode.is_interactive() {
            return Ok(());
        }
        self.send_command(session, wire::DETACH_CMD)?.expect_ok()?;
        session.mode = DeviceMode::Unknown;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Command exchanges
    // -------------------------------------------------------------------------

    /// Send a command with the session defaults for timeout and retries.
    pub fn send_command(&mut self, session: &mut Session, cmd: &str) -> Result<Response> {
        let timeout = self.settings.command_timeout;
        let max_retries = self.settings.max_retries;
        self.send_command_with(session, cmd, timeout, max_retries)
    }

    /// Send a command, retrying incomplete or malformed responses up to
    /// `max_retries` total attempts with a fixed backoff. The namespace
    /// token is prefixed automatically.
    pub fn send_command_with(
        &mut self,
        session: &mut Session,
        cmd: &str,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Response> {
        let line = namespaced(cmd);
        let resp = self.exchange_with_retries(session, &line, timeout, max_retries)?;

        if !resp.ok && wire::is_unknown_command(&resp.payload) {
            // The device wants us attached first. Enter interactive mode
            // once and resend once; the resend is not itself retried.
            info!("device requested interactive mode; attaching and resending");
            session.mode = DeviceMode::Unknown;
            self.enter_interactive_mode(session)?;
            return self.exchange(session, &line, timeout);
        }
        Ok(resp)
    }

    fn exchange_with_retries(
        &mut self,
        session: &mut Session,
        line: &str,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Response> {
        use retry::{delay, retry, OperationResult};

        let result = retry(
            delay::Fixed::from_millis(RETRY_BACKOFF_MS).take(max_retries.saturating_sub(1)),
            || match self.exchange(session, line, timeout) {
                Ok(resp) => OperationResult::Ok(resp),
                Err(e) if e.is_retryable() => OperationResult::Retry(e),
                Err(e) => OperationResult::Err(e),
            },
        );

        match result {
            Ok(resp) => Ok(resp),
            Err(retry::Error::Operation { error, tries, .. }) => match error {
                Error::ProtocolTimeout { last_response, .. } => {
                    if last_response.trim().is_empty() {
                        Err(Error::ProtocolTimeout {
                            attempts: tries as usize,
                            last_response,
                        })
                    } else {
                        // The device said something every time but never a
                        // clean tagged response. Fall back to the keyword
                        // heuristic instead of raising.
                        warn!(
                            "no clean response after {} attempts, parsing heuristically",
                            tries
                        );
                        Ok(wire::parse_response(&last_response))
                    }
                }
                other => Err(other),
            },
            Err(retry::Error::Internal(msg)) => Err(Error::Device(msg)),
        }
    }

    /// One raw exchange: clear input, write the command, poll for the end
    /// marker, parse and check completeness.
    fn exchange(&mut self, session: &mut Session, line: &str, timeout: Duration) -> Result<Response> {
        self.transport.clear_input()?;
        self.write_chunked(line)?;

        let raw = match self.read_until_end(timeout) {
            Ok(raw) => raw,
            Err(Error::ProtocolTimeout { last_response, .. }) => {
                if !last_response.is_empty() {
                    session.diag.push(line.trim_end(), &last_response);
                }
                return Err(Error::ProtocolTimeout {
                    attempts: 1,
                    last_response,
                });
            }
            Err(e) => return Err(e),
        };

        session.diag.push(line.trim_end(), &raw);
        utils::debug_hexdump(raw.as_bytes());

        if !wire::has_status_tag(&raw) {
            return Err(Error::ProtocolTimeout {
                attempts: 1,
                last_response: raw,
            });
        }
        let resp = wire::parse_response(&raw);
        if wire::has_interleaved_log(&resp.payload) {
            debug!("response interleaved with device log, retrying");
            return Err(Error::ProtocolTimeout {
                attempts: 1,
                last_response: raw,
            });
        }
        Ok(resp)
    }

    fn write_chunked(&mut self, line: &str) -> Result<()> {
        let bytes = line.as_bytes();
        let delay = self.settings.inter_chunk_delay;
        if delay.as_nanos() == 0 || bytes.len() <= CMD_CHUNK_BYTES {
            return self.transport.write_all(bytes);
        }
        for chunk in bytes.chunks(CMD_CHUNK_BYTES) {
            self.transport.write_all(chunk)?;
            thread::sleep(delay);
        }
        Ok(())
    }

    fn read_until_end(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut collected: Vec<u8> = Vec::new();
        loop {
            let available = self.transport.bytes_to_read()?;
            if available > 0 {
                let mut buf = vec![0_u8; available.min(4096)];
                let n = self.transport.read_available(&mut buf)?;
                collected.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&collected);
                if text.contains(wire::END_MARKER) {
                    return Ok(text.into_owned());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::ProtocolTimeout {
                    attempts: 1,
                    last_response: String::from_utf8_lossy(&collected).into_owned(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    // -------------------------------------------------------------------------
    // Built-on operations
    // -------------------------------------------------------------------------

    /// Liveness check.
    pub fn ping(&mut self, session: &mut Session) -> Result<()> {
        self.send_command(session, "--cmd ping")?
            .expect_ok()
            .map(|_| ())
    }

    /// Structured info query: build timestamp, used-memory counter and the
    /// comparator slot table.
    pub fn query_info(&mut self, session: &mut Session) -> Result<DeviceInfo> {
        let payload = self.send_command(session, "--cmd info")?.expect_ok()?;
        DeviceInfo::parse(&payload)
    }

    /// Ask the device to allocate `size` bytes of patch RAM; the address
    /// comes back as a hex token in the OK message.
    pub fn alloc(&mut self, session: &mut Session, size: u32) -> Result<u32> {
        let resp = self.send_command(session, &format!("--cmd alloc --size {}", size))?;
        if !resp.ok {
            return Err(Error::ResourceExhausted(resp.payload));
        }
        wire::parse_hex_token(&resp.payload).ok_or_else(|| {
            Error::Device(format!("allocate reply carried no address: {}", resp.payload))
        })
    }

    /// Install a redirect from `original` to `target` in the requested
    /// mode. This is the single comparator-install call site; the mode
    /// enum is matched exhaustively here and nowhere else.
    pub fn install_patch(
        &mut self,
        session: &mut Session,
        original: u32,
        target: u32,
        mode: PatchMode,
    ) -> Result<()> {
        let mode_token = match mode {
            PatchMode::Direct => "direct",
            PatchMode::Trampoline => "trampoline",
            PatchMode::DebugMonitor => "dbgmon",
        };
        let cmd = format!(
            "--cmd patch --orig 0x{:08X} --target 0x{:08X} --mode {}",
            original, target, mode_token
        );
        self.send_command(session, &cmd)?.expect_ok().map(|_| ())
    }

    /// Remove one redirect, or all of them.
    pub fn unpatch(&mut self, session: &mut Session, scope: UnpatchScope) -> Result<()> {
        let cmd = match scope {
            UnpatchScope::Slot(id) => format!("--cmd unpatch --slot {}", id),
            UnpatchScope::All => "--cmd unpatch --all".to_owned(),
        };
        self.send_command(session, &cmd)?.expect_ok().map(|_| ())
    }

    /// Doubling-size echo probe: find the largest payload the device can
    /// echo back intact and recommend a fraction of it as the transfer
    /// chunk size. Updates the session.
    pub fn probe_chunk_size(&mut self, session: &mut Session) -> Result<usize> {
        let timeout = self.settings.command_timeout;
        let mut size = ECHO_PROBE_FLOOR;
        let mut best = 0_usize;

        while size <= ECHO_PROBE_CEILING {
            let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let encoded = BASE64.encode(&pattern);
            let cmd = format!("--cmd echo --len {} --data {}", size, encoded);
            match self.send_command_with(session, &cmd, timeout, 1) {
                Ok(resp) if resp.ok && resp.payload.contains(&encoded) => {
                    debug!("echo probe ok at {} bytes", size);
                    best = size;
                    size *= 2;
                }
                Ok(_) => break,
                Err(Error::ProtocolTimeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        if best == 0 {
            return Err(Error::Device(
                "echo probe failed at the minimum size".into(),
            ));
        }
        let recommended = (best * CHUNK_RECOMMEND_NUM / CHUNK_RECOMMEND_DEN).max(ECHO_PROBE_FLOOR);
        info!(
            "largest working echo size {} bytes, recommending {} byte chunks",
            best, recommended
        );
        session.chunk_size = recommended;
        Ok(recommended)
    }
}

/// Prefix the namespace token unless the caller already did.
fn namespaced(cmd: &str) -> String {
    let cmd = cmd.trim();
    if cmd.starts_with(wire::NAMESPACE) {
        format!("{}\n", cmd)
    } else {
        format!("{} {}\n", wire::NAMESPACE, cmd)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
