//! Remote file operations layered on the serial protocol engine.
//!
//! Binary chunks travel as base64 with a CRC16 tag over the raw bytes.
//! Chunk writes and reads are retried on CRC mismatch, malformed response
//! or transient protocol failure, never on remote filesystem errors or
//! hard protocol errors. Exhausting the retries fails the call; the caller
//! still closes the remote handle.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};

use super::progress::{ProgressEvent, TransferOptions, TransferStats};
use crate::error::{Error, Result};
use crate::protocol::ProtocolEngine;
use crate::session::Session;
use crate::transport::Transport;
use crate::utils::crc16_ccitt;

/// Fixed backoff between chunk retries.
const CHUNK_RETRY_BACKOFF_MS: u64 = 50;

// =============================================================================
// Public Interface
// =============================================================================

/// Remote open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    fn token(self) -> &'static str {
        match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
        }
    }
}

/// Remote file metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// One remote directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// The file transfer protocol, borrowing the engine and session for the
/// duration of the operation. Injected code uploads use a hex address
/// string (`0x20001000`) as the path; the device maps address paths to raw
/// memory.
pub struct RemoteFs<'e, T: Transport> {
    engine: &'e mut ProtocolEngine<T>,
    session: &'e mut Session,
}

impl<'e, T: Transport> RemoteFs<'e, T> {
    pub fn new(engine: &'e mut ProtocolEngine<T>, session: &'e mut Session) -> Self {
        RemoteFs { engine, session }
    }

    // -------------------------------------------------------------------------
    // Primitive operations
    // -------------------------------------------------------------------------

    /// Open a remote file, returning the device handle.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32> {
        let cmd = format!("--cmd fopen --path {} --mode {}", path, mode.token());
        let payload = self.engine.send_command(self.session, &cmd)?.expect_ok()?;
        parse_kv(&payload, "handle")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Device(format!("open reply carried no handle: {}", payload)))
    }

    /// Write one chunk through an open handle. The device checks the CRC
    /// of the raw bytes and reports a mismatch as a retryable failure.
    pub fn write_chunk(&mut self, handle: u32, bytes: &[u8]) -> Result<()> {
        let crc = crc16_ccitt(bytes);
        let cmd = format!(
            "--cmd fwrite --handle {} --len {} --crc 0x{:04X} --data {}",
            handle,
            bytes.len(),
            crc,
            BASE64.encode(bytes)
        );
        let resp = self.engine.send_command(self.session, &cmd)?;
        if resp.ok {
            return Ok(());
        }
        if resp.payload.to_lowercase().contains("crc") {
            Err(Error::IntegrityMismatch {
                expected: crc,
                actual: crate::protocol::wire::parse_hex_token(&resp.payload)
                    .map(|v| v as u16)
                    .unwrap_or(0),
                context: format!("chunk write on handle {}", handle),
            })
        } else {
            Err(Error::Device(resp.payload))
        }
    }

    /// Read up to `max_len` bytes from an open handle. `Ok(None)` is the
    /// explicit end of the stream (EOF marker or zero length).
    pub fn read_chunk(&mut self, handle: u32, max_len: usize) -> Result<Option<Vec<u8>>> {
        let cmd = format!("--cmd fread --handle {} --len {}", handle, max_len);
        let payload = self.engine.send_command(self.session, &cmd)?.expect_ok()?;

        let trimmed = payload.trim();
        if trimmed.eq_ignore_ascii_case("eof") {
            return Ok(None);
        }
        let len: usize = parse_kv(trimmed, "len")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::ProtocolTimeout {
                attempts: 1,
                last_response: payload.clone(),
            })?;
        if len == 0 {
            return Ok(None);
        }

        let data = parse_kv(trimmed, "data").ok_or_else(|| Error::ProtocolTimeout {
            attempts: 1,
            last_response: payload.clone(),
        })?;
        let bytes = BASE64.decode(data).map_err(|_| Error::ProtocolTimeout {
            attempts: 1,
            last_response: payload.clone(),
        })?;
        if bytes.len() != len {
            return Err(Error::ProtocolTimeout {
                attempts: 1,
                last_response: payload.clone(),
            });
        }

        // The CRC tag is optional on reads; verify when present.
        if let Some(tag) = parse_kv(trimmed, "crc") {
            let reported = tag
                .strip_prefix("0x")
                .or_else(|| tag.strip_prefix("0X"))
                .and_then(|h| u16::from_str_radix(h, 16).ok());
            if let Some(reported) = reported {
                let actual = crc16_ccitt(&bytes);
                if actual != reported {
                    return Err(Error::IntegrityMismatch {
                        expected: reported,
                        actual,
                        context: format!("chunk read on handle {}", handle),
                    });
                }
            }
        }
        Ok(Some(bytes))
    }

    /// Close a remote handle.
    pub fn close(&mut self, handle: u32) -> Result<()> {
        let cmd = format!("--cmd fclose --handle {}", handle);
        self.engine
            .send_command(self.session, &cmd)?
            .expect_ok()
            .map(|_| ())
    }

    /// Stat a remote path.
    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let cmd = format!("--cmd fstat --path {}", path);
        let payload = self.engine.send_command(self.session, &cmd)?.expect_ok()?;
        let size = parse_kv(&payload, "size")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Device(format!("stat reply carried no size: {}", payload)))?;
        let is_dir = parse_kv(&payload, "type").map_or(false, |t| t == "dir");
        Ok(FileStat { size, is_dir })
    }

    /// List a remote directory. Entries come back one per line as
    /// `<f|d> <size> <name>`.
    pub fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let cmd = format!("--cmd fls --path {}", path);
        let payload = self.engine.send_command(self.session, &cmd)?.expect_ok()?;
        let mut entries = Vec::new();
        for line in payload.lines() {
            let mut parts = line.trim().splitn(3, char::is_whitespace);
            let kind = parts.next().unwrap_or("");
            let size = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let name = match parts.next() {
                Some(name) if !name.is_empty() => name.to_owned(),
                _ => continue,
            };
            entries.push(DirEntry {
                name,
                size,
                is_dir: kind == "d",
            });
        }
        Ok(entries)
    }

    /// Remove a remote file.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let cmd = format!("--cmd frm --path {}", path);
        self.engine
            .send_command(self.session, &cmd)?
            .expect_ok()
            .map(|_| ())
    }

    /// Create a remote directory.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let cmd = format!("--cmd fmkdir --path {}", path);
        self.engine
            .send_command(self.session, &cmd)?
            .expect_ok()
            .map(|_| ())
    }

    /// Rename a remote file.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let cmd = format!("--cmd frename --from {} --to {}", from, to);
        self.engine
            .send_command(self.session, &cmd)?
            .expect_ok()
            .map(|_| ())
    }

    /// Whole-file CRC16 and size as reported by the device. Older firmware
    /// may not implement the query.
    pub fn file_crc(&mut self, path: &str) -> Result<(u16, u64)> {
        let cmd = format!("--cmd fcrc --path {}", path);
        let payload = self.engine.send_command(self.session, &cmd)?.expect_ok()?;
        let crc = parse_kv(&payload, "crc")
            .and_then(|t| t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")).map(str::to_owned))
            .and_then(|h| u16::from_str_radix(&h, 16).ok());
        let size = parse_kv(&payload, "size").and_then(|v| v.parse().ok());
        match (crc, size) {
            (Some(crc), Some(size)) => Ok((crc, size)),
            _ => Err(Error::Device(format!(
                "file CRC reply was malformed: {}",
                payload
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Whole-file transfers
    // -------------------------------------------------------------------------

    /// Upload `data` to `remote`, chunked at the session chunk size, with
    /// per-chunk retries, optional whole-file verification and cooperative
    /// cancellation.
    pub fn upload(
        &mut self,
        data: &[u8],
        remote: &str,
        opts: &TransferOptions,
    ) -> Result<TransferStats> {
        let started = Instant::now();
        let mut stats = TransferStats::default();
        let chunk_size = self.session.chunk_size.max(1);
        let total = data.len() as u64;

        let handle = self.open(remote, OpenMode::Write)?;

        for chunk in data.chunks(chunk_size) {
            if opts.cancelled() {
                let _ = self.close(handle);
                return Err(Error::Cancelled);
            }
            if let Err(e) = self.write_chunk_with_retries(handle, chunk, &mut stats) {
                // The handle is still open on the device; close it before
                // surfacing the chunk failure.
                let _ = self.close(handle);
                return Err(e);
            }
            stats.bytes_moved += chunk.len() as u64;
            opts.notify(ProgressEvent {
                bytes_done: stats.bytes_moved,
                bytes_total: total,
                retries: stats.retries,
                crc_failures: stats.crc_failures,
            });
        }

        self.close(handle)?;

        if opts.verify && !data.is_empty() {
            self.verify_whole(remote, data)?;
        }

        stats.elapsed = started.elapsed();
        debug!("upload of {}: {}", remote, stats.report());
        Ok(stats)
    }

    /// Download `remote` in full. An empty remote file is rejected before
    /// any read handle is opened.
    pub fn download(
        &mut self,
        remote: &str,
        opts: &TransferOptions,
    ) -> Result<(Vec<u8>, TransferStats)> {
        let started = Instant::now();
        let mut stats = TransferStats::default();

        let stat = self.stat(remote)?;
        if stat.size == 0 {
            return Err(Error::Device(format!("file is empty: {}", remote)));
        }

        let chunk_size = self.session.chunk_size.max(1);
        let handle = self.open(remote, OpenMode::Read)?;
        let mut data = Vec::with_capacity(stat.size as usize);

        loop {
            if opts.cancelled() {
                let _ = self.close(handle);
                return Err(Error::Cancelled);
            }
            match self.read_chunk_with_retries(handle, chunk_size, &mut stats) {
                Ok(Some(bytes)) => {
                    stats.bytes_moved += bytes.len() as u64;
                    data.extend_from_slice(&bytes);
                    opts.notify(ProgressEvent {
                        bytes_done: stats.bytes_moved,
                        bytes_total: stat.size,
                        retries: stats.retries,
                        crc_failures: stats.crc_failures,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = self.close(handle);
                    return Err(e);
                }
            }
        }

        self.close(handle)?;

        if opts.verify && !data.is_empty() {
            self.verify_whole(remote, &data)?;
        }

        stats.elapsed = started.elapsed();
        debug!("download of {}: {}", remote, stats.report());
        Ok((data, stats))
    }

    // -------------------------------------------------------------------------
    // Private stuff
    // -------------------------------------------------------------------------

    fn write_chunk_with_retries(
        &mut self,
        handle: u32,
        chunk: &[u8],
        stats: &mut TransferStats,
    ) -> Result<()> {
        use retry::{delay, retry, OperationResult};

        let max_retries = self.engine.settings().max_retries.max(1);
        let mut first_attempt = true;
        let result = retry(
            delay::Fixed::from_millis(CHUNK_RETRY_BACKOFF_MS).take(max_retries - 1),
            || {
                if !first_attempt {
                    stats.retries += 1;
                }
                first_attempt = false;
                match self.write_chunk(handle, chunk) {
                    Ok(()) => OperationResult::Ok(()),
                    Err(e @ Error::IntegrityMismatch { .. }) => {
                        stats.crc_failures += 1;
                        OperationResult::Retry(e)
                    }
                    Err(e) if e.is_retryable() => OperationResult::Retry(e),
                    Err(e) => OperationResult::Err(e),
                }
            },
        );
        flatten_retry(result)
    }

    fn read_chunk_with_retries(
        &mut self,
        handle: u32,
        max_len: usize,
        stats: &mut TransferStats,
    ) -> Result<Option<Vec<u8>>> {
        use retry::{delay, retry, OperationResult};

        let max_retries = self.engine.settings().max_retries.max(1);
        let mut first_attempt = true;
        let result = retry(
            delay::Fixed::from_millis(CHUNK_RETRY_BACKOFF_MS).take(max_retries - 1),
            || {
                if !first_attempt {
                    stats.retries += 1;
                }
                first_attempt = false;
                match self.read_chunk(handle, max_len) {
                    Ok(v) => OperationResult::Ok(v),
                    Err(e @ Error::IntegrityMismatch { .. }) => {
                        stats.crc_failures += 1;
                        OperationResult::Retry(e)
                    }
                    Err(e) if e.is_retryable() => OperationResult::Retry(e),
                    Err(e) => OperationResult::Err(e),
                }
            },
        );
        flatten_retry(result)
    }

    /// Whole-transfer verification against the device-reported CRC16 and
    /// size. A device that cannot report a CRC (older firmware) degrades
    /// to a warning instead of failing the transfer.
    fn verify_whole(&mut self, remote: &str, local: &[u8]) -> Result<()> {
        let local_crc = crc16_ccitt(local);
        match self.file_crc(remote) {
            Ok((device_crc, device_size)) => {
                if device_size != local.len() as u64 {
                    return Err(Error::IntegrityMismatch {
                        expected: local_crc,
                        actual: device_crc,
                        context: format!(
                            "whole-file size of {}: local {} vs device {}",
                            remote,
                            local.len(),
                            device_size
                        ),
                    });
                }
                if device_crc != local_crc {
                    return Err(Error::IntegrityMismatch {
                        expected: local_crc,
                        actual: device_crc,
                        context: format!("whole-file CRC of {}", remote),
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    "device cannot report a whole-file CRC for {} ({}), skipping verification",
                    remote, e
                );
                Ok(())
            }
        }
    }
}

fn flatten_retry<R>(result: std::result::Result<R, retry::Error<Error>>) -> Result<R> {
    match result {
        Ok(v) => Ok(v),
        Err(retry::Error::Operation { error, .. }) => Err(error),
        Err(retry::Error::Internal(msg)) => Err(Error::Device(msg)),
    }
}

/// Find `key=value` in a whitespace-separated payload.
fn parse_kv<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    payload
        .split_whitespace()
        .find_map(|token| token.strip_prefix(key).and_then(|r| r.strip_prefix('=')))
        .filter(|v| !v.is_empty())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Settings, SettingsBuilder};
    use crate::transfer::progress::CancelToken;
    use crate::transport::testing::MockTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine_stream(engine: &ProtocolEngine<MockTransport>) -> String {
        engine.transport_for_tests().command_stream()
    }

    fn fast_settings() -> Settings {
        SettingsBuilder::new()
            .command_timeout(Duration::from_millis(40))
            .inter_chunk_delay(Duration::from_millis(0))
            .finalize()
    }

    fn engine(link: MockTransport) -> ProtocolEngine<MockTransport> {
        ProtocolEngine::new(link, fast_settings())
    }

    #[test]
    fn upload_300_bytes_in_two_chunks() {
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(256, 32);
        let data = vec![0xA5_u8; 300];
        let (tx, rx) = mpsc::channel();
        let opts = TransferOptions {
            progress: Some(tx),
            ..Default::default()
        };

        let stats = RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "/patch/blob.bin", &opts)
            .unwrap();

        assert_eq!(stats.bytes_moved, 300);
        assert_eq!(stats.retries, 0);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes_done, 256);
        assert_eq!(events[1].bytes_done, 300);
        assert!(events[0].bytes_done < events[1].bytes_done);
    }

    #[test]
    fn upload_chunk_sizes_follow_session() {
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(256, 32);
        let data = vec![1_u8; 300];
        RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "0x20001000", &TransferOptions::default())
            .unwrap();

        let stream = engine_stream(&engine);
        assert!(stream.contains("--len 256"));
        assert!(stream.contains("--len 44"));
        assert!(stream.contains("fclose"));
    }

    #[test]
    fn crc_mismatch_resolved_on_second_attempt() {
        let link = MockTransport::new()
            .reply("[OK] handle=2\n[END]\n")
            .reply("[ERR] crc mismatch, got 0x1234\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);
        let data = vec![7_u8; 32];

        let stats = RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "/tmp/x", &TransferOptions::default())
            .unwrap();
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.crc_failures, 1);
    }

    #[test]
    fn three_crc_mismatches_exhaust_retries() {
        let link = MockTransport::new()
            .reply("[OK] handle=2\n[END]\n")
            .reply("[ERR] crc mismatch\n[END]\n")
            .reply("[ERR] crc mismatch\n[END]\n")
            .reply("[ERR] crc mismatch\n[END]\n")
            .reply("[OK]\n[END]\n"); // the close after failure
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);
        let data = vec![7_u8; 32];

        let err = RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "/tmp/x", &TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));

        // The remote handle was closed even though the call failed.
        let stream = engine_stream(&engine);
        assert!(stream.contains("fclose"));
    }

    #[test]
    fn filesystem_error_is_not_retried() {
        let link = MockTransport::new()
            .reply("[OK] handle=2\n[END]\n")
            .reply("[ERR] no space left on device\n[END]\n")
            .reply("[OK]\n[END]\n"); // close
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);

        let err = RemoteFs::new(&mut engine, &mut session)
            .upload(&[1, 2, 3], "/tmp/x", &TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        // Exactly one write attempt: fopen, fwrite, fclose.
        let writes = engine_stream(&engine);
        assert_eq!(writes.matches("fwrite").count(), 1);
    }

    #[test]
    fn empty_download_fails_before_opening() {
        let link = MockTransport::new().reply("[OK] size=0 type=file\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);

        let err = RemoteFs::new(&mut engine, &mut session)
            .download("/log/empty.txt", &TransferOptions::default())
            .unwrap_err();
        match err {
            Error::Device(msg) => assert!(msg.contains("file is empty")),
            other => panic!("unexpected: {:?}", other),
        }
        let stream = engine_stream(&engine);
        assert!(!stream.contains("fopen"));
    }

    #[test]
    fn download_reassembles_chunks() {
        let part1 = BASE64.encode(b"hello ");
        let part2 = BASE64.encode(b"world");
        let crc1 = crc16_ccitt(b"hello ");
        let crc2 = crc16_ccitt(b"world");
        let link = MockTransport::new()
            .reply("[OK] size=11 type=file\n[END]\n")
            .reply("[OK] handle=4\n[END]\n")
            .reply(&format!("[OK] len=6 crc=0x{:04X} data={}\n[END]\n", crc1, part1))
            .reply(&format!("[OK] len=5 crc=0x{:04X} data={}\n[END]\n", crc2, part2))
            .reply("[OK] eof\n[END]\n")
            .reply("[OK]\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);

        let (data, stats) = RemoteFs::new(&mut engine, &mut session)
            .download("/log/boot.txt", &TransferOptions::default())
            .unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(stats.bytes_moved, 11);
    }

    #[test]
    fn cancellation_closes_handle_and_reports_cancelled() {
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n"); // the close
        let mut engine = engine(link);
        let mut session = Session::new(16, 32);
        let cancel = CancelToken::new();
        cancel.cancel();
        let opts = TransferOptions {
            cancel: Some(cancel),
            ..Default::default()
        };

        let err = RemoteFs::new(&mut engine, &mut session)
            .upload(&[0_u8; 64], "/tmp/x", &opts)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(engine_stream(&engine).contains("fclose"));
    }

    #[test]
    fn verify_mismatch_is_integrity_error() {
        let data = b"payload".to_vec();
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK] crc=0xBEEF size=7\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);
        let opts = TransferOptions {
            verify: true,
            ..Default::default()
        };

        let err = RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "/tmp/x", &opts)
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));
    }

    #[test]
    fn verify_degrades_to_warning_without_device_crc() {
        let data = b"payload".to_vec();
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[ERR] unsupported query\n[END]\n");
        let mut engine = engine(link);
        let mut session = Session::new(64, 32);
        let opts = TransferOptions {
            verify: true,
            ..Default::default()
        };

        // Must succeed despite the device lacking the CRC query.
        RemoteFs::new(&mut engine, &mut session)
            .upload(&data, "/tmp/x", &opts)
            .unwrap();
    }

}
