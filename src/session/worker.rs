//! The per-device serial worker.
//!
//! One thread per connected device owns the transport, the protocol
//! engine and the session, and drains a request queue strictly serially:
//! no device operation ever runs on a caller's thread, and chunk
//! operations within one transfer stay ordered. Callers submit a unit of
//! work and block on its reply channel with an explicit timeout.
//!
//! Long transfers run synchronously end-to-end on the worker; progress
//! events flow out on a separate channel, and the caller-side
//! [`TransferHandle`] enforces the per-transfer inactivity timeout without
//! the worker's cooperation.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inject::{self, BatchOutcome, CompilerContext, InjectionOutcome, InjectionRequest};
use crate::protocol::{DeviceInfo, PatchMode, ProtocolEngine, UnpatchScope};
use crate::session::{ExchangeRecord, Session};
use crate::settings::Settings;
use crate::transfer::{CancelToken, ProgressEvent, RemoteFs, TransferOptions, TransferStats};
use crate::transport::Transport;

/// Upper bound a caller waits for any single unit of work; compiles and
/// long uploads stay well under it, and a worker stuck past it is treated
/// as gone.
const REPLY_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a finished transfer's result may lag behind its progress
/// channel closing.
const RESULT_LAG_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Public Interface
// =============================================================================

/// Handle to one device's worker thread. Dropping it shuts the worker
/// down.
pub struct DeviceWorker {
    tx: Sender<Request>,
    handle: Option<JoinHandle<()>>,
}

/// Caller-side handle to a transfer running on the worker: the progress
/// stream, the shared cancellation token and the pending result.
pub struct TransferHandle<R> {
    result: Receiver<Result<R>>,
    pub progress: Receiver<ProgressEvent>,
    pub cancel: CancelToken,
}

impl<R> TransferHandle<R> {
    /// Block until the transfer finishes, failing it when no progress
    /// event arrives within `inactivity_timeout`, independent of whether
    /// the worker is still blocked in a read. On inactivity the shared
    /// cancel flag is raised so the worker abandons the transfer at the
    /// next chunk boundary.
    pub fn wait(self, inactivity_timeout: Duration) -> Result<R> {
        loop {
            match self.result.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(Error::TransportUnavailable("device worker is gone".into()))
                }
            }
            match self.progress.recv_timeout(inactivity_timeout) {
                // Any progress re-arms the inactivity window.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel.cancel();
                    return Err(Error::ProtocolTimeout {
                        attempts: 1,
                        last_response: "transfer made no progress within the timeout".into(),
                    });
                }
                // The worker dropped its progress sender: the transfer is
                // over and the result is about to land.
                Err(RecvTimeoutError::Disconnected) => {
                    return match self.result.recv_timeout(RESULT_LAG_TIMEOUT) {
                        Ok(result) => result,
                        Err(_) => {
                            Err(Error::TransportUnavailable("device worker is gone".into()))
                        }
                    };
                }
            }
        }
    }
}

impl DeviceWorker {
    /// Spawn the worker thread for one device. The compiler context is
    /// optional: a worker without one serves everything except
    /// injections.
    pub fn spawn<T: Transport + 'static>(
        transport: T,
        settings: Settings,
        compiler: Option<CompilerContext>,
    ) -> Result<DeviceWorker> {
        let (tx, rx) = mpsc::channel();
        let session = Session::new(settings.chunk_size, settings.diag_log_capacity);
        let engine = ProtocolEngine::new(transport, settings);

        let handle = thread::Builder::new()
            .name("patchcom-device-worker".into())
            .spawn(move || worker_loop(engine, session, compiler, rx))
            .map_err(|e| Error::TransportUnavailable(format!("cannot spawn worker: {}", e)))?;

        Ok(DeviceWorker {
            tx,
            handle: Some(handle),
        })
    }

    pub fn ping(&self) -> Result<()> {
        self.submit(|reply| Request::Ping { reply })
    }

    pub fn query_info(&self) -> Result<DeviceInfo> {
        self.submit(|reply| Request::QueryInfo { reply })
    }

    pub fn enter_interactive_mode(&self) -> Result<()> {
        self.submit(|reply| Request::EnterInteractive { reply })
    }

    pub fn exit_interactive_mode(&self) -> Result<()> {
        self.submit(|reply| Request::ExitInteractive { reply })
    }

    /// Run the echo probe and adopt the recommended chunk size.
    pub fn probe_chunk_size(&self) -> Result<usize> {
        self.submit(|reply| Request::ProbeChunkSize { reply })
    }

    /// Start an upload on the worker. The returned handle carries the
    /// progress stream and the cancellation token.
    pub fn upload(
        &self,
        data: Vec<u8>,
        remote: impl Into<String>,
        verify: bool,
    ) -> Result<TransferHandle<TransferStats>> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let (progress_tx, progress_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let opts = TransferOptions {
            verify,
            progress: Some(progress_tx),
            cancel: Some(cancel.clone()),
        };
        self.send(Request::Upload {
            data,
            remote: remote.into(),
            opts,
            reply: reply_tx,
        })?;
        Ok(TransferHandle {
            result: reply_rx,
            progress: progress_rx,
            cancel,
        })
    }

    /// Start a download on the worker.
    pub fn download(
        &self,
        remote: impl Into<String>,
        verify: bool,
    ) -> Result<TransferHandle<(Vec<u8>, TransferStats)>> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let (progress_tx, progress_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let opts = TransferOptions {
            verify,
            progress: Some(progress_tx),
            cancel: Some(cancel.clone()),
        };
        self.send(Request::Download {
            remote: remote.into(),
            opts,
            reply: reply_tx,
        })?;
        Ok(TransferHandle {
            result: reply_rx,
            progress: progress_rx,
            cancel,
        })
    }

    /// Inject one function; blocks through both compile passes, the
    /// upload and the redirect install.
    pub fn inject(&self, request: InjectionRequest) -> Result<InjectionOutcome> {
        self.submit(|reply| Request::Inject {
            request,
            opts: TransferOptions::default(),
            reply,
        })
    }

    /// Inject every function of a fragment; per-target failures are
    /// reported inside the batch outcome.
    pub fn inject_many(
        &self,
        source: impl Into<String>,
        origin: Option<PathBuf>,
        mode: PatchMode,
    ) -> Result<BatchOutcome> {
        let source = source.into();
        self.submit(|reply| Request::InjectMany {
            source,
            origin,
            mode,
            opts: TransferOptions::default(),
            reply,
        })
    }

    pub fn unpatch(&self, scope: UnpatchScope) -> Result<()> {
        self.submit(|reply| Request::Unpatch { scope, reply })
    }

    /// Snapshot of the bounded raw-exchange ring for diagnostics.
    pub fn diagnostic_log(&self) -> Result<Vec<ExchangeRecord>> {
        self.submit(|reply| Request::DiagnosticLog { reply })
    }

    fn submit<R>(&self, build: impl FnOnce(Sender<Result<R>>) -> Request) -> Result<R> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(build(reply_tx))?;
        match reply_rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(Error::TransportUnavailable(
                "device worker did not reply".into(),
            )),
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| Error::TransportUnavailable("device worker is gone".into()))
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// One unit of work on the device queue. Each variant carries its own
/// typed reply channel.
enum Request {
    Ping {
        reply: Sender<Result<()>>,
    },
    QueryInfo {
        reply: Sender<Result<DeviceInfo>>,
    },
    EnterInteractive {
        reply: Sender<Result<()>>,
    },
    ExitInteractive {
        reply: Sender<Result<()>>,
    },
    ProbeChunkSize {
        reply: Sender<Result<usize>>,
    },
    Upload {
        data: Vec<u8>,
        remote: String,
        opts: TransferOptions,
        reply: Sender<Result<TransferStats>>,
    },
    Download {
        remote: String,
        opts: TransferOptions,
        reply: Sender<Result<(Vec<u8>, TransferStats)>>,
    },
    Inject {
        request: InjectionRequest,
        opts: TransferOptions,
        reply: Sender<Result<InjectionOutcome>>,
    },
    InjectMany {
        source: String,
        origin: Option<PathBuf>,
        mode: PatchMode,
        opts: TransferOptions,
        reply: Sender<Result<BatchOutcome>>,
    },
    Unpatch {
        scope: UnpatchScope,
        reply: Sender<Result<()>>,
    },
    DiagnosticLog {
        reply: Sender<Result<Vec<ExchangeRecord>>>,
    },
    Shutdown,
}

fn worker_loop<T: Transport>(
    mut engine: ProtocolEngine<T>,
    mut session: Session,
    compiler: Option<CompilerContext>,
    rx: Receiver<Request>,
) {
    info!("device worker started");
    while let Ok(request) = rx.recv() {
        match request {
            Request::Ping { reply } => {
                let result = engine.ping(&mut session);
                reply_and_track(reply, &mut session, result);
            }
            Request::QueryInfo { reply } => {
                let result = engine.query_info(&mut session);
                reply_and_track(reply, &mut session, result);
            }
            Request::EnterInteractive { reply } => {
                let result = engine.enter_interactive_mode(&mut session);
                reply_and_track(reply, &mut session, result);
            }
            Request::ExitInteractive { reply } => {
                let result = engine.exit_interactive_mode(&mut session);
                reply_and_track(reply, &mut session, result);
            }
            Request::ProbeChunkSize { reply } => {
                let result = engine.probe_chunk_size(&mut session);
                reply_and_track(reply, &mut session, result);
            }
            Request::Upload {
                data,
                remote,
                opts,
                reply,
            } => {
                let result = RemoteFs::new(&mut engine, &mut session).upload(&data, &remote, &opts);
                drop(opts);
                reply_and_track(reply, &mut session, result);
            }
            Request::Download {
                remote,
                opts,
                reply,
            } => {
                let result = RemoteFs::new(&mut engine, &mut session).download(&remote, &opts);
                drop(opts);
                reply_and_track(reply, &mut session, result);
            }
            Request::Inject {
                request,
                opts,
                reply,
            } => {
                let result = match compiler.as_ref() {
                    Some(ctx) => {
                        inject::inject_one(&mut engine, &mut session, ctx, &request, &opts)
                    }
                    None => Err(Error::ConfigNotFound(
                        "worker has no compiler context".into(),
                    )),
                };
                reply_and_track(reply, &mut session, result);
            }
            Request::InjectMany {
                source,
                origin,
                mode,
                opts,
                reply,
            } => {
                let result = match compiler.as_ref() {
                    Some(ctx) => inject::inject_many(
                        &mut engine,
                        &mut session,
                        ctx,
                        &source,
                        origin,
                        mode,
                        &opts,
                    ),
                    None => Err(Error::ConfigNotFound(
                        "worker has no compiler context".into(),
                    )),
                };
                reply_and_track(reply, &mut session, result);
            }
            Request::Unpatch { scope, reply } => {
                let result = inject::unpatch(&mut engine, &mut session, scope);
                reply_and_track(reply, &mut session, result);
            }
            Request::DiagnosticLog { reply } => {
                let entries = session.diag.entries().cloned().collect();
                let _ = reply.send(Ok(entries));
            }
            Request::Shutdown => break,
        }
    }
    debug!("device worker terminating");
}

/// Deliver a result to the caller; a vanished link additionally resets the
/// session, since its state no longer describes a connected device.
fn reply_and_track<R>(reply: Sender<Result<R>>, session: &mut Session, result: Result<R>) {
    if let Err(Error::TransportUnavailable(reason)) = &result {
        warn!("transport lost ({}), resetting session", reason);
        session.reset();
    }
    let _ = reply.send(result);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;
    use crate::transport::testing::MockTransport;

    fn fast_settings() -> Settings {
        SettingsBuilder::new()
            .command_timeout(Duration::from_millis(40))
            .inter_chunk_delay(Duration::from_millis(0))
            .finalize()
    }

    #[test]
    fn ping_round_trips_through_the_worker() {
        // Bump the level when debugging worker interactions.
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Warn, simplelog::Config::default());

        let link = MockTransport::new().reply("[OK] pong\n[END]\n");
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();
        worker.ping().unwrap();
    }

    #[test]
    fn requests_are_served_strictly_in_order() {
        let link = MockTransport::new()
            .reply("[OK] pong\n[END]\n")
            .reply(
                "[OK]\nBuild: Jul 10 2025\nUsed: 0 bytes\nSlots: 0/6\n\
                 Slot[0]: empty\n[END]\n",
            );
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();
        worker.ping().unwrap();
        let info = worker.query_info().unwrap();
        assert_eq!(info.total_slots, 6);
    }

    #[test]
    fn upload_streams_progress_to_the_caller() {
        let link = MockTransport::new()
            .reply("[OK] handle=1\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n")
            .reply("[OK]\n[END]\n");
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();

        let handle = worker.upload(vec![0xEE; 300], "0x20001000", false).unwrap();
        let stats = handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(stats.bytes_moved, 300);
    }

    #[test]
    fn stalled_transfer_hits_the_inactivity_timeout() {
        // The device never answers the open; no progress event ever
        // arrives and the caller-side inactivity timeout must fire even
        // though the worker is still blocked polling.
        let link = MockTransport::new();
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();

        let handle = worker.upload(vec![1_u8; 64], "0x20001000", false).unwrap();
        let err = handle.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout { .. }));
    }

    #[test]
    fn inject_without_compiler_context_is_rejected() {
        let link = MockTransport::new();
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();
        let err = worker
            .inject(InjectionRequest::new("uart_poll", "void uart_poll(void) {}"))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn diagnostic_log_snapshot_travels_out() {
        let link = MockTransport::new().reply("[OK] pong\n[END]\n");
        let worker = DeviceWorker::spawn(link, fast_settings(), None).unwrap();
        worker.ping().unwrap();
        let log = worker.diagnostic_log().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].command.contains("ping"));
    }
}
