//! Single- and multi-function injection, and unpatching.
//!
//! An injection runs as a sequence of stages; each stage's failure aborts
//! that injection immediately with a stage-tagged error. Multi-function
//! injection turns every candidate into an independent single injection
//! and keeps going past per-target failures, aggregating the outcomes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use super::slots::{self, SlotPlan};
use crate::compiler::{
    BuildConfig, CompiledPatch, PatchCompiler, SymbolTable, Toolchain, PLACEHOLDER_BASE,
};
use crate::error::{Error, Result};
use crate::protocol::{PatchMode, ProtocolEngine, UnpatchScope};
use crate::session::{InjectionRecord, Session};
use crate::transfer::{RemoteFs, TransferOptions};
use crate::transport::Transport;

/// Fixed margin added to the allocation request on top of the pass-1 code
/// size, covering the device's per-buffer header.
const SCRATCH_HEADER_MARGIN: u32 = 32;

/// Injected code is placed on this alignment; the slack between the
/// allocated and the aligned address becomes the upload offset.
const CODE_ALIGN: u32 = 8;

// =============================================================================
// Public Interface
// =============================================================================

/// Everything the workflow needs to drive the compiler pipeline.
pub struct CompilerContext {
    pub tools: Toolchain,
    pub firmware: Arc<SymbolTable>,
    pub config: BuildConfig,
}

/// One requested function injection.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    /// Firmware function to redirect.
    pub target: String,
    /// Patch fragment source text.
    pub source: String,
    /// Where the fragment originally lives, for extra include paths.
    pub origin: Option<PathBuf>,
    /// Explicit redirect-target symbol in the compiled patch; when absent
    /// the workflow matches against the target's name.
    pub entry: Option<String>,
    pub mode: PatchMode,
}

impl InjectionRequest {
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        InjectionRequest {
            target: target.into(),
            source: source.into(),
            origin: None,
            entry: None,
            mode: PatchMode::Direct,
        }
    }

    pub fn origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn mode(mut self, mode: PatchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// The record of one successful injection.
#[derive(Debug, Clone)]
pub struct InjectionOutcome {
    pub target_name: String,
    pub target_address: u32,
    pub slot: usize,
    pub injected_name: String,
    pub injected_address: u32,
    pub mode: PatchMode,
    pub elapsed: Duration,
}

/// Aggregated result of a multi-function injection.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Per-target outcome, in injection order.
    pub results: Vec<(String, Result<InjectionOutcome>)>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchOutcome {
    /// A batch where at least one target succeeded and at least one
    /// failed.
    pub fn is_partial(&self) -> bool {
        self.succeeded > 0 && self.failed > 0
    }
}

/// Inject one function: resolve, pick a slot, compile twice, upload,
/// install the redirect and record it on the session.
pub fn inject_one<T: Transport>(
    engine: &mut ProtocolEngine<T>,
    session: &mut Session,
    ctx: &CompilerContext,
    request: &InjectionRequest,
    opts: &TransferOptions,
) -> Result<InjectionOutcome> {
    let started = Instant::now();

    // The firmware table is cached on the session for the connection's
    // lifetime; resolution always goes through the cache.
    let firmware = session
        .symbols
        .get_or_insert_with(|| ctx.firmware.clone())
        .clone();

    // Fail fast when the target is not in the firmware image at all.
    let target = firmware
        .lookup(&request.target)
        .ok_or_else(|| Error::SymbolNotFound(request.target.clone()))
        .map_err(|e| e.at_stage("resolve target"))?
        .clone();

    // The device is authoritative about slot state: query fresh, never
    // reuse a cached table.
    let info = engine
        .query_info(session)
        .map_err(|e| e.at_stage("query device"))?;
    let plan = slots::choose_slot(&info.slots, target.address)
        .map_err(|e| e.at_stage("choose slot"))?;
    if let SlotPlan::Reuse(id) = plan {
        info!("reusing slot {} already redirecting {}", id, request.target);
        engine
            .unpatch(session, UnpatchScope::Slot(id))
            .map_err(|e| e.at_stage("unpatch slot"))?;
    }

    let compiler = PatchCompiler {
        tools: &ctx.tools,
        firmware: &ctx.firmware,
        config: &ctx.config,
    };
    let anchor = request.entry.as_deref();

    // Pass 1 at a placeholder base: only the size is consumed.
    let pass1 = compiler
        .compile(
            &request.source,
            request.origin.as_deref(),
            PLACEHOLDER_BASE,
            anchor,
        )
        .map_err(|e| e.at_stage("compile pass 1"))?;

    let allocated = engine
        .alloc(session, pass1.size() as u32 + SCRATCH_HEADER_MARGIN)
        .map_err(|e| e.at_stage("allocate"))?;
    let aligned = align_up(allocated, CODE_ALIGN);

    // Pass 2 at the real address; pass 1's symbols are dead from here on.
    let pass2 = compiler
        .compile(&request.source, request.origin.as_deref(), aligned, anchor)
        .map_err(|e| e.at_stage("compile pass 2"))?;

    let (injected_name, injected_address) =
        select_redirect_symbol(&pass2, anchor, &request.target)
            .map_err(|e| e.at_stage("locate redirect symbol"))?;

    RemoteFs::new(engine, session)
        .upload(&pass2.binary, &format!("0x{:08X}", aligned), opts)
        .map_err(|e| e.at_stage("upload"))?;

    // Injected code executes in Thumb state: OR the mode bit into the
    // redirect target.
    engine
        .install_patch(session, target.address, injected_address | 1, request.mode)
        .map_err(|e| e.at_stage("install redirect"))?;

    let elapsed = started.elapsed();
    let outcome = InjectionOutcome {
        target_name: request.target.clone(),
        target_address: target.address,
        slot: plan.slot_id(),
        injected_name,
        injected_address,
        mode: request.mode,
        elapsed,
    };

    session.inject_active = true;
    session.last_injection = Some(InjectionRecord {
        target_name: outcome.target_name.clone(),
        target_address: outcome.target_address,
        slot: outcome.slot,
        injected_name: outcome.injected_name.clone(),
        injected_address: outcome.injected_address,
        mode: outcome.mode,
        elapsed,
    });

    info!(
        "injected {} -> {} (slot {}, 0x{:08X}, {:.2?})",
        outcome.target_name, outcome.injected_name, outcome.slot, outcome.injected_address, elapsed
    );
    Ok(outcome)
}

/// Inject every function of a fragment: one placeholder compile discovers
/// the candidates, each candidate must match a firmware symbol exactly
/// (case-insensitive), and each valid pair runs through [`inject_one`]
/// independently, ordered by compiled address. Per-target failures do not
/// abort the batch.
pub fn inject_many<T: Transport>(
    engine: &mut ProtocolEngine<T>,
    session: &mut Session,
    ctx: &CompilerContext,
    source: &str,
    origin: Option<PathBuf>,
    mode: PatchMode,
    opts: &TransferOptions,
) -> Result<BatchOutcome> {
    let started = Instant::now();

    let firmware = session
        .symbols
        .get_or_insert_with(|| ctx.firmware.clone())
        .clone();

    let compiler = PatchCompiler {
        tools: &ctx.tools,
        firmware: &ctx.firmware,
        config: &ctx.config,
    };
    let discovery = compiler
        .compile(source, origin.as_deref(), PLACEHOLDER_BASE, None)
        .map_err(|e| e.at_stage("compile pass 1"))?;

    let mut results: Vec<(String, Result<InjectionOutcome>)> = Vec::new();
    let mut candidates: Vec<(String, u32)> = Vec::new();

    for (name, &address) in discovery.user_symbols() {
        match firmware.lookup_ci(name) {
            Some(fw) => candidates.push((fw.name.clone(), address)),
            None => {
                warn!("compiled symbol `{}` matches no firmware function", name);
                results.push((
                    name.clone(),
                    Err(Error::SymbolNotFound(format!(
                        "`{}` matches no firmware symbol",
                        name
                    ))),
                ));
            }
        }
    }
    candidates.sort_by_key(|&(_, address)| address);

    for (target, _) in candidates {
        let request = InjectionRequest {
            target: target.clone(),
            source: source.to_owned(),
            origin: origin.clone(),
            entry: None,
            mode,
        };
        let result = inject_one(engine, session, ctx, &request, opts);
        results.push((target, result));
    }

    let succeeded = results.iter().filter(|(_, r)| r.is_ok()).count();
    let failed = results.len() - succeeded;
    Ok(BatchOutcome {
        results,
        succeeded,
        failed,
        elapsed: started.elapsed(),
    })
}

/// Remove one redirect or all of them. A full unpatch also clears the
/// session's injection bookkeeping; a single-slot unpatch leaves it alone
/// since another slot may still be active.
pub fn unpatch<T: Transport>(
    engine: &mut ProtocolEngine<T>,
    session: &mut Session,
    scope: UnpatchScope,
) -> Result<()> {
    engine.unpatch(session, scope)?;
    if let UnpatchScope::All = scope {
        session.inject_active = false;
        session.last_injection = None;
    }
    Ok(())
}

// =============================================================================
// Private stuff
// =============================================================================

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Pick the symbol execution is redirected to: the explicit entry when
/// given, else an exact then substring match on the target's name among
/// the compiled user symbols, else the lowest-address user symbol.
fn select_redirect_symbol(
    patch: &CompiledPatch,
    explicit: Option<&str>,
    target: &str,
) -> Result<(String, u32)> {
    if let Some(name) = explicit {
        return patch
            .symbols
            .get(name)
            .map(|&address| (name.to_owned(), address))
            .ok_or_else(|| Error::SymbolNotFound(format!("entry `{}` not in compiled patch", name)));
    }

    let users: Vec<(&String, u32)> = patch.user_symbols().map(|(n, &a)| (n, a)).collect();
    if let Some((name, address)) = users.iter().find(|(name, _)| name.as_str() == target) {
        return Ok(((*name).clone(), *address));
    }
    if let Some((name, address)) = users
        .iter()
        .filter(|(name, _)| name.contains(target) || target.contains(name.as_str()))
        .min_by_key(|&&(_, address)| address)
    {
        return Ok(((*name).clone(), *address));
    }
    users
        .iter()
        .min_by_key(|&&(_, address)| address)
        .map(|(name, address)| ((*name).clone(), *address))
        .ok_or_else(|| Error::SymbolNotFound("compiled patch has no user symbols".into()))
}

// =============================================================================
// Unit Tests
// =============================================================================
