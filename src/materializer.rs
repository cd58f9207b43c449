//! The probe materializer (component C5): capture prototype instruction
//! streams, then clone and attach one pair of programs per selected
//! function.

use std::collections::HashMap;

use libbpf_sys::BPF_PROG_TYPE_TRACING;
use libbpf_sys::BPF_TRACE_FENTRY;
use libbpf_sys::BPF_TRACE_FEXIT;
use log::debug;
use log::trace;
use log::warn;

use crate::error::Error;
use crate::error::Result;
use crate::link::Link;
use crate::program::ClonedProgram;
use crate::prototype::PrototypeSlot;
use crate::prototype::PrototypeSource;
use crate::selection::AritySummary;
use crate::selection::FuncInfo;
use crate::Direction;

/// Captures every prototype slot's instructions ahead of cloning.
///
/// For each arity with at least one selected function, the slot's attach
/// target is pointed at the first selected function of that shape (the
/// verifier needs a concrete target at prototype load time, even though
/// every clone retargets independently), and autoload is left enabled only
/// long enough for the caller's `bpf_object__load` to run; slots with zero
/// consumers have autoload disabled so the kernel never loads them.
///
/// Other mass-attach tools install a one-shot hook on the loader's
/// instruction-preparation callback and thread the current attacher through
/// thread-local state for the duration of a single, serialized
/// `bpf_object__load` call to get at a program's not-yet-loaded
/// instructions. Here the consumer's `PrototypeSource` hands us mutable
/// access to each `OpenProgram` directly, so the same snapshot is taken
/// without the thread-local detour. Concurrent `load()` calls against the
/// same `PrototypeSource` are still undefined.
pub fn prepare_prototypes(
    prototypes: &mut dyn PrototypeSource,
    arity: &AritySummary,
    funcs: &[FuncInfo],
    debug_load: bool,
) -> Result<[PrototypeSlot; crate::prototype::ARITY_SLOTS]> {
    let mut slots: [PrototypeSlot; crate::prototype::ARITY_SLOTS] =
        std::array::from_fn(|i| PrototypeSlot::empty(i as u8));

    for (i, slot) in slots.iter_mut().enumerate() {
        let has_consumer = arity.counts[i] > 0;

        if let Some(prog) = prototypes.fentry(i as u8) {
            if has_consumer {
                capture_one(prog, slot, Direction::Entry, arity, funcs, debug_load)?;
            } else {
                prog.set_autoload(false)?;
            }
        }
        if let Some(prog) = prototypes.fexit(i as u8) {
            if has_consumer {
                capture_one(prog, slot, Direction::Exit, arity, funcs, debug_load)?;
            } else {
                prog.set_autoload(false)?;
            }
        }
    }

    Ok(slots)
}

fn capture_one(
    prog: &mut crate::program::OpenProgram,
    slot: &mut PrototypeSlot,
    direction: Direction,
    arity: &AritySummary,
    funcs: &[FuncInfo],
    debug_load: bool,
) -> Result<()> {
    let first = arity.first_index[slot.arity() as usize]
        .expect("has_consumer implies a first index");
    let target = &funcs[first];
    prog.set_attach_target(0, Some(target.name.as_str()))?;

    // In debug mode the prototype is actually loaded too, so verifier
    // diagnostics surface through the consumer's own `bpf_object__load`
    // error path; otherwise we skip that and only keep the instructions.
    prog.set_autoload(debug_load)?;

    let insns = prog.insns().to_vec();
    slot.capture(direction, &insns);
    debug!(
        "captured {} {:?} prototype instructions for arity {} (template target {:?})",
        insns.len(),
        direction,
        slot.arity(),
        target.name
    );
    Ok(())
}

/// Clone one pair of programs per `FuncInfo` and record their fds.
///
/// `ip_to_id` is pre-sized to `funcs.len()` by the caller (the selection
/// plan) and is populated here, one `addr -> index` entry per function, as
/// each clone is submitted — this is the map the probe side uses to turn a
/// kernel instruction pointer back into a selection index.
pub fn clone_all(
    slots: &[PrototypeSlot; crate::prototype::ARITY_SLOTS],
    funcs: &mut [FuncInfo],
    ip_to_id: &mut HashMap<u64, usize>,
    debug_extra: bool,
) -> Result<()> {
    for (index, func) in funcs.iter_mut().enumerate() {
        ip_to_id.insert(func.addr, index);

        let slot = &slots[func.arg_cnt as usize];

        let fentry = ClonedProgram::load(
            BPF_PROG_TYPE_TRACING,
            BPF_TRACE_FENTRY,
            slot.insns(Direction::Entry)?.as_slice(),
            func.btf_id,
        )?;
        let fexit = ClonedProgram::load(
            BPF_PROG_TYPE_TRACING,
            BPF_TRACE_FEXIT,
            slot.insns(Direction::Exit)?.as_slice(),
            func.btf_id,
        )?;

        if debug_extra {
            trace!(
                "cloned arity-{} pair for {} (btf id {}) -> fentry fd {}, fexit fd {}",
                func.arg_cnt,
                func.name,
                func.btf_id,
                fentry.as_raw_fd(),
                fexit.as_raw_fd(),
            );
        }

        // SAFETY: `fentry`/`fexit` were just loaded by `ClonedProgram::load`
        // and are about to be forgotten, so `FuncInfo` becomes their sole
        // owner.
        unsafe {
            func.set_fentry_fd(fentry.as_raw_fd());
            func.set_fexit_fd(fexit.as_raw_fd());
        }
        std::mem::forget(fentry);
        std::mem::forget(fexit);
    }
    Ok(())
}

/// One function's attach-time outcome: both, one, or neither probe
/// attached. A missing function from a rapidly changing kernel, or a
/// kernel refusing a specific attach, is logged and does not fail the
/// overall `Attach` call.
#[derive(Default)]
pub struct Attachment {
    pub fentry: Option<Link>,
    pub fexit: Option<Link>,
}

/// Attach every cloned program pair. Per-function failures are logged and
/// swallowed; the caller can inspect the returned links to see how many
/// functions actually ended up attached.
pub fn attach_all(funcs: &[FuncInfo]) -> Vec<Attachment> {
    let mut attachments = Vec::with_capacity(funcs.len());

    for func in funcs {
        let mut attachment = Attachment::default();

        if let Some(fd) = func.fentry_fd() {
            match attach_raw_tracepoint(fd, BPF_TRACE_FENTRY) {
                Ok(link) => attachment.fentry = Some(link),
                Err(e) => warn!("failed to attach fentry probe to {}: {e}", func.name),
            }
        }
        if let Some(fd) = func.fexit_fd() {
            match attach_raw_tracepoint(fd, BPF_TRACE_FEXIT) {
                Ok(link) => attachment.fexit = Some(link),
                Err(e) => warn!("failed to attach fexit probe to {}: {e}", func.name),
            }
        }

        attachments.push(attachment);
    }

    attachments
}

/// Open a `BPF_LINK_CREATE` attach handle against a program fd — the
/// "raw-tracepoint-style" attach described for the fentry/fexit case,
/// where no separate target fd is needed because `attach_btf_id` already
/// pins the program to a specific kernel function.
fn attach_raw_tracepoint(prog_fd: i32, attach_type: u32) -> Result<Link> {
    let mut opts = unsafe { std::mem::zeroed::<libbpf_sys::bpf_link_create_opts>() };
    opts.sz = std::mem::size_of::<libbpf_sys::bpf_link_create_opts>() as _;
    let ret = unsafe {
        libbpf_sys::bpf_link_create(
            prog_fd,
            0,
            attach_type,
            &opts as *const libbpf_sys::bpf_link_create_opts,
        )
    };
    if ret < 0 {
        return Err(Error::from_raw_os_error(-ret));
    }
    // SAFETY: `ret` is a freshly-created, uniquely-owned link fd.
    Ok(unsafe { Link::from_raw_fd(ret) })
}
