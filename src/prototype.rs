//! Prototype tracing programs: one verifier-approved `(direction, arity)`
//! pair per supported argument count, authored ahead of time by the
//! consumer and captured here before being cloned per selected function.

use crate::error::Error;
use crate::error::Result;
use crate::program::OpenProgram;
use crate::Direction;
use crate::btf::MAX_ARG_CNT;

/// Number of distinct argument counts the mechanism supports: `0..=11`.
pub const ARITY_SLOTS: usize = MAX_ARG_CNT + 1;

/// The captured, verifier-normalized instruction stream for one
/// `(direction, arity)` slot, along with its instruction count.
#[derive(Debug, Default, Clone)]
pub struct CapturedInsns {
    insns: Vec<libbpf_sys::bpf_insn>,
}

impl CapturedInsns {
    fn from_program(insns: &[libbpf_sys::bpf_insn]) -> Self {
        CapturedInsns {
            insns: insns.to_vec(),
        }
    }

    /// The captured instructions, ready to be submitted as a new program.
    pub fn as_slice(&self) -> &[libbpf_sys::bpf_insn] {
        &self.insns
    }

    /// Number of instructions captured.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// One `(direction, arity)` prototype slot.
///
/// Before [`crate::Attacher::load`], it holds references into the
/// consumer's still-open prototype object; after, it holds the captured
/// instruction buffer that every per-function clone at that arity is built
/// from.
pub struct PrototypeSlot {
    arity: u8,
    fentry_insns: Option<CapturedInsns>,
    fexit_insns: Option<CapturedInsns>,
}

impl PrototypeSlot {
    pub(crate) fn empty(arity: u8) -> Self {
        PrototypeSlot {
            arity,
            fentry_insns: None,
            fexit_insns: None,
        }
    }

    /// The argument count this slot serves.
    pub fn arity(&self) -> u8 {
        self.arity
    }

    /// Has a consumer (a selected function at this arity) been recorded?
    pub fn has_consumer(&self) -> bool {
        self.fentry_insns.is_some() || self.fexit_insns.is_some()
    }

    pub(crate) fn capture(&mut self, direction: Direction, insns: &[libbpf_sys::bpf_insn]) {
        let captured = CapturedInsns::from_program(insns);
        match direction {
            Direction::Entry => self.fentry_insns = Some(captured),
            Direction::Exit => self.fexit_insns = Some(captured),
        }
    }

    pub(crate) fn insns(&self, direction: Direction) -> Result<&CapturedInsns> {
        let slot = match direction {
            Direction::Entry => &self.fentry_insns,
            Direction::Exit => &self.fexit_insns,
        };
        slot.as_ref().ok_or_else(|| {
            Error::NotFound(format!(
                "no captured {:?} instructions for arity {}",
                direction, self.arity
            ))
        })
    }
}

/// The consumer-authored, not-yet-loaded prototype programs: two
/// (fentry/fexit) `OpenProgram`s per supported arity.
///
/// Authoring these programs — the BPF C/CO-RE source, its compilation, and
/// the activation-flag protocol they implement — is the consumer's
/// responsibility; this crate only needs load-time access to them.
pub trait PrototypeSource {
    /// Borrow the fentry `OpenProgram` for `arity`, if the consumer's
    /// object defines one (`arity` is always `0..=11`).
    fn fentry(&mut self, arity: u8) -> Option<&mut OpenProgram>;

    /// Borrow the fexit `OpenProgram` for `arity`.
    fn fexit(&mut self, arity: u8) -> Option<&mut OpenProgram>;

    /// Write the well-known activation flag the prototype programs read on
    /// entry. Called exactly once, by `Attacher::activate`, after every
    /// function has had its chance to attach.
    fn set_active(&mut self, active: bool) -> Result<()>;
}
