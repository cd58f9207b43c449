//! The slice of libbpf's program API this crate actually needs: reading a
//! not-yet-loaded prototype program's instructions, toggling its autoload
//! bit, and pointing its attach target — plus the raw, no-object-file
//! program construction the materializer uses to submit each per-function
//! clone.
//!
//! This is a deliberately small subset of what a general-purpose libbpf
//! wrapper exposes (no uprobe/usdt/xdp/cgroup/sockmap/iter attach
//! variants): the mass attacher only ever deals with `BPF_PROG_TYPE_TRACING`
//! programs and fentry/fexit attachment.

use std::ffi::CString;
use std::os::unix::io::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::ptr::NonNull;

use crate::error::Error;
use crate::util;
use crate::Result;

/// A parsed-but-not-yet-loaded program belonging to the consumer's
/// prototype object.
///
/// This is the load-time view of a prototype fentry/fexit program: its
/// instructions can still be inspected and it can still be pointed at a
/// concrete attach target, but no fd exists for it yet.
#[derive(Debug)]
pub struct OpenProgram {
    ptr: NonNull<libbpf_sys::bpf_program>,
}

impl OpenProgram {
    /// Wrap a `bpf_program` pointer obtained from an opened (not yet
    /// loaded) `bpf_object`.
    ///
    /// # Safety
    /// `ptr` must point at a valid, currently-open `bpf_program`.
    pub unsafe fn new(ptr: NonNull<libbpf_sys::bpf_program>) -> Self {
        OpenProgram { ptr }
    }

    /// The program's section name, e.g. `"fentry/__prototype0"`.
    pub fn name(&self) -> Result<String> {
        let ptr = unsafe { libbpf_sys::bpf_program__name(self.ptr.as_ptr()) };
        util::c_ptr_to_string(ptr)
    }

    /// Enable or disable autoload for this program. The materializer
    /// disables autoload on every prototype slot with zero consumers
    /// before `bpf_object__load` runs, so the kernel never loads an unused
    /// prototype.
    pub fn set_autoload(&mut self, autoload: bool) -> Result<()> {
        let ret = unsafe { libbpf_sys::bpf_program__set_autoload(self.ptr.as_ptr(), autoload) };
        util::parse_ret(ret)
    }

    /// Point this program's attach target at `attach_func_name` within
    /// `attach_prog_fd` (`0` for a plain kernel function). The verifier
    /// requires a concrete target at prototype load time even though every
    /// clone retargets independently afterwards.
    pub fn set_attach_target(
        &mut self,
        attach_prog_fd: i32,
        attach_func_name: Option<&str>,
    ) -> Result<()> {
        let name_c: Option<CString> = attach_func_name.map(util::str_to_cstring).transpose()?;
        let name_ptr = name_c
            .as_ref()
            .map(|c| c.as_ptr())
            .unwrap_or(std::ptr::null());
        let ret = unsafe {
            libbpf_sys::bpf_program__set_attach_target(self.ptr.as_ptr(), attach_prog_fd, name_ptr)
        };
        util::parse_ret(ret)
    }

    /// Number of instructions in the program as it stands right now.
    ///
    /// Captured *after* `bpf_object__load` would have processed it (CO-RE
    /// relocation, subprogram inlining, `ldimm64` fd fixups) is what the
    /// materializer actually copies; this pre-load view exists for
    /// inspection and tests.
    pub fn insn_cnt(&self) -> usize {
        unsafe { libbpf_sys::bpf_program__insn_cnt(self.ptr.as_ptr()) as usize }
    }

    /// Read-only access to the program's current instruction stream.
    pub fn insns(&self) -> &[libbpf_sys::bpf_insn] {
        let count = self.insn_cnt();
        let ptr = unsafe { libbpf_sys::bpf_program__insns(self.ptr.as_ptr()) };
        unsafe { std::slice::from_raw_parts(ptr, count) }
    }
}

/// A per-function clone of a captured prototype, loaded directly from an
/// instruction buffer rather than from an object file.
///
/// There is no `bpf_object`/`bpf_program` backing this: `bpf_prog_load` is
/// called with the raw instruction array captured from the prototype, so
/// the kernel sees a structurally-identical program for every selected
/// function, distinguished only by `attach_btf_id`. Its fd is handed off to
/// the owning [`crate::selection::FuncInfo`] immediately after load (see
/// [`crate::materializer::clone_all`]), so this type carries no attach
/// logic of its own — that lives in [`crate::materializer`], which already
/// knows which direction (`BPF_TRACE_FENTRY`/`BPF_TRACE_FEXIT`) each fd was
/// cloned for.
#[derive(Debug)]
pub struct ClonedProgram {
    fd: OwnedFd,
}

/// License string every clone is loaded with — GPL helpers (`bpf_probe_read`
/// and friends) require it, and the prototype programs use them.
pub const LICENSE: &str = "Dual BSD/GPL";

impl ClonedProgram {
    /// Load a clone of `insns`, targeting `attach_btf_id`.
    pub fn load(
        prog_type: u32,
        expected_attach_type: u32,
        insns: &[libbpf_sys::bpf_insn],
        attach_btf_id: u32,
    ) -> Result<Self> {
        let license = util::str_to_cstring(LICENSE)?;
        let mut opts = unsafe { std::mem::zeroed::<libbpf_sys::bpf_prog_load_opts>() };
        opts.sz = std::mem::size_of::<libbpf_sys::bpf_prog_load_opts>() as _;
        opts.expected_attach_type = expected_attach_type;
        opts.attach_btf_id = attach_btf_id;

        let name = util::str_to_cstring("")?;
        let ret = unsafe {
            libbpf_sys::bpf_prog_load(
                prog_type,
                name.as_ptr(),
                license.as_ptr(),
                insns.as_ptr(),
                insns.len() as libbpf_sys::size_t,
                &mut opts as *mut libbpf_sys::bpf_prog_load_opts,
            )
        };

        if ret < 0 {
            return Err(Error::Verifier(format!(
                "kernel rejected clone targeting btf id {attach_btf_id}: {}",
                std::io::Error::from_raw_os_error(-ret)
            )));
        }

        // SAFETY: `bpf_prog_load` returned a non-negative fd, which is a
        // freshly-created, uniquely-owned program fd.
        let fd = unsafe { OwnedFd::from_raw_fd(ret) };
        Ok(ClonedProgram { fd })
    }

    /// The raw program fd, as recorded into `FuncInfo::fentry_fd`/`fexit_fd`.
    pub fn as_raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

impl AsFd for ClonedProgram {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
