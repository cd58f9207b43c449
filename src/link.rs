//! A handle to an attached program.
//!
//! Every per-function clone is loaded directly from a captured instruction
//! buffer rather than from an object file (see [`crate::program`]), so
//! there is no `bpf_object`-managed `bpf_link*` to wrap here — attaching
//! goes through the raw `BPF_LINK_CREATE` syscall, which simply returns a
//! link fd. Closing that fd detaches the probe, so ownership is exactly an
//! `OwnedFd`.

use std::os::unix::io::AsFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::util;
use crate::Result;

/// An open attachment: one fentry or fexit probe wired to a specific
/// kernel function. Dropping it detaches the probe.
#[derive(Debug)]
pub struct Link {
    fd: OwnedFd,
}

impl Link {
    /// Wrap a freshly-created link fd.
    ///
    /// # Safety
    /// `fd` must be a valid, uniquely-owned link fd returned by
    /// `BPF_LINK_CREATE`.
    pub(crate) unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Link {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Pin this link to a location in bpffs.
    pub fn pin<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_c = util::path_to_cstring(path)?;
        let ret = unsafe { libbpf_sys::bpf_obj_pin(self.fd.as_raw_fd(), path_c.as_ptr()) };
        util::parse_ret(ret)
    }
}

impl AsFd for Link {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Link {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// `Drop` is the default `OwnedFd` close; detaching a BPF link is just
// closing its fd, nothing bespoke to do here.
