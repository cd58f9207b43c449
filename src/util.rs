//! Small helpers shared by the FFI-facing modules.

use std::ffi::CStr;
use std::ffi::CString;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::Error;
use crate::error::Result;

/// Convert a non-owned, NUL-terminated C string into an owned [`String`].
///
/// # Safety
/// `ptr` must point at a valid, NUL-terminated string for the duration of
/// the call.
pub(crate) fn c_ptr_to_string(ptr: *const c_char) -> Result<String> {
    if ptr.is_null() {
        return Err(Error::with_invalid_data("unexpected NULL string pointer"));
    }
    let c_str = unsafe { CStr::from_ptr(ptr) };
    c_str.to_str().map(str::to_owned).map_err(Error::from)
}

/// Convert a `&str` into a `CString`, bailing out on an embedded NUL.
pub(crate) fn str_to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(Error::from)
}

/// Convert any path-like value into a `CString` suitable for passing to libbpf.
pub(crate) fn path_to_cstring(path: impl AsRef<Path>) -> Result<CString> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| Error::with_invalid_data("path is not valid UTF-8"))?;
    str_to_cstring(path_str)
}

/// Translate a raw libbpf return code into a `Result<()>`.
///
/// libbpf functions that return `int` use the convention of `0` or a
/// positive value for success and a negative `-errno` for failure.
pub(crate) fn parse_ret(ret: i32) -> Result<()> {
    if ret < 0 {
        // `errno` is not always reliable on this path (libbpf sometimes
        // returns the negated error directly without setting `errno`), so
        // the return value itself carries the error code.
        Err(Error::from_raw_os_error(-ret))
    } else {
        Ok(())
    }
}

/// Like [`parse_ret`] but returns the non-negative value on success instead
/// of discarding it (used for calls that return a file descriptor or id).
pub(crate) fn parse_ret_i32(ret: i32) -> Result<i32> {
    parse_ret(ret)?;
    Ok(ret)
}

/// Run `f`, which returns a possibly-NULL libbpf entity pointer together
/// with `libbpf_get_error`-style error encoding, and turn it into a checked,
/// non-null pointer.
///
/// Many libbpf constructors return `NULL` and stash the real error behind
/// `libbpf_get_error`; others encode the error as `ERR_PTR`. We treat a NULL
/// result as "check errno" since that is the common case for the calls this
/// crate makes.
pub(crate) fn create_bpf_entity_checked<T>(
    f: impl FnOnce() -> *mut T,
) -> Result<NonNull<T>> {
    let ptr = f();
    match NonNull::new(ptr) {
        Some(ptr) => Ok(ptr),
        None => {
            let errno = io_last_error();
            Err(Error::from_raw_os_error(errno))
        }
    }
}

fn io_last_error() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}
