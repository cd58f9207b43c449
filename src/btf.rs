//! Kernel BTF access (type walk) and the function-signature admissibility
//! checker (component C3).

use std::os::raw::c_char;
use std::ptr;
use std::ptr::NonNull;

use crate::error::Error;
use crate::error::Result;
use crate::util;

/// `BTF_KIND_FUNC` — a function declaration; its type points at a
/// `FUNC_PROTO`.
const BTF_KIND_FUNC: u32 = 12;
/// `BTF_KIND_FUNC_PROTO` — a function's parameter/return-type signature.
const BTF_KIND_FUNC_PROTO: u32 = 13;
const BTF_KIND_INT: u32 = 1;
const BTF_KIND_PTR: u32 = 2;
const BTF_KIND_ARRAY: u32 = 3;
const BTF_KIND_STRUCT: u32 = 4;
const BTF_KIND_UNION: u32 = 5;
const BTF_KIND_ENUM: u32 = 6;
const BTF_KIND_FWD: u32 = 7;
const BTF_KIND_TYPEDEF: u32 = 8;
const BTF_KIND_VOLATILE: u32 = 9;
const BTF_KIND_CONST: u32 = 10;
const BTF_KIND_RESTRICT: u32 = 11;
const BTF_KIND_ENUM64: u32 = 19;

/// Maximum parameter count this attach mechanism supports. A 12th argument
/// would not fit the trampoline contract the prototype programs are built
/// against.
pub const MAX_ARG_CNT: usize = 11;

/// A loaded kernel BTF handle.
pub struct Btf {
    ptr: NonNull<libbpf_sys::btf>,
}

impl Btf {
    /// Load the running kernel's BTF (`/sys/kernel/btf/vmlinux`).
    pub fn load_vmlinux() -> Result<Self> {
        let ptr = unsafe { libbpf_sys::btf__load_vmlinux_btf() };
        util::create_bpf_entity_checked(|| ptr).map(|ptr| Btf { ptr })
    }

    /// Parse a raw BTF blob (e.g. the `.BTF` ELF section of an object file,
    /// or a hand-built fixture in tests). Useful for exercising the
    /// selection engine without a live kernel.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let ptr = unsafe {
            libbpf_sys::btf__new(data.as_ptr() as *const std::os::raw::c_void, data.len() as u32)
        };
        util::create_bpf_entity_checked(|| ptr).map(|ptr| Btf { ptr })
    }

    /// Total number of BTF type entries, including the void sentinel at id 0.
    pub fn type_cnt(&self) -> u32 {
        unsafe { libbpf_sys::btf__type_cnt(self.ptr.as_ptr()) as u32 }
    }

    /// Borrow the raw `btf_type` record for `id`, if it exists.
    pub fn type_by_id(&self, id: u32) -> Option<NonNull<libbpf_sys::btf_type>> {
        let ptr = unsafe { libbpf_sys::btf__type_by_id(self.ptr.as_ptr(), id) };
        NonNull::new(ptr)
    }

    /// Resolve a BTF string-table offset to its name.
    pub fn name_by_offset(&self, offset: u32) -> Result<&str> {
        let ptr: *const c_char =
            unsafe { libbpf_sys::btf__name_by_offset(self.ptr.as_ptr(), offset) };
        if ptr.is_null() {
            return Err(Error::NotFound(format!("no BTF string at offset {offset}")));
        }
        let c_str = unsafe { std::ffi::CStr::from_ptr(ptr) };
        c_str.to_str().map_err(Error::from)
    }

    /// The name of a `FUNC`/`FUNC_PROTO`/etc. type, or `""` for anonymous
    /// types (e.g. most struct/union members along a resolution chain).
    fn type_name(&self, t: NonNull<libbpf_sys::btf_type>) -> Result<&str> {
        let name_off = unsafe { t.as_ref().name_off };
        if name_off == 0 {
            return Ok("");
        }
        self.name_by_offset(name_off)
    }

    /// Iterate every BTF id whose kind is `FUNC`, in ascending id order —
    /// the same order the selection engine walks in.
    pub fn iter_func_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (1..self.type_cnt()).filter(move |&id| {
            self.type_by_id(id)
                .map(|t| kind_of(t) == BTF_KIND_FUNC)
                .unwrap_or(false)
        })
    }

    /// The name of a `FUNC` entry.
    pub fn func_name(&self, func_id: u32) -> Result<&str> {
        let t = self
            .type_by_id(func_id)
            .ok_or_else(|| Error::NotFound(format!("no BTF type {func_id}")))?;
        self.type_name(t)
    }
}

impl Drop for Btf {
    fn drop(&mut self) {
        unsafe { libbpf_sys::btf__free(self.ptr.as_ptr()) };
    }
}

// SAFETY: a `btf` handle is read-only after load from this crate's point of
// view; libbpf itself does not mutate it via these accessors.
unsafe impl Send for Btf {}
unsafe impl Sync for Btf {}

fn kind_of(t: NonNull<libbpf_sys::btf_type>) -> u32 {
    let info = unsafe { t.as_ref().info };
    // The kind occupies bits 24-28 (5 bits): BTF_KIND_ENUM64 (19) and above
    // would be truncated by a 4-bit mask.
    (info >> 24) & 0x1f
}

fn vlen_of(t: NonNull<libbpf_sys::btf_type>) -> u32 {
    let info = unsafe { t.as_ref().info };
    info & 0xffff
}

/// The admitted shape of an argument or return type, after alias
/// resolution: integer, pointer, or (for returns only) enum/void-pointer/
/// composite-pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Int,
    Enum,
    Ptr { points_to: PtrTarget },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PtrTarget {
    Void,
    Composite,
    Other,
}

/// Strip `CONST`/`VOLATILE`/`RESTRICT`/`TYPEDEF` wrappers from `id`,
/// following arbitrarily deep alias chains, and classify what remains.
///
/// Returns `None` for `void` (id 0) and for anything this mechanism does
/// not admit (arrays, raw structs/unions as a direct parameter type,
/// function pointers, etc. beyond what `Resolved` encodes).
fn resolve(btf: &Btf, mut id: u32) -> Option<ResolvedOrVoid> {
    loop {
        if id == 0 {
            return Some(ResolvedOrVoid::Void);
        }
        let t = btf.type_by_id(id)?;
        match kind_of(t) {
            BTF_KIND_CONST | BTF_KIND_VOLATILE | BTF_KIND_RESTRICT | BTF_KIND_TYPEDEF => {
                id = unsafe { t.as_ref().__bindgen_anon_1.type_ };
                continue;
            }
            BTF_KIND_INT | BTF_KIND_ENUM | BTF_KIND_ENUM64 => {
                let kind = if kind_of(t) == BTF_KIND_INT {
                    Resolved::Int
                } else {
                    Resolved::Enum
                };
                return Some(ResolvedOrVoid::Value(kind));
            }
            BTF_KIND_PTR => {
                let pointee = unsafe { t.as_ref().__bindgen_anon_1.type_ };
                let target = if pointee == 0 {
                    PtrTarget::Void
                } else {
                    match btf.type_by_id(pointee).map(kind_of) {
                        Some(BTF_KIND_STRUCT) | Some(BTF_KIND_UNION) | Some(BTF_KIND_FWD) => {
                            PtrTarget::Composite
                        }
                        _ => PtrTarget::Other,
                    }
                };
                return Some(ResolvedOrVoid::Value(Resolved::Ptr { points_to: target }));
            }
            _ => return None,
        }
    }
}

enum ResolvedOrVoid {
    Void,
    Value(Resolved),
}

/// Decide whether a BTF `FUNC` entry's signature is supported by the
/// attach mechanism. Returns the parameter count on success.
///
/// Rejects:
/// - more than [`MAX_ARG_CNT`] parameters,
/// - a `void` return,
/// - a return type that, after alias resolution, is not integer, enum, or
///   a pointer to `void`/a composite,
/// - any parameter whose resolved type is not integer, pointer, or enum,
/// - any parameter with a zero type id (the variadic marker).
pub fn check_admissible(btf: &Btf, func_id: u32) -> Result<u8> {
    let func = btf
        .type_by_id(func_id)
        .ok_or_else(|| Error::NotFound(format!("no BTF type {func_id}")))?;
    if kind_of(func) != BTF_KIND_FUNC {
        return Err(Error::InvalidArgument(format!(
            "BTF id {func_id} is not a FUNC"
        )));
    }

    let proto_id = unsafe { func.as_ref().__bindgen_anon_1.type_ };
    let proto = btf
        .type_by_id(proto_id)
        .ok_or_else(|| Error::NotFound(format!("no BTF type {proto_id}")))?;
    if kind_of(proto) != BTF_KIND_FUNC_PROTO {
        return Err(Error::InvalidArgument(format!(
            "BTF id {func_id} does not resolve to a FUNC_PROTO"
        )));
    }

    let vlen = vlen_of(proto) as usize;
    if vlen > MAX_ARG_CNT {
        return Err(Error::InvalidArgument(format!(
            "function has {vlen} parameters, more than the {MAX_ARG_CNT} supported"
        )));
    }

    // `btf_params()` in libbpf: the `btf_param` array directly follows the
    // `btf_type` header in the BTF type section's backing memory.
    let params = unsafe {
        let base = proto.as_ptr().add(1) as *const libbpf_sys::btf_param;
        std::slice::from_raw_parts(base, vlen)
    };

    let ret_type = unsafe { proto.as_ref().__bindgen_anon_1.type_ };
    match resolve(btf, ret_type) {
        Some(ResolvedOrVoid::Void) => {
            return Err(Error::InvalidArgument(
                "void-returning functions are not attachable".into(),
            ))
        }
        Some(ResolvedOrVoid::Value(Resolved::Int)) | Some(ResolvedOrVoid::Value(Resolved::Enum)) => {}
        Some(ResolvedOrVoid::Value(Resolved::Ptr { points_to })) => match points_to {
            PtrTarget::Void | PtrTarget::Composite => {}
            PtrTarget::Other => {
                return Err(Error::InvalidArgument(
                    "return type is a pointer to a non-composite, non-void type".into(),
                ))
            }
        },
        None => {
            return Err(Error::InvalidArgument(
                "return type is not admissible after alias resolution".into(),
            ))
        }
    }

    for param in params {
        if param.type_ == 0 {
            return Err(Error::InvalidArgument(
                "variadic functions (zero-typed parameter) are not attachable".into(),
            ));
        }
        match resolve(btf, param.type_) {
            Some(ResolvedOrVoid::Value(Resolved::Int))
            | Some(ResolvedOrVoid::Value(Resolved::Enum))
            | Some(ResolvedOrVoid::Value(Resolved::Ptr { .. })) => {}
            _ => {
                return Err(Error::InvalidArgument(
                    "parameter type is not admissible after alias resolution".into(),
                ))
            }
        }
    }

    Ok(vlen as u8)
}

/// Only exercised from tests via synthetic `btf_type`/`btf_param` arrays, so
/// keep the pointer arithmetic above isolated in this module.
#[allow(dead_code)]
fn _assert_param_layout() {
    // `btf_params(t)` in libbpf assumes `btf_param` is laid out immediately
    // after `btf_type` with no padding; this keeps that assumption visible
    // next to the unsafe code that relies on it.
    let _ = ptr::null::<libbpf_sys::btf_type>();
}
