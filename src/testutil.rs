//! Test-only fixtures: hand-built BTF blobs and backing symbol tables, so
//! the admissibility checker (C3) and the selection engine (C4) are
//! exercisable without a live kernel or root.

#![cfg(test)]

use crate::oracle::SymbolOracle;

/// BTF kind constants, duplicated from `btf.rs` rather than exposed there —
/// only this fixture builder needs to encode them into raw bytes.
mod kind {
    pub(super) const INT: u32 = 1;
    pub(super) const PTR: u32 = 2;
    pub(super) const FWD: u32 = 7;
    pub(super) const TYPEDEF: u32 = 8;
    pub(super) const VOLATILE: u32 = 9;
    pub(super) const CONST: u32 = 10;
    pub(super) const FUNC: u32 = 12;
    pub(super) const FUNC_PROTO: u32 = 13;
}

/// Incrementally builds a minimal, valid raw BTF blob — header, type
/// section, string section, contiguous and 4-byte aligned throughout — the
/// same layout `libbpf_sys::btf__new` parses from a `.BTF` ELF section, but
/// assembled by hand instead of by a compiler.
pub(crate) struct BtfFixture {
    types: Vec<u8>,
    strings: Vec<u8>,
    next_id: u32,
}

impl BtfFixture {
    pub(crate) fn new() -> Self {
        BtfFixture {
            types: Vec::new(),
            // Offset 0 is always the empty string.
            strings: vec![0],
            next_id: 1,
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    fn push_header(&mut self, name_off: u32, info: u32, size_or_type: u32) -> u32 {
        self.types.extend_from_slice(&name_off.to_ne_bytes());
        self.types.extend_from_slice(&info.to_ne_bytes());
        self.types.extend_from_slice(&size_or_type.to_ne_bytes());
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// A plain `bits`-wide unsigned integer type (`BTF_KIND_INT`).
    pub(crate) fn int(&mut self, name: &str, bits: u32) -> u32 {
        let name_off = self.intern(name);
        let id = self.push_header(name_off, kind::INT << 24, bits / 8);
        // int_info: encoding=0, offset=0, bits in the low byte.
        self.types.extend_from_slice(&bits.to_ne_bytes());
        id
    }

    /// A pointer to `pointee` (`0` for `void *`).
    pub(crate) fn ptr(&mut self, pointee: u32) -> u32 {
        self.push_header(0, kind::PTR << 24, pointee)
    }

    /// A forward-declared struct — used wherever only "this is a composite
    /// type" matters to the caller, without needing real members.
    pub(crate) fn fwd_struct(&mut self, name: &str) -> u32 {
        let name_off = self.intern(name);
        self.push_header(name_off, kind::FWD << 24, 0)
    }

    /// A `const`-qualified alias of `underlying`.
    pub(crate) fn const_of(&mut self, underlying: u32) -> u32 {
        self.push_header(0, kind::CONST << 24, underlying)
    }

    /// A `volatile`-qualified alias of `underlying`.
    pub(crate) fn volatile_of(&mut self, underlying: u32) -> u32 {
        self.push_header(0, kind::VOLATILE << 24, underlying)
    }

    /// A `typedef` alias of `underlying`.
    pub(crate) fn typedef_of(&mut self, name: &str, underlying: u32) -> u32 {
        let name_off = self.intern(name);
        self.push_header(name_off, kind::TYPEDEF << 24, underlying)
    }

    /// A `FUNC_PROTO`. `ret == 0` means `void`; `0` among `params` is the
    /// variadic marker.
    pub(crate) fn func_proto(&mut self, ret: u32, params: &[u32]) -> u32 {
        let info = (kind::FUNC_PROTO << 24) | params.len() as u32;
        let id = self.push_header(0, info, ret);
        for &p in params {
            self.types.extend_from_slice(&0u32.to_ne_bytes()); // param name
            self.types.extend_from_slice(&p.to_ne_bytes());
        }
        id
    }

    /// A named `FUNC` entry resolving to `proto`.
    pub(crate) fn func(&mut self, name: &str, proto: u32) -> u32 {
        let name_off = self.intern(name);
        // linkage = 1 (BTF_FUNC_GLOBAL); the selection engine never reads it.
        self.push_header(name_off, (kind::FUNC << 24) | 1, proto)
    }

    /// Assemble the final blob, consuming the builder.
    pub(crate) fn build(self) -> Vec<u8> {
        let type_len = self.types.len() as u32;
        let str_len = self.strings.len() as u32;

        let mut out = Vec::with_capacity(24 + self.types.len() + self.strings.len());
        out.extend_from_slice(&0xeB9Fu16.to_ne_bytes()); // magic
        out.push(1); // version
        out.push(0); // flags
        out.extend_from_slice(&24u32.to_ne_bytes()); // hdr_len
        out.extend_from_slice(&0u32.to_ne_bytes()); // type_off
        out.extend_from_slice(&type_len.to_ne_bytes());
        out.extend_from_slice(&type_len.to_ne_bytes()); // str_off
        out.extend_from_slice(&str_len.to_ne_bytes());
        out.extend_from_slice(&self.types);
        out.extend_from_slice(&self.strings);
        out
    }
}

/// Build a `SymbolOracle` backed by throwaway fixture files where every name
/// in `names` is both a known kallsyms symbol and kprobe-attachable.
pub(crate) fn build_oracle(names: &[&str]) -> SymbolOracle {
    let dir = tempfile::tempdir().expect("tempdir");
    let kallsyms_path = dir.path().join("kallsyms");
    let filter_path = dir.path().join("available_filter_functions");

    let mut kallsyms = String::new();
    let mut filter = String::new();
    let mut addr = 0xffffffff_81000000u64;
    for name in names {
        kallsyms.push_str(&format!("{addr:x} T {name}\n"));
        filter.push_str(&format!("{name}\n"));
        addr += 0x100;
    }
    std::fs::write(&kallsyms_path, &kallsyms).expect("write kallsyms fixture");
    std::fs::write(&filter_path, &filter).expect("write filter-functions fixture");

    SymbolOracle::load_from(&kallsyms_path, &filter_path).expect("load fixture oracle")
}
