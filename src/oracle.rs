//! The symbol table and attachable-kprobe oracle (component C2).
//!
//! Both external tables are read once, at construction, and queried
//! read-only afterwards. Neither file format is specific to this crate —
//! they are the kernel's own `/proc/kallsyms` and
//! `/sys/kernel/tracing/available_filter_functions` — so parsing lives
//! here rather than behind a generic "kernel table" abstraction.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Error;
use crate::error::Result;

/// Default location of the attachable-kprobe table.
pub const DEFAULT_AVAILABLE_FILTER_FUNCTIONS: &str =
    "/sys/kernel/tracing/available_filter_functions";

/// Default location of the kernel symbol table.
pub const DEFAULT_KALLSYMS: &str = "/proc/kallsyms";

/// Answers "is `name` a live kernel symbol?" and "is `name` attachable as a
/// kprobe?".
pub struct SymbolOracle {
    /// Function-symbol name to kernel virtual address.
    addrs: HashMap<String, u64>,
    /// Sorted, deduplicated set of kprobe-attachable names, queried with
    /// binary search.
    kprobes: Vec<String>,
}

impl SymbolOracle {
    /// Build an oracle from the default kernel-provided paths.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_KALLSYMS, DEFAULT_AVAILABLE_FILTER_FUNCTIONS)
    }

    /// Build an oracle from explicit paths — primarily for tests, which run
    /// against fixture files rather than the real kernel tables.
    pub fn load_from(kallsyms_path: impl AsRef<Path>, filter_funcs_path: impl AsRef<Path>) -> Result<Self> {
        let addrs = Self::parse_kallsyms(kallsyms_path.as_ref())?;
        let mut kprobes = Self::parse_filter_functions(filter_funcs_path.as_ref())?;
        kprobes.sort_unstable();
        kprobes.dedup();

        Ok(SymbolOracle { addrs, kprobes })
    }

    /// One line per symbol: `<addr> <type> <name> [<module>]`. Only
    /// function symbols (`t` or `T` the type field) are function candidates,
    /// but we keep every entry `lookup` might be asked about — the BTF walk
    /// is the source of truth for "is this a function", not kallsyms.
    fn parse_kallsyms(path: &Path) -> Result<HashMap<String, u64>> {
        let contents = fs::read_to_string(path)?;
        let mut addrs = HashMap::new();

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let addr = fields.next();
            let _kind = fields.next();
            let name = fields.next();

            let (addr, name) = match (addr, name) {
                (Some(a), Some(n)) => (a, n),
                _ => continue,
            };

            let addr = match u64::from_str_radix(addr, 16) {
                Ok(a) => a,
                Err(_) => continue,
            };

            // Module-local symbols repeat across kallsyms; keep the first
            // one seen, matching how the kernel itself resolves ambiguous
            // names.
            addrs.entry(name.to_owned()).or_insert(addr);
        }

        Ok(addrs)
    }

    /// One line per attachable function: `<name> [<module>]`. The module
    /// annotation, if any, is discarded — see the open question in the
    /// design notes about modular symbols collapsing to one entry.
    fn parse_filter_functions(path: &Path) -> Result<Vec<String>> {
        let contents = fs::read_to_string(path)?;
        let mut names = Vec::new();

        for line in contents.lines() {
            match line.split_whitespace().next() {
                Some(name) => names.push(name.to_owned()),
                None => continue,
            }
        }

        Ok(names)
    }

    /// Look up the kernel virtual address of `name`, if it is a known symbol.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.addrs.get(name).copied()
    }

    /// Is `name` attachable as a kprobe? O(log n) binary search.
    pub fn is_attachable(&self, name: &str) -> bool {
        self.kprobes.binary_search_by(|probe| probe.as_str().cmp(name)).is_ok()
    }

    /// Number of distinct attachable names known to this oracle.
    pub fn kprobe_count(&self) -> usize {
        self.kprobes.len()
    }
}

impl TryFrom<(&Path, &Path)> for SymbolOracle {
    type Error = Error;

    fn try_from((kallsyms, filter_funcs): (&Path, &Path)) -> Result<Self> {
        Self::load_from(kallsyms, filter_funcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_kallsyms_and_filter_functions() {
        let dir = tempfile::tempdir().unwrap();
        let kallsyms = write_fixture(
            &dir,
            "kallsyms",
            "ffffffff81000000 T vfs_read\nffffffff81001000 t tcp_sendmsg\n",
        );
        let filter_funcs = write_fixture(
            &dir,
            "available_filter_functions",
            "vfs_read\ntcp_sendmsg [tcp]\nvfs_read\n",
        );

        let oracle = SymbolOracle::load_from(&kallsyms, &filter_funcs).unwrap();
        assert_eq!(oracle.lookup("vfs_read"), Some(0xffffffff81000000));
        assert_eq!(oracle.lookup("tcp_sendmsg"), Some(0xffffffff81001000));
        assert_eq!(oracle.lookup("no_such_symbol"), None);

        assert!(oracle.is_attachable("vfs_read"));
        assert!(oracle.is_attachable("tcp_sendmsg"));
        assert!(!oracle.is_attachable("no_such_symbol"));
        // "vfs_read" was listed twice; dedup keeps the oracle's count honest.
        assert_eq!(oracle.kprobe_count(), 2);
    }
}
