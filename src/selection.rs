//! The selection engine (component C4): walks BTF, applies deny/allow
//! globs and the oracles, and builds the attachment plan.

use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;

use crate::btf::check_admissible;
use crate::btf::Btf;
use crate::error::Error;
use crate::error::Result;
use crate::glob::Glob;
use crate::oracle::SymbolOracle;

/// Deny globs that are always in effect and cannot be overridden by the
/// caller. They guard against tracer-induced recursion (`rcu_read_lock`,
/// `migrate_{en,dis}able`), trampoline re-entry
/// (`__bpf_prog_{enter,exit}*`), and kernel fexit-on-long-sleeping-syscall
/// faults (`*_sys_select`, `*_sys_epoll_wait`, `*_sys_ppoll`).
pub const ENFORCED_DENY_GLOBS: &[&str] = &[
    "bpf_get_smp_processor_id",
    "migrate_enable",
    "migrate_disable",
    "rcu_read_lock*",
    "rcu_read_unlock*",
    "__bpf_prog_enter*",
    "__bpf_prog_exit*",
    "*_sys_select",
    "*_sys_epoll_wait",
    "*_sys_ppoll",
];

/// A caller-supplied predicate consulted as the last gate in the selection
/// pipeline, given the BTF, the function's id and name, and the index it
/// would receive in the plan if accepted.
pub type FuncFilter<'f> = dyn Fn(&Btf, u32, &str, usize) -> bool + 'f;

/// One selected kernel function.
///
/// `fentry_fd`/`fexit_fd` own their program fds directly: there is no
/// enclosing `bpf_object` skeleton tracking them the way a statically
/// compiled object's programs would be, since each clone is built straight
/// from a captured instruction buffer. Owning them as `OwnedFd` means
/// dropping a `FuncInfo` — or the `Attacher` that owns the whole plan —
/// closes every program fd without a separate teardown pass.
#[derive(Debug)]
pub struct FuncInfo {
    /// Kernel virtual address.
    pub addr: u64,
    /// Function name.
    pub name: String,
    /// BTF id of the `FUNC` entry.
    pub btf_id: u32,
    /// Parameter count, `0..=11`.
    pub arg_cnt: u8,
    /// Attached fentry program fd, set during `load`.
    pub(crate) fentry_fd: Option<OwnedFd>,
    /// Attached fexit program fd, set during `load`.
    pub(crate) fexit_fd: Option<OwnedFd>,
}

impl FuncInfo {
    fn new(addr: u64, name: String, btf_id: u32, arg_cnt: u8) -> Self {
        FuncInfo {
            addr,
            name,
            btf_id,
            arg_cnt,
            fentry_fd: None,
            fexit_fd: None,
        }
    }

    /// The fentry program's attach fd, if `load` has run.
    pub fn fentry_fd(&self) -> Option<i32> {
        self.fentry_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// The fexit program's attach fd, if `load` has run.
    pub fn fexit_fd(&self) -> Option<i32> {
        self.fexit_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Take ownership of a freshly-loaded fentry program fd.
    ///
    /// # Safety
    /// `fd` must be a valid, uniquely-owned program fd.
    pub(crate) unsafe fn set_fentry_fd(&mut self, fd: i32) {
        self.fentry_fd = Some(OwnedFd::from_raw_fd(fd));
    }

    /// Take ownership of a freshly-loaded fexit program fd.
    ///
    /// # Safety
    /// `fd` must be a valid, uniquely-owned program fd.
    pub(crate) unsafe fn set_fexit_fd(&mut self, fd: i32) {
        self.fexit_fd = Some(OwnedFd::from_raw_fd(fd));
    }
}

/// Options controlling selection and resource limits.
#[derive(Default)]
pub struct Options<'f> {
    /// Hard cap on the number of selected functions. `0` means unlimited.
    pub max_func_cnt: usize,
    /// Target open-file rlimit. `0` means "use the crate default".
    pub max_fileno_rlimit: u64,
    /// Log the selection summary at `info` instead of `debug`.
    pub verbose: bool,
    /// Really load each prototype (instead of only capturing its
    /// instructions) so the kernel verifier's diagnostics surface through
    /// the consumer's own load call. Implies `verbose`.
    pub debug: bool,
    /// Log one line per cloned program pair, the highest-volume detail this
    /// crate emits. Implies `debug`.
    pub debug_extra: bool,
    /// Last gate in the selection pipeline.
    pub func_filter: Option<Box<FuncFilter<'f>>>,
}

impl<'f> std::fmt::Debug for Options<'f> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("max_func_cnt", &self.max_func_cnt)
            .field("max_fileno_rlimit", &self.max_fileno_rlimit)
            .field("verbose", &self.verbose)
            .field("debug", &self.debug)
            .field("debug_extra", &self.debug_extra)
            .field("func_filter", &self.func_filter.is_some())
            .finish()
    }
}

/// Per-arity selected-function counts, used by the materializer to decide
/// which prototype slots need loading and which representative function to
/// point each slot's attach target at.
#[derive(Debug, Default, Clone)]
pub struct AritySummary {
    pub counts: [usize; crate::prototype::ARITY_SLOTS],
    pub first_index: [Option<usize>; crate::prototype::ARITY_SLOTS],
}

impl AritySummary {
    fn record(&mut self, arg_cnt: u8, index: usize) {
        let arity = arg_cnt as usize;
        if self.counts[arity] == 0 {
            self.first_index[arity] = Some(index);
        }
        self.counts[arity] += 1;
    }
}

/// The result of [`select`]: the attachment plan plus the per-arity
/// bookkeeping the materializer needs.
pub struct Plan {
    pub funcs: Vec<FuncInfo>,
    pub arity: AritySummary,
    /// Count of functions skipped by a deny-glob match (diagnostic only).
    pub deny_matches: usize,
}

/// Walk every BTF `FUNC` entry in ascending id order and build the
/// attachment plan.
///
/// See the module-level algorithm in the design doc: symbol resolution,
/// deny globs (enforced first, then caller-supplied), allow globs,
/// kprobe-attachability, BTF admissibility, the `max_func_cnt` cap, and
/// finally the caller's filter.
pub fn select(
    btf: &Btf,
    oracle: &SymbolOracle,
    deny_globs: &[Glob],
    allow_globs: &[Glob],
    options: &Options<'_>,
) -> Result<Plan> {
    let mut funcs = Vec::new();
    let mut arity = AritySummary::default();
    let mut deny_matches = 0usize;

    for func_id in btf.iter_func_ids() {
        let name = match btf.func_name(func_id) {
            Ok(n) if !n.is_empty() => n,
            _ => continue,
        };

        let addr = match oracle.lookup(name) {
            Some(a) => a,
            None => continue,
        };

        if deny_globs.iter().any(|g| g.matches(name)) {
            deny_matches += 1;
            continue;
        }

        if !allow_globs.is_empty() && !allow_globs.iter().any(|g| g.matches(name)) {
            continue;
        }

        if !oracle.is_attachable(name) {
            continue;
        }

        let arg_cnt = match check_admissible(btf, func_id) {
            Ok(cnt) => cnt,
            Err(_) => continue,
        };

        if options.max_func_cnt > 0 && funcs.len() >= options.max_func_cnt {
            break;
        }

        let index = funcs.len();
        if let Some(filter) = &options.func_filter {
            if !filter(btf, func_id, name, index) {
                continue;
            }
        }

        arity.record(arg_cnt, index);
        funcs.push(FuncInfo::new(addr, name.to_owned(), func_id, arg_cnt));
    }

    if funcs.is_empty() {
        return Err(Error::NotFound(
            "no kernel functions matched the configured selection".into(),
        ));
    }

    Ok(Plan {
        funcs,
        arity,
        deny_matches,
    })
}

/// Compile the enforced deny globs. Infallible in practice (the list is a
/// compile-time constant known to be well-formed), but returns `Result` to
/// keep the call site uniform with caller-supplied globs.
pub fn enforced_deny_globs() -> Result<Vec<Glob>> {
    ENFORCED_DENY_GLOBS
        .iter()
        .map(|pattern| Glob::new(*pattern))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::build_oracle;
    use crate::testutil::BtfFixture;

    /// A BTF universe where every named function shares one admissible
    /// `int (void)` signature — the shape of the signature doesn't matter to
    /// these tests, only which names survive the glob/oracle/cap gates.
    fn admissible_universe(names: &[&str]) -> Btf {
        let mut b = BtfFixture::new();
        let int_ty = b.int("int", 32);
        let proto = b.func_proto(int_ty, &[]);
        for name in names {
            b.func(name, proto);
        }
        Btf::from_bytes(&b.build()).unwrap()
    }

    fn selected_names(plan: &Plan) -> Vec<&str> {
        plan.funcs.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn deny_glob_filters_matching_names() {
        let btf = admissible_universe(&["sys_open", "sys_close", "vfs_read"]);
        let oracle = build_oracle(&["sys_open", "sys_close", "vfs_read"]);
        let deny = vec![Glob::new("sys_*").unwrap()];

        let plan = select(&btf, &oracle, &deny, &[], &Options::default()).unwrap();
        assert_eq!(selected_names(&plan), vec!["vfs_read"]);
        assert_eq!(plan.deny_matches, 2);
    }

    #[test]
    fn allow_glob_keeps_only_matching_names() {
        let btf = admissible_universe(&["vfs_read", "vfs_write", "tcp_sendmsg"]);
        let oracle = build_oracle(&["vfs_read", "vfs_write", "tcp_sendmsg"]);
        let allow = vec![Glob::new("vfs_*").unwrap()];

        let plan = select(&btf, &oracle, &[], &allow, &Options::default()).unwrap();
        assert_eq!(selected_names(&plan), vec!["vfs_read", "vfs_write"]);
    }

    #[test]
    fn enforced_deny_globs_apply_regardless_of_caller_config() {
        let btf = admissible_universe(&["rcu_read_lock", "vfs_read"]);
        let oracle = build_oracle(&["rcu_read_lock", "vfs_read"]);
        let deny = enforced_deny_globs().unwrap();

        let plan = select(&btf, &oracle, &deny, &[], &Options::default()).unwrap();
        assert_eq!(selected_names(&plan), vec!["vfs_read"]);
    }

    #[test]
    fn inadmissible_signatures_are_silently_skipped_not_fatal() {
        let mut b = BtfFixture::new();
        let int_ty = b.int("int", 32);
        let good_proto = b.func_proto(int_ty, &[]);
        b.func("good_func", good_proto);
        // void return, the inadmissible shape `check_admissible` rejects.
        let void_proto = b.func_proto(0, &[]);
        b.func("void_func", void_proto);
        let btf = Btf::from_bytes(&b.build()).unwrap();
        let oracle = build_oracle(&["good_func", "void_func"]);

        let plan = select(&btf, &oracle, &[], &[], &Options::default()).unwrap();
        assert_eq!(selected_names(&plan), vec!["good_func"]);
    }

    #[test]
    fn max_func_cnt_caps_without_failing() {
        let btf = admissible_universe(&["a_func", "b_func", "c_func"]);
        let oracle = build_oracle(&["a_func", "b_func", "c_func"]);
        let options = Options {
            max_func_cnt: 2,
            ..Options::default()
        };

        let plan = select(&btf, &oracle, &[], &[], &options).unwrap();
        assert_eq!(plan.funcs.len(), 2);
    }

    #[test]
    fn func_filter_is_the_last_gate() {
        let btf = admissible_universe(&["keep_me", "skip_me"]);
        let oracle = build_oracle(&["keep_me", "skip_me"]);
        let options = Options {
            func_filter: Some(Box::new(|_btf, _id, name, _idx| name == "keep_me")),
            ..Options::default()
        };

        let plan = select(&btf, &oracle, &[], &[], &options).unwrap();
        assert_eq!(selected_names(&plan), vec!["keep_me"]);
    }

    #[test]
    fn no_survivors_is_not_found() {
        let btf = admissible_universe(&["vfs_read"]);
        let oracle = build_oracle(&["vfs_read"]);
        let deny = vec![Glob::new("*").unwrap()];

        let err = select(&btf, &oracle, &deny, &[], &Options::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn enforced_globs_compile() {
        let globs = enforced_deny_globs().unwrap();
        assert_eq!(globs.len(), ENFORCED_DENY_GLOBS.len());
        assert!(globs.iter().any(|g| g.matches("rcu_read_lock")));
        assert!(globs.iter().any(|g| g.matches("rcu_read_lock_bh")));
        assert!(globs.iter().any(|g| g.matches("__x64_sys_ppoll")));
    }

    #[test]
    fn arity_summary_records_first_index_only() {
        let mut summary = AritySummary::default();
        summary.record(2, 0);
        summary.record(2, 1);
        summary.record(3, 2);
        assert_eq!(summary.counts[2], 2);
        assert_eq!(summary.first_index[2], Some(0));
        assert_eq!(summary.counts[3], 1);
        assert_eq!(summary.first_index[3], Some(2));
        assert_eq!(summary.counts[0], 0);
        assert_eq!(summary.first_index[0], None);
    }
}
