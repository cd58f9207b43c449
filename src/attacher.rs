//! The `Attacher` aggregate root: the public, one-shot builder that walks
//! `configure -> prepare -> load -> attach -> activate`.

use std::collections::HashMap;

use log::debug;
use log::info;
use log::warn;

use crate::btf::Btf;
use crate::error::Error;
use crate::error::Result;
use crate::glob::Glob;
use crate::materializer;
use crate::materializer::Attachment;
use crate::oracle::SymbolOracle;
use crate::prototype::PrototypeSlot;
use crate::prototype::PrototypeSource;
use crate::prototype::ARITY_SLOTS;
use crate::rlimit;
use crate::selection;
use crate::selection::AritySummary;
use crate::selection::FuncInfo;
use crate::selection::Options;

/// Where the one-shot builder currently stands. Each public method checks
/// (and advances) this so that, e.g., calling `load` before `prepare`
/// fails loudly instead of silently operating on an empty plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Configuring,
    Prepared,
    Loaded,
    Attached,
    Activated,
}

/// A summary of one `attach()` call: how many of the selected functions'
/// fentry/fexit pairs actually ended up attached.
///
/// The source this crate is modeled on returns success even when every
/// attach failed (open question (a) in the design notes) — we preserve
/// that default (a live kernel can legitimately lose every target between
/// `prepare` and `attach`), but hand the caller this summary so *they* can
/// decide whether zero attachments should be fatal for their use case.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachSummary {
    pub attempted: usize,
    pub fentry_attached: usize,
    pub fexit_attached: usize,
}

/// The mass function attacher.
///
/// Owns the kernel BTF and symbol-table handles, the glob lists, the
/// selected-function plan, the captured prototype instruction buffers, and
/// every per-function attach-fd and link. Borrows the caller's
/// not-yet-loaded prototype program set for the duration of `load`.
pub struct Attacher<'p> {
    btf: Btf,
    oracle: SymbolOracle,
    prototypes: &'p mut dyn PrototypeSource,
    options: Options<'p>,
    deny_globs: Vec<Glob>,
    allow_globs: Vec<Glob>,
    funcs: Vec<FuncInfo>,
    arity: AritySummary,
    slots: Option<[PrototypeSlot; ARITY_SLOTS]>,
    ip_to_id: HashMap<u64, usize>,
    attachments: Vec<Attachment>,
    stage: Stage,
}

impl<'p> Attacher<'p> {
    /// Construct an attacher against the running kernel's BTF and symbol
    /// tables, borrowing `prototypes` for the lifetime of the attacher.
    ///
    /// The enforced deny globs ([`crate::ENFORCED_DENY_GLOBS`]) are
    /// installed immediately; they cannot be removed.
    pub fn new(prototypes: &'p mut dyn PrototypeSource, options: Options<'p>) -> Result<Self> {
        let btf = Btf::load_vmlinux()?;
        let oracle = SymbolOracle::load()?;
        Self::with_btf_and_oracle(btf, oracle, prototypes, options)
    }

    /// Construct against explicit BTF and symbol-table handles — the seam
    /// tests use to run the selection engine against fixtures instead of a
    /// live kernel.
    pub fn with_btf_and_oracle(
        btf: Btf,
        oracle: SymbolOracle,
        prototypes: &'p mut dyn PrototypeSource,
        options: Options<'p>,
    ) -> Result<Self> {
        let deny_globs = selection::enforced_deny_globs()?;

        Ok(Attacher {
            btf,
            oracle,
            prototypes,
            options,
            deny_globs,
            allow_globs: Vec::new(),
            funcs: Vec::new(),
            arity: AritySummary::default(),
            slots: None,
            ip_to_id: HashMap::new(),
            attachments: Vec::new(),
            stage: Stage::Configuring,
        })
    }

    fn require_stage(&self, expected: Stage, action: &str) -> Result<()> {
        if self.stage != expected {
            return Err(Error::InvalidArgument(format!(
                "cannot {action} in stage {:?} (expected {:?})",
                self.stage, expected
            )));
        }
        Ok(())
    }

    /// Add an allow glob. Only one of `allow_glob`/`deny_glob` need be
    /// called before `prepare`; must be called before `prepare`.
    pub fn allow_glob(&mut self, pattern: impl Into<String>) -> Result<()> {
        self.require_stage(Stage::Configuring, "add an allow glob")?;
        self.allow_globs.push(Glob::new(pattern)?);
        Ok(())
    }

    /// Add a caller-supplied deny glob, in addition to the enforced list.
    pub fn deny_glob(&mut self, pattern: impl Into<String>) -> Result<()> {
        self.require_stage(Stage::Configuring, "add a deny glob")?;
        self.deny_globs.push(Glob::new(pattern)?);
        Ok(())
    }

    /// Walk BTF and build the attachment plan.
    ///
    /// Fails with [`Error::NotFound`] if no function survives the
    /// pipeline. Partial state from a failed `prepare` is still owned by
    /// `self` and released normally when it is dropped.
    pub fn prepare(&mut self) -> Result<()> {
        self.require_stage(Stage::Configuring, "prepare")?;

        let plan = selection::select(
            &self.btf,
            &self.oracle,
            &self.deny_globs,
            &self.allow_globs,
            &self.options,
        )?;

        // `verbose` only changes the level this summary is logged at; the
        // selection outcome itself never depends on it.
        if self.options.verbose || self.options.debug {
            info!(
                "selected {} functions ({} denied by glob match)",
                plan.funcs.len(),
                plan.deny_matches
            );
        } else {
            debug!(
                "selected {} functions ({} denied by glob match)",
                plan.funcs.len(),
                plan.deny_matches
            );
        }

        self.funcs = plan.funcs;
        self.arity = plan.arity;
        self.ip_to_id.reserve(self.funcs.len());
        self.stage = Stage::Prepared;
        Ok(())
    }

    /// Capture the prototype instruction streams and clone one fentry/fexit
    /// pair per selected function.
    ///
    /// Before this runs, the process' memlock and open-file rlimits are
    /// raised (see [`crate::rlimit`]); failure there is fatal, matching the
    /// source's treatment of rlimit failures as unrecoverable rather than
    /// best-effort.
    pub fn load(&mut self) -> Result<()> {
        self.require_stage(Stage::Prepared, "load")?;

        rlimit::raise_limits(self.options.max_fileno_rlimit)?;

        // `debug_extra` implies `debug`: either one loads the prototypes for
        // real so verifier diagnostics surface through the consumer's own
        // load call.
        let debug_load = self.options.debug || self.options.debug_extra;
        let slots = materializer::prepare_prototypes(
            self.prototypes,
            &self.arity,
            &self.funcs,
            debug_load,
        )?;

        materializer::clone_all(
            &slots,
            &mut self.funcs,
            &mut self.ip_to_id,
            self.options.debug_extra,
        )?;

        debug_assert_eq!(self.ip_to_id.len(), self.funcs.len());
        self.slots = Some(slots);
        self.stage = Stage::Loaded;
        Ok(())
    }

    /// Open one attach handle per cloned program. Per-function failures are
    /// logged and do not fail the call; see [`AttachSummary`].
    pub fn attach(&mut self) -> AttachSummary {
        if self.stage != Stage::Loaded {
            warn!("attach() called out of order (stage {:?}); ignoring", self.stage);
            return AttachSummary::default();
        }

        self.attachments = materializer::attach_all(&self.funcs);
        self.stage = Stage::Attached;

        let summary = AttachSummary {
            attempted: self.funcs.len(),
            fentry_attached: self.attachments.iter().filter(|a| a.fentry.is_some()).count(),
            fexit_attached: self.attachments.iter().filter(|a| a.fexit.is_some()).count(),
        };
        if summary.attempted > 0 && summary.fentry_attached == 0 && summary.fexit_attached == 0 {
            warn!("every attach attempt failed ({} functions)", summary.attempted);
        }
        summary
    }

    /// Flip the shared activation flag. Until this runs, the prototype
    /// programs — which check the flag on entry — are inert. Never reset
    /// once set.
    pub fn activate(&mut self) -> Result<()> {
        self.require_stage(Stage::Attached, "activate")?;
        self.prototypes.set_active(true)?;
        self.stage = Stage::Activated;
        Ok(())
    }

    /// Number of selected functions.
    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }

    /// Borrow the `i`th selected function.
    pub fn func(&self, i: usize) -> Option<&FuncInfo> {
        self.funcs.get(i)
    }

    /// Every selected function, in plan order.
    pub fn funcs(&self) -> &[FuncInfo] {
        &self.funcs
    }

    /// The kernel BTF handle.
    pub fn btf(&self) -> &Btf {
        &self.btf
    }

    /// The `addr -> index` map populated during `load`.
    pub fn ip_to_id(&self) -> &HashMap<u64, usize> {
        &self.ip_to_id
    }

    /// Release every owned resource: instruction buffers, per-function fds
    /// and links, the symbol table, and the BTF handle. Equivalent to
    /// dropping the attacher; provided as an explicit, self-documenting
    /// call for callers who would rather not rely on scope-exit drop.
    pub fn free(self) {
        drop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::OpenProgram;
    use crate::testutil::build_oracle;
    use crate::testutil::BtfFixture;

    struct NullPrototypes;

    impl PrototypeSource for NullPrototypes {
        fn fentry(&mut self, _arity: u8) -> Option<&mut OpenProgram> {
            None
        }
        fn fexit(&mut self, _arity: u8) -> Option<&mut OpenProgram> {
            None
        }
        fn set_active(&mut self, _active: bool) -> Result<()> {
            Ok(())
        }
    }

    fn fixture_attacher(prototypes: &mut NullPrototypes) -> Attacher<'_> {
        let mut b = BtfFixture::new();
        let int_ty = b.int("int", 32);
        let proto = b.func_proto(int_ty, &[]);
        b.func("vfs_read", proto);
        let btf = Btf::from_bytes(&b.build()).unwrap();
        let oracle = build_oracle(&["vfs_read"]);

        Attacher::with_btf_and_oracle(btf, oracle, prototypes, Options::default()).unwrap()
    }

    #[test]
    fn allow_glob_rejected_once_past_configuring_stage() {
        let mut prototypes = NullPrototypes;
        let mut attacher = fixture_attacher(&mut prototypes);
        attacher.prepare().unwrap();

        let err = attacher.allow_glob("vfs_*").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn deny_glob_rejected_once_past_configuring_stage() {
        let mut prototypes = NullPrototypes;
        let mut attacher = fixture_attacher(&mut prototypes);
        attacher.prepare().unwrap();

        let err = attacher.deny_glob("vfs_*").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn load_rejected_before_prepare() {
        let mut prototypes = NullPrototypes;
        let mut attacher = fixture_attacher(&mut prototypes);

        let err = attacher.load().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn activate_rejected_before_attach() {
        let mut prototypes = NullPrototypes;
        let mut attacher = fixture_attacher(&mut prototypes);
        attacher.prepare().unwrap();

        let err = attacher.activate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn attach_out_of_order_is_ignored_not_fatal() {
        // `attach()` logs a `warn!` on the out-of-order path this test
        // exercises; wire up `env_logger` so that line is visible in the
        // test output on failure instead of silently swallowed.
        let _ = env_logger::try_init();

        let mut prototypes = NullPrototypes;
        let mut attacher = fixture_attacher(&mut prototypes);

        let summary = attacher.attach();
        assert_eq!(summary.attempted, 0);
    }
}
