//! Mass function attacher: enumerate every kernel function exported in the
//! running kernel's BTF, filter that universe down to a caller-approved
//! subset, and materialize an fentry/fexit tracing probe pair per
//! surviving function by cloning a pre-compiled prototype tracing program
//! and retargeting each clone at its BTF identifier.
//!
//! This crate implements the attach pipeline only: BTF walk, glob-based
//! filtering, signature admissibility, probe-instruction capture and
//! cloning, and attach-fd bookkeeping. It does not implement the
//! command-line surface, the telemetry consumer reading the per-function
//! event stream, the authoring of the prototype tracing program, or the
//! `/proc/kallsyms`/`available_filter_functions` parsers beyond the
//! minimal reader in [`oracle`] — those are external collaborators.
//!
//! ```no_run
//! use mass_attach::{Attacher, Options};
//!
//! # fn example(mut prototypes: impl mass_attach::PrototypeSource) -> mass_attach::Result<()> {
//! let mut attacher = Attacher::new(&mut prototypes, Options::default())?;
//! attacher.deny_glob("*_sys_*")?;
//! attacher.allow_glob("vfs_*")?;
//! attacher.prepare()?;
//! attacher.load()?;
//! attacher.attach();
//! attacher.activate()?;
//!
//! println!("attached to {} functions", attacher.func_count());
//! # Ok(())
//! # }
//! ```

mod attacher;
mod btf;
mod error;
mod glob;
mod link;
mod materializer;
mod oracle;
mod program;
mod prototype;
mod rlimit;
mod selection;
#[cfg(test)]
mod testutil;
mod util;

pub use attacher::Attacher;
pub use attacher::AttachSummary;
pub use btf::Btf;
pub use error::Error;
pub use error::Result;
pub use glob::Glob;
pub use link::Link;
pub use oracle::SymbolOracle;
pub use oracle::DEFAULT_AVAILABLE_FILTER_FUNCTIONS;
pub use oracle::DEFAULT_KALLSYMS;
pub use program::OpenProgram;
pub use prototype::PrototypeSource;
pub use selection::FuncFilter;
pub use selection::FuncInfo;
pub use selection::Options;
pub use selection::ENFORCED_DENY_GLOBS;

/// Which half of a fentry/fexit pair a prototype slot or captured
/// instruction buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fires on function entry, before the traced function runs.
    Entry,
    /// Fires on function exit, with the return value available.
    Exit,
}
