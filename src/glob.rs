//! A restricted glob grammar used to gate which kernel functions are
//! considered for attachment.
//!
//! Only `*` is special, and only at the very start and/or end of the
//! pattern: `foo`, `foo*`, `*foo`, `*foo*`, and the bare `*` are legal.
//! `f*oo` or `f**oo` are not — they would require a real glob engine for a
//! one-character gain in expressiveness nobody asked for.

use std::fmt;

use crate::error::Error;
use crate::error::Result;

/// The shape a validated pattern can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// `*` — matches anything.
    Any,
    /// `X*` — matches strings starting with `X`.
    Prefix,
    /// `*X` — matches strings ending with `X`.
    Suffix,
    /// `*X*` — matches strings containing `X`.
    Substring,
    /// `X` — matches only `X` itself.
    Exact,
}

/// A single compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    kind: Kind,
}

impl Glob {
    /// Validate and compile `pattern`.
    ///
    /// Byte-exact comparison is used throughout: no case folding, no
    /// locale-awareness.
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();

        if pattern.contains("**") {
            return Err(Error::InvalidArgument(format!(
                "glob {pattern:?} contains '**', which is not a supported pattern"
            )));
        }

        let leading = pattern.starts_with('*');
        let trailing = pattern.len() > 1 && pattern.ends_with('*');
        // A single "*" is the universal pattern, not prefix-and-suffix.
        let kind = if pattern == "*" {
            Kind::Any
        } else if leading && trailing {
            Kind::Substring
        } else if leading {
            Kind::Suffix
        } else if trailing {
            Kind::Prefix
        } else {
            Kind::Exact
        };

        // Reject an embedded '*' anywhere but the first/last character,
        // e.g. "f*oo".
        let core = Self::core_str(&pattern, kind);
        if core.contains('*') {
            return Err(Error::InvalidArgument(format!(
                "glob {pattern:?} may only use '*' as its first and/or last character"
            )));
        }

        Ok(Glob { pattern, kind })
    }

    /// The pattern with its leading/trailing wildcard markers stripped.
    fn core_str(pattern: &str, kind: Kind) -> &str {
        match kind {
            Kind::Any => "",
            Kind::Prefix => &pattern[..pattern.len() - 1],
            Kind::Suffix => &pattern[1..],
            Kind::Substring => &pattern[1..pattern.len() - 1],
            Kind::Exact => pattern,
        }
    }

    /// The original, unparsed pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Test `s` against this glob. Does not allocate.
    pub fn matches(&self, s: &str) -> bool {
        let core = Self::core_str(&self.pattern, self.kind);
        match self.kind {
            Kind::Any => true,
            Kind::Prefix => s.as_bytes().starts_with(core.as_bytes()),
            Kind::Suffix => s.as_bytes().ends_with(core.as_bytes()),
            Kind::Substring => s.contains(core),
            Kind::Exact => s == core,
        }
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Convenience free function equivalent to `Glob::new(glob)?.matches(s)`, for
/// one-off checks where compiling and discarding a `Glob` is acceptable.
pub fn matches(glob: &str, s: &str) -> Result<bool> {
    Ok(Glob::new(glob)?.matches(s))
}
