//! Diagnostics: typed entries, well-known ids and the engine that collects
//! them.
//!
//! Every fallible operation in the crate returns `Result<T, DiagnosticEntry>`.
//! The engine records raised entries, mirrors the informational kinds to the
//! `log` crate and latches a module-wide failure flag for the error kinds;
//! phase drivers consult the flag at phase boundaries.

use std::fmt;
use std::sync::Mutex;

/// Severity classes for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticKind {
    /// Informational note attached to another diagnostic
    Note,
    /// Verbose-only progress reporting
    Verbose,
    /// A condition the link can proceed past
    Warning,
    /// A warning promoted to be always shown
    CriticalWarning,
    /// An error; the link fails but the phase runs to completion
    Error,
    /// An error that aborts the current phase
    Fatal,
    /// An invariant violation inside the linker itself
    InternalError,
}

impl DiagnosticKind {
    /// Whether raising this kind marks the link as failed.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            DiagnosticKind::Error | DiagnosticKind::Fatal | DiagnosticKind::InternalError
        )
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::Note => "note",
            DiagnosticKind::Verbose => "verbose",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::CriticalWarning => "critical warning",
            DiagnosticKind::Error => "error",
            DiagnosticKind::Fatal => "fatal error",
            DiagnosticKind::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// Identifier of a diagnostic message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagId(pub u32);

macro_rules! diag_ids {
    ($($(#[$attr:meta])* $name:ident = $value:expr => $fmtstr:expr;)*) => {
        impl DiagId {
            $(
                $(#[$attr])*
                pub const $name: DiagId = DiagId($value);
            )*

            /// The format string for this id, with `%N` placeholders for
            /// the entry's positional arguments.
            pub fn format_str(self) -> &'static str {
                match self.0 {
                    $($value => $fmtstr,)*
                    _ => "unknown diagnostic %0",
                }
            }
        }
    };
}

diag_ids! {
    /// Catch-all id for ad-hoc messages carried entirely in argument 0
    PLAIN = 0 => "%0";
    UNDEFINED_REFERENCE = 1 => "undefined reference to `%0' referenced from %1";
    MULTIPLE_DEFINITION = 2 => "multiple definition of `%0'; defined in %1, also defined in %2";
    ERROR_MEMORY_REGION_EXCEEDED_LIMIT = 3 =>
        "memory region `%0' exceeded its limit; first section that does not fit: `%1'";
    WARN_MEMORY_REGION_ZERO_SIZED = 4 => "memory region `%0' has zero size";
    VERBOSE_VERIFIED_MEMORY_REGION = 5 => "verified memory region `%0'";
    ERROR_UNDEFINED_MEMORY_REGION = 6 => "%0 undefined memory region `%1' referenced";
    ERROR_REGION_ALIAS_UNDEFINED = 7 => "REGION_ALIAS `%0' refers to undefined memory region `%1'";
    ERROR_REGION_ALIAS_DUPLICATE = 8 => "REGION_ALIAS `%0' is already defined";
    ERROR_INVERTED_ATTRIBUTES_ALLOWED_ONLY_ONCE = 9 =>
        "memory region `%0' uses the attribute inversion `!' more than once";
    WARN_NON_POWER_OF_2_VALUE_TO_ALIGN_BUILTIN = 10 =>
        "%0 ALIGN was given the non power of 2 value 0x%1";
    ERROR_DIVISION_BY_ZERO = 11 => "%0 division by zero in expression `%1'";
    ERROR_MODULO_BY_ZERO = 12 => "%0 modulo by zero in expression `%1'";
    ERROR_UNDEFINED_SYMBOL_IN_EXPRESSION = 13 => "%0 undefined symbol `%1' in expression";
    ERROR_UNDEFINED_SECTION_IN_EXPRESSION = 14 =>
        "%0 `%1' queries section `%2' which does not exist";
    ERROR_SIZEOF_SEGMENT_WITHOUT_PHDRS = 15 =>
        "%0 SIZEOF(%1) names a segment but the script has no PHDRS command";
    ERROR_ASSERT_FAILED = 16 => "%0 assertion failed: %1";
    FATAL_CANNOT_READ_INPUT = 17 => "cannot read input file %0: %1";
    ERROR_INVALID_ELF = 18 => "%0: invalid ELF file: %1";
    ERROR_INCOMPATIBLE_MACHINE = 19 =>
        "%0: machine %1 is incompatible with the link target %2";
    FATAL_MISSING_INCLUDE = 20 => "INCLUDE file `%0' not found";
    ERROR_UNSUPPORTED_RELOC = 21 => "unsupported relocation %0 against `%1' in %2";
    ERROR_RELOC_OVERFLOW = 22 =>
        "relocation %0 against `%1' overflows: value 0x%2 does not fit (from %3)";
    ERROR_RELOC_BAD_ALIGNMENT = 23 =>
        "relocation %0 against `%1': value 0x%2 is not aligned to %3 bytes";
    ERROR_ORPHAN_LO_RELOC = 24 => "%0: paired low-part relocation without a matching high part";
    ERROR_UNRESOLVED_PAIRED_HI = 25 => "%0: cannot find paired pcrel_hi relocation for `%1'";
    ERROR_CROSS_REFERENCE_PROHIBITED = 26 =>
        "prohibited cross reference from `%0' to `%1' in NOCROSSREFS group";
    ERROR_DUPLICATE_OUTPUT_SECTION_PHDR = 27 => "section `%0' names undefined PHDR `%1'";
    ERROR_SEGMENT_PERMISSION_MISMATCH = 28 =>
        "sections assigned to PT_LOAD segment `%0' have incompatible permissions";
    ERROR_ARCHIVE_MALFORMED = 29 => "%0: malformed archive: %1";
    ERROR_NOT_FOUND_LIBRARY = 30 => "cannot find library `%0'";
    ERROR_SCRIPT_SYNTAX = 31 => "%0 linker script syntax error: %1";
    ERROR_COMMON_REDEFINED = 32 => "common symbol `%0' cannot be redefined with --no-define-common";
    TRACE_GC_SECTION = 33 => "removing unused section `%0' from %1";
    TRACE_GC_CREF = 34 => "gc-cref: `%0' is referenced from section `%1' (%2)";
    VERBOSE_RELAX_REWRITE = 35 => "relaxation: rewrote %0 at 0x%1 in `%2' (%3 bytes removed)";
    VERBOSE_RELAX_HI20_TO_LUI = 36 =>
        "relaxation: rewrote pcrel hi/lo against `%0' to absolute lui/addi";
    ERROR_BITCODE_UNSUPPORTED = 37 => "%0: bitcode input requires an LTO backend";
    ERROR_DECOMPRESS_FAILED = 38 => "%0: cannot decompress section `%1': %2";
    WARN_UNSUPPORTED_COMPRESSION = 39 => "%0: section `%1' uses unsupported compression type %2";
    ERROR_SYMDEF_WRITE = 40 => "cannot write symdef file %0: %1";
    ERROR_OUTPUT_WRITE = 41 => "cannot write output file %0: %1";
    ERROR_ENTRY_UNDEFINED = 42 => "entry symbol `%0' is not defined";
    ERROR_PHDR_NO_LOAD_SEGMENT = 43 => "no PT_LOAD segment to place section `%0'";
    ERROR_WRONG_STATE = 44 => "operation `%0' invoked in link state %1";
    ERROR_PLUGIN_FAILED = 45 => "plugin `%0' failed: %1";
    ERROR_EXPR_CONTEXT_UNSET = 46 => "expression evaluated with no source context";
    WARN_ATTRIBUTE_MISMATCH = 47 => "%0: architecture attributes differ from the output (%1)";
    ERROR_GROUP_NESTED = 48 => "GROUP cannot be nested inside GROUP";
    ERROR_DYNAMIC_REQUIRED = 49 =>
        "relocation %0 against `%1' cannot be used in a static link; recompile with -fPIC";
}

/// A raised diagnostic: id, severity, positional arguments and an optional
/// `file:line` context injected by expression evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct DiagnosticEntry {
    /// The message id
    pub id: DiagId,
    /// Severity
    pub kind: DiagnosticKind,
    /// Positional arguments substituted into the localized format
    pub args: Vec<String>,
    /// Source context (`file:line`) when the diagnostic originates from a
    /// linker-script expression
    pub context: Option<String>,
}

impl DiagnosticEntry {
    /// A new entry with positional arguments.
    pub fn new(id: DiagId, kind: DiagnosticKind, args: Vec<String>) -> Self {
        DiagnosticEntry {
            id,
            kind,
            args,
            context: None,
        }
    }

    /// An error-kind entry.
    pub fn error(id: DiagId, args: Vec<String>) -> Self {
        Self::new(id, DiagnosticKind::Error, args)
    }

    /// A fatal-kind entry.
    pub fn fatal(id: DiagId, args: Vec<String>) -> Self {
        Self::new(id, DiagnosticKind::Fatal, args)
    }

    /// A warning-kind entry.
    pub fn warning(id: DiagId, args: Vec<String>) -> Self {
        Self::new(id, DiagnosticKind::Warning, args)
    }

    /// An ad-hoc message not worth a dedicated id.
    pub fn plain(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(DiagId::PLAIN, kind, vec![message.into()])
    }

    /// Attach (or replace) the source context of the entry. The context is
    /// prepended as argument 0 when the format string starts with `%0 `.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Render the message by substituting `%N` placeholders.
    pub fn message(&self) -> String {
        let fmt = self.id.format_str();
        let mut out = String::with_capacity(fmt.len() + 32);
        let ctx_arg;
        let args: &[String] = if fmt.starts_with("%0 ") && self.context.is_some() {
            ctx_arg = {
                let mut v = Vec::with_capacity(self.args.len() + 1);
                if let Some(c) = &self.context {
                    v.push(format!("{c}:"));
                }
                v.extend(self.args.iter().cloned());
                v
            };
            &ctx_arg
        } else {
            &self.args
        };
        let mut chars = fmt.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%' {
                if let Some(d) = chars.peek().and_then(|p| p.to_digit(10)) {
                    chars.next();
                    if let Some(arg) = args.get(d as usize) {
                        out.push_str(arg);
                    }
                    continue;
                }
            }
            out.push(c);
        }
        out
    }
}

impl fmt::Display for DiagnosticEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiagnosticEntry>;

#[derive(Debug, Default)]
struct EngineState {
    entries: Vec<DiagnosticEntry>,
    failed: bool,
    fatal: bool,
}

/// Collects diagnostics for one link. Interior-mutable so parallel phases
/// can raise through a shared reference.
#[derive(Debug, Default)]
pub struct DiagnosticEngine {
    state: Mutex<EngineState>,
}

impl DiagnosticEngine {
    /// A fresh engine with no recorded entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry, latch failure for error kinds and mirror the
    /// informational kinds to `log`.
    pub fn raise(&self, entry: DiagnosticEntry) {
        match entry.kind {
            DiagnosticKind::Verbose => log::debug!("{}", entry.message()),
            DiagnosticKind::Note => log::info!("{}", entry.message()),
            DiagnosticKind::Warning | DiagnosticKind::CriticalWarning => {
                log::warn!("{}", entry.message())
            }
            _ => log::error!("{}", entry.message()),
        }
        if let Ok(mut st) = self.state.lock() {
            if entry.kind.is_failure() {
                st.failed = true;
            }
            if matches!(
                entry.kind,
                DiagnosticKind::Fatal | DiagnosticKind::InternalError
            ) {
                st.fatal = true;
            }
            st.entries.push(entry);
        }
    }

    /// Record the error side of a `Result` and return whether it was `Ok`.
    pub fn consume<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.raise(e);
                None
            }
        }
    }

    /// Whether any failure-kind diagnostic has been raised.
    pub fn has_failure(&self) -> bool {
        self.state.lock().map(|st| st.failed).unwrap_or(true)
    }

    /// Whether a fatal diagnostic has been raised; phase drivers abort at
    /// the next boundary.
    pub fn has_fatal(&self) -> bool {
        self.state.lock().map(|st| st.fatal).unwrap_or(true)
    }

    /// Snapshot of every entry raised so far.
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.state
            .lock()
            .map(|st| st.entries.clone())
            .unwrap_or_default()
    }

    /// Number of entries of the given kind.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.state
            .lock()
            .map(|st| st.entries.iter().filter(|e| e.kind == kind).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_substitution() {
        let e = DiagnosticEntry::error(
            DiagId::MULTIPLE_DEFINITION,
            vec!["foo".into(), "a.o".into(), "b.o".into()],
        );
        assert_eq!(
            e.message(),
            "multiple definition of `foo'; defined in a.o, also defined in b.o"
        );
    }

    #[test]
    fn test_context_prepended_as_arg0() {
        let e = DiagnosticEntry::error(
            DiagId::ERROR_DIVISION_BY_ZERO,
            vec!["0x10 / 0x0".into()],
        )
        .with_context("script.t:12");
        assert_eq!(
            e.message(),
            "script.t:12: division by zero in expression `0x10 / 0x0'"
        );
    }

    #[test]
    fn test_engine_failure_latch() {
        let engine = DiagnosticEngine::new();
        engine.raise(DiagnosticEntry::warning(
            DiagId::WARN_MEMORY_REGION_ZERO_SIZED,
            vec!["RAM".into()],
        ));
        assert!(!engine.has_failure());
        engine.raise(DiagnosticEntry::error(
            DiagId::UNDEFINED_REFERENCE,
            vec!["foo".into(), "a.o".into()],
        ));
        assert!(engine.has_failure());
        assert!(!engine.has_fatal());
        engine.raise(DiagnosticEntry::fatal(
            DiagId::FATAL_MISSING_INCLUDE,
            vec!["mem.ld".into()],
        ));
        assert!(engine.has_fatal());
        assert_eq!(engine.count(DiagnosticKind::Warning), 1);
    }
}
