//! Link configuration.
//!
//! [`LinkConfig`] is the boundary between the option-parsing front end
//! (outside this crate) and the core: every command-line knob the core
//! honors is a typed field here. Built with `TypedBuilder` so embedders
//! and tests spell out only what they need.

use crate::elf::{ElfClass, ElfEndian, ElfMachine};
use std::collections::HashMap;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

/// What kind of ELF file the link produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// `ET_EXEC` executable
    #[default]
    Exec,
    /// Position-independent executable
    Pie,
    /// `-shared`: `ET_DYN` shared object
    Dyn,
    /// `-r`: relocatable output
    Relocatable,
}

/// `--unresolved-symbols=` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    /// Report every unresolved symbol
    #[default]
    ReportAll,
    /// Ignore all unresolved symbols
    IgnoreAll,
    /// Ignore unresolved symbols from relocatable objects
    IgnoreInObjectFiles,
    /// Ignore unresolved symbols from shared libraries
    IgnoreInSharedLibs,
}

/// `--MapStyle=` selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapStyle {
    /// Plain-text map file
    #[default]
    Txt,
    /// YAML map file
    Yaml,
}

/// One element of the command line's input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRequest {
    /// A positional file path (object, archive, shared object or script)
    File(PathBuf),
    /// `-l name`
    Library(String),
    /// `--start-group` / `GROUP(`
    StartGroup,
    /// `--end-group` / `)`
    EndGroup,
}

/// A `--defsym NAME=EXPR` definition; the expression text is parsed with
/// the linker-script expression grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefSym {
    pub name: String,
    pub expr: String,
}

/// The full set of options the core consumes.
#[derive(Debug, Clone, TypedBuilder)]
pub struct LinkConfig {
    /// `-o`
    #[builder(default = PathBuf::from("a.out"), setter(into))]
    pub output: PathBuf,
    /// Output file kind
    #[builder(default)]
    pub kind: OutputKind,
    /// `-static`: never search shared libraries, no dynamic section
    #[builder(default)]
    pub is_static: bool,
    /// Target machine; inferred from the first ELF input when `None`
    #[builder(default, setter(strip_option))]
    pub machine: Option<ElfMachine>,
    /// Target class; inferred from the first ELF input when `None`
    #[builder(default, setter(strip_option))]
    pub class: Option<ElfClass>,
    /// Target byte order; inferred from the first ELF input when `None`
    #[builder(default, setter(strip_option))]
    pub endian: Option<ElfEndian>,
    /// `-m` emulation string, recorded for `OUTPUT_FORMAT` cross-checks
    #[builder(default, setter(into, strip_option))]
    pub emulation: Option<String>,
    /// Inputs in command-line order
    #[builder(default)]
    pub inputs: Vec<InputRequest>,
    /// `-L` search directories, in order
    #[builder(default)]
    pub search_dirs: Vec<PathBuf>,
    /// `--sysroot=`; applied to `=`-prefixed search paths
    #[builder(default, setter(strip_option))]
    pub sysroot: Option<PathBuf>,
    /// `-T script` files, processed before positional inputs
    #[builder(default)]
    pub scripts: Vec<PathBuf>,
    /// Inline script text, processed as if included first (test hook and
    /// embedder convenience)
    #[builder(default, setter(into, strip_option))]
    pub script_text: Option<String>,
    /// `-e` / `ENTRY` override
    #[builder(default, setter(into, strip_option))]
    pub entry: Option<String>,
    /// `-u` / `--undefined`
    #[builder(default)]
    pub undefined: Vec<String>,
    /// `--defsym`
    #[builder(default)]
    pub defsym: Vec<DefSym>,
    /// `--wrap=SYM`, one entry per wrapped symbol
    #[builder(default)]
    pub wrap: Vec<String>,
    /// `--version-script=`
    #[builder(default, setter(strip_option))]
    pub version_script: Option<PathBuf>,
    /// `--dynamic-list=`
    #[builder(default, setter(strip_option))]
    pub dynamic_list: Option<PathBuf>,
    /// `--unresolved-symbols=`
    #[builder(default)]
    pub unresolved: UnresolvedPolicy,
    /// `--allow-multiple-definition`
    #[builder(default)]
    pub allow_multiple_definition: bool,
    /// `--no-define-common`
    #[builder(default)]
    pub no_define_common: bool,
    /// `--gc-sections`
    #[builder(default)]
    pub gc_sections: bool,
    /// `--print-gc-sections`
    #[builder(default)]
    pub print_gc_sections: bool,
    /// `--gc-cref=SYM`
    #[builder(default, setter(into, strip_option))]
    pub gc_cref: Option<String>,
    /// `--relax` / `--no-relax`
    #[builder(default = true)]
    pub relax: bool,
    /// `-Ttext`
    #[builder(default, setter(strip_option))]
    pub text_segment: Option<u64>,
    /// `-Tdata`
    #[builder(default, setter(strip_option))]
    pub data_segment: Option<u64>,
    /// `-Tbss`
    #[builder(default, setter(strip_option))]
    pub bss_segment: Option<u64>,
    /// `--section-start=NAME=ADDR`
    #[builder(default)]
    pub section_start: HashMap<String, u64>,
    /// `--image-base`
    #[builder(default, setter(strip_option))]
    pub image_base: Option<u64>,
    /// `-Bsymbolic`
    #[builder(default)]
    pub bsymbolic: bool,
    /// `--export-dynamic`
    #[builder(default)]
    pub export_dynamic: bool,
    /// `--export-dynamic-symbol`
    #[builder(default)]
    pub export_dynamic_symbols: Vec<String>,
    /// `-soname`
    #[builder(default, setter(into, strip_option))]
    pub soname: Option<String>,
    /// `--dynamic-linker`
    #[builder(default, setter(into, strip_option))]
    pub dynamic_linker: Option<String>,
    /// `-z execstack`
    #[builder(default)]
    pub z_execstack: bool,
    /// `-z relro` (on by default for dynamic outputs)
    #[builder(default = true)]
    pub z_relro: bool,
    /// `-z now`
    #[builder(default)]
    pub z_now: bool,
    /// `--build-id`
    #[builder(default)]
    pub build_id: bool,
    /// `-Map=`
    #[builder(default, setter(strip_option))]
    pub map_file: Option<PathBuf>,
    /// `--MapStyle=`
    #[builder(default)]
    pub map_style: MapStyle,
    /// `--symdef=F`
    #[builder(default, setter(strip_option))]
    pub symdef_file: Option<PathBuf>,
    /// `--patch-enable`
    #[builder(default)]
    pub patch_enable: bool,
    /// `--patch-base=F`: an already-linked executable whose symbol
    /// addresses pin patchable symbols
    #[builder(default, setter(strip_option))]
    pub patch_base: Option<PathBuf>,
    /// `--trace` / `-t`
    #[builder(default)]
    pub trace: bool,
    /// Worker threads for the parallel phases; 0 selects a default
    #[builder(default)]
    pub threads: usize,
    /// `-z max-page-size` override
    #[builder(default, setter(strip_option))]
    pub max_page_size: Option<u64>,
    /// `-z common-page-size` override
    #[builder(default, setter(strip_option))]
    pub common_page_size: Option<u64>,
}

impl LinkConfig {
    /// Whether the output kind alone requires dynamic-linking structures.
    /// A plain executable additionally becomes dynamic when a shared
    /// library participates in the link; the module tracks that.
    pub fn is_dynamic(&self) -> bool {
        !self.is_static && matches!(self.kind, OutputKind::Dyn | OutputKind::Pie)
    }

    /// Whether the produced code must be position independent.
    pub fn is_pic(&self) -> bool {
        matches!(self.kind, OutputKind::Dyn | OutputKind::Pie)
    }

    /// The `-T`/`--section-start` override for a well-known segment name
    /// (`SEGMENT_START` semantics).
    pub fn segment_start(&self, segment: &str) -> Option<u64> {
        match segment {
            "text-segment" => self.text_segment,
            "data-segment" => self.data_segment,
            "bss-segment" => self.bss_segment,
            other => self.section_start.get(other).copied(),
        }
    }

    /// Worker-thread count for the parallel phases.
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            crate::support::pool::default_threads()
        } else {
            self.threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let cfg = LinkConfig::builder().build();
        assert_eq!(cfg.output, PathBuf::from("a.out"));
        assert_eq!(cfg.kind, OutputKind::Exec);
        assert!(cfg.relax);
        assert!(!cfg.gc_sections);
        assert_eq!(cfg.unresolved, UnresolvedPolicy::ReportAll);
    }

    #[test]
    fn test_segment_start_overrides() {
        let mut starts = HashMap::new();
        starts.insert(".mysect".to_string(), 0x8000u64);
        let cfg = LinkConfig::builder()
            .text_segment(0x10000)
            .section_start(starts)
            .build();
        assert_eq!(cfg.segment_start("text-segment"), Some(0x10000));
        assert_eq!(cfg.segment_start(".mysect"), Some(0x8000));
        assert_eq!(cfg.segment_start("data-segment"), None);
    }

    #[test]
    fn test_pic_kinds() {
        assert!(LinkConfig::builder().kind(OutputKind::Dyn).build().is_pic());
        assert!(LinkConfig::builder().kind(OutputKind::Pie).build().is_pic());
        assert!(!LinkConfig::builder().build().is_pic());
    }
}
