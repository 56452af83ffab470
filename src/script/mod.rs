//! The linker-script engine: command AST, expression tree, memory
//! regions, program-header specs, lexer and parser.
//!
//! Commands execute in source order during the prepare and layout phases;
//! the AST keeps enough structure for assignments to commit at the level
//! the script placed them.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::fragment::DataWidth;
use crate::support::glob::Pattern;
use std::collections::HashMap;

pub mod expr;
pub mod lex;
pub mod memory;
pub mod parse;
pub mod phdrs;

pub use expr::{EvalContext, Expression};
pub use memory::{MemoryDesc, ScriptMemoryRegion};
pub use phdrs::PhdrSpec;

/// Where an assignment lexically sits; determines when it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentLevel {
    /// Global, outside `SECTIONS`
    OutsideSections,
    /// Inside `SECTIONS`, between output sections
    OutputSection,
    /// Inside an output-section description, between rules
    InputSection,
    /// Trailing the last output section of `SECTIONS`
    SectionsEnd,
}

/// `PROVIDE`/`HIDDEN` variants of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignKind {
    Plain,
    Provide,
    ProvideHidden,
    Hidden,
}

/// Compound assignment operators expand at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Shr,
    And,
    Or,
}

/// One symbol (or dot) assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Target name; `.` for the location counter
    pub symbol: String,
    pub op: AssignOp,
    pub kind: AssignKind,
    pub expr: Expression,
    pub level: AssignmentLevel,
}

impl Assignment {
    /// Whether the target is the location counter.
    pub fn is_dot(&self) -> bool {
        self.symbol == "."
    }
}

/// An `INPUT`/`GROUP` operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// A path or bare file name
    File(String),
    /// `-lfoo` / `AS_NEEDED` member treated as a library namespec
    Library(String),
}

/// `PLUGIN(type, name[, options])`; also reachable via `--plugin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCmd {
    pub plugin_type: String,
    pub name: String,
    pub options: Option<String>,
}

/// Sort wrapper on a section pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortPolicy {
    #[default]
    None,
    ByName,
    ByAlignment,
    ByInitPriority,
}

/// One section pattern inside `file(...)`.
#[derive(Debug, Clone)]
pub struct SectionPattern {
    pub pattern: Pattern,
    pub exclude_files: Vec<Pattern>,
    pub sort: SortPolicy,
}

/// The `file(section...)` core of an input-section description.
#[derive(Debug, Clone)]
pub struct InputSectSpec {
    /// Archive part of `archive(member)` file syntax
    pub archive: Option<Pattern>,
    pub file: Pattern,
    pub sections: Vec<SectionPattern>,
}

/// `[KEEP(]file(section...)[)]`.
#[derive(Debug, Clone)]
pub struct InputSectDesc {
    pub keep: bool,
    pub spec: InputSectSpec,
}

/// `(NOLOAD)`-family markers in an output-section prolog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSectType {
    NoLoad,
    Copy,
    Info,
    Overlay,
}

/// Commands inside an output-section description.
#[derive(Debug, Clone)]
pub enum OutputSectCommand {
    Input(InputSectDesc),
    Assignment(Assignment),
    Data { width: DataWidth, expr: Expression },
    Fill(Expression),
    Assert(Expression),
    Plugin(PluginCmd),
}

/// One output-section description.
#[derive(Debug, Clone)]
pub struct OutputSectDesc {
    pub name: String,
    pub address: Option<Expression>,
    pub sect_type: Option<OutputSectType>,
    pub at: Option<Expression>,
    pub align: Option<Expression>,
    pub subalign: Option<Expression>,
    pub commands: Vec<OutputSectCommand>,
    pub region: Option<String>,
    pub at_region: Option<String>,
    pub phdrs: Vec<String>,
    pub fill: Option<Expression>,
}

/// Commands inside `SECTIONS`.
#[derive(Debug, Clone)]
pub enum SectionsCommand {
    Assignment(Assignment),
    OutputSect(OutputSectDesc),
    Assert(Expression),
    Entry(String),
}

/// Top-level script commands.
#[derive(Debug, Clone)]
pub enum ScriptCommand {
    Entry(String),
    Extern(Vec<String>),
    Group(Vec<InputSpec>),
    Input(Vec<InputSpec>),
    Include { path: String, optional: bool },
    SearchDir(String),
    Output(String),
    OutputArch(String),
    OutputFormat(Vec<String>),
    Phdrs(Vec<PhdrSpec>),
    Memory(Vec<MemoryDesc>),
    RegionAlias { alias: String, region: String },
    NoCrossRefs(Vec<String>),
    Sections(Vec<SectionsCommand>),
    Assignment(Assignment),
    Assert(Expression),
    Plugin(PluginCmd),
}

/// Aggregated script state on the module: the activated commands plus the
/// runtime side of `MEMORY`, `PHDRS` and the flags other phases consult.
#[derive(Debug, Default)]
pub struct ScriptState {
    /// `SECTIONS` body, in source order
    pub sections_commands: Vec<SectionsCommand>,
    /// Assignments outside `SECTIONS`, in source order
    pub outside_assignments: Vec<Assignment>,
    /// Top-level asserts, committed after layout
    pub asserts: Vec<Expression>,
    /// Memory regions by declaration order
    pub memory_regions: Vec<ScriptMemoryRegion>,
    /// `REGION_ALIAS` mappings
    pub region_aliases: HashMap<String, String>,
    /// `PHDRS` declarations
    pub phdr_specs: Vec<PhdrSpec>,
    pub has_phdrs_cmd: bool,
    pub has_sections_cmd: bool,
    /// A `SIZEOF_HEADERS` occurrence forces header loading
    pub sizeof_headers_seen: bool,
    /// `NOCROSSREFS` groups
    pub nocrossrefs: Vec<Vec<String>>,
    /// `ENTRY` from scripts (config `-e` wins)
    pub entry: Option<String>,
    /// `OUTPUT(...)`
    pub output: Option<String>,
    /// `OUTPUT_ARCH(...)`
    pub output_arch: Option<String>,
    /// `OUTPUT_FORMAT(...)`
    pub output_format: Vec<String>,
    /// `EXTERN(...)` names
    pub externs: Vec<String>,
    /// Plugins named by `PLUGIN(...)`
    pub plugins: Vec<PluginCmd>,
}

impl ScriptState {
    /// Find a region by name, resolving `REGION_ALIAS` one step at a
    /// time.
    pub fn find_region(&self, name: &str) -> Option<&ScriptMemoryRegion> {
        let mut key = name;
        for _ in 0..self.region_aliases.len() + 1 {
            if let Some(region) = self.memory_regions.iter().find(|r| r.name == key) {
                return Some(region);
            }
            match self.region_aliases.get(key) {
                Some(next) => key = next,
                None => return None,
            }
        }
        None
    }

    /// Mutable region lookup for cursor updates.
    pub fn find_region_mut(&mut self, name: &str) -> Option<&mut ScriptMemoryRegion> {
        let mut key = name.to_string();
        for _ in 0..self.region_aliases.len() + 1 {
            if self.memory_regions.iter().any(|r| r.name == key) {
                return self.memory_regions.iter_mut().find(|r| r.name == key);
            }
            match self.region_aliases.get(&key) {
                Some(next) => key = next.clone(),
                None => return None,
            }
        }
        None
    }

    /// Register an alias; the aliased region must already exist.
    pub fn add_region_alias(&mut self, alias: &str, region: &str) -> Result<()> {
        if self.region_aliases.contains_key(alias)
            || self.memory_regions.iter().any(|r| r.name == alias)
        {
            return Err(DiagnosticEntry::error(
                DiagId::ERROR_REGION_ALIAS_DUPLICATE,
                vec![alias.to_string()],
            ));
        }
        if self.find_region(region).is_none() {
            return Err(DiagnosticEntry::error(
                DiagId::ERROR_REGION_ALIAS_UNDEFINED,
                vec![alias.to_string(), region.to_string()],
            ));
        }
        self.region_aliases
            .insert(alias.to_string(), region.to_string());
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::expr::{Expression, ExprKind};

    fn region(name: &str, origin: u64, length: u64) -> ScriptMemoryRegion {
        ScriptMemoryRegion::new(MemoryDesc {
            name: name.to_string(),
            attrs: String::new(),
            origin: Expression::new(ExprKind::Integer(origin)),
            length: Expression::new(ExprKind::Integer(length)),
        })
        .unwrap()
    }

    #[test]
    fn test_region_alias_resolution() {
        let mut state = ScriptState::default();
        state.memory_regions.push(region("RAM", 0x1000, 0x100));
        state.add_region_alias("ram_alias", "RAM").unwrap();
        assert!(state.find_region("ram_alias").is_some());
        assert!(state.find_region("nope").is_none());
        // alias to an undefined region is rejected
        assert_eq!(
            state.add_region_alias("bad", "FLASH").unwrap_err().id,
            DiagId::ERROR_REGION_ALIAS_UNDEFINED
        );
        // duplicate alias is rejected
        assert_eq!(
            state.add_region_alias("ram_alias", "RAM").unwrap_err().id,
            DiagId::ERROR_REGION_ALIAS_DUPLICATE
        );
    }
}
