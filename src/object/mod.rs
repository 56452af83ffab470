//! Object-level passes: the section map with its rule matching, garbage
//! collection, string merging and the `NOCROSSREFS` check.

pub mod gc;
pub mod merge;
pub mod section_map;

use crate::diag::{DiagId, DiagnosticEntry};
use crate::module::Module;

/// Verify `NOCROSSREFS` groups: after the relocation scan, a reference
/// between two output sections named in the same group is an error.
pub fn check_nocrossrefs(module: &Module) {
    for group in &module.script.nocrossrefs {
        for (_, section) in module.sections.iter() {
            if section.is_discarded() {
                continue;
            }
            let Some(from_out) = section.output_section else {
                continue;
            };
            let from_name = &module.sections[from_out].name;
            if !group.iter().any(|g| g == from_name) {
                continue;
            }
            for &rid in &section.relocs {
                let reloc = &module.relocs[rid];
                let sym = module.pool.symbol(reloc.symbol);
                let Some(target_section) = sym.section else {
                    continue;
                };
                let Some(to_out) = module.sections[target_section].output_section else {
                    continue;
                };
                if to_out == from_out {
                    continue;
                }
                let to_name = &module.sections[to_out].name;
                if group.iter().any(|g| g == to_name) {
                    module.raise(DiagnosticEntry::error(
                        DiagId::ERROR_CROSS_REFERENCE_PROHIBITED,
                        vec![from_name.clone(), to_name.clone()],
                    ));
                }
            }
        }
    }
}
