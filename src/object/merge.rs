//! String merging for `SHF_MERGE|SHF_STRINGS` sections.
//!
//! Input merge sections matched into one output section are split into
//! NUL-terminated pieces and deduplicated. The first input section's
//! fragment is rewritten to hold the merged table; the rest are retagged
//! `Ignore`. Every `(input section, input offset)` that named a piece is
//! recorded in the module's merge map so symbol values and
//! section-relative references land on the surviving copy.

use crate::fragment::FragmentKind;
use crate::module::Module;
use crate::section::{SectionId, SectionKind};
use std::collections::HashMap;

/// Run the merge pass over every output entry.
pub fn run(module: &mut Module) {
    for entry_idx in 0..module.section_map.entries.len() {
        let mut merge_inputs: Vec<SectionId> = Vec::new();
        for rule_idx in 0..module.section_map.entries[entry_idx].rules.len() {
            for &sid in &module.section_map.entries[entry_idx].rules[rule_idx].matched {
                let section = &module.sections[sid];
                if section.kind == SectionKind::MergeStr && section.live {
                    merge_inputs.push(sid);
                }
            }
        }
        if merge_inputs.is_empty() {
            continue;
        }
        merge_group(module, &merge_inputs);
    }
}

fn merge_group(module: &mut Module, inputs: &[SectionId]) {
    let mut merged: Vec<u8> = Vec::new();
    let mut piece_offsets: HashMap<Vec<u8>, u64> = HashMap::new();
    let home = inputs[0];
    let home_frag = match module.sections[home].fragments.first() {
        Some(&f) => f,
        None => return,
    };
    for &sid in inputs {
        let Some(&frag_id) = module.sections[sid].fragments.first() else {
            continue;
        };
        let data = match &module.fragments[frag_id].kind {
            FragmentKind::Region { data } => data.clone(),
            _ => continue,
        };
        let mut offset = 0usize;
        while offset < data.len() {
            let end = data[offset..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p)
                .unwrap_or(data.len().saturating_sub(1));
            let piece = data[offset..=end.min(data.len() - 1)].to_vec();
            let new_offset = match piece_offsets.get(&piece) {
                Some(&o) => o,
                None => {
                    let o = merged.len() as u64;
                    merged.extend_from_slice(&piece);
                    piece_offsets.insert(piece.clone(), o);
                    o
                }
            };
            module
                .merge_map
                .insert((sid, offset as u64), (home_frag, new_offset));
            offset = end + 1;
        }
    }
    // the first section's fragment becomes the merged table
    let new_size = merged.len() as u64;
    module.fragments[home_frag].kind = FragmentKind::MergeStrings { data: merged };
    module.sections[home].size = new_size;
    for &sid in &inputs[1..] {
        module.sections[sid].kind = SectionKind::Ignore;
        module.sections[sid].live = false;
    }
    log::debug!(
        "merged {} string sections into `{}' ({} bytes)",
        inputs.len(),
        module.sections[home].name,
        new_size
    );
}

/// Redirect a section-relative reference into merged storage: given the
/// original `(section, offset)`, the surviving `(fragment, offset)`.
pub fn remap(
    module: &Module,
    section: SectionId,
    offset: u64,
) -> Option<(crate::fragment::FragmentId, u64)> {
    // exact piece starts are recorded; interior references walk back to
    // the containing piece
    if let Some(&hit) = module.merge_map.get(&(section, offset)) {
        return Some(hit);
    }
    let mut probe = offset;
    while probe > 0 {
        probe -= 1;
        if let Some(&(frag, base)) = module.merge_map.get(&(section, probe)) {
            return Some((frag, base + (offset - probe)));
        }
    }
    None
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::elf::SectionFlags;
    use crate::input::{InputFile, InputKind, InternalInputKind};
    use crate::object::section_map::build_and_match;
    use crate::section::Section;

    fn merge_module(bodies: &[&[u8]]) -> (Module, Vec<SectionId>) {
        let mut module = Module::new(LinkConfig::builder().build());
        let mut ids = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            let input = module
                .inputs
                .alloc(InputFile::new(format!("m{i}.o"), InputKind::Object, i));
            let mut s = Section::new(".rodata.str1.1", SectionKind::MergeStr, input);
            s.flags = SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS;
            s.entsize = 1;
            s.live = true;
            let sid = module.sections.alloc(s);
            module.inputs[input].sections.push(sid);
            module.append_fragment(
                sid,
                1,
                FragmentKind::Region {
                    data: body.to_vec(),
                },
            );
            ids.push(sid);
        }
        // ensure an output entry exists
        let _ = module.internal_input(InternalInputKind::OutputSections);
        build_and_match(&mut module);
        (module, ids)
    }

    #[test]
    fn test_identical_strings_dedupe() {
        let (mut module, ids) = merge_module(&[b"hello\0world\0", b"world\0hello\0"]);
        run(&mut module);
        // all four pieces exist, two survive
        let home = ids[0];
        assert_eq!(module.sections[home].size, 12);
        assert_eq!(module.sections[ids[1]].kind, SectionKind::Ignore);
        let (frag_a, off_a) = *module.merge_map.get(&(ids[0], 0)).unwrap();
        let (frag_b, off_b) = *module.merge_map.get(&(ids[1], 6)).unwrap();
        assert_eq!(frag_a, frag_b);
        assert_eq!(off_a, off_b); // both name "hello"
    }

    #[test]
    fn test_interior_reference_remap() {
        let (mut module, ids) = merge_module(&[b"abc\0", b"abc\0"]);
        run(&mut module);
        // a reference into the middle of the duplicate's piece
        let (_, off) = remap(&module, ids[1], 1).unwrap();
        assert_eq!(off, 1);
    }
}
