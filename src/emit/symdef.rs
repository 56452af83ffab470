//! SymDef file writer (`--symdef=F`).
//!
//! A UTF-8 text file: the `#<SYMDEFS>#` header, a do-not-edit banner,
//! then one line per exported non-local, non-absolute, non-section,
//! non-file symbol: `0xVALUE<TAB>{NOTYPE|FUNC|OBJECT}<TAB>NAME`.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::module::Module;
use crate::symbol::{SymbolBinding, SymbolType};
use std::io::Write;
use std::path::Path;

/// Render the symdef text for the module.
pub fn render(module: &Module) -> String {
    let mut out = String::new();
    out.push_str("#<SYMDEFS>#\n");
    out.push_str("#DO NOT EDIT#\n");
    let mut lines: Vec<(String, &'static str, u64)> = Vec::new();
    for (id, info) in module.pool.infos() {
        if !info.is_defined() || info.from_dynamic {
            continue;
        }
        if info.binding == SymbolBinding::Local || info.forced_local {
            continue;
        }
        let type_tag = match info.ty {
            SymbolType::Func | SymbolType::IFunc => "FUNC",
            SymbolType::Object | SymbolType::Common => "OBJECT",
            SymbolType::NoType => "NOTYPE",
            SymbolType::Section | SymbolType::File | SymbolType::Tls => continue,
        };
        let Some(out_sym) = info.out_symbol else {
            continue;
        };
        let sym = module.pool.symbol(out_sym);
        if sym.special_shndx == Some(crate::elf::SHN_ABS) {
            continue;
        }
        if !module.symbol_section_live(out_sym) {
            continue;
        }
        lines.push((info.name.clone(), type_tag, module.resolve_value(id)));
    }
    for (name, tag, value) in lines {
        out.push_str(&format!("0x{value:08x}\t{tag}\t{name}\n"));
    }
    out
}

/// Write the symdef file.
pub fn write(module: &Module, path: &Path) -> Result<()> {
    let text = render(module);
    let mut file = std::fs::File::create(path).map_err(|e| {
        DiagnosticEntry::error(
            DiagId::ERROR_SYMDEF_WRITE,
            vec![path.display().to_string(), e.to_string()],
        )
    })?;
    file.write_all(text.as_bytes()).map_err(|e| {
        DiagnosticEntry::error(
            DiagId::ERROR_SYMDEF_WRITE,
            vec![path.display().to_string(), e.to_string()],
        )
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::fragment::{FragmentKind, FragmentRef};
    use crate::input::{InputFile, InputKind};
    use crate::section::{Section, SectionKind};
    use crate::symbol::name_pool::SymbolInput;
    use crate::symbol::{SymbolDesc, Visibility};

    #[test]
    fn test_render_filters_and_format() {
        let mut module = Module::new(LinkConfig::builder().build());
        let input = module
            .inputs
            .alloc(InputFile::new("a.o", InputKind::Object, 0));
        let mut text = Section::new(".text", SectionKind::Regular, input);
        text.flags = crate::elf::SectionFlags::ALLOC | crate::elf::SectionFlags::EXECINSTR;
        text.live = true;
        let sid = module.sections.alloc(text);
        let frag = module.append_fragment(sid, 4, FragmentKind::Region { data: vec![0; 8] });
        module
            .pool
            .add_symbol(
                input,
                SymbolInput {
                    name: "main",
                    ty: SymbolType::Func,
                    desc: SymbolDesc::Defined,
                    binding: SymbolBinding::Global,
                    visibility: Visibility::Default,
                    size: 8,
                    value: 0,
                    section: Some(sid),
                    frag_ref: Some(FragmentRef { frag, offset: 0 }),
                    special_shndx: None,
                    from_dynamic: false,
                    common_align: 0,
                },
            )
            .unwrap();
        // an absolute symbol is filtered out
        module.pool.define_absolute(input, "__abs", 0x42, false);
        let text = render(&module);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#<SYMDEFS>#");
        assert_eq!(lines[1], "#DO NOT EDIT#");
        assert!(lines[2].ends_with("\tFUNC\tmain"));
        assert!(!text.contains("__abs"));
    }
}
