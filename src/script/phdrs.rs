//! `PHDRS` declarations.

use crate::elf;
use crate::script::expr::Expression;

/// One program-header declaration:
/// `name type [FILEHDR] [PHDRS] [AT(addr)] [FLAGS(flags)];`
#[derive(Debug, Clone)]
pub struct PhdrSpec {
    pub name: String,
    /// Resolved `p_type`
    pub p_type: u32,
    /// Segment includes the ELF file header
    pub filehdr: bool,
    /// Segment includes the program-header table
    pub phdrs: bool,
    pub at: Option<Expression>,
    pub flags: Option<Expression>,
}

impl PhdrSpec {
    /// Decode a `PHDRS` type keyword or accept a numeric type.
    pub fn type_from_keyword(keyword: &str) -> Option<u32> {
        Some(match keyword {
            "PT_NULL" => elf::PT_NULL,
            "PT_LOAD" => elf::PT_LOAD,
            "PT_DYNAMIC" => elf::PT_DYNAMIC,
            "PT_INTERP" => elf::PT_INTERP,
            "PT_NOTE" => elf::PT_NOTE,
            "PT_PHDR" => elf::PT_PHDR,
            "PT_TLS" => elf::PT_TLS,
            "PT_GNU_EH_FRAME" => elf::PT_GNU_EH_FRAME,
            "PT_GNU_STACK" => elf::PT_GNU_STACK,
            "PT_GNU_RELRO" => elf::PT_GNU_RELRO,
            "PT_ARM_EXIDX" => elf::PT_ARM_EXIDX,
            "PT_RISCV_ATTRIBUTES" => elf::PT_RISCV_ATTRIBUTES,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_keywords() {
        assert_eq!(PhdrSpec::type_from_keyword("PT_LOAD"), Some(elf::PT_LOAD));
        assert_eq!(
            PhdrSpec::type_from_keyword("PT_GNU_RELRO"),
            Some(elf::PT_GNU_RELRO)
        );
        assert_eq!(PhdrSpec::type_from_keyword("PT_BOGUS"), None);
    }
}
