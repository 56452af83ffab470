//! `MEMORY` regions and their runtime state.
//!
//! A region carries origin/length expressions, parsed attribute flags and
//! a monotonically increasing cursor. Layout advances the cursor as it
//! places output sections; the first section to push the cursor past
//! `origin + length` is remembered and reported as a fatal error when the
//! region is verified at the end of layout.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::elf::SectionFlags;
use crate::script::expr::{EvalContext, Expression};
use crate::section::SectionId;

bitflags::bitflags! {
    /// Attribute letters of a `MEMORY` region declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAttrs: u8 {
        /// `r`: read-only sections
        const READONLY = 0x1;
        /// `w`: writable sections
        const WRITE = 0x2;
        /// `x`: executable sections
        const EXECUTE = 0x4;
        /// `a`: allocated sections
        const ALLOC = 0x8;
        /// `i`/`l`: initialized (progbits) sections
        const PROGBITS = 0x10;
    }
}

/// The declaration side of a region.
#[derive(Debug, Clone)]
pub struct MemoryDesc {
    pub name: String,
    /// Raw attribute string, e.g. `(rwx)` or `(rx!w)`
    pub attrs: String,
    pub origin: Expression,
    pub length: Expression,
}

/// A region plus its runtime state.
#[derive(Debug)]
pub struct ScriptMemoryRegion {
    pub name: String,
    pub origin: Expression,
    pub length: Expression,
    /// A section matching any of these attributes may be placed here
    pub attrs: MemoryAttrs,
    /// ...unless it also matches one of these (after the single
    /// permitted `!` inversion)
    pub neg_attrs: MemoryAttrs,
    /// Placement cursor; starts at the evaluated origin on first use
    pub cursor: Option<u64>,
    /// Output sections placed here, in placement order
    pub output_sections: Vec<SectionId>,
    /// First section that pushed usage past the limit
    pub first_exceeded: Option<SectionId>,
}

impl ScriptMemoryRegion {
    /// Build a region from its declaration, parsing the attribute
    /// string. The `!` inversion may appear at most once.
    pub fn new(desc: MemoryDesc) -> Result<Self> {
        let mut region = ScriptMemoryRegion {
            name: desc.name,
            origin: desc.origin,
            length: desc.length,
            attrs: MemoryAttrs::empty(),
            neg_attrs: MemoryAttrs::empty(),
            cursor: None,
            output_sections: Vec::new(),
            first_exceeded: None,
        };
        let mut inverted = false;
        for c in desc.attrs.chars() {
            let attr = c.to_ascii_lowercase();
            let flag = match attr {
                '(' | ')' => continue,
                '!' => {
                    if inverted {
                        return Err(DiagnosticEntry::error(
                            DiagId::ERROR_INVERTED_ATTRIBUTES_ALLOWED_ONLY_ONCE,
                            vec![region.name.clone()],
                        ));
                    }
                    inverted = true;
                    continue;
                }
                'r' => MemoryAttrs::READONLY,
                'w' => MemoryAttrs::WRITE,
                'x' => MemoryAttrs::EXECUTE,
                'a' => MemoryAttrs::ALLOC,
                'i' | 'l' => MemoryAttrs::PROGBITS,
                _ => continue,
            };
            if inverted {
                region.neg_attrs |= flag;
            } else {
                region.attrs |= flag;
            }
        }
        Ok(region)
    }

    /// Whether a section with `flags` may be placed here when no explicit
    /// `>REGION` names a region.
    pub fn matches_section(&self, flags: SectionFlags) -> bool {
        let mut have = MemoryAttrs::empty();
        if flags.contains(SectionFlags::WRITE) {
            have |= MemoryAttrs::WRITE;
        } else {
            have |= MemoryAttrs::READONLY;
        }
        if flags.contains(SectionFlags::EXECINSTR) {
            have |= MemoryAttrs::EXECUTE;
        }
        if flags.contains(SectionFlags::ALLOC) {
            have |= MemoryAttrs::ALLOC | MemoryAttrs::PROGBITS;
        }
        if self.attrs.is_empty() {
            return false;
        }
        if !self.neg_attrs.is_empty() && have.intersects(self.neg_attrs) {
            return false;
        }
        have.intersects(self.attrs)
    }

    /// The cursor, initialized to the origin on first use.
    pub fn addr(&mut self, ctx: &EvalContext<'_>) -> Result<u64> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }
        let origin = self.origin.eval(ctx)?;
        self.cursor = Some(origin);
        Ok(origin)
    }

    /// Record an output section at `addr` with `size` bytes (zero for
    /// TBSS, which occupies no region space), tracking the first
    /// overflow.
    pub fn add_output_section(
        &mut self,
        ctx: &EvalContext<'_>,
        section: SectionId,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        self.cursor = Some(addr + size);
        self.output_sections.push(section);
        let origin = self.origin.eval(ctx)?;
        let length = self.length.eval(ctx)?;
        if self.first_exceeded.is_none() && addr + size > origin + length {
            self.first_exceeded = Some(section);
        }
        Ok(())
    }

    /// Bytes used so far.
    pub fn used(&self, ctx: &EvalContext<'_>) -> Result<u64> {
        let Some(cursor) = self.cursor else {
            return Ok(0);
        };
        let origin = self.origin.eval(ctx)?;
        Ok(cursor.saturating_sub(origin))
    }

    /// End-of-layout verification: fatal if any section exceeded the
    /// limit, naming the first offender.
    pub fn verify(&self, ctx: &EvalContext<'_>) -> Result<()> {
        if let Some(section) = self.first_exceeded {
            return Err(DiagnosticEntry::fatal(
                DiagId::ERROR_MEMORY_REGION_EXCEEDED_LIMIT,
                vec![
                    self.name.clone(),
                    ctx.module.sections[section].name.clone(),
                ],
            ));
        }
        if self.used(ctx)? == 0 {
            ctx.module.diag.raise(DiagnosticEntry::warning(
                DiagId::WARN_MEMORY_REGION_ZERO_SIZED,
                vec![self.name.clone()],
            ));
        }
        ctx.module.diag.raise(DiagnosticEntry::new(
            crate::diag::DiagId::VERBOSE_VERIFIED_MEMORY_REGION,
            crate::diag::DiagnosticKind::Verbose,
            vec![self.name.clone()],
        ));
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::module::Module;
    use crate::script::expr::ExprKind;

    fn desc(attrs: &str) -> MemoryDesc {
        MemoryDesc {
            name: "RAM".into(),
            attrs: attrs.into(),
            origin: Expression::new(ExprKind::Integer(0x1000)),
            length: Expression::new(ExprKind::Integer(0x100)),
        }
    }

    #[test]
    fn test_attr_parsing_and_matching() {
        let region = ScriptMemoryRegion::new(desc("(rwx)")).unwrap();
        assert!(region
            .matches_section(SectionFlags::ALLOC | SectionFlags::WRITE));
        let rx = ScriptMemoryRegion::new(desc("(rx)")).unwrap();
        // read-only region rejects writable sections
        assert!(!rx.matches_section(SectionFlags::ALLOC | SectionFlags::WRITE));
        assert!(rx.matches_section(SectionFlags::ALLOC | SectionFlags::EXECINSTR));
    }

    #[test]
    fn test_double_inversion_rejected() {
        assert!(ScriptMemoryRegion::new(desc("(rw!!x)")).is_err());
        assert!(ScriptMemoryRegion::new(desc("(rw!x)")).is_ok());
    }

    #[test]
    fn test_cursor_and_overflow_tracking() {
        let module = Module::new(LinkConfig::builder().build());
        let ctx = EvalContext::outside(&module);
        let mut region = ScriptMemoryRegion::new(desc("(rw)")).unwrap();
        assert_eq!(region.addr(&ctx).unwrap(), 0x1000);
        region
            .add_output_section(&ctx, SectionId(0), 0x1000, 0x80)
            .unwrap();
        assert_eq!(region.cursor, Some(0x1080));
        assert!(region.first_exceeded.is_none());
        region
            .add_output_section(&ctx, SectionId(1), 0x1080, 0x100)
            .unwrap();
        assert_eq!(region.first_exceeded, Some(SectionId(1)));
        // the first offender is remembered, not the last
        region
            .add_output_section(&ctx, SectionId(2), 0x1180, 0x10)
            .unwrap();
        assert_eq!(region.first_exceeded, Some(SectionId(1)));
    }
}
