//! The name pool and its resolver.
//!
//! The pool maps each linkable name to exactly one [`ResolveInfo`] and
//! applies ELF resolution precedence as occurrences are added: strong
//! defined over weak defined over common over undefined over dynamic.
//! Changing a record's definition is a resolution event performed only
//! here.

use super::{
    LDSymbol, ResolveId, ResolveInfo, SymbolBinding, SymbolDesc, SymbolId, SymbolType, Visibility,
};
use crate::fragment::FragmentRef;
use crate::input::InputId;
use crate::section::SectionId;
use crate::support::arena::Arena;
use std::collections::{HashMap, HashSet};

/// One symbol record as read from an input, before resolution.
#[derive(Debug, Clone)]
pub struct SymbolInput<'a> {
    pub name: &'a str,
    pub ty: SymbolType,
    pub desc: SymbolDesc,
    pub binding: SymbolBinding,
    pub visibility: Visibility,
    pub size: u64,
    pub value: u64,
    pub section: Option<SectionId>,
    pub frag_ref: Option<FragmentRef>,
    pub special_shndx: Option<u16>,
    pub from_dynamic: bool,
    pub common_align: u64,
}

/// Resolution outcome the pool reports to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("multiple definition of `{name}'")]
    Duplicate {
        name: String,
        old_source: Option<InputId>,
    },
}

/// Map from name to canonical [`ResolveInfo`], append-only within a link.
#[derive(Debug, Default)]
pub struct NamePool {
    infos: Arena<ResolveId, ResolveInfo>,
    by_name: HashMap<String, ResolveId>,
    symbols: Arena<SymbolId, LDSymbol>,
    wrapped: HashSet<String>,
    allow_multiple_definition: bool,
}

impl NamePool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure `--allow-multiple-definition`.
    pub fn set_allow_multiple_definition(&mut self, allow: bool) {
        self.allow_multiple_definition = allow;
    }

    /// Register `--wrap=name`; affects references added afterwards.
    pub fn add_wrap(&mut self, name: impl Into<String>) {
        self.wrapped.insert(name.into());
    }

    /// Whether `name` is wrapped.
    pub fn is_wrapped(&self, name: &str) -> bool {
        self.wrapped.contains(name)
    }

    /// Look up the canonical record for `name`.
    pub fn find(&self, name: &str) -> Option<&ResolveInfo> {
        self.by_name.get(name).map(|&id| &self.infos[id])
    }

    /// Look up the record id for `name`.
    pub fn find_id(&self, name: &str) -> Option<ResolveId> {
        self.by_name.get(name).copied()
    }

    /// The chosen output symbol for `name`, if resolution picked one.
    pub fn find_symbol(&self, name: &str) -> Option<&LDSymbol> {
        self.find(name)
            .and_then(|info| info.out_symbol)
            .map(|id| &self.symbols[id])
    }

    /// Access a record by id.
    pub fn info(&self, id: ResolveId) -> &ResolveInfo {
        &self.infos[id]
    }

    /// Mutable access for the resolver-adjacent passes (version scripts,
    /// reservation flags).
    pub fn info_mut(&mut self, id: ResolveId) -> &mut ResolveInfo {
        &mut self.infos[id]
    }

    /// Access a per-occurrence symbol.
    pub fn symbol(&self, id: SymbolId) -> &LDSymbol {
        &self.symbols[id]
    }

    /// Mutable access to a per-occurrence symbol.
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut LDSymbol {
        &mut self.symbols[id]
    }

    /// Iterate all records in creation order.
    pub fn infos(&self) -> impl Iterator<Item = (ResolveId, &ResolveInfo)> {
        self.infos.iter()
    }

    /// All record ids in creation order.
    pub fn info_ids(&self) -> Vec<ResolveId> {
        self.infos.indices().collect()
    }

    /// All per-occurrence symbol ids in creation order.
    pub fn symbol_ids(&self) -> Vec<SymbolId> {
        self.symbols.indices().collect()
    }

    /// Find or create the record for `name`, initially undefined.
    pub fn intern(&mut self, name: &str) -> ResolveId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.infos.alloc(ResolveInfo::undefined(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// The effective name after `--wrap` rewriting: undefined references
    /// to `X` become references to `__wrap_X`, and references to
    /// `__real_X` become references to `X`.
    fn wrap_name<'n>(&mut self, input: &SymbolInput<'n>) -> std::borrow::Cow<'n, str> {
        use std::borrow::Cow;
        if self.wrapped.is_empty() {
            return Cow::Borrowed(input.name);
        }
        if input.desc == SymbolDesc::Undefined {
            if self.wrapped.contains(input.name) {
                // save the original binding for later inspection
                let orig = self.intern(input.name);
                if self.infos[orig].saved_binding.is_none() {
                    self.infos[orig].saved_binding = Some(input.binding);
                }
                return Cow::Owned(format!("__wrap_{}", input.name));
            }
            if let Some(real) = input.name.strip_prefix("__real_") {
                if self.wrapped.contains(real) {
                    return Cow::Owned(real.to_string());
                }
            }
        }
        Cow::Borrowed(input.name)
    }

    /// Insert one occurrence, resolving it against the pool. Returns the
    /// per-occurrence symbol; local symbols bypass the pool entirely.
    pub fn add_symbol(
        &mut self,
        owner: InputId,
        input: SymbolInput<'_>,
    ) -> std::result::Result<SymbolId, ResolveError> {
        if input.binding == SymbolBinding::Local {
            let sym = LDSymbol {
                name: input.name.to_string(),
                resolve: None,
                value: input.value,
                size: input.size,
                ty: input.ty,
                binding: input.binding,
                visibility: input.visibility,
                section: input.section,
                frag_ref: input.frag_ref,
                owner,
                special_shndx: input.special_shndx,
            };
            return Ok(self.symbols.alloc(sym));
        }
        let name = self.wrap_name(&input).into_owned();
        let id = self.intern(&name);
        let sym = LDSymbol {
            name: name.clone(),
            resolve: Some(id),
            value: input.value,
            size: input.size,
            ty: input.ty,
            binding: input.binding,
            visibility: input.visibility,
            section: input.section,
            frag_ref: input.frag_ref,
            owner,
            special_shndx: input.special_shndx,
        };
        let sym_id = self.symbols.alloc(sym);
        self.resolve(id, sym_id, owner, &input)?;
        Ok(sym_id)
    }

    /// Precedence ranking of a definition state; larger wins.
    fn rank(desc: SymbolDesc, binding: SymbolBinding, from_dynamic: bool) -> u8 {
        if from_dynamic {
            return if desc == SymbolDesc::Undefined { 0 } else { 2 };
        }
        match desc {
            SymbolDesc::Undefined => 1,
            SymbolDesc::Common => 4,
            SymbolDesc::Defined | SymbolDesc::Absolute | SymbolDesc::IFunc => {
                if binding == SymbolBinding::Weak {
                    5
                } else {
                    6
                }
            }
        }
    }

    fn resolve(
        &mut self,
        id: ResolveId,
        sym_id: SymbolId,
        owner: InputId,
        input: &SymbolInput<'_>,
    ) -> std::result::Result<(), ResolveError> {
        let info = &mut self.infos[id];
        if !input.from_dynamic {
            info.visibility = info.visibility.most_restrictive(input.visibility);
        }
        if input.desc == SymbolDesc::Undefined {
            info.referenced = true;
            // a strong reference upgrades a weak one
            if !info.is_defined()
                && info.binding == SymbolBinding::Weak
                && input.binding == SymbolBinding::Global
            {
                info.binding = SymbolBinding::Global;
            }
            if info.out_symbol.is_none() {
                info.out_symbol = Some(sym_id);
            }
            return Ok(());
        }
        let old_rank = Self::rank(info.desc, info.binding, info.from_dynamic);
        let new_rank = Self::rank(input.desc, input.binding, input.from_dynamic);
        // two strong regular definitions collide
        if old_rank == 6 && new_rank == 6 {
            if self.allow_multiple_definition {
                return Ok(());
            }
            return Err(ResolveError::Duplicate {
                name: info.name.clone(),
                old_source: info.source,
            });
        }
        if old_rank == 4 && new_rank == 4 {
            // common/common: the larger size wins, alignment is the max
            info.common_align = info.common_align.max(input.common_align);
            if input.size > info.size {
                info.size = input.size;
                info.source = Some(owner);
                info.out_symbol = Some(sym_id);
            }
            return Ok(());
        }
        if new_rank > old_rank {
            info.ty = input.ty;
            info.desc = input.desc;
            info.binding = input.binding;
            info.size = input.size;
            info.source = Some(owner);
            info.from_dynamic = input.from_dynamic;
            info.out_symbol = Some(sym_id);
            if input.desc == SymbolDesc::Common {
                info.common_align = info.common_align.max(input.common_align);
            }
        }
        Ok(())
    }

    /// Define (or redefine) an absolute symbol from a script assignment or
    /// `--defsym`. Script definitions are authoritative: they displace any
    /// prior definition without a duplicate error.
    pub fn define_absolute(
        &mut self,
        owner: InputId,
        name: &str,
        value: u64,
        hidden: bool,
    ) -> SymbolId {
        let id = self.intern(name);
        let sym = LDSymbol {
            name: name.to_string(),
            resolve: Some(id),
            value,
            size: 0,
            ty: SymbolType::NoType,
            binding: SymbolBinding::Global,
            visibility: if hidden {
                Visibility::Hidden
            } else {
                Visibility::Default
            },
            section: None,
            frag_ref: None,
            owner,
            special_shndx: Some(crate::elf::SHN_ABS),
        };
        let sym_id = self.symbols.alloc(sym);
        let info = &mut self.infos[id];
        info.desc = SymbolDesc::Absolute;
        info.binding = SymbolBinding::Global;
        info.source = Some(owner);
        info.from_dynamic = false;
        info.out_symbol = Some(sym_id);
        if hidden {
            info.visibility = info.visibility.most_restrictive(Visibility::Hidden);
        }
        sym_id
    }

    /// Define a section-relative symbol the linker synthesizes
    /// (`__start_X`, `_GLOBAL_OFFSET_TABLE_`, copy-relocation aliases).
    pub fn define_in_section(
        &mut self,
        owner: InputId,
        name: &str,
        section: SectionId,
        frag_ref: Option<FragmentRef>,
        value: u64,
        ty: SymbolType,
        hidden: bool,
    ) -> SymbolId {
        let id = self.intern(name);
        let sym = LDSymbol {
            name: name.to_string(),
            resolve: Some(id),
            value,
            size: 0,
            ty,
            binding: SymbolBinding::Global,
            visibility: if hidden {
                Visibility::Hidden
            } else {
                Visibility::Default
            },
            section: Some(section),
            frag_ref,
            owner,
            special_shndx: None,
        };
        let sym_id = self.symbols.alloc(sym);
        let info = &mut self.infos[id];
        info.desc = SymbolDesc::Defined;
        info.ty = ty;
        info.binding = SymbolBinding::Global;
        info.source = Some(owner);
        info.from_dynamic = false;
        info.out_symbol = Some(sym_id);
        if hidden {
            info.visibility = info.visibility.most_restrictive(Visibility::Hidden);
        }
        sym_id
    }

    /// Mark `name` referenced (`-u`, `EXTERN`, entry symbol).
    pub fn mark_referenced(&mut self, name: &str) -> ResolveId {
        let id = self.intern(name);
        self.infos[id].referenced = true;
        id
    }

    /// Link alias chains: defined records that share a section and value
    /// point at the first such record as their canonical holder.
    pub fn compute_alias_chains(&mut self) {
        let mut canon: HashMap<(SectionId, u64), ResolveId> = HashMap::new();
        for id in self.infos.indices().collect::<Vec<_>>() {
            let Some(out) = self.infos[id].out_symbol else {
                continue;
            };
            if !self.infos[id].is_defined() || self.infos[id].is_common() {
                continue;
            }
            let sym = &self.symbols[out];
            let Some(section) = sym.section else {
                continue;
            };
            let key = (section, sym.value);
            match canon.entry(key) {
                std::collections::hash_map::Entry::Occupied(e) => {
                    let holder = *e.get();
                    if holder != id {
                        self.infos[id].alias_of = Some(holder);
                    }
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(id);
                }
            }
        }
    }

    /// Every name that is still undefined but referenced; drives archive
    /// extraction and the unresolved-symbol report.
    pub fn undefined_references(&self) -> Vec<ResolveId> {
        self.infos
            .iter()
            .filter(|(_, info)| !info.is_defined() && info.referenced)
            .map(|(id, _)| id)
            .collect()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn undef(name: &str) -> SymbolInput<'_> {
        SymbolInput {
            name,
            ty: SymbolType::NoType,
            desc: SymbolDesc::Undefined,
            binding: SymbolBinding::Global,
            visibility: Visibility::Default,
            size: 0,
            value: 0,
            section: None,
            frag_ref: None,
            special_shndx: None,
            from_dynamic: false,
            common_align: 0,
        }
    }

    fn defined(name: &str, binding: SymbolBinding) -> SymbolInput<'_> {
        SymbolInput {
            name,
            ty: SymbolType::Func,
            desc: SymbolDesc::Defined,
            binding,
            visibility: Visibility::Default,
            size: 4,
            value: 0,
            section: Some(SectionId(0)),
            frag_ref: None,
            special_shndx: None,
            from_dynamic: false,
            common_align: 0,
        }
    }

    fn common(name: &str, size: u64, align: u64) -> SymbolInput<'_> {
        SymbolInput {
            name,
            ty: SymbolType::Object,
            desc: SymbolDesc::Common,
            binding: SymbolBinding::Global,
            visibility: Visibility::Default,
            size,
            value: align,
            section: None,
            frag_ref: None,
            special_shndx: Some(crate::elf::SHN_COMMON),
            from_dynamic: false,
            common_align: align,
        }
    }

    #[test]
    fn test_find_resolves_to_same_name() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("foo", SymbolBinding::Global))
            .unwrap();
        let info = pool.find("foo").unwrap();
        assert_eq!(info.name, "foo");
        let out = pool.find_symbol("foo").unwrap();
        assert_eq!(out.name, "foo");
    }

    #[test]
    fn test_strong_beats_weak_in_both_orders() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("f", SymbolBinding::Weak))
            .unwrap();
        pool.add_symbol(InputId(1), defined("f", SymbolBinding::Global))
            .unwrap();
        assert_eq!(pool.find("f").unwrap().source, Some(InputId(1)));

        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("g", SymbolBinding::Global))
            .unwrap();
        pool.add_symbol(InputId(1), defined("g", SymbolBinding::Weak))
            .unwrap();
        assert_eq!(pool.find("g").unwrap().source, Some(InputId(0)));
    }

    #[test]
    fn test_duplicate_strong_is_error() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("f", SymbolBinding::Global))
            .unwrap();
        let err = pool
            .add_symbol(InputId(1), defined("f", SymbolBinding::Global))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Duplicate { .. }));

        let mut pool = NamePool::new();
        pool.set_allow_multiple_definition(true);
        pool.add_symbol(InputId(0), defined("f", SymbolBinding::Global))
            .unwrap();
        pool.add_symbol(InputId(1), defined("f", SymbolBinding::Global))
            .unwrap();
        assert_eq!(pool.find("f").unwrap().source, Some(InputId(0)));
    }

    #[test]
    fn test_common_larger_size_wins() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), common("c", 8, 4)).unwrap();
        pool.add_symbol(InputId(1), common("c", 16, 2)).unwrap();
        let info = pool.find("c").unwrap();
        assert_eq!(info.size, 16);
        assert_eq!(info.common_align, 4);
        assert_eq!(info.source, Some(InputId(1)));
    }

    #[test]
    fn test_strong_beats_common_later() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), common("c", 8, 4)).unwrap();
        pool.add_symbol(InputId(1), defined("c", SymbolBinding::Global))
            .unwrap();
        let info = pool.find("c").unwrap();
        assert_eq!(info.desc, SymbolDesc::Defined);
        assert_eq!(info.source, Some(InputId(1)));
    }

    #[test]
    fn test_dynamic_ranks_below_regular() {
        let mut pool = NamePool::new();
        let mut dynsym = defined("d", SymbolBinding::Global);
        dynsym.from_dynamic = true;
        pool.add_symbol(InputId(0), dynsym).unwrap();
        assert!(pool.find("d").unwrap().from_dynamic);
        pool.add_symbol(InputId(1), defined("d", SymbolBinding::Global))
            .unwrap();
        let info = pool.find("d").unwrap();
        assert!(!info.from_dynamic);
        assert_eq!(info.source, Some(InputId(1)));
    }

    #[test]
    fn test_visibility_merges_most_restrictive() {
        let mut pool = NamePool::new();
        let mut hidden_ref = undef("v");
        hidden_ref.visibility = Visibility::Hidden;
        pool.add_symbol(InputId(0), hidden_ref).unwrap();
        pool.add_symbol(InputId(1), defined("v", SymbolBinding::Global))
            .unwrap();
        assert_eq!(pool.find("v").unwrap().visibility, Visibility::Hidden);
    }

    #[test]
    fn test_wrap_redirects_references() {
        let mut pool = NamePool::new();
        pool.add_wrap("malloc");
        // an undefined reference to malloc becomes __wrap_malloc
        pool.add_symbol(InputId(0), undef("malloc")).unwrap();
        assert!(pool.find("__wrap_malloc").is_some());
        assert!(pool.find("__wrap_malloc").unwrap().referenced);
        // a reference to __real_malloc becomes malloc
        pool.add_symbol(InputId(0), undef("__real_malloc")).unwrap();
        assert!(pool.find("malloc").unwrap().referenced);
        // the definition of malloc stays under its own name
        pool.add_symbol(InputId(1), defined("malloc", SymbolBinding::Global))
            .unwrap();
        assert!(pool.find("malloc").unwrap().is_defined());
        assert!(!pool.find("__wrap_malloc").unwrap().is_defined());
        assert_eq!(
            pool.find("malloc").unwrap().saved_binding,
            Some(SymbolBinding::Global)
        );
    }

    #[test]
    fn test_weak_undef_upgraded_by_strong_ref() {
        let mut pool = NamePool::new();
        let mut weak_ref = undef("w");
        weak_ref.binding = SymbolBinding::Weak;
        pool.add_symbol(InputId(0), weak_ref).unwrap();
        assert_eq!(pool.find("w").unwrap().binding, SymbolBinding::Weak);
        pool.add_symbol(InputId(1), undef("w")).unwrap();
        assert_eq!(pool.find("w").unwrap().binding, SymbolBinding::Global);
    }

    #[test]
    fn test_alias_chains() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("a", SymbolBinding::Global))
            .unwrap();
        pool.add_symbol(InputId(0), defined("b", SymbolBinding::Weak))
            .unwrap();
        pool.compute_alias_chains();
        let a = pool.find_id("a").unwrap();
        let b = pool.find("b").unwrap();
        assert_eq!(b.alias_of, Some(a));
        assert!(pool.find("a").unwrap().alias_of.is_none());
    }
}
