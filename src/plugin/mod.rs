//! The plugin boundary.
//!
//! Plugins observe lifecycle events and mutate the link only through the
//! narrowly-typed operations of [`LinkerWrapper`]; the core never hands
//! out raw index handles beyond the opaque tokens the facade itself
//! returned earlier.

use crate::diag::Result;
use crate::fragment::{Fragment, FragmentId, FragmentKind};
use crate::module::{LinkState, Module};
use crate::reloc::Relocation;
use crate::section::SectionId;

/// When a plugin is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginTiming {
    /// Loaded during prepare, before inputs are read
    Universal,
    /// Loaded once sections exist
    AfterSections,
}

/// A user plugin. Every hook has a default no-op so plugins implement
/// only what they watch.
pub trait LinkerPlugin: Send {
    /// Stable plugin name for diagnostics.
    fn name(&self) -> &str;

    /// When the plugin wants to be loaded.
    fn timing(&self) -> PluginTiming {
        PluginTiming::Universal
    }

    /// The module advanced to a new lifecycle state.
    fn on_state(&mut self, state: LinkState, wrapper: &mut LinkerWrapper<'_>) -> Result<()> {
        let _ = (state, wrapper);
        Ok(())
    }

    /// Sections were matched; overrides may be requested now.
    fn on_sections_matched(&mut self, wrapper: &mut LinkerWrapper<'_>) -> Result<()> {
        let _ = wrapper;
        Ok(())
    }
}

/// A relocation observer registered by a plugin; runs before each
/// relocation is applied.
pub type RelocHook = Box<dyn Fn(&mut Relocation) + Send>;

/// The facade plugins act through.
pub struct LinkerWrapper<'a> {
    module: &'a mut Module,
    reloc_hooks: &'a mut Vec<RelocHook>,
}

impl<'a> LinkerWrapper<'a> {
    /// Build a facade over the module for one plugin callout.
    pub fn new(module: &'a mut Module, reloc_hooks: &'a mut Vec<RelocHook>) -> Self {
        LinkerWrapper {
            module,
            reloc_hooks,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.module.state()
    }

    /// Find an output section by name; the returned token is only usable
    /// with this facade.
    pub fn find_output_section(&self, name: &str) -> Option<SectionId> {
        self.module.section_map.find_output_section(name)
    }

    /// Append plugin-provided bytes to a section. The fragment shifts
    /// with relaxation unless `fixed_offset`.
    pub fn add_fragment(
        &mut self,
        section: SectionId,
        align: u64,
        data: Vec<u8>,
        fixed_offset: bool,
    ) -> FragmentId {
        let id = self
            .module
            .append_fragment(section, align, FragmentKind::Region { data });
        self.module.fragments[id].fixed_offset = fixed_offset;
        id
    }

    /// Empty a previously added fragment. Slots are never removed from
    /// the arena, so earlier tokens stay valid.
    pub fn remove_fragment(&mut self, fragment: FragmentId) {
        let frag: &mut Fragment = &mut self.module.fragments[fragment];
        if let FragmentKind::Region { data } = &mut frag.kind {
            data.clear();
        }
    }

    /// Register a hook that may rewrite relocations before application.
    pub fn register_reloc_hook(&mut self, hook: RelocHook) {
        self.reloc_hooks.push(hook);
    }

    /// Re-home one input section into a different output section,
    /// overriding the rule match.
    pub fn override_section_match(&mut self, section: SectionId, output_name: &str) -> bool {
        let Some(out) = self.module.section_map.find_output_section(output_name) else {
            return false;
        };
        let Some(entry_idx) = self.module.section_map.entry_index(output_name) else {
            return false;
        };
        // detach from the rule that claimed it
        if let Some((old_entry, old_rule)) = self.module.sections[section].matched_rule {
            if old_rule != usize::MAX {
                if let Some(rule) = self
                    .module
                    .section_map
                    .entries
                    .get_mut(old_entry)
                    .and_then(|e| e.rules.get_mut(old_rule))
                {
                    rule.matched.retain(|&s| s != section);
                }
            }
        }
        self.module.sections[section].output_section = Some(out);
        self.module.sections[section].matched_rule = Some((entry_idx, usize::MAX));
        let entry = &mut self.module.section_map.entries[entry_idx];
        if let Some(rule) = entry.rules.last_mut() {
            if rule.command_index == usize::MAX {
                rule.matched.push(section);
                return true;
            }
        }
        entry.rules.push(crate::object::section_map::RuleContainer {
            desc: crate::script::InputSectDesc {
                keep: false,
                spec: crate::script::InputSectSpec {
                    archive: None,
                    file: crate::support::glob::Pattern::new("*"),
                    sections: Vec::new(),
                },
            },
            matched: vec![section],
            match_count: 1,
            command_index: usize::MAX,
        });
        true
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;

    struct Recorder {
        states: Vec<LinkState>,
    }

    impl LinkerPlugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_state(&mut self, state: LinkState, _: &mut LinkerWrapper<'_>) -> Result<()> {
            self.states.push(state);
            Ok(())
        }
    }

    #[test]
    fn test_plugin_sees_states_and_adds_fragments() {
        let mut module = Module::new(LinkConfig::builder().build());
        let mut hooks = Vec::new();
        let section = module.internal_section(
            crate::input::InternalInputKind::Script,
            ".plugin.data",
            crate::elf::SHT_PROGBITS,
            crate::elf::SectionFlags::ALLOC,
            4,
        );
        let mut plugin = Recorder { states: Vec::new() };
        let mut wrapper = LinkerWrapper::new(&mut module, &mut hooks);
        plugin
            .on_state(LinkState::BeforeLayout, &mut wrapper)
            .unwrap();
        let frag = wrapper.add_fragment(section, 4, vec![1, 2, 3, 4], false);
        assert_eq!(plugin.states, vec![LinkState::BeforeLayout]);
        assert_eq!(module.fragments[frag].size(), 4);
        assert_eq!(module.sections[section].size, 4);
    }
}
