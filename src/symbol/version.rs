//! Version scripts and dynamic lists.
//!
//! A version script narrows symbol scope: names matching a `local:`
//! pattern are demoted to local, names matching a `global:` pattern are
//! assigned the version node and stay exported. Patterns use shell-glob
//! syntax; `extern "C++"` blocks are parsed and their patterns applied to
//! the raw symbol names.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::support::glob::Pattern;
use crate::symbol::name_pool::NamePool;

/// Scope a pattern assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionScope {
    Global,
    Local,
}

/// One pattern inside a version node.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    pub pattern: Pattern,
    pub scope: VersionScope,
    /// From an `extern "C++"` block
    pub extern_cxx: bool,
}

/// One version node (`NODE { ... } [parent];`).
#[derive(Debug, Clone)]
pub struct VersionNode {
    /// Node name; empty for the anonymous node
    pub name: String,
    /// Parent node name
    pub parent: Option<String>,
    pub patterns: Vec<VersionPattern>,
}

/// A parsed version script.
#[derive(Debug, Clone, Default)]
pub struct VersionScript {
    pub nodes: Vec<VersionNode>,
}

/// Strength of a match, for picking among overlapping patterns: a literal
/// name beats a glob, and a glob beats the universal `*`.
fn match_strength(p: &Pattern) -> u8 {
    if p.is_literal() {
        2
    } else if p.is_wildcard_all() {
        0
    } else {
        1
    }
}

impl VersionScript {
    /// Parse version-script text.
    pub fn parse(text: &str) -> Result<VersionScript> {
        let mut tokens = tokenize(text);
        let mut nodes = Vec::new();
        while let Some(tok) = tokens.next_token() {
            let name = if tok == "{" {
                String::new()
            } else {
                let n = tok;
                tokens.expect("{")?;
                n
            };
            let mut node = VersionNode {
                name,
                parent: None,
                patterns: Vec::new(),
            };
            let mut scope = VersionScope::Global;
            let mut extern_cxx = false;
            loop {
                let Some(tok) = tokens.next_token() else {
                    return Err(syntax_error("unterminated version node"));
                };
                match tok.as_str() {
                    "}" => {
                        if extern_cxx {
                            extern_cxx = false;
                            tokens.expect(";").ok();
                            continue;
                        }
                        break;
                    }
                    "global" => {
                        tokens.expect(":")?;
                        scope = VersionScope::Global;
                    }
                    "local" => {
                        tokens.expect(":")?;
                        scope = VersionScope::Local;
                    }
                    "extern" => {
                        let lang = tokens
                            .next_token()
                            .ok_or_else(|| syntax_error("extern without language"))?;
                        if lang != "\"C++\"" && lang != "\"C\"" {
                            return Err(syntax_error("unsupported extern language"));
                        }
                        tokens.expect("{")?;
                        extern_cxx = lang == "\"C++\"";
                    }
                    ";" => {}
                    pat => {
                        node.patterns.push(VersionPattern {
                            pattern: Pattern::new(pat.trim_matches('"')),
                            scope,
                            extern_cxx,
                        });
                    }
                }
            }
            // trailing `[parent];`
            match tokens.next_token() {
                Some(t) if t == ";" => {}
                Some(parent) => {
                    node.parent = Some(parent);
                    tokens.expect(";")?;
                }
                None => {}
            }
            nodes.push(node);
        }
        Ok(VersionScript { nodes })
    }

    /// The scope and version assignment for `name`, if any pattern
    /// matches. Stronger matches win; ties go to the earlier pattern.
    pub fn lookup(&self, name: &str) -> Option<(VersionScope, &str)> {
        let mut best: Option<(u8, VersionScope, &str)> = None;
        for node in &self.nodes {
            for pat in &node.patterns {
                if !pat.pattern.matches(name) {
                    continue;
                }
                let strength = match_strength(&pat.pattern);
                let better = match best {
                    None => true,
                    Some((s, _, _)) => strength > s,
                };
                if better {
                    best = Some((strength, pat.scope, node.name.as_str()));
                }
            }
        }
        best.map(|(_, scope, node)| (scope, node))
    }

    /// Apply scope narrowing to every defined, non-dynamic record in the
    /// pool.
    pub fn apply(&self, pool: &mut NamePool) {
        for id in pool.info_ids() {
            let (name, defined, from_dynamic) = {
                let info = pool.info(id);
                (info.name.clone(), info.is_defined(), info.from_dynamic)
            };
            if !defined || from_dynamic {
                continue;
            }
            match self.lookup(&name) {
                Some((VersionScope::Local, _)) => {
                    pool.info_mut(id).forced_local = true;
                }
                Some((VersionScope::Global, node)) => {
                    let info = pool.info_mut(id);
                    info.forced_local = false;
                    if !node.is_empty() {
                        info.version = Some(node.to_string());
                    }
                }
                None => {}
            }
        }
    }
}

/// A dynamic list (`--dynamic-list=`): names that must stay preemptible
/// and exported.
#[derive(Debug, Clone, Default)]
pub struct DynamicList {
    pub patterns: Vec<Pattern>,
}

impl DynamicList {
    /// Parse `{ pat; pat; };` text.
    pub fn parse(text: &str) -> Result<DynamicList> {
        let mut tokens = tokenize(text);
        let mut patterns = Vec::new();
        tokens.expect("{")?;
        loop {
            let Some(tok) = tokens.next_token() else {
                return Err(syntax_error("unterminated dynamic list"));
            };
            match tok.as_str() {
                "}" => break,
                ";" => {}
                pat => patterns.push(Pattern::new(pat.trim_matches('"'))),
            }
        }
        Ok(DynamicList { patterns })
    }

    /// Whether `name` is listed.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

fn syntax_error(msg: &str) -> DiagnosticEntry {
    DiagnosticEntry::fatal(DiagId::ERROR_SCRIPT_SYNTAX, vec![msg.to_string()])
        .with_context("version script")
}

struct Tokens {
    items: Vec<String>,
    pos: usize,
}

impl Tokens {
    fn next_token(&mut self) -> Option<String> {
        let t = self.items.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, what: &str) -> Result<()> {
        match self.next_token() {
            Some(t) if t == what => Ok(()),
            other => Err(syntax_error(&format!(
                "expected `{what}', found `{}'",
                other.unwrap_or_else(|| "<eof>".into())
            ))),
        }
    }
}

fn tokenize(text: &str) -> Tokens {
    let mut items = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    let mut prev = ' ';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                } else {
                    items.push("/".to_string());
                }
            }
            '{' | '}' | ';' | ':' => {
                chars.next();
                items.push(c.to_string());
            }
            '"' => {
                chars.next();
                let mut s = String::from("\"");
                for c in chars.by_ref() {
                    s.push(c);
                    if c == '"' {
                        break;
                    }
                }
                items.push(s);
            }
            _ => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | ':' | '#') {
                        break;
                    }
                    s.push(c);
                    chars.next();
                }
                items.push(s);
            }
        }
    }
    Tokens { items, pos: 0 }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputId;
    use crate::section::SectionId;
    use crate::symbol::name_pool::SymbolInput;
    use crate::symbol::{SymbolBinding, SymbolDesc, SymbolType, Visibility};

    fn defined(name: &str) -> SymbolInput<'_> {
        SymbolInput {
            name,
            ty: SymbolType::Func,
            desc: SymbolDesc::Defined,
            binding: SymbolBinding::Global,
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

    #[test]
    fn test_parse_and_lookup() {
        let script = VersionScript::parse(
            "VERS_1 {\n  global:\n    api_*; exact_name;\n  local:\n    *;\n};\n",
        )
        .unwrap();
        assert_eq!(script.nodes.len(), 1);
        assert_eq!(
            script.lookup("api_open"),
            Some((VersionScope::Global, "VERS_1"))
        );
        assert_eq!(
            script.lookup("exact_name"),
            Some((VersionScope::Global, "VERS_1"))
        );
        assert_eq!(
            script.lookup("internal_helper"),
            Some((VersionScope::Local, "VERS_1"))
        );
    }

    #[test]
    fn test_literal_beats_universal_local() {
        let script =
            VersionScript::parse("{ global: keep_me; local: *; };").unwrap();
        assert_eq!(script.lookup("keep_me").map(|(s, _)| s), Some(VersionScope::Global));
        assert_eq!(script.lookup("other").map(|(s, _)| s), Some(VersionScope::Local));
    }

    #[test]
    fn test_extern_cxx_block() {
        let script = VersionScript::parse(
            "V2 { global: extern \"C++\" { \"ns::func*\"; }; local: *; };",
        )
        .unwrap();
        let pats: Vec<_> = script.nodes[0]
            .patterns
            .iter()
            .filter(|p| p.extern_cxx)
            .collect();
        assert_eq!(pats.len(), 1);
        assert_eq!(script.lookup("ns::function").map(|(s, _)| s), Some(VersionScope::Global));
    }

    #[test]
    fn test_apply_demotes_locals() {
        let mut pool = NamePool::new();
        pool.add_symbol(InputId(0), defined("api_open")).unwrap();
        pool.add_symbol(InputId(0), defined("helper")).unwrap();
        let script =
            VersionScript::parse("V1 { global: api_*; local: *; };").unwrap();
        script.apply(&mut pool);
        assert!(!pool.find("api_open").unwrap().forced_local);
        assert_eq!(
            pool.find("api_open").unwrap().version.as_deref(),
            Some("V1")
        );
        assert!(pool.find("helper").unwrap().forced_local);
    }

    #[test]
    fn test_dynamic_list() {
        let list = DynamicList::parse("{ foo; bar_*; };").unwrap();
        assert!(list.matches("foo"));
        assert!(list.matches("bar_baz"));
        assert!(!list.matches("qux"));
    }

    #[test]
    fn test_node_inheritance_parses() {
        let script =
            VersionScript::parse("V1 { global: a; };\nV2 { global: b; } V1;").unwrap();
        assert_eq!(script.nodes.len(), 2);
        assert_eq!(script.nodes[1].parent.as_deref(), Some("V1"));
    }
}
