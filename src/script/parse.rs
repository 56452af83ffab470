//! Recursive-descent parser for linker-script text.
//!
//! Produces the command AST of [`super`]. Expressions carry their
//! `file:line` context so every diagnostic raised from a subtree names
//! its source.

use super::expr::{BinaryOp, ConstantKind, ExprKind, Expression, UnaryOp};
use super::lex::{tokenize, Token, TokenKind};
use super::memory::MemoryDesc;
use super::phdrs::PhdrSpec;
use super::{
    AssignKind, AssignOp, Assignment, AssignmentLevel, InputSectDesc, InputSectSpec, InputSpec,
    OutputSectCommand, OutputSectDesc, OutputSectType, PluginCmd, ScriptCommand, SectionPattern,
    SectionsCommand, SortPolicy,
};
use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::fragment::DataWidth;
use crate::support::glob::Pattern;

/// Parse a whole script.
pub fn parse_script(origin: &str, text: &str) -> Result<Vec<ScriptCommand>> {
    let tokens = tokenize(origin, text)?;
    let mut parser = Parser {
        origin,
        tokens,
        pos: 0,
    };
    parser.parse_commands()
}

/// Parse a standalone expression (`--defsym`, tests, round-trips).
pub fn parse_expression_text(text: &str) -> Result<Expression> {
    let tokens = tokenize("<expression>", text)?;
    let mut parser = Parser {
        origin: "<expression>",
        tokens,
        pos: 0,
    };
    let mut e = parser.parse_expression()?;
    e.set_context("<expression>");
    Ok(e)
}

struct Parser<'a> {
    origin: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_at(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn context(&self) -> String {
        format!("{}:{}", self.origin, self.line())
    }

    fn next(&mut self) -> Option<TokenKind> {
        let t = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, message: impl Into<String>) -> DiagnosticEntry {
        DiagnosticEntry::fatal(DiagId::ERROR_SCRIPT_SYNTAX, vec![message.into()])
            .with_context(self.context())
    }

    fn accept_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Some(TokenKind::Punct(x)) if *x == p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.accept_punct(p) {
            Ok(())
        } else {
            Err(self.err(format!("expected `{p}'")))
        }
    }

    fn accept_name(&mut self, name: &str) -> bool {
        if matches!(self.peek(), Some(TokenKind::Name(n)) if n == name) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_name_any(&mut self) -> Result<String> {
        match self.next() {
            Some(TokenKind::Name(n)) => Ok(n),
            other => Err(self.err(format!("expected a name, found {other:?}"))),
        }
    }

    /// A name in pattern position: `*` and `?` puncts count.
    fn expect_pattern(&mut self) -> Result<String> {
        match self.next() {
            Some(TokenKind::Name(n)) => Ok(n),
            Some(TokenKind::Punct("*")) => Ok("*".to_string()),
            Some(TokenKind::Punct("?")) => Ok("?".to_string()),
            other => Err(self.err(format!("expected a pattern, found {other:?}"))),
        }
    }

    fn at_assignment(&self) -> bool {
        // name or `.` followed by an assignment operator
        let target_ok = matches!(
            self.peek(),
            Some(TokenKind::Name(_)) | Some(TokenKind::Punct("."))
        );
        if !target_ok {
            return false;
        }
        matches!(
            self.peek_at(1),
            Some(TokenKind::Punct(
                "=" | "+=" | "-=" | "*=" | "/=" | "&=" | "|=" | "<<=" | ">>="
            ))
        )
    }

    fn parse_commands(&mut self) -> Result<Vec<ScriptCommand>> {
        let mut out = Vec::new();
        while let Some(kind) = self.peek() {
            match kind {
                TokenKind::Punct(";") => {
                    self.pos += 1;
                }
                TokenKind::Punct(".") => {
                    let a = self.parse_assignment(AssignmentLevel::OutsideSections)?;
                    out.push(ScriptCommand::Assignment(a));
                }
                TokenKind::Name(name) => {
                    let name = name.clone();
                    match name.as_str() {
                        "ENTRY" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let sym = self.expect_name_any()?;
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::Entry(sym));
                        }
                        "EXTERN" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let mut names = Vec::new();
                            while !self.accept_punct(")") {
                                names.push(self.expect_name_any()?);
                                self.accept_punct(",");
                            }
                            out.push(ScriptCommand::Extern(names));
                        }
                        "GROUP" | "INPUT" => {
                            self.pos += 1;
                            let specs = self.parse_input_list()?;
                            out.push(if name == "GROUP" {
                                ScriptCommand::Group(specs)
                            } else {
                                ScriptCommand::Input(specs)
                            });
                        }
                        "INCLUDE" | "INCLUDE_OPTIONAL" => {
                            self.pos += 1;
                            let path = self.expect_name_any()?;
                            out.push(ScriptCommand::Include {
                                path,
                                optional: name == "INCLUDE_OPTIONAL",
                            });
                        }
                        "SEARCH_DIR" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let dir = self.expect_name_any()?;
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::SearchDir(dir));
                        }
                        "OUTPUT" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let file = self.expect_name_any()?;
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::Output(file));
                        }
                        "OUTPUT_ARCH" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let arch = self.expect_name_any()?;
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::OutputArch(arch));
                        }
                        "OUTPUT_FORMAT" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let mut formats = vec![self.expect_name_any()?];
                            while self.accept_punct(",") {
                                formats.push(self.expect_name_any()?);
                            }
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::OutputFormat(formats));
                        }
                        "PHDRS" => {
                            self.pos += 1;
                            out.push(ScriptCommand::Phdrs(self.parse_phdrs()?));
                        }
                        "MEMORY" => {
                            self.pos += 1;
                            out.push(ScriptCommand::Memory(self.parse_memory()?));
                        }
                        "REGION_ALIAS" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let alias = self.expect_name_any()?;
                            self.expect_punct(",")?;
                            let region = self.expect_name_any()?;
                            self.expect_punct(")")?;
                            out.push(ScriptCommand::RegionAlias { alias, region });
                        }
                        "NOCROSSREFS" => {
                            self.pos += 1;
                            self.expect_punct("(")?;
                            let mut names = Vec::new();
                            while !self.accept_punct(")") {
                                names.push(self.expect_name_any()?);
                                self.accept_punct(",");
                            }
                            out.push(ScriptCommand::NoCrossRefs(names));
                        }
                        "SECTIONS" => {
                            self.pos += 1;
                            out.push(ScriptCommand::Sections(self.parse_sections_body()?));
                        }
                        "ASSERT" => {
                            let e = self.parse_assert_expression()?;
                            self.accept_punct(";");
                            out.push(ScriptCommand::Assert(e));
                        }
                        "PLUGIN" | "LINKER_PLUGIN" => {
                            self.pos += 1;
                            out.push(ScriptCommand::Plugin(self.parse_plugin()?));
                        }
                        "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN" => {
                            let a = self.parse_assignment(AssignmentLevel::OutsideSections)?;
                            out.push(ScriptCommand::Assignment(a));
                        }
                        _ => {
                            if self.at_assignment() {
                                let a =
                                    self.parse_assignment(AssignmentLevel::OutsideSections)?;
                                out.push(ScriptCommand::Assignment(a));
                            } else {
                                return Err(
                                    self.err(format!("unexpected token `{name}' at top level"))
                                );
                            }
                        }
                    }
                }
                other => {
                    return Err(self.err(format!("unexpected token {other:?} at top level")));
                }
            }
        }
        Ok(out)
    }

    fn parse_input_list(&mut self) -> Result<Vec<InputSpec>> {
        self.expect_punct("(")?;
        let mut specs = Vec::new();
        loop {
            if self.accept_punct(")") {
                break;
            }
            if self.accept_punct(",") {
                continue;
            }
            if self.accept_name("AS_NEEDED") {
                // membership is recorded; as-needed policy is the
                // driver's concern
                specs.extend(self.parse_input_list()?);
                continue;
            }
            if self.accept_punct("-") {
                let name = self.expect_name_any()?;
                let lib = name
                    .strip_prefix('l')
                    .ok_or_else(|| self.err(format!("unknown input option `-{name}'")))?;
                specs.push(InputSpec::Library(lib.to_string()));
                continue;
            }
            let name = self.expect_name_any()?;
            if let Some(lib) = name.strip_prefix("-l") {
                specs.push(InputSpec::Library(lib.to_string()));
            } else {
                specs.push(InputSpec::File(name));
            }
        }
        Ok(specs)
    }

    fn parse_plugin(&mut self) -> Result<PluginCmd> {
        self.expect_punct("(")?;
        let plugin_type = self.expect_name_any()?;
        self.expect_punct(",")?;
        let name = self.expect_name_any()?;
        let options = if self.accept_punct(",") {
            Some(self.expect_name_any()?)
        } else {
            None
        };
        self.expect_punct(")")?;
        Ok(PluginCmd {
            plugin_type,
            name,
            options,
        })
    }

    fn parse_phdrs(&mut self) -> Result<Vec<PhdrSpec>> {
        self.expect_punct("{")?;
        let mut specs = Vec::new();
        while !self.accept_punct("}") {
            if self.accept_punct(";") {
                continue;
            }
            let name = self.expect_name_any()?;
            let type_name = self.expect_name_any()?;
            let p_type = match PhdrSpec::type_from_keyword(&type_name) {
                Some(t) => t,
                None => return Err(self.err(format!("unknown PHDR type `{type_name}'"))),
            };
            let mut spec = PhdrSpec {
                name,
                p_type,
                filehdr: false,
                phdrs: false,
                at: None,
                flags: None,
            };
            loop {
                if self.accept_punct(";") {
                    break;
                }
                if self.accept_name("FILEHDR") {
                    spec.filehdr = true;
                } else if self.accept_name("PHDRS") {
                    spec.phdrs = true;
                } else if self.accept_name("AT") {
                    self.expect_punct("(")?;
                    let mut e = self.parse_expression()?;
                    e.set_context(&self.context());
                    self.expect_punct(")")?;
                    spec.at = Some(e);
                } else if self.accept_name("FLAGS") {
                    self.expect_punct("(")?;
                    let mut e = self.parse_expression()?;
                    e.set_context(&self.context());
                    self.expect_punct(")")?;
                    spec.flags = Some(e);
                } else {
                    return Err(self.err("expected `;' in PHDRS entry"));
                }
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    fn parse_memory(&mut self) -> Result<Vec<MemoryDesc>> {
        self.expect_punct("{")?;
        let mut descs = Vec::new();
        while !self.accept_punct("}") {
            if self.accept_punct(";") || self.accept_punct(",") {
                continue;
            }
            let name = self.expect_name_any()?;
            // attribute string: tokens between ( and ), rejoined
            let mut attrs = String::new();
            if self.accept_punct("(") {
                attrs.push('(');
                loop {
                    match self.next() {
                        Some(TokenKind::Punct(")")) => break,
                        Some(TokenKind::Punct(p)) => attrs.push_str(p),
                        Some(TokenKind::Name(n)) => attrs.push_str(&n),
                        Some(TokenKind::Number(n)) => attrs.push_str(&n.to_string()),
                        None => return Err(self.err("unterminated MEMORY attributes")),
                    }
                }
                attrs.push(')');
            }
            self.expect_punct(":")?;
            let origin_kw = self.expect_name_any()?;
            if !matches!(origin_kw.as_str(), "ORIGIN" | "org" | "o") {
                return Err(self.err("expected ORIGIN in MEMORY entry"));
            }
            self.expect_punct("=")?;
            let mut origin = self.parse_expression()?;
            origin.set_context(&self.context());
            self.expect_punct(",")?;
            let length_kw = self.expect_name_any()?;
            if !matches!(length_kw.as_str(), "LENGTH" | "len" | "l") {
                return Err(self.err("expected LENGTH in MEMORY entry"));
            }
            self.expect_punct("=")?;
            let mut length = self.parse_expression()?;
            length.set_context(&self.context());
            descs.push(MemoryDesc {
                name,
                attrs,
                origin,
                length,
            });
        }
        Ok(descs)
    }

    fn parse_sections_body(&mut self) -> Result<Vec<SectionsCommand>> {
        self.expect_punct("{")?;
        let mut out = Vec::new();
        while !self.accept_punct("}") {
            if self.accept_punct(";") {
                continue;
            }
            if self.accept_name("ENTRY") {
                self.expect_punct("(")?;
                let sym = self.expect_name_any()?;
                self.expect_punct(")")?;
                self.accept_punct(";");
                out.push(SectionsCommand::Entry(sym));
                continue;
            }
            if matches!(self.peek(), Some(TokenKind::Name(n)) if n == "ASSERT") {
                let e = self.parse_assert_expression()?;
                self.accept_punct(";");
                out.push(SectionsCommand::Assert(e));
                continue;
            }
            if self.at_assignment()
                || matches!(self.peek(), Some(TokenKind::Name(n)) if matches!(n.as_str(), "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN"))
            {
                let a = self.parse_assignment(AssignmentLevel::OutputSection)?;
                out.push(SectionsCommand::Assignment(a));
                continue;
            }
            out.push(SectionsCommand::OutputSect(self.parse_output_section()?));
        }
        // assignments after the final output section commit at the end of
        // the sweep
        let last_sect = out
            .iter()
            .rposition(|c| matches!(c, SectionsCommand::OutputSect(_)));
        if let Some(last) = last_sect {
            for cmd in out.iter_mut().skip(last + 1) {
                if let SectionsCommand::Assignment(a) = cmd {
                    a.level = AssignmentLevel::SectionsEnd;
                }
            }
        }
        Ok(out)
    }

    fn parse_output_section(&mut self) -> Result<OutputSectDesc> {
        let name = self.expect_pattern()?;
        let mut desc = OutputSectDesc {
            name,
            address: None,
            sect_type: None,
            at: None,
            align: None,
            subalign: None,
            commands: Vec::new(),
            region: None,
            at_region: None,
            phdrs: Vec::new(),
            fill: None,
        };
        // optional address and/or (TYPE) before the colon
        while self.peek() != Some(&TokenKind::Punct(":")) {
            if self.accept_punct("(") {
                let type_name = self.expect_name_any()?;
                desc.sect_type = Some(match type_name.as_str() {
                    "NOLOAD" => OutputSectType::NoLoad,
                    "COPY" => OutputSectType::Copy,
                    "INFO" => OutputSectType::Info,
                    "OVERLAY" => OutputSectType::Overlay,
                    other => return Err(self.err(format!("unknown section type `{other}'"))),
                });
                self.expect_punct(")")?;
            } else if desc.address.is_none() {
                let mut e = self.parse_expression()?;
                e.set_context(&self.context());
                desc.address = Some(e);
            } else {
                return Err(self.err("expected `:' in output section description"));
            }
        }
        self.expect_punct(":")?;
        // prolog keywords
        loop {
            if self.accept_name("AT") {
                self.expect_punct("(")?;
                let mut e = self.parse_expression()?;
                e.set_context(&self.context());
                self.expect_punct(")")?;
                desc.at = Some(e);
            } else if self.accept_name("ALIGN") {
                self.expect_punct("(")?;
                let mut e = self.parse_expression()?;
                e.set_context(&self.context());
                self.expect_punct(")")?;
                desc.align = Some(e);
            } else if self.accept_name("SUBALIGN") {
                self.expect_punct("(")?;
                let mut e = self.parse_expression()?;
                e.set_context(&self.context());
                self.expect_punct(")")?;
                desc.subalign = Some(e);
            } else {
                break;
            }
        }
        self.expect_punct("{")?;
        while !self.accept_punct("}") {
            if self.accept_punct(";") {
                continue;
            }
            desc.commands.push(self.parse_output_sect_command()?);
        }
        // epilog
        loop {
            if self.accept_name("AT") {
                self.expect_punct(">")?;
                desc.at_region = Some(self.expect_name_any()?);
            } else if self.accept_punct(">") {
                desc.region = Some(self.expect_name_any()?);
            } else if self.accept_punct(":") {
                desc.phdrs.push(self.expect_name_any()?);
            } else if self.accept_punct("=") {
                let mut e = self.parse_expression()?;
                e.set_context(&self.context());
                desc.fill = Some(e);
            } else if self.accept_punct(",") {
                break;
            } else {
                break;
            }
        }
        Ok(desc)
    }

    fn parse_output_sect_command(&mut self) -> Result<OutputSectCommand> {
        if matches!(self.peek(), Some(TokenKind::Name(n)) if n == "ASSERT") {
            let e = self.parse_assert_expression()?;
            self.accept_punct(";");
            return Ok(OutputSectCommand::Assert(e));
        }
        if self.at_assignment()
            || matches!(self.peek(), Some(TokenKind::Name(n)) if matches!(n.as_str(), "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN"))
        {
            let a = self.parse_assignment(AssignmentLevel::InputSection)?;
            return Ok(OutputSectCommand::Assignment(a));
        }
        if let Some(TokenKind::Name(n)) = self.peek() {
            let width = match n.as_str() {
                "BYTE" => Some(DataWidth::Byte),
                "SHORT" => Some(DataWidth::Short),
                "LONG" => Some(DataWidth::Long),
                "QUAD" => Some(DataWidth::Quad),
                "SQUAD" => Some(DataWidth::Squad),
                _ => None,
            };
            if let Some(width) = width {
                self.pos += 1;
                self.expect_punct("(")?;
                let mut expr = self.parse_expression()?;
                expr.set_context(&self.context());
                self.expect_punct(")")?;
                self.accept_punct(";");
                return Ok(OutputSectCommand::Data { width, expr });
            }
            if n == "FILL" {
                self.pos += 1;
                self.expect_punct("(")?;
                let mut expr = self.parse_expression()?;
                expr.set_context(&self.context());
                self.expect_punct(")")?;
                self.accept_punct(";");
                return Ok(OutputSectCommand::Fill(expr));
            }
            if n == "PLUGIN" || n == "LINKER_PLUGIN" {
                self.pos += 1;
                let cmd = self.parse_plugin()?;
                self.accept_punct(";");
                return Ok(OutputSectCommand::Plugin(cmd));
            }
            if n == "KEEP" {
                self.pos += 1;
                self.expect_punct("(")?;
                let spec = self.parse_input_sect_spec()?;
                self.expect_punct(")")?;
                return Ok(OutputSectCommand::Input(InputSectDesc { keep: true, spec }));
            }
        }
        let spec = self.parse_input_sect_spec()?;
        Ok(OutputSectCommand::Input(InputSectDesc { keep: false, spec }))
    }

    fn parse_input_sect_spec(&mut self) -> Result<InputSectSpec> {
        let file_text = self.expect_pattern()?;
        let mut archive = None;
        let mut file = Pattern::new(file_text);
        // `archive:member(sections)`
        if self.peek() == Some(&TokenKind::Punct(":"))
            && matches!(self.peek_at(1), Some(TokenKind::Name(_)))
            && self.peek_at(2) == Some(&TokenKind::Punct("("))
        {
            self.pos += 1;
            let member = self.expect_name_any()?;
            archive = Some(file);
            file = Pattern::new(member);
        }
        let mut sections = Vec::new();
        if self.accept_punct("(") {
            let mut excludes: Vec<Pattern> = Vec::new();
            while !self.accept_punct(")") {
                if self.accept_punct(",") {
                    continue;
                }
                if self.accept_name("EXCLUDE_FILE") {
                    self.expect_punct("(")?;
                    while !self.accept_punct(")") {
                        excludes.push(Pattern::new(self.expect_pattern()?));
                    }
                    continue;
                }
                let sort = if self.accept_name("SORT") || self.accept_name("SORT_BY_NAME") {
                    Some(SortPolicy::ByName)
                } else if self.accept_name("SORT_BY_ALIGNMENT") {
                    Some(SortPolicy::ByAlignment)
                } else if self.accept_name("SORT_BY_INIT_PRIORITY") {
                    Some(SortPolicy::ByInitPriority)
                } else {
                    None
                };
                let (pattern, sort) = match sort {
                    Some(policy) => {
                        self.expect_punct("(")?;
                        let p = self.expect_pattern()?;
                        self.expect_punct(")")?;
                        (p, policy)
                    }
                    None => (self.expect_pattern()?, SortPolicy::None),
                };
                sections.push(SectionPattern {
                    pattern: Pattern::new(pattern),
                    exclude_files: excludes.clone(),
                    sort,
                });
            }
        }
        Ok(InputSectSpec {
            archive,
            file,
            sections,
        })
    }

    fn parse_assignment(&mut self, level: AssignmentLevel) -> Result<Assignment> {
        let kind = if self.accept_name("PROVIDE") {
            AssignKind::Provide
        } else if self.accept_name("PROVIDE_HIDDEN") {
            AssignKind::ProvideHidden
        } else if self.accept_name("HIDDEN") {
            AssignKind::Hidden
        } else {
            AssignKind::Plain
        };
        let wrapped = kind != AssignKind::Plain;
        if wrapped {
            self.expect_punct("(")?;
        }
        let symbol = match self.next() {
            Some(TokenKind::Name(n)) => n,
            Some(TokenKind::Punct(".")) => ".".to_string(),
            other => return Err(self.err(format!("expected assignment target, found {other:?}"))),
        };
        let op = match self.next() {
            Some(TokenKind::Punct("=")) => AssignOp::Set,
            Some(TokenKind::Punct("+=")) => AssignOp::Add,
            Some(TokenKind::Punct("-=")) => AssignOp::Sub,
            Some(TokenKind::Punct("*=")) => AssignOp::Mul,
            Some(TokenKind::Punct("/=")) => AssignOp::Div,
            Some(TokenKind::Punct("&=")) => AssignOp::And,
            Some(TokenKind::Punct("|=")) => AssignOp::Or,
            Some(TokenKind::Punct("<<=")) => AssignOp::Shl,
            Some(TokenKind::Punct(">>=")) => AssignOp::Shr,
            other => return Err(self.err(format!("expected assignment operator, found {other:?}"))),
        };
        let mut expr = self.parse_expression()?;
        expr.set_context(&self.context());
        if wrapped {
            self.expect_punct(")")?;
        }
        self.accept_punct(";");
        Ok(Assignment {
            symbol,
            op,
            kind,
            expr,
            level,
        })
    }

    fn parse_assert_expression(&mut self) -> Result<Expression> {
        // caller saw the ASSERT keyword
        if !self.accept_name("ASSERT") {
            return Err(self.err("expected ASSERT"));
        }
        self.expect_punct("(")?;
        let cond = self.parse_expression()?;
        self.expect_punct(",")?;
        let message = self.expect_name_any()?;
        self.expect_punct(")")?;
        let mut e = Expression::new(ExprKind::Assert {
            cond: Box::new(cond),
            message,
        });
        e.set_context(&self.context());
        Ok(e)
    }

    // --- expressions -----------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expression> {
        let cond = self.parse_binary(0)?;
        if self.accept_punct("?") {
            let then = self.parse_ternary()?;
            self.expect_punct(":")?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expression::new(ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }));
        }
        Ok(cond)
    }

    fn binary_op_at(&self, level: usize) -> Option<BinaryOp> {
        let p = match self.peek()? {
            TokenKind::Punct(p) => *p,
            _ => return None,
        };
        let op = match (p, level) {
            ("||", 0) => BinaryOp::LogOr,
            ("&&", 1) => BinaryOp::LogAnd,
            ("|", 2) => BinaryOp::BitOr,
            ("^", 3) => BinaryOp::BitXor,
            ("&", 4) => BinaryOp::BitAnd,
            ("==", 5) => BinaryOp::Eq,
            ("!=", 5) => BinaryOp::Ne,
            ("<", 6) => BinaryOp::Lt,
            ("<=", 6) => BinaryOp::Le,
            (">", 6) => BinaryOp::Gt,
            (">=", 6) => BinaryOp::Ge,
            ("<<", 7) => BinaryOp::Shl,
            (">>", 7) => BinaryOp::Shr,
            ("+", 8) => BinaryOp::Add,
            ("-", 8) => BinaryOp::Sub,
            ("*", 9) => BinaryOp::Mul,
            ("/", 9) => BinaryOp::Div,
            ("%", 9) => BinaryOp::Mod,
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expression> {
        if level > 9 {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        while let Some(op) = self.binary_op_at(level) {
            self.pos += 1;
            let rhs = self.parse_binary(level + 1)?;
            lhs = Expression::new(ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        let op = if self.accept_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.accept_punct("~") {
            Some(UnaryOp::BitNot)
        } else if self.accept_punct("!") {
            Some(UnaryOp::LogNot)
        } else if self.accept_punct("+") {
            None // unary plus is a no-op
        } else {
            return self.parse_primary();
        };
        let operand = self.parse_unary()?;
        Ok(match op {
            Some(op) => Expression::new(ExprKind::Unary {
                op,
                operand: Box::new(operand),
            }),
            None => operand,
        })
    }

    fn parse_paren_name(&mut self) -> Result<String> {
        self.expect_punct("(")?;
        let name = self.expect_pattern()?;
        self.expect_punct(")")?;
        Ok(name)
    }

    fn parse_two_args(&mut self) -> Result<(Expression, Expression)> {
        self.expect_punct("(")?;
        let a = self.parse_expression()?;
        self.expect_punct(",")?;
        let b = self.parse_expression()?;
        self.expect_punct(")")?;
        Ok((a, b))
    }

    fn parse_one_arg(&mut self) -> Result<Expression> {
        self.expect_punct("(")?;
        let e = self.parse_expression()?;
        self.expect_punct(")")?;
        Ok(e)
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.peek().cloned() {
            Some(TokenKind::Number(v)) => {
                self.pos += 1;
                Ok(Expression::integer(v))
            }
            Some(TokenKind::Punct(".")) => {
                self.pos += 1;
                Ok(Expression::new(ExprKind::Dot))
            }
            Some(TokenKind::Punct("(")) => {
                self.pos += 1;
                let e = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            Some(TokenKind::Name(name)) => {
                self.pos += 1;
                self.parse_name_primary(name)
            }
            other => Err(self.err(format!("expected expression, found {other:?}"))),
        }
    }

    fn parse_name_primary(&mut self, name: String) -> Result<Expression> {
        Ok(match name.as_str() {
            "ALIGN" => {
                self.expect_punct("(")?;
                let first = self.parse_expression()?;
                let kind = if self.accept_punct(",") {
                    let align = self.parse_expression()?;
                    ExprKind::Align {
                        value: Box::new(first),
                        align: Box::new(align),
                    }
                } else {
                    // one-argument form aligns the location counter
                    ExprKind::Align {
                        value: Box::new(Expression::new(ExprKind::Dot)),
                        align: Box::new(first),
                    }
                };
                self.expect_punct(")")?;
                Expression::new(kind)
            }
            "SIZEOF" => {
                self.expect_punct("(")?;
                let name = if self.accept_punct(":") {
                    format!(":{}", self.expect_name_any()?)
                } else {
                    self.expect_pattern()?
                };
                self.expect_punct(")")?;
                Expression::new(ExprKind::SizeOf(name))
            }
            "SIZEOF_HEADERS" => Expression::new(ExprKind::SizeOfHeaders),
            "ADDR" => Expression::new(ExprKind::Addr(self.parse_paren_name()?)),
            "LOADADDR" => Expression::new(ExprKind::LoadAddr(self.parse_paren_name()?)),
            "ALIGNOF" => Expression::new(ExprKind::AlignOf(self.parse_paren_name()?)),
            "OFFSETOF" => Expression::new(ExprKind::OffsetOf(self.parse_paren_name()?)),
            "ORIGIN" => Expression::new(ExprKind::Origin(self.parse_paren_name()?)),
            "LENGTH" => Expression::new(ExprKind::Length(self.parse_paren_name()?)),
            "SEGMENT_START" => {
                self.expect_punct("(")?;
                let segment = self.expect_name_any()?;
                self.expect_punct(",")?;
                let default = self.parse_expression()?;
                self.expect_punct(")")?;
                Expression::new(ExprKind::SegmentStart {
                    segment,
                    default: Box::new(default),
                })
            }
            "DEFINED" => Expression::new(ExprKind::Defined(self.parse_paren_name()?)),
            "CONSTANT" => {
                let which = self.parse_paren_name()?;
                let kind = match which.as_str() {
                    "MAXPAGESIZE" => ConstantKind::MaxPageSize,
                    "COMMONPAGESIZE" => ConstantKind::CommonPageSize,
                    other => return Err(self.err(format!("unknown CONSTANT `{other}'"))),
                };
                Expression::new(ExprKind::Constant(kind))
            }
            "MAX" => {
                let (a, b) = self.parse_two_args()?;
                Expression::new(ExprKind::Max {
                    lhs: Box::new(a),
                    rhs: Box::new(b),
                })
            }
            "MIN" => {
                let (a, b) = self.parse_two_args()?;
                Expression::new(ExprKind::Min {
                    lhs: Box::new(a),
                    rhs: Box::new(b),
                })
            }
            "LOG2CEIL" => Expression::new(ExprKind::Log2Ceil(Box::new(self.parse_one_arg()?))),
            "ABSOLUTE" => Expression::new(ExprKind::Absolute(Box::new(self.parse_one_arg()?))),
            "DATA_SEGMENT_ALIGN" => {
                let (a, b) = self.parse_two_args()?;
                Expression::new(ExprKind::DataSegmentAlign {
                    max: Box::new(a),
                    common: Box::new(b),
                })
            }
            "DATA_SEGMENT_END" => {
                Expression::new(ExprKind::DataSegmentEnd(Box::new(self.parse_one_arg()?)))
            }
            "DATA_SEGMENT_RELRO_END" => {
                let (a, b) = self.parse_two_args()?;
                Expression::new(ExprKind::DataSegmentRelroEnd {
                    lhs: Box::new(a),
                    rhs: Box::new(b),
                })
            }
            "ASSERT" => {
                self.expect_punct("(")?;
                let cond = self.parse_expression()?;
                self.expect_punct(",")?;
                let message = self.expect_name_any()?;
                self.expect_punct(")")?;
                Expression::new(ExprKind::Assert {
                    cond: Box::new(cond),
                    message,
                })
            }
            _ => Expression::symbol(name),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::module::Module;
    use crate::script::expr::EvalContext;

    fn eval(text: &str) -> u64 {
        let module = Module::new(LinkConfig::builder().build());
        let ctx = EvalContext::at(&module, 0x1000);
        parse_expression_text(text).unwrap().eval(&ctx).unwrap()
    }

    #[test]
    fn test_expression_precedence() {
        assert_eq!(eval("1 + 2 * 3"), 7);
        assert_eq!(eval("(1 + 2) * 3"), 9);
        assert_eq!(eval("1 << 4 | 0xf"), 0x1f);
        assert_eq!(eval("~0 >> 60"), 0xf);
        assert_eq!(eval("4 / 2 % 2"), 0);
        assert_eq!(eval("1 < 2 ? 0x10 : 0x20"), 0x10);
        assert_eq!(eval("-1 + 2"), 1);
    }

    #[test]
    fn test_align_one_and_two_arg() {
        assert_eq!(eval("ALIGN(0x1000)"), 0x1000);
        assert_eq!(eval("ALIGN(., 0x800)"), 0x1000);
        assert_eq!(eval("ALIGN(0x1001, 0x1000)"), 0x2000);
    }

    #[test]
    fn test_parse_sections_with_assignments() {
        let cmds = parse_script(
            "t.ld",
            "SECTIONS { . = 0x1000; .text : { *(.text*) } . = ALIGN(., 0x1000); .data : { *(.data) } }",
        )
        .unwrap();
        assert_eq!(cmds.len(), 1);
        let ScriptCommand::Sections(body) = &cmds[0] else {
            panic!("expected SECTIONS");
        };
        assert_eq!(body.len(), 4);
        assert!(matches!(body[0], SectionsCommand::Assignment(_)));
        let SectionsCommand::OutputSect(text) = &body[1] else {
            panic!("expected output section");
        };
        assert_eq!(text.name, ".text");
        assert_eq!(text.commands.len(), 1);
        let OutputSectCommand::Input(desc) = &text.commands[0] else {
            panic!("expected input desc");
        };
        assert!(desc.spec.file.is_wildcard_all());
        assert_eq!(desc.spec.sections[0].pattern.as_str(), ".text*");
    }

    #[test]
    fn test_parse_memory_and_region() {
        let cmds = parse_script(
            "t.ld",
            "MEMORY { RAM (rwx) : ORIGIN = 0x1000, LENGTH = 0x100 FLASH (rx) : ORIGIN = 0x0, LENGTH = 4K }",
        )
        .unwrap();
        let ScriptCommand::Memory(descs) = &cmds[0] else {
            panic!("expected MEMORY");
        };
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].name, "RAM");
        assert_eq!(descs[0].attrs, "(rwx)");
        assert_eq!(descs[1].name, "FLASH");
    }

    #[test]
    fn test_parse_phdrs() {
        let cmds = parse_script(
            "t.ld",
            "PHDRS { headers PT_PHDR PHDRS ; text PT_LOAD FILEHDR PHDRS ; data PT_LOAD ; }",
        )
        .unwrap();
        let ScriptCommand::Phdrs(specs) = &cmds[0] else {
            panic!("expected PHDRS");
        };
        assert_eq!(specs.len(), 3);
        assert!(specs[0].phdrs && !specs[0].filehdr);
        assert!(specs[1].filehdr && specs[1].phdrs);
        assert_eq!(specs[2].p_type, crate::elf::PT_LOAD);
    }

    #[test]
    fn test_parse_output_section_epilog() {
        let cmds = parse_script(
            "t.ld",
            "SECTIONS { .data : AT(0x8000) ALIGN(16) { *(.data) } > RAM AT> FLASH :dataseg =0xff }",
        )
        .unwrap();
        let ScriptCommand::Sections(body) = &cmds[0] else {
            panic!("expected SECTIONS");
        };
        let SectionsCommand::OutputSect(desc) = &body[0] else {
            panic!("expected output section");
        };
        assert!(desc.at.is_some());
        assert!(desc.align.is_some());
        assert_eq!(desc.region.as_deref(), Some("RAM"));
        assert_eq!(desc.at_region.as_deref(), Some("FLASH"));
        assert_eq!(desc.phdrs, vec!["dataseg".to_string()]);
        assert!(desc.fill.is_some());
    }

    #[test]
    fn test_parse_keep_sort_exclude() {
        let cmds = parse_script(
            "t.ld",
            "SECTIONS { .init_array : { KEEP(*(SORT_BY_INIT_PRIORITY(.init_array.*))) *(EXCLUDE_FILE(*crtbegin.o) .ctors) } }",
        )
        .unwrap();
        let ScriptCommand::Sections(body) = &cmds[0] else {
            panic!("expected SECTIONS");
        };
        let SectionsCommand::OutputSect(desc) = &body[0] else {
            panic!("expected output section");
        };
        let OutputSectCommand::Input(keep) = &desc.commands[0] else {
            panic!("expected input desc");
        };
        assert!(keep.keep);
        assert_eq!(keep.spec.sections[0].sort, SortPolicy::ByInitPriority);
        let OutputSectCommand::Input(ctors) = &desc.commands[1] else {
            panic!("expected input desc");
        };
        assert!(!ctors.keep);
        assert_eq!(ctors.spec.sections[0].exclude_files.len(), 1);
    }

    #[test]
    fn test_parse_provide_and_compound() {
        let cmds = parse_script(
            "t.ld",
            "PROVIDE(__stack_top = 0x80000); __bss_extra = 4; __bss_extra += 4;",
        )
        .unwrap();
        assert_eq!(cmds.len(), 3);
        let ScriptCommand::Assignment(a) = &cmds[0] else {
            panic!("expected assignment");
        };
        assert_eq!(a.kind, AssignKind::Provide);
        let ScriptCommand::Assignment(c) = &cmds[2] else {
            panic!("expected assignment");
        };
        assert_eq!(c.op, AssignOp::Add);
    }

    #[test]
    fn test_parse_group_inputs() {
        let cmds =
            parse_script("t.ld", "GROUP(libc.a -lm AS_NEEDED(libgcc.a))").unwrap();
        let ScriptCommand::Group(specs) = &cmds[0] else {
            panic!("expected GROUP");
        };
        assert_eq!(
            specs,
            &vec![
                InputSpec::File("libc.a".into()),
                InputSpec::Library("m".into()),
                InputSpec::File("libgcc.a".into()),
            ]
        );
    }

    #[test]
    fn test_parse_data_and_fill_commands() {
        let cmds = parse_script(
            "t.ld",
            "SECTIONS { .tbl : { LONG(0x12345678); FILL(0x9090); BYTE(1) } }",
        )
        .unwrap();
        let ScriptCommand::Sections(body) = &cmds[0] else {
            panic!("expected SECTIONS");
        };
        let SectionsCommand::OutputSect(desc) = &body[0] else {
            panic!("expected output section");
        };
        assert!(matches!(
            desc.commands[0],
            OutputSectCommand::Data {
                width: DataWidth::Long,
                ..
            }
        ));
        assert!(matches!(desc.commands[1], OutputSectCommand::Fill(_)));
        assert!(matches!(
            desc.commands[2],
            OutputSectCommand::Data {
                width: DataWidth::Byte,
                ..
            }
        ));
    }

    #[test]
    fn test_sections_end_level() {
        let cmds = parse_script(
            "t.ld",
            "SECTIONS { .text : { *(.text) } _end = .; }",
        )
        .unwrap();
        let ScriptCommand::Sections(body) = &cmds[0] else {
            panic!("expected SECTIONS");
        };
        let SectionsCommand::Assignment(a) = &body[1] else {
            panic!("expected assignment");
        };
        assert_eq!(a.level, AssignmentLevel::SectionsEnd);
    }

    #[test]
    fn test_syntax_error_carries_context() {
        let err = parse_script("bad.ld", "SECTIONS {").unwrap_err();
        assert_eq!(err.id, DiagId::ERROR_SCRIPT_SYNTAX);
        assert!(err.context.as_deref().unwrap_or("").starts_with("bad.ld:"));
    }
}
