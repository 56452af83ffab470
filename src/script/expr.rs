//! Linker-script expressions.
//!
//! An [`Expression`] is a tagged tree evaluated against the module.
//! `eval` computes a value without side effects (besides warnings);
//! `commit` walks post-order, re-evaluates and copies each node's value
//! into its `committed` slot; `result` is only valid after a commit.
//! `ASSERT` raises at commit time, after its subtree has committed, so a
//! failing script can still be dumped. Arithmetic is C-style unsigned
//! 64-bit with wraparound.

use crate::diag::{DiagId, DiagnosticEntry, Result};
use crate::module::Module;
use crate::support::{align_up, log2_ceil};
use std::fmt;

/// Binary operators, in C precedence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    /// The script spelling.
    pub fn token(self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    BitNot,
    LogNot,
}

/// Named constants (`CONSTANT(...)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantKind {
    MaxPageSize,
    CommonPageSize,
}

/// The node variants.
#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Integer literal
    Integer(u64),
    /// Symbol reference by name
    Symbol(String),
    /// The location counter `.`
    Dot,
    /// `SIZEOF(section)` or `SIZEOF(:segment)`
    SizeOf(String),
    /// `SIZEOF_HEADERS`
    SizeOfHeaders,
    /// `ADDR(section)`
    Addr(String),
    /// `LOADADDR(section)`
    LoadAddr(String),
    /// `ALIGNOF(section)`
    AlignOf(String),
    /// `OFFSETOF(section)` (extension: the section's file offset)
    OffsetOf(String),
    /// `ORIGIN(region)`
    Origin(String),
    /// `LENGTH(region)`
    Length(String),
    /// `SEGMENT_START(segment, default)`
    SegmentStart {
        segment: String,
        default: Box<Expression>,
    },
    /// `DEFINED(symbol)`
    Defined(String),
    /// `CONSTANT(...)`
    Constant(ConstantKind),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Ternary {
        cond: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    /// `ALIGN(value, align)`; the one-argument form parses as
    /// `ALIGN(., align)`
    Align {
        value: Box<Expression>,
        align: Box<Expression>,
    },
    /// `ABSOLUTE(expr)`
    Absolute(Box<Expression>),
    Max {
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Min {
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// `LOG2CEIL(expr)`
    Log2Ceil(Box<Expression>),
    /// `DATA_SEGMENT_ALIGN(maxpagesize, commonpagesize)`
    DataSegmentAlign {
        max: Box<Expression>,
        common: Box<Expression>,
    },
    /// `DATA_SEGMENT_END(expr)`
    DataSegmentEnd(Box<Expression>),
    /// `DATA_SEGMENT_RELRO_END(offset, expr)`
    DataSegmentRelroEnd {
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// `ASSERT(expr, message)`
    Assert {
        cond: Box<Expression>,
        message: String,
    },
}

/// Evaluation context: the module plus the current location counter.
/// Layout temporarily moves the section map out of the module while it
/// sweeps; `map` carries it so section queries keep working.
pub struct EvalContext<'a> {
    pub module: &'a Module,
    /// `.`, only meaningful inside `SECTIONS`
    pub dot: Option<u64>,
    /// Section map override while the module's copy is taken out
    pub map: Option<&'a crate::object::section_map::SectionMap>,
}

impl<'a> EvalContext<'a> {
    /// A context with no location counter (outside `SECTIONS`).
    pub fn outside(module: &'a Module) -> Self {
        EvalContext {
            module,
            dot: None,
            map: None,
        }
    }

    /// A context inside `SECTIONS` with the counter at `dot`.
    pub fn at(module: &'a Module, dot: u64) -> Self {
        EvalContext {
            module,
            dot: Some(dot),
            map: None,
        }
    }

    /// The effective section map.
    pub fn section_map(&self) -> &crate::object::section_map::SectionMap {
        self.map.unwrap_or(&self.module.section_map)
    }
}

/// An expression node with its source context and committed result.
#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    /// `file:line`, injected into every diagnostic raised from this
    /// subtree
    context: Option<String>,
    /// Last committed value
    committed: Option<u64>,
}

impl Expression {
    /// A new node without context; `set_context` must run before eval.
    pub fn new(kind: ExprKind) -> Self {
        Expression {
            kind,
            context: None,
            committed: None,
        }
    }

    /// An integer literal.
    pub fn integer(value: u64) -> Self {
        Expression::new(ExprKind::Integer(value))
    }

    /// A symbol reference.
    pub fn symbol(name: impl Into<String>) -> Self {
        Expression::new(ExprKind::Symbol(name.into()))
    }

    /// Propagate a source context to the whole tree.
    pub fn set_context(&mut self, context: &str) {
        self.context = Some(context.to_string());
        self.for_each_child_mut(&mut |child| child.set_context(context));
    }

    /// The node's source context.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// The committed result; only valid after `commit`.
    pub fn result(&self) -> Option<u64> {
        self.committed
    }

    fn ctx_string(&self) -> String {
        self.context.clone().unwrap_or_default()
    }

    fn err(&self, id: DiagId, args: Vec<String>) -> DiagnosticEntry {
        DiagnosticEntry::fatal(id, args).with_context(self.ctx_string())
    }

    /// Whether the subtree references the location counter.
    pub fn has_dot(&self) -> bool {
        if matches!(self.kind, ExprKind::Dot) {
            return true;
        }
        let mut found = false;
        self.for_each_child(&mut |child| {
            if child.has_dot() {
                found = true;
            }
        });
        found
    }

    /// Whether the subtree contains `SIZEOF_HEADERS` anywhere; any
    /// syntactic occurrence forces header loading.
    pub fn has_sizeof_headers(&self) -> bool {
        if matches!(self.kind, ExprKind::SizeOfHeaders) {
            return true;
        }
        let mut found = false;
        self.for_each_child(&mut |child| {
            if child.has_sizeof_headers() {
                found = true;
            }
        });
        found
    }

    /// Collect the symbol names referenced by the subtree.
    pub fn get_symbols(&self, out: &mut Vec<String>) {
        if let ExprKind::Symbol(name) = &self.kind {
            out.push(name.clone());
        }
        if let ExprKind::Defined(name) = &self.kind {
            out.push(name.clone());
        }
        self.for_each_child(&mut |child| child.get_symbols(out));
    }

    fn for_each_child(&self, f: &mut dyn FnMut(&Expression)) {
        match &self.kind {
            ExprKind::SegmentStart { default, .. } => f(default),
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                f(cond);
                f(then);
                f(otherwise);
            }
            ExprKind::Align { value, align } => {
                f(value);
                f(align);
            }
            ExprKind::Absolute(e) | ExprKind::Log2Ceil(e) | ExprKind::DataSegmentEnd(e) => f(e),
            ExprKind::Max { lhs, rhs }
            | ExprKind::Min { lhs, rhs }
            | ExprKind::DataSegmentRelroEnd { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::DataSegmentAlign { max, common } => {
                f(max);
                f(common);
            }
            ExprKind::Assert { cond, .. } => f(cond),
            _ => {}
        }
    }

    fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&mut Expression)) {
        match &mut self.kind {
            ExprKind::SegmentStart { default, .. } => f(default),
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                f(cond);
                f(then);
                f(otherwise);
            }
            ExprKind::Align { value, align } => {
                f(value);
                f(align);
            }
            ExprKind::Absolute(e) | ExprKind::Log2Ceil(e) | ExprKind::DataSegmentEnd(e) => f(e),
            ExprKind::Max { lhs, rhs }
            | ExprKind::Min { lhs, rhs }
            | ExprKind::DataSegmentRelroEnd { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::DataSegmentAlign { max, common } => {
                f(max);
                f(common);
            }
            ExprKind::Assert { cond, .. } => f(cond),
            _ => {}
        }
    }

    fn lookup_output_section(&self, ctx: &EvalContext<'_>, name: &str) -> Result<crate::section::SectionId> {
        ctx.section_map()
            .find_output_section(name)
            .ok_or_else(|| {
                self.err(
                    DiagId::ERROR_UNDEFINED_SECTION_IN_EXPRESSION,
                    vec![self.describe(), name.to_string()],
                )
            })
    }

    fn describe(&self) -> String {
        match &self.kind {
            ExprKind::SizeOf(n) => format!("SIZEOF({n})"),
            ExprKind::Addr(n) => format!("ADDR({n})"),
            ExprKind::LoadAddr(n) => format!("LOADADDR({n})"),
            ExprKind::AlignOf(n) => format!("ALIGNOF({n})"),
            ExprKind::OffsetOf(n) => format!("OFFSETOF({n})"),
            _ => self.to_string(),
        }
    }

    /// Evaluate the node. Returns a value or a diagnostic bearing the
    /// node's context.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<u64> {
        match &self.kind {
            ExprKind::Integer(v) => Ok(*v),
            ExprKind::Symbol(name) => {
                let module = ctx.module;
                match module.pool.find_id(name) {
                    Some(id) if module.pool.info(id).is_defined() => Ok(module.resolve_value(id)),
                    _ => Err(self.err(
                        DiagId::ERROR_UNDEFINED_SYMBOL_IN_EXPRESSION,
                        vec![name.clone()],
                    )),
                }
            }
            ExprKind::Dot => ctx.dot.ok_or_else(|| {
                self.err(
                    DiagId::ERROR_SCRIPT_SYNTAX,
                    vec!["`.' used outside SECTIONS".to_string()],
                )
            }),
            ExprKind::SizeOf(name) => {
                if let Some(segment) = name.strip_prefix(':') {
                    if !ctx.module.script.has_phdrs_cmd {
                        return Err(self.err(
                            DiagId::ERROR_SIZEOF_SEGMENT_WITHOUT_PHDRS,
                            vec![name.clone()],
                        ));
                    }
                    let seg = ctx
                        .module
                        .segments
                        .iter()
                        .find(|s| s.name.as_deref() == Some(segment));
                    return Ok(seg.map(|s| s.filesz).unwrap_or(0));
                }
                let sid = self.lookup_output_section(ctx, name)?;
                Ok(ctx.module.sections[sid].size)
            }
            ExprKind::SizeOfHeaders => Ok(ctx.module.sizeof_headers()),
            ExprKind::Addr(name) => {
                let sid = self.lookup_output_section(ctx, name)?;
                Ok(ctx.module.sections[sid]
                    .out
                    .as_ref()
                    .map(|o| o.addr)
                    .unwrap_or(0))
            }
            ExprKind::LoadAddr(name) => {
                let sid = self.lookup_output_section(ctx, name)?;
                Ok(ctx.module.sections[sid]
                    .out
                    .as_ref()
                    .map(|o| o.lma)
                    .unwrap_or(0))
            }
            ExprKind::AlignOf(name) => {
                let sid = self.lookup_output_section(ctx, name)?;
                Ok(ctx.module.sections[sid].align)
            }
            ExprKind::OffsetOf(name) => {
                let sid = self.lookup_output_section(ctx, name)?;
                Ok(ctx.module.sections[sid]
                    .out
                    .as_ref()
                    .map(|o| o.offset)
                    .unwrap_or(0))
            }
            ExprKind::Origin(region) => self.region_query(ctx, region, true),
            ExprKind::Length(region) => self.region_query(ctx, region, false),
            ExprKind::SegmentStart { segment, default } => {
                match ctx.module.config.segment_start(segment) {
                    Some(addr) => Ok(addr),
                    None => default.eval(ctx),
                }
            }
            ExprKind::Defined(name) => Ok(u64::from(
                ctx.module
                    .pool
                    .find(name)
                    .map(|info| info.is_defined())
                    .unwrap_or(false),
            )),
            ExprKind::Constant(kind) => Ok(match kind {
                ConstantKind::MaxPageSize => ctx.module.max_page_size(),
                ConstantKind::CommonPageSize => ctx.module.common_page_size(),
            }),
            ExprKind::Unary { op, operand } => {
                let v = operand.eval(ctx)?;
                Ok(match op {
                    UnaryOp::Neg => v.wrapping_neg(),
                    UnaryOp::BitNot => !v,
                    UnaryOp::LogNot => u64::from(v == 0),
                })
            }
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(ctx, *op, lhs, rhs),
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if cond.eval(ctx)? != 0 {
                    then.eval(ctx)
                } else {
                    otherwise.eval(ctx)
                }
            }
            ExprKind::Align { value, align } => {
                let v = value.eval(ctx)?;
                let a = align.eval(ctx)?;
                if a == 0 {
                    if v != 0 {
                        ctx.module.diag.raise(
                            DiagnosticEntry::warning(
                                DiagId::WARN_NON_POWER_OF_2_VALUE_TO_ALIGN_BUILTIN,
                                vec![format!("{a:x}")],
                            )
                            .with_context(self.ctx_string()),
                        );
                    }
                    return Ok(v);
                }
                if !a.is_power_of_two() {
                    ctx.module.diag.raise(
                        DiagnosticEntry::warning(
                            DiagId::WARN_NON_POWER_OF_2_VALUE_TO_ALIGN_BUILTIN,
                            vec![format!("{a:x}")],
                        )
                        .with_context(self.ctx_string()),
                    );
                }
                // the mask formula applies whatever the alignment is;
                // the warning is the only power-of-two concession
                Ok(v.wrapping_add(a - 1) & !(a - 1))
            }
            ExprKind::Absolute(e) => e.eval(ctx),
            ExprKind::Max { lhs, rhs } => Ok(lhs.eval(ctx)?.max(rhs.eval(ctx)?)),
            ExprKind::Min { lhs, rhs } => Ok(lhs.eval(ctx)?.min(rhs.eval(ctx)?)),
            ExprKind::Log2Ceil(e) => Ok(log2_ceil(e.eval(ctx)?)),
            ExprKind::DataSegmentAlign { max, common } => {
                let dot = ctx.dot.unwrap_or(0);
                let maxpage = max.eval(ctx)?;
                let commonpage = common.eval(ctx)?;
                // skip-over: round to the next max page; place-in: keep
                // the offset within the max page, rounding only to the
                // common page. The smaller result wins.
                let form1 = align_up(dot, maxpage.max(1));
                let form2 = align_up(dot, commonpage.max(1))
                    .wrapping_add(dot & maxpage.wrapping_sub(commonpage));
                Ok(form1.min(form2).max(dot))
            }
            ExprKind::DataSegmentEnd(e) => e.eval(ctx),
            ExprKind::DataSegmentRelroEnd { lhs, rhs } => {
                let sum = lhs.eval(ctx)?.wrapping_add(rhs.eval(ctx)?);
                Ok(align_up(sum, ctx.module.common_page_size()))
            }
            ExprKind::Assert { cond, .. } => cond.eval(ctx),
        }
    }

    fn region_query(&self, ctx: &EvalContext<'_>, region: &str, origin: bool) -> Result<u64> {
        let what = if origin { "ORIGIN" } else { "LENGTH" };
        let Some(reg) = ctx.module.script.find_region(region) else {
            return Err(self.err(
                DiagId::ERROR_UNDEFINED_MEMORY_REGION,
                vec![region.to_string()],
            ));
        };
        let expr = if origin { &reg.origin } else { &reg.length };
        expr.eval(ctx).map_err(|e| {
            let mut e = e;
            e.args.insert(0, format!("{what}({region})"));
            e
        })
    }

    fn eval_binary(
        &self,
        ctx: &EvalContext<'_>,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<u64> {
        // logical operators short-circuit
        match op {
            BinaryOp::LogAnd => {
                if lhs.eval(ctx)? == 0 {
                    return Ok(0);
                }
                return Ok(u64::from(rhs.eval(ctx)? != 0));
            }
            BinaryOp::LogOr => {
                if lhs.eval(ctx)? != 0 {
                    return Ok(1);
                }
                return Ok(u64::from(rhs.eval(ctx)? != 0));
            }
            _ => {}
        }
        let l = lhs.eval(ctx)?;
        let r = rhs.eval(ctx)?;
        Ok(match op {
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::Div => {
                if r == 0 {
                    return Err(self.err(
                        DiagId::ERROR_DIVISION_BY_ZERO,
                        vec![self.to_string()],
                    ));
                }
                l / r
            }
            BinaryOp::Mod => {
                if r == 0 {
                    return Err(self.err(DiagId::ERROR_MODULO_BY_ZERO, vec![self.to_string()]));
                }
                l % r
            }
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Shl => l.wrapping_shl(r as u32),
            BinaryOp::Shr => l.wrapping_shr(r as u32),
            BinaryOp::Lt => u64::from(l < r),
            BinaryOp::Le => u64::from(l <= r),
            BinaryOp::Gt => u64::from(l > r),
            BinaryOp::Ge => u64::from(l >= r),
            BinaryOp::Eq => u64::from(l == r),
            BinaryOp::Ne => u64::from(l != r),
            BinaryOp::BitAnd => l & r,
            BinaryOp::BitXor => l ^ r,
            BinaryOp::BitOr => l | r,
            BinaryOp::LogAnd | BinaryOp::LogOr => 0,
        })
    }

    /// Commit the subtree post-order: children first, then this node's
    /// value into its `committed` slot. `ASSERT` raises here, after its
    /// subtree has committed.
    pub fn commit(&mut self, ctx: &EvalContext<'_>) -> Result<u64> {
        let mut child_err: Option<DiagnosticEntry> = None;
        self.for_each_child_mut(&mut |child| {
            if child_err.is_none() {
                if let Err(e) = child.commit(ctx) {
                    child_err = Some(e);
                }
            }
        });
        if let Some(e) = child_err {
            return Err(e);
        }
        let value = self.eval(ctx)?;
        self.committed = Some(value);
        if let ExprKind::Assert { message, .. } = &self.kind {
            if value == 0 {
                return Err(self.err(DiagId::ERROR_ASSERT_FAILED, vec![message.clone()]));
            }
        }
        Ok(value)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Integer(v) => {
                if *v >= 10 {
                    write!(f, "0x{v:x}")
                } else {
                    write!(f, "{v}")
                }
            }
            ExprKind::Symbol(name) => f.write_str(name),
            ExprKind::Dot => f.write_str("."),
            ExprKind::SizeOf(n) => write!(f, "SIZEOF({n})"),
            ExprKind::SizeOfHeaders => f.write_str("SIZEOF_HEADERS"),
            ExprKind::Addr(n) => write!(f, "ADDR({n})"),
            ExprKind::LoadAddr(n) => write!(f, "LOADADDR({n})"),
            ExprKind::AlignOf(n) => write!(f, "ALIGNOF({n})"),
            ExprKind::OffsetOf(n) => write!(f, "OFFSETOF({n})"),
            ExprKind::Origin(n) => write!(f, "ORIGIN({n})"),
            ExprKind::Length(n) => write!(f, "LENGTH({n})"),
            ExprKind::SegmentStart { segment, default } => {
                write!(f, "SEGMENT_START(\"{segment}\", {default})")
            }
            ExprKind::Defined(n) => write!(f, "DEFINED({n})"),
            ExprKind::Constant(ConstantKind::MaxPageSize) => f.write_str("CONSTANT(MAXPAGESIZE)"),
            ExprKind::Constant(ConstantKind::CommonPageSize) => {
                f.write_str("CONSTANT(COMMONPAGESIZE)")
            }
            ExprKind::Unary { op, operand } => {
                let t = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::BitNot => "~",
                    UnaryOp::LogNot => "!",
                };
                write!(f, "{t}({operand})")
            }
            ExprKind::Binary { op, lhs, rhs } => {
                write!(f, "({lhs} {} {rhs})", op.token())
            }
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => write!(f, "({cond} ? {then} : {otherwise})"),
            ExprKind::Align { value, align } => write!(f, "ALIGN({value}, {align})"),
            ExprKind::Absolute(e) => write!(f, "ABSOLUTE({e})"),
            ExprKind::Max { lhs, rhs } => write!(f, "MAX({lhs}, {rhs})"),
            ExprKind::Min { lhs, rhs } => write!(f, "MIN({lhs}, {rhs})"),
            ExprKind::Log2Ceil(e) => write!(f, "LOG2CEIL({e})"),
            ExprKind::DataSegmentAlign { max, common } => {
                write!(f, "DATA_SEGMENT_ALIGN({max}, {common})")
            }
            ExprKind::DataSegmentEnd(e) => write!(f, "DATA_SEGMENT_END({e})"),
            ExprKind::DataSegmentRelroEnd { lhs, rhs } => {
                write!(f, "DATA_SEGMENT_RELRO_END({lhs}, {rhs})")
            }
            ExprKind::Assert { cond, message } => write!(f, "ASSERT({cond}, \"{message}\")"),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;

    fn module() -> Module {
        Module::new(LinkConfig::builder().build())
    }

    fn bin(op: BinaryOp, l: Expression, r: Expression) -> Expression {
        Expression::new(ExprKind::Binary {
            op,
            lhs: Box::new(l),
            rhs: Box::new(r),
        })
    }

    #[test]
    fn test_arithmetic() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let e = bin(
            BinaryOp::Add,
            Expression::integer(0x1000),
            bin(BinaryOp::Mul, Expression::integer(4), Expression::integer(8)),
        );
        assert_eq!(e.eval(&ctx).unwrap(), 0x1020);
    }

    #[test]
    fn test_division_by_zero_is_fatal() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let mut e = bin(BinaryOp::Div, Expression::integer(16), Expression::integer(0));
        e.set_context("t.ld:3");
        let err = e.eval(&ctx).unwrap_err();
        assert_eq!(err.id, DiagId::ERROR_DIVISION_BY_ZERO);
        assert_eq!(err.context.as_deref(), Some("t.ld:3"));
    }

    #[test]
    fn test_align_builtin() {
        let m = module();
        let ctx = EvalContext::at(&m, 0);
        let align = |v: u64, a: u64| {
            Expression::new(ExprKind::Align {
                value: Box::new(Expression::integer(v)),
                align: Box::new(Expression::integer(a)),
            })
        };
        assert_eq!(align(0x1001, 0x1000).eval(&ctx).unwrap(), 0x2000);
        assert_eq!(align(0x1000, 0x1000).eval(&ctx).unwrap(), 0x1000);
        // align of zero returns the value unchanged
        assert_eq!(align(0x77, 0).eval(&ctx).unwrap(), 0x77);
        assert_eq!(align(0, 0).eval(&ctx).unwrap(), 0);
        // a non power of two keeps the mask formula, with a warning
        assert_eq!(align(10, 12).eval(&ctx).unwrap(), (10 + 11) & !11u64);
        assert_eq!(m.diag.count(crate::diag::DiagnosticKind::Warning), 2);
    }

    #[test]
    fn test_log2ceil_boundaries() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        for (input, expect) in [(0u64, 0u64), (1, 0), (2, 1), (5, 3)] {
            let e = Expression::new(ExprKind::Log2Ceil(Box::new(Expression::integer(input))));
            assert_eq!(e.eval(&ctx).unwrap(), expect, "LOG2CEIL({input})");
        }
    }

    #[test]
    fn test_dot_outside_sections_fails() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let e = Expression::new(ExprKind::Dot);
        assert!(e.eval(&ctx).is_err());
        let ctx = EvalContext::at(&m, 0x100);
        assert_eq!(e.eval(&ctx).unwrap(), 0x100);
    }

    #[test]
    fn test_defined_and_undefined_symbol() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let defined = Expression::new(ExprKind::Defined("nope".into()));
        assert_eq!(defined.eval(&ctx).unwrap(), 0);
        let sym = Expression::symbol("nope");
        assert_eq!(
            sym.eval(&ctx).unwrap_err().id,
            DiagId::ERROR_UNDEFINED_SYMBOL_IN_EXPRESSION
        );
    }

    #[test]
    fn test_ternary_and_logic() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let e = Expression::new(ExprKind::Ternary {
            cond: Box::new(bin(
                BinaryOp::LogOr,
                Expression::integer(0),
                Expression::integer(7),
            )),
            then: Box::new(Expression::integer(10)),
            otherwise: Box::new(Expression::integer(20)),
        });
        assert_eq!(e.eval(&ctx).unwrap(), 10);
        // short-circuit keeps the divide-by-zero unevaluated
        let e = bin(
            BinaryOp::LogAnd,
            Expression::integer(0),
            bin(BinaryOp::Div, Expression::integer(1), Expression::integer(0)),
        );
        assert_eq!(e.eval(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_commit_stores_result_and_assert_fires_after() {
        let m = module();
        let ctx = EvalContext::outside(&m);
        let mut e = bin(BinaryOp::Add, Expression::integer(1), Expression::integer(2));
        assert_eq!(e.result(), None);
        e.commit(&ctx).unwrap();
        assert_eq!(e.result(), Some(3));

        let mut assert_expr = Expression::new(ExprKind::Assert {
            cond: Box::new(Expression::integer(0)),
            message: "text too big".into(),
        });
        assert_expr.set_context("t.ld:9");
        let err = assert_expr.commit(&ctx).unwrap_err();
        assert_eq!(err.id, DiagId::ERROR_ASSERT_FAILED);
        // the subtree committed before the raise
        assert_eq!(assert_expr.result(), Some(0));
    }

    #[test]
    fn test_segment_start_prefers_override() {
        let mut cfg = LinkConfig::builder().text_segment(0x40000).build();
        cfg.relax = false;
        let m = Module::new(cfg);
        let ctx = EvalContext::outside(&m);
        let e = Expression::new(ExprKind::SegmentStart {
            segment: "text-segment".into(),
            default: Box::new(Expression::integer(0x10000)),
        });
        assert_eq!(e.eval(&ctx).unwrap(), 0x40000);
        let e = Expression::new(ExprKind::SegmentStart {
            segment: "data-segment".into(),
            default: Box::new(Expression::integer(0x20000)),
        });
        assert_eq!(e.eval(&ctx).unwrap(), 0x20000);
    }

    #[test]
    fn test_dump_round_trip() {
        let m = module();
        let ctx = EvalContext::at(&m, 0x500);
        let e = Expression::new(ExprKind::Align {
            value: Box::new(bin(
                BinaryOp::Add,
                Expression::new(ExprKind::Dot),
                Expression::integer(0x10),
            )),
            align: Box::new(Expression::integer(0x100)),
        });
        let dumped = e.to_string();
        let reparsed = crate::script::parse::parse_expression_text(&dumped).unwrap();
        assert_eq!(e.eval(&ctx).unwrap(), reparsed.eval(&ctx).unwrap());
    }
}
