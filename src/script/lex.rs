//! Linker-script tokenizer.
//!
//! Produces a flat token stream with source positions. Name tokens are
//! permissive: section and file patterns (`.text*`, `libm.a`, `*.o`,
//! `arch(member)` pieces) lex as names including glob metacharacters. A
//! standalone `*` or `?` lexes as punctuation; the parser reinterprets it
//! as a wildcard where a pattern is expected.

use crate::diag::{DiagId, DiagnosticEntry, Result};

/// One token with its line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

/// Token variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// A name, keyword, pattern or quoted string (quotes stripped)
    Name(String),
    /// An integer literal, already decoded (suffixes `K`/`M` applied)
    Number(u64),
    /// Punctuation or operator, by its exact spelling
    Punct(&'static str),
}

impl TokenKind {
    /// The name payload, if any.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }
}

const PUNCTS: &[&str] = &[
    "<<=", ">>=", "&&", "||", "<<", ">>", "<=", ">=", "==", "!=", "+=", "-=", "*=", "/=", "&=",
    "|=", "{", "}", "(", ")", ";", ":", ",", "=", "+", "-", "*", "/", "%", "!", "~", "^", "&",
    "|", "<", ">", "?", ".",
];

fn is_name_start(c: char) -> bool {
    // `-` and `~` start operators; they may continue a name but not
    // begin one
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '\\' | '$' | '[' | ']')
}

fn is_name_continue(c: char) -> bool {
    is_name_start(c) || matches!(c, '*' | '?' | '-')
}

/// Decode a number literal; returns `None` when `text` is not numeric.
fn parse_number(text: &str) -> Option<u64> {
    let (body, mult) = match text.as_bytes().last()? {
        b'K' | b'k' => (&text[..text.len() - 1], 1024u64),
        b'M' | b'm' if !text.starts_with("0x") && !text.starts_with("0X") => {
            (&text[..text.len() - 1], 1024 * 1024)
        }
        _ => (text, 1),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(hex) = body.strip_suffix(['h', 'H']) {
        u64::from_str_radix(hex, 16).ok()?
    } else if body.len() > 1 && body.starts_with('0') && body.bytes().all(|b| b.is_ascii_digit()) {
        u64::from_str_radix(body, 8).ok()?
    } else {
        body.parse().ok()?
    };
    Some(value.wrapping_mul(mult))
}

/// Tokenize script text. `origin` names the source in diagnostics.
pub fn tokenize(origin: &str, text: &str) -> Result<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut line: u32 = 1;
    while let Some(&(start, c)) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if text[start..].starts_with("/*") => {
                chars.next();
                chars.next();
                let mut prev = ' ';
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err(syntax(origin, line, "unterminated comment"));
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    if c == '\n' {
                        line += 1;
                    }
                    s.push(c);
                }
                if !closed {
                    return Err(syntax(origin, line, "unterminated string"));
                }
                out.push(Token {
                    kind: TokenKind::Name(s),
                    line,
                });
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match parse_number(&s) {
                    Some(v) => out.push(Token {
                        kind: TokenKind::Number(v),
                        line,
                    }),
                    // not numeric after all (e.g. `0x` dirs): keep as name
                    None => out.push(Token {
                        kind: TokenKind::Name(s),
                        line,
                    }),
                }
            }
            c if is_name_start(c) => {
                let mut s = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if is_name_continue(c) {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // `.` alone is the location counter, `/` alone divides
                match s.as_str() {
                    "." => out.push(Token {
                        kind: TokenKind::Punct("."),
                        line,
                    }),
                    "/" => out.push(Token {
                        kind: TokenKind::Punct("/"),
                        line,
                    }),
                    _ => out.push(Token {
                        kind: TokenKind::Name(s),
                        line,
                    }),
                }
            }
            _ => {
                let rest = &text[start..];
                let Some(p) = PUNCTS.iter().find(|p| rest.starts_with(**p)) else {
                    return Err(syntax(origin, line, &format!("unexpected character `{c}'")));
                };
                for _ in 0..p.chars().count() {
                    chars.next();
                }
                out.push(Token {
                    kind: TokenKind::Punct(p),
                    line,
                });
            }
        }
    }
    Ok(out)
}

fn syntax(origin: &str, line: u32, message: &str) -> DiagnosticEntry {
    DiagnosticEntry::fatal(DiagId::ERROR_SCRIPT_SYNTAX, vec![message.to_string()])
        .with_context(format!("{origin}:{line}"))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize("t.ld", text)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("16 0x10 0X10 4K 2M 010 0ffh"),
            vec![
                TokenKind::Number(16),
                TokenKind::Number(16),
                TokenKind::Number(16),
                TokenKind::Number(4096),
                TokenKind::Number(2 * 1024 * 1024),
                TokenKind::Number(8),
                TokenKind::Number(0xff),
            ]
        );
    }

    #[test]
    fn test_section_patterns_lex_as_names() {
        assert_eq!(
            kinds("*(.text* .rodata.[ab]?)"),
            vec![
                TokenKind::Punct("*"),
                TokenKind::Punct("("),
                TokenKind::Name(".text*".into()),
                TokenKind::Name(".rodata.[ab]?".into()),
                TokenKind::Punct(")"),
            ]
        );
    }

    #[test]
    fn test_assignment_tokens() {
        assert_eq!(
            kinds(". = ALIGN(., 0x1000);"),
            vec![
                TokenKind::Punct("."),
                TokenKind::Punct("="),
                TokenKind::Name("ALIGN".into()),
                TokenKind::Punct("("),
                TokenKind::Punct("."),
                TokenKind::Punct(","),
                TokenKind::Number(0x1000),
                TokenKind::Punct(")"),
                TokenKind::Punct(";"),
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let toks = tokenize("t.ld", "/* hi\nthere */ SECTIONS # tail\n{ }").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Name("SECTIONS".into()));
        assert_eq!(toks[0].line, 2);
        assert_eq!(toks[1].kind, TokenKind::Punct("{"));
        assert_eq!(toks[1].line, 3);
    }

    #[test]
    fn test_output_section_colon_splits() {
        assert_eq!(
            kinds(".text : { }"),
            vec![
                TokenKind::Name(".text".into()),
                TokenKind::Punct(":"),
                TokenKind::Punct("{"),
                TokenKind::Punct("}"),
            ]
        );
    }

    #[test]
    fn test_quoted_names() {
        assert_eq!(
            kinds("\"my section\""),
            vec![TokenKind::Name("my section".into())]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("a += 1 << 2 && 3"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Punct("+="),
                TokenKind::Number(1),
                TokenKind::Punct("<<"),
                TokenKind::Number(2),
                TokenKind::Punct("&&"),
                TokenKind::Number(3),
            ]
        );
    }
}
