//! `?` placeholder handling shared by the bundled backends.

use std::fmt::Write;

use crate::error::{Error, Result};
use crate::types::Value;

/// How a dialect writes string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// Quotes are doubled to escape them.
    Standard,
    /// Backslash escapes the next character as well.
    Backslash,
}

/// Replace each `?` outside quotes and comments with `marker(n)`, `n`
/// counting from 1. Returns the rewritten SQL and the placeholder count.
pub(crate) fn rewrite<F>(sql: &str, dialect: Dialect, mut marker: F) -> Result<(String, usize)>
where
    F: FnMut(usize) -> Result<String>,
{
    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0;
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && dialect == Dialect::Backslash {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for c in chars.by_ref() {
                    out.push(c);
                    if c == '\n' {
                        break;
                    }
                }
            }
            '?' => {
                count += 1;
                out.push_str(&marker(count)?);
            }
            _ => out.push(c),
        }
    }

    Ok((out, count))
}

/// `?` → `$1`, `$2`, ...
pub(crate) fn numbered(sql: &str) -> (String, usize) {
    // the marker never fails
    rewrite(sql, Dialect::Standard, |n| Ok(format!("${}", n)))
        .unwrap_or_else(|_| (sql.to_owned(), 0))
}

/// Substitute `params` into `sql` as MySQL literals.
pub(crate) fn interpolate(sql: &str, params: &[Value]) -> Result<String> {
    let (bound, count) = rewrite(sql, Dialect::Backslash, |n| match params.get(n - 1) {
        Some(value) => Ok(mysql_literal(value)),
        None => Err(arity_error(n, params.len())),
    })?;

    if count != params.len() {
        return Err(arity_error(count, params.len()));
    }
    Ok(bound)
}

fn arity_error(expected: usize, given: usize) -> Error {
    Error::interface(format!(
        "wrong number of bind parameters ({} for {})",
        given, expected
    ))
}

pub(crate) fn mysql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(f) => quote_mysql(&f.to_string()),
        Value::Decimal(d) => d.to_string(),
        Value::Bytes(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 3);
            hex.push_str("X'");
            for byte in bytes {
                let _ = write!(hex, "{:02x}", byte);
            }
            hex.push('\'');
            hex
        }
        other => quote_mysql(&other.to_string()),
    }
}

fn quote_mysql(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        match c {
            '\0' => quoted.push_str("\\0"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\x1a' => quoted.push_str("\\Z"),
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '"' => quoted.push_str("\\\""),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote a MySQL identifier with backticks.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
