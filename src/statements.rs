//! Top-level statement splitting for SQL scripts
//!
//! Only as much lexing as is needed to find statement boundaries: single and
//! double quotes, `--` and `/* */` comments, PostgreSQL dollar quoting, and
//! `CREATE TRIGGER ... BEGIN ... END` bodies are kept intact.

use once_cell::sync::Lazy;
use regex::Regex;

static CREATE_TRIGGER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*CREATE\s+(TEMP\s+|TEMPORARY\s+)?TRIGGER\b")
        .unwrap_or_else(|e| unreachable!("trigger pattern is valid: {e}"))
});

/// Split `sql` into trimmed, non-empty top-level statements (without the `;`)
#[must_use]
pub fn split_statements(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;
    let mut trigger_depth = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i, bytes[i]),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = sql[i..].find('\n').map_or(bytes.len(), |n| i + n + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
            }
            b'$' => i = skip_dollar_quoted(sql, i),
            b';' => {
                let current = &sql[start..i];
                if trigger_depth == 0 && CREATE_TRIGGER.is_match(current) {
                    trigger_depth = trigger_block_depth(current);
                }
                if trigger_depth > 0 && !ends_block(current) {
                    i += 1;
                    continue;
                }
                trigger_depth = 0;
                push_statement(&mut statements, current);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    push_statement(&mut statements, &sql[start..]);
    statements
}

/// The statement with leading whitespace and comments removed
#[must_use]
pub fn strip_leading_comments(statement: &str) -> &str {
    let mut rest = statement.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped.find('\n').map_or("", |n| &stripped[n + 1..]).trim_start();
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = stripped.find("*/").map_or("", |n| &stripped[n + 2..]).trim_start();
        } else {
            return rest;
        }
    }
}

/// Leading keyword of a statement, upper-cased, skipping comments
#[must_use]
pub fn leading_keyword(statement: &str) -> Option<String> {
    let word: String = strip_leading_comments(statement)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

fn push_statement<'a>(statements: &mut Vec<&'a str>, raw: &'a str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && !is_only_comments(trimmed) {
        statements.push(trimmed);
    }
}

fn is_only_comments(statement: &str) -> bool {
    leading_keyword(statement).is_none()
        && statement
            .lines()
            .all(|line| line.trim().is_empty() || line.trim_start().starts_with("--"))
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_dollar_quoted(sql: &str, open: usize) -> usize {
    let rest = &sql[open + 1..];
    let tag_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if !rest[tag_len..].starts_with('$') || rest[..tag_len].starts_with(|c: char| c.is_ascii_digit())
    {
        // Positional parameter such as `$1`, or a lone `$`.
        return open + 1;
    }
    let delimiter = &sql[open..open + tag_len + 2];
    let body_start = open + delimiter.len();
    sql[body_start..]
        .find(delimiter)
        .map_or(sql.len(), |n| body_start + n + delimiter.len())
}

fn words_upper(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_uppercase)
}

fn trigger_block_depth(text: &str) -> usize {
    let mut depth = 0usize;
    for word in words_upper(text) {
        match word.as_str() {
            "BEGIN" | "CASE" => depth += 1,
            "END" => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

fn ends_block(text: &str) -> bool {
    let mut depth = 0i64;
    for word in words_upper(text) {
        match word.as_str() {
            "BEGIN" | "CASE" => depth += 1,
            "END" => depth -= 1,
            _ => {}
        }
    }
    depth <= 0 && text.trim_end().to_ascii_uppercase().ends_with("END")
}
