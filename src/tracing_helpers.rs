//! Span helpers used when the `tracing` feature is enabled

use tracing::{info_span, Span};

/// Longest statement prefix recorded on a span
const STATEMENT_PREVIEW_LEN: usize = 120;

fn preview(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.char_indices().nth(STATEMENT_PREVIEW_LEN) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

pub fn execute_statement_span(sql: &str) -> Span {
    info_span!("tidemark.execute", statement = preview(sql))
}

pub fn begin_transaction_span() -> Span {
    info_span!("tidemark.transaction.begin")
}

pub fn commit_transaction_span() -> Span {
    info_span!("tidemark.transaction.commit")
}

pub fn rollback_transaction_span() -> Span {
    info_span!("tidemark.transaction.rollback")
}

pub fn migration_span(identity: &str, serial: i64) -> Span {
    info_span!("tidemark.migration", identity, serial)
}
