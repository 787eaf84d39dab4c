//! Mapping from rusqlite/r2d2 failures onto [`LedgerError`].

use ledger_core::{Context, LedgerError};
use rusqlite::{Connection, ErrorCode};

/// SQLite VM instructions between cancellation polls.
const PROGRESS_INTERVAL: i32 = 1_000;

/// Run `f` with a progress handler that interrupts the statement once `ctx`
/// is cancelled or past its deadline. The handler is removed afterwards.
pub(crate) fn guarded<T>(
    conn: &Connection,
    ctx: &Context,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let watched = ctx.clone();
    conn.progress_handler(PROGRESS_INTERVAL, Some(move || watched.is_done()));
    let result = f(conn);
    conn.progress_handler(PROGRESS_INTERVAL, None::<fn() -> bool>);
    result
}

/// Classify a failed statement. Interruptions become the context's error;
/// everything else is an opaque persistence failure tagged with `op`.
pub(crate) fn classify(op: &'static str, err: rusqlite::Error, ctx: &Context) -> LedgerError {
    if is_interrupt(&err) {
        return ctx.err(op).unwrap_or(LedgerError::Cancelled { op });
    }
    LedgerError::persistence(op, err)
}

pub(crate) fn is_interrupt(err: &rusqlite::Error) -> bool {
    sqlite_code(err) == Some(ErrorCode::OperationInterrupted)
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        sqlite_code(err),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// `CHECK (balance >= 0)` rejected the statement.
pub(crate) fn is_check_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_CHECK
        }
        _ => false,
    }
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
        _ => None,
    }
}
