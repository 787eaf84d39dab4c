//! A single atomic unit of work against the accounts table.
//!
//! A session owns one pooled connection with an open `BEGIN IMMEDIATE`
//! transaction. Mutations stay invisible to other sessions until
//! [`Session::commit`]; [`Session::rollback`] discards them. Errors from a
//! mutation never roll back on their own: the caller decides. The exception
//! is a failure after which SQLite has already rolled the transaction back
//! (an interrupted write, a full disk): the session is then aborted and
//! refuses further work.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use ledger_core::errors::to_sql_amount;
use ledger_core::{Context, LedgerError, SessionId};
use ledger_telemetry::MetricsRecorder;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::error::{classify, guarded, is_check_violation};
use crate::store::PooledConnection;

const OP_INSERT: &str = "insert account";
const OP_DEBIT: &str = "transfer from account";
const OP_CREDIT: &str = "transfer to account";
const OP_READ: &str = "read balance";
const OP_COMMIT: &str = "commit";
const OP_ROLLBACK: &str = "rollback";

enum SessionState {
    Active(PooledConnection),
    /// Construction failed; every call replays this error.
    Failed(LedgerError),
    /// The store rolled the transaction back under us. Holds the
    /// `TransactionAborted` error replayed by later calls.
    Aborted(LedgerError),
    /// Committed or rolled back.
    Finished,
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    metrics: Arc<MetricsRecorder>,
    opened_at: Instant,
}

impl Session {
    pub(crate) fn active(id: SessionId, conn: PooledConnection, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            id,
            state: SessionState::Active(conn),
            metrics,
            opened_at: Instant::now(),
        }
    }

    pub(crate) fn failed(id: SessionId, err: LedgerError, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            id,
            state: SessionState::Failed(err),
            metrics,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True until the session is committed, rolled back or aborted. Always
    /// false for a poisoned session.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    fn conn(&self) -> Result<&rusqlite::Connection, LedgerError> {
        match &self.state {
            SessionState::Active(conn) => Ok(&**conn),
            SessionState::Failed(err) | SessionState::Aborted(err) => Err(err.clone()),
            SessionState::Finished => Err(LedgerError::SessionClosed),
        }
    }

    /// After a failed call, check whether SQLite is still inside our
    /// transaction. If it fell back to autocommit, every later statement would
    /// commit on its own, so the session is aborted instead.
    fn after_failure(&mut self, operation: &'static str, err: &LedgerError) {
        self.record_error(operation, err);

        let rolled_back = match &self.state {
            SessionState::Active(conn) => conn.is_autocommit(),
            _ => false,
        };
        if !rolled_back {
            return;
        }
        let aborted = LedgerError::TransactionAborted(Box::new(err.clone()));
        // The connection is back in autocommit and safe to return to the pool.
        self.state = SessionState::Aborted(aborted.clone());
        self.finish("aborted", &Err(aborted));
    }

    /// Insert a new account. A duplicate address fails the insert itself;
    /// there is no separate existence check.
    #[instrument(skip(self, ctx), fields(session_id = %self.id))]
    pub fn create_account(
        &mut self,
        ctx: &Context,
        address: &str,
        balance: u64,
    ) -> Result<(), LedgerError> {
        let result = self.insert_account(ctx, address, balance);
        match &result {
            Ok(()) => {
                self.metrics.counter_inc("ledger_accounts_created_total", &[], 1);
            }
            Err(err) => self.after_failure("create_account", err),
        }
        result
    }

    fn insert_account(&self, ctx: &Context, address: &str, balance: u64) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let balance = to_sql_amount(balance)?;
        ctx.check(OP_INSERT)?;

        guarded(conn, ctx, |c| {
            c.execute(
                "INSERT INTO accounts (address, balance) VALUES (?1, ?2)",
                params![address, balance],
            )
        })
        .map_err(|e| classify(OP_INSERT, e, ctx))?;
        Ok(())
    }

    /// Move `amount` from `from` to `to` inside this session's transaction.
    ///
    /// The debit is a single `UPDATE ... RETURNING` so concurrent sessions
    /// cannot lose an update between a read and a write. On any error the
    /// debit may still be applied inside the open transaction; roll back.
    #[instrument(skip(self, ctx), fields(session_id = %self.id))]
    pub fn move_funds(
        &mut self,
        ctx: &Context,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let result = self.transfer(ctx, from, to, amount);
        let outcome = match &result {
            Ok(()) => "ok",
            Err(err) => {
                self.after_failure("move_funds", err);
                err.error_kind()
            }
        };
        self.metrics
            .counter_inc("ledger_transfers_total", &[("outcome", outcome)], 1);
        result
    }

    fn transfer(&self, ctx: &Context, from: &str, to: &str, amount: u64) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let delta = to_sql_amount(amount)?;
        let insufficient = || LedgerError::InsufficientFunds {
            address: from.to_string(),
            requested: amount,
        };

        ctx.check(OP_DEBIT)?;
        let debited = guarded(conn, ctx, |c| {
            c.query_row(
                "UPDATE accounts SET balance = balance - ?1 WHERE address = ?2 RETURNING balance",
                params![delta, from],
                |row| row.get::<_, i64>(0),
            )
        });
        let remaining = match debited {
            Ok(balance) if balance < 0 => return Err(insufficient()),
            Ok(balance) => balance,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(LedgerError::AccountNotFound {
                    address: from.to_string(),
                })
            }
            Err(e) if is_check_violation(&e) => return Err(insufficient()),
            Err(e) => return Err(classify(OP_DEBIT, e, ctx)),
        };
        debug!(remaining, "debited source account");

        ctx.check(OP_CREDIT)?;
        let rows = guarded(conn, ctx, |c| {
            c.execute(
                "UPDATE accounts SET balance = balance + ?1 WHERE address = ?2",
                params![delta, to],
            )
        })
        .map_err(|e| classify(OP_CREDIT, e, ctx))?;
        if rows != 1 {
            return Err(LedgerError::DestinationNotAffected {
                address: to.to_string(),
                rows,
            });
        }
        Ok(())
    }

    /// Balance of `address` as seen by this session, including its own
    /// uncommitted writes.
    #[instrument(skip(self, ctx), fields(session_id = %self.id))]
    pub fn balance(&mut self, ctx: &Context, address: &str) -> Result<u64, LedgerError> {
        let result = self.read_balance(ctx, address);
        if let Err(err) = &result {
            self.after_failure("balance", err);
        }
        result
    }

    fn read_balance(&self, ctx: &Context, address: &str) -> Result<u64, LedgerError> {
        let conn = self.conn()?;
        ctx.check(OP_READ)?;

        let balance = guarded(conn, ctx, |c| {
            c.query_row(
                "SELECT balance FROM accounts WHERE address = ?1",
                params![address],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .map_err(|e| classify(OP_READ, e, ctx))?
        .ok_or_else(|| LedgerError::AccountNotFound {
            address: address.to_string(),
        })?;

        u64::try_from(balance)
            .map_err(|_| LedgerError::persistence(OP_READ, format!("negative balance {balance}")))
    }

    /// Make every mutation of this session durable and visible.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn commit(&mut self) -> Result<(), LedgerError> {
        let conn = self.take_conn()?;
        let result = conn
            .execute_batch("COMMIT")
            .map_err(|e| LedgerError::persistence(OP_COMMIT, e));
        if result.is_err() && !conn.is_autocommit() {
            // Never hand a connection back to the pool mid-transaction.
            let _ = conn.execute_batch("ROLLBACK");
        }
        self.finish(if result.is_ok() { "committed" } else { "commit_failed" }, &result);
        result
    }

    /// Discard every mutation of this session. On an aborted session there is
    /// nothing left to discard: this succeeds and closes it.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn rollback(&mut self) -> Result<(), LedgerError> {
        if let SessionState::Aborted(_) = self.state {
            self.state = SessionState::Finished;
            debug!("aborted session closed");
            return Ok(());
        }
        let conn = self.take_conn()?;
        // SQLite may already have rolled back on its own (e.g. SQLITE_FULL).
        let result = if conn.is_autocommit() {
            Ok(())
        } else {
            conn.execute_batch("ROLLBACK")
                .map_err(|e| LedgerError::persistence(OP_ROLLBACK, e))
        };
        self.finish("rolled_back", &result);
        result
    }

    /// Move to `Finished`, handing out the connection. Poisoned and aborted
    /// sessions keep their state; finished ones report
    /// [`LedgerError::SessionClosed`].
    fn take_conn(&mut self) -> Result<PooledConnection, LedgerError> {
        match std::mem::replace(&mut self.state, SessionState::Finished) {
            SessionState::Active(conn) => Ok(conn),
            SessionState::Failed(err) => {
                self.state = SessionState::Failed(err.clone());
                Err(err)
            }
            SessionState::Aborted(err) => {
                self.state = SessionState::Aborted(err.clone());
                Err(err)
            }
            SessionState::Finished => Err(LedgerError::SessionClosed),
        }
    }

    fn finish(&self, outcome: &'static str, result: &Result<(), LedgerError>) {
        let elapsed_ms = self.opened_at.elapsed().as_secs_f64() * 1000.0;
        self.metrics.gauge_inc("ledger_sessions_active", &[], -1.0);
        self.metrics
            .counter_inc("ledger_sessions_closed_total", &[("outcome", outcome)], 1);
        self.metrics
            .histogram_observe("ledger_session_duration_ms", &[], elapsed_ms);
        match result {
            Ok(()) => debug!(outcome, elapsed_ms, "session finished"),
            Err(err) => warn!(outcome, error = %err, "session finished with error"),
        }
    }

    fn record_error(&self, operation: &'static str, err: &LedgerError) {
        let kind = err.root_cause().error_kind();
        self.metrics
            .counter_inc("ledger_errors_total", &[("kind", kind)], 1);
        warn!(operation, error = %err, error_kind = kind, "session operation failed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let SessionState::Active(conn) = std::mem::replace(&mut self.state, SessionState::Finished) {
            warn!(session_id = %self.id, "session dropped while active, rolling back");
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(session_id = %self.id, error = %e, "rollback on drop failed");
            }
            self.finish("dropped", &Ok(()));
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            SessionState::Active(_) => "active",
            SessionState::Failed(_) => "failed",
            SessionState::Aborted(_) => "aborted",
            SessionState::Finished => "finished",
        };
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}
