use std::fmt;
use std::sync::Arc;

use ledger_core::{Context, LedgerError, SessionId};
use ledger_telemetry::MetricsRecorder;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::{classify, guarded, is_busy};
use crate::schema;
use crate::session::Session;

pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const OP_BEGIN: &str = "begin transaction";
const OP_CHECKOUT: &str = "checkout connection";

/// Process-wide handle to the ledger database.
///
/// Cheap to clone; every clone shares the same pool and metrics.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
    config: Arc<StoreConfig>,
    metrics: Arc<MetricsRecorder>,
}

impl Store {
    /// Open (or create) the database described by `config` and ensure the
    /// schema exists.
    pub fn open(config: &StoreConfig) -> Result<Self, LedgerError> {
        Self::open_with_metrics(config, Arc::new(MetricsRecorder::new()))
    }

    /// Open an in-memory database (for testing and demos).
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::open(&StoreConfig::default())
    }

    #[instrument(skip_all, fields(path = ?config.path))]
    pub fn open_with_metrics(
        config: &StoreConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self, LedgerError> {
        let manager = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| LedgerError::persistence("create dir", e))?;
                }
                SqliteConnectionManager::file(path)
            }
            None => SqliteConnectionManager::memory(),
        };

        let busy_timeout = config.busy_timeout();
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(schema::PRAGMAS)
        });

        let mut builder = r2d2::Pool::builder()
            .max_size(config.pool_size())
            .connection_timeout(config.connection_timeout());
        if config.is_in_memory() {
            // The database lives and dies with its only connection.
            builder = builder
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = builder
            .build(manager)
            .map_err(|e| LedgerError::persistence("open pool", e))?;

        let conn = pool
            .get()
            .map_err(|e| LedgerError::persistence("open pool", e))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| LedgerError::persistence("ensure schema", e))?;
        drop(conn);

        info!(pool_size = config.pool_size(), "ledger store opened");

        Ok(Self {
            pool,
            config: Arc::new(config.clone()),
            metrics,
        })
    }

    /// Begin a new session.
    ///
    /// Never fails directly: if the transaction cannot be started the
    /// returned session is poisoned and replays that error from every call.
    #[instrument(skip_all, fields(session_id))]
    pub fn session(&self, ctx: &Context) -> Session {
        let id = SessionId::new();
        tracing::Span::current().record("session_id", id.as_str());

        match self.begin(ctx) {
            Ok(conn) => {
                debug!("session started");
                self.metrics
                    .counter_inc("ledger_sessions_opened_total", &[("outcome", "ok")], 1);
                self.metrics.gauge_inc("ledger_sessions_active", &[], 1.0);
                Session::active(id, conn, self.metrics.clone())
            }
            Err(err) => {
                let err = LedgerError::construction(err);
                warn!(error = %err, error_kind = err.root_cause().error_kind(), "session construction failed");
                self.metrics
                    .counter_inc("ledger_sessions_opened_total", &[("outcome", "failed")], 1);
                Session::failed(id, err, self.metrics.clone())
            }
        }
    }

    fn begin(&self, ctx: &Context) -> Result<PooledConnection, LedgerError> {
        ctx.check(OP_BEGIN)?;

        let checkout_limit = self.config.connection_timeout();
        let checkout_wait = ctx.bound(checkout_limit);
        let conn = self.pool.get_timeout(checkout_wait).map_err(|e| {
            if checkout_wait < checkout_limit {
                ctx.err(OP_CHECKOUT)
                    .unwrap_or(LedgerError::DeadlineExceeded { op: OP_CHECKOUT })
            } else {
                LedgerError::persistence(OP_CHECKOUT, e)
            }
        })?;

        // Waiting for the write lock must not outlive the context either.
        let busy_limit = self.config.busy_timeout();
        let busy_wait = ctx.bound(busy_limit);
        conn.busy_timeout(busy_wait)
            .map_err(|e| LedgerError::persistence(OP_BEGIN, e))?;
        let begun = guarded(&conn, ctx, |c| c.execute_batch("BEGIN IMMEDIATE"));
        let restored = conn.busy_timeout(busy_limit);

        if let Err(e) = begun {
            return Err(if busy_wait < busy_limit && is_busy(&e) {
                ctx.err(OP_BEGIN)
                    .unwrap_or(LedgerError::DeadlineExceeded { op: OP_BEGIN })
            } else {
                classify(OP_BEGIN, e, ctx)
            });
        }
        if let Err(e) = restored {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(LedgerError::persistence(OP_BEGIN, e));
        }
        Ok(conn)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("pool", &self.pool.state())
            .finish_non_exhaustive()
    }
}
