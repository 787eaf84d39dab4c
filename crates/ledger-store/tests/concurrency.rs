//! Multi-session behaviour against a file-backed store.

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use ledger_store::{Context, LedgerError, Store, StoreConfig};

struct TempDb {
    dir: PathBuf,
    store: Store,
}

impl TempDb {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("ledger-concurrency-{}", uuid::Uuid::now_v7()));
        let mut config = StoreConfig::file(dir.join("ledger.db"));
        config.busy_timeout_ms = 30_000;
        config.connection_timeout_ms = 30_000;
        let store = Store::open(&config).unwrap();
        Self { dir, store }
    }

    fn balance(&self, address: &str) -> u64 {
        let ctx = Context::background();
        let mut session = self.store.session(&ctx);
        let balance = session.balance(&ctx, address).unwrap();
        session.rollback().unwrap();
        balance
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn seed(store: &Store, accounts: &[(&str, u64)]) {
    let ctx = Context::background();
    let mut session = store.session(&ctx);
    for (address, balance) in accounts {
        session.create_account(&ctx, address, *balance).unwrap();
    }
    session.commit().unwrap();
}

#[test]
fn concurrent_debits_never_overdraw() {
    let db = TempDb::new();
    seed(&db.store, &[("alice", 1000), ("bob", 0)]);

    let threads = 12;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = db.store.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let ctx = Context::background();
                barrier.wait();
                let mut session = store.session(&ctx);
                match session.move_funds(&ctx, "alice", "bob", 100) {
                    Ok(()) => session.commit(),
                    Err(err) => {
                        session.rollback().unwrap();
                        Err(err)
                    }
                }
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
        .count();

    assert_eq!(ok, 10, "results: {results:?}");
    assert_eq!(insufficient, 2, "results: {results:?}");
    assert_eq!(db.balance("alice"), 0);
    assert_eq!(db.balance("bob"), 1000);
}

#[test]
fn concurrent_transfers_conserve_total() {
    let db = TempDb::new();
    seed(&db.store, &[("alice", 500), ("bob", 500)]);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = db.store.clone();
            std::thread::spawn(move || {
                let ctx = Context::background();
                let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                for _ in 0..25 {
                    let mut session = store.session(&ctx);
                    match session.move_funds(&ctx, from, to, 7) {
                        Ok(()) => session.commit().unwrap(),
                        Err(LedgerError::InsufficientFunds { .. }) => session.rollback().unwrap(),
                        Err(err) => panic!("unexpected error: {err:?}"),
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(db.balance("alice") + db.balance("bob"), 1000);
}

#[test]
fn second_writer_times_out_and_rollback_discards() {
    let db = TempDb::new();
    seed(&db.store, &[("alice", 10)]);

    let ctx = Context::background();
    let mut writer = db.store.session(&ctx);
    writer.create_account(&ctx, "carol", 5).unwrap();

    // A second writer waits for the lock and gives up at its deadline.
    let short = ctx.with_timeout(Duration::from_millis(100));
    let mut blocked = db.store.session(&short);
    assert!(!blocked.is_active());
    assert!(blocked.balance(&ctx, "carol").unwrap_err().is_cancellation());

    writer.rollback().unwrap();
    let mut reader = db.store.session(&ctx);
    assert!(matches!(
        reader.balance(&ctx, "carol"),
        Err(LedgerError::AccountNotFound { .. })
    ));
    assert_eq!(reader.balance(&ctx, "alice").unwrap(), 10);
    reader.rollback().unwrap();
}

#[test]
fn cancellation_between_statements_leaves_no_committed_change() {
    let db = TempDb::new();
    seed(&db.store, &[("alice", 10), ("bob", 0)]);

    let ctx = Context::background();
    let mut session = db.store.session(&ctx);
    session.move_funds(&ctx, "alice", "bob", 4).unwrap();

    ctx.cancel();
    assert_eq!(
        session.move_funds(&ctx, "alice", "bob", 1),
        Err(LedgerError::Cancelled {
            op: "transfer from account"
        })
    );
    session.rollback().unwrap();

    assert_eq!(db.balance("alice"), 10);
    assert_eq!(db.balance("bob"), 0);
}

#[test]
fn sessions_from_cloned_stores_share_data() {
    let db = TempDb::new();
    let clone = db.store.clone();
    seed(&clone, &[("alice", 3)]);
    assert_eq!(db.balance("alice"), 3);
    assert_eq!(clone.metrics().counter_get("ledger_accounts_created_total", &[]), 1);
}

#[test]
fn interrupted_write_cannot_leak_later_writes() {
    let db = TempDb::new();
    seed(&db.store, &[("alice", 100), ("bob", 0)]);
    {
        let conn = db.store.pool().get().unwrap();
        conn.execute_batch(
            "CREATE TABLE spin (n INTEGER);
             WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 2000)
             INSERT INTO spin SELECT x FROM c;
             CREATE TRIGGER slow_debit AFTER UPDATE ON accounts
             WHEN NEW.balance < OLD.balance
             BEGIN
                 SELECT count(*) FROM spin a, spin b, spin c;
             END;",
        )
        .unwrap();
    }

    let ctx = Context::background();
    let mut session = db.store.session(&ctx);
    session.create_account(&ctx, "carol", 7).unwrap();

    let short = ctx.with_timeout(Duration::from_millis(50));
    let err = session.move_funds(&short, "alice", "bob", 10).unwrap_err();
    assert!(err.is_cancellation(), "got: {err:?}");
    assert!(!session.is_active());

    assert!(matches!(
        session.create_account(&ctx, "dave", 1),
        Err(LedgerError::TransactionAborted(_))
    ));
    session.rollback().unwrap();

    let mut reader = db.store.session(&ctx);
    for missing in ["carol", "dave"] {
        assert!(matches!(
            reader.balance(&ctx, missing),
            Err(LedgerError::AccountNotFound { .. })
        ));
    }
    reader.rollback().unwrap();
    assert_eq!(db.balance("alice"), 100);
    assert_eq!(db.balance("bob"), 0);
}
