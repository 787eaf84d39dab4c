/// SQL DDL for the ledger database.
/// `STRICT` makes SQLite reject a balance that is not an integer, which is
/// what an overflowing `balance + ?` produces.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    address TEXT NOT NULL PRIMARY KEY,
    balance INTEGER NOT NULL CHECK (balance >= 0)
) STRICT;
"#;

/// Applied to every pooled connection. The busy timeout is set separately
/// from config before these run.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;
