pub mod config;
pub mod error;
pub mod schema;
pub mod session;
pub mod store;

pub use config::StoreConfig;
pub use ledger_core::{Context, LedgerError};
pub use session::Session;
pub use store::Store;
