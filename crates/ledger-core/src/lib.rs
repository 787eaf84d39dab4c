pub mod context;
pub mod errors;
pub mod ids;

pub use context::Context;
pub use errors::LedgerError;
pub use ids::SessionId;
