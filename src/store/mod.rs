//! Persistence layer: libSQL-backed storage for rules, automations, drafts,
//! agent state, and audit logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, DraftTransition};
