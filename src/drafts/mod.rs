//! Reply drafts and their approval workflow.

pub mod approval;
pub mod model;

pub use approval::DraftApprovals;
pub use model::{Draft, DraftStatus, Severity, reply_subject};
