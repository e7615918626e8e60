//! Mail, analysis, and task collaborators.

pub mod http;
pub mod provider;
pub mod types;

pub use http::HttpGateway;
pub use provider::{AnalysisService, MailProvider, TaskSink};
pub use types::{Category, Classification, ClassifiedEmail, Email, Priority, TaskRecord};
