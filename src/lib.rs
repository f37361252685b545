pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod job;
pub mod payload;

pub use crate::config::VellumConfig;
pub use crate::dispatcher::Dispatcher;
pub use crate::document::{DocumentResult, LocalDocumentId};
pub use crate::error::{VellumError, VellumErrorCode};
pub use crate::job::{
    CancelToken, HandlerProgress, Job, JobKind, JobState, RequestHandler, TransportTask,
    WorkOutcome,
};
pub use crate::payload::{PayloadBuilder, Segment};
