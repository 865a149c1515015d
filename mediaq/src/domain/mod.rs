//! Domain layer for mediaq.
//!
//! This module contains the job entity, the download request and the
//! normalized events emitted for job changes.

pub mod event;
pub mod job;
pub mod request;

pub use event::{EventType, JobEvent};
pub use job::{Job, JobStatus};
pub use request::{AudioFormat, DownloadOptions, DownloadRequest, MediaKind, SubtitleOptions};
