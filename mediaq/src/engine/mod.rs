//! Extraction engines.
//!
//! An engine performs one download attempt for a job: it reports raw
//! progress through a [`ProgressSink`], honours a cancellation token, and
//! returns the final output path. [`YtDlpEngine`] is the production engine.

pub mod format;
pub mod info;
pub mod options;
pub mod parser;
pub mod process;
pub mod traits;
pub mod ytdlp;

pub use format::{format_eta, format_speed};
pub use info::{FormatInfo, InfoCache, MediaInfo};
pub use traits::{
    EngineProgress, EngineRequest, EngineSignal, ExtractionEngine, ExtractionError, ProgressSink,
};
pub use ytdlp::{YtDlpConfig, YtDlpEngine};
