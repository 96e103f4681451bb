#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Export orchestration core for VMGather: discovers VictoriaMetrics
//! components, batches a requested time range, streams each batch through a
//! deterministic obfuscation transform to a staging file, and packages the
//! result into a content-hashed archive. Owns job admission, progress
//! aggregation, cancellation, and resume.

pub mod archive;
pub mod clock;
pub mod discovery;
pub mod error;
pub mod job_manager;
pub mod model;
pub mod obfuscator;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod staging;
pub mod vm_client;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{GatherError, Result};
pub use job_manager::{JobManager, JobManagerOptions};
pub use model::{
    ArchiveManifest, AuthVariant, BatchSettings, BatchStrategy, BatchWindow, ExportConfig,
    ExportResult, ExportedMetric, JobRecord, JobState, ObfuscationConfig, ObfuscationMappings,
    TimeRange, VmConnection,
};
pub use obfuscator::Obfuscator;
pub use progress::{BatchProgress, NullProgressSink, ProgressSink};
pub use vm_client::VmClient;
