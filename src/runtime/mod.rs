//! Runtime core: per-thread staging buffers, the call-site registry, the
//! process-wide coordinator, and the compression worker.

pub mod registry;
pub mod staging;

pub(crate) mod coordinator;
pub(crate) mod worker;

pub use coordinator::{
    get_histograms, get_stats, log_level, log_site, metrics_snapshot, preallocate, set_log_file,
    set_log_level, staging_buffer_count, sync, SetLogFileError,
};
pub use registry::{CallSite, ParamKind, SiteEntry, UNREGISTERED_ID};
pub use staging::{StagingBuffer, StagingProducer};
