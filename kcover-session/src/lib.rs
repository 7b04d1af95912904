mod buffer;
mod entry;
pub mod ioctl;
mod session;

pub use buffer::CoverageBuffer;
pub use buffer::COVER_SIZE;

pub use entry::write_log;
pub use entry::LogWriteMode;
pub use entry::RawLogEntry;

pub use session::CoverageSession;
pub use session::Mode;
pub use session::RemoteHandle;
pub use session::SessionError;
pub use session::SessionState;
pub use session::KCOV_PATH;
pub use session::KCOV_SUBSYSTEM_COMMON;

/// Partial log written by the preloaded agent.
pub const LOCAL_LOG: &str = "local_coverage.log";
/// Partial log written by the tracer for its remote session.
pub const REMOTE_LOG: &str = "remote_coverage.log";
/// Final log handed to the report generator.
pub const MERGED_LOG: &str = "coverage.log";

/// Where the agent writes its log. Set by the tracer in the traced command's
/// environment only.
pub const LOCAL_LOG_ENV: &str = "KCOVER_LOCAL_LOG";
/// Log level for both the tracer and the agent.
pub const LOG_LEVEL_ENV: &str = "KCOVER_LOG";
