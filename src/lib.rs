pub mod config;
pub mod launcher;
pub mod merge;
pub mod remote;
pub mod report;
pub mod system_info;
pub mod tracer;
pub mod util;
