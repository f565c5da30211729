//! On-disk session history: discovery, windowed reads, cross-file linking,
//! compaction detection, and explicit truncation.
//!
//! History files are owned by the agent CLI, not the gateway. Everything
//! here is read-only except [`resolver::HistoryResolver::truncate`], which
//! rewrites a file atomically on explicit request.

pub mod path;
pub mod resolver;
mod truncate;

pub use path::encode_project_path;
pub use path::project_history_dir;
pub use path::session_file;
pub use resolver::HistoryResolver;
