//! # sorng-ftp-mirror — FTP Mirror Engine
//!
//! Mirrors file sets between a local tree and an FTP server in one
//! direction per run:
//! - **Ant-style selection** — `*`, `**`, `?`, trailing `/`, includes and
//!   excludes with exclude precedence
//! - **Remote scanning** — recursive classification built on `CWD` + flat
//!   `LIST`, anchored at static pattern prefixes
//! - **Staleness** — clock-skew probe plus granularity-corrected
//!   timestamp comparison
//! - **Retry** — bounded re-issue of transient failures
//!
//! Architecture:
//! - `types` — configuration, listing entries, plans and summaries
//! - `error` — mirror error type
//! - `protocol` — control-channel line codec
//! - `transfer` — PASV/EPSV reply parsing and data connections
//! - `parser` — Unix/DOS/MLSD listing parser
//! - `session` — `RemoteSession` trait and remote path helpers
//! - `client` — `RemoteSession` over a live FTP connection
//! - `memory` — in-memory `RemoteSession` for tests and dry runs
//! - `selection` — include/exclude rule compilation
//! - `scanner` — remote tree scanner
//! - `local` — local tree scanner and mtime helpers
//! - `skew` — server clock offset
//! - `staleness` — up-to-date checks
//! - `retry` — retry executor
//! - `planner` — file sets to candidate list
//! - `orchestrator` — per-file actions and summary
//! - `task` — a complete mirror invocation

pub mod types;
pub mod error;
pub mod protocol;
pub mod transfer;
pub mod parser;
pub mod session;
pub mod client;
pub mod memory;
pub mod selection;
pub mod scanner;
pub mod local;
pub mod skew;
pub mod staleness;
pub mod retry;
pub mod planner;
pub mod orchestrator;
pub mod task;

pub use types::*;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use session::RemoteSession;
pub use client::FtpClient;
pub use memory::MemoryRemote;
pub use selection::SelectionRules;
pub use scanner::RemoteTreeScanner;
pub use local::LocalTreeScanner;
pub use skew::SkewEstimate;
pub use staleness::{Staleness, StalenessChecker, TimestampPair};
pub use retry::RetryExecutor;
pub use planner::TransferPlanner;
pub use orchestrator::TransferOrchestrator;
pub use task::MirrorTask;
