//! # SortOfRemote NG – FTP Mirror
//!
//! One-directional FTP mirroring engine providing:
//!   • Ant-style include/exclude selection over remote and local trees
//!   • Recursive remote scanning on top of the flat per-directory `LIST`
//!   • Case-sensitivity auto-detection and symlink cycle avoidance
//!   • Clock-skew probing and granularity-corrected staleness checks
//!   • Bounded retry of transient I/O failures
//!   • Send / get / delete / list / chmod / mkdir / rmdir / site actions

pub mod mirror;
