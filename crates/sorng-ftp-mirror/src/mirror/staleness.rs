//! Local/remote timestamp comparison.
//!
//! `adjusted remote = listed remote + skew + granularity`. A checker can
//! only be built from a [`SkewEstimate`], so comparisons never run before
//! the skew is known.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::local;
use crate::mirror::session::{remote_name, RemoteSession};
use crate::mirror::skew::SkewEstimate;
use crate::mirror::types::Granularity;
use std::path::Path;

/// Local and adjusted remote timestamps, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPair {
    pub local_millis: i64,
    pub adjusted_remote_millis: i64,
}

impl TimestampPair {
    /// `local < adjusted remote`.
    pub fn is_remote_older(&self) -> bool {
        self.local_millis < self.adjusted_remote_millis
    }

    /// `adjusted remote < local`.
    pub fn is_local_older(&self) -> bool {
        self.adjusted_remote_millis < self.local_millis
    }

    /// The remote copy needs no upload.
    pub fn remote_up_to_date(&self) -> bool {
        self.adjusted_remote_millis >= self.local_millis
    }

    /// The local copy needs no download.
    pub fn local_up_to_date(&self) -> bool {
        self.local_millis >= self.adjusted_remote_millis
    }
}

/// Result of dating one remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Compared(TimestampPair),
    /// The listing came back empty.
    RemoteAbsent,
    /// The server listed the path without a usable timestamp.
    RemoteUndated,
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessChecker {
    skew: SkewEstimate,
}

impl StalenessChecker {
    pub fn new(skew: SkewEstimate) -> Self {
        Self { skew }
    }

    pub fn skew(&self) -> SkewEstimate {
        self.skew
    }

    /// Pair the local file's time with the adjusted remote time.
    pub fn compare(
        &self,
        local_millis: i64,
        remote_millis: i64,
        granularity: Granularity,
    ) -> TimestampPair {
        TimestampPair {
            local_millis,
            adjusted_remote_millis: remote_millis + self.skew.offset_millis() + granularity.millis(),
        }
    }

    /// List `remote_path` and compare it with `local_file` (a missing
    /// local file counts as the epoch).
    pub async fn check<S>(
        &self,
        session: &mut S,
        local_file: &Path,
        remote_path: &str,
        granularity: Granularity,
    ) -> FtpResult<Staleness>
    where
        S: RemoteSession + ?Sized,
    {
        let listing = session.list_files(Some(remote_path)).await?;
        let name = remote_name(remote_path);
        // A directory lists its contents, none of which is the path itself.
        let entry = match listing.iter().find(|e| e.name == name || e.name == remote_path) {
            Some(e) => e,
            None => return Ok(Staleness::RemoteAbsent),
        };
        let remote = match entry.modified {
            Some(t) => t,
            None => return Ok(Staleness::RemoteUndated),
        };

        let local_millis = local::modified_time(local_file).timestamp_millis();
        let pair = self.compare(local_millis, remote.timestamp_millis(), granularity);
        log::trace!(
            "{}: local {} / adjusted remote {}",
            remote_path,
            pair.local_millis,
            pair.adjusted_remote_millis
        );
        Ok(Staleness::Compared(pair))
    }

    /// Fails when the remote path cannot be dated.
    pub async fn is_remote_older<S>(
        &self,
        session: &mut S,
        local_file: &Path,
        remote_path: &str,
        granularity: Granularity,
    ) -> FtpResult<bool>
    where
        S: RemoteSession + ?Sized,
    {
        let pair = self.dated(session, local_file, remote_path, granularity).await?;
        Ok(pair.is_remote_older())
    }

    /// Fails when the remote path cannot be dated.
    pub async fn is_local_older<S>(
        &self,
        session: &mut S,
        local_file: &Path,
        remote_path: &str,
        granularity: Granularity,
    ) -> FtpResult<bool>
    where
        S: RemoteSession + ?Sized,
    {
        let pair = self.dated(session, local_file, remote_path, granularity).await?;
        Ok(pair.is_local_older())
    }

    async fn dated<S>(
        &self,
        session: &mut S,
        local_file: &Path,
        remote_path: &str,
        granularity: Granularity,
    ) -> FtpResult<TimestampPair>
    where
        S: RemoteSession + ?Sized,
    {
        match self.check(session, local_file, remote_path, granularity).await? {
            Staleness::Compared(pair) => Ok(pair),
            Staleness::RemoteAbsent | Staleness::RemoteUndated => Err(FtpError::not_found(format!(
                "could not date test remote file {}: {}",
                remote_path,
                session.reply_string().trim()
            ))
            .with_code(session.reply_code())),
        }
    }
}
