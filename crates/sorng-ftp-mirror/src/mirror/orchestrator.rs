//! Drives planned candidates through the per-file actions.
//!
//! Each candidate is handled as one retryable unit (staleness check,
//! parent creation and the transfer itself). Refusals by the server are
//! fatal unless `skipFailedTransfers` is set, in which case they are
//! logged and counted as skipped.

use crate::mirror::error::{FtpError, FtpErrorKind, FtpResult};
use crate::mirror::local;
use crate::mirror::retry::{retrying, RetryExecutor};
use crate::mirror::selection::path_segments;
use crate::mirror::session::{join_remote, remote_name, remote_parent, RemoteSession};
use crate::mirror::staleness::{Staleness, StalenessChecker};
use crate::mirror::types::{Granularity, MirrorAction, MirrorConfig, TransferCandidate, TransferSummary};
use std::cmp::Reverse;
use std::collections::HashSet;
use tokio::io::AsyncWriteExt;

/// `MKD` reply codes that mean the directory is already there (or cannot
/// be told apart from that).
const NONCRITICAL_MKDIR_CODES: [u16; 3] = [521, 550, 553];

pub struct TransferOrchestrator<'c> {
    config: &'c MirrorConfig,
    retry: RetryExecutor,
    staleness: Option<StalenessChecker>,
    granularity: Granularity,
    remote_base: String,
    /// Remote directories known to exist during this session.
    confirmed_dirs: HashSet<String>,
    listing: Option<tokio::fs::File>,
    summary: TransferSummary,
}

impl<'c> TransferOrchestrator<'c> {
    /// `remote_base` is the absolute directory candidates are relative to.
    pub fn new(config: &'c MirrorConfig, remote_base: impl Into<String>) -> Self {
        let remote_base = remote_base.into();
        let mut confirmed_dirs = HashSet::new();
        confirmed_dirs.insert(remote_base.clone());
        Self {
            config,
            retry: RetryExecutor::new(config.retry_policy()),
            staleness: None,
            granularity: config.effective_granularity(),
            remote_base,
            confirmed_dirs,
            listing: None,
            summary: TransferSummary::default(),
        }
    }

    /// Enable up-to-date checks.
    pub fn with_staleness(mut self, checker: StalenessChecker) -> Self {
        self.staleness = Some(checker);
        self
    }

    pub fn summary(&self) -> TransferSummary {
        self.summary
    }

    /// Apply the configured action to every candidate.
    pub async fn run<S>(
        &mut self,
        session: &mut S,
        mut candidates: Vec<TransferCandidate>,
    ) -> FtpResult<TransferSummary>
    where
        S: RemoteSession + ?Sized,
    {
        let action = self.config.action;
        if candidates.is_empty() {
            log::info!("no {} to {}", action.target_noun(), action.verb());
            return Ok(self.summary);
        }
        if action.targets_directories() {
            deepest_first(&mut candidates);
        }
        if action == MirrorAction::List {
            self.open_listing().await?;
        }

        log::info!("{} {} to {}", candidates.len(), action.target_noun(), action.verb());
        for candidate in &candidates {
            let description = format!("{} {}", action.verb(), candidate.remote_relative());
            let retry = self.retry;
            retrying!(retry, &description, self.apply(session, candidate).await);
        }

        if let Some(file) = self.listing.as_mut() {
            file.flush().await?;
        }
        self.log_summary();
        Ok(self.summary)
    }

    fn log_summary(&self) {
        let action = self.config.action;
        log::info!(
            "{} {} {}",
            self.summary.transferred,
            action.target_noun(),
            action.past_tense()
        );
        if self.summary.skipped > 0 {
            log::info!(
                "{} {} were not successfully {}",
                self.summary.skipped,
                action.target_noun(),
                action.past_tense()
            );
        }
    }

    async fn apply<S>(&mut self, session: &mut S, candidate: &TransferCandidate) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let remote = join_remote(&self.remote_base, &candidate.remote_relative());
        match self.config.action {
            MirrorAction::Send => self.send_file(session, candidate, &remote).await,
            MirrorAction::Get => self.get_file(session, candidate, &remote).await,
            MirrorAction::Delete => {
                let ok = session.delete_file(&remote).await?;
                self.settle(session, ok, "could not delete file", candidate)
            }
            MirrorAction::Rmdir => {
                let ok = session.remove_directory(&remote).await?;
                self.settle(session, ok, "could not remove directory", candidate)
            }
            MirrorAction::Chmod => {
                let mode = self.config.chmod.as_deref().unwrap_or_default();
                let ok = session
                    .send_site_command(&format!("CHMOD {} {}", mode, remote))
                    .await?;
                self.settle(session, ok, "could not change mode of", candidate)
            }
            MirrorAction::List => self.list_file(session, candidate, &remote).await,
            MirrorAction::Mkdir | MirrorAction::Site => Err(FtpError::invalid_config(format!(
                "the {} action does not take file sets",
                self.config.action.verb()
            ))),
        }
    }

    async fn send_file<S>(
        &mut self,
        session: &mut S,
        candidate: &TransferCandidate,
        remote: &str,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let local = candidate.local_path();
        if let Some(checker) = self.staleness {
            match checker.check(session, &local, remote, self.granularity).await? {
                Staleness::Compared(pair) if pair.remote_up_to_date() => {
                    log::debug!("{} is up to date", candidate.remote_relative());
                    return Ok(());
                }
                Staleness::Compared(_) => {}
                Staleness::RemoteAbsent | Staleness::RemoteUndated => {
                    log::debug!(
                        "could not date test remote file {}, assuming out of date",
                        candidate.remote_relative()
                    );
                }
            }
        }

        self.create_parents(session, remote).await?;
        log::info!("transferring {}", local.display());
        let ok = session.store_file(remote, &local).await?;
        if !ok {
            return self.settle(session, false, "could not put file", candidate);
        }

        if let Some(mode) = self.config.chmod.as_deref() {
            if !session
                .send_site_command(&format!("CHMOD {} {}", mode, remote))
                .await?
            {
                log::warn!(
                    "could not change mode of {}: {}",
                    remote,
                    session.reply_string().trim()
                );
            }
        }
        self.summary.transferred += 1;
        Ok(())
    }

    async fn get_file<S>(
        &mut self,
        session: &mut S,
        candidate: &TransferCandidate,
        remote: &str,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let local = candidate.local_path();
        if let Some(checker) = self.staleness {
            match checker.check(session, &local, remote, self.granularity).await? {
                Staleness::Compared(pair) if pair.local_up_to_date() => {
                    log::debug!("{} is up to date", candidate.remote_relative());
                    return Ok(());
                }
                Staleness::Compared(_) => {}
                Staleness::RemoteAbsent | Staleness::RemoteUndated => {
                    return Err(FtpError::new(
                        FtpErrorKind::NotFound,
                        format!(
                            "could not date test remote file {}: {}",
                            remote,
                            session.reply_string().trim()
                        ),
                    )
                    .with_code(session.reply_code()));
                }
            }
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        log::info!("transferring {} to {}", remote, local.display());
        if !session.retrieve_file(remote, &local).await? {
            return self.settle(session, false, "could not get file", candidate);
        }

        if self.config.preserve_last_modified {
            let listed = session.list_files(Some(remote)).await?;
            let name = remote_name(remote);
            if let Some(when) = listed.iter().find(|e| e.name == name).and_then(|e| e.modified) {
                local::set_modified_time(&local, when)?;
            }
        }
        self.summary.transferred += 1;
        Ok(())
    }

    async fn list_file<S>(
        &mut self,
        session: &mut S,
        candidate: &TransferCandidate,
        remote: &str,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let entries = session.list_files(Some(remote)).await?;
        if entries.is_empty() {
            return self.settle(session, false, "could not list file", candidate);
        }
        if let Some(file) = self.listing.as_mut() {
            for entry in &entries {
                file.write_all(format!("{}\n", entry.listing_line()).as_bytes())
                    .await?;
            }
        }
        self.summary.transferred += 1;
        Ok(())
    }

    async fn open_listing(&mut self) -> FtpResult<()> {
        let path = self
            .config
            .listing
            .as_ref()
            .ok_or_else(|| FtpError::invalid_config("the list action requires a listing output file"))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.listing = Some(tokio::fs::File::create(path).await?);
        Ok(())
    }

    /// Count a successful step, or handle a refusal per `skipFailedTransfers`.
    fn settle<S>(
        &mut self,
        session: &S,
        ok: bool,
        what: &str,
        candidate: &TransferCandidate,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        if ok {
            self.summary.transferred += 1;
            return Ok(());
        }
        let message = format!(
            "{} {}: {}",
            what,
            candidate.remote_relative(),
            session.reply_string().trim()
        );
        if self.config.skip_failed_transfers {
            log::warn!("{}", message);
            self.summary.skipped += 1;
            Ok(())
        } else {
            Err(FtpError::command_rejected(session.reply_code(), message))
        }
    }

    /// Create every missing directory between the confirmed part of the
    /// tree and `remote_file`'s parent.
    async fn create_parents<S>(&mut self, session: &mut S, remote_file: &str) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let mut missing = Vec::new();
        let mut dir = remote_parent(remote_file);
        loop {
            if dir == "/" || self.confirmed_dirs.contains(&dir) {
                break;
            }
            if session.change_working_directory(&dir).await? {
                self.confirmed_dirs.insert(dir);
                break;
            }
            let parent = remote_parent(&dir);
            missing.push(dir);
            dir = parent;
        }

        for dir in missing.into_iter().rev() {
            log::debug!("creating remote directory {}", dir);
            if !session.make_directory(&dir).await? {
                check_mkdir_refusal(session, &dir, self.config.ignore_noncritical_errors)?;
            }
            self.confirmed_dirs.insert(dir);
        }
        Ok(())
    }

    /// Create `path` and each missing ancestor (the `mkdir` action).
    pub async fn make_remote_dir<S>(&mut self, session: &mut S, path: &str) -> FtpResult<TransferSummary>
    where
        S: RemoteSession + ?Sized,
    {
        let start = session.print_working_directory().await?;
        let target = join_remote(&start, path);
        let mut current = String::new();
        for seg in target.split('/').filter(|s| !s.is_empty()) {
            current = format!("{}/{}", current, seg);
            let description = format!("make directory {}", current);
            let retry = self.retry;
            let exists = retrying!(retry, &description, session.change_working_directory(&current).await);
            if exists {
                continue;
            }
            let created = retrying!(retry, &description, session.make_directory(&current).await);
            if created {
                log::info!("created remote directory {}", current);
                self.summary.transferred += 1;
            } else {
                check_mkdir_refusal(session, &current, self.config.ignore_noncritical_errors)?;
            }
        }
        if !session.change_working_directory(&start).await? {
            log::warn!("could not return to {}", start);
        }
        Ok(self.summary)
    }
}

/// Order directories so every child precedes its parent, whatever order
/// the file sets produced them in.
fn deepest_first(candidates: &mut [TransferCandidate]) {
    candidates.sort_by_cached_key(|c| {
        let rel = c.remote_relative();
        (Reverse(path_segments(&rel).len()), Reverse(rel))
    });
}

/// A refused `MKD` is fatal unless it is a known "already exists" reply
/// and noncritical errors are ignored.
pub(crate) fn check_mkdir_refusal<S>(session: &S, dir: &str, ignore_noncritical: bool) -> FtpResult<()>
where
    S: RemoteSession + ?Sized,
{
    let code = session.reply_code();
    if ignore_noncritical && NONCRITICAL_MKDIR_CODES.contains(&code) {
        log::debug!(
            "ignoring failure to create {}: {}",
            dir,
            session.reply_string().trim()
        );
        return Ok(());
    }
    Err(FtpError::command_rejected(
        code,
        format!(
            "could not create directory {}: {}",
            dir,
            session.reply_string().trim()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::memory::MemoryRemote;
    use crate::mirror::skew::SkewEstimate;
    use crate::mirror::types::{FileSet, FtpConnectionConfig};
    use chrono::{Duration, Utc};
    use std::path::Path;

    fn config(action: MirrorAction, dir: &Path) -> MirrorConfig {
        let conn = FtpConnectionConfig {
            host: "memory".into(),
            ..FtpConnectionConfig::default()
        };
        let mut cfg = MirrorConfig::new(conn, action);
        cfg.file_sets.push(FileSet::new(dir));
        cfg
    }

    fn candidate(dir: &Path, rel: &str) -> TransferCandidate {
        TransferCandidate::new(dir, rel)
    }

    #[tokio::test]
    async fn rmdir_removes_children_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_dir("/srv/a/b");
        let cfg = config(MirrorAction::Rmdir, dir.path());
        let summary = TransferOrchestrator::new(&cfg, "/srv")
            .run(&mut remote, vec![candidate(dir.path(), "a"), candidate(dir.path(), "a/b")])
            .await
            .unwrap();
        assert_eq!(summary.transferred, 2);
        let rmd: Vec<_> = remote.commands().iter().filter(|c| c.starts_with("RMD")).collect();
        assert_eq!(rmd, vec!["RMD /srv/a/b", "RMD /srv/a"]);
    }

    #[tokio::test]
    async fn rmdir_order_ignores_plan_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_dir("/srv/a/b").add_dir("/srv/c");
        let cfg = config(MirrorAction::Rmdir, dir.path());
        let plan = vec![
            candidate(dir.path(), "a/b"),
            candidate(dir.path(), "c"),
            candidate(dir.path(), "a"),
        ];
        let summary = TransferOrchestrator::new(&cfg, "/srv")
            .run(&mut remote, plan)
            .await
            .unwrap();
        assert_eq!(summary.transferred, 3);
        let rmd: Vec<_> = remote.commands().iter().filter(|c| c.starts_with("RMD")).collect();
        assert_eq!(rmd, vec!["RMD /srv/a/b", "RMD /srv/c", "RMD /srv/a"]);
    }

    #[tokio::test]
    async fn empty_plan_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new();
        let cfg = config(MirrorAction::Delete, dir.path());
        let summary = TransferOrchestrator::new(&cfg, "/")
            .run(&mut remote, Vec::new())
            .await
            .unwrap();
        assert_eq!(summary, TransferSummary::default());
        assert!(remote.commands().is_empty());
    }

    #[tokio::test]
    async fn send_creates_parents_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("x/y")).unwrap();
        std::fs::write(dir.path().join("x/y/1.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("x/y/2.txt"), b"2").unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_dir("/site");
        let cfg = config(MirrorAction::Send, dir.path());
        let summary = TransferOrchestrator::new(&cfg, "/site")
            .run(
                &mut remote,
                vec![candidate(dir.path(), "x/y/1.txt"), candidate(dir.path(), "x/y/2.txt")],
            )
            .await
            .unwrap();
        assert_eq!(summary.transferred, 2);
        assert_eq!(remote.count("MKD"), 2);
        assert_eq!(remote.file_data("/site/x/y/2.txt"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn refused_transfers_are_skipped_when_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_file("/srv/keep.txt", b"k", Utc::now());
        let mut cfg = config(MirrorAction::Delete, dir.path());
        let plan = vec![candidate(dir.path(), "missing.txt"), candidate(dir.path(), "keep.txt")];

        let err = TransferOrchestrator::new(&cfg, "/srv")
            .run(&mut remote.clone(), plan.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(550));
        assert!(err.message.contains("missing.txt"));

        cfg.skip_failed_transfers = true;
        let summary = TransferOrchestrator::new(&cfg, "/srv")
            .run(&mut remote, plan)
            .await
            .unwrap();
        assert_eq!(summary, TransferSummary { transferred: 1, skipped: 1 });
        assert!(!remote.exists("/srv/keep.txt"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"data").unwrap();
        let mut remote = MemoryRemote::new();
        remote.fail_command("STOR", 2);
        let mut cfg = config(MirrorAction::Send, dir.path());
        cfg.retries_allowed = 2;
        let summary = TransferOrchestrator::new(&cfg, "/")
            .run(&mut remote, vec![candidate(dir.path(), "f.bin")])
            .await
            .unwrap();
        assert_eq!(summary.transferred, 1);
        assert_eq!(remote.count("STOR"), 3);
    }

    #[tokio::test]
    async fn get_skips_up_to_date_and_fails_on_absent_remote() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("old.txt");
        std::fs::write(&local, b"local").unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_file("/old.txt", b"remote", Utc::now() - Duration::days(2));

        let mut cfg = config(MirrorAction::Get, dir.path());
        cfg.newer = true;
        cfg.skip_failed_transfers = true;
        let checker = StalenessChecker::new(SkewEstimate::default());

        let summary = TransferOrchestrator::new(&cfg, "/")
            .with_staleness(checker)
            .run(&mut remote, vec![candidate(dir.path(), "old.txt")])
            .await
            .unwrap();
        assert_eq!(summary.transferred, 0);
        assert_eq!(std::fs::read(&local).unwrap(), b"local");

        let err = TransferOrchestrator::new(&cfg, "/")
            .with_staleness(checker)
            .run(&mut remote, vec![candidate(dir.path(), "gone.txt")])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mkdir_refusals_follow_the_noncritical_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new();
        remote.add_file("/blocker", b"", Utc::now());
        let mut cfg = config(MirrorAction::Mkdir, dir.path());

        let err = TransferOrchestrator::new(&cfg, "/")
            .make_remote_dir(&mut remote, "/blocker")
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(550));

        cfg.ignore_noncritical_errors = true;
        let summary = TransferOrchestrator::new(&cfg, "/")
            .make_remote_dir(&mut remote, "/blocker")
            .await
            .unwrap();
        assert_eq!(summary.transferred, 0);

        let summary = TransferOrchestrator::new(&cfg, "/")
            .make_remote_dir(&mut remote, "/a/b/c")
            .await
            .unwrap();
        assert_eq!(summary.transferred, 3);
        assert!(remote.is_dir("/a/b/c"));
    }
}
