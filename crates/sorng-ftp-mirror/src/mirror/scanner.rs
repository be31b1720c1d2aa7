//! Remote tree scanner.
//!
//! FTP only offers a flat per-directory `LIST`, so the scanner rebuilds a
//! recursive file-set walk on top of it:
//!
//! 1. `CWD` into the root; a refused root yields an empty result.
//! 2. Reduce the include patterns to anchors (static prefixes) and walk
//!    only the subtrees they name, or the whole tree when a pattern starts
//!    with a wildcard.
//! 3. Resolve every anchor segment by segment against the listings,
//!    falling back to a case-insensitive name match when either the rules
//!    or the server ignore case.
//! 4. Walk each anchor with an explicit work list of absolute paths. Every
//!    listing is fetched once per scan; entries the listing cannot type
//!    (symlinks, unparseable lines) are probed with `CWD` once and cached.
//!
//! All state lives in a [`ScanSession`] owned by one `scan` call. The
//! working directory is restored before `scan` returns, on success and on
//! failure.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::selection::{path_segments, Anchors, SelectionRules};
use crate::mirror::session::{join_remote, RemoteSession};
use crate::mirror::types::{EntryKind, RemoteEntry, ScanOutcome};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::MAIN_SEPARATOR;

/// How often the same link target may repeat along one path.
const MAX_LINK_REPEATS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    IncludedFile,
    IncludedDir,
    ExcludedFile,
    ExcludedDir,
    NotIncluded,
}

/// What an entry behaves as, once probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Directory,
    File,
}

#[derive(Debug)]
struct PendingDir {
    abs: String,
    rel: String,
    /// Link targets traversed on the way here.
    links: Vec<String>,
}

/// Mutable state of one scan.
#[derive(Debug, Default)]
struct ScanSession {
    /// Listings keyed by absolute remote path.
    listings: HashMap<String, Vec<RemoteEntry>>,
    /// Probed entry kinds keyed by absolute remote path.
    kinds: HashMap<String, Resolved>,
    /// Directories already walked, keyed by relative path.
    scanned: HashSet<String>,
    /// Append-only classification keyed by relative path.
    classified: BTreeMap<String, Classification>,
    remote_case_sensitive: Option<bool>,
}

impl ScanSession {
    fn classify(&mut self, rel: &str, class: Classification) {
        match self.classified.entry(rel.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(class);
            }
            Entry::Occupied(existing) if *existing.get() != class => {
                log::debug!(
                    "{} already classified as {:?}, ignoring {:?}",
                    rel,
                    existing.get(),
                    class
                );
            }
            Entry::Occupied(_) => {}
        }
    }

    fn into_outcome(self) -> ScanOutcome {
        let mut out = ScanOutcome {
            remote_case_sensitive: self.remote_case_sensitive,
            ..ScanOutcome::default()
        };
        for (rel, class) in self.classified {
            match class {
                Classification::IncludedFile => out.included_files.push(rel),
                Classification::IncludedDir => out.included_dirs.push(rel),
                Classification::ExcludedFile => out.excluded_files.push(rel),
                Classification::ExcludedDir => out.excluded_dirs.push(rel),
                Classification::NotIncluded => out.not_included.push(rel),
            }
        }
        out
    }
}

/// Pattern-driven enumeration of a remote subtree.
#[derive(Debug, Clone)]
pub struct RemoteTreeScanner {
    rules: SelectionRules,
    follow_symlinks: bool,
}

impl RemoteTreeScanner {
    pub fn new(rules: SelectionRules) -> Self {
        Self {
            rules,
            follow_symlinks: false,
        }
    }

    pub fn following_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn rules(&self) -> &SelectionRules {
        &self.rules
    }

    /// Scan `root` (relative to the working directory, or absolute; the
    /// working directory itself when `None`).
    pub async fn scan<S>(&self, session: &mut S, root: Option<&str>) -> FtpResult<ScanOutcome>
    where
        S: RemoteSession + ?Sized,
    {
        let original = session
            .print_working_directory()
            .await
            .map_err(|e| FtpError::scan_aborted("PWD", &e))?;

        let mut state = ScanSession::default();
        let result = self.scan_from(session, &original, root, &mut state).await;

        let restored = session.change_working_directory(&original).await;
        result?;
        match restored {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "could not return to {} after scanning: {}",
                original,
                session.reply_string().trim()
            ),
            Err(e) => return Err(FtpError::scan_aborted(&format!("CWD {}", original), &e)),
        }

        let outcome = state.into_outcome();
        log::debug!(
            "remote scan of {}: {} file(s), {} dir(s) included",
            root.unwrap_or("."),
            outcome.included_files.len(),
            outcome.included_dirs.len()
        );
        Ok(outcome)
    }

    async fn scan_from<S>(
        &self,
        session: &mut S,
        original: &str,
        root: Option<&str>,
        state: &mut ScanSession,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let requested = match root {
            Some(r) => join_remote(original, r),
            None => original.to_string(),
        };
        if !self.cwd(session, &requested).await? {
            log::debug!("remote directory {} does not exist, nothing to scan", requested);
            return Ok(());
        }
        let root_abs = session
            .print_working_directory()
            .await
            .map_err(|e| FtpError::scan_aborted("PWD", &e))?;

        let anchors = match self.rules.anchors() {
            Anchors::FullTree => vec![String::new()],
            Anchors::Prefixes(prefixes) => prefixes,
        };
        for anchor in anchors {
            self.scan_anchor(session, &root_abs, &anchor, state).await?;
        }
        Ok(())
    }

    /// Resolve one anchor below the root and walk it.
    async fn scan_anchor<S>(
        &self,
        session: &mut S,
        root_abs: &str,
        anchor: &str,
        state: &mut ScanSession,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let segments = path_segments(anchor);
        let mut abs = root_abs.to_string();
        let mut rel = String::new();
        let mut links = Vec::new();

        for (i, seg) in segments.iter().enumerate() {
            let entries = self.listing(session, &abs, state).await?;
            let entry = match self.find_entry(&entries, seg, state) {
                Some(e) => e.clone(),
                None => {
                    log::debug!("anchor {} not found below {} (missing {})", anchor, root_abs, seg);
                    return Ok(());
                }
            };
            let child_abs = join_remote(&abs, &entry.name);
            let child_rel = join_rel(&rel, &entry.name);
            let last = i + 1 == segments.len();

            match self.resolve_kind(session, &entry, &child_abs, state).await? {
                Resolved::Directory => {
                    if entry.is_symlink() {
                        links.push(link_key(&abs, &entry));
                    }
                    abs = child_abs;
                    rel = child_rel;
                }
                Resolved::File if last => {
                    if !links.is_empty() && !self.follow_symlinks {
                        log::debug!("skipping {}: reached through a symbolic link", child_rel);
                        return Ok(());
                    }
                    self.classify_file(&entry, &child_rel, state);
                    return Ok(());
                }
                Resolved::File => {
                    log::debug!("anchor {} runs through file {}", anchor, child_rel);
                    return Ok(());
                }
            }
        }

        if !links.is_empty() && !self.follow_symlinks {
            log::debug!("skipping anchor {}: it passes through a symbolic link", anchor);
            return Ok(());
        }

        if !rel.is_empty() && self.rules.is_included(&rel) {
            state.classify(&rel, self.selected_dir(&rel));
            if !self.rules.could_hold_included(&rel) {
                return Ok(());
            }
        }
        self.walk(session, PendingDir { abs, rel, links }, state).await
    }

    async fn walk<S>(&self, session: &mut S, start: PendingDir, state: &mut ScanSession) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            if !state.scanned.insert(dir.rel.clone()) {
                continue;
            }
            let entries = self.listing(session, &dir.abs, state).await?;

            for entry in &entries {
                let abs = join_remote(&dir.abs, &entry.name);
                let rel = join_rel(&dir.rel, &entry.name);

                match self.resolve_kind(session, entry, &abs, state).await? {
                    Resolved::File => self.classify_file(entry, &rel, state),
                    Resolved::Directory => {
                        let mut links = dir.links.clone();
                        if entry.is_symlink() {
                            if !self.follow_symlinks {
                                state.classify(&rel, Classification::ExcludedDir);
                                continue;
                            }
                            let target = link_key(&dir.abs, entry);
                            if links.iter().filter(|t| **t == target).count() >= MAX_LINK_REPEATS {
                                log::debug!("not descending into {}: symbolic link loop", rel);
                                continue;
                            }
                            links.push(target);
                        }

                        let class = if self.rules.is_included(&rel) {
                            self.selected_dir(&rel)
                        } else {
                            Classification::NotIncluded
                        };
                        state.classify(&rel, class);
                        if self.rules.could_hold_included(&rel) {
                            pending.push(PendingDir { abs, rel, links });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn selected_dir(&self, rel: &str) -> Classification {
        if self.rules.is_excluded(rel) {
            Classification::ExcludedDir
        } else {
            Classification::IncludedDir
        }
    }

    fn classify_file(&self, entry: &RemoteEntry, rel: &str, state: &mut ScanSession) {
        let class = if entry.is_symlink() && !self.follow_symlinks {
            Classification::ExcludedFile
        } else if !self.rules.is_included(rel) {
            Classification::NotIncluded
        } else if self.rules.is_excluded(rel) {
            Classification::ExcludedFile
        } else {
            Classification::IncludedFile
        };
        state.classify(rel, class);
    }

    /// Entry named `name`: exact match first, then ignoring case when the
    /// rules or the server do.
    fn find_entry<'e>(
        &self,
        entries: &'e [RemoteEntry],
        name: &str,
        state: &ScanSession,
    ) -> Option<&'e RemoteEntry> {
        if let Some(e) = entries.iter().find(|e| e.name == name) {
            return Some(e);
        }
        if !self.rules.case_sensitive() || state.remote_case_sensitive == Some(false) {
            let lower = name.to_lowercase();
            return entries.iter().find(|e| e.name.to_lowercase() == lower);
        }
        None
    }

    async fn resolve_kind<S>(
        &self,
        session: &mut S,
        entry: &RemoteEntry,
        abs: &str,
        state: &mut ScanSession,
    ) -> FtpResult<Resolved>
    where
        S: RemoteSession + ?Sized,
    {
        match entry.kind {
            EntryKind::Directory => Ok(Resolved::Directory),
            EntryKind::File => Ok(Resolved::File),
            EntryKind::Symlink | EntryKind::Unknown => {
                if let Some(kind) = state.kinds.get(abs) {
                    return Ok(*kind);
                }
                let kind = if self.cwd(session, abs).await? {
                    Resolved::Directory
                } else {
                    Resolved::File
                };
                log::trace!("probed {} as {:?}", abs, kind);
                state.kinds.insert(abs.to_string(), kind);
                Ok(kind)
            }
        }
    }

    /// Cached listing of an absolute directory; unreachable means empty.
    async fn listing<S>(
        &self,
        session: &mut S,
        abs: &str,
        state: &mut ScanSession,
    ) -> FtpResult<Vec<RemoteEntry>>
    where
        S: RemoteSession + ?Sized,
    {
        if let Some(cached) = state.listings.get(abs) {
            return Ok(cached.clone());
        }

        let entries: Vec<RemoteEntry> = if self.cwd(session, abs).await? {
            session
                .list_files(None)
                .await
                .map_err(|e| FtpError::scan_aborted(&format!("LIST {}", abs), &e))?
                .into_iter()
                .filter(|e| is_child_entry(e, abs))
                .collect()
        } else {
            log::debug!("{} is not reachable, treating it as empty", abs);
            Vec::new()
        };
        state.listings.insert(abs.to_string(), entries.clone());

        if state.remote_case_sensitive.is_none() {
            self.detect_case_sensitivity(session, abs, &entries, state)
                .await?;
        }
        Ok(entries)
    }

    /// Flip the case of a real directory name and try to enter it.
    async fn detect_case_sensitivity<S>(
        &self,
        session: &mut S,
        dir_abs: &str,
        entries: &[RemoteEntry],
        state: &mut ScanSession,
    ) -> FtpResult<()>
    where
        S: RemoteSession + ?Sized,
    {
        let mut candidate = None;
        for e in entries.iter().filter(|e| e.is_directory()) {
            let flipped = flip_case(&e.name);
            if flipped == e.name {
                continue;
            }
            if entries.iter().any(|o| o.name == flipped) {
                // Two names differing only by case.
                state.remote_case_sensitive = Some(true);
                return Ok(());
            }
            candidate = Some(flipped);
            break;
        }
        let flipped = match candidate {
            Some(f) => f,
            None => return Ok(()),
        };

        let insensitive = self.cwd(session, &join_remote(dir_abs, &flipped)).await?;
        log::debug!(
            "remote file system is case-{}",
            if insensitive { "insensitive" } else { "sensitive" }
        );
        state.remote_case_sensitive = Some(!insensitive);
        Ok(())
    }

    async fn cwd<S>(&self, session: &mut S, abs: &str) -> FtpResult<bool>
    where
        S: RemoteSession + ?Sized,
    {
        session
            .change_working_directory(abs)
            .await
            .map_err(|e| FtpError::scan_aborted(&format!("CWD {}", abs), &e))
    }
}

/// Scan a remote subtree and return `(included dirs, included files)`.
pub async fn scan<S>(
    session: &mut S,
    root: Option<&str>,
    includes: &[String],
    excludes: &[String],
    case_sensitive: bool,
    follow_symlinks: bool,
) -> FtpResult<(Vec<String>, Vec<String>)>
where
    S: RemoteSession + ?Sized,
{
    let rules = SelectionRules::new(includes, excludes, case_sensitive)?;
    let outcome = RemoteTreeScanner::new(rules)
        .following_symlinks(follow_symlinks)
        .scan(session, root)
        .await?;
    Ok((outcome.included_dirs, outcome.included_files))
}

/// Only plain names of real children are walked; anything else could
/// resolve back into `dir` and never terminate.
fn is_child_entry(entry: &RemoteEntry, dir: &str) -> bool {
    if entry.is_self_reference() || entry.name.is_empty() || entry.name.contains(['/', '\\']) {
        log::debug!("ignoring listing entry {:?} in {}", entry.name, dir);
        return false;
    }
    true
}

fn join_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", rel, MAIN_SEPARATOR, name)
    }
}

/// Identity of a link for loop detection: its resolved target, or its
/// name when the listing does not say where it points.
fn link_key(parent_abs: &str, entry: &RemoteEntry) -> String {
    match entry.link_target.as_deref() {
        Some(target) => join_remote(parent_abs, target),
        None => entry.name.clone(),
    }
}

fn flip_case(name: &str) -> String {
    name.chars()
        .flat_map(|c| {
            if c.is_uppercase() {
                c.to_lowercase().collect::<Vec<_>>()
            } else {
                c.to_uppercase().collect::<Vec<_>>()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::memory::MemoryRemote;
    use chrono::Utc;

    fn rules(includes: &[&str]) -> SelectionRules {
        let inc: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        SelectionRules::new(&inc, &[], true).unwrap()
    }

    fn remote() -> MemoryRemote {
        let now = Utc::now();
        let mut r = MemoryRemote::new();
        r.add_file("/home/rootFile", b"1", now)
            .add_file("/home/rootDir/subFile", b"2", now)
            .add_file("/home/rootDir/deep/leaf.txt", b"3", now)
            .add_file("/home/other/x.txt", b"4", now)
            .set_cwd("/home");
        r
    }

    #[test]
    fn flip_case_swaps_letters_only() {
        assert_eq!(flip_case("rootDir-2"), "ROOTdIR-2");
        assert_eq!(flip_case("123"), "123");
    }

    #[test]
    fn classification_is_append_only() {
        let mut state = ScanSession::default();
        state.classify("a", Classification::NotIncluded);
        state.classify("a", Classification::IncludedDir);
        let out = state.into_outcome();
        assert_eq!(out.not_included, vec!["a"]);
        assert!(out.included_dirs.is_empty());
    }

    #[tokio::test]
    async fn working_directory_is_restored() {
        let mut r = remote();
        RemoteTreeScanner::new(rules(&["**"]))
            .scan(&mut r, Some("rootDir"))
            .await
            .unwrap();
        assert_eq!(r.cwd(), "/home");
    }

    #[tokio::test]
    async fn working_directory_is_restored_after_abort() {
        let mut r = remote();
        r.fail_command("LIST", 1);
        let err = RemoteTreeScanner::new(rules(&["**"]))
            .scan(&mut r, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::mirror::error::FtpErrorKind::ScanAborted);
        assert!(err.message.contains("LIST /home"));
        assert_eq!(r.cwd(), "/home");
    }

    #[tokio::test]
    async fn anchors_skip_unrelated_subtrees() {
        let mut r = remote();
        let out = RemoteTreeScanner::new(rules(&["rootDir/deep/*.txt"]))
            .scan(&mut r, None)
            .await
            .unwrap();
        assert_eq!(out.included_files, vec![format!("rootDir{}deep{}leaf.txt", MAIN_SEPARATOR, MAIN_SEPARATOR)]);
        assert!(!r.commands().iter().any(|c| c == "CWD /home/other"));
    }

    #[tokio::test]
    async fn each_directory_is_listed_once() {
        let mut r = remote();
        RemoteTreeScanner::new(rules(&["rootDir/**", "rootDir/deep/**"]))
            .scan(&mut r, None)
            .await
            .unwrap();
        // /home, /home/rootDir, /home/rootDir/deep
        assert_eq!(r.count("LIST"), 3);
    }

    #[tokio::test]
    async fn literal_anchor_naming_a_file() {
        let mut r = remote();
        let out = RemoteTreeScanner::new(rules(&["rootFile"]))
            .scan(&mut r, None)
            .await
            .unwrap();
        assert_eq!(out.included_files, vec!["rootFile"]);
        assert!(out.included_dirs.is_empty());
    }

    /// Adds MLSD-style `cdir`/`pdir` entries and a separator-bearing name
    /// to every listing, the way some servers report them.
    struct SelfListing {
        inner: MemoryRemote,
    }

    #[async_trait::async_trait]
    impl RemoteSession for SelfListing {
        async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool> {
            self.inner.change_working_directory(path).await
        }
        async fn print_working_directory(&mut self) -> FtpResult<String> {
            self.inner.print_working_directory().await
        }
        async fn list_files(&mut self, path: Option<&str>) -> FtpResult<Vec<RemoteEntry>> {
            let mut entries = self.inner.list_files(path).await?;
            let cwd = self.inner.cwd().to_string();
            let mut cdir = RemoteEntry::directory(cwd.clone());
            cdir.facts.insert("type".into(), "cdir".into());
            let mut pdir = RemoteEntry::directory(join_remote(&cwd, ".."));
            pdir.facts.insert("type".into(), "pdir".into());
            entries.push(cdir);
            entries.push(pdir);
            entries.push(RemoteEntry::directory(cwd.trim_start_matches('/').to_string() + "/again"));
            Ok(entries)
        }
        async fn make_directory(&mut self, path: &str) -> FtpResult<bool> {
            self.inner.make_directory(path).await
        }
        async fn remove_directory(&mut self, path: &str) -> FtpResult<bool> {
            self.inner.remove_directory(path).await
        }
        async fn delete_file(&mut self, path: &str) -> FtpResult<bool> {
            self.inner.delete_file(path).await
        }
        async fn store_file(&mut self, remote: &str, local: &std::path::Path) -> FtpResult<bool> {
            self.inner.store_file(remote, local).await
        }
        async fn retrieve_file(&mut self, remote: &str, local: &std::path::Path) -> FtpResult<bool> {
            self.inner.retrieve_file(remote, local).await
        }
        async fn send_site_command(&mut self, args: &str) -> FtpResult<bool> {
            self.inner.send_site_command(args).await
        }
        fn reply_code(&self) -> u16 {
            self.inner.reply_code()
        }
        fn reply_string(&self) -> String {
            self.inner.reply_string()
        }
    }

    #[tokio::test]
    async fn self_referencing_entries_are_not_walked() {
        let mut r = SelfListing { inner: remote() };
        let out = RemoteTreeScanner::new(rules(&["**"]))
            .scan(&mut r, None)
            .await
            .unwrap();
        assert_eq!(out.included_dirs, vec!["other".to_string(), "rootDir".into(), format!("rootDir{}deep", MAIN_SEPARATOR)]);
        assert_eq!(out.included_files.len(), 4);
        // /home, /home/other, /home/rootDir, /home/rootDir/deep
        assert_eq!(r.inner.count("LIST"), 4);
    }

    #[tokio::test]
    async fn case_probe_detects_sensitive_server() {
        let mut r = remote();
        let out = RemoteTreeScanner::new(rules(&["**"]))
            .scan(&mut r, None)
            .await
            .unwrap();
        assert_eq!(out.remote_case_sensitive, Some(true));

        let mut loose = remote().case_insensitive();
        let out = RemoteTreeScanner::new(rules(&["**"]))
            .scan(&mut loose, None)
            .await
            .unwrap();
        assert_eq!(out.remote_case_sensitive, Some(false));
    }
}
