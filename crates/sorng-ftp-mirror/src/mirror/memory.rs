//! In-memory FTP server model.
//!
//! `MemoryRemote` implements [`RemoteSession`] over a tree of directories,
//! files and symbolic links. It answers with the reply codes a typical
//! Unix server would use, can behave case-insensitively, can run its
//! clock ahead of (or behind) the local one and can inject transport
//! faults, which makes it the harness for scanner, staleness and retry
//! tests.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::session::{join_remote, RemoteSession};
use crate::mirror::types::{RemoteEntry, TimestampPrecision};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
enum Node {
    Dir(BTreeMap<String, Node>),
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
    Link(String),
}

#[derive(Debug, Clone)]
struct Fault {
    /// Command verb to fail, or `None` for any command.
    verb: Option<String>,
    remaining: u32,
}

/// In-memory [`RemoteSession`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    root: Node,
    cwd: String,
    case_insensitive: bool,
    clock_offset: Duration,
    precision: TimestampPrecision,
    faults: Vec<Fault>,
    modes: HashMap<String, String>,
    commands: Vec<String>,
    reply_code: u16,
    reply_text: String,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            root: Node::Dir(BTreeMap::new()),
            cwd: "/".to_string(),
            case_insensitive: false,
            clock_offset: Duration::zero(),
            precision: TimestampPrecision::Second,
            faults: Vec::new(),
            modes: HashMap::new(),
            commands: Vec::new(),
            reply_code: 220,
            reply_text: "220 memory server ready".to_string(),
        }
    }

    // ─── Builders ────────────────────────────────────────────────

    /// Resolve names regardless of case, like a Windows server.
    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Run the server clock `offset` ahead of the local clock.
    pub fn with_clock_offset(mut self, offset: Duration) -> Self {
        self.clock_offset = offset;
        self
    }

    /// Truncate listed timestamps to the given precision.
    pub fn with_listing_precision(mut self, precision: TimestampPrecision) -> Self {
        self.precision = precision;
        self
    }

    /// Create a directory and any missing parents.
    pub fn add_dir(&mut self, path: &str) -> &mut Self {
        let abs = join_remote("/", path);
        let mut node = &mut self.root;
        for seg in split(&abs) {
            node = match node {
                Node::Dir(children) => children
                    .entry(seg.to_string())
                    .or_insert_with(|| Node::Dir(BTreeMap::new())),
                _ => break,
            };
        }
        self
    }

    /// Create a file (and its parent directories).
    pub fn add_file(&mut self, path: &str, data: &[u8], modified: DateTime<Utc>) -> &mut Self {
        self.insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified,
            },
        )
    }

    /// Create a symbolic link pointing at `target` (absolute or relative
    /// to the link's directory).
    pub fn add_symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.insert(path, Node::Link(target.to_string()))
    }

    fn insert(&mut self, path: &str, node: Node) -> &mut Self {
        let abs = join_remote("/", path);
        let (parent, name) = match abs.rsplit_once('/') {
            Some((p, n)) if !n.is_empty() => (p.to_string(), n.to_string()),
            _ => return self,
        };
        self.add_dir(&parent);
        if let Some(Node::Dir(children)) = self.node_mut(&split(&parent)) {
            children.insert(name, node);
        }
        self
    }

    pub fn set_cwd(&mut self, path: &str) -> &mut Self {
        self.cwd = join_remote("/", path);
        self
    }

    /// Fail the next `count` commands with a dropped connection.
    pub fn fail_next(&mut self, count: u32) -> &mut Self {
        self.faults.push(Fault {
            verb: None,
            remaining: count,
        });
        self
    }

    /// Fail the next `count` commands with the given verb (`STOR`, `LIST`…).
    pub fn fail_command(&mut self, verb: &str, count: u32) -> &mut Self {
        self.faults.push(Fault {
            verb: Some(verb.to_uppercase()),
            remaining: count,
        });
        self
    }

    // ─── Inspection ──────────────────────────────────────────────

    /// Every command received, as `VERB argument`.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// How many commands with the given verb were received.
    pub fn count(&self, verb: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path, false).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lookup(path, true), Some(Node::Dir(_)))
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        match self.lookup(path, true) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn modified(&self, path: &str) -> Option<DateTime<Utc>> {
        match self.lookup(path, true) {
            Some(Node::File { modified, .. }) => Some(*modified),
            _ => None,
        }
    }

    /// Mode set through `SITE CHMOD`.
    pub fn mode(&self, path: &str) -> Option<&str> {
        self.resolve(path, false)
            .and_then(|segs| self.modes.get(&format!("/{}", segs.join("/"))))
            .map(String::as_str)
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    // ─── Tree navigation ─────────────────────────────────────────

    fn node<S: AsRef<str>>(&self, segs: &[S]) -> Option<&Node> {
        let mut node = &self.root;
        for seg in segs {
            node = match node {
                Node::Dir(children) => children.get(seg.as_ref())?,
                _ => return None,
            };
        }
        Some(node)
    }

    fn node_mut<S: AsRef<str>>(&mut self, segs: &[S]) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for seg in segs {
            node = match node {
                Node::Dir(children) => children.get_mut(seg.as_ref())?,
                _ => return None,
            };
        }
        Some(node)
    }

    fn find_child(&self, children: &BTreeMap<String, Node>, name: &str) -> Option<String> {
        if children.contains_key(name) {
            return Some(name.to_string());
        }
        if self.case_insensitive {
            let lower = name.to_lowercase();
            return children.keys().find(|k| k.to_lowercase() == lower).cloned();
        }
        None
    }

    /// Canonical segments of `path`, following links on intermediate
    /// segments and, when `follow_last` is set, on the final one.
    fn resolve(&self, path: &str, follow_last: bool) -> Option<Vec<String>> {
        let mut queue: VecDeque<String> = split(&join_remote(&self.cwd, path))
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut segs: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(seg) = queue.pop_front() {
            match seg.as_str() {
                "." | "" => continue,
                ".." => {
                    segs.pop();
                    continue;
                }
                _ => {}
            }
            let (actual, link) = match self.node(&segs)? {
                Node::Dir(children) => {
                    let actual = self.find_child(children, &seg)?;
                    let link = match children.get(&actual) {
                        Some(Node::Link(t)) => Some(t.clone()),
                        _ => None,
                    };
                    (actual, link)
                }
                _ => return None,
            };
            match link {
                Some(target) if follow_last || !queue.is_empty() => {
                    hops += 1;
                    if hops > MAX_LINK_HOPS {
                        return None;
                    }
                    if target.starts_with('/') {
                        segs.clear();
                    }
                    for part in target.split('/').rev().filter(|s| !s.is_empty()) {
                        queue.push_front(part.to_string());
                    }
                }
                _ => segs.push(actual),
            }
        }
        Some(segs)
    }

    fn lookup(&self, path: &str, follow_last: bool) -> Option<&Node> {
        let segs = self.resolve(path, follow_last)?;
        self.node(&segs)
    }

    /// Split into (canonical parent segments, leaf name) without
    /// resolving the leaf.
    fn parent_and_leaf(&self, path: &str) -> Option<(Vec<String>, String)> {
        let abs = join_remote(&self.cwd, path);
        let (parent, leaf) = abs.rsplit_once('/')?;
        if leaf.is_empty() {
            return None;
        }
        let parent = if parent.is_empty() { "/" } else { parent };
        let segs = self.resolve(parent, true)?;
        match self.node(&segs)? {
            Node::Dir(children) => {
                let leaf = self.find_child(children, leaf).unwrap_or_else(|| leaf.to_string());
                Some((segs, leaf))
            }
            _ => None,
        }
    }

    fn listed_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self.precision {
            TimestampPrecision::Second => Duration::seconds(1),
            TimestampPrecision::Minute => Duration::minutes(1),
            TimestampPrecision::Day => Duration::days(1),
        };
        t.duration_trunc(step).unwrap_or(t)
    }

    fn entry_for(&self, name: &str, node: &Node) -> RemoteEntry {
        let mut entry = match node {
            Node::Dir(_) => RemoteEntry::directory(name),
            Node::File { data, modified } => {
                RemoteEntry::file(name, data.len() as u64, Some(self.listed_time(*modified)))
            }
            Node::Link(target) => RemoteEntry::symlink(name, target.clone()),
        };
        if entry.modified.is_some() {
            entry.precision = Some(self.precision);
        }
        entry
    }

    // ─── Command bookkeeping ─────────────────────────────────────

    fn begin(&mut self, verb: &str, arg: &str) -> FtpResult<()> {
        self.commands.push(if arg.is_empty() {
            verb.to_string()
        } else {
            format!("{} {}", verb, arg)
        });
        let hit = self.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.verb.as_deref().map_or(true, |v| v == verb)
        });
        if let Some(fault) = hit {
            fault.remaining -= 1;
            self.reply(421, "Service not available, closing control connection");
            return Err(FtpError::disconnected(format!("{} {}: connection dropped", verb, arg))
                .with_code(421));
        }
        Ok(())
    }

    fn reply(&mut self, code: u16, text: &str) {
        self.reply_code = code;
        self.reply_text = format!("{} {}", code, text);
    }

    fn answer(&mut self, ok: bool, ok_code: u16, fail_code: u16, fail_text: &str) -> bool {
        if ok {
            self.reply(ok_code, "Command successful");
        } else {
            self.reply(fail_code, fail_text);
        }
        ok
    }

    fn server_now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

fn split(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[async_trait]
impl RemoteSession for MemoryRemote {
    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool> {
        self.begin("CWD", path)?;
        let target = self
            .resolve(path, true)
            .filter(|segs| matches!(self.node(segs), Some(Node::Dir(_))));
        if let Some(segs) = target.as_ref() {
            self.cwd = format!("/{}", segs.join("/"));
        }
        Ok(self.answer(target.is_some(), 250, 550, "No such file or directory"))
    }

    async fn print_working_directory(&mut self) -> FtpResult<String> {
        self.begin("PWD", "")?;
        let cwd = self.cwd.clone();
        self.reply(257, &format!("\"{}\" is the current directory", cwd));
        Ok(cwd)
    }

    async fn list_files(&mut self, path: Option<&str>) -> FtpResult<Vec<RemoteEntry>> {
        self.begin("LIST", path.unwrap_or(""))?;
        let target = path.unwrap_or(".").to_string();

        let listing = match self.resolve(&target, true) {
            Some(segs) => match self.node(&segs) {
                Some(Node::Dir(children)) => Some(
                    children
                        .iter()
                        .map(|(name, node)| self.entry_for(name, node))
                        .collect::<Vec<_>>(),
                ),
                Some(node) => {
                    let name = segs.last().cloned().unwrap_or_default();
                    Some(vec![self.entry_for(&name, node)])
                }
                None => None,
            },
            None => None,
        };

        // A dangling link still lists as itself.
        let listing = listing.or_else(|| {
            self.resolve(&target, false).and_then(|segs| match self.node(&segs) {
                Some(node) if matches!(node, Node::Link(_)) => {
                    let name = segs.last().cloned().unwrap_or_default();
                    Some(vec![self.entry_for(&name, node)])
                }
                _ => None,
            })
        });

        match listing {
            Some(entries) => {
                self.reply(226, "Transfer complete");
                Ok(entries)
            }
            None => {
                self.reply(450, "No such file or directory");
                Ok(Vec::new())
            }
        }
    }

    async fn make_directory(&mut self, path: &str) -> FtpResult<bool> {
        self.begin("MKD", path)?;
        let created = match self.parent_and_leaf(path) {
            Some((parent, leaf)) => match self.node_mut(&parent) {
                Some(Node::Dir(children)) if !children.contains_key(&leaf) => {
                    children.insert(leaf, Node::Dir(BTreeMap::new()));
                    true
                }
                _ => false,
            },
            None => false,
        };
        Ok(self.answer(created, 257, 550, "Cannot create directory: File exists"))
    }

    async fn remove_directory(&mut self, path: &str) -> FtpResult<bool> {
        self.begin("RMD", path)?;
        let removed = match self.parent_and_leaf(path) {
            Some((parent, leaf)) => match self.node_mut(&parent) {
                Some(Node::Dir(children)) => {
                    let empty_dir = matches!(children.get(&leaf), Some(Node::Dir(g)) if g.is_empty());
                    empty_dir && children.remove(&leaf).is_some()
                }
                _ => false,
            },
            None => false,
        };
        Ok(self.answer(removed, 250, 550, "Directory not empty or not found"))
    }

    async fn delete_file(&mut self, path: &str) -> FtpResult<bool> {
        self.begin("DELE", path)?;
        let deleted = match self.parent_and_leaf(path) {
            Some((parent, leaf)) => match self.node_mut(&parent) {
                Some(Node::Dir(children)) => {
                    let removable =
                        matches!(children.get(&leaf), Some(Node::File { .. }) | Some(Node::Link(_)));
                    removable && children.remove(&leaf).is_some()
                }
                _ => false,
            },
            None => false,
        };
        Ok(self.answer(deleted, 250, 550, "No such file"))
    }

    async fn store_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool> {
        self.begin("STOR", remote)?;
        let data = tokio::fs::read(local).await?;
        let modified = self.server_now();
        let stored = match self.parent_and_leaf(remote) {
            Some((parent, leaf)) => match self.node_mut(&parent) {
                Some(Node::Dir(children)) if !matches!(children.get(&leaf), Some(Node::Dir(_))) => {
                    children.insert(leaf, Node::File { data, modified });
                    true
                }
                _ => false,
            },
            None => false,
        };
        Ok(self.answer(stored, 226, 553, "Could not create file"))
    }

    async fn retrieve_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool> {
        self.begin("RETR", remote)?;
        let data = match self.lookup(remote, true) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        };
        match data {
            Some(bytes) => {
                tokio::fs::write(local, bytes).await?;
                Ok(self.answer(true, 226, 550, ""))
            }
            None => Ok(self.answer(false, 226, 550, "No such file")),
        }
    }

    async fn send_site_command(&mut self, args: &str) -> FtpResult<bool> {
        self.begin("SITE", args)?;
        let mut words = args.splitn(3, ' ');
        let ok = match words.next().map(str::to_uppercase).as_deref() {
            Some("CHMOD") => match (words.next(), words.next()) {
                (Some(mode), Some(path)) => match self.resolve(path, false) {
                    Some(segs) if self.node(&segs).is_some() => {
                        self.modes.insert(format!("/{}", segs.join("/")), mode.to_string());
                        true
                    }
                    _ => false,
                },
                _ => false,
            },
            Some(_) => true,
            None => false,
        };
        Ok(self.answer(ok, 200, 550, "SITE command failed"))
    }

    fn reply_code(&self) -> u16 {
        self.reply_code
    }

    fn reply_string(&self) -> String {
        self.reply_text.clone()
    }

    async fn quit(&mut self) -> FtpResult<()> {
        self.commands.push("QUIT".to_string());
        self.reply(221, "Goodbye");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    fn tree() -> MemoryRemote {
        let mut remote = MemoryRemote::new();
        remote
            .add_file("/rootFile", b"root", t0())
            .add_file("/rootDir/subFile", b"sub", t0())
            .add_symlink("/link", "/rootDir");
        remote
    }

    #[tokio::test]
    async fn cwd_follows_links_and_reports_failure() {
        let mut remote = tree();
        assert!(remote.change_working_directory("link").await.unwrap());
        assert_eq!(remote.cwd(), "/rootDir");
        assert!(!remote.change_working_directory("/missing").await.unwrap());
        assert_eq!(remote.reply_code(), 550);
        assert!(!remote.change_working_directory("/rootFile").await.unwrap());
    }

    #[tokio::test]
    async fn listing_of_directory_and_single_file() {
        let mut remote = tree();
        let root = remote.list_files(Some("/")).await.unwrap();
        let names: Vec<_> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["link", "rootDir", "rootFile"]);
        assert!(root[0].is_symlink());

        let file = remote.list_files(Some("/rootDir/subFile")).await.unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file[0].modified, Some(t0()));
        assert!(remote.list_files(Some("/nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn case_insensitive_resolution() {
        let mut remote = tree().case_insensitive();
        assert!(remote.change_working_directory("/ROOTDIR").await.unwrap());
        assert_eq!(remote.cwd(), "/rootDir");
        let mut strict = tree();
        assert!(!strict.change_working_directory("/ROOTDIR").await.unwrap());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let mut remote = tree();
        remote.fail_command("LIST", 2);
        assert!(remote.list_files(None).await.unwrap_err().is_transient());
        assert!(remote.list_files(None).await.is_err());
        assert!(remote.change_working_directory("/rootDir").await.unwrap());
        assert_eq!(remote.list_files(None).await.unwrap().len(), 1);
        assert_eq!(remote.count("LIST"), 3);
    }

    #[tokio::test]
    async fn mkdir_rmdir_delete() {
        let mut remote = tree();
        assert!(remote.make_directory("/new").await.unwrap());
        assert!(!remote.make_directory("/new").await.unwrap());
        assert_eq!(remote.reply_code(), 550);
        assert!(!remote.remove_directory("/rootDir").await.unwrap());
        assert!(remote.delete_file("/rootDir/subFile").await.unwrap());
        assert!(remote.remove_directory("/rootDir").await.unwrap());
        assert!(!remote.exists("/rootDir"));
    }

    #[tokio::test]
    async fn listed_time_is_truncated() {
        let mut remote = MemoryRemote::new().with_listing_precision(TimestampPrecision::Minute);
        remote.add_file("/a", b"", t0());
        let listing = remote.list_files(Some("/a")).await.unwrap();
        assert_eq!(listing[0].modified, Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 0).unwrap()));
        assert_eq!(listing[0].precision, Some(TimestampPrecision::Minute));
    }
}
