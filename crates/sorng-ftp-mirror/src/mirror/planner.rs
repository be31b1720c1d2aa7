//! Turns file sets into an ordered, duplicate-free candidate list.

use crate::mirror::error::FtpResult;
use crate::mirror::local::LocalTreeScanner;
use crate::mirror::scanner::RemoteTreeScanner;
use crate::mirror::selection::SelectionRules;
use crate::mirror::session::RemoteSession;
use crate::mirror::types::{FileSet, MirrorAction, ScanOutcome, TransferCandidate};
use std::collections::HashSet;

pub struct TransferPlanner<'a> {
    action: MirrorAction,
    file_sets: &'a [FileSet],
}

impl<'a> TransferPlanner<'a> {
    pub fn new(action: MirrorAction, file_sets: &'a [FileSet]) -> Self {
        Self { action, file_sets }
    }

    /// Scan every file set (locally for pushes, below `remote_root`
    /// otherwise) and collect the selected files, or directories for
    /// `rmdir`. The first file set to select a path wins.
    pub async fn plan<S>(
        &self,
        session: &mut S,
        remote_root: Option<&str>,
    ) -> FtpResult<Vec<TransferCandidate>>
    where
        S: RemoteSession + ?Sized,
    {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for set in self.file_sets {
            let rules = SelectionRules::from_file_set(set)?;
            let outcome = if self.action.scans_local() {
                LocalTreeScanner::new(rules)
                    .following_symlinks(set.follow_symlinks)
                    .scan(&set.dir)?
            } else {
                RemoteTreeScanner::new(rules)
                    .following_symlinks(set.follow_symlinks)
                    .scan(session, remote_root)
                    .await?
            };

            let before = candidates.len();
            for rel in self.selected(outcome) {
                let candidate = TransferCandidate::new(set.dir.clone(), rel);
                if seen.insert(candidate.clone()) {
                    candidates.push(candidate);
                }
            }
            log::debug!(
                "file set {} selected {} {}",
                set.dir.display(),
                candidates.len() - before,
                self.action.target_noun()
            );
        }
        Ok(candidates)
    }

    fn selected(&self, outcome: ScanOutcome) -> Vec<String> {
        if self.action.targets_directories() {
            outcome.included_dirs
        } else {
            outcome.included_files
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::memory::MemoryRemote;
    use chrono::Utc;

    fn remote() -> MemoryRemote {
        let mut r = MemoryRemote::new();
        r.add_file("/pub/a.txt", b"a", Utc::now())
            .add_file("/pub/docs/b.txt", b"b", Utc::now())
            .add_dir("/pub/empty");
        r
    }

    #[tokio::test]
    async fn overlapping_sets_are_deduplicated() {
        let sets = vec![
            FileSet::new("/tmp/dl").include("**/*.txt"),
            FileSet::new("/tmp/dl").include("docs/**"),
            FileSet::new("/tmp/other").include("a.txt"),
        ];
        let mut r = remote();
        let planned = TransferPlanner::new(MirrorAction::Get, &sets)
            .plan(&mut r, Some("/pub"))
            .await
            .unwrap();
        let rels: Vec<_> = planned
            .iter()
            .map(|c| (c.base_dir.display().to_string(), c.remote_relative()))
            .collect();
        assert_eq!(
            rels,
            vec![
                ("/tmp/dl".to_string(), "a.txt".to_string()),
                ("/tmp/dl".to_string(), "docs/b.txt".to_string()),
                ("/tmp/other".to_string(), "a.txt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn rmdir_plans_directories() {
        let sets = vec![FileSet::new("/unused")];
        let mut r = remote();
        let planned = TransferPlanner::new(MirrorAction::Rmdir, &sets)
            .plan(&mut r, Some("/pub"))
            .await
            .unwrap();
        let rels: Vec<_> = planned.iter().map(|c| c.remote_relative()).collect();
        assert_eq!(rels, vec!["docs", "empty"]);
    }

    #[tokio::test]
    async fn send_scans_the_local_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("site")).unwrap();
        std::fs::write(dir.path().join("site/index.html"), b"hi").unwrap();
        let sets = vec![FileSet::new(dir.path())];
        let mut r = MemoryRemote::new();
        let planned = TransferPlanner::new(MirrorAction::Send, &sets)
            .plan(&mut r, None)
            .await
            .unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].remote_relative(), "site/index.html");
        assert!(r.commands().is_empty());
    }
}
