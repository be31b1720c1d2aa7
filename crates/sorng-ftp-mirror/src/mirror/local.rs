//! Local tree scanner and file-time helpers.
//!
//! Applies the same [`SelectionRules`] to a local directory that the
//! remote scanner applies to the server, so pushes and pulls select the
//! same relative paths.

use crate::mirror::error::FtpResult;
use crate::mirror::selection::SelectionRules;
use crate::mirror::types::ScanOutcome;
use chrono::{DateTime, TimeZone, Utc};
use filetime::FileTime;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    IncludedFile,
    IncludedDir,
    ExcludedFile,
    ExcludedDir,
    NotIncluded,
}

#[derive(Debug, Clone)]
pub struct LocalTreeScanner {
    rules: SelectionRules,
    follow_symlinks: bool,
}

impl LocalTreeScanner {
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

    /// Walk `base`. A missing base yields an empty outcome.
    pub fn scan(&self, base: &Path) -> FtpResult<ScanOutcome> {
        let mut classified: BTreeMap<String, Class> = BTreeMap::new();
        if !base.is_dir() {
            log::debug!("local directory {} does not exist, nothing to scan", base.display());
            return Ok(ScanOutcome::default());
        }

        let mut it = WalkDir::new(base)
            .min_depth(1)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = it.next() {
            let entry = match next {
                Ok(e) => e,
                Err(e) if e.loop_ancestor().is_some() => {
                    log::debug!("not descending into {:?}: symbolic link loop", e.path());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let rel = match entry.path().strip_prefix(base) {
                Ok(r) => r.to_string_lossy().into_owned(),
                Err(_) => continue,
            };

            let is_link = entry.path_is_symlink();
            let is_dir = if is_link && !self.follow_symlinks {
                entry.path().is_dir()
            } else {
                entry.file_type().is_dir()
            };

            if is_link && !self.follow_symlinks {
                let class = if is_dir { Class::ExcludedDir } else { Class::ExcludedFile };
                classified.insert(rel, class);
                continue;
            }

            let included = self.rules.is_included(&rel);
            let excluded = included && self.rules.is_excluded(&rel);
            let class = match (is_dir, included, excluded) {
                (true, true, true) => Class::ExcludedDir,
                (true, true, false) => Class::IncludedDir,
                (false, true, true) => Class::ExcludedFile,
                (false, true, false) => Class::IncludedFile,
                (_, false, _) => Class::NotIncluded,
            };
            if is_dir && !self.rules.could_hold_included(&rel) {
                it.skip_current_dir();
            }
            classified.insert(rel, class);
        }

        let mut out = ScanOutcome::default();
        for (rel, class) in classified {
            match class {
                Class::IncludedFile => out.included_files.push(rel),
                Class::IncludedDir => out.included_dirs.push(rel),
                Class::ExcludedFile => out.excluded_files.push(rel),
                Class::ExcludedDir => out.excluded_dirs.push(rel),
                Class::NotIncluded => out.not_included.push(rel),
            }
        }
        Ok(out)
    }
}

/// Last-modified time of a local file; a missing file reads as the epoch.
pub fn modified_time(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .map(|m| FileTime::from_last_modification_time(&m))
        .ok()
        .and_then(|ft| Utc.timestamp_opt(ft.unix_seconds(), ft.nanoseconds()).single())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Stamp a local file with the given modification time.
pub fn set_modified_time(path: &Path, when: DateTime<Utc>) -> FtpResult<()> {
    let ft = FileTime::from_unix_time(when.timestamp(), when.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, ft)?;
    Ok(())
}
