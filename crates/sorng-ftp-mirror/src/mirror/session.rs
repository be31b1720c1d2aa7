//! The command surface the mirror needs from an FTP connection.
//!
//! Negative server replies are reported through return values (`false`,
//! or an empty listing) and the last reply code/string; only transport
//! faults come back as `Err`.

use crate::mirror::error::FtpResult;
use crate::mirror::types::RemoteEntry;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait RemoteSession: Send {
    /// `CWD`; `false` when the server refuses.
    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool>;

    /// `PWD`, as an absolute path.
    async fn print_working_directory(&mut self) -> FtpResult<String>;

    /// `LIST` of `path` (or the working directory). A refused listing is empty.
    async fn list_files(&mut self, path: Option<&str>) -> FtpResult<Vec<RemoteEntry>>;

    async fn make_directory(&mut self, path: &str) -> FtpResult<bool>;

    async fn remove_directory(&mut self, path: &str) -> FtpResult<bool>;

    async fn delete_file(&mut self, path: &str) -> FtpResult<bool>;

    /// `STOR` the contents of `local` as `remote`.
    async fn store_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool>;

    /// `RETR` `remote` into `local`, replacing it.
    async fn retrieve_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool>;

    /// `SITE <args>`.
    async fn send_site_command(&mut self, args: &str) -> FtpResult<bool>;

    fn reply_code(&self) -> u16;

    fn reply_string(&self) -> String;

    /// Close the session. Errors are swallowed by implementations.
    async fn quit(&mut self) -> FtpResult<()> {
        Ok(())
    }
}

// ─── Remote path helpers ─────────────────────────────────────────────

/// Resolve `path` against the absolute directory `base`.
///
/// Absolute inputs ignore `base`; `.` and `..` segments are folded.
pub fn join_remote(base: &str, path: &str) -> String {
    let mut segs: Vec<&str> = if path.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            s => segs.push(s),
        }
    }
    format!("/{}", segs.join("/"))
}

/// Parent of an absolute remote path (`/` is its own parent).
pub fn remote_parent(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// Last segment of a remote path.
pub fn remote_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_relative_and_absolute() {
        assert_eq!(join_remote("/home/u", "site/a.txt"), "/home/u/site/a.txt");
        assert_eq!(join_remote("/home/u", "/srv"), "/srv");
        assert_eq!(join_remote("/", ""), "/");
        assert_eq!(join_remote("/a/b", "../c/./d"), "/a/c/d");
        assert_eq!(join_remote("/a", "x\\y"), "/a/x/y");
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(remote_parent("/a/b/c"), "/a/b");
        assert_eq!(remote_parent("/a"), "/");
        assert_eq!(remote_parent("/"), "/");
        assert_eq!(remote_name("/a/b/c.txt"), "c.txt");
        assert_eq!(remote_name("/a/dir/"), "dir");
    }
}
