//! Clock skew between this host and the FTP server.

use crate::mirror::error::{FtpError, FtpErrorKind, FtpResult};
use crate::mirror::local;
use crate::mirror::session::RemoteSession;
use std::collections::HashSet;
use std::io::Write;

/// Upper bound on `tmp-N` names tried for the probe file.
const MAX_PROBE_NAMES: u32 = 1000;

/// Offset added to remote timestamps to make them comparable with local
/// ones (`local = remote + offset`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkewEstimate {
    offset_millis: i64,
}

impl SkewEstimate {
    /// A known offset, e.g. from configuration.
    pub fn fixed(offset_millis: i64) -> Self {
        Self { offset_millis }
    }

    pub fn offset_millis(&self) -> i64 {
        self.offset_millis
    }

    /// Probe the server when `auto` is set, otherwise use `configured`.
    pub async fn establish<S>(session: &mut S, auto: bool, configured: i64) -> FtpResult<Self>
    where
        S: RemoteSession + ?Sized,
    {
        if auto {
            Self::probe(session).await
        } else {
            Ok(Self::fixed(configured))
        }
    }

    /// Upload a throwaway file into the working directory, compare its
    /// listed time with the local one and remove it again.
    pub async fn probe<S>(session: &mut S) -> FtpResult<Self>
    where
        S: RemoteSession + ?Sized,
    {
        let name = free_probe_name(session).await?;

        let mut scratch = tempfile::NamedTempFile::new()?;
        scratch.write_all(b"clock probe")?;
        scratch.flush()?;
        let local_time = local::modified_time(scratch.path());

        if !session.store_file(&name, scratch.path()).await? {
            return Err(probe_failure(
                session.reply_code(),
                format!("could not upload {}: {}", name, session.reply_string().trim()),
            ));
        }
        let listed = session.list_files(Some(&name)).await;
        let deleted = session.delete_file(&name).await;

        let remote_time = listed?
            .into_iter()
            .find_map(|e| e.modified)
            .ok_or_else(|| {
                probe_failure(0, format!("could not read the timestamp of {}", name))
            })?;
        match deleted {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "could not delete clock probe {}: {}",
                name,
                session.reply_string().trim()
            ),
            Err(e) => return Err(e),
        }

        let offset_millis = local_time.timestamp_millis() - remote_time.timestamp_millis();
        log::info!("server clock offset is {} ms", offset_millis);
        Ok(Self { offset_millis })
    }
}

async fn free_probe_name<S>(session: &mut S) -> FtpResult<String>
where
    S: RemoteSession + ?Sized,
{
    let taken: HashSet<String> = session
        .list_files(None)
        .await?
        .into_iter()
        .map(|e| e.name)
        .collect();
    (1..=MAX_PROBE_NAMES)
        .map(|n| format!("tmp-{}", n))
        .find(|name| !taken.contains(name))
        .ok_or_else(|| {
            probe_failure(
                0,
                format!("no free temporary name after {} attempts", MAX_PROBE_NAMES),
            )
        })
}

fn probe_failure(code: u16, detail: String) -> FtpError {
    let err = FtpError::new(
        FtpErrorKind::TransferFailed,
        format!("clock skew probe failed: {}", detail),
    );
    if code > 0 {
        err.with_code(code)
    } else {
        err
    }
}
