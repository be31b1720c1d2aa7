//! One mirror invocation from connection to `QUIT`.

use crate::mirror::client::FtpClient;
use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::orchestrator::TransferOrchestrator;
use crate::mirror::planner::TransferPlanner;
use crate::mirror::session::RemoteSession;
use crate::mirror::skew::SkewEstimate;
use crate::mirror::staleness::StalenessChecker;
use crate::mirror::types::{MirrorAction, MirrorConfig, TransferSummary};
use log::{info, warn};

pub struct MirrorTask {
    config: MirrorConfig,
}

impl MirrorTask {
    /// Validates the configuration before anything touches the network.
    pub fn new(config: MirrorConfig) -> FtpResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Connect to the configured server and run the action.
    pub async fn run(&self) -> FtpResult<TransferSummary> {
        let conn = &self.config.connection;
        info!("opening FTP connection to {}:{}", conn.host, conn.port);
        let mut client = FtpClient::connect(conn.clone()).await?;
        self.run_with_session(&mut client).await
    }

    /// Run the action over an already logged-in session. `QUIT` is issued
    /// whether or not the action succeeds.
    pub async fn run_with_session<S>(&self, session: &mut S) -> FtpResult<TransferSummary>
    where
        S: RemoteSession + ?Sized,
    {
        let result = self.execute(session).await;
        let quit = session.quit().await;
        match (result, quit) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(summary), Err(e)) => {
                warn!("error while closing FTP session: {}", e);
                Ok(summary)
            }
            (Err(e), _) => Err(e),
        }
    }

    async fn execute<S>(&self, session: &mut S) -> FtpResult<TransferSummary>
    where
        S: RemoteSession + ?Sized,
    {
        let cfg = &self.config;

        if let Some(cmd) = cfg.initial_site_command.as_deref() {
            self.site(session, cmd).await?;
        }

        if cfg.action == MirrorAction::Mkdir {
            let dir = cfg
                .remote_dir
                .as_deref()
                .ok_or_else(|| FtpError::invalid_config("the mkdir action requires a remote directory"))?;
            return TransferOrchestrator::new(cfg, dir)
                .make_remote_dir(session, dir)
                .await;
        }

        if let Some(dir) = cfg.remote_dir.as_deref() {
            if !session.change_working_directory(dir).await? {
                return Err(FtpError::from_reply(
                    session.reply_code(),
                    &format!(
                        "could not change remote directory to {}: {}",
                        dir,
                        session.reply_string().trim()
                    ),
                ));
            }
        }
        let remote_base = session.print_working_directory().await?;
        log::debug!("remote base directory is {}", remote_base);

        if cfg.action == MirrorAction::Site {
            if let Some(cmd) = cfg.site_command.as_deref() {
                // A refusal is logged by `site`; it is not a per-file skip.
                let executed = self.site(session, cmd).await?;
                return Ok(TransferSummary {
                    transferred: u64::from(executed),
                    skipped: 0,
                });
            }
            return Ok(TransferSummary::default());
        }

        let mut orchestrator = TransferOrchestrator::new(cfg, remote_base.clone());
        if cfg.newer {
            let skew = SkewEstimate::establish(session, cfg.time_diff_auto, cfg.time_diff_millis).await?;
            orchestrator = orchestrator.with_staleness(StalenessChecker::new(skew));
        }

        if let Some(umask) = cfg.umask.as_deref() {
            if !session.send_site_command(&format!("UMASK {}", umask)).await? {
                warn!("could not set umask {}: {}", umask, session.reply_string().trim());
            }
        }

        let candidates = TransferPlanner::new(cfg.action, &cfg.file_sets)
            .plan(session, Some(&remote_base))
            .await?;
        orchestrator.run(session, candidates).await
    }

    /// Send a `SITE` command; a refusal is only logged.
    async fn site<S>(&self, session: &mut S, cmd: &str) -> FtpResult<bool>
    where
        S: RemoteSession + ?Sized,
    {
        info!("SITE {}", cmd);
        let ok = session.send_site_command(cmd).await?;
        if !ok {
            warn!("SITE {} failed: {}", cmd, session.reply_string().trim());
        }
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::memory::MemoryRemote;
    use crate::mirror::types::{FileSet, FtpConnectionConfig};
    use chrono::Utc;

    fn config(action: MirrorAction) -> MirrorConfig {
        let conn = FtpConnectionConfig {
            host: "memory".into(),
            ..FtpConnectionConfig::default()
        };
        MirrorConfig::new(conn, action)
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let cfg = config(MirrorAction::Get);
        assert!(MirrorTask::new(cfg).is_err());
    }

    #[tokio::test]
    async fn quit_is_sent_after_failure() {
        let mut cfg = config(MirrorAction::Get);
        cfg.remote_dir = Some("/missing".into());
        cfg.file_sets.push(FileSet::new("/tmp/unused"));
        let mut remote = MemoryRemote::new();
        let err = MirrorTask::new(cfg)
            .unwrap()
            .run_with_session(&mut remote)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(550));
        assert!(err.message.contains("/missing"));
        assert_eq!(remote.commands().last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn initial_and_umask_commands_precede_planning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let mut cfg = config(MirrorAction::Send);
        cfg.file_sets.push(FileSet::new(dir.path()));
        cfg.initial_site_command = Some("IDLE 60".into());
        cfg.umask = Some("022".into());
        let mut remote = MemoryRemote::new();
        let summary = MirrorTask::new(cfg)
            .unwrap()
            .run_with_session(&mut remote)
            .await
            .unwrap();
        assert_eq!(summary.transferred, 1);
        let cmds = remote.commands();
        assert_eq!(cmds[0], "SITE IDLE 60");
        let umask = cmds.iter().position(|c| c == "SITE UMASK 022").unwrap();
        let stor = cmds.iter().position(|c| c.starts_with("STOR")).unwrap();
        assert!(umask < stor);
    }

    #[tokio::test]
    async fn site_action_refusal_is_neither_transferred_nor_skipped() {
        let mut cfg = config(MirrorAction::Site);
        cfg.site_command = Some("CHMOD 644 /absent".into());
        let mut remote = MemoryRemote::new();
        remote.add_file("/present", b"", Utc::now());
        let summary = MirrorTask::new(cfg.clone())
            .unwrap()
            .run_with_session(&mut remote)
            .await
            .unwrap();
        assert_eq!(summary, TransferSummary::default());
        assert!(remote.commands().contains(&"SITE CHMOD 644 /absent".to_string()));

        cfg.site_command = Some("CHMOD 644 /present".into());
        let summary = MirrorTask::new(cfg)
            .unwrap()
            .run_with_session(&mut remote)
            .await
            .unwrap();
        assert_eq!(summary, TransferSummary { transferred: 1, skipped: 0 });
    }
}
