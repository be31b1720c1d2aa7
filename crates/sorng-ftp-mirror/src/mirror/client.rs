//! Stateful FTP client — owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → banner → USER/PASS → FEAT probing →
//! `OPTS UTF8 ON` → TYPE. Every data command opens a fresh passive
//! channel. The client implements [`RemoteSession`] so the scanner and the
//! orchestrator can drive it directly.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::parser;
use crate::mirror::protocol::FtpCodec;
use crate::mirror::session::RemoteSession;
use crate::mirror::transfer;
use crate::mirror::types::*;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// A connected FTP client session.
pub struct FtpClient {
    pub id: String,
    codec: FtpCodec,
    config: FtpConnectionConfig,
    pub features: ServerFeatures,
    pub banner: String,
    connected: bool,
}

impl FtpClient {
    /// Establish and authenticate a new FTP session.
    pub async fn connect(config: FtpConnectionConfig) -> FtpResult<Self> {
        if config.host.is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_sec),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| FtpError::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("connect to {}: {}", addr, e)))?;

        let mut codec = FtpCodec::from_tcp(stream);
        let banner = codec.read_response().await?;
        if !banner.is_completion() {
            return Err(FtpError::from_reply(banner.code, &banner.text()).with_session(&id));
        }
        log::debug!("[{}] connected to {}", id, addr);

        // ── Authenticate ─────────────────────────────────────────
        let user_resp = codec.execute(&format!("USER {}", config.username)).await?;
        if user_resp.code == 331 {
            let pass_resp = codec
                .execute(&format!("PASS {}", config.password))
                .await?;
            if !pass_resp.is_success() {
                return Err(FtpError::auth_failed(format!(
                    "Login failed: {}",
                    pass_resp.text()
                ))
                .with_code(pass_resp.code)
                .with_session(&id));
            }
        } else if !user_resp.is_success() {
            return Err(FtpError::auth_failed(format!(
                "USER rejected: {}",
                user_resp.text()
            ))
            .with_code(user_resp.code)
            .with_session(&id));
        }

        // ── FEAT ─────────────────────────────────────────────────
        let features = Self::probe_features(&mut codec).await;

        if config.utf8 && features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await;
        }

        let type_cmd = match config.transfer_type {
            TransferType::Ascii => "TYPE A",
            TransferType::Binary => "TYPE I",
        };
        codec.expect_ok(type_cmd).await?;

        Ok(Self {
            id,
            codec,
            config,
            features,
            banner: banner.text(),
            connected: true,
        })
    }

    async fn probe_features(codec: &mut FtpCodec) -> ServerFeatures {
        let resp = match codec.execute("FEAT").await {
            Ok(r) if r.is_success() => r,
            _ => return ServerFeatures::default(),
        };

        let raw: Vec<String> = resp
            .lines
            .iter()
            .skip(1) // "211-Features:"
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        ServerFeatures {
            mlsd: has("MLSD"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            raw_features: raw,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    async fn open_data_channel(&mut self) -> FtpResult<TcpStream> {
        transfer::open_data_channel(
            &mut self.codec,
            self.config.data_channel_mode,
            &self.config.host,
            Duration::from_secs(self.config.data_timeout_sec),
        )
        .await
        .map_err(|e| e.with_session(&self.id))
    }

    /// Issue a data command; `None` when the server refused it.
    async fn begin_transfer(&mut self, cmd: &str) -> FtpResult<Option<TcpStream>> {
        let data = self.open_data_channel().await?;
        let resp = self.codec.execute(cmd).await?;
        if resp.is_preliminary() || resp.is_completion() {
            return Ok(Some(data));
        }
        let err = FtpError::from_reply(resp.code, &resp.text());
        if err.is_transient() {
            Err(err.with_session(&self.id))
        } else {
            Ok(None)
        }
    }

    /// Read the reply closing a data transfer (226 / 250).
    async fn finish_transfer(&mut self) -> FtpResult<bool> {
        let done = self.codec.read_response().await?;
        if done.is_completion() {
            return Ok(true);
        }
        let err = FtpError::from_reply(done.code, &done.text());
        if err.is_transient() {
            Err(err.with_session(&self.id))
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl RemoteSession for FtpClient {
    async fn change_working_directory(&mut self, path: &str) -> FtpResult<bool> {
        let resp = self.codec.execute(&format!("CWD {}", path)).await?;
        Ok(resp.is_completion())
    }

    async fn print_working_directory(&mut self) -> FtpResult<String> {
        let resp = self.codec.expect_ok("PWD").await?;
        parse_pwd(&resp.text())
    }

    async fn list_files(&mut self, path: Option<&str>) -> FtpResult<Vec<RemoteEntry>> {
        // MLSD only lists directories; single paths go through LIST.
        let verb = if self.features.mlsd && path.is_none() { "MLSD" } else { "LIST" };
        let cmd = match path {
            Some(p) => format!("{} {}", verb, p),
            None => verb.to_string(),
        };
        let mut data = match self.begin_transfer(&cmd).await? {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        drop(data);
        if !self.finish_transfer().await? {
            return Ok(Vec::new());
        }
        Ok(parser::parse_listing(&String::from_utf8_lossy(&buf)))
    }

    async fn make_directory(&mut self, path: &str) -> FtpResult<bool> {
        let resp = self.codec.execute(&format!("MKD {}", path)).await?;
        Ok(resp.is_completion())
    }

    async fn remove_directory(&mut self, path: &str) -> FtpResult<bool> {
        let resp = self.codec.execute(&format!("RMD {}", path)).await?;
        Ok(resp.is_completion())
    }

    async fn delete_file(&mut self, path: &str) -> FtpResult<bool> {
        let resp = self.codec.execute(&format!("DELE {}", path)).await?;
        Ok(resp.is_completion())
    }

    async fn store_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool> {
        let mut file = fs::File::open(local).await?;
        let mut data = match self.begin_transfer(&format!("STOR {}", remote)).await? {
            Some(d) => d,
            None => return Ok(false),
        };
        let bytes = tokio::io::copy(&mut file, &mut data).await?;
        data.shutdown().await?;
        drop(data);
        log::trace!("[{}] STOR {} ({} bytes)", self.id, remote, bytes);
        self.finish_transfer().await
    }

    async fn retrieve_file(&mut self, remote: &str, local: &Path) -> FtpResult<bool> {
        let mut data = match self.begin_transfer(&format!("RETR {}", remote)).await? {
            Some(d) => d,
            None => return Ok(false),
        };
        let mut file = fs::File::create(local).await?;
        let bytes = tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;
        drop(data);
        log::trace!("[{}] RETR {} ({} bytes)", self.id, remote, bytes);
        self.finish_transfer().await
    }

    async fn send_site_command(&mut self, args: &str) -> FtpResult<bool> {
        let resp = self.codec.execute(&format!("SITE {}", args)).await?;
        Ok(resp.is_completion())
    }

    fn reply_code(&self) -> u16 {
        self.codec.last_reply_code()
    }

    fn reply_string(&self) -> String {
        self.codec.last_reply_text()
    }

    /// Gracefully close the session.
    async fn quit(&mut self) -> FtpResult<()> {
        if self.connected {
            let _ = self.codec.execute("QUIT").await;
            self.connected = false;
        }
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Parse `257 "/some/path"` into the path string (`""` escapes a quote).
fn parse_pwd(text: &str) -> FtpResult<String> {
    if let Some(start) = text.find('"') {
        let rest = &text[start + 1..];
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    out.push('"');
                    continue;
                }
                return Ok(out);
            }
            out.push(c);
        }
    }
    Err(FtpError::protocol_error(format!("Cannot parse PWD: {}", text)))
}
