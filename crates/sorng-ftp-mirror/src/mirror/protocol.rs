//! Control-channel codec (RFC 959 §4).
//!
//! Sends CRLF-terminated commands and reads single- and multi-line
//! replies. The most recent reply is retained so callers can report it
//! when an operation is refused.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::types::FtpResponse;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub struct FtpCodec {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    last: Option<FtpResponse>,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer: wr,
            last: None,
        }
    }

    /// Send a raw command (CRLF appended here).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        self.writer.write_all(line.as_bytes()).await?;
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(FtpError::disconnected("server closed the control connection"));
        }
        Ok(buf)
    }

    /// Read a complete reply.
    ///
    /// ```text
    /// 220-Welcome
    /// 220-second line
    /// 220 ready
    /// ```
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first = first.trim_end_matches(['\r', '\n']).to_string();
        let code = parse_code(&first)?;
        let mut lines = vec![first.clone()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next = next.trim_end_matches(['\r', '\n']).to_string();
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        self.last = Some(resp.clone());
        Ok(resp)
    }

    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }

    pub fn last_reply_code(&self) -> u16 {
        self.last.as_ref().map(|r| r.code).unwrap_or(0)
    }

    pub fn last_reply_text(&self) -> String {
        self.last.as_ref().map(FtpResponse::text).unwrap_or_default()
    }
}

/// Parse the 3-digit reply code at the start of a line.
pub(crate) fn parse_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| FtpError::protocol_error(format!("invalid reply line: '{}'", line)))
}
