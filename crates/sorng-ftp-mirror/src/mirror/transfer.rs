//! Passive data channels (RFC 959 PASV, RFC 2428 EPSV).

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::protocol::FtpCodec;
use crate::mirror::types::DataChannelMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("static PASV regex");
    static ref EPSV_RE: Regex = Regex::new(r"\(\|\|\|(\d+)\|\)").expect("static EPSV regex");
}

/// Open a passive data connection to the server.
pub async fn open_data_channel(
    codec: &mut FtpCodec,
    mode: DataChannelMode,
    host: &str,
    data_timeout: Duration,
) -> FtpResult<TcpStream> {
    let addr = match mode {
        DataChannelMode::Passive => {
            let resp = codec.expect_ok("PASV").await?;
            parse_pasv_response(&resp.text())?.to_string()
        }
        DataChannelMode::ExtendedPassive => {
            let resp = codec.expect_ok("EPSV").await?;
            format!("{}:{}", host, parse_epsv_response(&resp.text())?)
        }
    };
    timeout(data_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("data connect to {} timed out", addr)))?
        .map_err(|e| FtpError::data_channel(format!("data connect to {}: {}", addr, e)))
}

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("cannot parse PASV reply: {}", text)))?;
    let nums = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<FtpResult<Vec<u8>>>()?;
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parse `(|||port|)` from a 229 reply.
fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("cannot parse EPSV reply: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error("EPSV port out of range"))
}
