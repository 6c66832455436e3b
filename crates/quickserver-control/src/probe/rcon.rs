//! Source RCON client used as the fleet's health probe and in-band message channel.
//!
//! Packets are `size:i32le | id:i32le | type:i32le | body | 0x00 | 0x00`, where `size`
//! excludes itself. Multi-packet replies are delimited by sending an empty
//! `SERVERDATA_RESPONSE_VALUE` after the command and reading until its id comes back.

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{FleetError, Result};
use crate::ports::{HealthProbe, ProbeQuery};

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;

const AUTH_ID: i32 = 1;
const COMMAND_ID: i32 = 2;
const TERMINATOR_ID: i32 = 3;

const MIN_PACKET_SIZE: i32 = 10;
const MAX_PACKET_SIZE: i32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RconProbe;

impl RconProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthProbe for RconProbe {
    async fn query(&self, query: ProbeQuery) -> Result<String> {
        match tokio::time::timeout(query.timeout, exchange(&query)).await {
            Ok(result) => result.map_err(FleetError::from),
            Err(_) => Err(FleetError::internal(format!(
                "rcon query to {}:{} timed out after {}ms",
                query.host,
                query.port,
                query.timeout.as_millis()
            ))),
        }
    }
}

async fn exchange(query: &ProbeQuery) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect((query.host.as_str(), query.port))
        .await
        .with_context(|| format!("connect rcon {}:{}", query.host, query.port))?;

    write_packet(&mut stream, AUTH_ID, SERVERDATA_AUTH, &query.password).await?;
    loop {
        let packet = read_packet(&mut stream).await?;
        if packet.kind != SERVERDATA_AUTH_RESPONSE {
            // Servers send an empty RESPONSE_VALUE ahead of the auth verdict.
            continue;
        }
        if packet.id == -1 {
            anyhow::bail!("rcon authentication rejected by {}:{}", query.host, query.port);
        }
        break;
    }

    write_packet(&mut stream, COMMAND_ID, SERVERDATA_EXECCOMMAND, &query.command).await?;
    write_packet(&mut stream, TERMINATOR_ID, SERVERDATA_RESPONSE_VALUE, "").await?;

    let mut transcript = String::new();
    loop {
        let packet = read_packet(&mut stream).await?;
        if packet.id == TERMINATOR_ID {
            break;
        }
        if packet.id == COMMAND_ID && packet.kind == SERVERDATA_RESPONSE_VALUE {
            transcript.push_str(&packet.body);
        }
    }

    Ok(transcript)
}

fn encode_packet(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let size = 4 + 4 + body.len() as i32 + 2;
    let mut buf = Vec::with_capacity(size as usize + 4);
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf
}

async fn write_packet<W>(w: &mut W, id: i32, kind: i32, body: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&encode_packet(id, kind, body))
        .await
        .context("write rcon packet")?;
    w.flush().await.context("flush rcon packet")?;
    Ok(())
}

async fn read_packet<R>(r: &mut R) -> anyhow::Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let size = r.read_i32_le().await.context("read rcon packet size")?;
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        anyhow::bail!("invalid rcon packet size: {size}");
    }

    let mut buf = vec![0u8; size as usize];
    r.read_exact(&mut buf).await.context("read rcon packet")?;

    let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body_end = buf.len() - 2;
    let body = String::from_utf8_lossy(&buf[8..body_end])
        .trim_end_matches('\0')
        .to_string();

    Ok(Packet { id, kind, body })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    /// Minimal RCON server: checks the password, answers `status`, echoes the terminator.
    async fn serve_once(listener: TcpListener, password: &'static str, reply: &'static str) {
        let (mut sock, _) = listener.accept().await.unwrap();

        let auth = read_packet(&mut sock).await.unwrap();
        assert_eq!(auth.kind, SERVERDATA_AUTH);
        write_packet(&mut sock, auth.id, SERVERDATA_RESPONSE_VALUE, "").await.unwrap();
        let verdict = if auth.body == password { auth.id } else { -1 };
        write_packet(&mut sock, verdict, SERVERDATA_AUTH_RESPONSE, "").await.unwrap();
        if verdict == -1 {
            return;
        }

        let cmd = read_packet(&mut sock).await.unwrap();
        let terminator = read_packet(&mut sock).await.unwrap();
        // Split the reply over two packets to exercise reassembly.
        let (a, b) = reply.split_at(reply.len() / 2);
        write_packet(&mut sock, cmd.id, SERVERDATA_RESPONSE_VALUE, a).await.unwrap();
        write_packet(&mut sock, cmd.id, SERVERDATA_RESPONSE_VALUE, b).await.unwrap();
        write_packet(&mut sock, terminator.id, SERVERDATA_RESPONSE_VALUE, "").await.unwrap();
    }

    fn query(port: u16, password: &str, timeout: Duration) -> ProbeQuery {
        ProbeQuery {
            host: "127.0.0.1".into(),
            port,
            password: password.into(),
            command: "status".into(),
            timeout,
        }
    }

    #[test]
    fn packet_layout_matches_the_wire_format() {
        let bytes = encode_packet(7, SERVERDATA_EXECCOMMAND, "status");
        assert_eq!(&bytes[..4], &(4 + 4 + 6 + 2i32).to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..18], b"status");
        assert_eq!(&bytes[18..], &[0, 0]);
    }

    #[tokio::test]
    async fn rejects_oversized_packets() {
        let mut raw: &[u8] = &(MAX_PACKET_SIZE + 1).to_le_bytes();
        let err = read_packet(&mut raw).await.unwrap_err();
        assert!(err.to_string().contains("invalid rcon packet size"));
    }

    #[tokio::test]
    async fn returns_the_reassembled_transcript() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "secret", "players : 3 humans, 0 bots (24 max)\n"));

        let transcript = RconProbe::new()
            .query(query(port, "secret", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(transcript, "players : 3 humans, 0 bots (24 max)\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "secret", "unused"));

        let err = RconProbe::new()
            .query(query(port, "nope", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("authentication rejected"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });

        let err = RconProbe::new()
            .query(query(port, "secret", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        server.abort();
    }
}
