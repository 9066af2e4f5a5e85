//! Minimal Tor control-port client (control-spec.txt)

use std::net::SocketAddr;
use std::path::Path;

use data_encoding::{BASE64, HEXLOWER};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::{NetError, NetResult};

fn tor_err(msg: impl Into<String>) -> NetError {
    NetError::Tor(msg.into())
}

pub struct TorControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TorControl {
    pub async fn connect(addr: SocketAddr) -> NetResult<Self> {
        debug!(%addr, "connecting to Tor control port");
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Authenticate with the cookie Tor wrote into its data directory.
    pub async fn authenticate_cookie(&mut self, cookie_path: &Path) -> NetResult<()> {
        let cookie = tokio::fs::read(cookie_path).await?;
        self.command(&format!("AUTHENTICATE {}", HEXLOWER.encode(&cookie)))
            .await?;
        // Tor exits when this connection closes.
        self.command("TAKEOWNERSHIP").await?;
        Ok(())
    }

    /// Send one command and collect the reply lines with the status prefix
    /// removed. Any 4xx/5xx reply is an error.
    pub async fn command(&mut self, cmd: &str) -> NetResult<Vec<String>> {
        let verb = cmd.split_whitespace().next().unwrap_or_default();
        debug!(command = verb, "tor control command");
        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> NetResult<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 {
                return Err(tor_err(format!("malformed control reply: {line:?}")));
            }
            let (status, rest) = line.split_at(3);
            let (sep, body) = rest.split_at(1);

            if status.starts_with('4') || status.starts_with('5') {
                return Err(tor_err(format!("{status} {body}")));
            }

            match sep {
                " " => {
                    lines.push(body.to_string());
                    return Ok(lines);
                }
                "-" => lines.push(body.to_string()),
                "+" => {
                    let mut data = body.to_string();
                    loop {
                        let data_line = self.read_line().await?;
                        if data_line == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(data_line.strip_prefix('.').unwrap_or(&data_line));
                    }
                    lines.push(data);
                }
                _ => return Err(tor_err(format!("malformed control reply: {line:?}"))),
            }
        }
    }

    async fn read_line(&mut self) -> NetResult<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(tor_err("control connection closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Value of a single `GETINFO` key.
    pub async fn get_info(&mut self, key: &str) -> NetResult<String> {
        let lines = self.command(&format!("GETINFO {key}")).await?;
        let prefix = format!("{key}=");
        lines
            .iter()
            .find_map(|l| l.strip_prefix(&prefix))
            .map(str::to_string)
            .ok_or_else(|| tor_err(format!("GETINFO {key}: missing value")))
    }

    /// Bootstrap progress in percent.
    pub async fn bootstrap_progress(&mut self) -> NetResult<u8> {
        let phase = self.get_info("status/bootstrap-phase").await?;
        Ok(parse_progress(&phase).unwrap_or(0))
    }

    /// Address of the first SOCKS listener.
    pub async fn socks_listener(&mut self) -> NetResult<SocketAddr> {
        let listeners = self.get_info("net/listeners/socks").await?;
        listeners
            .split_whitespace()
            .map(|l| l.trim_matches('"'))
            .find_map(|l| l.parse().ok())
            .ok_or_else(|| tor_err(format!("no usable SOCKS listener in {listeners:?}")))
    }

    /// Publish an onion service for a 64-byte expanded Ed25519 key. Returns
    /// the service id (the address without `.onion`).
    pub async fn add_onion(
        &mut self,
        expanded_key: &[u8; 64],
        virtual_port: u16,
        target: SocketAddr,
    ) -> NetResult<String> {
        let cmd = format!(
            "ADD_ONION ED25519-V3:{} Flags=DiscardPK Port={virtual_port},{target}",
            BASE64.encode(expanded_key)
        );
        let lines = self.command(&cmd).await?;
        let service_id = lines
            .iter()
            .find_map(|l| l.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| tor_err("ADD_ONION reply missing ServiceID"))?;
        info!(%service_id, virtual_port, %target, "onion service published");
        Ok(service_id)
    }

    pub async fn del_onion(&mut self, service_id: &str) -> NetResult<()> {
        self.command(&format!("DEL_ONION {service_id}")).await?;
        info!(service_id, "onion service removed");
        Ok(())
    }
}

/// `PROGRESS=NN` out of a bootstrap status line.
fn parse_progress(phase: &str) -> Option<u8> {
    phase
        .split_whitespace()
        .find_map(|kv| kv.strip_prefix("PROGRESS="))
        .and_then(|v| v.parse().ok())
}

/// The control port Tor wrote with `ControlPortWriteToFile`: `PORT=127.0.0.1:NNNN`.
pub fn parse_control_port_file(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .find_map(|l| l.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_progress() {
        let phase = "NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn_done SUMMARY=\"Connected\"";
        assert_eq!(parse_progress(phase), Some(85));
        assert_eq!(parse_progress("NOTICE BOOTSTRAP"), None);
    }

    #[test]
    fn test_parse_control_port_file() {
        assert_eq!(
            parse_control_port_file("PORT=127.0.0.1:45123\n"),
            Some("127.0.0.1:45123".parse().unwrap())
        );
        assert_eq!(parse_control_port_file(""), None);
    }

    /// Fake control port: answers each command line with a canned reply.
    async fn fake_tor(replies: Vec<&'static str>) -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();
            for reply in replies {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                seen.push(line.trim_end().to_string());
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_add_onion_and_getinfo() {
        let (addr, server) = fake_tor(vec![
            "250-ServiceID=abcdef\r\n250 OK\r\n",
            "250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n",
            "250+status/bootstrap-phase=NOTICE BOOTSTRAP\r\nPROGRESS=100 TAG=done\r\n.\r\n250 OK\r\n",
            "552 Unknown onion service id\r\n",
        ])
        .await;

        let mut ctl = TorControl::connect(addr).await.unwrap();
        let id = ctl
            .add_onion(&[1u8; 64], 80, "127.0.0.1:4000".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(id, "abcdef");

        assert_eq!(
            ctl.socks_listener().await.unwrap(),
            "127.0.0.1:9150".parse().unwrap()
        );
        assert_eq!(ctl.bootstrap_progress().await.unwrap(), 100);

        let err = ctl.del_onion("missing").await.unwrap_err();
        assert!(matches!(err, NetError::Tor(msg) if msg.starts_with("552")));

        drop(ctl);
        let seen = server.await.unwrap();
        assert!(seen[0].starts_with("ADD_ONION ED25519-V3:"));
        assert!(seen[0].ends_with("Port=80,127.0.0.1:4000"));
        assert_eq!(seen[1], "GETINFO net/listeners/socks");
        assert_eq!(seen[3], "DEL_ONION missing");
    }
}
