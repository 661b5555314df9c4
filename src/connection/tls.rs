//! Production transport: IMAP over implicit TLS with tokio-rustls and the
//! platform's native root certificates. Authentication is XOAUTH2 only.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{Command, ImapTransport, TransportFactory};
use crate::errors::{EngineError, EngineResult};
use crate::types::Account;

pub struct TlsTransportFactory;

impl TransportFactory for TlsTransportFactory {
    fn create(&self, account: &Account) -> Box<dyn ImapTransport> {
        Box::new(TlsTransport::new(&account.imap_host, account.imap_port))
    }
}

pub struct TlsTransport {
    host: String,
    port: u16,
    stream: Option<BufReader<TlsStream<TcpStream>>>,
    tag_seq: u64,
}

impl TlsTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
            tag_seq: 0,
        }
    }

    fn next_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("P{:04}", self.tag_seq)
    }

    async fn send_line(&mut self, line: &str) -> EngineResult<()> {
        let stream = self.stream_mut()?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    fn stream_mut(&mut self) -> EngineResult<&mut BufReader<TlsStream<TcpStream>>> {
        self.stream
            .as_mut()
            .ok_or_else(|| EngineError::Transport("not connected".into()))
    }

    /// Reads one logical response line, splicing literal contents in directly
    /// after their `{N}` markers so a whole FETCH response arrives as one
    /// string.
    async fn read_response_line(&mut self) -> EngineResult<String> {
        let stream = self.stream_mut()?;
        let mut line = String::new();
        loop {
            let mut chunk = Vec::new();
            let n = stream.read_until(b'\n', &mut chunk).await?;
            if n == 0 {
                return Err(EngineError::Transport("connection closed by server".into()));
            }
            let text = String::from_utf8_lossy(&chunk);
            line.push_str(text.trim_end_matches(['\r', '\n']));

            match trailing_literal_len(&line) {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    stream.read_exact(&mut buf).await?;
                    line.push_str(&String::from_utf8_lossy(&buf));
                }
                None => return Ok(line),
            }
        }
    }

    /// Sends a tagged command and collects untagged lines until the tagged
    /// completion. NO/BAD become protocol errors carrying the server text.
    async fn run_tagged(&mut self, text: &str) -> EngineResult<Vec<String>> {
        let tag = self.next_tag();
        self.send_line(&format!("{} {}", tag, text)).await?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line().await?;
            if let Some(rest) = line.strip_prefix(&tag) {
                let rest = rest.trim_start();
                let status = rest.split(' ').next().unwrap_or("").to_ascii_uppercase();
                return match status.as_str() {
                    "OK" => Ok(lines),
                    "NO" | "BAD" => Err(EngineError::Protocol(rest.to_string())),
                    _ => Err(EngineError::Protocol(format!(
                        "unexpected response: {}",
                        line
                    ))),
                };
            }
            if line.starts_with("+ ") {
                // No command we issue should leave the server waiting for a
                // continuation at this point.
                self.send_line("").await?;
                continue;
            }
            lines.push(line);
        }
    }
}

fn trailing_literal_len(line: &str) -> Option<usize> {
    let rest = line.strip_suffix('}')?;
    let open = rest.rfind('{')?;
    let digits = &rest[open + 1..];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[async_trait]
impl ImapTransport for TlsTransport {
    async fn connect(&mut self) -> EngineResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|e| EngineError::Transport(format!("loading native certs: {}", e)))?;
        for cert in certs {
            root_store
                .add(&Certificate(cert.0))
                .map_err(|e| EngineError::Transport(format!("adding root cert: {}", e)))?;
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| EngineError::Transport(format!("invalid server name: {}", e)))?;
        let tls = connector.connect(server_name, tcp).await?;

        self.stream = Some(BufReader::new(tls));

        let greeting = self.read_response_line().await?;
        if !greeting.to_ascii_uppercase().starts_with("* OK") {
            self.stream = None;
            return Err(EngineError::Transport(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }
        debug!(host = %self.host, port = self.port, "IMAP transport connected");
        Ok(())
    }

    async fn authenticate(&mut self, user: &str, access_token: &str) -> EngineResult<()> {
        let sasl = format!("user={}\x01auth=Bearer {}\x01\x01", user, access_token);
        let encoded = base64::engine::general_purpose::STANDARD.encode(sasl.as_bytes());
        let tag = self.next_tag();
        self.send_line(&format!("{} AUTHENTICATE XOAUTH2 {}", tag, encoded))
            .await?;

        loop {
            let line = self.read_response_line().await?;
            if let Some(rest) = line.strip_prefix(&tag) {
                let rest = rest.trim_start();
                if rest.to_ascii_uppercase().starts_with("OK") {
                    debug!(user = %user, "XOAUTH2 authentication accepted");
                    return Ok(());
                }
                return Err(EngineError::Protocol(format!(
                    "AUTHENTICATE failed: {}",
                    rest
                )));
            }
            if line.starts_with("+ ") {
                // XOAUTH2 error challenge: acknowledge with an empty line to
                // receive the tagged NO.
                self.send_line("").await?;
            }
        }
    }

    async fn execute(&mut self, command: &Command) -> EngineResult<Vec<String>> {
        debug!(command = command.name(), "Executing IMAP command");
        self.run_tagged(&command.wire()).await
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_marker_detection() {
        assert_eq!(trailing_literal_len("* 1 FETCH (BODY[] {310}"), Some(310));
        assert_eq!(trailing_literal_len("* 1 FETCH (FLAGS (\\Seen))"), None);
        assert_eq!(trailing_literal_len("{}"), None);
    }

    #[test]
    fn commands_render_wire_forms() {
        assert_eq!(Command::List.wire(), "LIST \"\" \"*\"");
        assert_eq!(
            Command::Select("Sent Items".into()).wire(),
            "SELECT \"Sent Items\""
        );
        assert_eq!(
            Command::Fetch {
                uid_set: "1:3".into(),
                items: "(UID FLAGS)".into()
            }
            .wire(),
            "UID FETCH 1:3 (UID FLAGS)"
        );
        assert_eq!(
            Command::Store {
                uid_set: "7".into(),
                item: "+FLAGS".into(),
                flags: "(\\Seen)".into()
            }
            .wire(),
            "UID STORE 7 +FLAGS (\\Seen)"
        );
        assert_eq!(
            Command::Select("a\"b".into()).wire(),
            "SELECT \"a\\\"b\""
        );
    }
}
