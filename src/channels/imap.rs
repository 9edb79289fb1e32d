//! Minimal blocking IMAP4rev1 client over rustls.
//!
//! Only what the mailbox adapter needs: login, select, UID search for
//! unseen mail, UID fetch of full bodies without touching `\Seen`, and
//! UID store of `\Seen`. Run it inside `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::TransportError;

const SERVICE: &str = "imap";
const READ_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Untagged lines and literal payloads of one command's response.
#[derive(Debug, Default)]
struct Reply {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

pub(crate) struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    /// Connect over implicit TLS and log in.
    pub fn connect(host: &str, port: u16, user: &str, password: &str) -> Result<Self, TransportError> {
        let tcp = TcpStream::connect((host, port)).map_err(io_err)?;
        tcp.set_read_timeout(Some(READ_TIMEOUT)).map_err(io_err)?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            TransportError::PermanentValidation(format!("invalid IMAP host '{host}': {e}"))
        })?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| TransportError::transient(SERVICE, format!("TLS setup failed: {e}")))?;

        let mut session = Self {
            tls: StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with(b"* OK") && !greeting.starts_with(b"* PREAUTH") {
            return Err(TransportError::transient(
                SERVICE,
                format!("unexpected greeting: {}", String::from_utf8_lossy(&greeting).trim_end()),
            ));
        }
        session.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        Ok(session)
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), TransportError> {
        self.command(&format!("SELECT {}", quote(mailbox)))?;
        Ok(())
    }

    /// UIDs of every message without the `\Seen` flag.
    pub fn search_unseen(&mut self) -> Result<Vec<String>, TransportError> {
        let reply = self.command("UID SEARCH UNSEEN")?;
        Ok(parse_search(&reply.lines))
    }

    /// Full RFC 822 bytes of `uid`, leaving its flags untouched.
    pub fn fetch_raw(&mut self, uid: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let mut reply = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(if reply.literals.is_empty() {
            None
        } else {
            Some(reply.literals.swap_remove(0))
        })
    }

    pub fn mark_seen(&mut self, uid: &str) -> Result<(), TransportError> {
        self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        Ok(())
    }

    pub fn logout(mut self) {
        // Server may drop the connection before answering; nothing to recover.
        let _ = self.command("LOGOUT");
    }

    /// Send one tagged command and collect its response up to the tagged status.
    fn command(&mut self, cmd: &str) -> Result<Reply, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.tls
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(io_err)?;
        self.tls.flush().map_err(io_err)?;

        let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let mut reply = Reply::default();
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.tls.read_exact(&mut literal).map_err(io_err)?;
                reply.literals.push(literal);
            }
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if let Some(status) = text.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(reply);
                }
                return Err(TransportError::transient(
                    SERVICE,
                    format!("{verb} rejected: {status}"),
                ));
            }
            reply.lines.push(text);
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(TransportError::transient(SERVICE, "connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }
}

fn io_err(e: std::io::Error) -> TransportError {
    TransportError::transient(SERVICE, e)
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Size of the literal announced at the end of `line` (`... {123}\r\n`).
fn literal_size(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|b| *b == b'{')?;
    std::str::from_utf8(&line[open + 1..]).ok()?.parse().ok()
}

fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter(|uid| uid.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_size_from_fetch_line() {
        assert_eq!(literal_size(b"* 3 FETCH (UID 12 BODY[] {2048}\r\n"), Some(2048));
        assert_eq!(literal_size(b"* 3 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_size(b"{oops}\r\n"), None);
    }

    #[test]
    fn search_collects_uids() {
        let lines = vec!["* SEARCH 4 9 17".to_string(), "* OK noise".to_string()];
        assert_eq!(parse_search(&lines), vec!["4", "9", "17"]);
        assert!(parse_search(&["* SEARCH".to_string()]).is_empty());
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
        assert_eq!(quote("INBOX"), "\"INBOX\"");
    }
}
