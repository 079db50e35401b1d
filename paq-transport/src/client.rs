//! The outbound SMTP conversation: dial, EHLO, opportunistic STARTTLS,
//! MAIL/RCPT/DATA, dot-stuffed body. Every read and write carries a
//! deadline; per-recipient rejections are collected, not fatal.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Clone, Debug)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn text(&self) -> String {
        self.lines.join(" / ")
    }

    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// EHLO keyword scan, first line (the greeting) excluded.
    fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .map(|w| w.eq_ignore_ascii_case(keyword))
                .unwrap_or(false)
        })
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("i/o error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("peer answered {code}: {text}")]
    Peer { code: u16, text: String },
    #[error("malformed reply: {0}")]
    Protocol(String),
}

impl SendError {
    /// 5xx replies are permanent; everything else may clear up.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Peer { code, .. } if (500..600).contains(code))
    }

    pub fn reply_code(&self) -> Option<u16> {
        match self {
            SendError::Peer { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn peer(reply: &SmtpReply) -> Self {
        SendError::Peer {
            code: reply.code,
            text: reply.text(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub helo_hostname: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Default)]
pub struct DeliveryOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, SmtpReply)>,
}

/// One complete delivery attempt against one address of one MX host.
pub async fn deliver(
    config: &ClientConfig,
    ip: IpAddr,
    port: u16,
    tls_name: &str,
    sender: &str,
    recipients: &[String],
    body: &[u8],
) -> Result<DeliveryOutcome, SendError> {
    let addr = SocketAddr::new(ip, port);
    let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SendError::Timeout("connect"))?
        .map_err(|e| SendError::Io {
            op: "connect",
            source: e,
        })?;

    let mut conv = Conversation::new(tcp, config.command_timeout);
    let greeting = conv.read_reply("greeting").await?;
    if greeting.code != 220 {
        return Err(SendError::peer(&greeting));
    }

    let ehlo = conv
        .command(&format!("EHLO {}", config.helo_hostname), "EHLO")
        .await?;
    if !ehlo.is_positive() {
        return Err(SendError::peer(&ehlo));
    }

    if ehlo.has_extension("STARTTLS") {
        let reply = conv.command("STARTTLS", "STARTTLS").await?;
        if reply.code == 220 {
            let tcp = conv.into_stream();
            let connector = tls_connector(config.skip_tls_verify);
            let server_name = rustls::pki_types::ServerName::try_from(tls_name.to_string())
                .map_err(|_| SendError::Protocol(format!("bad TLS name {:?}", tls_name)))?;
            let tls = tokio::time::timeout(config.command_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| SendError::Timeout("TLS handshake"))?
                .map_err(|e| SendError::Io {
                    op: "TLS handshake",
                    source: e,
                })?;
            let mut conv = Conversation::new(tls, config.command_timeout);
            let ehlo = conv
                .command(&format!("EHLO {}", config.helo_hostname), "EHLO")
                .await?;
            if !ehlo.is_positive() {
                return Err(SendError::peer(&ehlo));
            }
            return transact(&mut conv, sender, recipients, body).await;
        }
        tracing::debug!(code = reply.code, "peer refused STARTTLS, continuing in clear");
    }

    transact(&mut conv, sender, recipients, body).await
}

async fn transact<S>(
    conv: &mut Conversation<S>,
    sender: &str,
    recipients: &[String],
    body: &[u8],
) -> Result<DeliveryOutcome, SendError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let reply = conv
        .command(&format!("MAIL FROM:<{}>", sender), "MAIL FROM")
        .await?;
    if !reply.is_positive() {
        return Err(SendError::peer(&reply));
    }

    let mut outcome = DeliveryOutcome::default();
    let mut last_rejection: Option<SmtpReply> = None;
    for rcpt in recipients {
        let reply = conv
            .command(&format!("RCPT TO:<{}>", rcpt), "RCPT TO")
            .await?;
        if reply.is_positive() {
            outcome.accepted.push(rcpt.clone());
        } else {
            tracing::info!(rcpt = %rcpt, code = reply.code, "recipient refused");
            last_rejection = Some(reply.clone());
            outcome.rejected.push((rcpt.clone(), reply));
        }
    }
    if outcome.accepted.is_empty() {
        let reply = last_rejection.expect("at least one recipient was attempted");
        let _ = conv.command("QUIT", "QUIT").await;
        return Err(SendError::peer(&reply));
    }

    let reply = conv.command("DATA", "DATA").await?;
    if !reply.is_intermediate() {
        return Err(SendError::peer(&reply));
    }
    conv.write_dot_stuffed(body).await?;
    let reply = conv.read_reply("end of DATA").await?;
    if !reply.is_positive() {
        return Err(SendError::peer(&reply));
    }

    let _ = conv.command("QUIT", "QUIT").await;
    Ok(outcome)
}

// ---- wire plumbing ----

struct Conversation<S> {
    stream: S,
    buf: Vec<u8>,
    timeout: Duration,
}

impl<S> Conversation<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            timeout,
        }
    }

    fn into_stream(self) -> S {
        self.stream
    }

    async fn command(&mut self, line: &str, op: &'static str) -> Result<SmtpReply, SendError> {
        let mut wire = line.as_bytes().to_vec();
        wire.extend_from_slice(b"\r\n");
        tokio::time::timeout(self.timeout, self.stream.write_all(&wire))
            .await
            .map_err(|_| SendError::Timeout(op))?
            .map_err(|e| SendError::Io { op, source: e })?;
        self.read_reply(op).await
    }

    async fn read_reply(&mut self, op: &'static str) -> Result<SmtpReply, SendError> {
        let mut lines: Vec<String> = Vec::new();
        loop {
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=idx).collect();
                let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                    return Err(SendError::Protocol(line));
                }
                let code: u16 = line[..3]
                    .parse()
                    .map_err(|_| SendError::Protocol(line.clone()))?;
                let last = line.len() == 3 || line.as_bytes()[3] == b' ';
                lines.push(line.get(4..).unwrap_or("").to_string());
                if last {
                    return Ok(SmtpReply { code, lines });
                }
                continue;
            }
            if self.buf.len() > 64 * 1024 {
                return Err(SendError::Protocol("oversized reply".into()));
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| SendError::Timeout(op))?
                .map_err(|e| SendError::Io { op, source: e })?;
            if n == 0 {
                return Err(SendError::Io {
                    op,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    ),
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// CRLF-normalizes the body, escapes leading dots, terminates with
    /// the lone-dot line.
    async fn write_dot_stuffed(&mut self, body: &[u8]) -> Result<(), SendError> {
        let mut wire = Vec::with_capacity(body.len() + 64);
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                wire.push(b'.');
            }
            wire.extend_from_slice(line);
            wire.extend_from_slice(b"\r\n");
        }
        // avoid an artificial empty line when the body already ended in CRLF
        if body.ends_with(b"\n") {
            wire.truncate(wire.len() - 2);
        }
        wire.extend_from_slice(b".\r\n");
        tokio::time::timeout(self.timeout, self.stream.write_all(&wire))
            .await
            .map_err(|_| SendError::Timeout("DATA body"))?
            .map_err(|e| SendError::Io {
                op: "DATA body",
                source: e,
            })
    }
}

fn tls_connector(skip_verify: bool) -> TlsConnector {
    let config = if skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Accepts any certificate. Only wired up when the operator opts into
/// `skip_tls_verify`; opportunistic TLS still beats cleartext.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn config() -> ClientConfig {
        ClientConfig {
            helo_hostname: "mail.example.com".into(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
            skip_tls_verify: false,
        }
    }

    /// A scripted peer: answers each expected command with the paired
    /// reply, no TLS.
    async fn scripted_peer(listener: TcpListener, script: Vec<(&'static str, &'static str)>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        write_half.write_all(b"220 peer.test ESMTP\r\n").await.unwrap();
        for (expect, reply) in script {
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if expect == "<data>" {
                    if line.trim_end() == "." {
                        break;
                    }
                } else {
                    assert!(
                        line.to_uppercase().starts_with(expect),
                        "expected {:?}, got {:?}",
                        expect,
                        line
                    );
                    break;
                }
            }
            write_half.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn happy_path_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(scripted_peer(
            listener,
            vec![
                ("EHLO", "250-peer.test\r\n250 SIZE 10240000\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "250 ok\r\n"),
                ("DATA", "354 go ahead\r\n"),
                ("<data>", "250 queued\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        ));

        let outcome = deliver(
            &config(),
            addr.ip(),
            addr.port(),
            "peer.test",
            "alice@example.com",
            &["bob@peer.test".to_string()],
            b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n",
        )
        .await
        .unwrap();
        assert_eq!(outcome.accepted, vec!["bob@peer.test".to_string()]);
        assert!(outcome.rejected.is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn partial_rcpt_rejection_still_delivers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(scripted_peer(
            listener,
            vec![
                ("EHLO", "250 peer.test\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "550 5.1.1 no such user\r\n"),
                ("RCPT TO", "250 ok\r\n"),
                ("DATA", "354 go ahead\r\n"),
                ("<data>", "250 queued\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        ));

        let outcome = deliver(
            &config(),
            addr.ip(),
            addr.port(),
            "peer.test",
            "alice@example.com",
            &["gone@peer.test".to_string(), "bob@peer.test".to_string()],
            b"Subject: hi\r\n\r\nbody\r\n",
        )
        .await
        .unwrap();
        assert_eq!(outcome.accepted, vec!["bob@peer.test".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].1.code, 550);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn all_recipients_refused_is_permanent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(scripted_peer(
            listener,
            vec![
                ("EHLO", "250 peer.test\r\n"),
                ("MAIL FROM", "250 ok\r\n"),
                ("RCPT TO", "550 5.1.1 no such user\r\n"),
                ("QUIT", "221 bye\r\n"),
            ],
        ));

        let err = deliver(
            &config(),
            addr.ip(),
            addr.port(),
            "peer.test",
            "alice@example.com",
            &["gone@peer.test".to_string()],
            b"x\r\n",
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(err.reply_code(), Some(550));
    }

    #[tokio::test]
    async fn greeting_5xx_is_permanent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"554 go away\r\n").await.unwrap();
        });
        let err = deliver(
            &config(),
            addr.ip(),
            addr.port(),
            "peer.test",
            "a@b.c",
            &["x@peer.test".to_string()],
            b"x\r\n",
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
    }
}
