use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use paq_user::address::Address;
use paq_user::login::AuthError;
use paq_user::model::User;

use crate::delivery::DeliveryError;
use crate::sasl;
use crate::smtp::SmtpMode;
use crate::stream::AnyStream;
use crate::Core;

const MAX_LINE: usize = 8192;
const MAX_RECIPIENTS: usize = 100;

pub struct SmtpSession {
    core: Arc<Core>,
    mode: SmtpMode,
    tls: Option<TlsAcceptor>,
    remote_addr: SocketAddr,
    must_exit: watch::Receiver<bool>,

    tls_active: bool,
    helo: Option<String>,
    authenticated: Option<User>,
    // one mail transaction
    sender: Option<String>,
    recipients: Vec<Address>,
}

impl SmtpSession {
    pub fn new(
        core: Arc<Core>,
        mode: SmtpMode,
        tls: Option<TlsAcceptor>,
        remote_addr: SocketAddr,
        must_exit: watch::Receiver<bool>,
    ) -> Self {
        let tls_active = mode == SmtpMode::SubmissionTls;
        Self {
            core,
            mode,
            tls,
            remote_addr,
            must_exit,
            tls_active,
            helo: None,
            authenticated: None,
            sender: None,
            recipients: Vec::new(),
        }
    }

    pub async fn run(mut self, stream: AnyStream) {
        let mut io = LineIo::new(stream, self.idle_timeout());
        let addr = self.remote_addr;
        if let Err(e) = self.serve(&mut io).await {
            tracing::debug!(addr = %addr, err = %e, "SMTP session ended with error");
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.core.config.smtp.idle_timeout_secs)
    }

    async fn serve(&mut self, io: &mut LineIo) -> Result<()> {
        io.write_line(&format!("220 {} ESMTP Paquebot", self.core.config.hostname))
            .await?;
        self.command_loop(io).await
    }

    async fn command_loop(&mut self, io: &mut LineIo) -> Result<()> {
        loop {
            let mut must_exit = self.must_exit.clone();
            let line = tokio::select! {
                line = io.read_line() => line?,
                _ = must_exit.changed() => {
                    io.write_line("421 4.3.0 Service shutting down").await?;
                    return Ok(());
                }
            };
            let line = match line {
                Some(line) => line,
                None => return Ok(()),
            };

            let (verb, rest) = split_verb(&line);
            match verb.as_str() {
                "HELO" => {
                    self.helo = Some(rest.trim().to_string());
                    self.reset_transaction();
                    io.write_line(&format!("250 {}", self.core.config.hostname))
                        .await?;
                }
                "EHLO" => {
                    self.helo = Some(rest.trim().to_string());
                    self.reset_transaction();
                    self.ehlo(io).await?;
                }
                "STARTTLS" => {
                    if self.starttls(io).await? {
                        return Ok(());
                    }
                }
                "AUTH" => self.auth(io, rest).await?,
                "MAIL" => self.mail(io, rest).await?,
                "RCPT" => self.rcpt(io, rest).await?,
                "DATA" => self.data(io).await?,
                "RSET" => {
                    self.reset_transaction();
                    io.write_line("250 2.0.0 Ok").await?;
                }
                "NOOP" => io.write_line("250 2.0.0 Ok").await?,
                "VRFY" => io.write_line("252 2.1.5 Cannot VRFY, send some mail").await?,
                "QUIT" => {
                    io.write_line(&format!("221 2.0.0 {} closing", self.core.config.hostname))
                        .await?;
                    return Ok(());
                }
                "" => io.write_line("500 5.5.2 Empty command").await?,
                _ => io.write_line("502 5.5.1 Command not implemented").await?,
            }
        }
    }

    async fn ehlo(&mut self, io: &mut LineIo) -> Result<()> {
        let mut caps: Vec<String> = vec![
            "PIPELINING".into(),
            "8BITMIME".into(),
            format!("SIZE {}", self.core.config.smtp.max_message_size),
        ];
        if self.tls.is_some() && !self.tls_active {
            caps.push("STARTTLS".into());
        }
        if self.mode.requires_auth() && self.auth_permitted() {
            caps.push("AUTH PLAIN LOGIN".into());
        }

        io.write_line(&format!("250-{} greets you", self.core.config.hostname))
            .await?;
        for (i, cap) in caps.iter().enumerate() {
            let sep = if i + 1 == caps.len() { ' ' } else { '-' };
            io.write_line(&format!("250{}{}", sep, cap)).await?;
        }
        Ok(())
    }

    /// AUTH is held back until the connection is private, unless no TLS
    /// is configured at all (dev setups).
    fn auth_permitted(&self) -> bool {
        self.tls_active || self.tls.is_none()
    }

    /// Returns true when the session must restart over the TLS stream.
    async fn starttls(&mut self, io: &mut LineIo) -> Result<bool> {
        let acceptor = match (&self.tls, self.tls_active) {
            (_, true) => {
                io.write_line("503 5.5.1 TLS already active").await?;
                return Ok(false);
            }
            (None, _) => {
                io.write_line("454 4.7.0 TLS not available").await?;
                return Ok(false);
            }
            (Some(acceptor), false) => acceptor.clone(),
        };
        io.write_line("220 2.0.0 Ready to start TLS").await?;
        let plain = io.take_stream();
        let tls = acceptor.accept(plain).await.context("TLS handshake")?;

        // fresh state on the encrypted channel
        self.tls_active = true;
        self.helo = None;
        self.authenticated = None;
        self.reset_transaction();

        let mut io = LineIo::new(AnyStream::new(tls), self.idle_timeout());
        Box::pin(self.command_loop(&mut io)).await?;
        Ok(true)
    }

    async fn auth(&mut self, io: &mut LineIo, rest: &str) -> Result<()> {
        if !self.mode.requires_auth() {
            io.write_line("503 5.5.1 AUTH not available on this port")
                .await?;
            return Ok(());
        }
        if !self.auth_permitted() {
            io.write_line("530 5.7.0 Must issue a STARTTLS command first")
                .await?;
            return Ok(());
        }
        if self.authenticated.is_some() {
            io.write_line("503 5.5.1 Already authenticated").await?;
            return Ok(());
        }

        let mut parts = rest.trim().splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_uppercase();
        let initial = parts.next().map(str::trim);

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match initial {
                    Some(p) => p.to_string(),
                    None => {
                        io.write_line("334 ").await?;
                        match io.read_line().await? {
                            Some(line) if line != "*" => line,
                            _ => {
                                io.write_line("501 5.7.0 Authentication aborted").await?;
                                return Ok(());
                            }
                        }
                    }
                };
                match sasl::decode_plain(&payload) {
                    Ok(c) => c,
                    Err(_) => {
                        io.write_line("501 5.5.2 Cannot decode credentials").await?;
                        return Ok(());
                    }
                }
            }
            "LOGIN" => {
                let username_b64 = match initial {
                    Some(u) => u.to_string(),
                    None => {
                        io.write_line("334 VXNlcm5hbWU6").await?;
                        match io.read_line().await? {
                            Some(line) if line != "*" => line,
                            _ => {
                                io.write_line("501 5.7.0 Authentication aborted").await?;
                                return Ok(());
                            }
                        }
                    }
                };
                io.write_line("334 UGFzc3dvcmQ6").await?;
                let password_b64 = match io.read_line().await? {
                    Some(line) if line != "*" => line,
                    _ => {
                        io.write_line("501 5.7.0 Authentication aborted").await?;
                        return Ok(());
                    }
                };
                match (sasl::decode_b64(&username_b64), sasl::decode_b64(&password_b64)) {
                    (Ok(u), Ok(p)) => sasl::PlainCredentials {
                        authcid: String::from_utf8_lossy(&u).into_owned(),
                        password: String::from_utf8_lossy(&p).into_owned(),
                    },
                    _ => {
                        io.write_line("501 5.5.2 Cannot decode credentials").await?;
                        return Ok(());
                    }
                }
            }
            _ => {
                io.write_line("504 5.5.4 Mechanism not supported").await?;
                return Ok(());
            }
        };

        match self
            .core
            .auth
            .authenticate(&credentials.authcid, &credentials.password)
            .await
        {
            Ok(user) => {
                tracing::info!(user = %credentials.authcid, addr = %self.remote_addr, "smtp.authenticated");
                self.authenticated = Some(user);
                io.write_line("235 2.7.0 Authentication successful").await?;
            }
            Err(e) => {
                match &e {
                    AuthError::Disabled => {
                        tracing::warn!(user = %credentials.authcid, addr = %self.remote_addr, "login to disabled account")
                    }
                    _ => {
                        tracing::info!(user = %credentials.authcid, addr = %self.remote_addr, "authentication failed")
                    }
                }
                io.write_line("535 5.7.8 Authentication credentials invalid")
                    .await?;
            }
        }
        Ok(())
    }

    async fn mail(&mut self, io: &mut LineIo, rest: &str) -> Result<()> {
        if self.mode.requires_auth() && self.authenticated.is_none() {
            io.write_line("530 5.7.0 Authentication required").await?;
            return Ok(());
        }
        if self.sender.is_some() {
            io.write_line("503 5.5.1 Nested MAIL command").await?;
            return Ok(());
        }
        let (path, params) = match parse_path(rest, "FROM:") {
            Some(v) => v,
            None => {
                io.write_line("501 5.5.2 Syntax: MAIL FROM:<address>").await?;
                return Ok(());
            }
        };
        if !path.is_empty() && Address::from_str(&path).is_err() {
            io.write_line("501 5.1.7 Bad sender address syntax").await?;
            return Ok(());
        }
        for param in params {
            if let Some(size) = param.to_uppercase().strip_prefix("SIZE=").and_then(|s| s.parse::<usize>().ok()) {
                if size > self.core.config.smtp.max_message_size {
                    io.write_line("552 5.3.4 Message size exceeds fixed limit")
                        .await?;
                    return Ok(());
                }
            }
        }

        if let Some(user) = &self.authenticated {
            let own = user.address().to_string();
            if !path.is_empty() && !path.eq_ignore_ascii_case(&own) {
                tracing::warn!(
                    user = %own,
                    mail_from = %path,
                    "authenticated sender differs from MAIL FROM"
                );
            }
        }

        self.sender = Some(path.to_lowercase());
        io.write_line("250 2.1.0 Ok").await?;
        Ok(())
    }

    async fn rcpt(&mut self, io: &mut LineIo, rest: &str) -> Result<()> {
        if self.sender.is_none() {
            io.write_line("503 5.5.1 Need MAIL command first").await?;
            return Ok(());
        }
        if self.recipients.len() >= MAX_RECIPIENTS {
            io.write_line("452 4.5.3 Too many recipients").await?;
            return Ok(());
        }
        let (path, _params) = match parse_path(rest, "TO:") {
            Some(v) => v,
            None => {
                io.write_line("501 5.5.2 Syntax: RCPT TO:<address>").await?;
                return Ok(());
            }
        };
        let address = match Address::from_str(&path) {
            Ok(a) => a,
            Err(_) => {
                io.write_line("501 5.1.3 Bad recipient address syntax")
                    .await?;
                return Ok(());
            }
        };

        // MX mode only accepts recipients we actually host; submission
        // relays for anyone syntactically valid.
        if self.mode == SmtpMode::Mx {
            let domain_local = match self.core.auth.is_local_domain(&address.domain).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(err = %e, "recipient domain lookup failed");
                    io.write_line("451 4.3.0 Temporary lookup failure").await?;
                    return Ok(());
                }
            };
            if !domain_local {
                io.write_line("550 5.7.1 Relay access denied").await?;
                return Ok(());
            }
            match self.core.auth.validate_local_recipient(&address).await {
                Ok(true) => {}
                Ok(false) => {
                    io.write_line("550 5.1.1 Recipient address unknown").await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(err = %e, "recipient lookup failed");
                    io.write_line("451 4.3.0 Temporary lookup failure").await?;
                    return Ok(());
                }
            }
        }

        self.recipients.push(address);
        io.write_line("250 2.1.5 Ok").await?;
        Ok(())
    }

    async fn data(&mut self, io: &mut LineIo) -> Result<()> {
        if self.recipients.is_empty() {
            io.write_line("503 5.5.1 Need RCPT command first").await?;
            return Ok(());
        }
        io.write_line("354 End data with <CR><LF>.<CR><LF>").await?;

        let max = self.core.config.smtp.max_message_size;
        let body = io.read_data(max).await?;
        let body = match body {
            DataRead::Complete(body) => body,
            DataRead::TooLarge => {
                io.write_line("552 5.3.4 Message too big for system").await?;
                self.reset_transaction();
                return Ok(());
            }
        };

        let sender = self.sender.take().unwrap_or_default();
        let recipients = std::mem::take(&mut self.recipients);

        let mut data = self.received_header(&sender);
        data.extend_from_slice(&body);

        match self.dispatch(&sender, &recipients, &data).await {
            Ok(true) => io.write_line("250 2.0.0 Ok: message accepted").await?,
            Ok(false) => {
                io.write_line("451 4.3.0 Message could not be delivered")
                    .await?
            }
            Err(e) => {
                tracing::error!(err = %e, "message dispatch failed");
                io.write_line("451 4.3.0 Local processing error").await?;
            }
        }
        Ok(())
    }

    /// Routes an accepted message: sieve + store for local recipients,
    /// the outbound queue per remote domain. 250 as long as anything
    /// was handled; the rest is covered by bounces.
    async fn dispatch(
        &mut self,
        sender: &str,
        recipients: &[Address],
        data: &[u8],
    ) -> Result<bool> {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for rcpt in recipients {
            if self.core.auth.is_local_domain(&rcpt.domain).await? {
                local.push(rcpt.clone());
            } else {
                remote.push(rcpt.clone());
            }
        }

        let mut any_ok = false;
        for rcpt in &local {
            match self.core.local.deliver(sender, rcpt, data).await {
                Ok(()) => any_ok = true,
                Err(DeliveryError::NoSuchUser(addr)) => {
                    tracing::info!(rcpt = %addr, "local recipient vanished after RCPT");
                }
                Err(DeliveryError::OverQuota) => {
                    tracing::info!(rcpt = %rcpt, "recipient over quota");
                }
                Err(DeliveryError::Internal(e)) => {
                    tracing::error!(rcpt = %rcpt, err = %e, "local delivery failed");
                }
            }
        }

        if !remote.is_empty() {
            self.core.engine.enqueue(sender, &remote, data).await?;
            any_ok = true;
        }

        if let Some(user) = &self.authenticated {
            if let Err(e) = self.core.local.save_sent_copy(user, data).await {
                tracing::warn!(user = %user.address(), err = %e, "could not store Sent copy");
            }
        }

        Ok(any_ok)
    }

    fn received_header(&self, _sender: &str) -> Vec<u8> {
        let helo = self.helo.as_deref().unwrap_or("unknown");
        let with = if self.tls_active { "ESMTPS" } else { "ESMTP" };
        format!(
            "Received: from {} ({})\r\n\tby {} with {}; {}\r\n",
            helo,
            self.remote_addr.ip(),
            self.core.config.hostname,
            with,
            chrono::Utc::now().to_rfc2822(),
        )
        .into_bytes()
    }

    fn reset_transaction(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

fn split_verb(line: &str) -> (String, &str) {
    match line.find(' ') {
        Some(idx) => (line[..idx].to_uppercase(), &line[idx + 1..]),
        None => (line.to_uppercase(), ""),
    }
}

/// Parses `FROM:<alice@example.com> SIZE=123` into the path and the
/// ESMTP parameters.
fn parse_path(rest: &str, keyword: &str) -> Option<(String, Vec<String>)> {
    let rest = rest.trim();
    if rest.len() < keyword.len() || !rest[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = rest[keyword.len()..].trim_start();
    let (path, tail) = if let Some(stripped) = rest.strip_prefix('<') {
        let close = stripped.find('>')?;
        (&stripped[..close], &stripped[close + 1..])
    } else {
        // tolerate a missing angle bracket pair
        match rest.find(' ') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        }
    };
    let params = tail
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    Some((path.trim().to_string(), params))
}

// ---- line-oriented I/O with deadlines ----

enum DataRead {
    Complete(Vec<u8>),
    TooLarge,
}

struct LineIo {
    stream: AnyStream,
    buf: Vec<u8>,
    timeout: Duration,
}

impl LineIo {
    fn new(stream: AnyStream, timeout: Duration) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            timeout,
        }
    }

    /// Any bytes pipelined before a STARTTLS upgrade are dropped.
    fn take_stream(&mut self) -> AnyStream {
        self.buf.clear();
        std::mem::replace(&mut self.stream, AnyStream::new(tokio::io::empty()))
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut wire = line.as_bytes().to_vec();
        wire.extend_from_slice(b"\r\n");
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    /// One CRLF-terminated line without its terminator; `None` at EOF.
    async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=idx).collect();
                let line = String::from_utf8_lossy(&raw);
                return Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()));
            }
            if self.buf.len() > MAX_LINE {
                anyhow::bail!("command line too long");
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// The DATA payload up to the lone-dot terminator, unstuffed. Overflow
    /// keeps consuming so the 552 lands on a clean transcript.
    async fn read_data(&mut self, max: usize) -> Result<DataRead> {
        let mut out: Vec<u8> = Vec::new();
        let mut too_large = false;
        loop {
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=idx).collect();
                let line = raw.strip_suffix(b"\n").unwrap_or(&raw);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line == b"." {
                    return Ok(if too_large {
                        DataRead::TooLarge
                    } else {
                        DataRead::Complete(out)
                    });
                }
                if !too_large {
                    let line = line.strip_prefix(b".").unwrap_or(line);
                    out.extend_from_slice(line);
                    out.extend_from_slice(b"\r\n");
                    if out.len() > max {
                        too_large = true;
                        out.clear();
                    }
                }
                continue;
            }
            if self.buf.len() > max.saturating_add(MAX_LINE) {
                // a single unterminated line cannot hold the buffer hostage
                too_large = true;
                self.buf.clear();
            }
            if !self.fill().await? {
                anyhow::bail!("connection closed during DATA");
            }
        }
    }

    async fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 8192];
        let n = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk))
            .await
            .context("connection idle timeout")??;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_splitting() {
        assert_eq!(split_verb("mail FROM:<a@b.c>").0, "MAIL");
        assert_eq!(split_verb("QUIT").0, "QUIT");
    }

    #[test]
    fn path_parsing() {
        let (path, params) = parse_path("FROM:<alice@example.com> SIZE=42 BODY=8BITMIME", "FROM:").unwrap();
        assert_eq!(path, "alice@example.com");
        assert_eq!(params, vec!["SIZE=42".to_string(), "BODY=8BITMIME".to_string()]);

        let (path, params) = parse_path("from:<>", "FROM:").unwrap();
        assert_eq!(path, "");
        assert!(params.is_empty());

        let (path, _) = parse_path("TO:<bob@example.com>", "TO:").unwrap();
        assert_eq!(path, "bob@example.com");

        assert!(parse_path("TO:<unterminated", "TO:").is_none());
        assert!(parse_path("RANDOM", "TO:").is_none());
    }
}
