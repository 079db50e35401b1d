mod attributes;
mod capability;
mod command;
mod flags;
mod flow;
mod imf_view;
mod index;
mod mail_view;
mod mailbox_view;
mod response;
mod search;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use imap_codec::decode::{AuthenticateDataDecodeError, CommandDecodeError, Decoder, IdleDoneDecodeError};
use imap_codec::encode::Encoder;
use imap_codec::imap_types::auth::{AuthMechanism, AuthenticateData};
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::{LiteralMode, Tag};
use imap_codec::imap_types::response::{
    Code, CommandContinuationRequest, Greeting, Response as ImapResponse, Status,
};
use imap_codec::imap_types::secret::Secret;
use imap_codec::{AuthenticateDataCodec, CommandCodec, GreetingCodec, IdleDoneCodec, ResponseCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::sasl;
use crate::stream::AnyStream;
use crate::Core;

use capability::ServerCapability;
use response::{Body, Response};
use session::Instance;

/// Commands (including literals) larger than this are refused outright.
const MAX_COMMAND_BYTES: usize = 32 * 1024 * 1024;

pub struct Server {
    bind_addr: SocketAddr,
    core: Arc<Core>,
    capabilities: ServerCapability,
    tls: Option<TlsAcceptor>,
    implicit_tls: bool,
}

pub fn new(bind_addr: SocketAddr, core: Arc<Core>, tls: Option<TlsAcceptor>) -> Server {
    let capabilities = ServerCapability::new(tls.is_some());
    Server {
        bind_addr,
        core,
        capabilities,
        tls,
        implicit_tls: false,
    }
}

pub fn new_tls(bind_addr: SocketAddr, core: Arc<Core>, tls: TlsAcceptor) -> Server {
    Server {
        bind_addr,
        core,
        capabilities: ServerCapability::new(false),
        tls: Some(tls),
        implicit_tls: true,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("IMAP server listening on {}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::debug!("IMAP: accepted connection from {}", remote_addr);

            let stream = if self.implicit_tls {
                let acceptor = self.tls.clone().expect("implicit TLS listener has acceptor");
                match acceptor.accept(socket).await {
                    Ok(tls) => AnyStream::new(tls),
                    Err(e) => {
                        tracing::debug!(err = %e, "TLS accept failed");
                        continue;
                    }
                }
            } else {
                AnyStream::new(socket)
            };

            let netloop = NetLoop {
                core: self.core.clone(),
                remote_addr,
                capabilities: self.capabilities.clone(),
                starttls: if self.implicit_tls { None } else { self.tls.clone() },
                tls_active: self.implicit_tls,
                must_exit: must_exit.clone(),
                stream,
                buf: Vec::new(),
                literal_acked: None,
            };
            connections.push(tokio::spawn(netloop.handler()));
        }
        drop(tcp);

        tracing::info!("IMAP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

enum Flow {
    Continue,
    Close,
}

/// Drives one connection: buffered reads through the command codec
/// (with literal continuations), responses through the response codec,
/// and the special multi-step exchanges (STARTTLS, AUTHENTICATE, IDLE)
/// inline.
struct NetLoop {
    core: Arc<Core>,
    remote_addr: SocketAddr,
    capabilities: ServerCapability,
    starttls: Option<TlsAcceptor>,
    tls_active: bool,
    must_exit: watch::Receiver<bool>,
    stream: AnyStream,
    buf: Vec<u8>,
    /// Buffer length up to which a sync-literal continuation was
    /// already sent, so refilling does not re-ack.
    literal_acked: Option<usize>,
}

impl NetLoop {
    async fn handler(mut self) {
        let addr = self.remote_addr;
        match self.core_loop().await {
            Ok(()) => tracing::debug!(addr = %addr, "IMAP session closed"),
            Err(e) => tracing::debug!(addr = %addr, err = %e, "IMAP session errored"),
        }
    }

    async fn core_loop(&mut self) -> Result<()> {
        let greeting = Greeting::ok(
            Some(Code::Capability(self.capabilities.to_vec())),
            "Paquebot ready",
        )
        .map_err(|e| anyhow::anyhow!("building greeting: {}", e))?;
        let bytes = GreetingCodec::default().encode(&greeting).dump();
        self.stream.write_all(&bytes).await?;

        let mut session = Instance::new(self.core.clone(), self.capabilities.clone());

        loop {
            if *self.must_exit.borrow() {
                self.send_status(Status::bye(None, "Server is being shut down").ok()).await?;
                return Ok(());
            }
            match self.step(&mut session).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    /// Decodes and handles one command (reading more bytes as needed).
    async fn step(&mut self, session: &mut Instance) -> Result<Flow> {
        loop {
            let data = std::mem::take(&mut self.buf);
            enum Decoded<'a> {
                Cmd(&'a [u8], Command<'a>),
                Incomplete,
                Literal { length: u32, mode: LiteralMode },
                Failed,
            }
            let decoded = match CommandCodec::default().decode(&data) {
                Ok((remaining, cmd)) => Decoded::Cmd(remaining, cmd),
                Err(CommandDecodeError::Incomplete) => Decoded::Incomplete,
                Err(CommandDecodeError::LiteralFound { length, mode, .. }) => {
                    Decoded::Literal { length, mode }
                }
                Err(CommandDecodeError::Failed) => Decoded::Failed,
            };

            match decoded {
                Decoded::Cmd(remaining, cmd) => {
                    let consumed = data.len() - remaining.len();
                    let flow = self.handle_command(session, cmd).await;
                    self.buf = data[consumed..].to_vec();
                    self.literal_acked = None;
                    return flow;
                }
                Decoded::Incomplete => {
                    self.buf = data;
                    self.fill().await?;
                }
                Decoded::Literal { length, mode } => {
                    if data.len() + length as usize > MAX_COMMAND_BYTES {
                        self.buf.clear();
                        self.literal_acked = None;
                        self.send_status(Status::bad(None, None, "Literal too large").ok())
                            .await?;
                        // drop the oversized command as it streams in
                        self.discard_line().await?;
                        return Ok(Flow::Continue);
                    }
                    if mode == LiteralMode::Sync && self.literal_acked != Some(data.len()) {
                        let cont = CommandContinuationRequest::basic(None, "OK")
                            .map_err(|e| anyhow::anyhow!("continuation: {}", e))?;
                        let bytes = ResponseCodec::default()
                            .encode(&ImapResponse::CommandContinuationRequest(cont))
                            .dump();
                        self.stream.write_all(&bytes).await?;
                        self.literal_acked = Some(data.len());
                    }
                    self.buf = data;
                    self.fill().await?;
                }
                Decoded::Failed => {
                    self.buf = data;
                    self.literal_acked = None;
                    self.skip_bad_line().await?;
                }
            }
        }
    }

    async fn handle_command(&mut self, session: &mut Instance, cmd: Command<'_>) -> Result<Flow> {
        let tag = cmd.tag.clone();
        match cmd.body {
            CommandBody::StartTLS => self.starttls(&tag).await,
            CommandBody::Authenticate {
                mechanism,
                initial_response,
            } => self.authenticate(session, &tag, mechanism, initial_response).await,
            CommandBody::Idle => self.idle(session, &tag).await,
            _ => {
                let response = session.command(cmd).await;
                let closing = response.is_bye();
                self.send_response(response).await?;
                if closing {
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn starttls(&mut self, tag: &Tag<'_>) -> Result<Flow> {
        let acceptor = match (&self.starttls, self.tls_active) {
            (Some(a), false) => a.clone(),
            _ => {
                self.send_status(Status::no(Some(tag.to_owned_tag()), None, "TLS not available").ok())
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        self.send_status(Status::ok(Some(tag.to_owned_tag()), None, "Begin TLS negotiation").ok())
            .await?;

        // RFC 3207: plaintext pipelined past STARTTLS must be dropped
        self.buf.clear();
        let plain = std::mem::replace(&mut self.stream, AnyStream::new(tokio::io::empty()));
        let tls = acceptor.accept(plain).await.context("TLS handshake")?;
        self.stream = AnyStream::new(tls);
        self.tls_active = true;
        Ok(Flow::Continue)
    }

    async fn authenticate(
        &mut self,
        session: &mut Instance,
        tag: &Tag<'_>,
        mechanism: AuthMechanism<'_>,
        initial_response: Option<Secret<std::borrow::Cow<'_, [u8]>>>,
    ) -> Result<Flow> {
        if mechanism != AuthMechanism::Plain {
            self.send_status(
                Status::no(Some(tag.to_owned_tag()), None, "Mechanism not supported").ok(),
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let payload: Vec<u8> = match initial_response {
            Some(secret) => secret.declassify().to_vec(),
            None => {
                let cont = CommandContinuationRequest::basic(None, "continue")
                    .map_err(|e| anyhow::anyhow!("continuation: {}", e))?;
                let bytes = ResponseCodec::default()
                    .encode(&ImapResponse::CommandContinuationRequest(cont))
                    .dump();
                self.stream.write_all(&bytes).await?;
                match self.read_authenticate_data().await? {
                    Some(data) => data,
                    None => {
                        self.send_status(
                            Status::bad(Some(tag.to_owned_tag()), None, "Authentication cancelled")
                                .ok(),
                        )
                        .await?;
                        return Ok(Flow::Continue);
                    }
                }
            }
        };

        let response = match sasl::decode_plain_raw(&payload) {
            Ok(creds) => session.login(tag, &creds.authcid, &creds.password).await,
            Err(_) => Response::build()
                .tag(tag.to_owned_tag())
                .message("Cannot decode SASL payload")
                .bad()?,
        };
        self.send_response(response).await?;
        Ok(Flow::Continue)
    }

    async fn read_authenticate_data(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let data = std::mem::take(&mut self.buf);
            match AuthenticateDataCodec::default().decode(&data) {
                Ok((remaining, auth_data)) => {
                    let consumed = data.len() - remaining.len();
                    let out = match auth_data {
                        AuthenticateData::Continue(secret) => Some(secret.declassify().to_vec()),
                        AuthenticateData::Cancel => None,
                    };
                    self.buf = data[consumed..].to_vec();
                    return Ok(out);
                }
                Err(AuthenticateDataDecodeError::Incomplete) => {
                    self.buf = data;
                    self.fill().await?;
                }
                Err(AuthenticateDataDecodeError::Failed) => {
                    self.buf = data;
                    self.skip_bad_line().await?;
                    return Ok(None);
                }
            }
        }
    }

    /// RFC 2177: continuation, then unsolicited updates until DONE.
    async fn idle(&mut self, session: &mut Instance, tag: &Tag<'_>) -> Result<Flow> {
        let cont = CommandContinuationRequest::basic(None, "idling")
            .map_err(|e| anyhow::anyhow!("continuation: {}", e))?;
        let bytes = ResponseCodec::default()
            .encode(&ImapResponse::CommandContinuationRequest(cont))
            .dump();
        self.stream.write_all(&bytes).await?;

        let tracker = session.idle_tracker();

        loop {
            // drain any ready DONE before blocking
            let data = std::mem::take(&mut self.buf);
            match IdleDoneCodec::default().decode(&data) {
                Ok((remaining, _done)) => {
                    let consumed = data.len() - remaining.len();
                    self.buf = data[consumed..].to_vec();
                    self.send_status(
                        Status::ok(Some(tag.to_owned_tag()), None, "IDLE terminated").ok(),
                    )
                    .await?;
                    return Ok(Flow::Continue);
                }
                Err(IdleDoneDecodeError::Incomplete) => {
                    self.buf = data;
                }
                Err(IdleDoneDecodeError::Failed) => {
                    self.buf = data;
                    self.skip_bad_line().await?;
                    continue;
                }
            }

            let mut must_exit = self.must_exit.clone();
            match &tracker {
                Some(tracker) => {
                    let notified = tracker.notified();
                    tokio::select! {
                        filled = self.fill() => { filled?; }
                        _ = notified => {
                            for body in session.idle_updates().await {
                                self.send_body(body).await?;
                            }
                        }
                        _ = must_exit.changed() => {
                            self.send_status(Status::bye(None, "Server is being shut down").ok()).await?;
                            return Ok(Flow::Close);
                        }
                    }
                }
                None => {
                    tokio::select! {
                        filled = self.fill() => { filled?; }
                        _ = must_exit.changed() => {
                            self.send_status(Status::bye(None, "Server is being shut down").ok()).await?;
                            return Ok(Flow::Close);
                        }
                    }
                }
            }
        }
    }

    // ---- wire helpers ----

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed by peer");
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Consumes input up to the next line end, reading if necessary.
    async fn discard_line(&mut self) -> Result<()> {
        loop {
            if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
                self.buf.drain(..=idx);
                return Ok(());
            }
            self.buf.clear();
            self.fill().await?;
        }
    }

    async fn skip_bad_line(&mut self) -> Result<()> {
        self.send_status(Status::bad(None, None, "Could not parse command").ok())
            .await?;
        self.discard_line().await
    }

    async fn send_response(&mut self, response: Response<'static>) -> Result<()> {
        for body in response.body {
            self.send_body(body).await?;
        }
        self.send_status(Some(response.completion)).await
    }

    async fn send_body(&mut self, body: Body<'static>) -> Result<()> {
        let wire = match body {
            Body::Data(data) => ResponseCodec::default()
                .encode(&ImapResponse::Data(data))
                .dump(),
            Body::Status(status) => ResponseCodec::default()
                .encode(&ImapResponse::Status(status))
                .dump(),
        };
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    async fn send_status(&mut self, status: Option<Status<'static>>) -> Result<()> {
        let status = match status {
            Some(s) => s,
            None => Status::bad(None, None, "internal error")
                .map_err(|e| anyhow::anyhow!("building status: {}", e))?,
        };
        let wire = ResponseCodec::default()
            .encode(&ImapResponse::Status(status))
            .dump();
        self.stream.write_all(&wire).await?;
        Ok(())
    }
}

/// Owned copy of a borrowed tag.
pub(crate) trait ToOwnedTag {
    fn to_owned_tag(&self) -> Tag<'static>;
}

impl ToOwnedTag for Tag<'_> {
    fn to_owned_tag(&self) -> Tag<'static> {
        Tag::unvalidated(self.as_ref().to_string())
    }
}
