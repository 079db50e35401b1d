mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::stream::AnyStream;
use crate::Core;

/// What a listener accepts and demands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpMode {
    /// Port 25: anonymous MX traffic for domains served here.
    Mx,
    /// Port 587: authenticated submission, STARTTLS before AUTH when
    /// TLS is configured.
    Submission,
    /// Port 465: submission over implicit TLS.
    SubmissionTls,
}

impl SmtpMode {
    pub fn requires_auth(&self) -> bool {
        !matches!(self, SmtpMode::Mx)
    }
}

pub struct Server {
    bind_addr: SocketAddr,
    mode: SmtpMode,
    core: Arc<Core>,
    tls: Option<TlsAcceptor>,
}

pub fn new(
    bind_addr: SocketAddr,
    mode: SmtpMode,
    core: Arc<Core>,
    tls: Option<TlsAcceptor>,
) -> Server {
    Server {
        bind_addr,
        mode,
        core,
        tls,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(mode = ?self.mode, "SMTP server listening on {}", self.bind_addr);

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
            tracing::debug!(mode = ?self.mode, "SMTP: accepted connection from {}", remote_addr);

            let stream = match (self.mode, self.tls.clone()) {
                (SmtpMode::SubmissionTls, Some(acceptor)) => {
                    match acceptor.accept(socket).await {
                        Ok(tls) => AnyStream::new(tls),
                        Err(e) => {
                            tracing::debug!(err = %e, "TLS accept failed");
                            continue;
                        }
                    }
                }
                (SmtpMode::SubmissionTls, None) => {
                    tracing::error!("implicit-TLS listener without TLS config");
                    continue;
                }
                (_, _) => AnyStream::new(socket),
            };

            let session = session::SmtpSession::new(
                self.core.clone(),
                self.mode,
                self.tls.clone(),
                remote_addr,
                must_exit.clone(),
            );
            connections.push(tokio::spawn(session.run(stream)));
        }
        drop(tcp);

        tracing::info!(mode = ?self.mode, "SMTP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}
