//! The delivery engine: a worker pool draining the durable queue.
//!
//! Each worker claims a ready entry, consults the destination domain's
//! circuit breaker, signs, resolves MX, walks hosts and addresses until
//! one accepts, then classifies the outcome into complete / retry /
//! fail-with-bounce.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;

use paq_user::address::Address;

use crate::bounce::{build_bounce, should_bounce, BounceInput};
use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitError};
use crate::client::{self, ClientConfig, SendError};
use crate::dkim::SignerPool;
use crate::mx::MxResolver;
use crate::queue::{gen_message_id, Queue, QueueError, QueuedMessage, RetryDecision};

const IDLE_SLEEP: Duration = Duration::from_millis(500);
const RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STALE_THRESHOLD: Duration = Duration::from_secs(10 * 60);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const SMTP_PORT: u16 = 25;

/// The seam back into the inbound side: bounces for local senders are
/// delivered locally instead of being queued outward.
#[async_trait]
pub trait LocalSink: Send + Sync {
    async fn is_local_domain(&self, domain: &str) -> bool;
    async fn deliver_local(&self, sender: &str, recipient: &Address, data: &[u8]) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub hostname: String,
    pub queue_dir: PathBuf,
    pub workers: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub skip_tls_verify: bool,
}

pub struct DeliveryEngine {
    config: EngineConfig,
    queue: Arc<Queue>,
    breakers: BreakerRegistry,
    resolver: MxResolver,
    signers: Arc<SignerPool>,
    local: Arc<dyn LocalSink>,
}

impl DeliveryEngine {
    pub fn new(
        config: EngineConfig,
        queue: Arc<Queue>,
        signers: Arc<SignerPool>,
        local: Arc<dyn LocalSink>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            queue,
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            resolver: MxResolver::new()?,
            signers,
            local,
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Spools the message and enqueues one entry per recipient domain.
    pub async fn enqueue(&self, sender: &str, recipients: &[Address], data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.queue_dir).await?;

        let mut by_domain: Vec<(String, Vec<String>)> = Vec::new();
        for rcpt in recipients {
            match by_domain.iter_mut().find(|(d, _)| *d == rcpt.domain) {
                Some((_, list)) => list.push(rcpt.to_string()),
                None => by_domain.push((rcpt.domain.clone(), vec![rcpt.to_string()])),
            }
        }

        for (domain, rcpts) in by_domain {
            let spool = self
                .config
                .queue_dir
                .join(format!("{}.eml", gen_message_id()));
            tokio::fs::write(&spool, data)
                .await
                .with_context(|| format!("spooling {}", spool.display()))?;
            let msg = QueuedMessage::new(sender, rcpts, &domain, spool, data.len() as i64);
            tracing::info!(id = %msg.id, domain = %domain, "queued outbound message");
            self.queue.enqueue(msg).await?;
        }
        Ok(())
    }

    /// Runs workers plus the recovery and archive-purge timers until
    /// shutdown; in-flight attempts finish, no new ones start.
    pub async fn run(self: Arc<Self>, must_exit: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = Vec::new();
        for n in 0..self.config.workers.max(1) {
            let engine = self.clone();
            let exit = must_exit.clone();
            tasks.push(tokio::spawn(async move { engine.worker_loop(n, exit).await }));
        }
        {
            let engine = self.clone();
            let exit = must_exit.clone();
            tasks.push(tokio::spawn(async move { engine.maintenance_loop(exit).await }));
        }
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("delivery engine stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, mut must_exit: watch::Receiver<bool>) {
        tracing::debug!(worker, "delivery worker started");
        while !*must_exit.borrow() {
            let claimed = match self.queue.dequeue().await {
                Ok(v) => v,
                Err(QueueError::Closed) => break,
                Err(e) => {
                    tracing::error!(worker, err = %e, "queue dequeue failed");
                    tokio::time::sleep(IDLE_SLEEP).await;
                    continue;
                }
            };
            match claimed {
                Some(msg) => self.process(msg).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                        _ = must_exit.changed() => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "delivery worker exiting");
    }

    async fn maintenance_loop(&self, mut must_exit: watch::Receiver<bool>) {
        let mut recovery = tokio::time::interval(RECOVERY_INTERVAL);
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = recovery.tick() => {
                    match self.queue.recover_stale(STALE_THRESHOLD).await {
                        Ok(0) | Err(QueueError::Closed) => {}
                        Ok(n) => tracing::warn!(count = n, "recovered stale queue entries"),
                        Err(e) => tracing::error!(err = %e, "stale recovery failed"),
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.queue.purge_expired().await {
                        if !matches!(e, QueueError::Closed) {
                            tracing::error!(err = %e, "archive purge failed");
                        }
                    }
                }
                _ = must_exit.changed() => {
                    if *must_exit.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, msg: QueuedMessage) {
        let breaker = self.breakers.get(&msg.domain);
        let result = breaker.execute(self.attempt(&msg), |_| true).await;

        match result {
            Ok(outcome) => {
                tracing::info!(
                    id = %msg.id,
                    domain = %msg.domain,
                    accepted = outcome.accepted.len(),
                    "delivery complete"
                );
                // partially refused recipients are covered by a bounce
                if !outcome.rejected.is_empty() {
                    let (rejected, reply): (Vec<String>, _) = (
                        outcome.rejected.iter().map(|(r, _)| r.clone()).collect(),
                        outcome.rejected[0].1.clone(),
                    );
                    self.emit_bounce(&msg, &rejected, reply.code, &reply.text())
                        .await;
                }
                if let Err(e) = self.queue.complete(&msg.id).await {
                    tracing::error!(id = %msg.id, err = %e, "could not complete queue entry");
                }
                self.remove_spool(&msg.message_path).await;
            }
            Err(CircuitError::Open) => {
                tracing::debug!(id = %msg.id, domain = %msg.domain, "circuit open, deferring");
                self.retry_or_fail(&msg, "circuit breaker open", None).await;
            }
            Err(CircuitError::Timeout) => {
                self.retry_or_fail(&msg, "delivery attempt timed out", None)
                    .await;
            }
            Err(CircuitError::Inner(err)) => {
                let permanent = err
                    .downcast_ref::<SendError>()
                    .map(SendError::is_permanent)
                    .unwrap_or(false);
                if permanent {
                    let code = err
                        .downcast_ref::<SendError>()
                        .and_then(SendError::reply_code)
                        .unwrap_or(554);
                    tracing::info!(id = %msg.id, err = %err, "permanent failure");
                    self.emit_bounce(&msg, &msg.recipients, code, &err.to_string())
                        .await;
                    if let Err(e) = self.queue.fail(&msg.id, &err.to_string(), true).await {
                        tracing::error!(id = %msg.id, err = %e, "could not fail queue entry");
                    }
                    self.remove_spool(&msg.message_path).await;
                } else {
                    self.retry_or_fail(&msg, &err.to_string(), None).await;
                }
            }
        }
    }

    /// One delivery attempt: read spool, sign, resolve, walk MX hosts
    /// and their addresses in order. The first accepting host wins;
    /// permanent peer verdicts stop the walk.
    async fn attempt(&self, msg: &QueuedMessage) -> Result<client::DeliveryOutcome> {
        let data = tokio::fs::read(&msg.message_path)
            .await
            .with_context(|| format!("reading spool {}", msg.message_path.display()))?;

        let sender_domain = msg.sender.rsplit('@').next().unwrap_or("");
        let signed: Vec<u8> = match self.signers.sign(sender_domain, &data) {
            Some(header) => {
                let mut out = Vec::with_capacity(header.len() + data.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(&data);
                out
            }
            None => data,
        };

        let hosts = self.resolver.lookup_with_fallback(&msg.domain).await?;
        if hosts.is_empty() {
            return Err(anyhow!("no MX host for {} resolves", msg.domain));
        }

        let client_config = ClientConfig {
            helo_hostname: self.config.hostname.clone(),
            connect_timeout: self.config.connect_timeout,
            command_timeout: self.config.command_timeout,
            skip_tls_verify: self.config.skip_tls_verify,
        };

        let mut last_err: Option<SendError> = None;
        for host in &hosts {
            for addr in &host.addrs {
                tracing::debug!(id = %msg.id, host = %host.host, ip = %addr, "dialing");
                match client::deliver(
                    &client_config,
                    *addr,
                    SMTP_PORT,
                    &host.host,
                    &msg.sender,
                    &msg.recipients,
                    &signed,
                )
                .await
                {
                    Ok(outcome) => return Ok(outcome),
                    Err(e) if e.is_permanent() => return Err(e.into()),
                    Err(e) => {
                        tracing::debug!(id = %msg.id, host = %host.host, err = %e, "attempt failed");
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("no address reachable for {}", msg.domain)))
    }

    async fn retry_or_fail(&self, msg: &QueuedMessage, error: &str, code: Option<u16>) {
        match self.queue.retry(&msg.id, error).await {
            Ok(RetryDecision::Deferred { next_attempt }) => {
                tracing::info!(
                    id = %msg.id,
                    domain = %msg.domain,
                    attempts = msg.attempts,
                    next_attempt,
                    "delivery deferred"
                );
            }
            Ok(RetryDecision::Failed) => {
                tracing::warn!(id = %msg.id, domain = %msg.domain, "retries exhausted");
                self.emit_bounce(msg, &msg.recipients, code.unwrap_or(451), error)
                    .await;
                self.remove_spool(&msg.message_path).await;
            }
            Err(e) => {
                tracing::error!(id = %msg.id, err = %e, "could not reschedule queue entry");
            }
        }
    }

    /// Builds the DSN and routes it back to the original sender, unless
    /// the sender is one we never bounce to.
    async fn emit_bounce(&self, msg: &QueuedMessage, recipients: &[String], code: u16, text: &str) {
        if !should_bounce(&msg.sender) {
            tracing::debug!(id = %msg.id, sender = %msg.sender, "bounce suppressed");
            return;
        }
        let original = tokio::fs::read(&msg.message_path).await.unwrap_or_default();
        let bounce = build_bounce(&BounceInput {
            hostname: &self.config.hostname,
            original_sender: &msg.sender,
            failed_recipients: recipients,
            reply_code: code,
            reply_text: text,
            original_message: &original,
        });

        let sender_addr: Address = match msg.sender.parse() {
            Ok(a) => a,
            Err(_) => return,
        };
        if self.local.is_local_domain(&sender_addr.domain).await {
            if let Err(e) = self
                .local
                .deliver_local("", &sender_addr, &bounce)
                .await
            {
                tracing::error!(id = %msg.id, err = %e, "local bounce delivery failed");
            }
            return;
        }
        // remote sender: the bounce rides the normal outbound path with
        // a null reverse-path so it can never bounce again
        let spool = self
            .config
            .queue_dir
            .join(format!("{}.eml", gen_message_id()));
        if let Err(e) = tokio::fs::write(&spool, &bounce).await {
            tracing::error!(id = %msg.id, err = %e, "could not spool bounce");
            return;
        }
        let entry = QueuedMessage::new(
            "",
            vec![sender_addr.to_string()],
            &sender_addr.domain,
            spool,
            bounce.len() as i64,
        );
        if let Err(e) = self.queue.enqueue(entry).await {
            tracing::error!(id = %msg.id, err = %e, "could not enqueue bounce");
        }
    }

    /// Spool files are only ever deleted underneath the queue directory.
    async fn remove_spool(&self, path: &Path) {
        if !path.starts_with(&self.config.queue_dir) {
            tracing::warn!(path = %path.display(), "refusing to delete file outside queue dir");
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), err = %e, "could not remove spool file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::queue::{now_nanos, Status};

    const ORIGINAL: &[u8] =
        b"Subject: weekly numbers\r\nFrom: sender@far.test\r\nTo: user@other.test\r\n\r\nbody\r\n";

    /// Records local deliveries instead of touching a mail store.
    struct RecordingSink {
        local_domains: Vec<String>,
        deliveries: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl LocalSink for RecordingSink {
        async fn is_local_domain(&self, domain: &str) -> bool {
            self.local_domains.iter().any(|d| d == domain)
        }

        async fn deliver_local(
            &self,
            sender: &str,
            recipient: &Address,
            data: &[u8],
        ) -> Result<()> {
            self.deliveries.lock().unwrap().push((
                sender.to_string(),
                recipient.to_string(),
                data.to_vec(),
            ));
            Ok(())
        }
    }

    struct Fixture {
        engine: Arc<DeliveryEngine>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(name: &str, local_domains: &[&str]) -> Fixture {
        let base = std::env::temp_dir().join(format!(
            "paq-engine-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(base.join("queue")).unwrap();

        let queue = Arc::new(Queue::open(&base.join("queue.db")).unwrap());
        let sink = Arc::new(RecordingSink {
            local_domains: local_domains.iter().map(|d| d.to_string()).collect(),
            deliveries: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(
            DeliveryEngine::new(
                EngineConfig {
                    hostname: "mail.example.com".into(),
                    queue_dir: base.join("queue"),
                    workers: 1,
                    connect_timeout: Duration::from_secs(2),
                    command_timeout: Duration::from_secs(2),
                    skip_tls_verify: false,
                },
                queue,
                Arc::new(SignerPool::new()),
                sink.clone(),
            )
            .unwrap(),
        );
        Fixture { engine, sink }
    }

    async fn enqueue_one(fx: &Fixture, sender: &str, rcpt: &str) -> QueuedMessage {
        let rcpt: Address = rcpt.parse().unwrap();
        fx.engine.enqueue(sender, &[rcpt], ORIGINAL).await.unwrap();
        fx.engine.queue().dequeue().await.unwrap().unwrap()
    }

    fn assert_backoff_around(entry: &QueuedMessage, base_secs: i64) {
        let delay = entry.next_attempt - now_nanos();
        let base = Duration::from_secs(base_secs as u64).as_nanos() as i64;
        assert!(
            delay > base * 80 / 100 && delay < base * 115 / 100,
            "delay {}ns is not within ±10% of {}s",
            delay,
            base_secs
        );
    }

    /// `.test` never resolves (RFC 6761), so the first attempt fails as
    /// temporary and the entry is deferred on the first backoff step.
    #[tokio::test]
    async fn unresolvable_domain_defers_with_backoff() {
        let fx = fixture("defer", &[]);
        let claimed = enqueue_one(&fx, "alice@example.com", "user@paquebot-invalid.test").await;
        assert_eq!(claimed.attempts, 1);

        fx.engine.process(claimed.clone()).await;

        let entry = fx.engine.queue().get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, Status::Deferred);
        assert_backoff_around(&entry, 300);
        // the spool stays for the retry
        assert!(entry.message_path.exists());
        assert!(entry.last_error.is_some());
    }

    /// A permanently refused message turns into a DSN back to a remote
    /// sender: a fresh pending entry with the null reverse-path.
    #[tokio::test]
    async fn permanent_failure_bounces_to_remote_sender() {
        let fx = fixture("bounce-remote", &[]);
        let claimed = enqueue_one(&fx, "sender@far.test", "user@other.test").await;

        fx.engine
            .emit_bounce(&claimed, &claimed.recipients, 550, "5.1.1 no such user")
            .await;
        fx.engine.queue().fail(&claimed.id, "550 refused", true).await.unwrap();

        let entries = fx.engine.queue().list(10).await.unwrap();
        let bounce = entries
            .iter()
            .find(|e| e.status == Status::Pending)
            .expect("a bounce entry is queued");
        assert_eq!(bounce.sender, "");
        assert_eq!(bounce.recipients, vec!["sender@far.test".to_string()]);
        assert_eq!(bounce.domain, "far.test");

        let body = std::fs::read(&bounce.message_path).unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Subject: Undelivered Mail Returned to Sender"));
        assert!(text.contains("Status: 5.1.1"));
        assert!(text.contains("Final-Recipient: rfc822; user@other.test"));
        assert!(text.contains("Subject: weekly numbers"));

        let original = fx.engine.queue().get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(original.status, Status::Bounced);
        assert!(fx.sink.deliveries.lock().unwrap().is_empty());
    }

    /// A sender on a domain we host gets the DSN straight into their
    /// mailbox instead of through the queue.
    #[tokio::test]
    async fn permanent_failure_bounces_locally() {
        let fx = fixture("bounce-local", &["example.com"]);
        let claimed = enqueue_one(&fx, "alice@example.com", "user@other.test").await;

        fx.engine
            .emit_bounce(&claimed, &claimed.recipients, 554, "transaction failed")
            .await;

        let deliveries = fx.sink.deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        let (sender, recipient, body) = &deliveries[0];
        assert_eq!(sender, "");
        assert_eq!(recipient, "alice@example.com");
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("Content-Type: message/delivery-status"));
        assert!(text.contains("Status: 5.7.1"));
    }

    /// Machine senders never get a bounce, in either direction.
    #[tokio::test]
    async fn bounce_suppressed_for_machine_senders() {
        let fx = fixture("bounce-suppressed", &["example.com"]);
        let claimed = enqueue_one(&fx, "MAILER-DAEMON@example.com", "user@other.test").await;

        fx.engine
            .emit_bounce(&claimed, &claimed.recipients, 550, "no such user")
            .await;

        assert!(fx.sink.deliveries.lock().unwrap().is_empty());
        // only the original entry is in the queue
        assert_eq!(fx.engine.queue().list(10).await.unwrap().len(), 1);
    }

    /// A crashed worker's entry comes back to pending with its attempt
    /// counter intact, and the next attempt lands on the second backoff
    /// step.
    #[tokio::test]
    async fn stale_entry_recovers_and_defers_again() {
        let fx = fixture("recover", &[]);
        let claimed = enqueue_one(&fx, "alice@example.com", "user@paquebot-invalid.test").await;

        // the worker "crashes" mid-delivery, 15 minutes ago
        let stale_ts = now_nanos() - Duration::from_secs(15 * 60).as_nanos() as i64;
        fx.engine
            .queue()
            .set_last_attempt(&claimed.id, stale_ts)
            .await
            .unwrap();

        let recovered = fx
            .engine
            .queue()
            .recover_stale(STALE_THRESHOLD)
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        let entry = fx.engine.queue().get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, Status::Pending);
        assert!(entry.next_attempt <= now_nanos());
        assert_eq!(entry.attempts, 1);

        // the next worker pass claims it again and defers on step two
        let reclaimed = fx.engine.queue().dequeue().await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        fx.engine.process(reclaimed.clone()).await;
        let entry = fx.engine.queue().get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, Status::Deferred);
        assert_backoff_around(&entry, 15 * 60);
    }
}
