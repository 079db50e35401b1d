//! Local delivery: the path a message takes once SMTP has accepted it
//! for a user served here. Runs the recipient's active sieve script,
//! appends into the right mailboxes, wakes IDLE trackers (via the
//! store), and produces vacation replies and sieve rejections.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use paq_mail::flags::{FlagSet, FLAG_SEEN};
use paq_mail::store::MailStore;
use paq_sieve::{evaluate, parse, SieveMessage};
use paq_transport::bounce::{build_bounce, should_bounce, BounceInput};
use paq_transport::engine::{DeliveryEngine, LocalSink};
use paq_user::address::Address;
use paq_user::config::Config;
use paq_user::directory::Directory;
use paq_user::login::Authenticator;
use paq_user::model::{AliasTarget, User, SPECIAL_USE_SENT};

const DEFAULT_VACATION_DAYS: u32 = 7;
/// One redirect hop; a loop between two local scripts stops here.
const MAX_REDIRECT_DEPTH: usize = 1;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("no mailbox here for {0}")]
    NoSuchUser(String),
    #[error("mailbox is over quota")]
    OverQuota,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct LocalDelivery {
    config: Arc<Config>,
    directory: Arc<Directory>,
    auth: Authenticator,
    store: Arc<MailStore>,
    engine: OnceLock<Arc<DeliveryEngine>>,
}

impl LocalDelivery {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<Directory>,
        auth: Authenticator,
        store: Arc<MailStore>,
    ) -> Self {
        Self {
            config,
            directory,
            auth,
            store,
            engine: OnceLock::new(),
        }
    }

    /// The engine is built after the sink it needs; wired in once at
    /// startup.
    pub fn set_engine(&self, engine: Arc<DeliveryEngine>) {
        let _ = self.engine.set(engine);
    }

    pub async fn deliver(
        &self,
        sender: &str,
        recipient: &Address,
        data: &[u8],
    ) -> Result<(), DeliveryError> {
        self.deliver_inner(sender, recipient, data, 0).await
    }

    async fn deliver_inner(
        &self,
        sender: &str,
        recipient: &Address,
        data: &[u8],
        depth: usize,
    ) -> Result<(), DeliveryError> {
        let user = match self.directory.user_by_address(recipient).await? {
            Some(user) if user.active => user,
            _ => match self.directory.resolve_alias(recipient).await? {
                Some(AliasTarget::User(id)) => match self.directory.user_by_id(id).await? {
                    Some(user) if user.active => user,
                    _ => return Err(DeliveryError::NoSuchUser(recipient.to_string())),
                },
                Some(AliasTarget::External(target)) => {
                    // forwarding alias: back out through the queue
                    let target: Address = target
                        .parse()
                        .with_context(|| format!("alias target {:?}", target))?;
                    tracing::info!(alias = %recipient, target = %target, "forwarding via alias");
                    self.send_outbound(sender, &target, data).await?;
                    return Ok(());
                }
                None => return Err(DeliveryError::NoSuchUser(recipient.to_string())),
            },
        };

        if !MailStore::within_quota(&user, data.len() as i64) {
            return Err(DeliveryError::OverQuota);
        }

        let message = SieveMessage::parse(sender, &recipient.to_string(), data);
        let outcome = match self.directory.active_sieve_script(user.id).await? {
            Some(script) => match parse(&script.source) {
                Ok(parsed) => evaluate(&parsed, &message),
                Err(e) => {
                    tracing::warn!(user = %recipient, script = %script.name, err = %e,
                        "active sieve script does not parse, delivering to INBOX");
                    Default::default()
                }
            },
            None => Default::default(),
        };

        if let Some(reason) = outcome.reject_reason() {
            tracing::info!(user = %recipient, "sieve rejected message");
            self.send_rejection(sender, recipient, reason, data).await;
            return Ok(());
        }

        let mut delivered = false;
        for mailbox in outcome.file_into() {
            self.append_to(&user, mailbox, data).await?;
            delivered = true;
        }
        for target in outcome.redirects() {
            if depth >= MAX_REDIRECT_DEPTH {
                tracing::warn!(user = %recipient, target = %target, "redirect depth exceeded");
                continue;
            }
            match Address::from_str(target) {
                Ok(addr) => {
                    if self.auth.is_local_domain(&addr.domain).await? {
                        Box::pin(self.deliver_inner(sender, &addr, data, depth + 1)).await?;
                    } else {
                        self.send_outbound(sender, &addr, data).await?;
                    }
                }
                Err(e) => {
                    tracing::warn!(target = %target, err = %e, "unusable redirect target")
                }
            }
            delivered = true;
        }
        if outcome.is_discarded() {
            tracing::debug!(user = %recipient, "sieve discarded message");
            delivered = true;
        }
        if outcome.delivers_to_inbox() || !delivered {
            self.append_to(&user, paq_user::directory::INBOX, data).await?;
        }

        if let Some((days, subject, text)) = outcome.vacation() {
            self.maybe_send_vacation(&user, &message, *days, subject.as_deref(), text)
                .await;
        }

        Ok(())
    }

    async fn append_to(&self, user: &User, mailbox: &str, data: &[u8]) -> Result<()> {
        let handle = match self.store.open_mailbox(user.id, mailbox).await? {
            Some(handle) => handle,
            None => {
                // fileinto targets are created on demand
                let row = self.store.create_mailbox(user.id, mailbox).await?;
                self.store.open_row(row)
            }
        };
        handle
            .append(data, &FlagSet::new(), None, true)
            .await
            .with_context(|| format!("appending to {}", mailbox))?;
        tracing::info!(user_id = user.id, mailbox = %mailbox, size = data.len(), "delivered");
        Ok(())
    }

    /// The submitter's own copy, stored read: already seen, not recent.
    pub async fn save_sent_copy(&self, user: &User, data: &[u8]) -> Result<()> {
        let row = self
            .directory
            .mailbox_with_special_use(user.id, SPECIAL_USE_SENT)
            .await?
            .context("user has no Sent mailbox")?;
        let handle = self.store.open_row(row);
        let mut flags = FlagSet::new();
        flags.insert(FLAG_SEEN);
        handle.append(data, &flags, None, false).await?;
        Ok(())
    }

    async fn send_outbound(&self, sender: &str, target: &Address, data: &[u8]) -> Result<()> {
        let engine = self
            .engine
            .get()
            .context("delivery engine not wired up yet")?;
        engine.enqueue(sender, &[target.clone()], data).await
    }

    /// A sieve `reject` answers the sender with a DSN-style refusal.
    async fn send_rejection(&self, sender: &str, recipient: &Address, reason: &str, data: &[u8]) {
        if !should_bounce(sender) {
            return;
        }
        let text = format!("5.7.1 Message rejected: {}", reason);
        let bounce = build_bounce(&BounceInput {
            hostname: &self.config.hostname,
            original_sender: sender,
            failed_recipients: &[recipient.to_string()],
            reply_code: 550,
            reply_text: &text,
            original_message: data,
        });
        if let Err(e) = self.route_to_sender("", sender, &bounce).await {
            tracing::error!(err = %e, "could not send sieve rejection");
        }
    }

    async fn maybe_send_vacation(
        &self,
        user: &User,
        message: &SieveMessage,
        days: Option<u32>,
        subject: Option<&str>,
        text: &str,
    ) {
        if message.is_automated() {
            tracing::debug!(sender = %message.sender, "vacation suppressed for automated mail");
            return;
        }
        let days = days.unwrap_or(DEFAULT_VACATION_DAYS).max(1);
        match self
            .directory
            .vacation_try_record(user.id, &message.sender, days)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(sender = %message.sender, "vacation already sent recently");
                return;
            }
            Err(e) => {
                tracing::error!(err = %e, "vacation bookkeeping failed");
                return;
            }
        }

        let reply = self.render_vacation(user, message, subject, text);
        if let Err(e) = self
            .route_to_sender(&user.address().to_string(), &message.sender, &reply)
            .await
        {
            tracing::error!(err = %e, "could not send vacation reply");
        }
    }

    fn render_vacation(
        &self,
        user: &User,
        message: &SieveMessage,
        subject: Option<&str>,
        text: &str,
    ) -> Vec<u8> {
        let original_subject = message
            .header_values("Subject")
            .first()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let subject = match subject {
            Some(s) => s.to_string(),
            None => format!("Auto: {}", original_subject),
        };
        let mut out = String::new();
        out.push_str(&format!(
            "From: {} <{}>\r\n",
            user.display_name,
            user.address()
        ));
        out.push_str(&format!("To: {}\r\n", message.sender));
        out.push_str(&format!("Subject: {}\r\n", subject.trim()));
        out.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
        out.push_str(&format!(
            "Message-ID: <{}.vacation@{}>\r\n",
            paq_transport::queue::gen_message_id(),
            self.config.hostname
        ));
        if let Some(orig_id) = message.header_values("Message-ID").first() {
            let orig_id = if orig_id.starts_with('<') {
                orig_id.to_string()
            } else {
                format!("<{}>", orig_id)
            };
            out.push_str(&format!("In-Reply-To: {}\r\n", orig_id));
            out.push_str(&format!("References: {}\r\n", orig_id));
        }
        out.push_str("Auto-Submitted: auto-replied\r\n");
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("\r\n");
        for line in text.lines() {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.into_bytes()
    }

    /// Routes an automatically generated message to `target`: straight
    /// into a local mailbox when the domain is ours, queued otherwise.
    async fn route_to_sender(&self, from: &str, target: &str, data: &[u8]) -> Result<()> {
        let addr: Address = target.parse().context("unparsable return address")?;
        if self.auth.is_local_domain(&addr.domain).await? {
            Box::pin(self.deliver(from, &addr, data))
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            return Ok(());
        }
        self.send_outbound(from, &addr, data).await
    }
}

#[async_trait]
impl LocalSink for LocalDelivery {
    async fn is_local_domain(&self, domain: &str) -> bool {
        self.auth.is_local_domain(domain).await.unwrap_or(false)
    }

    async fn deliver_local(&self, sender: &str, recipient: &Address, data: &[u8]) -> Result<()> {
        self.deliver(sender, recipient, data)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
    }
}
