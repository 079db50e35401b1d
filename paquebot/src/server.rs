use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use paq_mail::store::MailStore;
use paq_proto::delivery::LocalDelivery;
use paq_proto::{imap, smtp, tls, Core};
use paq_transport::dkim::SignerPool;
use paq_transport::engine::{DeliveryEngine, EngineConfig};
use paq_transport::queue::Queue;
use paq_user::config::Config;
use paq_user::db::Db;
use paq_user::directory::Directory;
use paq_user::login::Authenticator;
use paq_user::password::hash_password;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Server {
    core: Arc<Core>,
    smtp_servers: Vec<smtp::Server>,
    imap_servers: Vec<imap::Server>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let db = Db::open(&config.data_dir.join("mail.db"))?;
        let directory = Arc::new(Directory::new(db));
        let auth = Authenticator::new(directory.clone());
        let store = Arc::new(MailStore::new(&config.data_dir, directory.clone()));

        bootstrap(&config, &directory, &store).await?;

        let signers = Arc::new(SignerPool::new());
        for domain in directory.list_domains().await? {
            if let Some(key) = &domain.dkim_private_key {
                signers.insert(&domain.name, &domain.dkim_selector, key);
            }
        }

        let local = Arc::new(LocalDelivery::new(
            config.clone(),
            directory.clone(),
            auth.clone(),
            store.clone(),
        ));

        let queue = Arc::new(Queue::open(&config.data_dir.join("queue.db"))?);
        let engine = Arc::new(DeliveryEngine::new(
            EngineConfig {
                hostname: config.hostname.clone(),
                queue_dir: config.data_dir.join("queue"),
                workers: config.delivery.workers,
                connect_timeout: Duration::from_secs(config.delivery.connect_timeout_secs),
                command_timeout: Duration::from_secs(config.delivery.command_timeout_secs),
                skip_tls_verify: config.delivery.skip_tls_verify,
            },
            queue,
            signers,
            local.clone(),
        )?);
        local.set_engine(engine.clone());

        let core = Arc::new(Core {
            config: config.clone(),
            directory,
            auth,
            store,
            local,
            engine,
        });

        let acceptor = match &config.tls {
            Some(tls_config) => Some(tls::acceptor(tls_config)?),
            None => None,
        };

        let mut smtp_servers = Vec::new();
        if let Some(addr) = config.smtp.bind_mx {
            smtp_servers.push(smtp::new(addr, smtp::SmtpMode::Mx, core.clone(), acceptor.clone()));
        }
        if let Some(addr) = config.smtp.bind_submission {
            smtp_servers.push(smtp::new(
                addr,
                smtp::SmtpMode::Submission,
                core.clone(),
                acceptor.clone(),
            ));
        }
        if let Some(addr) = config.smtp.bind_submission_tls {
            smtp_servers.push(smtp::new(
                addr,
                smtp::SmtpMode::SubmissionTls,
                core.clone(),
                acceptor.clone(),
            ));
        }

        let mut imap_servers = Vec::new();
        if let Some(addr) = config.imap.bind {
            imap_servers.push(imap::new(addr, core.clone(), acceptor.clone()));
        }
        if let Some(addr) = config.imap.bind_tls {
            let acceptor = acceptor
                .clone()
                .context("imap.bind_tls requires a [tls] section")?;
            imap_servers.push(imap::new_tls(addr, core.clone(), acceptor));
        }

        Ok(Self {
            core,
            smtp_servers,
            imap_servers,
        })
    }

    pub fn core(&self) -> Arc<Core> {
        self.core.clone()
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(hostname = %self.core.config.hostname, "paquebot starting");

        let (listener_tx, listener_rx) = watch::channel(false);
        let (engine_tx, engine_rx) = watch::channel(false);

        let mut smtp_handles = Vec::new();
        for server in self.smtp_servers {
            smtp_handles.push(tokio::spawn(server.run(listener_rx.clone())));
        }
        let mut imap_handles = Vec::new();
        for server in self.imap_servers {
            imap_handles.push(tokio::spawn(server.run(listener_rx.clone())));
        }
        let engine_handle = tokio::spawn(self.core.engine.clone().run(engine_rx));

        wait_for_shutdown_signal().await?;
        tracing::info!("shutdown signal received, draining");

        let core = self.core;
        let drain = async move {
            // stop accepting, drain SMTP first, then IMAP
            let _ = listener_tx.send(true);
            for handle in smtp_handles {
                if let Err(e) = handle.await {
                    tracing::warn!(err = %e, "smtp task join failure");
                }
            }
            for handle in imap_handles {
                if let Err(e) = handle.await {
                    tracing::warn!(err = %e, "imap task join failure");
                }
            }
            // finish in-flight deliveries, start no new ones
            let _ = engine_tx.send(true);
            if let Err(e) = engine_handle.await {
                tracing::warn!(err = %e, "engine task join failure");
            }
            // queue last: reject new work, wait for stragglers
            core.engine.queue().close().await;
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("shutdown timeout exceeded, forcing exit");
        }
        tracing::info!("bye");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = interrupt.recv() => return Ok(()),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => {
                // SIGHUP is reserved for log rotation; tracing writes to
                // stderr so there is nothing to reopen
                tracing::info!("SIGHUP received, continuing");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    Ok(())
}

/// Creates the configured bootstrap domains and users when missing, so
/// a fresh install is usable without any admin tooling.
async fn bootstrap(config: &Config, directory: &Arc<Directory>, store: &MailStore) -> Result<()> {
    for entry in &config.bootstrap_domains {
        if directory.domain_by_name(&entry.name).await?.is_some() {
            continue;
        }
        let dkim_key = match &entry.dkim_key_file {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading DKIM key {}", path.display()))?,
            ),
            None => None,
        };
        directory
            .create_domain(&entry.name, &entry.dkim_selector, dkim_key)
            .await?;
        tracing::info!(domain = %entry.name, "bootstrapped domain");
    }

    for entry in &config.bootstrap_users {
        let address: paq_user::address::Address = entry
            .address
            .parse()
            .with_context(|| format!("bootstrap user {:?}", entry.address))?;
        if directory.user_by_address(&address).await?.is_some() {
            continue;
        }
        let domain = directory
            .domain_by_name(&address.domain)
            .await?
            .with_context(|| format!("bootstrap user {} needs domain {}", address, address.domain))?;
        let hash = match entry.password.strip_prefix("plain:") {
            Some(clear) => hash_password(clear)?,
            None => entry.password.clone(),
        };
        let user = directory
            .create_user(
                domain.id,
                &address.local,
                &hash,
                &entry.display_name,
                entry.quota_bytes,
            )
            .await?;
        store.provision_user(user.id).await?;
        tracing::info!(user = %address, "bootstrapped user");
    }

    // existing users get their maildir trees checked at every start
    for domain in directory.list_domains().await? {
        for user in directory.list_users(domain.id).await? {
            store.provision_user(user.id).await?;
        }
    }
    Ok(())
}
