use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Hostname announced in SMTP banners, EHLO and bounce headers.
    pub hostname: String,
    /// Root for `maildir/`, `queue/` and `mail.db`.
    pub data_dir: PathBuf,

    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub imap: ImapConfig,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Domains and users created at startup when missing, so a fresh
    /// server is usable without any admin tooling.
    #[serde(default)]
    pub bootstrap_domains: Vec<BootstrapDomain>,
    #[serde(default)]
    pub bootstrap_users: Vec<BootstrapUser>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SmtpConfig {
    /// MX listener (no auth), conventionally port 25.
    pub bind_mx: Option<SocketAddr>,
    /// Submission listener (auth required), conventionally port 587.
    pub bind_submission: Option<SocketAddr>,
    /// Implicit-TLS submission listener, conventionally port 465.
    pub bind_submission_tls: Option<SocketAddr>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_smtp_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            bind_mx: None,
            bind_submission: None,
            bind_submission_tls: None,
            max_message_size: default_max_message_size(),
            idle_timeout_secs: default_smtp_idle_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ImapConfig {
    /// Cleartext listener offering STARTTLS, conventionally port 143.
    pub bind: Option<SocketAddr>,
    /// Implicit-TLS listener, conventionally port 993.
    pub bind_tls: Option<SocketAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Accept peer certificates that do not verify. Some small MX hosts
    /// still run self-signed certs; opportunistic TLS beats cleartext.
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            skip_tls_verify: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootstrapDomain {
    pub name: String,
    #[serde(default = "default_dkim_selector")]
    pub dkim_selector: String,
    /// PEM file holding the RSA signing key (PKCS#1 or PKCS#8).
    pub dkim_key_file: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BootstrapUser {
    pub address: String,
    /// Either a PHC-encoded Argon2id hash or, for dev setups, a clear
    /// password prefixed with `plain:`.
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub quota_bytes: i64,
}

// ---

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

fn default_smtp_idle_timeout() -> u64 {
    300
}

fn default_workers() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    120
}

fn default_dkim_selector() -> String {
    "mail".into()
}
