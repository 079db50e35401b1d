use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use paq_user::config::TlsConfig;

pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut std::io::BufReader::new(
        std::fs::File::open(&config.certs)
            .with_context(|| format!("opening {}", config.certs.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&config.key)
            .with_context(|| format!("opening {}", config.key.display()))?,
    ))?
    .context("no private key found in key file")?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
