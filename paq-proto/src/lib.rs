pub mod delivery;
pub mod imap;
pub mod sasl;
pub mod smtp;
pub mod stream;
pub mod tls;

use std::sync::Arc;

use paq_mail::store::MailStore;
use paq_transport::engine::DeliveryEngine;
use paq_user::config::Config;
use paq_user::directory::Directory;
use paq_user::login::Authenticator;

/// Everything a protocol session needs, assembled once at startup.
pub struct Core {
    pub config: Arc<Config>,
    pub directory: Arc<Directory>,
    pub auth: Authenticator,
    pub store: Arc<MailStore>,
    pub local: Arc<delivery::LocalDelivery>,
    pub engine: Arc<DeliveryEngine>,
}
