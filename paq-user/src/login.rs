use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::address::Address;
use crate::directory::Directory;
use crate::model::{AliasTarget, User};
use crate::password::verify_password;

/// Unknown user, wrong password and malformed address are all reported
/// as `InvalidCredentials` so that clients cannot enumerate accounts.
/// `Disabled` is only distinguishable after the password checked out.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is disabled")]
    Disabled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Authenticator {
    directory: Arc<Directory>,
}

impl Authenticator {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    pub async fn authenticate(&self, address: &str, password: &str) -> Result<User, AuthError> {
        let addr = match Address::from_str(address) {
            Ok(a) => a,
            Err(_) => {
                tracing::debug!(user = %address, "login with malformed address");
                return Err(AuthError::InvalidCredentials);
            }
        };
        let user = match self.directory.user_by_address(&addr).await? {
            Some(u) => u,
            None => {
                tracing::debug!(user = %addr, "login for unknown user");
                return Err(AuthError::InvalidCredentials);
            }
        };
        if !verify_password(password, &user.password_hash).unwrap_or(false) {
            tracing::debug!(user = %addr, "login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.active {
            return Err(AuthError::Disabled);
        }
        Ok(user)
    }

    pub async fn lookup_user(&self, address: &Address) -> anyhow::Result<Option<User>> {
        self.directory.user_by_address(address).await
    }

    /// True iff mail for `address` can be delivered here: a live user,
    /// or a live alias on a live domain.
    pub async fn validate_local_recipient(&self, address: &Address) -> anyhow::Result<bool> {
        if let Some(user) = self.directory.user_by_address(address).await? {
            if user.active {
                return Ok(true);
            }
        }
        match self.directory.resolve_alias(address).await? {
            Some(AliasTarget::User(id)) => Ok(self
                .directory
                .user_by_id(id)
                .await?
                .map(|u| u.active)
                .unwrap_or(false)),
            Some(AliasTarget::External(_)) => Ok(true),
            None => Ok(false),
        }
    }

    pub async fn resolve_alias(&self, address: &Address) -> anyhow::Result<Option<AliasTarget>> {
        self.directory.resolve_alias(address).await
    }

    pub async fn is_local_domain(&self, domain: &str) -> anyhow::Result<bool> {
        self.directory.is_local_domain(domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::password::hash_password;

    async fn fixture(name: &str) -> (Authenticator, Arc<Directory>) {
        let path = std::env::temp_dir().join(format!(
            "paq-login-test-{}-{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let directory = Arc::new(Directory::new(Db::open(&path).unwrap()));
        let domain = directory
            .create_domain("example.com", "mail", None)
            .await
            .unwrap();
        directory
            .create_user(
                domain.id,
                "alice",
                &hash_password("hunter2").unwrap(),
                "Alice",
                0,
            )
            .await
            .unwrap();
        (Authenticator::new(directory.clone()), directory)
    }

    #[tokio::test]
    async fn authenticates_valid_credentials() {
        let (auth, _) = fixture("valid").await;
        let user = auth
            .authenticate("Alice@Example.Com", "hunter2")
            .await
            .unwrap();
        assert_eq!(user.local_part, "alice");
    }

    #[tokio::test]
    async fn failures_are_indistinguishable() {
        let (auth, _) = fixture("opaque").await;
        for (user, password) in [
            ("alice@example.com", "wrong"),
            ("nobody@example.com", "hunter2"),
            ("not-an-address", "hunter2"),
        ] {
            let err = auth.authenticate(user, password).await.unwrap_err();
            assert!(
                matches!(err, AuthError::InvalidCredentials),
                "expected opaque failure for {}",
                user
            );
        }
    }

    #[tokio::test]
    async fn recipient_validation_covers_users_and_aliases() {
        let (auth, directory) = fixture("recipients").await;
        let alice = directory
            .user_by_address(&"alice@example.com".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        directory
            .create_alias(alice.domain_id, "postmaster", AliasTarget::User(alice.id))
            .await
            .unwrap();
        directory
            .create_alias(
                alice.domain_id,
                "forward",
                AliasTarget::External("other@elsewhere.test".into()),
            )
            .await
            .unwrap();

        for (addr, expected) in [
            ("alice@example.com", true),
            ("postmaster@example.com", true),
            ("forward@example.com", true),
            ("ghost@example.com", false),
        ] {
            let ok = auth
                .validate_local_recipient(&addr.parse().unwrap())
                .await
                .unwrap();
            assert_eq!(ok, expected, "{}", addr);
        }

        assert_eq!(
            auth.resolve_alias(&"forward@example.com".parse().unwrap())
                .await
                .unwrap(),
            Some(AliasTarget::External("other@elsewhere.test".into()))
        );
    }
}
