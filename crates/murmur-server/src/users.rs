//! User registry: chat identities, password hashes and access keys.
//!
//! Store layout:
//!   `username:{name}` → user ID (claimed with SET-IF-ABSENT, so concurrent
//!                       sign-ups of one name cannot both win)
//!   `user:{id}`       → JSON [`UserRecord`]
//!   `users`           → list of user IDs, newest first

use crate::presence::Presence;
use crate::store::Store;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use murmur_core::{create_access_key, verify_access_key, Authorized, MurmurError, MurmurResult, UserInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const USERS_KEY: &str = "users";
const MAX_USERNAME_CHARS: usize = 32;
const MAX_PASSWORD_CHARS: usize = 256;

fn username_key(username: &str) -> String {
    format!("username:{username}")
}

fn user_key(id: &str) -> String {
    format!("user:{id}")
}

/// Persisted form of a user. The password is only ever stored hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Trim and check a username.
pub fn validate_username(raw: &str) -> MurmurResult<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_USERNAME_CHARS {
        return Err(MurmurError::InvalidArgument(format!(
            "username must be 1-{MAX_USERNAME_CHARS} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(MurmurError::InvalidArgument(
            "username must not contain control characters".into(),
        ));
    }
    Ok(name.to_string())
}

fn validate_password(password: &str) -> MurmurResult<()> {
    let len = password.chars().count();
    if len == 0 || len > MAX_PASSWORD_CHARS {
        return Err(MurmurError::InvalidArgument(format!(
            "password must be 1-{MAX_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> MurmurResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MurmurError::Other(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
fn verify_password(password: &str, hash: &str) -> MurmurResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| MurmurError::Other(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Generate a random user ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_user_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

pub struct UserRegistry {
    store: Arc<dyn Store>,
    presence: Presence,
    secret: Vec<u8>,
    access_key_ttl_secs: u64,
}

impl UserRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        presence: Presence,
        secret: Vec<u8>,
        access_key_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            presence,
            secret,
            access_key_ttl_secs,
        }
    }

    fn authorize(&self, record: &UserRecord) -> Authorized {
        Authorized {
            user_id: record.id.clone(),
            username: record.username.clone(),
            access_key: create_access_key(&self.secret, &record.id, self.access_key_ttl_secs),
        }
    }

    /// Create a user. Fails with `DuplicateUser` if the name is taken.
    pub async fn create(&self, username: &str, password: &str) -> MurmurResult<Authorized> {
        let username = validate_username(username)?;
        validate_password(password)?;

        let id = generate_user_id();
        if !self.store.set_nx(&username_key(&username), &id).await? {
            return Err(MurmurError::DuplicateUser(username));
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| MurmurError::Other(format!("hashing task failed: {e}")))??;

        let record = UserRecord {
            id: id.clone(),
            username: username.clone(),
            password_hash,
            created_at: Utc::now(),
        };
        if let Err(e) = self.persist(&record).await {
            // Release the name so the sign-up can be retried.
            if let Err(release) = self.store.del(&username_key(&username)).await {
                warn!(username = %username, error = %release, "failed to release username");
            }
            return Err(e);
        }

        info!(user_id = %id, username = %username, "user created");
        Ok(self.authorize(&record))
    }

    async fn persist(&self, record: &UserRecord) -> MurmurResult<()> {
        self.store
            .set(&user_key(&record.id), &serde_json::to_string(record)?)
            .await?;
        self.store.append(USERS_KEY, &record.id).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> MurmurResult<Option<UserRecord>> {
        match self.store.get(&user_key(id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| MurmurError::Other(format!("corrupt user record {id}: {e}"))),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, username: &str) -> MurmurResult<UserRecord> {
        let username = username.trim();
        let id = self
            .store
            .get(&username_key(username))
            .await?
            .ok_or_else(|| MurmurError::NotFound(format!("user {username}")))?;
        self.find_by_id(&id)
            .await?
            .ok_or_else(|| MurmurError::NotFound(format!("user {username}")))
    }

    /// Password sign-in.
    pub async fn authenticate(&self, username: &str, password: &str) -> MurmurResult<Authorized> {
        let record = self.find_by_name(username).await?;

        let password = password.to_string();
        let hash = record.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| MurmurError::Other(format!("verification task failed: {e}")))??;
        if !valid {
            debug!(username = %record.username, "password rejected");
            return Err(MurmurError::InvalidCredential);
        }
        Ok(self.authorize(&record))
    }

    /// Sign-in with an access key issued by an earlier sign-up or sign-in.
    /// A fresh key is issued on success.
    pub async fn authenticate_with_key(
        &self,
        username: &str,
        access_key: &str,
    ) -> MurmurResult<Authorized> {
        let record = self.find_by_name(username).await?;
        verify_access_key(&self.secret, &record.id, access_key)?;
        Ok(self.authorize(&record))
    }

    /// Every registered user in creation order, with live presence.
    pub async fn list_all(&self) -> MurmurResult<Vec<UserInfo>> {
        let count = self.store.len(USERS_KEY).await?;
        let mut ids = self.store.range(USERS_KEY, 0, count).await?;
        ids.reverse();

        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = self.find_by_id(&id).await? else {
                warn!(user_id = %id, "listed user has no record");
                continue;
            };
            users.push(UserInfo {
                online: self.presence.is_online(&record.id).await?,
                id: record.id,
                username: record.username,
            });
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn registry() -> (UserRegistry, Presence) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let presence = Presence::new(store.clone(), Duration::from_secs(30));
        let users = UserRegistry::new(store, presence.clone(), b"test-secret".to_vec(), 3600);
        (users, presence)
    }

    #[test]
    fn username_rules() {
        assert_eq!(validate_username("  alice ").unwrap(), "alice");
        assert!(validate_username("   ").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
        assert!(validate_username(&"é".repeat(32)).is_ok());
        assert!(validate_username("bad\nname").is_err());
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }

    #[tokio::test]
    async fn create_and_authenticate() {
        let (users, _) = registry();
        let created = users.create("alice", "pw").await.unwrap();
        assert_eq!(created.username, "alice");
        assert_eq!(created.user_id.len(), 32);
        assert!(!created.access_key.is_empty());
        assert_ne!(created.access_key, "pw");

        let signed_in = users.authenticate("alice", "pw").await.unwrap();
        assert_eq!(signed_in.user_id, created.user_id);
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let (users, _) = registry();
        users.create("alice", "pw").await.unwrap();
        assert!(matches!(
            users.create(" alice", "other").await,
            Err(MurmurError::DuplicateUser(_))
        ));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user() {
        let (users, _) = registry();
        users.create("alice", "pw").await.unwrap();
        assert!(matches!(
            users.authenticate("alice", "nope").await,
            Err(MurmurError::InvalidCredential)
        ));
        assert!(matches!(
            users.authenticate("mallory", "pw").await,
            Err(MurmurError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn access_key_sign_in() {
        let (users, _) = registry();
        let alice = users.create("alice", "pw").await.unwrap();
        let bob = users.create("bob", "pw").await.unwrap();

        let again = users
            .authenticate_with_key("alice", &alice.access_key)
            .await
            .unwrap();
        assert_eq!(again.user_id, alice.user_id);

        assert!(matches!(
            users.authenticate_with_key("alice", &bob.access_key).await,
            Err(MurmurError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn list_all_in_creation_order_with_presence() {
        let (users, presence) = registry();
        let alice = users.create("alice", "pw").await.unwrap();
        users.create("bob", "pw").await.unwrap();
        presence.mark_online(&alice.user_id, "s1").await.unwrap();

        let listed = users.list_all().await.unwrap();
        let names: Vec<_> = listed.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(listed[0].online);
        assert!(!listed[1].online);
    }
}
