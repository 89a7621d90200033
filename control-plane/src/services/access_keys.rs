//! Access key issue, validation and revocation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use service_core::error::AppError;
use std::time::Duration;

use crate::data::{optional, DataError, ListAccessKeysOptions, Paged, Transaction};
use crate::models::access_key::{KEY_ID_LENGTH, SECRET_LENGTH};
use crate::models::AccessKey;
use crate::uid::Id;
use crate::utils::{generate, hash_secret_blocking, verify_secret_blocking};

/// Uses closer together than this do not extend the inactivity timeout.
pub const EXTENSION_DAMPING: ChronoDuration = ChronoDuration::seconds(2);

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(12 * 3600);
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// A freshly created key and the only copy of its bearer string.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: AccessKey,
    pub bearer: String,
}

fn chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// `now` plus the key's extension, never past `expires_at`.
fn extended(key: &AccessKey, now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_add_signed(chrono(key.inactivity_extension))
        .map_or(key.expires_at, |t| t.min(key.expires_at))
}

/// Persists `key` with a new secret. `expires_at` must already be set; a
/// zero `inactivity_extension` means the key only expires at `expires_at`.
pub async fn issue(
    tx: &mut dyn Transaction,
    mut key: AccessKey,
    bcrypt_cost: u32,
) -> Result<IssuedKey, AppError> {
    let now = Utc::now();
    if key.expires_at <= now {
        return Err(AppError::field("expiry", "must be in the future"));
    }

    if key.id.is_zero() {
        key.id = Id::new();
    }
    if key.key_id.is_empty() {
        key.key_id = generate::alphanumeric(KEY_ID_LENGTH);
    }
    let secret = generate::alphanumeric(SECRET_LENGTH);
    key.secret_hash = hash_secret_blocking(secret.clone(), bcrypt_cost).await?;

    key.inactivity_timeout_at = if key.inactivity_extension.is_zero() {
        key.expires_at
    } else {
        extended(&key, now)
    };
    key.created_at = now;
    key.updated_at = now;

    tx.create_access_key(&mut key).await?;
    tracing::debug!(key_id = %key.key_id, issued_for = %key.issued_for, "Issued access key");

    let bearer = key.token(&secret);
    Ok(IssuedKey { key, bearer })
}

fn invalid(detail: &str) -> AppError {
    AppError::unauthorized(format!("invalid access key: {}", detail))
}

/// Splits `<key_id>.<secret>`, looks the key up in any organization and checks
/// the secret and both deadlines. A use more than [`EXTENSION_DAMPING`] after
/// the previous one extends the inactivity timeout, capped at `expires_at`.
pub async fn validate(
    tx: &mut dyn Transaction,
    bearer: &str,
    now: DateTime<Utc>,
) -> Result<AccessKey, AppError> {
    let (key_id, secret) = bearer.split_once('.').ok_or_else(|| invalid("format"))?;
    if key_id.is_empty() || secret.is_empty() {
        return Err(invalid("format"));
    }
    if key_id.len() > KEY_ID_LENGTH || secret.len() > SECRET_LENGTH {
        return Err(invalid("length"));
    }

    let mut key = match tx.get_access_key_by_key_id(key_id).await {
        Ok(key) => key,
        Err(DataError::NotFound) => return Err(invalid("not found")),
        Err(e) => return Err(e.into()),
    };

    if !verify_secret_blocking(secret.to_string(), key.secret_hash.clone()).await {
        return Err(invalid("secret"));
    }

    if key.is_expired(now) {
        return Err(AppError::Expired);
    }

    if now - key.updated_at > EXTENSION_DAMPING && !key.inactivity_extension.is_zero() {
        let previous = tx.organization_id();
        tx.set_organization_id(Some(key.organization_id));
        key.inactivity_timeout_at = extended(&key, now);
        key.updated_at = now;
        let result = tx.update_access_key(&key).await;
        tx.set_organization_id(previous);
        result?;
    }

    Ok(key)
}

pub async fn list(
    tx: &mut dyn Transaction,
    opts: &ListAccessKeysOptions,
) -> Result<Paged<AccessKey>, AppError> {
    Ok(tx.list_access_keys(opts).await?)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<AccessKey, AppError> {
    Ok(tx.get_access_key(id).await?)
}

/// Deletes a key. The key authenticating the current request is refused.
pub async fn delete(tx: &mut dyn Transaction, id: Id, current: Option<Id>) -> Result<(), AppError> {
    if current == Some(id) {
        return Err(AppError::bad_request(
            "cannot delete the access key used by this request",
        ));
    }
    tx.delete_access_key(id).await?;
    Ok(())
}

/// Deletes the keys named `name` issued for `issued_for`.
pub async fn delete_by_name(
    tx: &mut dyn Transaction,
    issued_for: Id,
    name: &str,
    current: Option<Id>,
) -> Result<(), AppError> {
    let keys = tx
        .list_access_keys(&ListAccessKeysOptions {
            issued_for: Some(issued_for),
            name: Some(name.to_string()),
            include_expired: true,
            pagination: None,
        })
        .await?;
    if keys.items.is_empty() {
        return Err(AppError::not_found());
    }
    for key in keys.items {
        delete(tx, key.id, current).await?;
    }
    Ok(())
}

/// Revocation on logout: removes the key; a key that is already gone is fine.
pub async fn revoke(tx: &mut dyn Transaction, id: Id) -> Result<(), AppError> {
    optional(tx.delete_access_key(id).await)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::{Identity, Organization};

    async fn setup() -> (Box<dyn Transaction>, Identity) {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        tx.create_organization(&mut org).await.unwrap();
        tx.set_organization_id(Some(org.id));
        let mut user = Identity::new("hubert@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();
        (tx, user)
    }

    fn key_for(user: &Identity, expires_in: ChronoDuration, extension: Duration) -> AccessKey {
        let mut key = AccessKey::new(user.id, Id(99));
        key.name = "test".to_string();
        key.expires_at = Utc::now() + expires_in;
        key.inactivity_extension = extension;
        key
    }

    #[tokio::test]
    async fn issued_key_validates() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::hours(1), Duration::from_secs(600)),
            4,
        )
        .await
        .unwrap();

        assert_eq!(issued.bearer.len(), KEY_ID_LENGTH + 1 + SECRET_LENGTH);
        let key = validate(tx.as_mut(), &issued.bearer, Utc::now()).await.unwrap();
        assert_eq!(key.issued_for, user.id);
        assert_eq!(key.issued_for_name, "hubert@example.com");
    }

    #[tokio::test]
    async fn flipped_secret_fails() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::hours(1), Duration::ZERO),
            4,
        )
        .await
        .unwrap();

        let mut bytes = issued.bearer.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'a' { b'b' } else { b'a' };
        let tampered = String::from_utf8(bytes).unwrap();
        let err = validate(tx.as_mut(), &tampered, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn malformed_bearers_are_unauthorized() {
        let (mut tx, _) = setup().await;
        for bearer in ["", "nodot", ".secret", "keyid.", "aaaaaaaaaaaaaaa.bbb"] {
            let err = validate(tx.as_mut(), bearer, Utc::now()).await.unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)), "{}", bearer);
        }
    }

    #[tokio::test]
    async fn inactivity_timeout_expires_key() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::days(365), Duration::from_secs(60)),
            4,
        )
        .await
        .unwrap();

        let later = Utc::now() + ChronoDuration::minutes(2);
        let err = validate(tx.as_mut(), &issued.bearer, later).await.unwrap_err();
        assert!(matches!(err, AppError::Expired));
    }

    #[tokio::test]
    async fn use_extends_inactivity_up_to_expiry() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::minutes(90), Duration::from_secs(3600)),
            4,
        )
        .await
        .unwrap();

        let later = Utc::now() + ChronoDuration::minutes(50);
        let key = validate(tx.as_mut(), &issued.bearer, later).await.unwrap();
        assert_eq!(key.inactivity_timeout_at, key.expires_at);

        let stored = tx.get_access_key(key.id).await.unwrap();
        assert_eq!(stored.inactivity_timeout_at, key.expires_at);
    }

    #[tokio::test]
    async fn rapid_uses_skip_the_write() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::hours(2), Duration::from_secs(3600)),
            4,
        )
        .await
        .unwrap();

        let before = tx.get_access_key(issued.key.id).await.unwrap();
        validate(tx.as_mut(), &issued.bearer, Utc::now()).await.unwrap();
        let after = tx.get_access_key(issued.key.id).await.unwrap();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn cannot_delete_current_key() {
        let (mut tx, user) = setup().await;
        let issued = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::hours(1), Duration::ZERO),
            4,
        )
        .await
        .unwrap();
        let err = delete(tx.as_mut(), issued.key.id, Some(issued.key.id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        delete(tx.as_mut(), issued.key.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn expiry_must_be_in_the_future() {
        let (mut tx, user) = setup().await;
        let err = issue(
            tx.as_mut(),
            key_for(&user, ChronoDuration::seconds(-1), Duration::ZERO),
            4,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }
}
