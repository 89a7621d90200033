//! Device authorization: a CLI starts a pairing, a signed-in user approves
//! the displayed user code, and the CLI's next poll receives an access key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use service_core::error::AppError;
use std::time::Duration;

use crate::data::{DataError, Transaction};
use crate::models::access_key::SCOPE_ALLOW_CREATE_ACCESS_KEY;
use crate::models::{AccessKey, DeviceFlowAuthRequest, DeviceFlowStatus, Identity};
use crate::services::access_keys;
use crate::services::crypto::Sealer;
use crate::uid::Id;
use crate::utils::generate;

pub const EXPIRES_IN_SECONDS: i64 = 1800;
pub const POLL_INTERVAL_SECONDS: i64 = 5;

const USER_CODE_LENGTH: usize = 8;
const DEVICE_CODE_LENGTH: usize = 38;
const CREATE_ATTEMPTS: usize = 10;

const DEVICE_KEY_LIFETIME: ChronoDuration = ChronoDuration::days(3650);
const DEVICE_KEY_EXTENSION: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct StartedFlow {
    pub device_code: String,
    /// `XXXX-XXXX`
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in_seconds: i64,
    pub poll_interval_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct ConfirmedLogin {
    pub user_id: Id,
    pub name: String,
    /// Only the first poll after approval carries the bearer.
    pub access_key: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub organization_name: String,
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub status: DeviceFlowStatus,
    pub device_code: String,
    pub login: Option<ConfirmedLogin>,
}

fn display_code(code: &str) -> String {
    let (a, b) = code.split_at(code.len() / 2);
    format!("{}-{}", a, b)
}

fn normalize_code(code: &str) -> String {
    code.trim().replace('-', "").to_uppercase()
}

pub async fn start(tx: &mut dyn Transaction, client_id: &str, org_domain: &str) -> Result<StartedFlow, AppError> {
    let expires_at = Utc::now() + ChronoDuration::seconds(EXPIRES_IN_SECONDS);
    let mut attempt = 0;
    let request = loop {
        attempt += 1;
        let mut request = DeviceFlowAuthRequest::new(
            client_id,
            generate::crypto_random(USER_CODE_LENGTH, generate::USER_CODE),
            generate::alphanumeric(DEVICE_CODE_LENGTH),
            expires_at,
        );
        match tx.create_device_flow_auth_request(&mut request).await {
            Ok(()) => break request,
            Err(DataError::UniqueConstraint { .. }) if attempt < CREATE_ATTEMPTS => continue,
            Err(e) => return Err(e.into()),
        }
    };

    tracing::debug!(request_id = %request.id, "Started device flow");
    Ok(StartedFlow {
        device_code: request.device_code,
        user_code: display_code(&request.user_code),
        verification_uri: format!("https://{}/device", org_domain),
        expires_in_seconds: EXPIRES_IN_SECONDS,
        poll_interval_seconds: POLL_INTERVAL_SECONDS,
    })
}

/// Reports the pairing's state. A poll arriving sooner than the poll
/// interval after the previous one answers `slow_down`. When the device
/// names its client, it must be the one that started the pairing.
pub async fn poll(
    tx: &mut dyn Transaction,
    device_code: &str,
    client_id: Option<&str>,
    sealer: &Sealer,
    now: DateTime<Utc>,
) -> Result<PollResult, AppError> {
    let mut request = tx.get_device_flow_auth_request_by_device_code(device_code).await?;
    if client_id.is_some_and(|id| id != request.client_id) {
        return Err(DataError::NotFound.into());
    }
    let mut result = PollResult {
        status: request.status(now),
        device_code: request.device_code.clone(),
        login: None,
    };

    match result.status {
        DeviceFlowStatus::Pending => {
            let too_soon = request
                .last_polled_at
                .is_some_and(|last| now - last < ChronoDuration::seconds(POLL_INTERVAL_SECONDS));
            if too_soon {
                result.status = DeviceFlowStatus::SlowDown;
            } else {
                request.last_polled_at = Some(now);
                request.updated_at = now;
                tx.update_device_flow_auth_request(&request).await?;
            }
        }
        DeviceFlowStatus::Confirmed => {
            let key_id = request.access_key_id.unwrap_or_default();
            let key = tx.get_access_key(key_id).await?;
            let access_key = match request.access_key_token.take() {
                Some(sealed) => {
                    let bearer = sealer.open(&sealed)?;
                    request.updated_at = now;
                    tx.update_device_flow_auth_request(&request).await?;
                    Some(bearer)
                }
                None => None,
            };
            let org = tx.get_organization(key.organization_id).await?;
            result.login = Some(ConfirmedLogin {
                user_id: key.issued_for,
                name: key.issued_for_name.clone(),
                access_key,
                expires_at: key.expires_at,
                organization_name: org.name,
            });
        }
        DeviceFlowStatus::Expired | DeviceFlowStatus::Rejected | DeviceFlowStatus::SlowDown => {}
    }
    Ok(result)
}

/// Approves the pairing for `user`. Approving an approved request does nothing,
/// so the first approver keeps the device.
pub async fn approve(
    tx: &mut dyn Transaction,
    user_code: &str,
    user: &Identity,
    current_key: &AccessKey,
    sealer: &Sealer,
    bcrypt_cost: u32,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let mut request = tx
        .get_device_flow_auth_request_by_user_code(&normalize_code(user_code))
        .await?;
    match request.status(now) {
        DeviceFlowStatus::Confirmed => return Ok(()),
        DeviceFlowStatus::Expired => return Err(AppError::Expired),
        DeviceFlowStatus::Rejected => return Err(AppError::bad_request("device login was rejected")),
        DeviceFlowStatus::Pending | DeviceFlowStatus::SlowDown => {}
    }

    let mut key = AccessKey::new(user.id, current_key.provider_id);
    key.id = Id::new();
    key.name = format!("device-{}", request.id);
    key.expires_at = now + DEVICE_KEY_LIFETIME;
    key.inactivity_extension = DEVICE_KEY_EXTENSION;
    key.scopes = vec![SCOPE_ALLOW_CREATE_ACCESS_KEY.to_string()];
    let issued = access_keys::issue(tx, key, bcrypt_cost).await?;

    request.approved = Some(true);
    request.approved_by = user.id;
    request.access_key_id = Some(issued.key.id);
    request.access_key_token = Some(sealer.seal(&issued.bearer)?);
    request.updated_at = now;
    tx.update_device_flow_auth_request(&request).await?;

    tracing::info!(request_id = %request.id, user_id = %user.id, "Approved device login");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MemoryStore, Store, TxOptions};
    use crate::models::Organization;
    use crate::services::organizations;

    async fn setup() -> (Box<dyn Transaction>, Identity, AccessKey) {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut org = Organization::new("acme", "acme.example.com", Id(0));
        organizations::create(tx.as_mut(), &mut org).await.unwrap();
        let mut user = Identity::new("a@example.com", Id(0));
        tx.create_identity(&mut user).await.unwrap();
        let infra = tx.get_infra_provider().await.unwrap();
        let mut key = AccessKey::new(user.id, infra.id);
        key.name = "session".to_string();
        key.expires_at = Utc::now() + ChronoDuration::hours(1);
        let issued = access_keys::issue(tx.as_mut(), key, 4).await.unwrap();
        (tx, user, issued.key)
    }

    #[tokio::test]
    async fn approval_hands_out_the_key_once() {
        let (mut tx, user, session) = setup().await;
        let sealer = Sealer::ephemeral();
        let started = start(tx.as_mut(), "cli", "acme.example.com").await.unwrap();
        assert_eq!(started.user_code.len(), USER_CODE_LENGTH + 1);
        assert_eq!(started.verification_uri, "https://acme.example.com/device");

        let now = Utc::now();
        let first = poll(tx.as_mut(), &started.device_code, None, &sealer, now).await.unwrap();
        assert_eq!(first.status, DeviceFlowStatus::Pending);

        approve(tx.as_mut(), &started.user_code, &user, &session, &sealer, 4, now)
            .await
            .unwrap();

        let confirmed = poll(tx.as_mut(), &started.device_code, None, &sealer, now).await.unwrap();
        assert_eq!(confirmed.status, DeviceFlowStatus::Confirmed);
        let login = confirmed.login.unwrap();
        assert_eq!(login.user_id, user.id);
        let bearer = login.access_key.unwrap();
        assert!(access_keys::validate(tx.as_mut(), &bearer, now).await.is_ok());

        let again = poll(tx.as_mut(), &started.device_code, None, &sealer, now).await.unwrap();
        assert_eq!(again.status, DeviceFlowStatus::Confirmed);
        assert!(again.login.unwrap().access_key.is_none());
    }

    #[tokio::test]
    async fn second_approver_does_not_take_over() {
        let (mut tx, user, session) = setup().await;
        let sealer = Sealer::ephemeral();
        let started = start(tx.as_mut(), "cli", "acme.example.com").await.unwrap();
        let now = Utc::now();
        approve(tx.as_mut(), &started.user_code, &user, &session, &sealer, 4, now)
            .await
            .unwrap();

        let mut other = Identity::new("b@example.com", Id(0));
        tx.create_identity(&mut other).await.unwrap();
        approve(tx.as_mut(), &started.user_code.to_lowercase(), &other, &session, &sealer, 4, now)
            .await
            .unwrap();

        let result = poll(tx.as_mut(), &started.device_code, None, &sealer, now).await.unwrap();
        assert_eq!(result.login.unwrap().user_id, user.id);
    }

    #[tokio::test]
    async fn fast_polling_slows_down() {
        let (mut tx, _, _) = setup().await;
        let sealer = Sealer::ephemeral();
        let started = start(tx.as_mut(), "cli", "acme.example.com").await.unwrap();
        let now = Utc::now();
        poll(tx.as_mut(), &started.device_code, None, &sealer, now).await.unwrap();
        let fast = poll(tx.as_mut(), &started.device_code, None, &sealer, now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(fast.status, DeviceFlowStatus::SlowDown);
        let later = poll(tx.as_mut(), &started.device_code, None, &sealer, now + ChronoDuration::seconds(6))
            .await
            .unwrap();
        assert_eq!(later.status, DeviceFlowStatus::Pending);
    }

    #[tokio::test]
    async fn expired_requests_cannot_be_approved() {
        let (mut tx, user, session) = setup().await;
        let sealer = Sealer::ephemeral();
        let started = start(tx.as_mut(), "cli", "acme.example.com").await.unwrap();
        let later = Utc::now() + ChronoDuration::seconds(EXPIRES_IN_SECONDS + 1);
        let err = approve(tx.as_mut(), &started.user_code, &user, &session, &sealer, 4, later)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired));
        let polled = poll(tx.as_mut(), &started.device_code, None, &sealer, later).await.unwrap();
        assert_eq!(polled.status, DeviceFlowStatus::Expired);
    }

    #[tokio::test]
    async fn polls_from_another_client_are_unknown() {
        let (mut tx, _, _) = setup().await;
        let sealer = Sealer::ephemeral();
        let started = start(tx.as_mut(), "cli", "acme.example.com").await.unwrap();
        let now = Utc::now();

        let err = poll(tx.as_mut(), &started.device_code, Some("other"), &sealer, now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let own = poll(tx.as_mut(), &started.device_code, Some("cli"), &sealer, now)
            .await
            .unwrap();
        assert_eq!(own.status, DeviceFlowStatus::Pending);
    }
}
