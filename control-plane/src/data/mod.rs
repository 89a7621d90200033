//! Transactional storage.
//!
//! A [`Store`] opens [`Transaction`]s. Every organization-scoped operation
//! filters on the transaction's organization id and fails with
//! [`DataError::OrganizationRequired`] when none is set. Expiry purges run
//! across all organizations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

use crate::models::{
    AccessKey, Credential, Destination, DestinationCredential, DeviceFlowAuthRequest,
    EmailVerificationToken, Grant, Group, Identity, Organization, PasswordResetToken, Provider,
    ProviderUser, Subject,
};
use crate::uid::Id;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("record not found")]
    NotFound,

    #[error("value for {column} already exists for {table}")]
    UniqueConstraint { table: String, column: String },

    #[error("an organization is required")]
    OrganizationRequired,

    #[error("transaction is already closed")]
    Closed,

    #[error("transaction is read-only")]
    ReadOnly,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DataError {
    pub fn unique(table: &str, column: &str) -> Self {
        DataError::UniqueConstraint {
            table: table.to_string(),
            column: column.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound)
    }
}

impl From<DataError> for AppError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::NotFound => AppError::not_found(),
            DataError::UniqueConstraint { table, column } => AppError::Conflict {
                message: format!("value for {} already exists for {}", column, table),
                field: Some(column),
            },
            other => AppError::DatabaseError(anyhow::anyhow!(other)),
        }
    }
}

pub type DataResult<T> = Result<T, DataError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }

    pub fn read_write() -> Self {
        Self { read_only: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// One-based.
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 100 }
    }
}

impl Pagination {
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit as usize
    }

    /// Slices an already filtered and ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset())
            .take(self.limit as usize)
            .collect()
    }
}

/// One page of results and the size of the unpaginated result.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total_count: i64,
}

impl<T> Paged<T> {
    pub fn paginate(all: Vec<T>, pagination: Option<Pagination>) -> Self {
        let total_count = all.len() as i64;
        let items = match pagination {
            Some(p) => p.apply(all),
            None => all,
        };
        Paged { items, total_count }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListIdentitiesOptions {
    pub name: Option<String>,
    pub group_id: Option<Id>,
    pub provider_id: Option<Id>,
    pub ids: Option<Vec<Id>>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListGroupsOptions {
    pub name: Option<String>,
    pub member_id: Option<Id>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListProvidersOptions {
    pub name: Option<String>,
    pub exclude_infra: bool,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListProviderUsersOptions {
    pub provider_id: Option<Id>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListAccessKeysOptions {
    pub issued_for: Option<Id>,
    pub name: Option<String>,
    pub include_expired: bool,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListGrantsOptions {
    /// Matches any of these subjects; empty means every subject.
    pub subjects: Vec<Subject>,
    pub resource: Option<String>,
    pub privilege: Option<String>,
    /// Grants on the destination or any of its sub-resources.
    pub destination: Option<String>,
    pub exclude_connector: bool,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ListDestinationsOptions {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub unique_id: Option<String>,
    pub pagination: Option<Pagination>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, opts: TxOptions) -> DataResult<Box<dyn Transaction>>;

    async fn health_check(&self) -> DataResult<()>;
}

/// A unit of work. Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait Transaction: Send {
    fn organization_id(&self) -> Option<Id>;
    fn set_organization_id(&mut self, id: Option<Id>);
    fn is_read_only(&self) -> bool;

    async fn commit(&mut self) -> DataResult<()>;
    async fn rollback(&mut self) -> DataResult<()>;

    // ==================== Organization Operations ====================

    async fn create_organization(&mut self, org: &mut Organization) -> DataResult<()>;
    async fn get_organization(&mut self, id: Id) -> DataResult<Organization>;
    async fn get_organization_by_domain(&mut self, domain: &str) -> DataResult<Organization>;

    // ==================== Identity Operations ====================

    async fn create_identity(&mut self, identity: &mut Identity) -> DataResult<()>;
    async fn get_identity(&mut self, id: Id) -> DataResult<Identity>;
    async fn get_identity_by_name(&mut self, name: &str) -> DataResult<Identity>;
    async fn list_identities(&mut self, opts: &ListIdentitiesOptions) -> DataResult<Paged<Identity>>;
    async fn update_identity(&mut self, identity: &Identity) -> DataResult<()>;
    async fn update_identity_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()>;
    async fn delete_identity(&mut self, id: Id) -> DataResult<()>;

    // ==================== Group Operations ====================

    async fn create_group(&mut self, group: &mut Group) -> DataResult<()>;
    async fn get_group(&mut self, id: Id) -> DataResult<Group>;
    async fn get_group_by_name(&mut self, name: &str) -> DataResult<Group>;
    async fn list_groups(&mut self, opts: &ListGroupsOptions) -> DataResult<Paged<Group>>;
    async fn delete_group(&mut self, id: Id) -> DataResult<()>;
    async fn add_users_to_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()>;
    async fn remove_users_from_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()>;
    async fn list_group_ids_for_user(&mut self, user_id: Id) -> DataResult<Vec<Id>>;
    async fn count_group_members(&mut self, group_id: Id) -> DataResult<i64>;

    // ==================== Provider Operations ====================

    async fn create_provider(&mut self, provider: &mut Provider) -> DataResult<()>;
    async fn get_provider(&mut self, id: Id) -> DataResult<Provider>;
    async fn get_provider_by_name(&mut self, name: &str) -> DataResult<Provider>;
    async fn get_infra_provider(&mut self) -> DataResult<Provider>;
    async fn list_providers(&mut self, opts: &ListProvidersOptions) -> DataResult<Paged<Provider>>;
    async fn update_provider(&mut self, provider: &Provider) -> DataResult<()>;
    async fn delete_provider(&mut self, id: Id) -> DataResult<()>;

    // ==================== Provider User Operations ====================

    async fn upsert_provider_user(&mut self, user: &mut ProviderUser) -> DataResult<()>;
    async fn get_provider_user(&mut self, provider_id: Id, identity_id: Id) -> DataResult<ProviderUser>;
    async fn list_provider_users(&mut self, opts: &ListProviderUsersOptions) -> DataResult<Paged<ProviderUser>>;
    async fn delete_provider_users_for_identity(&mut self, identity_id: Id) -> DataResult<u64>;
    async fn delete_provider_users_for_provider(&mut self, provider_id: Id) -> DataResult<u64>;

    // ==================== Credential Operations ====================

    async fn create_credential(&mut self, credential: &mut Credential) -> DataResult<()>;
    async fn get_credential(&mut self, identity_id: Id) -> DataResult<Credential>;
    async fn update_credential(&mut self, credential: &Credential) -> DataResult<()>;
    async fn delete_credential(&mut self, identity_id: Id) -> DataResult<()>;

    // ==================== Access Key Operations ====================

    async fn create_access_key(&mut self, key: &mut AccessKey) -> DataResult<()>;
    async fn get_access_key(&mut self, id: Id) -> DataResult<AccessKey>;
    async fn get_access_key_by_key_id(&mut self, key_id: &str) -> DataResult<AccessKey>;
    async fn list_access_keys(&mut self, opts: &ListAccessKeysOptions) -> DataResult<Paged<AccessKey>>;
    async fn update_access_key(&mut self, key: &AccessKey) -> DataResult<()>;
    async fn delete_access_key(&mut self, id: Id) -> DataResult<()>;
    async fn delete_access_keys_for_identity(&mut self, identity_id: Id) -> DataResult<u64>;
    async fn delete_access_keys_for_provider(&mut self, provider_id: Id) -> DataResult<u64>;
    async fn delete_expired_access_keys(&mut self, before: DateTime<Utc>) -> DataResult<u64>;

    // ==================== Grant Operations ====================

    async fn create_grant(&mut self, grant: &mut Grant) -> DataResult<()>;
    async fn get_grant(&mut self, id: Id) -> DataResult<Grant>;
    async fn find_grant(&mut self, subject: Subject, privilege: &str, resource: &str) -> DataResult<Grant>;
    async fn list_grants(&mut self, opts: &ListGrantsOptions) -> DataResult<Paged<Grant>>;
    async fn delete_grant(&mut self, id: Id) -> DataResult<()>;
    async fn delete_grants_for_subject(&mut self, subject: Subject) -> DataResult<u64>;
    async fn count_grants(&mut self, privilege: &str, resource: &str) -> DataResult<i64>;

    // ==================== Destination Operations ====================

    async fn create_destination(&mut self, destination: &mut Destination) -> DataResult<()>;
    async fn get_destination(&mut self, id: Id) -> DataResult<Destination>;
    async fn get_destination_by_name(&mut self, name: &str) -> DataResult<Destination>;
    async fn get_destination_by_unique_id(&mut self, unique_id: &str) -> DataResult<Destination>;
    async fn list_destinations(&mut self, opts: &ListDestinationsOptions) -> DataResult<Paged<Destination>>;
    async fn update_destination(&mut self, destination: &Destination) -> DataResult<()>;
    async fn update_destination_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()>;
    async fn delete_destination(&mut self, id: Id) -> DataResult<()>;

    // ==================== Device Flow Operations ====================

    async fn create_device_flow_auth_request(&mut self, req: &mut DeviceFlowAuthRequest) -> DataResult<()>;
    async fn get_device_flow_auth_request_by_user_code(&mut self, user_code: &str) -> DataResult<DeviceFlowAuthRequest>;
    async fn get_device_flow_auth_request_by_device_code(&mut self, device_code: &str) -> DataResult<DeviceFlowAuthRequest>;
    async fn update_device_flow_auth_request(&mut self, req: &DeviceFlowAuthRequest) -> DataResult<()>;
    async fn delete_expired_device_flow_auth_requests(&mut self, before: DateTime<Utc>) -> DataResult<u64>;

    // ==================== Destination Credential Operations ====================

    /// Inserts a request and assigns it the next update index.
    async fn create_destination_credential(&mut self, cred: &mut DestinationCredential) -> DataResult<()>;
    async fn get_destination_credential(&mut self, id: Id) -> DataResult<DestinationCredential>;
    async fn answer_destination_credential(&mut self, cred: &DestinationCredential) -> DataResult<()>;
    /// Pending (unanswered, unexpired) requests with `update_index > after_index`, ascending.
    async fn list_destination_credentials(
        &mut self,
        destination_id: Id,
        after_index: i64,
        now: DateTime<Utc>,
    ) -> DataResult<Vec<DestinationCredential>>;
    async fn max_destination_credential_update_index(&mut self, destination_id: Id) -> DataResult<Option<i64>>;
    async fn delete_expired_destination_credentials(&mut self, before: DateTime<Utc>) -> DataResult<u64>;

    // ==================== Token Operations ====================

    async fn create_password_reset_token(&mut self, token: &mut PasswordResetToken) -> DataResult<()>;
    /// Returns and deletes an unexpired token.
    async fn claim_password_reset_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<PasswordResetToken>;
    async fn delete_expired_password_reset_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64>;

    async fn create_email_verification_token(&mut self, token: &mut EmailVerificationToken) -> DataResult<()>;
    async fn claim_email_verification_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<EmailVerificationToken>;
    async fn delete_expired_email_verification_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64>;
}

/// Convenience for the common "missing is fine" lookup.
pub fn optional<T>(result: DataResult<T>) -> DataResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(DataError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}
