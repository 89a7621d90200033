//! PostgreSQL store.
//!
//! Organizations, identities, groups, providers, access keys, grants and
//! destinations are soft-deleted; everything else is removed outright.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;

use super::{
    DataError, DataResult, ListAccessKeysOptions, ListDestinationsOptions, ListGrantsOptions,
    ListGroupsOptions, ListIdentitiesOptions, ListProviderUsersOptions, ListProvidersOptions,
    Pagination, Paged, Store, Transaction, TxOptions,
};
use crate::models::grant::{RESOURCE_INFRA, ROLE_CONNECTOR};
use crate::models::{
    AccessKey, Credential, Destination, DestinationCredential, DeviceFlowAuthRequest,
    EmailVerificationToken, Grant, Group, Identity, Organization, PasswordResetToken, Provider,
    ProviderKind, ProviderUser, Subject,
};
use crate::uid::Id;

/// Channel carrying destination ids whose credential requests changed.
pub const DESTINATION_CREDENTIALS_CHANNEL: &str = "destination_credentials";

/// Tables whose unique index names follow `idx_<table>_<column>`.
const UNIQUE_TABLES: &[&str] = &[
    "organizations",
    "identities",
    "groups",
    "providers",
    "credentials",
    "access_keys",
    "grants",
    "destinations",
    "device_flow_auth_requests",
    "password_reset_tokens",
    "email_verification_tokens",
];

fn map_err(err: sqlx::Error) -> DataError {
    match &err {
        sqlx::Error::RowNotFound => DataError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            let constraint = db.constraint().unwrap_or_default();
            unique_from_constraint(constraint)
        }
        _ => DataError::Backend(anyhow::anyhow!(err)),
    }
}

fn unique_from_constraint(constraint: &str) -> DataError {
    let rest = constraint.strip_prefix("idx_").unwrap_or(constraint);
    UNIQUE_TABLES
        .iter()
        .find_map(|table| {
            rest.strip_prefix(table)
                .and_then(|c| c.strip_prefix('_'))
                .map(|column| DataError::unique(table, column))
        })
        .unwrap_or_else(|| DataError::unique("", constraint))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self, opts: TxOptions) -> DataResult<Box<dyn Transaction>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        if opts.read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            org: None,
            read_only: opts.read_only,
        }))
    }

    async fn health_check(&self) -> DataResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                map_err(e)
            })?;
        Ok(())
    }
}

pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    org: Option<Id>,
    read_only: bool,
}

impl PgTransaction {
    fn conn(&mut self) -> DataResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(DataError::Closed)
    }

    fn org(&self) -> DataResult<Id> {
        self.org.ok_or(DataError::OrganizationRequired)
    }

    /// Row lock for reads that decide a one-shot transition; approvals and
    /// polls of the same request serialize on it until commit.
    fn row_lock(&self) -> &'static str {
        if self.read_only {
            ""
        } else {
            " FOR UPDATE"
        }
    }

    /// Organization and connection for an org-scoped statement.
    fn scoped(&mut self) -> DataResult<(Id, &mut PgConnection)> {
        let org = self.org()?;
        Ok((org, self.conn()?))
    }
}

fn expect_one(result: sqlx::postgres::PgQueryResult) -> DataResult<()> {
    if result.rows_affected() == 0 {
        Err(DataError::NotFound)
    } else {
        Ok(())
    }
}

/// Runs an insert under a savepoint so that a unique violation leaves the
/// surrounding transaction usable for the caller's follow-up reads.
async fn insert(
    conn: &mut PgConnection,
    query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
) -> DataResult<sqlx::postgres::PgQueryResult> {
    sqlx::query("SAVEPOINT insert_row")
        .execute(&mut *conn)
        .await
        .map_err(map_err)?;
    match query.execute(&mut *conn).await {
        Ok(result) => {
            sqlx::query("RELEASE SAVEPOINT insert_row")
                .execute(&mut *conn)
                .await
                .map_err(map_err)?;
            Ok(result)
        }
        Err(err) => {
            sqlx::query("ROLLBACK TO SAVEPOINT insert_row")
                .execute(&mut *conn)
                .await
                .map_err(map_err)?;
            Err(map_err(err))
        }
    }
}

/// Runs a filtered select plus the matching count.
async fn fetch_paged<R>(
    conn: &mut PgConnection,
    columns: &str,
    from: &str,
    filter: impl Fn(&mut QueryBuilder<'static, Postgres>),
    order_by: &str,
    pagination: Option<Pagination>,
) -> DataResult<(Vec<R>, i64)>
where
    R: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
{
    let mut count = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE ", from));
    filter(&mut count);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(&mut *conn)
        .await
        .map_err(map_err)?;

    let mut select = QueryBuilder::new(format!("SELECT {} FROM {} WHERE ", columns, from));
    filter(&mut select);
    select.push(" ORDER BY ").push(order_by);
    if let Some(p) = pagination {
        select
            .push(" LIMIT ")
            .push_bind(i64::from(p.limit))
            .push(" OFFSET ")
            .push_bind(p.offset() as i64);
    }
    let rows = select
        .build_query_as::<R>()
        .fetch_all(&mut *conn)
        .await
        .map_err(map_err)?;
    Ok((rows, total))
}

// ==================== Row Types ====================

const ORGANIZATION_COLUMNS: &str =
    "id, created_at, updated_at, name, domain, created_by, allowed_domains";
const IDENTITY_COLUMNS: &str =
    "id, organization_id, created_at, updated_at, name, verified, last_seen_at, created_by";
const GROUP_COLUMNS: &str =
    "id, organization_id, created_at, updated_at, name, created_by, created_by_provider";
const PROVIDER_COLUMNS: &str = "id, organization_id, created_at, updated_at, name, kind, url, \
    client_id, client_secret, auth_url, scopes, allowed_domains, private_key, client_email, \
    domain_admin_email, created_by";
const PROVIDER_USER_COLUMNS: &str = "identity_id, provider_id, organization_id, created_at, \
    updated_at, email, given_name, family_name, groups, last_update, redirect_url, access_token, \
    refresh_token, expires_at, active";
const CREDENTIAL_COLUMNS: &str =
    "id, organization_id, created_at, updated_at, identity_id, password_hash, one_time_password";
const ACCESS_KEY_COLUMNS: &str = "k.id, k.organization_id, k.created_at, k.updated_at, k.name, \
    k.issued_for, i.name AS issued_for_name, k.provider_id, k.expires_at, \
    k.inactivity_extension, k.inactivity_timeout_at, k.key_id, k.secret_hash, k.scopes";
const ACCESS_KEY_FROM: &str = "access_keys k LEFT JOIN identities i ON i.id = k.issued_for";
const GRANT_COLUMNS: &str =
    "id, organization_id, created_at, updated_at, created_by, subject, privilege, resource";
const DESTINATION_COLUMNS: &str = "id, organization_id, created_at, updated_at, name, unique_id, \
    kind, connection_url, connection_ca, resources, roles, version, last_seen_at";
const DEVICE_FLOW_COLUMNS: &str = "id, organization_id, created_at, updated_at, client_id, \
    user_code, device_code, expires_at, approved, approved_by, access_key_id, access_key_token, \
    last_polled_at";
const DESTINATION_CREDENTIAL_COLUMNS: &str = "id, organization_id, created_at, updated_at, \
    destination_id, requester_user_id, update_index, request_expires_at, answered, bearer_token, \
    credential_expires_at";
const TOKEN_COLUMNS: &str = "id, organization_id, created_at, token, identity_id, expires_at";

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: Id,
    organization_id: Id,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    name: String,
    kind: String,
    url: String,
    client_id: String,
    client_secret: String,
    auth_url: String,
    scopes: Vec<String>,
    allowed_domains: Vec<String>,
    private_key: String,
    client_email: String,
    domain_admin_email: String,
    created_by: Id,
}

impl TryFrom<ProviderRow> for Provider {
    type Error = DataError;

    fn try_from(row: ProviderRow) -> Result<Self, Self::Error> {
        let kind: ProviderKind = row
            .kind
            .parse()
            .map_err(|e: String| DataError::Backend(anyhow::anyhow!(e)))?;
        Ok(Provider {
            id: row.id,
            organization_id: row.organization_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            name: row.name,
            kind,
            url: row.url,
            client_id: row.client_id,
            client_secret: row.client_secret,
            auth_url: row.auth_url,
            scopes: row.scopes,
            allowed_domains: row.allowed_domains,
            private_key: row.private_key,
            client_email: row.client_email,
            domain_admin_email: row.domain_admin_email,
            created_by: row.created_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AccessKeyRow {
    id: Id,
    organization_id: Id,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    name: String,
    issued_for: Id,
    issued_for_name: Option<String>,
    provider_id: Id,
    expires_at: DateTime<Utc>,
    inactivity_extension: i64,
    inactivity_timeout_at: DateTime<Utc>,
    key_id: String,
    secret_hash: String,
    scopes: Vec<String>,
}

impl From<AccessKeyRow> for AccessKey {
    fn from(row: AccessKeyRow) -> Self {
        AccessKey {
            id: row.id,
            organization_id: row.organization_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            name: row.name,
            issued_for: row.issued_for,
            issued_for_name: row.issued_for_name.unwrap_or_default(),
            provider_id: row.provider_id,
            expires_at: row.expires_at,
            inactivity_extension: Duration::from_nanos(row.inactivity_extension.max(0) as u64),
            inactivity_timeout_at: row.inactivity_timeout_at,
            key_id: row.key_id,
            secret_hash: row.secret_hash,
            scopes: row.scopes,
        }
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    id: Id,
    organization_id: Id,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: Id,
    subject: String,
    privilege: String,
    resource: String,
}

impl TryFrom<GrantRow> for Grant {
    type Error = DataError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let subject: Subject = row
            .subject
            .parse()
            .map_err(|e: String| DataError::Backend(anyhow::anyhow!(e)))?;
        Ok(Grant {
            id: row.id,
            organization_id: row.organization_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by,
            subject,
            privilege: row.privilege,
            resource: row.resource,
        })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn organization_id(&self) -> Option<Id> {
        self.org
    }

    fn set_organization_id(&mut self, id: Option<Id>) {
        self.org = id;
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn commit(&mut self) -> DataResult<()> {
        let tx = self.tx.take().ok_or(DataError::Closed)?;
        tx.commit().await.map_err(map_err)
    }

    async fn rollback(&mut self) -> DataResult<()> {
        let tx = self.tx.take().ok_or(DataError::Closed)?;
        tx.rollback().await.map_err(map_err)
    }

    // ==================== Organization Operations ====================

    async fn create_organization(&mut self, org: &mut Organization) -> DataResult<()> {
        if org.id.is_zero() {
            org.id = Id::new();
        }
        insert(
            self.conn()?,
            sqlx::query(
                r#"
                INSERT INTO organizations (id, created_at, updated_at, name, domain, created_by, allowed_domains)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(org.id)
            .bind(org.created_at)
            .bind(org.updated_at)
            .bind(&org.name)
            .bind(&org.domain)
            .bind(org.created_by)
            .bind(&org.allowed_domains),
        )
        .await?;
        Ok(())
    }

    async fn get_organization(&mut self, id: Id) -> DataResult<Organization> {
        let sql = format!(
            "SELECT {} FROM organizations WHERE id = $1 AND deleted_at IS NULL",
            ORGANIZATION_COLUMNS
        );
        sqlx::query_as::<_, Organization>(&sql)
            .bind(id)
            .fetch_one(self.conn()?)
            .await
            .map_err(map_err)
    }

    async fn get_organization_by_domain(&mut self, domain: &str) -> DataResult<Organization> {
        let sql = format!(
            "SELECT {} FROM organizations WHERE domain = $1 AND deleted_at IS NULL",
            ORGANIZATION_COLUMNS
        );
        sqlx::query_as::<_, Organization>(&sql)
            .bind(domain)
            .fetch_one(self.conn()?)
            .await
            .map_err(map_err)
    }

    // ==================== Identity Operations ====================

    async fn create_identity(&mut self, identity: &mut Identity) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if identity.id.is_zero() {
            identity.id = Id::new();
        }
        identity.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO identities (id, organization_id, created_at, updated_at, name, verified, last_seen_at, created_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(identity.id)
            .bind(org)
            .bind(identity.created_at)
            .bind(identity.updated_at)
            .bind(&identity.name)
            .bind(identity.verified)
            .bind(identity.last_seen_at)
            .bind(identity.created_by),
        )
        .await?;
        Ok(())
    }

    async fn get_identity(&mut self, id: Id) -> DataResult<Identity> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM identities WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            IDENTITY_COLUMNS
        );
        sqlx::query_as::<_, Identity>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn get_identity_by_name(&mut self, name: &str) -> DataResult<Identity> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM identities WHERE name = $1 AND organization_id = $2 AND deleted_at IS NULL",
            IDENTITY_COLUMNS
        );
        sqlx::query_as::<_, Identity>(&sql)
            .bind(name)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn list_identities(&mut self, opts: &ListIdentitiesOptions) -> DataResult<Paged<Identity>> {
        let (org, conn) = self.scoped()?;
        let (items, total_count) = fetch_paged::<Identity>(
            conn,
            IDENTITY_COLUMNS,
            "identities",
            |qb| {
                qb.push("organization_id = ")
                    .push_bind(org)
                    .push(" AND deleted_at IS NULL");
                if let Some(name) = &opts.name {
                    qb.push(" AND name = ").push_bind(name.clone());
                }
                if let Some(group) = opts.group_id {
                    qb.push(" AND id IN (SELECT identity_id FROM identities_groups WHERE group_id = ")
                        .push_bind(group)
                        .push(")");
                }
                if let Some(provider) = opts.provider_id {
                    qb.push(" AND id IN (SELECT identity_id FROM provider_users WHERE provider_id = ")
                        .push_bind(provider)
                        .push(")");
                }
                if let Some(ids) = &opts.ids {
                    let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
                    qb.push(" AND id = ANY(").push_bind(raw).push(")");
                }
            },
            "name ASC",
            opts.pagination,
        )
        .await?;
        Ok(Paged { items, total_count })
    }

    async fn update_identity(&mut self, identity: &Identity) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE identities SET updated_at = NOW(), name = $3, verified = $4
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(identity.id)
        .bind(org)
        .bind(&identity.name)
        .bind(identity.verified)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn update_identity_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE identities SET last_seen_at = $3 WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .bind(at)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_identity(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE identities SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(&mut *conn)
        .await
        .map_err(map_err)?;
        expect_one(result)?;

        sqlx::query("DELETE FROM identities_groups WHERE identity_id = $1 AND organization_id = $2")
            .bind(id)
            .bind(org)
            .execute(&mut *conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    // ==================== Group Operations ====================

    async fn create_group(&mut self, group: &mut Group) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if group.id.is_zero() {
            group.id = Id::new();
        }
        group.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO groups (id, organization_id, created_at, updated_at, name, created_by, created_by_provider)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(group.id)
            .bind(org)
            .bind(group.created_at)
            .bind(group.updated_at)
            .bind(&group.name)
            .bind(group.created_by)
            .bind(group.created_by_provider),
        )
        .await?;
        Ok(())
    }

    async fn get_group(&mut self, id: Id) -> DataResult<Group> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM groups WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            GROUP_COLUMNS
        );
        sqlx::query_as::<_, Group>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn get_group_by_name(&mut self, name: &str) -> DataResult<Group> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM groups WHERE name = $1 AND organization_id = $2 AND deleted_at IS NULL",
            GROUP_COLUMNS
        );
        sqlx::query_as::<_, Group>(&sql)
            .bind(name)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn list_groups(&mut self, opts: &ListGroupsOptions) -> DataResult<Paged<Group>> {
        let (org, conn) = self.scoped()?;
        let (items, total_count) = fetch_paged::<Group>(
            conn,
            GROUP_COLUMNS,
            "groups",
            |qb| {
                qb.push("organization_id = ")
                    .push_bind(org)
                    .push(" AND deleted_at IS NULL");
                if let Some(name) = &opts.name {
                    qb.push(" AND name = ").push_bind(name.clone());
                }
                if let Some(member) = opts.member_id {
                    qb.push(" AND id IN (SELECT group_id FROM identities_groups WHERE identity_id = ")
                        .push_bind(member)
                        .push(")");
                }
            },
            "name ASC",
            opts.pagination,
        )
        .await?;
        Ok(Paged { items, total_count })
    }

    async fn delete_group(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE groups SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(&mut *conn)
        .await
        .map_err(map_err)?;
        expect_one(result)?;

        sqlx::query("DELETE FROM identities_groups WHERE group_id = $1 AND organization_id = $2")
            .bind(id)
            .bind(org)
            .execute(&mut *conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn add_users_to_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        for user in user_ids {
            sqlx::query(
                r#"
                INSERT INTO identities_groups (organization_id, group_id, identity_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(org)
            .bind(group_id)
            .bind(*user)
            .execute(&mut *conn)
            .await
            .map_err(map_err)?;
        }
        Ok(())
    }

    async fn remove_users_from_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let raw: Vec<i64> = user_ids.iter().map(|id| id.0).collect();
        sqlx::query(
            "DELETE FROM identities_groups WHERE organization_id = $1 AND group_id = $2 AND identity_id = ANY($3)",
        )
        .bind(org)
        .bind(group_id)
        .bind(raw)
        .execute(conn)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn list_group_ids_for_user(&mut self, user_id: Id) -> DataResult<Vec<Id>> {
        let (org, conn) = self.scoped()?;
        sqlx::query_scalar::<_, Id>(
            "SELECT group_id FROM identities_groups WHERE organization_id = $1 AND identity_id = $2",
        )
        .bind(org)
        .bind(user_id)
        .fetch_all(conn)
        .await
        .map_err(map_err)
    }

    async fn count_group_members(&mut self, group_id: Id) -> DataResult<i64> {
        let (org, conn) = self.scoped()?;
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM identities_groups WHERE organization_id = $1 AND group_id = $2",
        )
        .bind(org)
        .bind(group_id)
        .fetch_one(conn)
        .await
        .map_err(map_err)
    }

    // ==================== Provider Operations ====================

    async fn create_provider(&mut self, provider: &mut Provider) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if provider.id.is_zero() {
            provider.id = Id::new();
        }
        provider.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO providers (id, organization_id, created_at, updated_at, name, kind, url,
                    client_id, client_secret, auth_url, scopes, allowed_domains, private_key,
                    client_email, domain_admin_email, created_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(provider.id)
            .bind(org)
            .bind(provider.created_at)
            .bind(provider.updated_at)
            .bind(&provider.name)
            .bind(provider.kind.as_str())
            .bind(&provider.url)
            .bind(&provider.client_id)
            .bind(&provider.client_secret)
            .bind(&provider.auth_url)
            .bind(&provider.scopes)
            .bind(&provider.allowed_domains)
            .bind(&provider.private_key)
            .bind(&provider.client_email)
            .bind(&provider.domain_admin_email)
            .bind(provider.created_by),
        )
        .await?;
        Ok(())
    }

    async fn get_provider(&mut self, id: Id) -> DataResult<Provider> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM providers WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            PROVIDER_COLUMNS
        );
        sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)?
            .try_into()
    }

    async fn get_provider_by_name(&mut self, name: &str) -> DataResult<Provider> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM providers WHERE name = $1 AND organization_id = $2 AND deleted_at IS NULL",
            PROVIDER_COLUMNS
        );
        sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(name)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)?
            .try_into()
    }

    async fn get_infra_provider(&mut self) -> DataResult<Provider> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM providers WHERE kind = $1 AND organization_id = $2 AND deleted_at IS NULL",
            PROVIDER_COLUMNS
        );
        sqlx::query_as::<_, ProviderRow>(&sql)
            .bind(ProviderKind::Infra.as_str())
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)?
            .try_into()
    }

    async fn list_providers(&mut self, opts: &ListProvidersOptions) -> DataResult<Paged<Provider>> {
        let (org, conn) = self.scoped()?;
        let (rows, total_count) = fetch_paged::<ProviderRow>(
            conn,
            PROVIDER_COLUMNS,
            "providers",
            |qb| {
                qb.push("organization_id = ")
                    .push_bind(org)
                    .push(" AND deleted_at IS NULL");
                if let Some(name) = &opts.name {
                    qb.push(" AND name = ").push_bind(name.clone());
                }
                if opts.exclude_infra {
                    qb.push(" AND kind <> ")
                        .push_bind(ProviderKind::Infra.as_str());
                }
            },
            "name ASC",
            opts.pagination,
        )
        .await?;
        let items = rows
            .into_iter()
            .map(Provider::try_from)
            .collect::<DataResult<Vec<_>>>()?;
        Ok(Paged { items, total_count })
    }

    async fn update_provider(&mut self, provider: &Provider) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE providers SET updated_at = NOW(), name = $3, url = $4, client_id = $5,
                client_secret = $6, auth_url = $7, scopes = $8, allowed_domains = $9,
                private_key = $10, client_email = $11, domain_admin_email = $12
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(provider.id)
        .bind(org)
        .bind(&provider.name)
        .bind(&provider.url)
        .bind(&provider.client_id)
        .bind(&provider.client_secret)
        .bind(&provider.auth_url)
        .bind(&provider.scopes)
        .bind(&provider.allowed_domains)
        .bind(&provider.private_key)
        .bind(&provider.client_email)
        .bind(&provider.domain_admin_email)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_provider(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE providers SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    // ==================== Provider User Operations ====================

    async fn upsert_provider_user(&mut self, user: &mut ProviderUser) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        user.organization_id = org;
        user.updated_at = Utc::now();
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO provider_users (identity_id, provider_id, organization_id, created_at,
                    updated_at, email, given_name, family_name, groups, last_update, redirect_url,
                    access_token, refresh_token, expires_at, active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (provider_id, identity_id) DO UPDATE SET
                    updated_at = EXCLUDED.updated_at, email = EXCLUDED.email,
                    given_name = EXCLUDED.given_name, family_name = EXCLUDED.family_name,
                    groups = EXCLUDED.groups, last_update = EXCLUDED.last_update,
                    redirect_url = EXCLUDED.redirect_url, access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token, expires_at = EXCLUDED.expires_at,
                    active = EXCLUDED.active
                "#,
            )
            .bind(user.identity_id)
            .bind(user.provider_id)
            .bind(org)
            .bind(user.created_at)
            .bind(user.updated_at)
            .bind(&user.email)
            .bind(&user.given_name)
            .bind(&user.family_name)
            .bind(&user.groups)
            .bind(user.last_update)
            .bind(&user.redirect_url)
            .bind(&user.access_token)
            .bind(&user.refresh_token)
            .bind(user.expires_at)
            .bind(user.active),
        )
        .await?;
        Ok(())
    }

    async fn get_provider_user(&mut self, provider_id: Id, identity_id: Id) -> DataResult<ProviderUser> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM provider_users WHERE provider_id = $1 AND identity_id = $2 AND organization_id = $3",
            PROVIDER_USER_COLUMNS
        );
        sqlx::query_as::<_, ProviderUser>(&sql)
            .bind(provider_id)
            .bind(identity_id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn list_provider_users(&mut self, opts: &ListProviderUsersOptions) -> DataResult<Paged<ProviderUser>> {
        let (org, conn) = self.scoped()?;
        let (items, total_count) = fetch_paged::<ProviderUser>(
            conn,
            PROVIDER_USER_COLUMNS,
            "provider_users",
            |qb| {
                qb.push("organization_id = ").push_bind(org);
                if let Some(provider) = opts.provider_id {
                    qb.push(" AND provider_id = ").push_bind(provider);
                }
            },
            "email ASC",
            opts.pagination,
        )
        .await?;
        Ok(Paged { items, total_count })
    }

    async fn delete_provider_users_for_identity(&mut self, identity_id: Id) -> DataResult<u64> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query("DELETE FROM provider_users WHERE identity_id = $1 AND organization_id = $2")
            .bind(identity_id)
            .bind(org)
            .execute(conn)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_provider_users_for_provider(&mut self, provider_id: Id) -> DataResult<u64> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query("DELETE FROM provider_users WHERE provider_id = $1 AND organization_id = $2")
            .bind(provider_id)
            .bind(org)
            .execute(conn)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    // ==================== Credential Operations ====================

    async fn create_credential(&mut self, credential: &mut Credential) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if credential.id.is_zero() {
            credential.id = Id::new();
        }
        credential.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO credentials (id, organization_id, created_at, updated_at, identity_id, password_hash, one_time_password)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(credential.id)
            .bind(org)
            .bind(credential.created_at)
            .bind(credential.updated_at)
            .bind(credential.identity_id)
            .bind(&credential.password_hash)
            .bind(credential.one_time_password),
        )
        .await?;
        Ok(())
    }

    async fn get_credential(&mut self, identity_id: Id) -> DataResult<Credential> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM credentials WHERE identity_id = $1 AND organization_id = $2",
            CREDENTIAL_COLUMNS
        );
        sqlx::query_as::<_, Credential>(&sql)
            .bind(identity_id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn update_credential(&mut self, credential: &Credential) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE credentials SET updated_at = NOW(), password_hash = $3, one_time_password = $4
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(credential.id)
        .bind(org)
        .bind(&credential.password_hash)
        .bind(credential.one_time_password)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_credential(&mut self, identity_id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        sqlx::query("DELETE FROM credentials WHERE identity_id = $1 AND organization_id = $2")
            .bind(identity_id)
            .bind(org)
            .execute(conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    // ==================== Access Key Operations ====================

    async fn create_access_key(&mut self, key: &mut AccessKey) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if key.id.is_zero() {
            key.id = Id::new();
        }
        key.organization_id = org;
        insert(
            &mut *conn,
            sqlx::query(
                r#"
                INSERT INTO access_keys (id, organization_id, created_at, updated_at, name, issued_for,
                    provider_id, expires_at, inactivity_extension, inactivity_timeout_at, key_id,
                    secret_hash, scopes)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(key.id)
            .bind(org)
            .bind(key.created_at)
            .bind(key.updated_at)
            .bind(&key.name)
            .bind(key.issued_for)
            .bind(key.provider_id)
            .bind(key.expires_at)
            .bind(nanos(key.inactivity_extension))
            .bind(key.inactivity_timeout_at)
            .bind(&key.key_id)
            .bind(&key.secret_hash)
            .bind(&key.scopes),
        )
        .await?;

        key.issued_for_name = sqlx::query_scalar::<_, String>("SELECT name FROM identities WHERE id = $1")
            .bind(key.issued_for)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_err)?
            .unwrap_or_default();
        Ok(())
    }

    async fn get_access_key(&mut self, id: Id) -> DataResult<AccessKey> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE k.id = $1 AND k.organization_id = $2 AND k.deleted_at IS NULL",
            ACCESS_KEY_COLUMNS, ACCESS_KEY_FROM
        );
        sqlx::query_as::<_, AccessKeyRow>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map(AccessKey::from)
            .map_err(map_err)
    }

    async fn get_access_key_by_key_id(&mut self, key_id: &str) -> DataResult<AccessKey> {
        let org = self.org;
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE k.key_id = $1 AND ($2::BIGINT IS NULL OR k.organization_id = $2) AND k.deleted_at IS NULL",
            ACCESS_KEY_COLUMNS, ACCESS_KEY_FROM
        );
        sqlx::query_as::<_, AccessKeyRow>(&sql)
            .bind(key_id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map(AccessKey::from)
            .map_err(map_err)
    }

    async fn list_access_keys(&mut self, opts: &ListAccessKeysOptions) -> DataResult<Paged<AccessKey>> {
        let (org, conn) = self.scoped()?;
        let now = Utc::now();
        let (rows, total_count) = fetch_paged::<AccessKeyRow>(
            conn,
            ACCESS_KEY_COLUMNS,
            ACCESS_KEY_FROM,
            |qb| {
                qb.push("k.organization_id = ")
                    .push_bind(org)
                    .push(" AND k.deleted_at IS NULL");
                if let Some(issued_for) = opts.issued_for {
                    qb.push(" AND k.issued_for = ").push_bind(issued_for);
                }
                if let Some(name) = &opts.name {
                    qb.push(" AND k.name = ").push_bind(name.clone());
                }
                if !opts.include_expired {
                    qb.push(" AND k.expires_at > ")
                        .push_bind(now)
                        .push(" AND k.inactivity_timeout_at > ")
                        .push_bind(now);
                }
            },
            "k.name ASC, k.id ASC",
            opts.pagination,
        )
        .await?;
        Ok(Paged {
            items: rows.into_iter().map(AccessKey::from).collect(),
            total_count,
        })
    }

    async fn update_access_key(&mut self, key: &AccessKey) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE access_keys SET updated_at = $3, name = $4, expires_at = $5,
                inactivity_extension = $6, inactivity_timeout_at = $7, scopes = $8
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(key.id)
        .bind(org)
        .bind(key.updated_at)
        .bind(&key.name)
        .bind(key.expires_at)
        .bind(nanos(key.inactivity_extension))
        .bind(key.inactivity_timeout_at)
        .bind(&key.scopes)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_access_key(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE access_keys SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_access_keys_for_identity(&mut self, identity_id: Id) -> DataResult<u64> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE access_keys SET deleted_at = NOW() WHERE issued_for = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(identity_id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_access_keys_for_provider(&mut self, provider_id: Id) -> DataResult<u64> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE access_keys SET deleted_at = NOW() WHERE provider_id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(provider_id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_access_keys(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM access_keys WHERE expires_at <= $1")
            .bind(before)
            .execute(self.conn()?)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    // ==================== Grant Operations ====================

    async fn create_grant(&mut self, grant: &mut Grant) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if grant.id.is_zero() {
            grant.id = Id::new();
        }
        grant.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO grants (id, organization_id, created_at, updated_at, created_by, subject, privilege, resource)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(grant.id)
            .bind(org)
            .bind(grant.created_at)
            .bind(grant.updated_at)
            .bind(grant.created_by)
            .bind(grant.subject.to_string())
            .bind(&grant.privilege)
            .bind(&grant.resource),
        )
        .await?;
        Ok(())
    }

    async fn get_grant(&mut self, id: Id) -> DataResult<Grant> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM grants WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            GRANT_COLUMNS
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)?
            .try_into()
    }

    async fn find_grant(&mut self, subject: Subject, privilege: &str, resource: &str) -> DataResult<Grant> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM grants WHERE organization_id = $1 AND subject = $2 AND privilege = $3 \
             AND resource = $4 AND deleted_at IS NULL",
            GRANT_COLUMNS
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(org)
            .bind(subject.to_string())
            .bind(privilege)
            .bind(resource)
            .fetch_one(conn)
            .await
            .map_err(map_err)?
            .try_into()
    }

    async fn list_grants(&mut self, opts: &ListGrantsOptions) -> DataResult<Paged<Grant>> {
        let (org, conn) = self.scoped()?;
        let (rows, total_count) = fetch_paged::<GrantRow>(
            conn,
            GRANT_COLUMNS,
            "grants",
            |qb| {
                qb.push("organization_id = ")
                    .push_bind(org)
                    .push(" AND deleted_at IS NULL");
                if !opts.subjects.is_empty() {
                    let subjects: Vec<String> = opts.subjects.iter().map(|s| s.to_string()).collect();
                    qb.push(" AND subject = ANY(").push_bind(subjects).push(")");
                }
                if let Some(resource) = &opts.resource {
                    qb.push(" AND resource = ").push_bind(resource.clone());
                }
                if let Some(privilege) = &opts.privilege {
                    qb.push(" AND privilege = ").push_bind(privilege.clone());
                }
                if let Some(destination) = &opts.destination {
                    qb.push(" AND (resource = ")
                        .push_bind(destination.clone())
                        .push(" OR starts_with(resource, ")
                        .push_bind(format!("{}.", destination))
                        .push("))");
                }
                if opts.exclude_connector {
                    qb.push(" AND NOT (privilege = ")
                        .push_bind(ROLE_CONNECTOR)
                        .push(" AND resource = ")
                        .push_bind(RESOURCE_INFRA)
                        .push(")");
                }
            },
            "id ASC",
            opts.pagination,
        )
        .await?;
        let items = rows
            .into_iter()
            .map(Grant::try_from)
            .collect::<DataResult<Vec<_>>>()?;
        Ok(Paged { items, total_count })
    }

    async fn delete_grant(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE grants SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_grants_for_subject(&mut self, subject: Subject) -> DataResult<u64> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE grants SET deleted_at = NOW() WHERE subject = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(subject.to_string())
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn count_grants(&mut self, privilege: &str, resource: &str) -> DataResult<i64> {
        let (org, conn) = self.scoped()?;
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM grants WHERE organization_id = $1 AND privilege = $2 AND resource = $3 AND deleted_at IS NULL",
        )
        .bind(org)
        .bind(privilege)
        .bind(resource)
        .fetch_one(conn)
        .await
        .map_err(map_err)
    }

    // ==================== Destination Operations ====================

    async fn create_destination(&mut self, destination: &mut Destination) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if destination.id.is_zero() {
            destination.id = Id::new();
        }
        destination.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO destinations (id, organization_id, created_at, updated_at, name, unique_id,
                    kind, connection_url, connection_ca, resources, roles, version, last_seen_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(destination.id)
            .bind(org)
            .bind(destination.created_at)
            .bind(destination.updated_at)
            .bind(&destination.name)
            .bind(&destination.unique_id)
            .bind(&destination.kind)
            .bind(&destination.connection_url)
            .bind(&destination.connection_ca)
            .bind(&destination.resources)
            .bind(&destination.roles)
            .bind(&destination.version)
            .bind(destination.last_seen_at),
        )
        .await?;
        Ok(())
    }

    async fn get_destination(&mut self, id: Id) -> DataResult<Destination> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM destinations WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            DESTINATION_COLUMNS
        );
        sqlx::query_as::<_, Destination>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn get_destination_by_name(&mut self, name: &str) -> DataResult<Destination> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM destinations WHERE name = $1 AND organization_id = $2 AND deleted_at IS NULL",
            DESTINATION_COLUMNS
        );
        sqlx::query_as::<_, Destination>(&sql)
            .bind(name)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn get_destination_by_unique_id(&mut self, unique_id: &str) -> DataResult<Destination> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM destinations WHERE unique_id = $1 AND organization_id = $2 AND deleted_at IS NULL",
            DESTINATION_COLUMNS
        );
        sqlx::query_as::<_, Destination>(&sql)
            .bind(unique_id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn list_destinations(&mut self, opts: &ListDestinationsOptions) -> DataResult<Paged<Destination>> {
        let (org, conn) = self.scoped()?;
        let (items, total_count) = fetch_paged::<Destination>(
            conn,
            DESTINATION_COLUMNS,
            "destinations",
            |qb| {
                qb.push("organization_id = ")
                    .push_bind(org)
                    .push(" AND deleted_at IS NULL");
                if let Some(name) = &opts.name {
                    qb.push(" AND name = ").push_bind(name.clone());
                }
                if let Some(kind) = &opts.kind {
                    qb.push(" AND kind = ").push_bind(kind.clone());
                }
                if let Some(unique_id) = &opts.unique_id {
                    qb.push(" AND unique_id = ").push_bind(unique_id.clone());
                }
            },
            "name ASC",
            opts.pagination,
        )
        .await?;
        Ok(Paged { items, total_count })
    }

    async fn update_destination(&mut self, destination: &Destination) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE destinations SET updated_at = NOW(), name = $3, unique_id = $4, kind = $5,
                connection_url = $6, connection_ca = $7, resources = $8, roles = $9, version = $10,
                last_seen_at = $11
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(destination.id)
        .bind(org)
        .bind(&destination.name)
        .bind(&destination.unique_id)
        .bind(&destination.kind)
        .bind(&destination.connection_url)
        .bind(&destination.connection_ca)
        .bind(&destination.resources)
        .bind(&destination.roles)
        .bind(&destination.version)
        .bind(destination.last_seen_at)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn update_destination_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE destinations SET last_seen_at = $3 WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .bind(at)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_destination(&mut self, id: Id) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            "UPDATE destinations SET deleted_at = NOW() WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(org)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    // ==================== Device Flow Operations ====================

    async fn create_device_flow_auth_request(&mut self, req: &mut DeviceFlowAuthRequest) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if req.id.is_zero() {
            req.id = Id::new();
        }
        req.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO device_flow_auth_requests (id, organization_id, created_at, updated_at,
                    client_id, user_code, device_code, expires_at, approved, approved_by,
                    access_key_id, access_key_token, last_polled_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(req.id)
            .bind(org)
            .bind(req.created_at)
            .bind(req.updated_at)
            .bind(&req.client_id)
            .bind(&req.user_code)
            .bind(&req.device_code)
            .bind(req.expires_at)
            .bind(req.approved)
            .bind(req.approved_by)
            .bind(req.access_key_id)
            .bind(&req.access_key_token)
            .bind(req.last_polled_at),
        )
        .await?;
        Ok(())
    }

    async fn get_device_flow_auth_request_by_user_code(&mut self, user_code: &str) -> DataResult<DeviceFlowAuthRequest> {
        let lock = self.row_lock();
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM device_flow_auth_requests WHERE user_code = $1 AND organization_id = $2{}",
            DEVICE_FLOW_COLUMNS, lock
        );
        sqlx::query_as::<_, DeviceFlowAuthRequest>(&sql)
            .bind(user_code)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn get_device_flow_auth_request_by_device_code(&mut self, device_code: &str) -> DataResult<DeviceFlowAuthRequest> {
        let lock = self.row_lock();
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM device_flow_auth_requests WHERE device_code = $1 AND organization_id = $2{}",
            DEVICE_FLOW_COLUMNS, lock
        );
        sqlx::query_as::<_, DeviceFlowAuthRequest>(&sql)
            .bind(device_code)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn update_device_flow_auth_request(&mut self, req: &DeviceFlowAuthRequest) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE device_flow_auth_requests SET updated_at = NOW(), approved = $3, approved_by = $4,
                access_key_id = $5, access_key_token = $6, last_polled_at = $7
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(req.id)
        .bind(org)
        .bind(req.approved)
        .bind(req.approved_by)
        .bind(req.access_key_id)
        .bind(&req.access_key_token)
        .bind(req.last_polled_at)
        .execute(conn)
        .await
        .map_err(map_err)?;
        expect_one(result)
    }

    async fn delete_expired_device_flow_auth_requests(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM device_flow_auth_requests WHERE expires_at <= $1")
            .bind(before)
            .execute(self.conn()?)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    // ==================== Destination Credential Operations ====================

    async fn create_destination_credential(&mut self, cred: &mut DestinationCredential) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if cred.id.is_zero() {
            cred.id = Id::new();
        }
        cred.organization_id = org;
        cred.update_index = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO destination_credentials (id, organization_id, created_at, updated_at,
                destination_id, requester_user_id, update_index, request_expires_at, answered)
            VALUES ($1, $2, $3, $4, $5, $6, nextval('destination_credentials_update_index_seq'), $7, FALSE)
            RETURNING update_index
            "#,
        )
        .bind(cred.id)
        .bind(org)
        .bind(cred.created_at)
        .bind(cred.updated_at)
        .bind(cred.destination_id)
        .bind(cred.requester_user_id)
        .bind(cred.request_expires_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(map_err)?;

        notify_destination(conn, cred.destination_id).await
    }

    async fn get_destination_credential(&mut self, id: Id) -> DataResult<DestinationCredential> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM destination_credentials WHERE id = $1 AND organization_id = $2",
            DESTINATION_CREDENTIAL_COLUMNS
        );
        sqlx::query_as::<_, DestinationCredential>(&sql)
            .bind(id)
            .bind(org)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn answer_destination_credential(&mut self, cred: &DestinationCredential) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        let result = sqlx::query(
            r#"
            UPDATE destination_credentials SET updated_at = NOW(), answered = TRUE,
                bearer_token = $4, credential_expires_at = $5
            WHERE id = $1 AND organization_id = $2 AND destination_id = $3
            "#,
        )
        .bind(cred.id)
        .bind(org)
        .bind(cred.destination_id)
        .bind(&cred.bearer_token)
        .bind(cred.credential_expires_at)
        .execute(&mut *conn)
        .await
        .map_err(map_err)?;
        expect_one(result)?;

        notify_destination(conn, cred.destination_id).await
    }

    async fn list_destination_credentials(
        &mut self,
        destination_id: Id,
        after_index: i64,
        now: DateTime<Utc>,
    ) -> DataResult<Vec<DestinationCredential>> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "SELECT {} FROM destination_credentials WHERE organization_id = $1 AND destination_id = $2 \
             AND update_index > $3 AND answered = FALSE AND request_expires_at > $4 \
             ORDER BY update_index ASC",
            DESTINATION_CREDENTIAL_COLUMNS
        );
        sqlx::query_as::<_, DestinationCredential>(&sql)
            .bind(org)
            .bind(destination_id)
            .bind(after_index)
            .bind(now)
            .fetch_all(conn)
            .await
            .map_err(map_err)
    }

    async fn max_destination_credential_update_index(&mut self, destination_id: Id) -> DataResult<Option<i64>> {
        let (org, conn) = self.scoped()?;
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(update_index) FROM destination_credentials WHERE organization_id = $1 AND destination_id = $2",
        )
        .bind(org)
        .bind(destination_id)
        .fetch_one(conn)
        .await
        .map_err(map_err)
    }

    async fn delete_expired_destination_credentials(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM destination_credentials WHERE request_expires_at <= $1")
            .bind(before)
            .execute(self.conn()?)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    // ==================== Token Operations ====================

    async fn create_password_reset_token(&mut self, token: &mut PasswordResetToken) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if token.id.is_zero() {
            token.id = Id::new();
        }
        token.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO password_reset_tokens (id, organization_id, created_at, token, identity_id, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(token.id)
            .bind(org)
            .bind(token.created_at)
            .bind(&token.token)
            .bind(token.identity_id)
            .bind(token.expires_at),
        )
        .await?;
        Ok(())
    }

    async fn claim_password_reset_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<PasswordResetToken> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "DELETE FROM password_reset_tokens WHERE token = $1 AND organization_id = $2 AND expires_at > $3 RETURNING {}",
            TOKEN_COLUMNS
        );
        sqlx::query_as::<_, PasswordResetToken>(&sql)
            .bind(token)
            .bind(org)
            .bind(now)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn delete_expired_password_reset_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at <= $1")
            .bind(before)
            .execute(self.conn()?)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn create_email_verification_token(&mut self, token: &mut EmailVerificationToken) -> DataResult<()> {
        let (org, conn) = self.scoped()?;
        if token.id.is_zero() {
            token.id = Id::new();
        }
        token.organization_id = org;
        insert(
            conn,
            sqlx::query(
                r#"
                INSERT INTO email_verification_tokens (id, organization_id, created_at, token, identity_id, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(token.id)
            .bind(org)
            .bind(token.created_at)
            .bind(&token.token)
            .bind(token.identity_id)
            .bind(token.expires_at),
        )
        .await?;
        Ok(())
    }

    async fn claim_email_verification_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<EmailVerificationToken> {
        let (org, conn) = self.scoped()?;
        let sql = format!(
            "DELETE FROM email_verification_tokens WHERE token = $1 AND organization_id = $2 AND expires_at > $3 RETURNING {}",
            TOKEN_COLUMNS
        );
        sqlx::query_as::<_, EmailVerificationToken>(&sql)
            .bind(token)
            .bind(org)
            .bind(now)
            .fetch_one(conn)
            .await
            .map_err(map_err)
    }

    async fn delete_expired_email_verification_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM email_verification_tokens WHERE expires_at <= $1")
            .bind(before)
            .execute(self.conn()?)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}

/// Delivered to listeners when the surrounding transaction commits.
async fn notify_destination(conn: &mut PgConnection, destination_id: Id) -> DataResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(DESTINATION_CREDENTIALS_CHANNEL)
        .bind(destination_id.0.to_string())
        .execute(conn)
        .await
        .map_err(map_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_index_names_map_to_columns() {
        match unique_from_constraint("idx_identities_name") {
            DataError::UniqueConstraint { table, column } => {
                assert_eq!(table, "identities");
                assert_eq!(column, "name");
            }
            other => panic!("unexpected {:?}", other),
        }
        match unique_from_constraint("idx_device_flow_auth_requests_user_code") {
            DataError::UniqueConstraint { table, column } => {
                assert_eq!(table, "device_flow_auth_requests");
                assert_eq!(column, "user_code");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn extension_is_stored_in_nanoseconds() {
        assert_eq!(nanos(Duration::from_secs(1)), 1_000_000_000);
        assert_eq!(nanos(Duration::MAX), i64::MAX);
    }

    async fn test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/control_plane_test".to_string());
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_transaction_round_trip() {
        let store = test_store().await;

        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(Id::new()));
        let mut group = Group::new("devs", Id(0));
        tx.create_group(&mut group).await.unwrap();
        assert_eq!(tx.get_group(group.id).await.unwrap().name, "devs");
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn duplicate_grant_leaves_the_transaction_usable() {
        let store = test_store().await;
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(Id::new()));
        let mut identity = Identity::new("grantee@example.com", Id(0));
        tx.create_identity(&mut identity).await.unwrap();

        let subject = Subject::User(identity.id);
        let first = crate::services::grants::create(tx.as_mut(), subject, "view", "prod", Id(0))
            .await
            .unwrap();
        let second = crate::services::grants::create(tx.as_mut(), subject, "view", "prod", Id(0))
            .await
            .unwrap();

        assert!(first.was_created);
        assert!(!second.was_created);
        assert_eq!(second.grant.id, first.grant.id);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn device_requests_are_locked_until_commit() {
        let store = test_store().await;
        let org = Id::new();
        let mut setup = store.begin(TxOptions::read_write()).await.unwrap();
        setup.set_organization_id(Some(org));
        let mut request = DeviceFlowAuthRequest::new(
            "cli",
            format!("user-{}", org),
            format!("device-{}", org),
            Utc::now() + chrono::Duration::minutes(30),
        );
        setup.create_device_flow_auth_request(&mut request).await.unwrap();
        setup.commit().await.unwrap();

        let mut holder = store.begin(TxOptions::read_write()).await.unwrap();
        holder.set_organization_id(Some(org));
        holder
            .get_device_flow_auth_request_by_device_code(&request.device_code)
            .await
            .unwrap();

        let contender_store = store.clone();
        let device_code = request.device_code.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_store.begin(TxOptions::read_write()).await.unwrap();
            tx.set_organization_id(Some(org));
            let seen = tx.get_device_flow_auth_request_by_device_code(&device_code).await.unwrap();
            tx.rollback().await.unwrap();
            seen
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!contender.is_finished());

        request.approved = Some(true);
        holder.update_device_flow_auth_request(&request).await.unwrap();
        holder.commit().await.unwrap();

        assert_eq!(contender.await.unwrap().approved, Some(true));
    }
}
