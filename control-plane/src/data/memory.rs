//! In-process store.
//!
//! Transactions are serialised through one async mutex; a read-write
//! transaction snapshots the tables at begin and restores them on rollback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    DataError, DataResult, ListAccessKeysOptions, ListDestinationsOptions, ListGrantsOptions,
    ListGroupsOptions, ListIdentitiesOptions, ListProviderUsersOptions, ListProvidersOptions,
    Paged, Store, Transaction, TxOptions,
};
use crate::models::grant::{RESOURCE_INFRA, ROLE_CONNECTOR};
use crate::models::{
    AccessKey, Credential, Destination, DestinationCredential, DeviceFlowAuthRequest,
    EmailVerificationToken, Grant, Group, Identity, Organization, PasswordResetToken, Provider,
    ProviderKind, ProviderUser, Subject,
};
use crate::uid::Id;

#[derive(Debug, Clone, Default)]
struct Tables {
    organizations: BTreeMap<Id, Organization>,
    identities: BTreeMap<Id, Identity>,
    groups: BTreeMap<Id, Group>,
    /// (group, identity)
    memberships: BTreeSet<(Id, Id)>,
    providers: BTreeMap<Id, Provider>,
    /// Keyed by (provider, identity).
    provider_users: BTreeMap<(Id, Id), ProviderUser>,
    credentials: BTreeMap<Id, Credential>,
    access_keys: BTreeMap<Id, AccessKey>,
    grants: BTreeMap<Id, Grant>,
    destinations: BTreeMap<Id, Destination>,
    device_flows: BTreeMap<Id, DeviceFlowAuthRequest>,
    destination_credentials: BTreeMap<Id, DestinationCredential>,
    password_reset_tokens: BTreeMap<Id, PasswordResetToken>,
    email_verification_tokens: BTreeMap<Id, EmailVerificationToken>,
    update_index: i64,
}

impl Tables {
    fn issued_for_name(&self, mut key: AccessKey) -> AccessKey {
        key.issued_for_name = self
            .identities
            .get(&key.issued_for)
            .map(|i| i.name.clone())
            .unwrap_or_default();
        key
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, opts: TxOptions) -> DataResult<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let snapshot = if opts.read_only {
            None
        } else {
            Some(guard.clone())
        };
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            snapshot,
            org: None,
            read_only: opts.read_only,
        }))
    }

    async fn health_check(&self) -> DataResult<()> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<Tables>>,
    snapshot: Option<Tables>,
    org: Option<Id>,
    read_only: bool,
}

impl MemoryTransaction {
    fn tables(&mut self) -> DataResult<&mut Tables> {
        self.guard.as_deref_mut().ok_or(DataError::Closed)
    }

    fn writable(&mut self) -> DataResult<&mut Tables> {
        if self.read_only {
            return Err(DataError::ReadOnly);
        }
        self.tables()
    }

    fn org(&self) -> DataResult<Id> {
        self.org.ok_or(DataError::OrganizationRequired)
    }

    fn restore(&mut self) {
        if let (Some(guard), Some(snapshot)) = (self.guard.as_mut(), self.snapshot.take()) {
            **guard = snapshot;
        }
        self.guard = None;
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

fn assign_id(id: &mut Id) {
    if id.is_zero() {
        *id = Id::new();
    }
}

fn matches_opt(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().map_or(true, |f| f == value)
}

#[async_trait]
impl Transaction for MemoryTransaction {
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
        if self.guard.is_none() {
            return Err(DataError::Closed);
        }
        self.snapshot = None;
        self.guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> DataResult<()> {
        if self.guard.is_none() {
            return Err(DataError::Closed);
        }
        self.restore();
        Ok(())
    }

    // ==================== Organization Operations ====================

    async fn create_organization(&mut self, org: &mut Organization) -> DataResult<()> {
        let t = self.writable()?;
        if t.organizations.values().any(|o| o.domain == org.domain) {
            return Err(DataError::unique("organizations", "domain"));
        }
        assign_id(&mut org.id);
        t.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&mut self, id: Id) -> DataResult<Organization> {
        let t = self.tables()?;
        t.organizations.get(&id).cloned().ok_or(DataError::NotFound)
    }

    async fn get_organization_by_domain(&mut self, domain: &str) -> DataResult<Organization> {
        let t = self.tables()?;
        t.organizations
            .values()
            .find(|o| o.domain == domain)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    // ==================== Identity Operations ====================

    async fn create_identity(&mut self, identity: &mut Identity) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t
            .identities
            .values()
            .any(|i| i.organization_id == org && i.name == identity.name)
        {
            return Err(DataError::unique("identities", "name"));
        }
        assign_id(&mut identity.id);
        identity.organization_id = org;
        t.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn get_identity(&mut self, id: Id) -> DataResult<Identity> {
        let org = self.org()?;
        let t = self.tables()?;
        t.identities
            .get(&id)
            .filter(|i| i.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_identity_by_name(&mut self, name: &str) -> DataResult<Identity> {
        let org = self.org()?;
        let t = self.tables()?;
        t.identities
            .values()
            .find(|i| i.organization_id == org && i.name == name)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_identities(&mut self, opts: &ListIdentitiesOptions) -> DataResult<Paged<Identity>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<Identity> = t
            .identities
            .values()
            .filter(|i| i.organization_id == org)
            .filter(|i| matches_opt(&opts.name, &i.name))
            .filter(|i| {
                opts.group_id
                    .map_or(true, |g| t.memberships.contains(&(g, i.id)))
            })
            .filter(|i| {
                opts.provider_id
                    .map_or(true, |p| t.provider_users.contains_key(&(p, i.id)))
            })
            .filter(|i| opts.ids.as_ref().map_or(true, |ids| ids.contains(&i.id)))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn update_identity(&mut self, identity: &Identity) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.identities.values().any(|i| {
            i.organization_id == org && i.id != identity.id && i.name == identity.name
        }) {
            return Err(DataError::unique("identities", "name"));
        }
        let existing = t
            .identities
            .get_mut(&identity.id)
            .filter(|i| i.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = identity.clone();
        existing.organization_id = org;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn update_identity_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .identities
            .get_mut(&id)
            .filter(|i| i.organization_id == org)
            .ok_or(DataError::NotFound)?;
        existing.last_seen_at = Some(at);
        Ok(())
    }

    async fn delete_identity(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.identities.get(&id) {
            Some(i) if i.organization_id == org => {
                t.identities.remove(&id);
                t.memberships.retain(|(_, member)| *member != id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    // ==================== Group Operations ====================

    async fn create_group(&mut self, group: &mut Group) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t
            .groups
            .values()
            .any(|g| g.organization_id == org && g.name == group.name)
        {
            return Err(DataError::unique("groups", "name"));
        }
        assign_id(&mut group.id);
        group.organization_id = org;
        t.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_group(&mut self, id: Id) -> DataResult<Group> {
        let org = self.org()?;
        let t = self.tables()?;
        t.groups
            .get(&id)
            .filter(|g| g.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_group_by_name(&mut self, name: &str) -> DataResult<Group> {
        let org = self.org()?;
        let t = self.tables()?;
        t.groups
            .values()
            .find(|g| g.organization_id == org && g.name == name)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_groups(&mut self, opts: &ListGroupsOptions) -> DataResult<Paged<Group>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<Group> = t
            .groups
            .values()
            .filter(|g| g.organization_id == org)
            .filter(|g| matches_opt(&opts.name, &g.name))
            .filter(|g| {
                opts.member_id
                    .map_or(true, |m| t.memberships.contains(&(g.id, m)))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn delete_group(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.groups.get(&id) {
            Some(g) if g.organization_id == org => {
                t.groups.remove(&id);
                t.memberships.retain(|(group, _)| *group != id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    async fn add_users_to_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if !t.groups.get(&group_id).is_some_and(|g| g.organization_id == org) {
            return Err(DataError::NotFound);
        }
        for user in user_ids {
            if !t.identities.get(user).is_some_and(|i| i.organization_id == org) {
                return Err(DataError::NotFound);
            }
            t.memberships.insert((group_id, *user));
        }
        Ok(())
    }

    async fn remove_users_from_group(&mut self, group_id: Id, user_ids: &[Id]) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if !t.groups.get(&group_id).is_some_and(|g| g.organization_id == org) {
            return Err(DataError::NotFound);
        }
        for user in user_ids {
            t.memberships.remove(&(group_id, *user));
        }
        Ok(())
    }

    async fn list_group_ids_for_user(&mut self, user_id: Id) -> DataResult<Vec<Id>> {
        let org = self.org()?;
        let t = self.tables()?;
        Ok(t
            .memberships
            .iter()
            .filter(|(group, member)| {
                *member == user_id && t.groups.get(group).is_some_and(|g| g.organization_id == org)
            })
            .map(|(group, _)| *group)
            .collect())
    }

    async fn count_group_members(&mut self, group_id: Id) -> DataResult<i64> {
        self.org()?;
        let t = self.tables()?;
        Ok(t.memberships.iter().filter(|(g, _)| *g == group_id).count() as i64)
    }

    // ==================== Provider Operations ====================

    async fn create_provider(&mut self, provider: &mut Provider) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t
            .providers
            .values()
            .any(|p| p.organization_id == org && p.name == provider.name)
        {
            return Err(DataError::unique("providers", "name"));
        }
        assign_id(&mut provider.id);
        provider.organization_id = org;
        t.providers.insert(provider.id, provider.clone());
        Ok(())
    }

    async fn get_provider(&mut self, id: Id) -> DataResult<Provider> {
        let org = self.org()?;
        let t = self.tables()?;
        t.providers
            .get(&id)
            .filter(|p| p.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_provider_by_name(&mut self, name: &str) -> DataResult<Provider> {
        let org = self.org()?;
        let t = self.tables()?;
        t.providers
            .values()
            .find(|p| p.organization_id == org && p.name == name)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_infra_provider(&mut self) -> DataResult<Provider> {
        let org = self.org()?;
        let t = self.tables()?;
        t.providers
            .values()
            .find(|p| p.organization_id == org && p.kind == ProviderKind::Infra)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_providers(&mut self, opts: &ListProvidersOptions) -> DataResult<Paged<Provider>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<Provider> = t
            .providers
            .values()
            .filter(|p| p.organization_id == org)
            .filter(|p| matches_opt(&opts.name, &p.name))
            .filter(|p| !(opts.exclude_infra && p.kind == ProviderKind::Infra))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn update_provider(&mut self, provider: &Provider) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.providers.values().any(|p| {
            p.organization_id == org && p.id != provider.id && p.name == provider.name
        }) {
            return Err(DataError::unique("providers", "name"));
        }
        let existing = t
            .providers
            .get_mut(&provider.id)
            .filter(|p| p.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = provider.clone();
        existing.organization_id = org;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_provider(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.providers.get(&id) {
            Some(p) if p.organization_id == org => {
                t.providers.remove(&id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    // ==================== Provider User Operations ====================

    async fn upsert_provider_user(&mut self, user: &mut ProviderUser) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        user.organization_id = org;
        user.updated_at = Utc::now();
        if let Some(existing) = t.provider_users.get(&(user.provider_id, user.identity_id)) {
            user.created_at = existing.created_at;
        }
        t.provider_users
            .insert((user.provider_id, user.identity_id), user.clone());
        Ok(())
    }

    async fn get_provider_user(&mut self, provider_id: Id, identity_id: Id) -> DataResult<ProviderUser> {
        let org = self.org()?;
        let t = self.tables()?;
        t.provider_users
            .get(&(provider_id, identity_id))
            .filter(|u| u.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_provider_users(&mut self, opts: &ListProviderUsersOptions) -> DataResult<Paged<ProviderUser>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<ProviderUser> = t
            .provider_users
            .values()
            .filter(|u| u.organization_id == org)
            .filter(|u| opts.provider_id.map_or(true, |p| u.provider_id == p))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn delete_provider_users_for_identity(&mut self, identity_id: Id) -> DataResult<u64> {
        let org = self.org()?;
        let t = self.writable()?;
        let before = t.provider_users.len();
        t.provider_users
            .retain(|(_, ident), u| !(u.organization_id == org && *ident == identity_id));
        Ok((before - t.provider_users.len()) as u64)
    }

    async fn delete_provider_users_for_provider(&mut self, provider_id: Id) -> DataResult<u64> {
        let org = self.org()?;
        let t = self.writable()?;
        let before = t.provider_users.len();
        t.provider_users
            .retain(|(prov, _), u| !(u.organization_id == org && *prov == provider_id));
        Ok((before - t.provider_users.len()) as u64)
    }

    // ==================== Credential Operations ====================

    async fn create_credential(&mut self, credential: &mut Credential) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t
            .credentials
            .values()
            .any(|c| c.organization_id == org && c.identity_id == credential.identity_id)
        {
            return Err(DataError::unique("credentials", "identity_id"));
        }
        assign_id(&mut credential.id);
        credential.organization_id = org;
        t.credentials.insert(credential.id, credential.clone());
        Ok(())
    }

    async fn get_credential(&mut self, identity_id: Id) -> DataResult<Credential> {
        let org = self.org()?;
        let t = self.tables()?;
        t.credentials
            .values()
            .find(|c| c.organization_id == org && c.identity_id == identity_id)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn update_credential(&mut self, credential: &Credential) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .credentials
            .get_mut(&credential.id)
            .filter(|c| c.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = credential.clone();
        existing.organization_id = org;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_credential(&mut self, identity_id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        t.credentials
            .retain(|_, c| !(c.organization_id == org && c.identity_id == identity_id));
        Ok(())
    }

    // ==================== Access Key Operations ====================

    async fn create_access_key(&mut self, key: &mut AccessKey) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.access_keys.values().any(|k| k.key_id == key.key_id) {
            return Err(DataError::unique("access_keys", "key_id"));
        }
        if t.access_keys.values().any(|k| {
            k.organization_id == org && k.issued_for == key.issued_for && k.name == key.name
        }) {
            return Err(DataError::unique("access_keys", "name"));
        }
        assign_id(&mut key.id);
        key.organization_id = org;
        t.access_keys.insert(key.id, key.clone());
        *key = t.issued_for_name(key.clone());
        Ok(())
    }

    async fn get_access_key(&mut self, id: Id) -> DataResult<AccessKey> {
        let org = self.org()?;
        let t = self.tables()?;
        let key = t
            .access_keys
            .get(&id)
            .filter(|k| k.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)?;
        Ok(t.issued_for_name(key))
    }

    async fn get_access_key_by_key_id(&mut self, key_id: &str) -> DataResult<AccessKey> {
        let org = self.org;
        let t = self.tables()?;
        let key = t
            .access_keys
            .values()
            .find(|k| k.key_id == key_id && org.map_or(true, |o| k.organization_id == o))
            .cloned()
            .ok_or(DataError::NotFound)?;
        Ok(t.issued_for_name(key))
    }

    async fn list_access_keys(&mut self, opts: &ListAccessKeysOptions) -> DataResult<Paged<AccessKey>> {
        let org = self.org()?;
        let now = Utc::now();
        let t = self.tables()?;
        let mut items: Vec<AccessKey> = t
            .access_keys
            .values()
            .filter(|k| k.organization_id == org)
            .filter(|k| opts.issued_for.map_or(true, |i| k.issued_for == i))
            .filter(|k| matches_opt(&opts.name, &k.name))
            .filter(|k| opts.include_expired || !k.is_expired(now))
            .cloned()
            .map(|k| t.issued_for_name(k))
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn update_access_key(&mut self, key: &AccessKey) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .access_keys
            .get_mut(&key.id)
            .filter(|k| k.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = key.clone();
        existing.organization_id = org;
        Ok(())
    }

    async fn delete_access_key(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.access_keys.get(&id) {
            Some(k) if k.organization_id == org => {
                t.access_keys.remove(&id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    async fn delete_access_keys_for_identity(&mut self, identity_id: Id) -> DataResult<u64> {
        let org = self.org()?;
        let t = self.writable()?;
        let before = t.access_keys.len();
        t.access_keys
            .retain(|_, k| !(k.organization_id == org && k.issued_for == identity_id));
        Ok((before - t.access_keys.len()) as u64)
    }

    async fn delete_access_keys_for_provider(&mut self, provider_id: Id) -> DataResult<u64> {
        let org = self.org()?;
        let t = self.writable()?;
        let before = t.access_keys.len();
        t.access_keys
            .retain(|_, k| !(k.organization_id == org && k.provider_id == provider_id));
        Ok((before - t.access_keys.len()) as u64)
    }

    async fn delete_expired_access_keys(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let t = self.writable()?;
        let count = t.access_keys.len();
        t.access_keys.retain(|_, k| k.expires_at > before);
        Ok((count - t.access_keys.len()) as u64)
    }

    // ==================== Grant Operations ====================

    async fn create_grant(&mut self, grant: &mut Grant) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.grants.values().any(|g| {
            g.organization_id == org
                && g.subject == grant.subject
                && g.privilege == grant.privilege
                && g.resource == grant.resource
        }) {
            return Err(DataError::unique("grants", "privilege"));
        }
        assign_id(&mut grant.id);
        grant.organization_id = org;
        t.grants.insert(grant.id, grant.clone());
        Ok(())
    }

    async fn get_grant(&mut self, id: Id) -> DataResult<Grant> {
        let org = self.org()?;
        let t = self.tables()?;
        t.grants
            .get(&id)
            .filter(|g| g.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn find_grant(&mut self, subject: Subject, privilege: &str, resource: &str) -> DataResult<Grant> {
        let org = self.org()?;
        let t = self.tables()?;
        t.grants
            .values()
            .find(|g| {
                g.organization_id == org
                    && g.subject == subject
                    && g.privilege == privilege
                    && g.resource == resource
            })
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_grants(&mut self, opts: &ListGrantsOptions) -> DataResult<Paged<Grant>> {
        let org = self.org()?;
        let t = self.tables()?;
        let items: Vec<Grant> = t
            .grants
            .values()
            .filter(|g| g.organization_id == org)
            .filter(|g| opts.subjects.is_empty() || opts.subjects.contains(&g.subject))
            .filter(|g| matches_opt(&opts.resource, &g.resource))
            .filter(|g| matches_opt(&opts.privilege, &g.privilege))
            .filter(|g| {
                opts.destination
                    .as_deref()
                    .map_or(true, |d| g.applies_to_destination(d))
            })
            .filter(|g| {
                !(opts.exclude_connector
                    && g.privilege == ROLE_CONNECTOR
                    && g.resource == RESOURCE_INFRA)
            })
            .cloned()
            .collect();
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn delete_grant(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.grants.get(&id) {
            Some(g) if g.organization_id == org => {
                t.grants.remove(&id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    async fn delete_grants_for_subject(&mut self, subject: Subject) -> DataResult<u64> {
        let org = self.org()?;
        let t = self.writable()?;
        let before = t.grants.len();
        t.grants
            .retain(|_, g| !(g.organization_id == org && g.subject == subject));
        Ok((before - t.grants.len()) as u64)
    }

    async fn count_grants(&mut self, privilege: &str, resource: &str) -> DataResult<i64> {
        let org = self.org()?;
        let t = self.tables()?;
        Ok(t.grants
            .values()
            .filter(|g| g.organization_id == org && g.privilege == privilege && g.resource == resource)
            .count() as i64)
    }

    // ==================== Destination Operations ====================

    async fn create_destination(&mut self, destination: &mut Destination) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t
            .destinations
            .values()
            .any(|d| d.organization_id == org && d.unique_id == destination.unique_id)
        {
            return Err(DataError::unique("destinations", "unique_id"));
        }
        if t
            .destinations
            .values()
            .any(|d| d.organization_id == org && d.name == destination.name)
        {
            return Err(DataError::unique("destinations", "name"));
        }
        assign_id(&mut destination.id);
        destination.organization_id = org;
        t.destinations.insert(destination.id, destination.clone());
        Ok(())
    }

    async fn get_destination(&mut self, id: Id) -> DataResult<Destination> {
        let org = self.org()?;
        let t = self.tables()?;
        t.destinations
            .get(&id)
            .filter(|d| d.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_destination_by_name(&mut self, name: &str) -> DataResult<Destination> {
        let org = self.org()?;
        let t = self.tables()?;
        t.destinations
            .values()
            .find(|d| d.organization_id == org && d.name == name)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_destination_by_unique_id(&mut self, unique_id: &str) -> DataResult<Destination> {
        let org = self.org()?;
        let t = self.tables()?;
        t.destinations
            .values()
            .find(|d| d.organization_id == org && d.unique_id == unique_id)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn list_destinations(&mut self, opts: &ListDestinationsOptions) -> DataResult<Paged<Destination>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<Destination> = t
            .destinations
            .values()
            .filter(|d| d.organization_id == org)
            .filter(|d| matches_opt(&opts.name, &d.name))
            .filter(|d| matches_opt(&opts.kind, &d.kind))
            .filter(|d| matches_opt(&opts.unique_id, &d.unique_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Paged::paginate(items, opts.pagination))
    }

    async fn update_destination(&mut self, destination: &Destination) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.destinations.values().any(|d| {
            d.organization_id == org && d.id != destination.id && d.unique_id == destination.unique_id
        }) {
            return Err(DataError::unique("destinations", "unique_id"));
        }
        if t.destinations.values().any(|d| {
            d.organization_id == org && d.id != destination.id && d.name == destination.name
        }) {
            return Err(DataError::unique("destinations", "name"));
        }
        let existing = t
            .destinations
            .get_mut(&destination.id)
            .filter(|d| d.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = destination.clone();
        existing.organization_id = org;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn update_destination_last_seen(&mut self, id: Id, at: DateTime<Utc>) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .destinations
            .get_mut(&id)
            .filter(|d| d.organization_id == org)
            .ok_or(DataError::NotFound)?;
        existing.last_seen_at = Some(at);
        Ok(())
    }

    async fn delete_destination(&mut self, id: Id) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        match t.destinations.get(&id) {
            Some(d) if d.organization_id == org => {
                t.destinations.remove(&id);
                Ok(())
            }
            _ => Err(DataError::NotFound),
        }
    }

    // ==================== Device Flow Operations ====================

    async fn create_device_flow_auth_request(&mut self, req: &mut DeviceFlowAuthRequest) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.device_flows.values().any(|d| d.user_code == req.user_code) {
            return Err(DataError::unique("device_flow_auth_requests", "user_code"));
        }
        if t.device_flows.values().any(|d| d.device_code == req.device_code) {
            return Err(DataError::unique("device_flow_auth_requests", "device_code"));
        }
        assign_id(&mut req.id);
        req.organization_id = org;
        t.device_flows.insert(req.id, req.clone());
        Ok(())
    }

    async fn get_device_flow_auth_request_by_user_code(&mut self, user_code: &str) -> DataResult<DeviceFlowAuthRequest> {
        let org = self.org()?;
        let t = self.tables()?;
        t.device_flows
            .values()
            .find(|d| d.organization_id == org && d.user_code == user_code)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn get_device_flow_auth_request_by_device_code(&mut self, device_code: &str) -> DataResult<DeviceFlowAuthRequest> {
        let org = self.org()?;
        let t = self.tables()?;
        t.device_flows
            .values()
            .find(|d| d.organization_id == org && d.device_code == device_code)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn update_device_flow_auth_request(&mut self, req: &DeviceFlowAuthRequest) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .device_flows
            .get_mut(&req.id)
            .filter(|d| d.organization_id == org)
            .ok_or(DataError::NotFound)?;
        *existing = req.clone();
        existing.organization_id = org;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_expired_device_flow_auth_requests(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let t = self.writable()?;
        let count = t.device_flows.len();
        t.device_flows.retain(|_, d| d.expires_at > before);
        Ok((count - t.device_flows.len()) as u64)
    }

    // ==================== Destination Credential Operations ====================

    async fn create_destination_credential(&mut self, cred: &mut DestinationCredential) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        t.update_index += 1;
        assign_id(&mut cred.id);
        cred.organization_id = org;
        cred.update_index = t.update_index;
        t.destination_credentials.insert(cred.id, cred.clone());
        Ok(())
    }

    async fn get_destination_credential(&mut self, id: Id) -> DataResult<DestinationCredential> {
        let org = self.org()?;
        let t = self.tables()?;
        t.destination_credentials
            .get(&id)
            .filter(|c| c.organization_id == org)
            .cloned()
            .ok_or(DataError::NotFound)
    }

    async fn answer_destination_credential(&mut self, cred: &DestinationCredential) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        let existing = t
            .destination_credentials
            .get_mut(&cred.id)
            .filter(|c| c.organization_id == org && c.destination_id == cred.destination_id)
            .ok_or(DataError::NotFound)?;
        existing.answered = true;
        existing.bearer_token = cred.bearer_token.clone();
        existing.credential_expires_at = cred.credential_expires_at;
        existing.updated_at = Utc::now();
        Ok(())
    }

    async fn list_destination_credentials(
        &mut self,
        destination_id: Id,
        after_index: i64,
        now: DateTime<Utc>,
    ) -> DataResult<Vec<DestinationCredential>> {
        let org = self.org()?;
        let t = self.tables()?;
        let mut items: Vec<DestinationCredential> = t
            .destination_credentials
            .values()
            .filter(|c| {
                c.organization_id == org
                    && c.destination_id == destination_id
                    && c.update_index > after_index
                    && c.is_pending(now)
            })
            .cloned()
            .collect();
        items.sort_by_key(|c| c.update_index);
        Ok(items)
    }

    async fn max_destination_credential_update_index(&mut self, destination_id: Id) -> DataResult<Option<i64>> {
        let org = self.org()?;
        let t = self.tables()?;
        Ok(t.destination_credentials
            .values()
            .filter(|c| c.organization_id == org && c.destination_id == destination_id)
            .map(|c| c.update_index)
            .max())
    }

    async fn delete_expired_destination_credentials(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let t = self.writable()?;
        let count = t.destination_credentials.len();
        t.destination_credentials
            .retain(|_, c| c.request_expires_at > before);
        Ok((count - t.destination_credentials.len()) as u64)
    }

    // ==================== Token Operations ====================

    async fn create_password_reset_token(&mut self, token: &mut PasswordResetToken) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.password_reset_tokens.values().any(|p| p.token == token.token) {
            return Err(DataError::unique("password_reset_tokens", "token"));
        }
        assign_id(&mut token.id);
        token.organization_id = org;
        t.password_reset_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn claim_password_reset_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<PasswordResetToken> {
        let org = self.org()?;
        let t = self.writable()?;
        let found = t
            .password_reset_tokens
            .values()
            .find(|p| p.organization_id == org && p.token == token && p.expires_at > now)
            .cloned()
            .ok_or(DataError::NotFound)?;
        t.password_reset_tokens.remove(&found.id);
        Ok(found)
    }

    async fn delete_expired_password_reset_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let t = self.writable()?;
        let count = t.password_reset_tokens.len();
        t.password_reset_tokens.retain(|_, p| p.expires_at > before);
        Ok((count - t.password_reset_tokens.len()) as u64)
    }

    async fn create_email_verification_token(&mut self, token: &mut EmailVerificationToken) -> DataResult<()> {
        let org = self.org()?;
        let t = self.writable()?;
        if t.email_verification_tokens.values().any(|p| p.token == token.token) {
            return Err(DataError::unique("email_verification_tokens", "token"));
        }
        assign_id(&mut token.id);
        token.organization_id = org;
        t.email_verification_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn claim_email_verification_token(&mut self, token: &str, now: DateTime<Utc>) -> DataResult<EmailVerificationToken> {
        let org = self.org()?;
        let t = self.writable()?;
        let found = t
            .email_verification_tokens
            .values()
            .find(|p| p.organization_id == org && p.token == token && p.expires_at > now)
            .cloned()
            .ok_or(DataError::NotFound)?;
        t.email_verification_tokens.remove(&found.id);
        Ok(found)
    }

    async fn delete_expired_email_verification_tokens(&mut self, before: DateTime<Utc>) -> DataResult<u64> {
        let t = self.writable()?;
        let count = t.email_verification_tokens.len();
        t.email_verification_tokens.retain(|_, p| p.expires_at > before);
        Ok((count - t.email_verification_tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::grant::ROLE_ADMIN;

    async fn tx_for_org(store: &MemoryStore, org: Id) -> Box<dyn Transaction> {
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        tx.set_organization_id(Some(org));
        tx
    }

    #[tokio::test]
    async fn requires_organization() {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let mut identity = Identity::new("a@example.com", Id(0));
        let err = tx.create_identity(&mut identity).await.unwrap_err();
        assert!(matches!(err, DataError::OrganizationRequired));
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let store = MemoryStore::new();
        let mut tx = tx_for_org(&store, Id(1)).await;
        let mut identity = Identity::new("a@example.com", Id(0));
        tx.create_identity(&mut identity).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = tx_for_org(&store, Id(1)).await;
        assert!(tx.get_identity(identity.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn drop_without_commit_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut tx = tx_for_org(&store, Id(1)).await;
            let mut group = Group::new("devs", Id(0));
            tx.create_group(&mut group).await.unwrap();
        }
        let mut tx = tx_for_org(&store, Id(1)).await;
        let groups = tx.list_groups(&ListGroupsOptions::default()).await.unwrap();
        assert_eq!(groups.total_count, 0);
    }

    #[tokio::test]
    async fn organizations_are_isolated() {
        let store = MemoryStore::new();
        let mut tx = tx_for_org(&store, Id(1)).await;
        let mut grant = Grant::new(Subject::User(Id(7)), ROLE_ADMIN, "infra");
        tx.create_grant(&mut grant).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = tx_for_org(&store, Id(2)).await;
        let grants = tx.list_grants(&ListGrantsOptions::default()).await.unwrap();
        assert_eq!(grants.total_count, 0);
        assert!(tx.get_grant(grant.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unique_names_per_organization() {
        let store = MemoryStore::new();
        let mut tx = tx_for_org(&store, Id(1)).await;
        tx.create_identity(&mut Identity::new("a@example.com", Id(0))).await.unwrap();
        let err = tx
            .create_identity(&mut Identity::new("a@example.com", Id(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::UniqueConstraint { ref column, .. } if column == "name"));

        tx.set_organization_id(Some(Id(2)));
        tx.create_identity(&mut Identity::new("a@example.com", Id(0))).await.unwrap();
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin(TxOptions::read_only()).await.unwrap();
        tx.set_organization_id(Some(Id(1)));
        let err = tx
            .create_group(&mut Group::new("devs", Id(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::ReadOnly));
    }

    #[tokio::test]
    async fn destination_credentials_are_ordered_by_update_index() {
        let store = MemoryStore::new();
        let mut tx = tx_for_org(&store, Id(1)).await;
        let expires = Utc::now() + chrono::Duration::minutes(2);
        let mut first = DestinationCredential::new(Id(10), Id(20), expires);
        let mut second = DestinationCredential::new(Id(10), Id(21), expires);
        let mut other = DestinationCredential::new(Id(11), Id(20), expires);
        tx.create_destination_credential(&mut first).await.unwrap();
        tx.create_destination_credential(&mut other).await.unwrap();
        tx.create_destination_credential(&mut second).await.unwrap();
        assert!(first.update_index < second.update_index);

        let now = Utc::now();
        let all = tx.list_destination_credentials(Id(10), 0, now).await.unwrap();
        assert_eq!(all.iter().map(|c| c.id).collect::<Vec<_>>(), vec![first.id, second.id]);

        let newer = tx
            .list_destination_credentials(Id(10), first.update_index, now)
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, second.id);

        first.bearer_token = Some("abc.123".to_string());
        tx.answer_destination_credential(&first).await.unwrap();
        let pending = tx.list_destination_credentials(Id(10), 0, now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            tx.max_destination_credential_update_index(Id(10)).await.unwrap(),
            Some(second.update_index)
        );
    }

    #[tokio::test]
    async fn reset_tokens_are_single_use() {
        let store = MemoryStore::new();
        let mut tx = tx_for_org(&store, Id(1)).await;
        let mut token = PasswordResetToken::new(Id(5), chrono::Duration::minutes(15));
        tx.create_password_reset_token(&mut token).await.unwrap();

        let now = Utc::now();
        let claimed = tx.claim_password_reset_token(&token.token, now).await.unwrap();
        assert_eq!(claimed.identity_id, Id(5));
        assert!(tx
            .claim_password_reset_token(&token.token, now)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn purge_runs_across_organizations() {
        let store = MemoryStore::new();
        let past = Utc::now() - chrono::Duration::hours(2);
        for org in [Id(1), Id(2)] {
            let mut tx = tx_for_org(&store, org).await;
            let mut key = AccessKey::new(Id(5), Id(6));
            key.key_id = format!("key{}", org.0);
            key.name = "old".to_string();
            key.expires_at = past;
            tx.create_access_key(&mut key).await.unwrap();
            tx.commit().await.unwrap();
        }

        let mut tx = store.begin(TxOptions::read_write()).await.unwrap();
        let purged = tx
            .delete_expired_access_keys(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 2);
    }
}
