use service_core::error::AppError;

use crate::data::{DataError, ListGrantsOptions, Paged, Transaction};
use crate::models::grant::{RESOURCE_INFRA, ROLE_ADMIN};
use crate::models::{Grant, Subject};
use crate::services::authorize;
use crate::uid::Id;

#[derive(Debug, Clone)]
pub struct CreatedGrant {
    pub grant: Grant,
    /// False when an identical grant already existed.
    pub was_created: bool,
}

/// Lists grants. With `inherited`, a user subject also matches the grants of
/// every group the user belongs to.
pub async fn list(
    tx: &mut dyn Transaction,
    mut opts: ListGrantsOptions,
    inherited: bool,
) -> Result<Paged<Grant>, AppError> {
    if inherited {
        if let [Subject::User(user_id)] = opts.subjects.as_slice() {
            opts.subjects = authorize::subjects_for(tx, *user_id).await?;
        }
    }
    Ok(tx.list_grants(&opts).await?)
}

pub async fn get(tx: &mut dyn Transaction, id: Id) -> Result<Grant, AppError> {
    Ok(tx.get_grant(id).await?)
}

/// Creates a grant; an identical existing grant is returned instead of a conflict.
pub async fn create(
    tx: &mut dyn Transaction,
    subject: Subject,
    privilege: &str,
    resource: &str,
    created_by: Id,
) -> Result<CreatedGrant, AppError> {
    let privilege = privilege.trim();
    let resource = resource.trim();

    match subject {
        Subject::User(id) => {
            tx.get_identity(id).await.map_err(|e| missing_subject(e, "user"))?;
        }
        Subject::Group(id) => {
            tx.get_group(id).await.map_err(|e| missing_subject(e, "group"))?;
        }
    }

    let mut grant = Grant::new(subject, privilege, resource);
    grant.created_by = created_by;
    match tx.create_grant(&mut grant).await {
        Ok(()) => {
            tracing::info!(grant_id = %grant.id, subject = %subject, privilege, resource, "Created grant");
            Ok(CreatedGrant {
                grant,
                was_created: true,
            })
        }
        Err(DataError::UniqueConstraint { .. }) => {
            let existing = tx.find_grant(subject, privilege, resource).await?;
            Ok(CreatedGrant {
                grant: existing,
                was_created: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn missing_subject(err: DataError, kind: &str) -> AppError {
    match err {
        DataError::NotFound => AppError::bad_request(format!("{} does not exist", kind)),
        other => other.into(),
    }
}

/// Deletes a grant, refusing to remove the organization's last `admin` on `infra`.
pub async fn delete(tx: &mut dyn Transaction, id: Id) -> Result<(), AppError> {
    let grant = tx.get_grant(id).await?;
    if grant.privilege == ROLE_ADMIN
        && grant.resource == RESOURCE_INFRA
        && tx.count_grants(ROLE_ADMIN, RESOURCE_INFRA).await? <= 1
    {
        return Err(AppError::bad_request("cannot remove the last infra admin"));
    }
    tx.delete_grant(id).await?;
    Ok(())
}
