//! Destination credential requests, brokered between users and connectors.
//!
//! A user's request blocks until the destination's connector answers it; the
//! connector long-polls for new requests. Both sides wait on the broker's
//! per-destination change signal after their own transaction has committed.

use axum::http::HeaderName;
use service_core::error::AppError;
use tokio::time::Instant;

use crate::api::{RequestContext, Route, Routes};
use crate::dtos::credentials::{
    AnswerDestinationCredentialRequest, CreateDestinationCredentialRequest, DestinationCredential,
    ListDestinationCredentialRequest, ListDestinationCredentialResponse,
};
use crate::dtos::ErrorResponse;
use crate::services::authorize::Requirement;
use crate::services::credentials::{self, PendingList};

static LAST_UPDATE_INDEX: HeaderName = HeaderName::from_static("last-update-index");

const LIST: Requirement = Requirement::new("destination credentials", "list", super::ADMIN_OR_CONNECTOR);
const ANSWER: Requirement = Requirement::new("destination credentials", "answer", super::ADMIN_OR_CONNECTOR);

pub fn register(routes: &mut Routes) {
    routes
        .add(Route::post("/api/credentials", create_destination_credential).blocking())
        .add(
            Route::get("/api/credentials", list_destination_credentials)
                .requires(LIST)
                .blocking(),
        )
        .add(Route::put("/api/credentials", answer_destination_credential).requires(ANSWER));
}

fn into_response(list: PendingList) -> ListDestinationCredentialResponse {
    ListDestinationCredentialResponse {
        items: list.items.into_iter().map(DestinationCredential::from).collect(),
        max_update_index: list.max_update_index,
    }
}

/// Ask a destination for a credential and wait for its connector to answer.
#[utoipa::path(
    post,
    path = "/api/credentials",
    request_body = CreateDestinationCredentialRequest,
    responses(
        (status = 201, description = "Answered credential", body = DestinationCredential),
        (status = 401, description = "No grant on the destination", body = ErrorResponse),
        (status = 404, description = "Unknown destination", body = ErrorResponse),
        (status = 504, description = "The connector did not answer in time", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destination Credentials"
)]
pub async fn create_destination_credential(
    ctx: RequestContext,
    req: CreateDestinationCredentialRequest,
) -> Result<DestinationCredential, AppError> {
    let state = ctx.state();
    let user_id = ctx.user()?.id;

    let mut tx = ctx.tx().await?;
    let request = credentials::create(tx.as_mut(), user_id, &req.destination).await?;
    drop(tx);

    let changes = state.broker.subscribe(request.destination_id);
    ctx.commit().await?;
    state.broker.notify(request.destination_id);

    let deadline = Instant::now() + state.config.api.broker_wait;
    let answered = credentials::wait_for_answer(&state.store, changes, &request, deadline).await?;
    Ok(DestinationCredential::from(answered))
}

/// Long-poll for credential requests newer than `lastUpdateIndex`. An empty
/// list means the wait ran out; poll again with the returned index.
#[utoipa::path(
    get,
    path = "/api/credentials",
    params(
        ("destination" = String, Query, description = "Destination name, as users request it"),
        ("lastUpdateIndex" = Option<i64>, Query, description = "Highest index already seen")
    ),
    responses(
        (status = 200, description = "Pending requests; also sets the Last-Update-Index header", body = ListDestinationCredentialResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "Unknown destination", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destination Credentials"
)]
pub async fn list_destination_credentials(
    ctx: RequestContext,
    req: ListDestinationCredentialRequest,
) -> Result<ListDestinationCredentialResponse, AppError> {
    let state = ctx.state();
    let org_id = ctx.organization()?.id;

    let mut tx = ctx.tx().await?;
    let destination = tx.get_destination_by_name(&req.destination).await?;
    let immediate = credentials::list_immediate(tx.as_mut(), &destination, req.last_update_index).await?;
    drop(tx);

    let listed = match immediate {
        Some(listed) => listed,
        None => {
            let changes = state.broker.subscribe(destination.id);
            ctx.commit().await?;
            let deadline = Instant::now() + state.config.api.broker_wait;
            credentials::wait_for_pending(
                &state.store,
                changes,
                org_id,
                destination.id,
                req.last_update_index,
                deadline,
            )
            .await?
        }
    };

    ctx.set_header(LAST_UPDATE_INDEX.clone(), listed.max_update_index);
    Ok(into_response(listed))
}

/// Answer a credential request on behalf of a destination.
#[utoipa::path(
    put,
    path = "/api/credentials",
    request_body = AnswerDestinationCredentialRequest,
    responses(
        (status = 200, description = "Answer stored", body = DestinationCredential),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Unknown request", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Destination Credentials"
)]
pub async fn answer_destination_credential(
    ctx: RequestContext,
    req: AnswerDestinationCredentialRequest,
) -> Result<DestinationCredential, AppError> {
    let broker = ctx.state().broker.clone();
    let expires_at = req
        .credential_expires_at
        .ok_or_else(|| AppError::field("credentialExpiresAt", "is required"))?;

    let mut tx = ctx.tx().await?;
    let answered = credentials::answer(tx.as_mut(), req.id, req.bearer_token, expires_at).await?;
    drop(tx);

    let destination_id = answered.destination_id;
    ctx.after_commit(move || broker.notify(destination_id));
    Ok(DestinationCredential::from(answered))
}
