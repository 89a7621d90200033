use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum_extra::extract::cookie::Cookie;
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};

use crate::data::Transaction;
use crate::models::{AccessKey, Identity, Organization};
use crate::AppState;

/// Who is calling. Unauthenticated routes still carry the organization the
/// host resolved to.
#[derive(Debug, Clone, Default)]
pub struct Authenticated {
    pub organization: Option<Organization>,
    pub user: Option<Identity>,
    pub access_key: Option<AccessKey>,
}

#[derive(Debug, Default)]
pub(crate) struct ResponseMeta {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie<'static>>,
}

type Hook = Box<dyn FnOnce() + Send>;

struct Inner {
    state: AppState,
    auth: Authenticated,
    tx: Mutex<Box<dyn Transaction>>,
    committed: AtomicBool,
    after_commit: StdMutex<Vec<Hook>>,
    response: StdMutex<ResponseMeta>,
}

/// Per-request handle given to every API handler: the request transaction,
/// the caller and response metadata. Clones share the same request.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    pub(crate) fn new(state: AppState, auth: Authenticated, tx: Box<dyn Transaction>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                auth,
                tx: Mutex::new(tx),
                committed: AtomicBool::new(false),
                after_commit: StdMutex::new(Vec::new()),
                response: StdMutex::new(ResponseMeta::default()),
            }),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.inner.state
    }

    pub fn auth(&self) -> &Authenticated {
        &self.inner.auth
    }

    pub fn user(&self) -> Result<&Identity, AppError> {
        self.inner
            .auth
            .user
            .as_ref()
            .ok_or_else(|| AppError::unauthorized("no authenticated user"))
    }

    pub fn organization(&self) -> Result<&Organization, AppError> {
        self.inner
            .auth
            .organization
            .as_ref()
            .ok_or_else(|| AppError::bad_request("organization is required"))
    }

    pub fn access_key(&self) -> Option<&AccessKey> {
        self.inner.auth.access_key.as_ref()
    }

    /// Locks the request transaction. Drop the guard before
    /// [`commit`](Self::commit).
    pub async fn tx(&self) -> Result<MutexGuard<'_, Box<dyn Transaction>>, AppError> {
        if self.is_committed() {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "request transaction already committed"
            )));
        }
        Ok(self.inner.tx.lock().await)
    }

    pub fn is_committed(&self) -> bool {
        self.inner.committed.load(Ordering::SeqCst)
    }

    /// Commits the request transaction now, for handlers that go on to wait
    /// without holding it. Later calls do nothing.
    pub async fn commit(&self) -> Result<(), AppError> {
        let mut tx = self.inner.tx.lock().await;
        if self.inner.committed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tx.commit().await?;
        drop(tx);
        self.run_after_commit();
        Ok(())
    }

    pub(crate) async fn rollback(&self) {
        let mut tx = self.inner.tx.lock().await;
        if self.inner.committed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = tx.rollback().await {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }

    /// Runs `hook` once the request transaction has committed.
    pub fn after_commit(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_committed() {
            hook();
            return;
        }
        if let Ok(mut hooks) = self.inner.after_commit.lock() {
            hooks.push(Box::new(hook));
        }
    }

    fn run_after_commit(&self) {
        let hooks = match self.inner.after_commit.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(_) => return,
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn set_status(&self, status: StatusCode) {
        if let Ok(mut meta) = self.inner.response.lock() {
            meta.status = Some(status);
        }
    }

    pub fn set_header(&self, name: HeaderName, value: impl ToString) {
        let Ok(value) = HeaderValue::from_str(&value.to_string()) else {
            tracing::warn!(header = %name, "Dropping invalid response header");
            return;
        };
        if let Ok(mut meta) = self.inner.response.lock() {
            meta.headers.insert(name, value);
        }
    }

    pub fn add_cookie(&self, cookie: Cookie<'static>) {
        if let Ok(mut meta) = self.inner.response.lock() {
            meta.cookies.push(cookie);
        }
    }

    pub(crate) fn take_response_meta(&self) -> ResponseMeta {
        match self.inner.response.lock() {
            Ok(mut meta) => std::mem::take(&mut *meta),
            Err(_) => ResponseMeta::default(),
        }
    }
}
