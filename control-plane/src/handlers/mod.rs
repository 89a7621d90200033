//! HTTP handlers for the control plane API.

pub mod access_keys;
pub mod auth;
pub mod credentials;
pub mod destinations;
pub mod device;
pub mod grants;
pub mod groups;
pub mod organizations;
pub mod providers;
pub mod scim;
pub mod system;
pub mod users;

use crate::api::Routes;
use crate::models::grant::{ROLE_ADMIN, ROLE_CONNECTOR, ROLE_VIEW};

pub(crate) const ADMIN: &[&str] = &[ROLE_ADMIN];
pub(crate) const ADMIN_OR_CONNECTOR: &[&str] = &[ROLE_ADMIN, ROLE_CONNECTOR];
pub(crate) const ANY_ROLE: &[&str] = &[ROLE_ADMIN, ROLE_VIEW, ROLE_CONNECTOR];

/// Every route served through the API pipeline except signup, which
/// [`build_router`](crate::build_router) mounts behind the per-address limiter.
pub fn api_routes() -> Routes {
    let mut routes = Routes::new();
    auth::register(&mut routes);
    access_keys::register(&mut routes);
    users::register(&mut routes);
    groups::register(&mut routes);
    grants::register(&mut routes);
    destinations::register(&mut routes);
    providers::register(&mut routes);
    device::register(&mut routes);
    credentials::register(&mut routes);
    scim::register(&mut routes);
    organizations::register(&mut routes);
    system::register(&mut routes);
    routes
}
