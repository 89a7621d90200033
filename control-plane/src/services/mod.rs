pub mod access_keys;
pub mod authorize;
pub mod broker;
pub mod credentials;
pub mod crypto;
pub mod destinations;
pub mod device_flow;
pub mod email;
pub mod grants;
pub mod groups;
pub mod limiter;
pub mod login;
pub mod oidc;
pub mod organizations;
pub mod password_reset;
pub mod providers;
pub mod scheduler;
pub mod signup;
pub mod users;
