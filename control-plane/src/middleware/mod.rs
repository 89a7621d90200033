pub mod authn;
pub mod tenant;

pub use authn::{authenticate, AuthMode, RequestInfo};
