pub mod access_key;
pub mod credential;
pub mod destination;
pub mod destination_credential;
pub mod device_flow;
pub mod grant;
pub mod group;
pub mod identity;
pub mod organization;
pub mod provider;
pub mod provider_user;
pub mod token;

pub use access_key::AccessKey;
pub use credential::Credential;
pub use destination::Destination;
pub use destination_credential::DestinationCredential;
pub use device_flow::{DeviceFlowAuthRequest, DeviceFlowStatus};
pub use grant::{Grant, Subject};
pub use group::Group;
pub use identity::Identity;
pub use organization::Organization;
pub use provider::{Provider, ProviderKind};
pub use provider_user::ProviderUser;
pub use token::{EmailVerificationToken, PasswordResetToken};
