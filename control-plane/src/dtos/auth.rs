use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::services::login::LoginResult;
use crate::uid::Id;
use crate::utils::validation::SUBDOMAIN;
use crate::utils::Rules;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PasswordCredentials {
    #[schema(example = "admin@example.com")]
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OidcCredentials {
    #[serde(rename = "providerID")]
    #[schema(value_type = String)]
    pub provider_id: Id,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub code: String,
}

/// Exactly one of the three methods.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub password_credentials: Option<PasswordCredentials>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub oidc: Option<OidcCredentials>,
}

impl Validate for LoginRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules.require_one_of(&[
            ("passwordCredentials", self.password_credentials.is_some()),
            ("accessKey", self.access_key.as_deref().is_some_and(|k| !k.is_empty())),
            ("oidc", self.oidc.is_some()),
        ]);
        if let Some(creds) = &self.password_credentials {
            rules.required("passwordCredentials.name", !creds.name.is_empty());
            rules.required("passwordCredentials.password", !creds.password.is_empty());
        }
        if let Some(oidc) = &self.oidc {
            rules.required("oidc.providerID", !oidc.provider_id.is_zero());
            rules.required("oidc.code", !oidc.code.is_empty());
            rules.required("oidc.redirectURL", !oidc.redirect_url.is_empty());
        }
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(rename = "userID")]
    #[schema(value_type = String)]
    pub user_id: Id,
    #[schema(example = "admin@example.com")]
    pub name: String,
    pub access_key: String,
    pub organization_name: String,
    #[serde(with = "super::time")]
    pub expires: DateTime<Utc>,
    pub password_update_required: bool,
}

impl From<&LoginResult> for LoginResponse {
    fn from(result: &LoginResult) -> Self {
        Self {
            user_id: result.identity.id,
            name: result.identity.name.clone(),
            access_key: result.issued.bearer.clone(),
            organization_name: result.organization_name.clone(),
            expires: result.issued.key.expires_at,
            password_update_required: result.password_update_required,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SignupUser {
    #[serde(default)]
    #[schema(example = "admin@example.com")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignupOrg {
    #[serde(default)]
    #[schema(example = "Acme")]
    pub name: String,
    #[serde(default)]
    #[schema(example = "acme")]
    pub sub_domain: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct SignupRequest {
    #[serde(default)]
    pub user: SignupUser,
    #[serde(default)]
    pub org: SignupOrg,
}

impl Validate for SignupRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("user.username", !self.user.username.is_empty())
            .email("user.username", &self.user.username)
            .required("user.password", !self.user.password.is_empty())
            .required("org.name", !self.org.name.is_empty())
            .string("org.subDomain", &self.org.sub_domain, &SUBDOMAIN);
        rules.finish()
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    #[schema(value_type = String)]
    pub id: Id,
    pub name: String,
    /// The organization's own domain; the session continues there.
    pub domain: String,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PasswordResetRequest {
    #[serde(default)]
    #[schema(example = "user@example.com")]
    pub email: String,
}

impl Validate for PasswordResetRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("email", !self.email.is_empty())
            .email("email", &self.email);
        rules.finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct VerifiedPasswordResetRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
}

impl Validate for VerifiedPasswordResetRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut rules = Rules::new();
        rules
            .required("token", !self.token.is_empty())
            .required("password", !self.password.is_empty());
        rules.finish()
    }
}

/// `GET /link?vt=<token>&r=<path>`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerificationLink {
    #[serde(default)]
    pub vt: String,
    #[serde(default)]
    pub r: String,
}

impl Validate for VerificationLink {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Rules::new().required("vt", !self.vt.is_empty()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::binding::bind;
    use serde_json::json;

    #[test]
    fn login_needs_exactly_one_method() {
        assert!(bind::<LoginRequest>(json!({})).is_err());
        assert!(bind::<LoginRequest>(json!({
            "accessKey": "abc.def",
            "passwordCredentials": {"name": "a@example.com", "password": "pw"}
        }))
        .is_err());
        let req: LoginRequest = bind(json!({"accessKey": "abc.def"})).unwrap();
        assert_eq!(req.access_key.as_deref(), Some("abc.def"));
    }

    #[test]
    fn signup_checks_the_subdomain() {
        let err = bind::<SignupRequest>(json!({
            "user": {"username": "admin@acme.com", "password": "password1"},
            "org": {"name": "Acme", "subDomain": "-x"}
        }));
        assert!(err.is_err());
        let ok: SignupRequest = bind(json!({
            "user": {"username": "admin@acme.com", "password": "password1"},
            "org": {"name": "Acme", "subDomain": "acme"}
        }))
        .unwrap();
        assert_eq!(ok.org.sub_domain, "acme");
    }
}
