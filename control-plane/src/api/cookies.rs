use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};

pub const AUTH: &str = "auth";
pub const LOGIN: &str = "login";
pub const SIGNUP: &str = "signup";

fn build(name: &'static str, value: String, domain: &str, max_age: time::Duration) -> Cookie<'static> {
    let mut cookie = Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .build();
    if !domain.is_empty() {
        cookie.set_domain(domain.to_string());
    }
    cookie
}

fn until(expires_at: DateTime<Utc>) -> time::Duration {
    time::Duration::seconds((expires_at - Utc::now()).num_seconds().max(0))
}

/// The session cookie on the organization's own domain.
pub fn auth(bearer: &str, domain: &str, expires_at: DateTime<Utc>) -> Cookie<'static> {
    build(AUTH, bearer.to_string(), domain, until(expires_at))
}

/// Tells the web UI a session exists; carries no secret.
pub fn login(domain: &str, expires_at: DateTime<Utc>) -> Cookie<'static> {
    build(LOGIN, "1".to_string(), domain, until(expires_at))
}

/// Hands a fresh signup session from the base domain to the new
/// organization's domain.
pub fn signup(bearer: &str, base_domain: &str) -> Cookie<'static> {
    build(SIGNUP, bearer.to_string(), base_domain, time::Duration::minutes(1))
}

pub fn clear(name: &'static str, domain: &str) -> Cookie<'static> {
    build(name, String::new(), domain, time::Duration::ZERO)
}

pub fn value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn session_cookie_attributes() {
        let cookie = auth("key.secret", "acme.example.com", Utc::now() + Duration::hours(1));
        assert_eq!(cookie.value(), "key.secret");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.domain(), Some("acme.example.com"));
        assert!(cookie.max_age().unwrap() > time::Duration::minutes(59));
    }

    #[test]
    fn cleared_cookie_expires_now() {
        let cookie = clear(AUTH, "");
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
        assert!(cookie.domain().is_none());
    }
}
