use service_core::error::{AppError, FieldErrors};

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Hash a secret with bcrypt at the given cost.
///
/// The salt is generated per call and embedded in the returned hash.
pub fn hash_secret(secret: &str, cost: u32) -> Result<String, AppError> {
    bcrypt::hash(secret, cost)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash secret: {}", e)))
}

/// Verify a secret against a bcrypt hash.
///
/// A malformed hash counts as a mismatch.
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    bcrypt::verify(secret, hash).unwrap_or(false)
}

/// [`hash_secret`] on the blocking pool.
pub async fn hash_secret_blocking(secret: String, cost: u32) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || hash_secret(&secret, cost))
        .await
        .map_err(|e| AppError::InternalError(e.into()))?
}

pub async fn verify_secret_blocking(secret: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
        .await
        .unwrap_or(false)
}

pub fn hash_password(password: &Password, cost: u32) -> Result<String, AppError> {
    hash_secret(password.as_str(), cost)
}

pub fn verify_password(password: &Password, hash: &str) -> bool {
    verify_secret(password.as_str(), hash)
}

/// Requirements applied whenever a password is set or changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub min_letters: usize,
    pub min_digits: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            min_letters: 1,
            min_digits: 0,
        }
    }
}

impl PasswordPolicy {
    /// Checks `password`, reporting every unmet rule against `field`.
    pub fn check(&self, field: &str, password: &str) -> Result<(), AppError> {
        let mut errors = FieldErrors::new();
        let length = password.chars().count();
        let letters = password.chars().filter(|c| c.is_alphabetic()).count();
        let digits = password.chars().filter(|c| c.is_ascii_digit()).count();

        if length < self.min_length {
            errors.add(
                field,
                format!("must be at least {} characters", self.min_length),
            );
        }
        if letters < self.min_letters {
            errors.add(field, format!("must contain at least {} {}", self.min_letters, plural(self.min_letters, "letter")));
        }
        if digits < self.min_digits {
            errors.add(field, format!("must contain at least {} {}", self.min_digits, plural(self.min_digits, "number")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::ValidationError(errors))
        }
    }
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{}s", word)
    }
}
