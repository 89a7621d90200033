use async_trait::async_trait;
use lettre::{
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
    Message,
    SmtpTransport,
    Transport,
};
use service_core::error::AppError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SmtpConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Verification,
    UserInvite,
    PasswordReset,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_email_verification(&self, to_email: &str, link: &str) -> Result<(), AppError>;

    async fn send_user_invite(
        &self,
        to_email: &str,
        from_user: &str,
        link: &str,
    ) -> Result<(), AppError>;

    async fn send_password_reset(&self, to_email: &str, link: &str) -> Result<(), AppError>;

    /// False for the no-op sink used when SMTP is not configured.
    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, AppError> {
        let mut builder = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e.to_string())))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        tracing::info!(host = %config.host, "Email service initialized");

        Ok(Self {
            mailer: builder.build(),
            from_email: format!("{} <{}>", config.from_name, config.from_address),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), AppError> {
        let email = Message::builder()
            .from(self.from_email.parse().map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?)
            .to(to_email.parse().map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )
            .map_err(|e| AppError::InternalError(e.into()))?;

        // SMTP transport is blocking
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e.to_string(), to = %to_email, "Failed to send email");
                Err(AppError::EmailError(e.to_string()))
            }
        }
    }
}

fn button(link: &str, label: &str) -> String {
    format!(
        r#"<p><a href="{}" style="background-color: #000; color: white; padding: 14px 20px; text-decoration: none; border-radius: 4px;">{}</a></p>"#,
        link, label
    )
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_email_verification(&self, to_email: &str, link: &str) -> Result<(), AppError> {
        let html_body = format!(
            r#"<html><body style="font-family: Arial, sans-serif;"><h2>Verify your email</h2><p>Confirm this address to finish setting up your organization.</p>{}</body></html>"#,
            button(link, "Verify Email")
        );
        let plain_body = format!(
            "Verify your email\n\nConfirm this address to finish setting up your organization:\n\n{}",
            link
        );
        self.send_email(to_email, "Verify your email", &plain_body, &html_body)
            .await
    }

    async fn send_user_invite(
        &self,
        to_email: &str,
        from_user: &str,
        link: &str,
    ) -> Result<(), AppError> {
        let html_body = format!(
            r#"<html><body style="font-family: Arial, sans-serif;"><h2>You have been invited</h2><p>{} invited you. Set a password to sign in.</p>{}<p style="color: #666; font-size: 12px;">This link expires in 72 hours.</p></body></html>"#,
            from_user,
            button(link, "Accept Invite")
        );
        let plain_body = format!(
            "You have been invited\n\n{} invited you. Set a password to sign in:\n\n{}\n\nThis link expires in 72 hours.",
            from_user, link
        );
        self.send_email(to_email, "You have been invited", &plain_body, &html_body)
            .await
    }

    async fn send_password_reset(&self, to_email: &str, link: &str) -> Result<(), AppError> {
        let html_body = format!(
            r#"<html><body style="font-family: Arial, sans-serif;"><h2>Password Reset Request</h2><p>Click the link below to set a new password.</p>{}<p style="color: #666; font-size: 12px;">This link expires in 15 minutes. If you didn't request this, please ignore this email.</p></body></html>"#,
            button(link, "Reset Password")
        );
        let plain_body = format!(
            "Password Reset Request\n\nVisit the following link to set a new password:\n\n{}\n\nThis link expires in 15 minutes. If you didn't request this, please ignore this email.",
            link
        );
        self.send_email(to_email, "Reset your password", &plain_body, &html_body)
            .await
    }
}

/// Drops every message; used when SMTP is not configured.
#[derive(Clone, Default)]
pub struct NoopEmailService;

#[async_trait]
impl EmailProvider for NoopEmailService {
    async fn send_email_verification(&self, to_email: &str, _link: &str) -> Result<(), AppError> {
        tracing::debug!(to = %to_email, "Email disabled, dropping verification email");
        Ok(())
    }

    async fn send_user_invite(&self, to_email: &str, _from_user: &str, _link: &str) -> Result<(), AppError> {
        tracing::debug!(to = %to_email, "Email disabled, dropping invite");
        Ok(())
    }

    async fn send_password_reset(&self, to_email: &str, _link: &str) -> Result<(), AppError> {
        tracing::debug!(to = %to_email, "Email disabled, dropping password reset");
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub kind: EmailKind,
    pub to: String,
    pub link: String,
}

/// Records messages instead of sending them.
#[derive(Clone, Default)]
pub struct MockEmailService {
    sent: Arc<Mutex<Vec<SentEmail>>>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_to(&self, to: &str) -> Option<SentEmail> {
        self.sent().into_iter().rev().find(|e| e.to == to)
    }

    fn record(&self, kind: EmailKind, to: &str, link: &str) {
        let email = SentEmail {
            kind,
            to: to.to_string(),
            link: link.to_string(),
        };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(email),
            Err(poisoned) => poisoned.into_inner().push(email),
        }
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_email_verification(&self, to_email: &str, link: &str) -> Result<(), AppError> {
        tracing::info!(to = %to_email, "Mock: Would send verification email");
        self.record(EmailKind::Verification, to_email, link);
        Ok(())
    }

    async fn send_user_invite(&self, to_email: &str, _from_user: &str, link: &str) -> Result<(), AppError> {
        tracing::info!(to = %to_email, "Mock: Would send invite email");
        self.record(EmailKind::UserInvite, to_email, link);
        Ok(())
    }

    async fn send_password_reset(&self, to_email: &str, link: &str) -> Result<(), AppError> {
        tracing::info!(to = %to_email, "Mock: Would send password reset email");
        self.record(EmailKind::PasswordReset, to_email, link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_messages() {
        let mock = MockEmailService::new();
        mock.send_password_reset("a@example.com", "https://x/reset").await.unwrap();
        mock.send_user_invite("b@example.com", "admin", "https://x/invite").await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(mock.last_to("a@example.com").unwrap().kind, EmailKind::PasswordReset);
        assert!(mock.is_configured());
        assert!(!NoopEmailService.is_configured());
    }
}
