use super::traits::EmailSender;
use anyhow::Result;
use async_trait::async_trait;

/// Stand-in mail transport: writes each message to the log instead of
/// delivering it. Swap in a real `EmailSender` for production mail.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_verification(&self, to: &str, code: &str) -> Result<()> {
        tracing::info!(to = %to, code = %code, "Sending verification email");
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, code: &str) -> Result<()> {
        tracing::info!(to = %to, code = %code, "Sending password reset email");
        Ok(())
    }
}

#[cfg(test)]
pub use recording::{RecordingEmailSender, SentEmail};

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentEmail {
        Verification { to: String, code: String },
        PasswordReset { to: String, code: String },
    }

    /// Keeps every message so tests can pull the codes back out.
    #[derive(Clone, Default)]
    pub struct RecordingEmailSender {
        sent: Arc<Mutex<Vec<SentEmail>>>,
    }

    impl RecordingEmailSender {
        pub fn sent(&self) -> Vec<SentEmail> {
            self.sent.lock().unwrap().clone()
        }

        pub fn last_verification_code(&self, email: &str) -> Option<String> {
            self.sent().into_iter().rev().find_map(|sent| match sent {
                SentEmail::Verification { to, code } if to == email => Some(code),
                _ => None,
            })
        }

        pub fn last_reset_code(&self, email: &str) -> Option<String> {
            self.sent().into_iter().rev().find_map(|sent| match sent {
                SentEmail::PasswordReset { to, code } if to == email => Some(code),
                _ => None,
            })
        }
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send_verification(&self, to: &str, code: &str) -> Result<()> {
            self.sent.lock().unwrap().push(SentEmail::Verification {
                to: to.to_string(),
                code: code.to_string(),
            });
            Ok(())
        }

        async fn send_password_reset(&self, to: &str, code: &str) -> Result<()> {
            self.sent.lock().unwrap().push(SentEmail::PasswordReset {
                to: to.to_string(),
                code: code.to_string(),
            });
            Ok(())
        }
    }
}
