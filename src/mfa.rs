//! Terminal MFA prompt

use async_trait::async_trait;
use kproxy_credentials::{CredentialError, MfaChallenge, MfaPrompt, MfaResponse};
use std::io::{BufRead, Write};

/// Reads a TOTP code from stdin
///
/// Waits as long as the user needs.
pub struct TerminalMfaPrompt;

#[async_trait]
impl MfaPrompt for TerminalMfaPrompt {
    async fn prompt(&self, challenge: &MfaChallenge) -> Result<MfaResponse, CredentialError> {
        let message = if challenge.proxy_addr.is_empty() {
            "Enter an OTP code from a device: ".to_string()
        } else {
            format!(
                "Enter an OTP code from a device for {}: ",
                challenge.proxy_addr
            )
        };

        let code = tokio::task::spawn_blocking(move || read_code(&message))
            .await
            .map_err(|e| CredentialError::Mfa(format!("prompt task failed: {}", e)))??;

        Ok(MfaResponse {
            challenge_id: challenge.challenge_id.clone(),
            totp_code: code,
        })
    }
}

fn read_code(message: &str) -> Result<String, CredentialError> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", message)?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    let code = line.trim();
    if code.is_empty() {
        return Err(CredentialError::Mfa("no OTP code entered".to_string()));
    }
    Ok(code.to_string())
}
