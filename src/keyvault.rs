//! Key vault collaborator contract.
//!
//! BYOK tenants store third-party API credentials encrypted at rest; the
//! vault that does the sealing lives outside this crate and is consumed only
//! through this call contract. Billing itself never touches credentials;
//! BYOK token counts flow through the same debit path as platform counts and
//! differ only in the margin formula.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyVaultError {
    #[error("vault unavailable: {0}")]
    Unavailable(String),

    #[error("decryption failed")]
    DecryptFailed,
}

#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String, KeyVaultError>;

    async fn decrypt(&self, ciphertext: &str) -> Result<String, KeyVaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reversible stand-in, good enough to pin the contract shape.
    struct EchoVault;

    #[async_trait]
    impl KeyVault for EchoVault {
        async fn encrypt(&self, plaintext: &str) -> Result<String, KeyVaultError> {
            Ok(format!("sealed:{plaintext}"))
        }

        async fn decrypt(&self, ciphertext: &str) -> Result<String, KeyVaultError> {
            ciphertext
                .strip_prefix("sealed:")
                .map(str::to_string)
                .ok_or(KeyVaultError::DecryptFailed)
        }
    }

    #[tokio::test]
    async fn contract_round_trips() {
        let vault = EchoVault;
        let sealed = vault.encrypt("sk-user-key").await.expect("encrypt");
        assert_eq!(vault.decrypt(&sealed).await.expect("decrypt"), "sk-user-key");
        assert!(matches!(
            vault.decrypt("garbage").await,
            Err(KeyVaultError::DecryptFailed)
        ));
    }
}
