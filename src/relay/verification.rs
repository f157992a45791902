use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::security::cipher::decrypt_echo;
use crate::security::signature::verify_signature;

/// One URL verification request from the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackChallenge {
    pub shared_token: String,
    pub timestamp: String,
    pub nonce: String,
    pub encrypted_echo: String,
    pub signature: String,
}

impl CallbackChallenge {
    /// Check the signature, then decrypt the echo string.
    ///
    /// Returns the plaintext the platform expects to receive back.
    pub fn answer(&self, encoding_key: &str) -> RelayResult<Vec<u8>> {
        if !verify_signature(
            &self.shared_token,
            &self.timestamp,
            &self.nonce,
            &self.encrypted_echo,
            &self.signature,
        ) {
            return Err(RelayError::SignatureMismatch);
        }
        debug!(nonce = %self.nonce, "callback signature verified");

        decrypt_echo(encoding_key, &self.encrypted_echo)
    }
}
