use thiserror::Error;

/// Failures raised by the verification, decryption and delivery paths.
///
/// None of these are fatal to the process: the HTTP layer turns them into a
/// rejected request and the dispatcher turns them into a dropped message.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("invalid encoding key: {0}")]
    KeyDecode(base64::DecodeError),

    #[error("invalid echo payload encoding: {0}")]
    EnvelopeDecode(base64::DecodeError),

    #[error("invalid key length: {0} bytes")]
    KeyLength(usize),

    #[error("ciphertext is not a whole number of blocks ({0} bytes)")]
    MalformedCiphertext(usize),

    #[error("envelope needs {needed} bytes but only {available} remain after unpadding")]
    TruncatedPayload { needed: usize, available: usize },

    #[error("content of {0} bytes does not fit the envelope length field")]
    PayloadTooLarge(usize),

    #[error("token endpoint returned error: {0}")]
    RemoteToken(String),

    /// A refresh this caller queued behind failed; its cause is carried along.
    #[error("access token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token endpoint response carried no access_token")]
    MissingAccessToken,

    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected upstream response: {0}")]
    InvalidResponse(String),

    #[error("push rejected by upstream (errcode {errcode}): {errmsg}")]
    PushRejected { errcode: i64, errmsg: String },

    #[error("relay is not configured")]
    NotConfigured,
}

impl RelayError {
    /// True for failures of the callback challenge (signature or decryption).
    ///
    /// Callers must not reveal to the remote party which of these occurred.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            RelayError::SignatureMismatch
                | RelayError::KeyDecode(_)
                | RelayError::EnvelopeDecode(_)
                | RelayError::KeyLength(_)
                | RelayError::MalformedCiphertext(_)
                | RelayError::TruncatedPayload { .. }
        )
    }

    /// Short stable label used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::SignatureMismatch => "signature_mismatch",
            RelayError::KeyDecode(_) => "key_decode",
            RelayError::EnvelopeDecode(_) => "envelope_decode",
            RelayError::KeyLength(_) => "key_length",
            RelayError::MalformedCiphertext(_) => "malformed_ciphertext",
            RelayError::TruncatedPayload { .. } => "truncated_payload",
            RelayError::PayloadTooLarge(_) => "payload_too_large",
            RelayError::RemoteToken(_) => "remote_token",
            RelayError::RefreshFailed(_) => "refresh_failed",
            RelayError::MissingAccessToken => "missing_access_token",
            RelayError::Network(_) => "network",
            RelayError::InvalidResponse(_) => "invalid_response",
            RelayError::PushRejected { .. } => "push_rejected",
            RelayError::NotConfigured => "not_configured",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
