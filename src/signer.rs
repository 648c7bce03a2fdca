//! SharedKey request signing for the HTTP data collector API.
//!
//! The workspace key is decoded once when the [`Signer`] is created, so a
//! malformed key surfaces as a single setup error instead of failing every
//! request.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Content type covered by the signature and sent with every request.
pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Resource path covered by the signature.
const RESOURCE: &str = "/api/logs";

/// Errors raised while preparing the signing key.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The workspace key is not valid base64
    #[error("workspace key is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The workspace key decodes to zero bytes
    #[error("workspace key is empty")]
    EmptyKey,

    /// The MAC rejected the key material
    #[error("workspace key rejected by HMAC-SHA256: {0}")]
    InvalidKey(String),
}

/// Format a timestamp as an RFC 7231 IMF-fixdate, e.g. `Mon, 04 Oct 2021 09:05:03 GMT`.
///
/// The day of month is always two digits; the endpoint rejects signatures
/// computed over a single-digit day.
pub fn rfc7231_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// The canonical string the signature is computed over.
pub fn string_to_sign(content_length: usize, date: &str) -> String {
    format!(
        "POST\n{}\n{}\nx-ms-date:{}\n{}",
        content_length, CONTENT_TYPE, date, RESOURCE
    )
}

/// Computes `Authorization` header values for one workspace.
#[derive(Clone)]
pub struct Signer {
    workspace_id: String,
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Decode and validate the base64 workspace key.
    pub fn new(
        workspace_id: impl Into<String>,
        workspace_key: &str,
    ) -> Result<Self, SignerError> {
        let key = STANDARD.decode(workspace_key.trim())?;
        if key.is_empty() {
            return Err(SignerError::EmptyKey);
        }
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        Ok(Self {
            workspace_id: workspace_id.into(),
            mac,
        })
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Build `SharedKey {workspace_id}:{signature}` for a request body of
    /// `content_length` bytes sent with `x-ms-date: {date}`.
    pub fn authorization(&self, content_length: usize, date: &str) -> String {
        format!(
            "SharedKey {}:{}",
            self.workspace_id,
            self.signature(content_length, date)
        )
    }

    fn signature(&self, content_length: usize, date: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(string_to_sign(content_length, date).as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }
}
