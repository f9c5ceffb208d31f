//! # Shared Access Signature Tokens
//!
//! Builds the time-limited `SharedAccessSignature` strings accepted by IoT Hub
//! and Event Hubs. A token is a pure function of its inputs and the clock, so it
//! is minted fresh for every resolution attempt and never stored.

use std::fmt;

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;

use crate::error::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Characters left untouched by `encodeURIComponent`: alphanumerics and `-_.!~*'()`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes a single URI component.
pub fn encode_uri_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// A signed access token for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    /// The resource URI the token grants access to (not encoded).
    pub resource_uri: String,
    /// Expiry as Unix seconds.
    pub expiry_epoch_seconds: i64,
    /// Base64 HMAC-SHA256 signature (not URL-encoded).
    pub signature: String,
    /// Shared access policy name.
    pub policy_name: String,
}

impl SasToken {
    /// Signs `resource_uri` with the current time.
    pub fn sign(
        resource_uri: &str,
        signing_key_base64: &str,
        policy_name: &str,
        ttl_minutes: u32,
    ) -> Result<Self> {
        Self::sign_at(resource_uri, signing_key_base64, policy_name, ttl_minutes, Utc::now())
    }

    /// Signs `resource_uri` as of `now`.
    ///
    /// The expiry is `ceil(now + ttl_minutes * 60)` in seconds; sub-second
    /// precision of `now` is honored so the token always outlives the instant it
    /// was minted at. The signed string is `encode(resource_uri) + "\n" + expiry`.
    ///
    /// # Errors
    /// Returns [`RelayError::InvalidDescriptor`] when the key is not valid base64.
    pub fn sign_at(
        resource_uri: &str,
        signing_key_base64: &str,
        policy_name: &str,
        ttl_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let key = general_purpose::STANDARD
            .decode(signing_key_base64)
            .map_err(|e| RelayError::InvalidDescriptor(format!("SharedAccessKey is not valid base64: {}", e)))?;

        let ttl_millis = i64::from(ttl_minutes) * 60_000;
        let expiry = (now.timestamp_millis() + ttl_millis + 999).div_euclid(1000);

        let to_sign = format!("{}\n{}", encode_uri_component(resource_uri), expiry);
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| RelayError::InvalidDescriptor(format!("unusable signing key: {}", e)))?;
        mac.update(to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(Self {
            resource_uri: resource_uri.to_string(),
            expiry_epoch_seconds: expiry,
            signature,
            policy_name: policy_name.to_string(),
        })
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encode_uri_component(&self.resource_uri),
            encode_uri_component(&self.signature),
            self.expiry_epoch_seconds,
            self.policy_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "8Ll3qNz0m2W7YUbGilYRIUdfeWYXaCV8lAIoTAfZ5M8=";

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_250).unwrap()
    }

    #[test]
    fn expiry_rounds_up_fractional_seconds() {
        let token = SasToken::sign_at("hub.azure-devices.net/messages/events", KEY, "service", 5, fixed_now()).unwrap();
        assert_eq!(token.expiry_epoch_seconds, 1_700_000_301);
    }

    #[test]
    fn expiry_on_whole_second_is_exact() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let token = SasToken::sign_at("r", KEY, "service", 5, now).unwrap();
        assert_eq!(token.expiry_epoch_seconds, 1_700_000_300);
        assert!(token.expiry_epoch_seconds > now.timestamp());
    }

    #[test]
    fn signing_is_deterministic_for_a_fixed_clock() {
        let a = SasToken::sign_at("hub.azure-devices.net/messages/events", KEY, "service", 5, fixed_now()).unwrap();
        let b = SasToken::sign_at("hub.azure-devices.net/messages/events", KEY, "service", 5, fixed_now()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn signature_verifies_with_the_same_key() {
        let token = SasToken::sign_at("hub.azure-devices.net/messages/events", KEY, "service", 5, fixed_now()).unwrap();

        let key = general_purpose::STANDARD.decode(KEY).unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(format!("hub.azure-devices.net%2Fmessages%2Fevents\n{}", token.expiry_epoch_seconds).as_bytes());
        let raw = general_purpose::STANDARD.decode(&token.signature).unwrap();
        assert!(mac.verify_slice(&raw).is_ok());
    }

    #[test]
    fn token_string_has_the_documented_shape() {
        let token = SasToken::sign_at("hub.azure-devices.net/messages/events", KEY, "service", 5, fixed_now()).unwrap();
        let rendered = token.to_string();

        let prefix = "SharedAccessSignature sr=hub.azure-devices.net%2Fmessages%2Fevents&sig=";
        assert!(rendered.starts_with(prefix), "{}", rendered);
        assert!(rendered.ends_with("&se=1700000301&skn=service"), "{}", rendered);

        let sig = &rendered[prefix.len()..rendered.find("&se=").unwrap()];
        assert_eq!(sig, encode_uri_component(&token.signature));
        assert!(!sig.contains('+') && !sig.contains('/') && !sig.contains('='));
    }

    #[test]
    fn malformed_key_is_rejected() {
        let err = SasToken::sign_at("r", "not base64!!", "service", 5, fixed_now()).unwrap_err();
        assert!(matches!(err, RelayError::InvalidDescriptor(_)));
    }

    #[test]
    fn uri_component_encoding_matches_javascript() {
        assert_eq!(encode_uri_component("a b/c+d=e"), "a%20b%2Fc%2Bd%3De");
        assert_eq!(encode_uri_component("-_.!~*'()"), "-_.!~*'()");
    }
}
