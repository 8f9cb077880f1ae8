//! Handshake identity.
//!
//! Clients connect with `/ws?token=<token>&userId=<id>`. A missing token
//! refuses the connection before upgrade. How the token maps to an identity
//! depends on the configured [`IdentityPolicy`]:
//!
//! - `TrustClaim`: any non-empty token is accepted and `userId` is taken as
//!   the identity. Token verification is assumed to have happened upstream.
//! - `SignedToken`: the token is `<userId>.<base64url HMAC-SHA256(userId)>`
//!   under the server secret, and the identity comes from the token alone.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::Deserialize;

use crate::error::HandshakeError;

/// Query parameters of the WebSocket upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub token: Option<String>,
    pub user_id: Option<String>,
}

pub enum IdentityPolicy {
    TrustClaim,
    SignedToken { key: hmac::Key },
}

impl IdentityPolicy {
    pub fn signed(secret: &str) -> Self {
        IdentityPolicy::SignedToken {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IdentityPolicy::TrustClaim => "trust_claim",
            IdentityPolicy::SignedToken { .. } => "signed_token",
        }
    }

    /// Resolve the connection's identity from the handshake.
    pub fn authenticate(&self, params: &HandshakeParams) -> Result<String, HandshakeError> {
        let token = non_empty(&params.token).ok_or(HandshakeError::AuthenticationMissing)?;
        let claimed = non_empty(&params.user_id);

        match self {
            IdentityPolicy::TrustClaim => claimed
                .map(str::to_string)
                .ok_or(HandshakeError::AuthenticationMissing),
            IdentityPolicy::SignedToken { key } => {
                let user_id = verify(key, token)?;
                if claimed.is_some_and(|c| c != user_id) {
                    return Err(HandshakeError::IdentityMismatch);
                }
                Ok(user_id.to_string())
            }
        }
    }

    /// Mint a handshake token for `user_id`. Only signed policies can.
    pub fn issue_token(&self, user_id: &str) -> Option<String> {
        match self {
            IdentityPolicy::TrustClaim => None,
            IdentityPolicy::SignedToken { key } => {
                let tag = hmac::sign(key, user_id.as_bytes());
                Some(format!("{user_id}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn verify<'a>(key: &hmac::Key, token: &'a str) -> Result<&'a str, HandshakeError> {
    let (user_id, signature) = token
        .rsplit_once('.')
        .ok_or(HandshakeError::InvalidToken)?;
    if user_id.is_empty() {
        return Err(HandshakeError::InvalidToken);
    }
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| HandshakeError::InvalidToken)?;
    hmac::verify(key, user_id.as_bytes(), &signature).map_err(|_| HandshakeError::InvalidToken)?;
    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(token: Option<&str>, user_id: Option<&str>) -> HandshakeParams {
        HandshakeParams {
            token: token.map(str::to_string),
            user_id: user_id.map(str::to_string),
        }
    }

    #[test]
    fn missing_or_blank_token_is_refused() {
        let policy = IdentityPolicy::TrustClaim;
        assert_eq!(
            policy.authenticate(&params(None, Some("alice"))),
            Err(HandshakeError::AuthenticationMissing)
        );
        assert_eq!(
            policy.authenticate(&params(Some("   "), Some("alice"))),
            Err(HandshakeError::AuthenticationMissing)
        );
    }

    #[test]
    fn trust_claim_takes_user_id_from_handshake() {
        let policy = IdentityPolicy::TrustClaim;
        assert_eq!(
            policy.authenticate(&params(Some("opaque"), Some("alice"))),
            Ok("alice".to_string())
        );
        assert_eq!(
            policy.authenticate(&params(Some("opaque"), None)),
            Err(HandshakeError::AuthenticationMissing)
        );
        assert!(policy.issue_token("alice").is_none());
    }

    #[test]
    fn signed_token_derives_identity_from_token() {
        let policy = IdentityPolicy::signed("0123456789abcdef0123456789abcdef");
        let token = policy.issue_token("user.alice").unwrap();

        assert_eq!(
            policy.authenticate(&params(Some(&token), None)),
            Ok("user.alice".to_string())
        );
        assert_eq!(
            policy.authenticate(&params(Some(&token), Some("user.alice"))),
            Ok("user.alice".to_string())
        );
        assert_eq!(
            policy.authenticate(&params(Some(&token), Some("bob"))),
            Err(HandshakeError::IdentityMismatch)
        );
    }

    #[test]
    fn forged_or_malformed_tokens_are_rejected() {
        let policy = IdentityPolicy::signed("server-secret");
        let other = IdentityPolicy::signed("another-secret");
        let forged = other.issue_token("alice").unwrap();

        for token in [forged.as_str(), "alice", "alice.", ".c2ln", "alice.!!!"] {
            assert_eq!(
                policy.authenticate(&params(Some(token), None)),
                Err(HandshakeError::InvalidToken),
                "token {token:?} should be rejected"
            );
        }

        // Signature for one user does not carry over to another
        let token = policy.issue_token("alice").unwrap();
        let (_, sig) = token.rsplit_once('.').unwrap();
        let swapped = format!("bob.{sig}");
        assert_eq!(
            policy.authenticate(&params(Some(&swapped), None)),
            Err(HandshakeError::InvalidToken)
        );
    }
}
