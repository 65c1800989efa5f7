//! Authentication support for the sync server.
//!
//! Tokens are signed with HMAC-SHA256 and carry the caller's account and
//! role together with the time they were issued.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 16 bytes: account id
//! - 1 byte: role (0 = user, 1 = administrator)
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 57 bytes, hex-encoded for transport.

use crate::error::{ServerError, ServerResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const PAYLOAD_LEN: usize = 16 + 1 + 8;
const SIGNATURE_LEN: usize = 32;
const TOKEN_LEN: usize = PAYLOAD_LEN + SIGNATURE_LEN;

/// Default token lifetime.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// What a caller is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Full access, including permanent deletions and issue details.
    Administrator,
    /// Access limited by the server schema.
    User,
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Administrator => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Role::User),
            1 => Some(Role::Administrator),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Administrator => write!(f, "administrator"),
            Role::User => write!(f, "user"),
        }
    }
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    /// Account the caller acts for.
    pub account_id: Uuid,
    /// The caller's role.
    pub role: Role,
}

impl Caller {
    /// A regular user.
    pub fn user(account_id: Uuid) -> Self {
        Self {
            account_id,
            role: Role::User,
        }
    }

    /// An administrator.
    pub fn administrator(account_id: Uuid) -> Self {
        Self {
            account_id,
            role: Role::Administrator,
        }
    }

    /// Returns true for administrators.
    pub fn is_administrator(&self) -> bool {
        self.role == Role::Administrator
    }

    /// Stable identity string used to tag sessions.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.role, self.account_id)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: DEFAULT_TOKEN_EXPIRY,
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates caller tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `caller`, issued now.
    pub fn create_token(&self, caller: &Caller) -> ServerResult<String> {
        self.create_token_at(caller, Utc::now())
    }

    /// Creates a token for `caller` as if issued at `issued_at`.
    pub fn create_token_at(
        &self,
        caller: &Caller,
        issued_at: DateTime<Utc>,
    ) -> ServerResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(caller.account_id.as_bytes());
        token.push(caller.role.to_byte());
        token.extend_from_slice(&issued_at.timestamp_millis().to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(hex::encode(token))
    }

    /// Validates a token against the current time.
    pub fn validate_token(&self, token: &str) -> ServerResult<Caller> {
        self.validate_token_at(token, Utc::now())
    }

    /// Validates a token as of `now`, returning the caller it names.
    pub fn validate_token_at(&self, token: &str, now: DateTime<Utc>) -> ServerResult<Caller> {
        let bytes = hex::decode(token.trim())
            .map_err(|_| ServerError::AuthenticationFailed("token is not hex".into()))?;
        if bytes.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed("invalid token length".into()));
        }
        let (payload, signature) = bytes.split_at(PAYLOAD_LEN);

        self.mac(payload)?
            .verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let mut account = [0u8; 16];
        account.copy_from_slice(&payload[..16]);
        let role = Role::from_byte(payload[16])
            .ok_or_else(|| ServerError::AuthenticationFailed("unknown role".into()))?;
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&payload[17..]);
        let issued_millis = i64::from_be_bytes(issued);

        let expiry_millis =
            i64::try_from(self.config.token_expiry.as_millis()).unwrap_or(i64::MAX);
        if now.timestamp_millis() > issued_millis.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(Caller {
            account_id: Uuid::from_bytes(account),
            role,
        })
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key rejected: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let caller = Caller::user(Uuid::new_v4());

        let token = validator.create_token(&caller).unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert_eq!(validator.validate_token(&token).unwrap(), caller);
    }

    #[test]
    fn role_survives_the_round_trip() {
        let validator = validator();
        let admin = Caller::administrator(Uuid::new_v4());
        let token = validator.create_token(&admin).unwrap();
        assert!(validator.validate_token(&token).unwrap().is_administrator());
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token(&Caller::user(Uuid::new_v4())).unwrap();

        // Promote the caller to administrator without re-signing.
        let mut bytes = hex::decode(&token).unwrap();
        bytes[16] = 1;
        let forged = hex::encode(bytes);

        assert!(matches!(
            validator.validate_token(&forged),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token(&Caller::user(Uuid::new_v4())).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"secret".to_vec()).with_expiry(Duration::from_secs(60)),
        );
        let issued = Utc::now();
        let token = validator
            .create_token_at(&Caller::user(Uuid::new_v4()), issued)
            .unwrap();

        assert!(validator
            .validate_token_at(&token, issued + chrono::Duration::seconds(30))
            .is_ok());
        assert!(validator
            .validate_token_at(&token, issued + chrono::Duration::seconds(61))
            .is_err());
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token("not a token").is_err());
        assert!(validator.validate_token("abcd").is_err());
    }

    #[test]
    fn identity_names_role_and_account() {
        let id = Uuid::nil();
        assert_eq!(Caller::user(id).identity(), format!("user:{id}"));
        assert_ne!(Caller::user(id).identity(), Caller::administrator(id).identity());
    }
}
