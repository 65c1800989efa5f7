//! Token command implementation.

use tidesync_server::{AuthConfig, Caller, TokenValidator};
use uuid::Uuid;

/// Runs the token command.
pub fn run(secret: &str, account: Uuid, admin: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", issue(secret, account, admin)?);
    Ok(())
}

/// Signs a token for `account` with `secret`.
pub fn issue(
    secret: &str,
    account: Uuid,
    admin: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let caller = if admin {
        Caller::administrator(account)
    } else {
        Caller::user(account)
    };
    let validator = TokenValidator::new(AuthConfig::new(secret.as_bytes().to_vec()));
    Ok(validator.create_token(&caller)?)
}
