//! `taskroom token`: mint a signed handshake token.

use anyhow::bail;

use crate::auth::IdentityPolicy;

pub fn run(secret: Option<&str>, user_id: &str) -> anyhow::Result<()> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        bail!("--auth-secret (or TASKROOM_AUTH_SECRET) is required to sign tokens");
    };
    let user_id = user_id.trim();
    if user_id.is_empty() {
        bail!("--user-id must not be empty");
    }

    let policy = IdentityPolicy::signed(secret);
    let Some(token) = policy.issue_token(user_id) else {
        bail!("identity policy {} cannot issue tokens", policy.name());
    };

    println!("{token}");
    eprintln!();
    eprintln!("  Connect with: /ws?token={token}");
    eprintln!("  The server must run with the same --auth-secret.");
    Ok(())
}
