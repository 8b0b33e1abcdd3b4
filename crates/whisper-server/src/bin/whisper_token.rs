//! Mint a development token signed with the configured secret.
//!
//! Usage: whisper-token <identity> [ttl_secs] [first_name]
//!
//! A `ttl_secs` of 0 mints a token without an expiry.

use anyhow::{bail, Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use whisper_core::Claims;
use whisper_server::Config;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let Some(identity) = args.get(1) else {
        bail!("usage: whisper-token <identity> [ttl_secs] [first_name]");
    };
    let ttl: u64 = match args.get(2) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid ttl_secs: {raw}"))?,
        None => 3600,
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock before unix epoch")?
        .as_secs();

    let mut claims = Claims::new(identity.as_str());
    if let Some(expires_at) = expiry(now, ttl)? {
        claims = claims.with_expiry(expires_at);
    }
    if let Some(name) = args.get(3) {
        claims = claims.with_display_name(name.as_str());
    }

    let config = Config::load()?;
    let token = config.auth.verifier().issue(&claims)?;
    println!("{token}");

    Ok(())
}

/// Expiry for a token minted at `now` with lifetime `ttl`. Zero means none.
fn expiry(now: u64, ttl: u64) -> Result<Option<u64>> {
    if ttl == 0 {
        return Ok(None);
    }
    now.checked_add(ttl)
        .map(Some)
        .with_context(|| format!("ttl_secs too large: {ttl}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        assert_eq!(expiry(1_000, 0).unwrap(), None);
        assert_eq!(expiry(1_000, 60).unwrap(), Some(1_060));
    }

    #[test]
    fn test_expiry_overflow_is_an_error() {
        assert!(expiry(1_000, u64::MAX).is_err());
    }
}
