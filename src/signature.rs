use alloy::primitives::{Address, Signature};
use std::str::FromStr;

use crate::error::Error;

/// Signed messages older (or newer) than this are rejected.
pub const MAX_MESSAGE_AGE_MS: i64 = 5 * 60 * 1000;

/// Canonical claim message. The address is lowercased before it enters
/// the message, so mixed-case request bodies verify identically.
pub fn claim_message(address: &str, timestamp: i64) -> String {
    format!(
        "wagmi-claim\naddress:{}\ntimestamp:{}",
        address.to_lowercase(),
        timestamp
    )
}

/// Canonical allocation-vote message. Out-of-range percent is clamped
/// before the message is formed, matching what compliant clients sign.
pub fn vote_message(eth_percent: i64, timestamp: i64) -> String {
    format!(
        "eth_percent:{}\ntimestamp:{}",
        eth_percent.clamp(0, 100),
        timestamp
    )
}

pub fn check_freshness(timestamp: i64, now: i64) -> Result<(), Error> {
    if (now - timestamp).abs() > MAX_MESSAGE_AGE_MS {
        return Err(Error::SignatureExpired);
    }
    Ok(())
}

/// ERC-191 personal-message recovery; the recovered signer must equal
/// the claimed address.
pub fn verify_personal(
    message: &str,
    signature: &str,
    expected: Address,
) -> Result<(), Error> {
    let signature = Signature::from_str(signature.trim())
        .map_err(|error| Error::InvalidSignature(error.to_string()))?;
    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|error| Error::InvalidSignature(error.to_string()))?;
    if recovered != expected {
        return Err(Error::SignatureMismatch);
    }
    Ok(())
}
