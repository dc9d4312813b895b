//! Session id minting.
//!
//! Inbound session ids are opaque to clients but carry a service-chosen
//! prefix so the proxy can tell its own ids from pass-through values.

/// Prefix on every proxy-minted session id.
pub const SESSION_ID_PREFIX: &str = "unimcp-";

/// Mint a new session id: `unimcp-` + 128 bits of CSPRNG hex.
///
/// # Panics
///
/// Panics if the OS random number generator is unavailable. Fail-closed:
/// a guessable session id is worse than no session.
pub fn mint_session_id() -> String {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("OS random number generator unavailable");
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{SESSION_ID_PREFIX}{hex}")
}

/// True when `id` was minted by this service.
pub fn is_service_id(id: &str) -> bool {
    id.starts_with(SESSION_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn minted_ids_are_prefixed_and_unique() {
        let a = mint_session_id();
        let b = mint_session_id();
        assert!(is_service_id(&a));
        assert!(is_service_id(&b));
        assert_ne!(a, b);
        assert_eq!(a.len(), SESSION_ID_PREFIX.len() + 32);
    }

    #[test]
    fn foreign_ids_are_not_ours() {
        assert!(!is_service_id("mcp-abcdef"));
        assert!(!is_service_id(""));
    }
}
