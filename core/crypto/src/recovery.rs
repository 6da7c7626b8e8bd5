//! Password recovery tokens.
//!
//! A token is a reversible, printable encoding of the password meant to be
//! stored out of band (printed, written down). It is an obfuscation, not
//! encryption: anyone holding the token can recover the password.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use zeroize::Zeroize;

use capsule_common::{Error, Result, SensitiveBytes};

/// Prefix that marks a string as a recovery token.
const TOKEN_PREFIX: &str = "cpr1-";

const MASK: [u8; 16] = [
    0x3c, 0xa7, 0x51, 0x9e, 0x02, 0xd4, 0x6b, 0xf1, 0x88, 0x17, 0xc5, 0x2e, 0x73, 0xb9, 0x4a, 0xe0,
];

fn mask_in_place(bytes: &mut [u8]) {
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= MASK[i % MASK.len()] ^ (i as u8).wrapping_mul(31);
    }
}

/// Produce a recovery token for `password`.
pub fn password_recovery_token(password: &[u8]) -> String {
    let mut masked = password.to_vec();
    mask_in_place(&mut masked);
    let token = format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(&masked));
    masked.zeroize();
    token
}

/// Recover the password encoded in `token`.
///
/// # Errors
/// - `InvalidInput` if the token lacks the prefix or is not valid base64
pub fn resolve_token(token: &str) -> Result<SensitiveBytes> {
    let body = token
        .trim()
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| Error::InvalidInput("Not a recovery token".to_string()))?;
    let mut bytes = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| Error::InvalidInput(format!("Malformed recovery token: {}", e)))?;
    mask_in_place(&mut bytes);
    Ok(SensitiveBytes::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_token_roundtrip() {
        let token = password_recovery_token(b"correct horse battery staple");
        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(!token.contains("horse"));
        let resolved = resolve_token(&token).unwrap();
        assert_eq!(resolved.as_bytes(), b"correct horse battery staple");
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(resolve_token("plain-password").is_err());
        assert!(resolve_token("cpr1-###").is_err());
    }

    proptest! {
        #[test]
        fn prop_resolve_inverts_token(password in proptest::collection::vec(any::<u8>(), 0..96)) {
            let token = password_recovery_token(&password);
            let resolved = resolve_token(&token).unwrap();
            prop_assert_eq!(resolved.as_bytes(), &password[..]);
        }
    }
}
