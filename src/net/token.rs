use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a connection token on the wire
pub const TOKEN_LEN: usize = 64;

/// Opaque 64-byte identity of a client across reconnects
///
/// Sent verbatim (no length prefix) as the payload of the TOKEN channel.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(Vec<u8>);

impl Token {
    /// Random alphanumeric token
    pub fn generate() -> Self {
        let bytes = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(TOKEN_LEN)
            .collect();
        Self(bytes)
    }

    /// Token from a string, padded with `0` or truncated to [`TOKEN_LEN`]
    pub fn from_str_padded(s: &str) -> Self {
        let mut bytes: Vec<u8> = s.bytes().take(TOKEN_LEN).collect();
        bytes.resize(TOKEN_LEN, b'0');
        Self(bytes)
    }

    /// Try to create from a TOKEN packet payload
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != TOKEN_LEN {
            return None;
        }
        Some(Self(slice.to_vec()))
    }

    /// Token a client holds before it was issued one
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self)
    }
}

/// Short printable form for logs
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "{}", String::from_utf8_lossy(shown))?;
        if self.0.len() > 8 {
            f.write_str("…")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = Token::generate();
        let b = Token::generate();
        assert_eq!(a.as_bytes().len(), TOKEN_LEN);
        assert!(a.as_bytes().iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(a, b);
    }

    #[test]
    fn test_try_from_slice() {
        let token = Token::generate();
        assert_eq!(Token::try_from_slice(token.as_bytes()), Some(token));
        assert_eq!(Token::try_from_slice(&[1, 2, 3]), None);
        assert_eq!(Token::try_from_slice(&[0u8; TOKEN_LEN + 1]), None);
    }

    #[test]
    fn test_padded() {
        let token = Token::from_str_padded("player-1");
        assert_eq!(token.as_bytes().len(), TOKEN_LEN);
        assert!(token.as_bytes().starts_with(b"player-1"));
        assert_eq!(token.to_string(), "player-1…");
    }

    #[test]
    fn test_empty() {
        assert!(Token::default().is_empty());
        assert_eq!(Token::empty().to_string(), "");
    }
}
