//! Utilities for working with byte array identifiers

/// Convert to a base32 string
pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
    let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
    text.make_ascii_lowercase();
    text
}

/// Convert to a base32 string limited to the first 10 bytes
pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
    let len = bytes.as_ref().len().min(10);
    let mut text = data_encoding::BASE32_NOPAD.encode(&bytes.as_ref()[..len]);
    text.make_ascii_lowercase();
    text.push('…');
    text
}

/// Parse from a base32 string into a byte array
pub fn parse_array<const N: usize>(input: &str) -> Result<[u8; N], ParseError> {
    data_encoding::BASE32_NOPAD
        .decode(input.to_ascii_uppercase().as_bytes())
        .map_err(|_| ParseError)?
        .try_into()
        .map_err(|_| ParseError)
}

/// Failed to parse a base32 identifier.
#[derive(Debug, thiserror::Error)]
#[error("invalid base32 identifier")]
pub struct ParseError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let bytes = [7u8; 32];
        let text = fmt(bytes);
        assert_eq!(parse_array::<32>(&text).unwrap(), bytes);
        assert!(fmt_short(bytes).ends_with('…'));
    }
}
