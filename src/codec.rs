//! Manifest deobfuscation
//!
//! The scraped portal does not hand out its stream manifest in clear text.
//! The payload is a base64 blob interleaved with "trash" tokens (base64
//! encodings of every 2- and 3-character string over a small symbol alphabet)
//! and sentinel markers. Stripping all of that leaves a valid base64 string
//! whose decoded text is the comma separated `[resolution]url or url` list.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Symbols the trash tokens are built from
const TRASH_ALPHABET: [char; 5] = ['@', '#', '!', '^', '$'];

/// Marker prefixed to every obfuscated payload
const HEAD_MARKER: &str = "#h";

/// Marker placed between payload fragments
const FRAGMENT_SEPARATOR: &str = "//_//";

/// Upstream pads inconsistently, so decoding accepts any padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Every base64-encoded trash combination, length 2 first, then length 3
static TRASH_TOKENS: LazyLock<Vec<String>> = LazyLock::new(build_trash_tokens);

/// Errors that can occur while decoding a manifest
#[derive(Debug, Error)]
pub enum CodecError {
    /// The residue left after stripping trash is not base64
    #[error("Manifest residue is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded bytes are not valid UTF-8
    #[error("Manifest is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Unknown manifest encoding name
    #[error("Unknown manifest encoding: {0}")]
    UnknownEncoding(String),
}

/// How the decoded manifest bytes are turned into text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextDecoding {
    /// Decode as UTF-8 (current upstream)
    #[default]
    Utf8,
    /// One byte per character (older upstream variant)
    Latin1,
}

/// How a provider delivers its manifest string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestEncoding {
    /// Deobfuscate when the payload carries the head marker, pass through otherwise
    #[default]
    Auto,
    /// The manifest is already clear text
    Plain,
    /// The manifest is always obfuscated
    Obfuscated(TextDecoding),
}

impl FromStr for ManifestEncoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "plain" => Ok(Self::Plain),
            "obfuscated" | "obfuscated-utf8" => Ok(Self::Obfuscated(TextDecoding::Utf8)),
            "obfuscated-latin1" => Ok(Self::Obfuscated(TextDecoding::Latin1)),
            other => Err(CodecError::UnknownEncoding(other.to_string())),
        }
    }
}

/// Turns a raw manifest string into its clear-text form
///
/// # Arguments
///
/// * `raw` - The manifest exactly as upstream returned it
/// * `encoding` - How the provider variant encodes its manifests
pub fn decode_manifest(raw: &str, encoding: ManifestEncoding) -> Result<String, CodecError> {
    match encoding {
        ManifestEncoding::Plain => Ok(raw.to_string()),
        ManifestEncoding::Obfuscated(text) => decode(raw, text),
        ManifestEncoding::Auto if raw.starts_with(HEAD_MARKER) => decode(raw, TextDecoding::Utf8),
        ManifestEncoding::Auto => Ok(raw.to_string()),
    }
}

/// Strips sentinels and trash tokens, then base64-decodes the residue
pub fn decode(raw: &str, text: TextDecoding) -> Result<String, CodecError> {
    let mut residue: String = raw
        .replace(HEAD_MARKER, "")
        .split(FRAGMENT_SEPARATOR)
        .collect();

    for token in TRASH_TOKENS.iter() {
        residue = residue.replace(token.as_str(), "");
    }

    let bytes = LENIENT_BASE64.decode(residue.trim_end_matches('='))?;

    match text {
        TextDecoding::Utf8 => Ok(String::from_utf8(bytes)?),
        TextDecoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn build_trash_tokens() -> Vec<String> {
    let mut tokens = Vec::new();

    for length in 2..=3 {
        let mut combos = vec![String::new()];
        for _ in 0..length {
            combos = combos
                .iter()
                .flat_map(|prefix| TRASH_ALPHABET.iter().map(move |c| format!("{prefix}{c}")))
                .collect();
        }
        tokens.extend(combos.iter().map(|combo| STANDARD.encode(combo)));
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors what upstream does: base64 the text, then splice trash
    /// tokens behind fragment separators between 4-character groups.
    fn obfuscate(plain: &str) -> String {
        let encoded = STANDARD.encode(plain);
        let mut out = String::from(HEAD_MARKER);

        for (index, group) in encoded.as_bytes().chunks(4).enumerate() {
            out.push_str(std::str::from_utf8(group).unwrap());
            if index % 3 == 1 {
                out.push_str(FRAGMENT_SEPARATOR);
                out.push_str(&TRASH_TOKENS[(index * 37) % TRASH_TOKENS.len()]);
            }
        }

        out
    }

    #[test]
    fn test_trash_token_table() {
        assert_eq!(TRASH_TOKENS.len(), 25 + 125);
        assert_eq!(TRASH_TOKENS[0], "QEA=");
        assert_eq!(TRASH_TOKENS[25], "QEBA");
    }

    #[test]
    fn test_roundtrip_ascii_manifest() {
        let manifest = "[720p]http://a.example/720.mp4 or http://b.example/720.mp4,\
                        [480p]http://c.example/480.mp4 or http://d.example/480.mp4";
        let raw = obfuscate(manifest);
        assert!(raw.contains(FRAGMENT_SEPARATOR));
        assert_eq!(decode(&raw, TextDecoding::Utf8).unwrap(), manifest);
    }

    #[test]
    fn test_roundtrip_cyrillic_needs_utf8() {
        let subtitles = "[Русский]http://s.example/ru.vtt";
        let raw = obfuscate(subtitles);
        assert_eq!(decode(&raw, TextDecoding::Utf8).unwrap(), subtitles);
        assert_ne!(decode(&raw, TextDecoding::Latin1).unwrap(), subtitles);
    }

    #[test]
    fn test_auto_passes_clear_text_through() {
        let manifest = "[720p]http://a or http://b";
        assert_eq!(
            decode_manifest(manifest, ManifestEncoding::Auto).unwrap(),
            manifest
        );
        assert_eq!(
            decode_manifest(&obfuscate(manifest), ManifestEncoding::Auto).unwrap(),
            manifest
        );
    }

    #[test]
    fn test_invalid_residue() {
        let result = decode("#h*not base64*", TextDecoding::Utf8);
        assert!(matches!(result, Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("plain".parse::<ManifestEncoding>().unwrap(), ManifestEncoding::Plain);
        assert_eq!(
            "obfuscated-latin1".parse::<ManifestEncoding>().unwrap(),
            ManifestEncoding::Obfuscated(TextDecoding::Latin1)
        );
        assert!("rot13".parse::<ManifestEncoding>().is_err());
    }
}
