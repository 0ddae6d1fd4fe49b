//! `key=value;key=value` header payloads.
//!
//! Values are percent-encoded where they contain the separators, `%`, control
//! characters or non-ASCII text, so any identifier survives the round trip.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

const VALUE: &AsciiSet = &CONTROLS.add(b';').add(b'=').add(b'%');

/// A payload segment that is not a single `key=value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPair(pub String);

/// Split a header payload into its pairs. Empty segments are skipped.
pub fn parse_pairs(value: &str) -> Result<Vec<(String, String)>, MalformedPair> {
    value
        .split(';')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut parts = segment.splitn(3, '=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() => percent_decode_str(value)
                    .decode_utf8()
                    .map(|value| (key.to_string(), value.into_owned()))
                    .map_err(|_| MalformedPair(segment.to_string())),
                _ => Err(MalformedPair(segment.to_string())),
            }
        })
        .collect()
}

/// Serialize pairs in the order given.
pub fn to_header_value<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, utf8_percent_encode(value, VALUE)))
        .collect::<Vec<_>>()
        .join(";")
}
