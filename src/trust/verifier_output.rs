//! Parser for `sign1util check --verbose` output.
//!
//! The verifier prints a header of `key: value` lines followed by the
//! payload. Only lines before the `payload:` marker are scanned for the
//! issuer and feed, so payload text that happens to contain `feed: ` does
//! not confuse the parser.

use thiserror::Error;

const ISSUER_MARKER: &str = "iss: ";
const FEED_MARKER: &str = "feed: ";
const PAYLOAD_MARKER: &str = "payload:";

/// Verifier output missing an expected marker line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierOutputError {
    /// No `iss: ` line before the payload.
    #[error("verifier output has no issuer line (\"iss: ...\")")]
    MissingIssuerMarker,
    /// No `feed: ` line before the payload.
    #[error("verifier output has no feed line (\"feed: ...\")")]
    MissingFeedMarker,
    /// No `payload:` marker.
    #[error("verifier output has no payload marker (\"payload:\")")]
    MissingPayloadMarker,
}

/// Issuer, feed and payload recovered from a verified envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFragment {
    /// `did:x509` issuer of the signing chain.
    pub issuer: String,
    /// Feed claim of the envelope.
    pub feed: String,
    /// Rego payload text.
    pub payload: String,
}

/// Parse verbose verifier output.
///
/// The payload is the rest of the `payload:` line, minus the single space
/// separating it from the marker, when that line carries any text;
/// otherwise it is every following line. Payload bytes are never trimmed.
///
/// # Errors
///
/// Returns the [`VerifierOutputError`] naming the first missing marker, in
/// issuer, feed, payload order.
pub fn parse(output: &str) -> Result<VerifiedFragment, VerifierOutputError> {
    let mut issuer = None;
    let mut feed = None;
    let mut payload = None;

    let mut offset = 0usize;
    for line in output.split_inclusive('\n') {
        let line_end = offset.saturating_add(line.len());
        let content = line.trim_end_matches(['\n', '\r']);
        let trimmed = content.trim_start();

        if let Some(rest) = trimmed.strip_prefix(PAYLOAD_MARKER) {
            payload = Some(if rest.trim().is_empty() {
                output[line_end..].to_owned()
            } else {
                let mut text = rest.strip_prefix(' ').unwrap_or(rest).to_owned();
                text.push_str(&output[content_end(offset, line)..]);
                text
            });
            break;
        }
        if issuer.is_none() {
            if let Some(rest) = trimmed.strip_prefix(ISSUER_MARKER) {
                issuer = Some(rest.trim().to_owned());
            }
        }
        if feed.is_none() {
            if let Some(rest) = trimmed.strip_prefix(FEED_MARKER) {
                feed = Some(rest.trim().to_owned());
            }
        }
        offset = line_end;
    }

    Ok(VerifiedFragment {
        issuer: issuer.ok_or(VerifierOutputError::MissingIssuerMarker)?,
        feed: feed.ok_or(VerifierOutputError::MissingFeedMarker)?,
        payload: payload.ok_or(VerifierOutputError::MissingPayloadMarker)?,
    })
}

/// Byte offset just past the visible text of `line`, before its line ending.
fn content_end(offset: usize, line: &str) -> usize {
    offset.saturating_add(line.trim_end_matches(['\n', '\r']).len())
}
