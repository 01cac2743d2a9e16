//! Wire codec for the login handshake and command frames.
//!
//! Frames carry no length prefix. A login frame is a single JSON object,
//! sent once right after connecting:
//!
//! ```text
//! {"Email":"a@b.com","Password":"p"}
//! ```
//!
//! Every later frame is one action byte followed by a JSON object whose
//! shape depends on the action:
//!
//! ```text
//! 1{"Content":"hello"}
//! ```
//!
//! Frame boundaries are found by parsing, so a frame split across reads is
//! reported as `Incomplete` and frames coalesced into one read decode one
//! after another.

use bytes::Bytes;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::Deserializer;
use thiserror::Error;

/// Credentials sent on a pending connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// One command frame received on an active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Action code, the first byte of the frame.
    pub action: u8,
    /// The JSON document following the action code.
    pub payload: Bytes,
}

/// Decode result.
#[derive(Debug)]
pub enum Decoded<T> {
    /// Successfully decoded value with bytes consumed.
    Complete(T, usize),
    /// Need more data.
    Incomplete,
    /// The buffered bytes can never form a valid frame.
    Invalid(DecodeError),
}

/// Frame decoding errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
}

/// Decode a login frame from the start of `input`.
pub fn decode_login(input: &[u8]) -> Decoded<LoginRequest> {
    let start = leading_whitespace(input);
    match next_json::<LoginRequest>(&input[start..]) {
        Decoded::Complete(login, consumed) => Decoded::Complete(login, start + consumed),
        Decoded::Incomplete => Decoded::Incomplete,
        Decoded::Invalid(e) => Decoded::Invalid(e),
    }
}

/// Decode a command frame from the start of `input`.
///
/// Only the extent of the payload is checked here; decoding it into the
/// shape an action expects is the handler's job.
pub fn decode_command(input: &[u8]) -> Decoded<Envelope> {
    let start = leading_whitespace(input);
    let Some((&action, rest)) = input[start..].split_first() else {
        return Decoded::Incomplete;
    };

    match next_json::<IgnoredAny>(rest) {
        Decoded::Complete(_, len) => {
            let envelope = Envelope {
                action,
                payload: Bytes::copy_from_slice(&rest[..len]),
            };
            Decoded::Complete(envelope, start + 1 + len)
        }
        Decoded::Incomplete => Decoded::Incomplete,
        Decoded::Invalid(e) => Decoded::Invalid(e),
    }
}

/// Parse exactly one JSON value off the front of `input`.
fn next_json<T: DeserializeOwned>(input: &[u8]) -> Decoded<T> {
    let mut stream = Deserializer::from_slice(input).into_iter::<T>();
    match stream.next() {
        Some(Ok(value)) => Decoded::Complete(value, stream.byte_offset()),
        Some(Err(e)) if e.is_eof() => Decoded::Incomplete,
        Some(Err(e)) => Decoded::Invalid(e.into()),
        None => Decoded::Incomplete,
    }
}

fn leading_whitespace(input: &[u8]) -> usize {
    input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len())
}

/// Reply sent once a login succeeds.
pub fn response_ok() -> &'static [u8] {
    b"OK\n"
}

/// Format an error reply.
pub fn response_error(reason: &str) -> Vec<u8> {
    let reason = reason.replace(['\r', '\n'], " ");
    format!("ERR {reason}\n").into_bytes()
}
