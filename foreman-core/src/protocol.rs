//! Line-oriented wire codec
//!
//! Every exchange is a single newline-terminated ASCII line in each
//! direction. One whitespace-delimited token requests a new block; exactly
//! [`BLOCK_ARITY`] decimal integer tokens confirm a block. Anything else is
//! a protocol error and the connection is dropped without a response.

use crate::block::{Block, BLOCK_ARITY};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid token count in request: {0}")]
    TokenCount(usize),

    #[error("invalid block offset: {0:?}")]
    BadOffset(String),
}

/// A parsed request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// "Give me a new block." Canonically the single token `1`, but any
    /// one-token line qualifies.
    NextBlock,
    /// "I finished this block."
    Confirm(Block),
}

/// A response line, before formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The assigned block offsets.
    Assigned(Block),
    /// No more work, shutdown imminent.
    Stop,
    /// Confirm accepted: the block was in flight.
    Accepted,
    /// Confirm rejected: the block was no longer in flight.
    Rejected,
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.len() {
        1 => Ok(Request::NextBlock),
        BLOCK_ARITY => {
            let mut offsets = [0u64; BLOCK_ARITY];
            for (slot, token) in offsets.iter_mut().zip(&tokens) {
                *slot = parse_offset(token)?;
            }
            Ok(Request::Confirm(Block(offsets)))
        }
        count => Err(ProtocolError::TokenCount(count)),
    }
}

fn parse_offset(token: &str) -> Result<u64, ProtocolError> {
    // only bare decimal digits, no sign or radix prefixes
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::BadOffset(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| ProtocolError::BadOffset(token.to_string()))
}

/// Format one response line, without the trailing newline.
///
/// The confirm encoding is inverted on the wire: `0` means accepted and `1`
/// means rejected. Compatibility contract, keep it.
pub fn format_response(response: &Response) -> String {
    match response {
        Response::Assigned(block) => block.to_string(),
        Response::Stop => "stop".to_string(),
        Response::Accepted => "0".to_string(),
        Response::Rejected => "1".to_string(),
    }
}
