//! Worker-side client
//!
//! Thin client for worker processes. Each exchange opens a fresh
//! connection, sends one request line, and reads one response line; the
//! service closes the connection afterwards.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::block::{Block, BLOCK_ARITY};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0:?}")]
    BadResponse(String),
}

/// Client handle for one coordinator address.
#[derive(Debug, Clone)]
pub struct BlockClient {
    host: String,
    port: u16,
}

impl BlockClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ask for a new block. `None` means the service is out of work and
    /// shutting down; the worker should exit its loop.
    pub async fn request_block(&self) -> Result<Option<Block>, ClientError> {
        let line = self.exchange("1").await?;
        if line.trim() == "stop" {
            return Ok(None);
        }
        match parse_assigned(&line) {
            Some(block) => {
                debug!("assigned block {block}");
                Ok(Some(block))
            }
            None => Err(ClientError::BadResponse(line)),
        }
    }

    /// Report a block complete. `false` means the service rejected the
    /// confirm because the block had already been expired; the work product
    /// may still be intact, but the block will be retried or failed.
    pub async fn confirm_block(&self, block: &Block) -> Result<bool, ClientError> {
        let line = self.exchange(&block.to_string()).await?;
        match line.trim() {
            "0" => Ok(true),
            "1" => Ok(false),
            _ => Err(ClientError::BadResponse(line)),
        }
    }

    async fn exchange(&self, request: &str) -> Result<String, ClientError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(line)
    }
}

fn parse_assigned(line: &str) -> Option<Block> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != BLOCK_ARITY {
        return None;
    }
    let mut offsets = [0u64; BLOCK_ARITY];
    for (slot, token) in offsets.iter_mut().zip(&tokens) {
        *slot = token.parse().ok()?;
    }
    Some(Block(offsets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assigned_block() {
        assert_eq!(parse_assigned("0 100 200\n"), Some(Block([0, 100, 200])));
        assert_eq!(parse_assigned("stop\n"), None);
        assert_eq!(parse_assigned("0 100\n"), None);
        assert_eq!(parse_assigned("a b c\n"), None);
    }
}
