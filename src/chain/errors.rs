use crate::core::types::Hash256;
use crate::store::StoreError;

/// Where a duplicate block was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Known {
    Block,
    Orphan,
}

#[derive(Debug)]
pub enum ChainError {
    AlreadyHave(Known),
    WrongHeight { expected: u32, got: u32 },
    SanityFailed(String),
    ContextFailed(String),
    /// A disconnected block was spliced into a non-empty tree
    OrphanLoadForbidden(Hash256),
    DisconnectNotTip,
    ConnectNotExtending,
    MissingSideChainBody(Hash256),
    InvalidDifficulty { expected: u32, got: u32 },
    InvalidMerkleRoot,
    Store(StoreError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::AlreadyHave(Known::Block) => write!(f, "already have block"),
            ChainError::AlreadyHave(Known::Orphan) => write!(f, "already have block (orphan)"),
            ChainError::WrongHeight { expected, got } => {
                write!(f, "wrong block height: expected {}, got {}", expected, got)
            }
            ChainError::SanityFailed(reason) => write!(f, "block sanity check failed: {}", reason),
            ChainError::ContextFailed(reason) => write!(f, "block context check failed: {}", reason),
            ChainError::OrphanLoadForbidden(hash) => {
                write!(f, "attempt to load orphan block {}", hex::encode(hash))
            }
            ChainError::DisconnectNotTip => {
                write!(f, "disconnect must be called with the block at the end of the main chain")
            }
            ChainError::ConnectNotExtending => {
                write!(f, "connect must be called with a block that extends the main chain")
            }
            ChainError::MissingSideChainBody(hash) => {
                write!(f, "block {} is missing from the side chain block cache", hex::encode(hash))
            }
            ChainError::InvalidDifficulty { expected, got } => {
                write!(f, "difficulty mismatch: expected {:#010x}, got {:#010x}", expected, got)
            }
            ChainError::InvalidMerkleRoot => write!(f, "invalid merkle root"),
            ChainError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        ChainError::Store(e)
    }
}
