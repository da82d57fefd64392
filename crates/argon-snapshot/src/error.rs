use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("truncated snapshot: wanted {wanted} more bytes")]
    Truncated { wanted: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid segment tag {0}")]
    InvalidSegmentTag(u8),

    #[error("invalid cpu mode tag {0}")]
    InvalidModeTag(u8),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}
