use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Expected a 4-byte integer frame, got {0} bytes")]
    InvalidIntFrame(usize),

    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decompression error: {0}")]
    Decompress(String),

    #[error("SOCKS proxy error: {0}")]
    Socks(String),

    #[error("No route to service {0}")]
    NoRoute(String),
}
