#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the send window is full")]
    WindowFull,

    #[error("datagram of {0} bytes cannot hold a header")]
    Malformed(usize),

    #[error("window size {0} is not a positive multiple of MSS={}", crate::MSS)]
    WindowSize(u32),

    #[error("the connection is closed")]
    Closed,
}
