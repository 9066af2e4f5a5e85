use tokio::io::{AsyncRead, AsyncWrite};

/// A raw bidirectional byte stream handed out by a transport.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn PeerIo>;
