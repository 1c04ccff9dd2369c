pub mod copy;
pub mod peek;
pub mod signal;
pub mod timeout;

use tokio::io::{AsyncRead, AsyncWrite};

/// An ordered, bidirectional byte stream. Everything the proxy shuffles
/// around — raw TCP, TLS on either side, peek wrappers — erases to this.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;
