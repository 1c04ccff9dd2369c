use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::Stream;

/// Non-destructive read-ahead over a byte stream.
///
/// `peek` pulls at most one chunk from the underlying stream and parks it in
/// a buffer; subsequent reads drain that buffer before falling through. The
/// pending prefix can also be replaced wholesale, which is how the rewriting
/// reverse proxy splices a modified request head back in front of the body.
pub struct PeekStream<S> {
	inner: S,
	buf: Vec<u8>,
	pos: usize,
	peeked: bool,
}

impl<S: Stream> PeekStream<S> {
	pub fn new(inner: S) -> Self {
		PeekStream {
			inner,
			buf: Vec::new(),
			pos: 0,
			peeked: false,
		}
	}

	/// Returns up to `n` bytes without advancing the read cursor. Performs at
	/// most one underlying read; calling `peek` again returns the same
	/// buffered prefix.
	pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
		if !self.peeked {
			let mut tmp = vec![0u8; n];
			let read = self.inner.read(&mut tmp).await?;
			tmp.truncate(read);
			self.buf = tmp;
			self.pos = 0;
			self.peeked = true;
		}
		Ok(&self.buf[self.pos..])
	}

	/// Replaces the pending unread prefix.
	pub fn set_peeked(&mut self, data: Vec<u8>) {
		self.buf = data;
		self.pos = 0;
		self.peeked = true;
	}

	/// Consumes and returns the pending unread prefix.
	pub fn take_peeked(&mut self) -> Vec<u8> {
		let out = self.buf.split_off(self.pos);
		self.buf.clear();
		self.pos = 0;
		out
	}

	pub fn has_pending(&self) -> bool {
		self.pos < self.buf.len()
	}
}

impl<S: Stream> AsyncRead for PeekStream<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.get_mut();
		if me.pos < me.buf.len() {
			let n = cmp::min(buf.remaining(), me.buf.len() - me.pos);
			buf.put_slice(&me.buf[me.pos..me.pos + n]);
			me.pos += n;
			if me.pos == me.buf.len() {
				me.buf.clear();
				me.pos = 0;
			}
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut me.inner).poll_read(cx, buf)
	}
}

impl<S: Stream> AsyncWrite for PeekStream<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn peek_then_read_loses_nothing() {
		let (client, server) = tokio::io::duplex(64);
		let mut client = client;
		client.write_all(b"hello world").await.unwrap();

		let mut peeked = PeekStream::new(server);
		let head = peeked.peek(5).await.unwrap();
		assert_eq!(head, b"hello");
		assert!(peeked.has_pending());

		// A second peek returns the same prefix without another read.
		assert_eq!(peeked.peek(5).await.unwrap(), b"hello");

		let mut out = vec![0u8; 11];
		peeked.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"hello world");
		assert!(!peeked.has_pending());
	}

	#[tokio::test]
	async fn read_smaller_than_peek_drains_in_order() {
		let (client, server) = tokio::io::duplex(64);
		let mut client = client;
		client.write_all(b"abcdef").await.unwrap();

		let mut peeked = PeekStream::new(server);
		assert_eq!(peeked.peek(6).await.unwrap(), b"abcdef");

		let mut two = [0u8; 2];
		peeked.read_exact(&mut two).await.unwrap();
		assert_eq!(&two, b"ab");
		let mut rest = [0u8; 4];
		peeked.read_exact(&mut rest).await.unwrap();
		assert_eq!(&rest, b"cdef");
	}

	#[tokio::test]
	async fn set_peeked_replaces_prefix() {
		let (client, server) = tokio::io::duplex(64);
		let mut client = client;
		client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

		let mut peeked = PeekStream::new(server);
		peeked.peek(16).await.unwrap();
		peeked.set_peeked(b"POST / HTTP/1.1\r\n".to_vec());

		let mut out = vec![0u8; 17];
		peeked.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"POST / HTTP/1.1\r\n");
	}
}
