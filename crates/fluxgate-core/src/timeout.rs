use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

pin_project! {
	/// Fails pending reads and writes with `TimedOut` once a full window
	/// elapses without any successful read or write on the stream. Progress in
	/// either direction rearms the watchdog.
	pub struct IdleTimeout<S> {
		#[pin]
		inner: S,
		sleep: Pin<Box<Sleep>>,
		window: Duration,
	}
}

impl<S> IdleTimeout<S> {
	pub fn new(inner: S, window: Duration) -> Self {
		IdleTimeout {
			inner,
			sleep: Box::pin(tokio::time::sleep(window)),
			window,
		}
	}
}

fn idle_error() -> io::Error {
	io::Error::new(io::ErrorKind::TimedOut, "connection idle")
}

impl<S: AsyncRead> AsyncRead for IdleTimeout<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = self.project();
		let before = buf.filled().len();
		match me.inner.poll_read(cx, buf) {
			Poll::Ready(Ok(())) => {
				if buf.filled().len() > before {
					let deadline = Instant::now() + *me.window;
					me.sleep.as_mut().reset(deadline);
				}
				Poll::Ready(Ok(()))
			},
			Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
			Poll::Pending => match me.sleep.as_mut().poll(cx) {
				Poll::Ready(()) => Poll::Ready(Err(idle_error())),
				Poll::Pending => Poll::Pending,
			},
		}
	}
}

impl<S: AsyncWrite> AsyncWrite for IdleTimeout<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let me = self.project();
		match me.inner.poll_write(cx, buf) {
			Poll::Ready(Ok(n)) => {
				if n > 0 {
					let deadline = Instant::now() + *me.window;
					me.sleep.as_mut().reset(deadline);
				}
				Poll::Ready(Ok(n))
			},
			Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
			Poll::Pending => match me.sleep.as_mut().poll(cx) {
				Poll::Ready(()) => Poll::Ready(Err(idle_error())),
				Poll::Pending => Poll::Pending,
			},
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}
}
