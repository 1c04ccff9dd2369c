use std::io;

use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::Stream;

/// Why a relay stopped. Idle timeouts are surfaced distinctly so the
/// connection epilogue can report them as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
	/// One direction reached EOF (or a benign disconnect) and the relay is done.
	Done,
	/// The server-side idle watchdog fired.
	IdleTimeout,
}

/// Runs both relay directions between `a` and `b`, completing as soon as
/// either direction finishes. The losing direction is dropped with the
/// streams; the caller owns socket teardown.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<RelayEnd>
where
	A: Stream,
	B: Stream,
{
	let (mut ar, mut aw) = tokio::io::split(a);
	let (mut br, mut bw) = tokio::io::split(b);

	let a_to_b = async {
		let res = ignore_io_errors(tokio::io::copy(&mut ar, &mut bw).await);
		trace!(?res, "a->b done");
		ignore_shutdown_errors(bw.shutdown().await)?;
		res
	};
	let b_to_a = async {
		let res = ignore_io_errors(tokio::io::copy(&mut br, &mut aw).await);
		trace!(?res, "b->a done");
		ignore_shutdown_errors(aw.shutdown().await)?;
		res
	};

	let res = tokio::select! {
		r = a_to_b => r,
		r = b_to_a => r,
	};
	match res {
		Ok(_) => Ok(RelayEnd::Done),
		Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(RelayEnd::IdleTimeout),
		Err(e) => Err(e),
	}
}

// A TCP connection can close at any time, gracefully or not. Peers resetting
// or half-closing mid-copy is normal proxy traffic, not an error worth
// reporting to the operator.
pub fn ignore_io_errors<T: Default>(res: io::Result<T>) -> io::Result<T> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(Default::default())
			},
			_ => res,
		},
		_ => res,
	}
}

// The other end may already be gone by the time we shut our half down.
pub fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "peer already shut down");
			Ok(())
		},
		_ => res,
	}
}
