//! Real-time traffic accounting. Connections wrap their egress stream in a
//! [`CountingStream`]; per-connection totals land in atomics, and deltas are
//! pushed onto a bounded channel drained by a single accumulator task that a
//! 1 Hz ticker snapshots into the published per-second rates. The channel
//! overflowing just drops deltas: real-time numbers are approximate by
//! design, the per-connection totals are not.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use fluxgate_core::Stream;

#[derive(Debug, Clone, Copy)]
enum Delta {
	Download(u64),
	Upload(u64),
}

/// Byte totals for one connection: `down` is read from the origin, `up` is
/// written towards it.
#[derive(Debug, Default)]
pub struct ConnCounters {
	pub down: AtomicU64,
	pub up: AtomicU64,
}

pub struct CountingStream<S> {
	inner: S,
	counters: Arc<ConnCounters>,
	deltas: mpsc::Sender<Delta>,
}

impl<S: Stream> AsyncRead for CountingStream<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let me = self.get_mut();
		let before = buf.filled().len();
		match Pin::new(&mut me.inner).poll_read(cx, buf) {
			Poll::Ready(Ok(())) => {
				let n = (buf.filled().len() - before) as u64;
				if n > 0 {
					me.counters.down.fetch_add(n, Ordering::Relaxed);
					let _ = me.deltas.try_send(Delta::Download(n));
				}
				Poll::Ready(Ok(()))
			},
			other => other,
		}
	}
}

impl<S: Stream> AsyncWrite for CountingStream<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let me = self.get_mut();
		match Pin::new(&mut me.inner).poll_write(cx, buf) {
			Poll::Ready(Ok(n)) => {
				if n > 0 {
					me.counters.up.fetch_add(n as u64, Ordering::Relaxed);
					let _ = me.deltas.try_send(Delta::Upload(n as u64));
				}
				Poll::Ready(Ok(n))
			},
			other => other,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// Published once a second by the accumulator.
#[derive(Debug, Default)]
pub struct RealTimeStats {
	sum_download: AtomicU64,
	sum_upload: AtomicU64,
}

impl RealTimeStats {
	/// Last full second's `(download, upload)` byte counts.
	pub fn rates(&self) -> (u64, u64) {
		(
			self.sum_download.load(Ordering::Relaxed),
			self.sum_upload.load(Ordering::Relaxed),
		)
	}
}

#[derive(Clone)]
pub struct Accountant {
	deltas: mpsc::Sender<Delta>,
	realtime: Arc<RealTimeStats>,
}

impl Accountant {
	/// Spawns the accumulator task and returns its handle.
	pub fn spawn() -> Accountant {
		let (tx, mut rx) = mpsc::channel::<Delta>(1024);
		let realtime = Arc::new(RealTimeStats::default());
		let published = realtime.clone();
		tokio::spawn(async move {
			let mut adding_download = 0u64;
			let mut adding_upload = 0u64;
			let mut ticker = tokio::time::interval(Duration::from_secs(1));
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					delta = rx.recv() => match delta {
						Some(Delta::Download(n)) => adding_download += n,
						Some(Delta::Upload(n)) => adding_upload += n,
						None => break,
					},
					_ = ticker.tick() => {
						published.sum_download.store(adding_download, Ordering::Relaxed);
						published.sum_upload.store(adding_upload, Ordering::Relaxed);
						adding_download = 0;
						adding_upload = 0;
					},
				}
			}
		});
		Accountant { deltas: tx, realtime }
	}

	pub fn realtime(&self) -> Arc<RealTimeStats> {
		self.realtime.clone()
	}

	pub fn wrap<S: Stream>(&self, inner: S) -> (CountingStream<S>, Arc<ConnCounters>) {
		let counters = Arc::new(ConnCounters::default());
		(
			CountingStream {
				inner,
				counters: counters.clone(),
				deltas: self.deltas.clone(),
			},
			counters,
		)
	}
}
