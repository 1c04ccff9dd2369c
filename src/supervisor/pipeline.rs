//! Per-connection data plane: accept, wrap, route, dial, wrap, relay,
//! account, tear down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fluxgate_core::BoxedStream;
use fluxgate_core::copy::{RelayEnd, relay};
use fluxgate_core::timeout::IdleTimeout;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Supervisor, auth};
use crate::cache::{self, HttpCache, http1};
use crate::mitm::MitmEngine;
use crate::proxy::{
	BLOCK_ADDR, DIRECT_ADDR, Inbound, InboundConn, InboundVerdict, OutboundConn,
};
use crate::store::TrafficRecord;
use crate::utils::now_secs;

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

enum EndReason {
	Finished,
	IdleTimeout,
	InboundClosed,
	OutboundClosed,
	Error(std::io::Error),
}

pub(super) async fn run_listener(
	sup: Arc<Supervisor>,
	inbound: Arc<dyn Inbound>,
	use_cache: bool,
	listener: TcpListener,
	mut stop: mpsc::Receiver<()>,
) {
	let bound = listener
		.local_addr()
		.map(|a| a.to_string())
		.unwrap_or_default();
	info!(inbound = %inbound.name(), addr = %bound, "listening");
	loop {
		tokio::select! {
			_ = stop.recv() => break,
			accepted = listener.accept() => match accepted {
				Ok((sock, peer)) => {
					let sup = sup.clone();
					let inbound = inbound.clone();
					tokio::spawn(async move {
						handle_conn(sup, inbound, use_cache, sock, peer).await;
					});
				},
				Err(e) => {
					warn!(inbound = %inbound.name(), error = %e, "accept failed");
					tokio::time::sleep(Duration::from_millis(10)).await;
				},
			},
		}
	}
	// Free the port before broadcasting so a replacement can bind immediately.
	drop(listener);
	inbound.close_all();
	info!(inbound = %inbound.name(), addr = %bound, "listener stopped");
}

async fn handle_conn(
	sup: Arc<Supervisor>,
	inbound: Arc<dyn Inbound>,
	use_cache: bool,
	sock: TcpStream,
	peer: SocketAddr,
) {
	let _ = sock.set_nodelay(true);
	let tables = sup.tables.clone();
	let auth_fn = move |headers: &HashMap<String, String>| auth::authenticate(&tables, headers);

	let verdict = match inbound.wrap(Box::new(sock), peer, &auth_fn).await {
		Ok(verdict) => verdict,
		Err(e) => {
			debug!(inbound = %inbound.name(), %peer, error = %e, "inbound wrap failed");
			return;
		},
	};
	let InboundConn {
		stream: client_stream,
		target,
		close: mut in_close,
	} = match verdict {
		InboundVerdict::Proxy(conn) => conn,
		InboundVerdict::Handled => return,
	};

	let outbound_id = sup.router.route(&target, inbound.name());
	let Some(outbound) = sup.outbound(&outbound_id) else {
		if outbound_id == BLOCK_ADDR {
			info!(user = %target.user_id, %target, "connection blocked by policy");
		} else {
			warn!(outbound = %outbound_id, "outbound not found");
		}
		in_close.unregister();
		return;
	};
	if outbound.addr() == BLOCK_ADDR {
		info!(user = %target.user_id, %target, "connection blocked by policy");
		in_close.unregister();
		return;
	}

	let dial_addr = if outbound.addr() == DIRECT_ADDR {
		target.to_string()
	} else {
		outbound.addr().to_string()
	};
	let egress = match TcpStream::connect(&dial_addr).await {
		Ok(sock) => sock,
		Err(e) => {
			warn!(%dial_addr, error = %e, "dial failed");
			in_close.unregister();
			return;
		},
	};
	let _ = egress.set_nodelay(true);
	let egress = IdleTimeout::new(egress, IDLE_TIMEOUT);

	let OutboundConn {
		stream: server_stream,
		close: mut out_close,
	} = match outbound.wrap(Box::new(egress), &target).await {
		Ok(conn) => conn,
		Err(e) => {
			warn!(outbound = %outbound.name(), error = %e, "outbound wrap failed");
			in_close.unregister();
			return;
		},
	};
	let (counted, counters) = sup.accountant.wrap(server_stream);

	sup.add_active_link(&target.user_id);
	info!(
		user = %target.user_id,
		inbound = %inbound.name(),
		outbound = %outbound.name(),
		%target,
		"relay start"
	);

	let mitm_cache = if use_cache {
		sup.mitm.clone().zip(sup.cache.clone())
	} else {
		None
	};
	let host = target.host();
	let relay_task = async {
		match mitm_cache {
			Some((mitm, cache)) => {
				relay_cached(&mitm, &cache, client_stream, Box::new(counted), &host).await
			},
			None => relay(client_stream, counted).await,
		}
	};

	// First signal wins; losing the race drops the relay future and with it
	// both streams, which is the forced socket close.
	let end = tokio::select! {
		res = relay_task => match res {
			Ok(RelayEnd::Done) => EndReason::Finished,
			Ok(RelayEnd::IdleTimeout) => EndReason::IdleTimeout,
			Err(e) => EndReason::Error(e),
		},
		_ = in_close.recv() => EndReason::InboundClosed,
		_ = out_close.recv() => EndReason::OutboundClosed,
	};
	match &end {
		EndReason::Finished => debug!(user = %target.user_id, %target, "relay finished"),
		EndReason::IdleTimeout => {
			info!(user = %target.user_id, %target, "server connection idle, closing")
		},
		EndReason::InboundClosed => {
			info!(inbound = %inbound.name(), %target, "closed by inbound broadcast")
		},
		EndReason::OutboundClosed => {
			info!(outbound = %outbound.name(), %target, "closed by outbound broadcast")
		},
		EndReason::Error(e) => warn!(%target, error = %e, "relay error"),
	}

	sup.sub_active_link(&target.user_id);
	in_close.unregister();
	out_close.unregister();

	let record = TrafficRecord {
		inbound_id: inbound.name().to_string(),
		outbound_id: outbound.name().to_string(),
		user_id: target.user_id.clone(),
		dest_addr: target.to_string(),
		bytes_in: counters.down.load(Ordering::Relaxed),
		bytes_out: counters.up.load(Ordering::Relaxed),
		time: now_secs(),
	};
	if let Err(e) = sup.traffic.create(record) {
		warn!(error = %e, "cannot persist traffic record");
	}
	info!(
		user = %target.user_id,
		inbound = %inbound.name(),
		outbound = %outbound.name(),
		%target,
		"relay end"
	);
}

/// The MITM + cache subflow replacing the raw copy: terminate TLS towards
/// the client, re-establish it towards the origin, and run the cache's
/// request loop over the bridged pair.
async fn relay_cached(
	mitm: &MitmEngine,
	cache: &HttpCache,
	client: BoxedStream,
	server: BoxedStream,
	host: &str,
) -> std::io::Result<RelayEnd> {
	let (client, was_tls) = mitm
		.maybe_terminate(client)
		.await
		.map_err(std::io::Error::other)?;
	let server = mitm
		.reconnect_as_client(server, host, was_tls)
		.await
		.map_err(std::io::Error::other)?;
	match cache.run_session(client, server, host).await {
		Ok(()) => Ok(RelayEnd::Done),
		Err(e) if is_timeout(&e) => Ok(RelayEnd::IdleTimeout),
		Err(e) => Err(std::io::Error::other(e)),
	}
}

fn is_timeout(e: &cache::Error) -> bool {
	match e {
		cache::Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
		cache::Error::Http(http1::Error::Io(e)) => e.kind() == std::io::ErrorKind::TimedOut,
		_ => false,
	}
}
