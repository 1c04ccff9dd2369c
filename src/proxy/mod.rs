//! Protocol wrapper model. An inbound adapts an accepted connection to its
//! protocol (framing, handshake, authentication) and yields the cleartext
//! stream plus the connection target; an outbound does the mirror image on
//! the egress side. Wrappers stack: the outer layer finishes its own
//! handshake and hands the transformed stream to its `upper`.

mod addr;
pub mod block;
pub mod direct;
pub mod http;
pub mod raw;
pub mod rev_http;
pub mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub use addr::{AddrError, TargetAddr, split_host_port};

/// Outbound sentinel: dial the connection target itself.
pub const DIRECT_ADDR: &str = "direct";
/// Outbound sentinel: never dialed, the connection is dropped.
pub const BLOCK_ADDR: &str = "block";

/// Principal assigned to unauthenticated sessions.
pub const GUEST_USER: &str = "guest";
/// Principal assigned to reverse-proxied sessions.
pub const FORWARD_USER: &str = "forward";

/// Header-map authentication callback. Returns the authenticated user id, or
/// `"guest"` when the credentials match nothing.
pub type AuthFn = dyn Fn(&HashMap<String, String>) -> String + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed {0} handshake")]
	Malformed(&'static str),
	#[error("bad address: {0}")]
	Addr(#[from] AddrError),
	#[error("upstream proxy refused CONNECT")]
	ConnectRefused,
	#[error("pre-shared key mismatch")]
	PskMismatch,
	#[error("no target configured for {0}")]
	NoTarget(String),
	#[error("block outbound never relays")]
	Blocked,
	#[error("guest forward dial {0}: {1}")]
	ForwardDial(String, std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
	#[error("config has no scheme")]
	MissingScheme,
	#[error("unknown scheme {0}")]
	UnknownScheme(String),
	#[error("invalid {0} config: {1}")]
	InvalidConfig(&'static str, serde_json::Error),
	#[error("{0} requires an address")]
	MissingAddress(&'static str),
	#[error("upper config is not an object")]
	BadUpper,
	#[error("cannot load key material: {0}")]
	KeyMaterial(String),
}

/// The set of live close-signal channels owned by a wrapper instance.
///
/// `close_all` is a best-effort broadcast: a channel that cannot immediately
/// accept a value has already been notified and is skipped. Registration
/// hands out a [`CloseReceiver`] that unregisters itself explicitly in the
/// connection epilogue.
#[derive(Default)]
pub struct CloseSet {
	chans: Mutex<HashMap<u64, mpsc::Sender<()>>>,
	next: AtomicU64,
}

impl CloseSet {
	pub fn new() -> Arc<Self> {
		Arc::new(CloseSet::default())
	}

	pub fn register(self: Arc<Self>) -> CloseReceiver {
		let (tx, rx) = mpsc::channel(1);
		let id = self.next.fetch_add(1, Ordering::Relaxed);
		self.chans.lock().insert(id, tx);
		CloseReceiver { id, rx, set: self }
	}

	pub fn close_all(&self) {
		for tx in self.chans.lock().values() {
			let _ = tx.try_send(());
		}
	}

	pub fn len(&self) -> usize {
		self.chans.lock().len()
	}

	fn unregister(&self, id: u64) {
		self.chans.lock().remove(&id);
	}
}

/// One connection's close signal, registered in its wrapper's [`CloseSet`].
pub struct CloseReceiver {
	id: u64,
	rx: mpsc::Receiver<()>,
	set: Arc<CloseSet>,
}

impl CloseReceiver {
	/// Resolves when the owning wrapper broadcasts a close. Never resolves
	/// after this receiver has been unregistered.
	pub async fn recv(&mut self) {
		if self.rx.recv().await.is_none() {
			std::future::pending::<()>().await
		}
	}

	pub fn unregister(self) {
		self.set.unregister(self.id);
	}
}

/// What an inbound wrap produced.
pub enum InboundVerdict {
	/// A proxy session: route it and relay.
	Proxy(InboundConn),
	/// The wrapper fully served the connection itself (e.g. the anti-probe
	/// guest forward); nothing left to route.
	Handled,
}

pub struct InboundConn {
	pub stream: BoxedStream,
	pub target: TargetAddr,
	pub close: CloseReceiver,
}

pub struct OutboundConn {
	pub stream: BoxedStream,
	pub close: CloseReceiver,
}

impl std::fmt::Debug for OutboundConn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OutboundConn").finish_non_exhaustive()
	}
}

#[async_trait]
pub trait Inbound: Send + Sync {
	fn scheme(&self) -> String;
	fn name(&self) -> &str;
	/// The listen address of the stack this instance belongs to.
	fn addr(&self) -> &str;
	fn raw_config(&self) -> &Value;

	/// Performs this layer's handshake over `stream` and delegates to the
	/// upper layer, if any.
	async fn wrap(
		&self,
		stream: BoxedStream,
		peer: SocketAddr,
		auth: &AuthFn,
	) -> Result<InboundVerdict, WrapError>;

	/// Broadcasts a close to every connection registered with this stack.
	fn close_all(&self);

	/// Client-facing connection config for this inbound (scheme, reachable
	/// address, token), with wildcard listeners rewritten to `default_host`.
	fn link_config(&self, default_host: &str, token: &str) -> Value {
		let mut config = self.raw_config().clone();
		if let Value::Object(map) = &mut config {
			map.insert(
				"address".to_string(),
				json!(link_addr(self.addr(), self.raw_config(), default_host)),
			);
			map.insert("linkToken".to_string(), json!(token));
		}
		config
	}
}

#[async_trait]
pub trait Outbound: Send + Sync {
	fn scheme(&self) -> String;
	fn name(&self) -> &str;
	/// The next-hop address, or a sentinel (`"direct"`, `"block"`).
	fn addr(&self) -> &str;

	async fn wrap(
		&self,
		stream: BoxedStream,
		target: &TargetAddr,
	) -> Result<OutboundConn, WrapError>;

	fn close_all(&self);
}

pub type InboundFactory =
	fn(&str, &Value, Option<String>, &InboundRegistry) -> Result<Arc<dyn Inbound>, BuildError>;
pub type OutboundFactory =
	fn(&str, &Value, Option<String>, &OutboundRegistry) -> Result<Arc<dyn Outbound>, BuildError>;

/// Scheme name to factory. Registration is an explicit init step; nothing is
/// registered by side effect.
pub struct InboundRegistry {
	factories: HashMap<&'static str, InboundFactory>,
}

impl InboundRegistry {
	pub fn standard() -> Self {
		let mut registry = InboundRegistry {
			factories: HashMap::new(),
		};
		registry.register("raw", raw::build_inbound);
		registry.register("http", http::build_inbound);
		registry.register("https", http::build_inbound);
		registry.register("tls", tls::build_inbound);
		registry.register("rev_http", rev_http::build_inbound);
		registry
	}

	pub fn register(&mut self, scheme: &'static str, factory: InboundFactory) {
		self.factories.insert(scheme, factory);
	}

	pub fn build(&self, name: &str, config: &Value) -> Result<Arc<dyn Inbound>, BuildError> {
		self.build_with(name, config, None)
	}

	/// Builds an instance, inheriting the enclosing layer's address when the
	/// config does not carry its own.
	pub(crate) fn build_with(
		&self,
		name: &str,
		config: &Value,
		inherited_addr: Option<String>,
	) -> Result<Arc<dyn Inbound>, BuildError> {
		let scheme = config
			.get("scheme")
			.and_then(Value::as_str)
			.ok_or(BuildError::MissingScheme)?;
		let factory = self
			.factories
			.get(scheme)
			.ok_or_else(|| BuildError::UnknownScheme(scheme.to_string()))?;
		factory(name, config, inherited_addr, self)
	}
}

pub struct OutboundRegistry {
	factories: HashMap<&'static str, OutboundFactory>,
}

impl OutboundRegistry {
	pub fn standard() -> Self {
		let mut registry = OutboundRegistry {
			factories: HashMap::new(),
		};
		registry.register("raw", raw::build_outbound);
		registry.register("http", http::build_outbound);
		registry.register("https", http::build_outbound);
		registry.register("tls", tls::build_outbound);
		registry.register("direct", direct::build_outbound);
		registry.register("block", block::build_outbound);
		registry
	}

	pub fn register(&mut self, scheme: &'static str, factory: OutboundFactory) {
		self.factories.insert(scheme, factory);
	}

	pub fn build(&self, name: &str, config: &Value) -> Result<Arc<dyn Outbound>, BuildError> {
		self.build_with(name, config, None)
	}

	pub(crate) fn build_with(
		&self,
		name: &str,
		config: &Value,
		inherited_addr: Option<String>,
	) -> Result<Arc<dyn Outbound>, BuildError> {
		let scheme = config
			.get("scheme")
			.and_then(Value::as_str)
			.ok_or(BuildError::MissingScheme)?;
		let factory = self
			.factories
			.get(scheme)
			.ok_or_else(|| BuildError::UnknownScheme(scheme.to_string()))?;
		factory(name, config, inherited_addr, self)
	}
}

/// Extracts the `upper` sub-config, if present.
fn upper_config(config: &Value) -> Result<Option<&Value>, BuildError> {
	match config.get("upper") {
		None => Ok(None),
		Some(v) if v.is_object() => Ok(Some(v)),
		Some(_) => Err(BuildError::BadUpper),
	}
}

/// The address a client should dial to reach `addr`: an `sni` config entry
/// wins, wildcard hosts are replaced by the host of `default_host`.
pub fn link_addr(addr: &str, config: &Value, default_host: &str) -> String {
	let Ok((host, port)) = split_host_port(addr) else {
		return String::new();
	};
	if let Some(sni) = config.get("sni").and_then(Value::as_str) {
		return format!("{sni}:{port}");
	}
	if host.contains("0.0.0.0") || host.is_empty() {
		if let Ok((default, _)) = split_host_port(default_host) {
			return format!("{default}:{port}");
		}
		return String::new();
	}
	addr.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn close_all_is_concurrent_safe_with_unregister() {
		let set = CloseSet::new();
		let receivers: Vec<CloseReceiver> = (0..32).map(|_| set.clone().register()).collect();
		assert_eq!(set.len(), 32);

		let closer = {
			let set = Arc::clone(&set);
			tokio::spawn(async move {
				for _ in 0..100 {
					set.close_all();
					tokio::task::yield_now().await;
				}
			})
		};
		let unregger = tokio::spawn(async move {
			for rx in receivers {
				rx.unregister();
				tokio::task::yield_now().await;
			}
		});
		closer.await.unwrap();
		unregger.await.unwrap();
		assert_eq!(set.len(), 0);
	}

	#[tokio::test]
	async fn close_broadcast_is_delivered_once() {
		let set = CloseSet::new();
		let mut rx = set.clone().register();
		// Duplicate broadcasts collapse into the single-slot channel.
		set.close_all();
		set.close_all();
		rx.recv().await;
		let flagged = tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await;
		assert!(flagged.is_err(), "second recv should stay pending");
	}

	#[test]
	fn link_addr_rewrites_wildcards() {
		let cfg = json!({});
		assert_eq!(
			link_addr("0.0.0.0:8083", &cfg, "proxy.example.com:8000"),
			"proxy.example.com:8083"
		);
		assert_eq!(link_addr("10.0.0.1:8083", &cfg, "proxy.example.com:8000"), "10.0.0.1:8083");
		let with_sni = json!({"sni": "edge.example.com"});
		assert_eq!(
			link_addr("0.0.0.0:443", &with_sni, "proxy.example.com:8000"),
			"edge.example.com:443"
		);
	}
}
