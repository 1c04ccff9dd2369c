//! Control plane: owns the runtime instances built from stored descriptors,
//! swaps them atomically on sync calls while active connections drain, and
//! runs the background accounting tasks.

pub mod auth;
mod pipeline;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::HttpCache;
use crate::config::RootConfig;
use crate::geo::GeoDb;
use crate::mitm::MitmEngine;
use crate::proxy::{
	BLOCK_ADDR, DIRECT_ADDR, Inbound, InboundRegistry, Outbound, OutboundRegistry, TargetAddr,
};
use crate::router::{PolicyTables, Router};
use crate::stats::{Accountant, RealTimeStats};
use crate::store::{Direction, ProxyData, Repo, TrafficStore, UserPatch};
use crate::utils::{now_secs, random_token};

struct ListenerHandle {
	addr: SocketAddr,
	stop: mpsc::Sender<()>,
	done: JoinHandle<()>,
}

struct InboundEntry {
	inbound: Arc<dyn Inbound>,
	listener: Option<ListenerHandle>,
}

pub struct Supervisor {
	self_ref: Weak<Supervisor>,
	repo: Arc<Repo>,
	traffic: Arc<TrafficStore>,
	inbound_registry: InboundRegistry,
	outbound_registry: OutboundRegistry,
	inbounds: RwLock<HashMap<String, InboundEntry>>,
	outbounds: RwLock<HashMap<String, Arc<dyn Outbound>>>,
	tables: Arc<PolicyTables>,
	router: Router,
	mitm: Option<Arc<MitmEngine>>,
	cache: Option<Arc<HttpCache>>,
	accountant: Accountant,
	active_links: Mutex<HashMap<String, u32>>,
	web_address: String,
}

/// `host:port` with an empty or wildcard host normalized to something the
/// listener can bind.
fn normalize_listen_addr(addr: &str) -> String {
	match addr.strip_prefix(':') {
		Some(port) => format!("0.0.0.0:{port}"),
		None => addr.to_string(),
	}
}

impl Supervisor {
	/// Full startup: stores, geo databases (fatal when missing), MITM and
	/// cache (degrade to disabled), then every stored descriptor.
	pub async fn start(config: &RootConfig) -> anyhow::Result<Arc<Supervisor>> {
		let (repo, is_new) = Repo::open(&config.db)?;
		if is_new {
			info!("seeded system store with default data");
		}
		let traffic = TrafficStore::open(&config.statistic_db)?;
		let geo = Arc::new(
			GeoDb::load(&config.static_path).context("geo databases are required at startup")?,
		);
		Self::start_with(config, repo, traffic, geo).await
	}

	/// Startup with pre-opened collaborators; what tests and embedders use.
	pub async fn start_with(
		config: &RootConfig,
		repo: Repo,
		traffic: TrafficStore,
		geo: Arc<GeoDb>,
	) -> anyhow::Result<Arc<Supervisor>> {
		let mitm = match (&config.mitm_ca_cert, &config.mitm_ca_key) {
			(Some(cert), Some(key)) => match MitmEngine::load(cert, key) {
				Ok(engine) => Some(Arc::new(engine)),
				Err(e) => {
					warn!(error = %e, "mitm CA unusable, tls interception disabled");
					None
				},
			},
			_ => None,
		};
		let cache = match (&mitm, &config.cache_dir) {
			(Some(_), Some(dir)) if config.cache_size > 0 => {
				match HttpCache::open(
					dir,
					config.cache_size,
					Duration::from_secs(config.cache_default_ttl_secs),
				) {
					Ok(cache) => Some(Arc::new(cache)),
					Err(e) => {
						warn!(error = %e, "cannot open http cache");
						None
					},
				}
			},
			_ => None,
		};
		if cache.is_some() {
			info!("http proxy cache enabled");
		} else {
			info!("http proxy cache disabled (needs mitm CA, cache_dir and cache_size)");
		}

		let tables = PolicyTables::new();
		let sup = Arc::new_cyclic(|self_ref| Supervisor {
			self_ref: self_ref.clone(),
			repo: Arc::new(repo),
			traffic: Arc::new(traffic),
			inbound_registry: InboundRegistry::standard(),
			outbound_registry: OutboundRegistry::standard(),
			inbounds: RwLock::new(HashMap::new()),
			outbounds: RwLock::new(HashMap::new()),
			tables: tables.clone(),
			router: Router::new(geo, tables),
			mitm,
			cache,
			accountant: Accountant::spawn(),
			active_links: Mutex::new(HashMap::new()),
			web_address: config.web_address.clone(),
		});

		sup.sync_all().await;
		sup.clone().spawn_traffic_cleaner();
		Ok(sup)
	}

	/// Loads every stored entity into the runtime tables and instances.
	pub async fn sync_all(&self) {
		for user in self.repo.user_list() {
			self.tables.sync_user(user);
		}
		for group in self.repo.group_list() {
			self.tables.sync_group(group);
		}
		for scheme in self.repo.scheme_list() {
			if let Some(detail) = self.repo.scheme_by_id(&scheme.id) {
				self.tables.sync_scheme(detail);
			}
		}
		for desc in self.repo.proxy_list(Direction::Out) {
			self.sync_outbound(&desc);
		}
		for desc in self.repo.proxy_list(Direction::In) {
			self.sync_inbound(&desc).await;
		}
	}

	pub fn repo(&self) -> &Repo {
		&self.repo
	}

	pub fn traffic(&self) -> &TrafficStore {
		&self.traffic
	}

	pub fn tables(&self) -> &Arc<PolicyTables> {
		&self.tables
	}

	pub fn realtime(&self) -> Arc<RealTimeStats> {
		self.accountant.realtime()
	}

	pub fn cache_enabled(&self) -> bool {
		self.cache.is_some()
	}

	// Inbounds

	/// Rebuilds an inbound from its descriptor: the old listener is closed
	/// and its connections broadcast-closed before the new stack binds.
	pub async fn sync_inbound(&self, desc: &ProxyData) {
		self.stop_inbound(&desc.id).await;

		let inbound = match self.inbound_registry.build(&desc.id, &desc.config) {
			Ok(inbound) => inbound,
			Err(e) => {
				warn!(inbound = %desc.id, error = %e, "failed to build inbound");
				return;
			},
		};
		let use_cache = desc
			.config
			.get("use_http_cache")
			.and_then(Value::as_bool)
			.unwrap_or(false);

		let listener = if desc.enabled {
			match self.spawn_listener(inbound.clone(), use_cache).await {
				Ok(handle) => Some(handle),
				Err(e) => {
					warn!(inbound = %desc.id, error = %e, "cannot bind listener");
					None
				},
			}
		} else {
			None
		};

		self.inbounds.write().insert(
			desc.id.clone(),
			InboundEntry { inbound, listener },
		);
	}

	pub async fn remove_inbound(&self, id: &str) {
		self.stop_inbound(id).await;
	}

	async fn stop_inbound(&self, id: &str) {
		let entry = self.inbounds.write().remove(id);
		if let Some(entry) = entry {
			match entry.listener {
				Some(handle) => {
					let _ = handle.stop.send(()).await;
					// The accept task closes the socket and broadcasts the
					// close before it exits.
					let _ = handle.done.await;
				},
				None => entry.inbound.close_all(),
			}
		}
	}

	async fn spawn_listener(
		&self,
		inbound: Arc<dyn Inbound>,
		use_cache: bool,
	) -> std::io::Result<ListenerHandle> {
		let sup = self
			.self_ref
			.upgrade()
			.ok_or_else(|| std::io::Error::other("supervisor is shutting down"))?;
		let listener = TcpListener::bind(normalize_listen_addr(inbound.addr())).await?;
		let addr = listener.local_addr()?;
		let (stop_tx, stop_rx) = mpsc::channel(1);
		let done = tokio::spawn(pipeline::run_listener(
			sup,
			inbound,
			use_cache,
			listener,
			stop_rx,
		));
		Ok(ListenerHandle {
			addr,
			stop: stop_tx,
			done,
		})
	}

	pub fn inbound_running(&self, id: &str) -> bool {
		self
			.inbounds
			.read()
			.get(id)
			.map(|e| e.listener.is_some())
			.unwrap_or(false)
	}

	/// The actual bound address of a running inbound (useful with `:0`).
	pub fn inbound_addr(&self, id: &str) -> Option<SocketAddr> {
		self
			.inbounds
			.read()
			.get(id)
			.and_then(|e| e.listener.as_ref())
			.map(|h| h.addr)
	}

	/// Client-facing connection config for one inbound, carrying the user's
	/// link token.
	pub fn link_config(&self, inbound_id: &str, user_id: &str) -> Option<Value> {
		let inbound = self.inbounds.read().get(inbound_id)?.inbound.clone();
		let token = self.tables.user(user_id)?.link_token.unwrap_or_default();
		Some(inbound.link_config(&self.web_address, &token))
	}

	// Outbounds

	/// Rebuilds an outbound stack, closing every egress connection of the
	/// old one.
	pub fn sync_outbound(&self, desc: &ProxyData) {
		if let Some(old) = self.outbounds.write().remove(&desc.id) {
			old.close_all();
		}
		match self.outbound_registry.build(&desc.id, &desc.config) {
			Ok(outbound) => {
				self.outbounds.write().insert(desc.id.clone(), outbound);
			},
			Err(e) => warn!(outbound = %desc.id, error = %e, "failed to build outbound"),
		}
	}

	pub fn remove_outbound(&self, id: &str) {
		if let Some(old) = self.outbounds.write().remove(id) {
			old.close_all();
		}
	}

	pub fn outbound(&self, id: &str) -> Option<Arc<dyn Outbound>> {
		self.outbounds.read().get(id).cloned()
	}

	/// Dial-and-handshake probe against an outbound's next hop.
	pub async fn measure_latency(&self, id: &str) -> anyhow::Result<u128> {
		let outbound = self
			.outbound(id)
			.ok_or_else(|| anyhow::anyhow!("outbound {id} not found"))?;
		if outbound.addr() == DIRECT_ADDR || outbound.addr() == BLOCK_ADDR {
			anyhow::bail!("outbound {id} has no next hop to probe");
		}
		let started = Instant::now();
		let sock = tokio::time::timeout(
			Duration::from_secs(5),
			TcpStream::connect(outbound.addr()),
		)
		.await
		.context("probe timed out")??;
		let elapsed = started.elapsed().as_millis();

		let target = TargetAddr::parse("example.com:80")?;
		let conn = outbound
			.wrap(Box::new(sock), &target)
			.await
			.context("probe handshake failed")?;
		conn.close.unregister();
		Ok(elapsed)
	}

	// Policy snapshots

	pub fn sync_scheme(&self, id: &str) {
		match self.repo.scheme_by_id(id) {
			Some(detail) => self.tables.sync_scheme(detail),
			None => self.tables.remove_scheme(id),
		}
	}

	/// Regenerates a user's link token, unique across users.
	pub fn update_user_token(&self, id: &str) -> Result<String, crate::store::Error> {
		let token = loop {
			let candidate = random_token(16);
			if self.tables.user_by_token(&candidate).is_none() {
				break candidate;
			}
		};
		let user = self.repo.update_user(
			id,
			UserPatch {
				link_token: Some(Some(token.clone())),
				..UserPatch::default()
			},
		)?;
		self.tables.sync_user(user);
		Ok(token)
	}

	// Accounting

	fn add_active_link(&self, user_id: &str) {
		*self.active_links.lock().entry(user_id.to_string()).or_insert(0) += 1;
	}

	fn sub_active_link(&self, user_id: &str) {
		let mut links = self.active_links.lock();
		if let Some(count) = links.get_mut(user_id) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				links.remove(user_id);
			}
		}
	}

	/// In-flight connection counts per user.
	pub fn active_links(&self) -> HashMap<String, u32> {
		self.active_links.lock().clone()
	}

	fn spawn_traffic_cleaner(self: Arc<Self>) {
		tokio::spawn(async move {
			loop {
				let days = self.repo.system_info().traffic_record_days as u64;
				let before = now_secs().saturating_sub(days * 24 * 3600);
				match self.traffic.clean_before(before) {
					Ok(removed) if removed > 0 => {
						info!(removed, days, "cleaned old traffic records");
					},
					Ok(_) => {},
					Err(e) => warn!(error = %e, "traffic cleaning failed"),
				}
				tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
			}
		});
	}
}
