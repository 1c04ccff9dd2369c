//! End-to-end pipeline scenarios: real listeners, real dials, the full
//! accept → wrap → route → dial → relay → account path.

use std::sync::Arc;
use std::time::Duration;

use fluxgate::geo::GeoDb;
use fluxgate::store::{
	Direction, ProxyData, ProxyDataPatch, Repo, RouteScheme, Rule, TrafficStore, User, UserGroup,
};
use fluxgate::{RootConfig, Supervisor};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

fn base_config(dir: &std::path::Path) -> RootConfig {
	RootConfig {
		db: dir.join("system.json"),
		statistic_db: dir.join("traffic.jsonl"),
		web_address: String::new(),
		web_secret: String::new(),
		static_path: dir.join("static"),
		mitm_ca_cert: None,
		mitm_ca_key: None,
		cache_dir: None,
		cache_size: 0,
		cache_default_ttl_secs: 60,
	}
}

/// Fresh store with one authenticated user (`alice` / `TOK1`), one scheme
/// and the given inbound. Routing defaults to `direct` unless `outbounds`
/// names something else.
fn prepare_repo(config: &RootConfig, inbound_config: serde_json::Value, outbounds: &[&str]) -> Repo {
	let (repo, is_new) = Repo::open(&config.db).unwrap();
	assert!(is_new);
	// The seeded example inbound must not bind a fixed port during tests.
	repo
		.update_proxy(
			"default",
			ProxyDataPatch {
				enabled: Some(false),
				config: None,
			},
		)
		.unwrap();
	repo
		.create_proxy(ProxyData {
			id: "http-in".to_string(),
			direction: Direction::In,
			enabled: true,
			config: inbound_config,
		})
		.unwrap();
	repo
		.create_scheme(RouteScheme {
			id: "s1".to_string(),
			description: String::new(),
			enabled: true,
		})
		.unwrap();
	repo
		.add_rule(Rule {
			id: 0,
			name: "any".to_string(),
			kind: "any".to_string(),
			pattern: "*".to_string(),
			outbounds: outbounds.iter().map(|s| s.to_string()).collect(),
			priority: 10,
			scheme_id: "s1".to_string(),
		})
		.unwrap();
	repo
		.create_group(UserGroup {
			id: "g1".to_string(),
			route_scheme_id: "s1".to_string(),
			avail_inbounds: ["http-in".to_string()].into(),
		})
		.unwrap();
	repo
		.create_user(User {
			id: "alice".to_string(),
			password_hash: String::new(),
			link_token: Some("TOK1".to_string()),
			email: "alice@example.com".to_string(),
			enabled: true,
			group_id: "g1".to_string(),
		})
		.unwrap();
	repo
}

async fn start_supervisor(config: &RootConfig, repo: Repo) -> Arc<Supervisor> {
	let traffic = TrafficStore::open(&config.statistic_db).unwrap();
	Supervisor::start_with(config, repo, traffic, Arc::new(GeoDb::empty()))
		.await
		.unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
	for _ in 0..100 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(30)).await;
	}
	panic!("timed out waiting for: {what}");
}

/// An echo server that mirrors whatever it receives.
async fn spawn_echo() -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 4096];
				loop {
					match sock.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							if sock.write_all(&buf[..n]).await.is_err() {
								break;
							}
						},
					}
				}
			});
		}
	});
	addr
}

#[tokio::test]
async fn connect_through_direct_relays_and_accounts() {
	let dir = tempfile::tempdir().unwrap();
	let echo_addr = spawn_echo().await;

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["direct"],
	);
	let sup = start_supervisor(&config, repo).await;
	assert!(!sup.cache_enabled(), "no mitm CA configured");
	let proxy_addr = sup.inbound_addr("http-in").expect("listener should be up");

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let mut reply = vec![0u8; CONNECT_OK.len()];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, CONNECT_OK);

	client.write_all(b"ping-123").await.unwrap();
	let mut echoed = [0u8; 8];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"ping-123");
	drop(client);

	// Exactly one traffic record for the completed connection.
	eventually("traffic record", || sup.traffic().len() == 1).await;
	let ranks = sup.traffic().rank_by_user(0, u64::MAX);
	assert_eq!(ranks.len(), 1);
	assert_eq!(ranks[0].name, "alice");
	assert!(ranks[0].traffic >= 16, "both directions should be counted");
}

#[tokio::test]
async fn guest_probe_is_forwarded_not_routed() {
	let dir = tempfile::tempdir().unwrap();

	let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let decoy_addr = decoy.local_addr().unwrap();
	tokio::spawn(async move {
		let (mut sock, _) = decoy.accept().await.unwrap();
		let mut buf = [0u8; 1024];
		let _ = sock.read(&mut buf).await.unwrap();
		sock
			.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
			.await
			.unwrap();
	});

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({
			"scheme": "http",
			"address": "127.0.0.1:0",
			"guestForward": decoy_addr.to_string(),
		}),
		&["direct"],
	);
	let sup = start_supervisor(&config, repo).await;
	let proxy_addr = sup.inbound_addr("http-in").unwrap();

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: probe.example\r\n\r\n")
		.await
		.unwrap();
	let mut reply = Vec::new();
	client.read_to_end(&mut reply).await.unwrap();
	assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 403"));

	// The decoy handled it; nothing was routed, nothing was accounted.
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(sup.traffic().is_empty());
}

/// A marker server that identifies itself and closes.
async fn spawn_marker(marker: &'static [u8]) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let _ = sock.write_all(marker).await;
			});
		}
	});
	addr
}

#[tokio::test]
async fn geosite_rules_split_traffic_between_outbounds() {
	use fluxgate::geo::proto::{Domain, DomainType, GeoIpList, GeoSite, GeoSiteList};

	let dir = tempfile::tempdir().unwrap();
	let abroad_addr = spawn_marker(b"ABROAD!!").await;
	let fallback_addr = spawn_marker(b"FALLBACK").await;

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["fallback"],
	);
	for (id, addr) in [("us-node", abroad_addr), ("fallback", fallback_addr)] {
		repo
			.create_proxy(ProxyData {
				id: id.to_string(),
				direction: Direction::Out,
				enabled: true,
				config: json!({"scheme": "raw", "address": addr.to_string()}),
			})
			.unwrap();
	}
	repo
		.add_rule(Rule {
			id: 0,
			name: "abroad".to_string(),
			kind: "geosite".to_string(),
			pattern: "geolocation-!cn".to_string(),
			outbounds: vec!["us-node".to_string()],
			priority: 0,
			scheme_id: "s1".to_string(),
		})
		.unwrap();

	let geo = GeoDb::from_lists(
		GeoSiteList {
			entry: vec![GeoSite {
				country_code: "GEOLOCATION-!CN".to_string(),
				domain: vec![Domain {
					kind: DomainType::Root as i32,
					value: "github.com".to_string(),
				}],
			}],
		},
		GeoIpList { entry: vec![] },
	);
	let traffic = TrafficStore::open(&config.statistic_db).unwrap();
	let sup = Supervisor::start_with(&config, repo, traffic, Arc::new(geo))
		.await
		.unwrap();
	let proxy_addr = sup.inbound_addr("http-in").unwrap();

	for (target, marker) in [("github.com:443", b"ABROAD!!"), ("baidu.com:443", b"FALLBACK")] {
		let mut client = TcpStream::connect(proxy_addr).await.unwrap();
		client
			.write_all(format!("CONNECT {target} HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n").as_bytes())
			.await
			.unwrap();
		let mut reply = vec![0u8; CONNECT_OK.len()];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply, CONNECT_OK);
		let mut seen = [0u8; 8];
		client.read_exact(&mut seen).await.unwrap();
		assert_eq!(&seen, marker, "wrong outbound for {target}");
	}
}

#[tokio::test]
async fn removing_outbound_closes_active_connections() {
	let dir = tempfile::tempdir().unwrap();

	// A sink that holds connections open without answering.
	let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let sink_addr = sink.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut sock, _)) = sink.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 1024];
				while matches!(sock.read(&mut buf).await, Ok(n) if n > 0) {}
			});
		}
	});

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["us-node"],
	);
	repo
		.create_proxy(ProxyData {
			id: "us-node".to_string(),
			direction: Direction::Out,
			enabled: true,
			config: json!({"scheme": "raw", "address": sink_addr.to_string()}),
		})
		.unwrap();
	let sup = start_supervisor(&config, repo).await;
	let proxy_addr = sup.inbound_addr("http-in").unwrap();

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(b"CONNECT 203.0.113.1:443 HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n")
		.await
		.unwrap();
	let mut reply = vec![0u8; CONNECT_OK.len()];
	client.read_exact(&mut reply).await.unwrap();
	client.write_all(b"hold").await.unwrap();

	// Hot removal broadcasts a close to the in-flight connection.
	sup.remove_outbound("us-node");
	let mut buf = [0u8; 16];
	let read = tokio::time::timeout(Duration::from_secs(3), client.read(&mut buf))
		.await
		.expect("connection should be closed by the broadcast");
	assert!(matches!(read, Ok(0) | Err(_)));

	// Routing still names us-node; without an instance the next session is
	// dropped after the inbound handshake.
	let mut second = TcpStream::connect(proxy_addr).await.unwrap();
	second
		.write_all(b"CONNECT 203.0.113.1:443 HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n")
		.await
		.unwrap();
	let mut rest = Vec::new();
	let _ = tokio::time::timeout(Duration::from_secs(3), second.read_to_end(&mut rest))
		.await
		.expect("dropped session should reach EOF");

	// The interrupted connection still produced its traffic record.
	eventually("traffic record", || sup.traffic().len() == 1).await;
}

#[tokio::test]
async fn removing_inbound_stops_listener_and_drains() {
	let dir = tempfile::tempdir().unwrap();
	let echo_addr = spawn_echo().await;

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["direct"],
	);
	let sup = start_supervisor(&config, repo).await;
	let proxy_addr = sup.inbound_addr("http-in").unwrap();

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let mut reply = vec![0u8; CONNECT_OK.len()];
	client.read_exact(&mut reply).await.unwrap();
	client.write_all(b"x").await.unwrap();
	let mut one = [0u8; 1];
	client.read_exact(&mut one).await.unwrap();

	sup.remove_inbound("http-in").await;
	assert!(!sup.inbound_running("http-in"));

	// The in-flight connection is closed within one broadcast cycle.
	let read = tokio::time::timeout(Duration::from_secs(3), client.read(&mut one))
		.await
		.expect("connection should be closed by the broadcast");
	assert!(matches!(read, Ok(0) | Err(_)));

	// And the port no longer accepts new connections.
	assert!(TcpStream::connect(proxy_addr).await.is_err());
}

#[tokio::test]
async fn admin_surface_links_probes_and_gauges() {
	let dir = tempfile::tempdir().unwrap();
	let echo_addr = spawn_echo().await;

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["direct"],
	);
	repo
		.create_proxy(ProxyData {
			id: "us-node".to_string(),
			direction: Direction::Out,
			enabled: true,
			config: json!({"scheme": "raw", "address": echo_addr.to_string()}),
		})
		.unwrap();
	let sup = start_supervisor(&config, repo).await;

	// Latency probe: a raw outbound handshakes trivially after the dial.
	sup.measure_latency("us-node").await.unwrap();
	assert!(sup.measure_latency("direct").await.is_err());
	assert!(sup.measure_latency("nope").await.is_err());

	// Client-facing link config carries the user's token.
	let link = sup.link_config("http-in", "alice").unwrap();
	assert_eq!(link["linkToken"], "TOK1");
	assert_eq!(link["scheme"], "http");

	// Token rotation: the new token authenticates, the old one does not.
	let token = sup.update_user_token("alice").unwrap();
	assert_eq!(token.len(), 16);
	assert!(sup.tables().user_by_token(&token).is_some());
	assert!(sup.tables().user_by_token("TOK1").is_none());

	// Active link gauge follows the connection lifecycle.
	let proxy_addr = sup.inbound_addr("http-in").unwrap();
	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nlinkToken: {token}\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let mut reply = vec![0u8; CONNECT_OK.len()];
	client.read_exact(&mut reply).await.unwrap();
	client.write_all(b"x").await.unwrap();
	let mut one = [0u8; 1];
	client.read_exact(&mut one).await.unwrap();
	eventually("active link up", || {
		sup.active_links().get("alice").copied() == Some(1)
	})
	.await;
	drop(client);
	eventually("active link down", || sup.active_links().is_empty()).await;
}

#[tokio::test]
async fn sync_inbound_rebinds_listener() {
	let dir = tempfile::tempdir().unwrap();
	let echo_addr = spawn_echo().await;

	let config = base_config(dir.path());
	let repo = prepare_repo(
		&config,
		json!({"scheme": "http", "address": "127.0.0.1:0"}),
		&["direct"],
	);
	let sup = start_supervisor(&config, repo).await;
	let first_addr = sup.inbound_addr("http-in").unwrap();

	let desc = sup.repo().proxy_by_id("http-in").unwrap();
	sup.sync_inbound(&desc).await;
	let second_addr = sup.inbound_addr("http-in").unwrap();
	assert_ne!(first_addr, second_addr, "port 0 should bind afresh");
	assert!(TcpStream::connect(first_addr).await.is_err());

	let mut client = TcpStream::connect(second_addr).await.unwrap();
	client
		.write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let mut reply = vec![0u8; CONNECT_OK.len()];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, CONNECT_OK);
}
