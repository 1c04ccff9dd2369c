//! TLS termination (inbound) and TLS client (outbound) layers, with the
//! optional post-handshake pre-shared-key liveness exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use rand::Rng;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{
	AuthFn, BuildError, CloseSet, DIRECT_ADDR, Inbound, InboundConn, InboundRegistry,
	InboundVerdict, Outbound, OutboundConn, OutboundRegistry, TargetAddr, WrapError, link_addr,
	split_host_port, upper_config,
};

const PSK_LINE_LIMIT: usize = 4096;

/// Padding lines are `"233"` repeated out to a random total length; the
/// content is ignored by the reader.
fn padding(range: std::ops::RangeInclusive<usize>) -> String {
	let len = rand::rng().random_range(range);
	let mut pad = "233".repeat(len / 3 + 1);
	pad.truncate(len);
	pad
}

async fn read_line(stream: &mut (impl AsyncRead + Unpin)) -> Result<String, WrapError> {
	let mut line = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		if stream.read(&mut byte).await? == 0 {
			return Err(WrapError::Malformed("psk"));
		}
		if byte[0] == b'\n' {
			break;
		}
		line.push(byte[0]);
		if line.len() > PSK_LINE_LIMIT {
			return Err(WrapError::Malformed("psk"));
		}
	}
	Ok(String::from_utf8_lossy(&line).into_owned())
}

#[derive(Deserialize)]
struct TlsInboundConfig {
	address: Option<String>,
	cert: String,
	key: String,
	#[serde(rename = "verifyByPsk")]
	verify_by_psk: Option<String>,
	target: Option<String>,
}

pub struct TlsInbound {
	name: String,
	addr: String,
	server_config: Arc<rustls::ServerConfig>,
	verify_by_psk: Option<String>,
	target: Option<String>,
	upper: Option<Arc<dyn Inbound>>,
	raw: Value,
	closes: Arc<CloseSet>,
}

pub fn build_inbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	registry: &InboundRegistry,
) -> Result<Arc<dyn Inbound>, BuildError> {
	let cfg: TlsInboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("tls inbound", e))?;

	let cert_pem = std::fs::read(&cfg.cert)
		.map_err(|e| BuildError::KeyMaterial(format!("read {}: {e}", cfg.cert)))?;
	let key_pem = std::fs::read(&cfg.key)
		.map_err(|e| BuildError::KeyMaterial(format!("read {}: {e}", cfg.key)))?;
	let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| BuildError::KeyMaterial(format!("parse {}: {e}", cfg.cert)))?;
	let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
		.map_err(|e| BuildError::KeyMaterial(format!("parse {}: {e}", cfg.key)))?
		.ok_or_else(|| BuildError::KeyMaterial(format!("no private key in {}", cfg.key)))?;
	let server_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|e| BuildError::KeyMaterial(e.to_string()))?;

	let own_addr = cfg.address.or(inherited_addr);
	let upper = match upper_config(config)? {
		Some(u) => Some(registry.build_with(name, u, own_addr.clone())?),
		None => None,
	};
	let addr = match own_addr {
		Some(addr) => addr,
		None => upper
			.as_ref()
			.map(|u| u.addr().to_string())
			.ok_or(BuildError::MissingAddress("tls inbound"))?,
	};

	Ok(Arc::new(TlsInbound {
		name: name.to_string(),
		addr,
		server_config: Arc::new(server_config),
		verify_by_psk: cfg.verify_by_psk,
		target: cfg.target,
		upper,
		raw: config.clone(),
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Inbound for TlsInbound {
	fn scheme(&self) -> String {
		match &self.upper {
			Some(upper) => format!("tls {}", upper.scheme()),
			None => "tls".to_string(),
		}
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn addr(&self) -> &str {
		&self.addr
	}

	fn raw_config(&self) -> &Value {
		&self.raw
	}

	async fn wrap(
		&self,
		stream: BoxedStream,
		peer: SocketAddr,
		auth: &AuthFn,
	) -> Result<InboundVerdict, WrapError> {
		let acceptor = TlsAcceptor::from(self.server_config.clone());
		let mut tls = acceptor.accept(stream).await?;

		if let Some(psk) = &self.verify_by_psk {
			let hello = format!("{psk}\n{}\n", padding(900..=1400));
			tls.write_all(hello.as_bytes()).await?;
			// One padding line back proves a live, protocol-aware client.
			let _ = read_line(&mut tls).await?;
		}

		match &self.upper {
			Some(upper) => upper.wrap(Box::new(tls), peer, auth).await,
			None => {
				let target = match &self.target {
					Some(addr) => TargetAddr::lookup(addr).await?,
					None => return Err(WrapError::NoTarget(self.name.clone())),
				};
				Ok(InboundVerdict::Proxy(InboundConn {
					stream: Box::new(tls),
					target,
					close: self.closes.clone().register(),
				}))
			},
		}
	}

	fn close_all(&self) {
		match &self.upper {
			Some(upper) => upper.close_all(),
			None => self.closes.close_all(),
		}
	}

	fn link_config(&self, default_host: &str, token: &str) -> Value {
		let mut config = self.raw.clone();
		match &self.upper {
			Some(upper) => {
				config["upper"] = upper.link_config(default_host, token);
			},
			None => {
				if let Value::Object(map) = &mut config {
					map.insert(
						"address".to_string(),
						json!(link_addr(&self.addr, &self.raw, default_host)),
					);
				}
			},
		}
		config
	}
}

#[derive(Deserialize)]
struct TlsOutboundConfig {
	address: Option<String>,
	#[serde(rename = "verifyByPsk")]
	verify_by_psk: Option<String>,
}

pub struct TlsOutbound {
	name: String,
	addr: String,
	client_config: Arc<rustls::ClientConfig>,
	verify_by_psk: Option<String>,
	upper: Option<Arc<dyn Outbound>>,
	closes: Arc<CloseSet>,
}

fn native_root_config() -> rustls::ClientConfig {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth()
}

/// SNI comes from the next-hop address, except when the next hop is the
/// `direct` sentinel and the connection target itself is being dialed.
fn sni_host(addr: &str, target: &TargetAddr) -> String {
	if addr == DIRECT_ADDR || addr.is_empty() {
		return target.host();
	}
	match split_host_port(addr) {
		Ok((host, _)) => host.to_string(),
		Err(_) => addr.to_string(),
	}
}

pub fn build_outbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	registry: &OutboundRegistry,
) -> Result<Arc<dyn Outbound>, BuildError> {
	let cfg: TlsOutboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("tls outbound", e))?;

	let own_addr = cfg.address.or(inherited_addr);
	let upper = match upper_config(config)? {
		Some(u) => Some(registry.build_with(name, u, own_addr.clone())?),
		None => None,
	};
	let addr = match own_addr {
		Some(addr) => addr,
		None => upper
			.as_ref()
			.map(|u| u.addr().to_string())
			.ok_or(BuildError::MissingAddress("tls outbound"))?,
	};

	Ok(Arc::new(TlsOutbound {
		name: name.to_string(),
		addr,
		client_config: Arc::new(native_root_config()),
		verify_by_psk: cfg.verify_by_psk,
		upper,
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Outbound for TlsOutbound {
	fn scheme(&self) -> String {
		match &self.upper {
			Some(upper) => format!("tls {}", upper.scheme()),
			None => "tls".to_string(),
		}
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn addr(&self) -> &str {
		&self.addr
	}

	async fn wrap(
		&self,
		stream: BoxedStream,
		target: &TargetAddr,
	) -> Result<OutboundConn, WrapError> {
		let host = sni_host(&self.addr, target);
		let server_name =
			ServerName::try_from(host).map_err(|_| WrapError::Malformed("sni"))?;
		let connector = TlsConnector::from(self.client_config.clone());
		let mut tls = connector.connect(server_name, stream).await?;

		if let Some(psk) = &self.verify_by_psk {
			let server_psk = read_line(&mut tls).await?;
			let _ = read_line(&mut tls).await?;
			if server_psk != *psk {
				return Err(WrapError::PskMismatch);
			}
			let reply = format!("{}\n", padding(100..=200));
			tls.write_all(reply.as_bytes()).await?;
		}

		match &self.upper {
			Some(upper) => upper.wrap(Box::new(tls), target).await,
			None => Ok(OutboundConn {
				stream: Box::new(tls),
				close: self.closes.clone().register(),
			}),
		}
	}

	fn close_all(&self) {
		match &self.upper {
			Some(upper) => upper.close_all(),
			None => self.closes.close_all(),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::mitm::NoUpstreamVerify;

	fn write_self_signed(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
		let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
		let cert_path = dir.join("server.crt");
		let key_path = dir.join("server.key");
		std::fs::write(&cert_path, cert.cert.pem()).unwrap();
		std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
		(cert_path, key_path)
	}

	fn insecure_client() -> TlsConnector {
		let config = rustls::ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoUpstreamVerify::new()))
			.with_no_client_auth();
		TlsConnector::from(Arc::new(config))
	}

	fn token_auth(headers: &HashMap<String, String>) -> String {
		match headers.get("linkToken").map(String::as_str) {
			Some("TOK1") => "alice".to_string(),
			_ => "guest".to_string(),
		}
	}

	#[test]
	fn padding_has_requested_length() {
		for _ in 0..16 {
			let pad = padding(900..=1400);
			assert!((900..=1400).contains(&pad.len()));
			assert!(pad.starts_with("233"));
		}
	}

	#[test]
	fn sni_prefers_next_hop_unless_direct() {
		let target = TargetAddr::parse("example.com:443").unwrap();
		assert_eq!(sni_host("edge.example.net:8443", &target), "edge.example.net");
		assert_eq!(sni_host(DIRECT_ADDR, &target), "example.com");
	}

	#[tokio::test]
	async fn tls_psk_then_connect_upper() {
		let dir = tempfile::tempdir().unwrap();
		let (cert_path, key_path) = write_self_signed(dir.path());
		let inbound = InboundRegistry::standard()
			.build(
				"tls-in",
				&serde_json::json!({
					"scheme": "tls",
					"cert": cert_path.to_str().unwrap(),
					"key": key_path.to_str().unwrap(),
					"verifyByPsk": "P",
					"upper": {"scheme": "https", "address": "0.0.0.0:8083"},
				}),
			)
			.unwrap();
		assert_eq!(inbound.addr(), "0.0.0.0:8083");
		assert_eq!(inbound.scheme(), "tls http");

		let (client_io, server_io) = tokio::io::duplex(8192);
		let client = tokio::spawn(async move {
			let name = ServerName::try_from("localhost".to_string()).unwrap();
			let mut tls = insecure_client().connect(name, client_io).await.unwrap();

			let psk = read_line(&mut tls).await.unwrap();
			assert_eq!(psk, "P");
			let pad = read_line(&mut tls).await.unwrap();
			assert!((900..=1400).contains(&pad.len()));
			tls.write_all(b"233233\n").await.unwrap();

			tls
				.write_all(b"CONNECT 127.0.0.1:9443 HTTP/1.1\r\nlinkToken: TOK1\r\n\r\n")
				.await
				.unwrap();
			let mut buf = [0u8; 64];
			let n = tls.read(&mut buf).await.unwrap();
			assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));
			tls.write_all(b"inner-bytes").await.unwrap();
			tls
		});

		let peer: SocketAddr = "127.0.0.1:55000".parse().unwrap();
		let verdict = inbound
			.wrap(Box::new(server_io), peer, &token_auth)
			.await
			.unwrap();
		let mut conn = match verdict {
			InboundVerdict::Proxy(conn) => conn,
			InboundVerdict::Handled => panic!("expected proxy session"),
		};
		assert_eq!(conn.target.to_string(), "127.0.0.1:9443");
		assert_eq!(conn.target.user_id, "alice");

		let mut inner = [0u8; 11];
		conn.stream.read_exact(&mut inner).await.unwrap();
		assert_eq!(&inner, b"inner-bytes");
		client.await.unwrap();
	}
}
