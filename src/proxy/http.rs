//! HTTP proxy framing. The inbound accepts both CONNECT tunnels and plain
//! absolute-URI requests; the outbound speaks CONNECT to an upstream proxy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::copy::relay;
use fluxgate_core::peek::PeekStream;
use fluxgate_core::BoxedStream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{
	AuthFn, BuildError, CloseSet, GUEST_USER, Inbound, InboundConn, InboundRegistry,
	InboundVerdict, Outbound, OutboundConn, OutboundRegistry, TargetAddr, WrapError, link_addr,
	upper_config,
};

const PEEK_LIMIT: usize = 1024;

#[derive(Deserialize)]
struct HttpInboundConfig {
	address: Option<String>,
	#[serde(rename = "guestForward")]
	guest_forward: Option<String>,
}

pub struct HttpInbound {
	name: String,
	addr: String,
	guest_forward: Option<String>,
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
	let cfg: HttpInboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("http inbound", e))?;
	let addr = cfg
		.address
		.or(inherited_addr)
		.ok_or(BuildError::MissingAddress("http inbound"))?;
	let upper = match upper_config(config)? {
		Some(u) => Some(registry.build_with(name, u, Some(addr.clone()))?),
		None => None,
	};
	Ok(Arc::new(HttpInbound {
		name: name.to_string(),
		addr,
		guest_forward: cfg.guest_forward,
		upper,
		raw: config.clone(),
		closes: CloseSet::new(),
	}))
}

/// Splits the head into `(method, url, headers)`. Header names keep their
/// wire casing; `linkToken` falls back to the URL path when absent.
fn parse_request_head(head: &[u8]) -> (String, String, HashMap<String, String>) {
	let text = String::from_utf8_lossy(head);
	let mut lines = text.split("\r\n");
	let request_line = lines.next().unwrap_or("");
	let mut parts = request_line.split_whitespace();
	let method = parts.next().unwrap_or("").to_string();
	let url = parts.next().unwrap_or("").to_string();

	let mut headers = HashMap::new();
	for line in lines {
		if let Some((name, value)) = line.split_once(':') {
			headers.insert(name.trim().to_string(), value.trim().to_string());
		}
	}
	if headers.get("linkToken").map(String::as_str).unwrap_or("") == "" {
		headers.insert(
			"linkToken".to_string(),
			url.trim_matches(['/', ' ']).to_string(),
		);
	}
	(method, url, headers)
}

/// The authority of an absolute request URI, with the default port applied.
fn host_from_url(url: &str) -> Option<String> {
	let rest = match url.find("://") {
		Some(i) => &url[i + 3..],
		None => url,
	};
	let end = rest.find('/').unwrap_or(rest.len());
	let authority = &rest[..end];
	if authority.is_empty() {
		return None;
	}
	if authority.starts_with('[') {
		return if authority.contains("]:") {
			Some(authority.to_string())
		} else {
			Some(format!("{authority}:80"))
		};
	}
	if authority.contains(':') {
		Some(authority.to_string())
	} else {
		Some(format!("{authority}:80"))
	}
}

#[async_trait]
impl Inbound for HttpInbound {
	fn scheme(&self) -> String {
		"http".to_string()
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
		let mut peeked = PeekStream::new(stream);
		let head = peeked.peek(PEEK_LIMIT).await?.to_vec();
		if head.is_empty() {
			return Err(WrapError::Malformed("http"));
		}
		let (method, url, headers) = parse_request_head(&head);
		if method.is_empty() || url.is_empty() {
			return Err(WrapError::Malformed("http"));
		}

		let user_id = auth(&headers);
		if user_id == GUEST_USER {
			// Anti-probe: an unauthenticated peer against a guarded listener is
			// spliced through to a decoy, and never routed.
			if let Some(forward) = &self.guest_forward {
				let decoy = TcpStream::connect(forward)
					.await
					.map_err(|e| WrapError::ForwardDial(forward.clone(), e))?;
				info!(inbound = %self.name, %peer, %forward, "auth failed, forwarding to decoy");
				let _ = relay(peeked, decoy).await;
				return Ok(InboundVerdict::Handled);
			}
		}

		let address = if method == "CONNECT" {
			url.clone()
		} else {
			host_from_url(&url).ok_or(WrapError::Malformed("http"))?
		};
		let mut target = TargetAddr::lookup(&address).await?;
		target.user_id = user_id;

		if method == "CONNECT" {
			// Consume the request head; everything after it belongs to the
			// tunneled protocol.
			let _ = peeked.take_peeked();
			peeked
				.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
				.await?;
		} else {
			// Plain HTTP: leave the request bytes in the peek buffer so the
			// egress side forwards them verbatim.
			debug!(inbound = %self.name, %url, "forwarding plain http request");
		}

		match &self.upper {
			Some(upper) => match upper.wrap(Box::new(peeked), peer, auth).await? {
				InboundVerdict::Proxy(inner) => {
					let mut target = target;
					target.extras = inner.target.extras;
					Ok(InboundVerdict::Proxy(InboundConn {
						stream: inner.stream,
						target,
						close: inner.close,
					}))
				},
				InboundVerdict::Handled => Ok(InboundVerdict::Handled),
			},
			None => Ok(InboundVerdict::Proxy(InboundConn {
				stream: Box::new(peeked),
				target,
				close: self.closes.clone().register(),
			})),
		}
	}

	fn close_all(&self) {
		match &self.upper {
			Some(upper) => upper.close_all(),
			None => self.closes.close_all(),
		}
	}

	fn link_config(&self, default_host: &str, token: &str) -> Value {
		let scheme = self
			.raw
			.get("scheme")
			.and_then(Value::as_str)
			.unwrap_or("http");
		let addr = link_addr(&self.addr, &self.raw, default_host);
		json!({
			"scheme": scheme,
			"address": addr,
			"url": format!("{scheme}://{addr}"),
			"linkToken": token,
		})
	}
}

#[derive(Deserialize)]
struct HttpOutboundConfig {
	address: Option<String>,
	#[serde(rename = "linkToken")]
	link_token: Option<String>,
}

pub struct HttpOutbound {
	name: String,
	addr: String,
	link_token: Option<String>,
	upper: Option<Arc<dyn Outbound>>,
	closes: Arc<CloseSet>,
}

pub fn build_outbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	registry: &OutboundRegistry,
) -> Result<Arc<dyn Outbound>, BuildError> {
	let cfg: HttpOutboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("http outbound", e))?;
	let addr = cfg
		.address
		.or(inherited_addr)
		.ok_or(BuildError::MissingAddress("http outbound"))?;
	let upper = match upper_config(config)? {
		Some(u) => Some(registry.build_with(name, u, Some(addr.clone()))?),
		None => None,
	};
	Ok(Arc::new(HttpOutbound {
		name: name.to_string(),
		addr,
		link_token: cfg.link_token,
		upper,
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Outbound for HttpOutbound {
	fn scheme(&self) -> String {
		"http".to_string()
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn addr(&self) -> &str {
		&self.addr
	}

	async fn wrap(
		&self,
		mut stream: BoxedStream,
		target: &TargetAddr,
	) -> Result<OutboundConn, WrapError> {
		let auth_header = match &self.link_token {
			Some(token) => format!("linkToken: {token}\r\n"),
			None => String::new(),
		};
		let request = format!("CONNECT {target} HTTP/1.1\r\n{auth_header}\r\n");
		stream.write_all(request.as_bytes()).await?;

		let mut response = [0u8; 1024];
		let read = stream.read(&mut response).await?;
		if read == 0 || !String::from_utf8_lossy(&response[..read]).contains("200") {
			return Err(WrapError::ConnectRefused);
		}

		match &self.upper {
			Some(upper) => upper.wrap(stream, target).await,
			None => Ok(OutboundConn {
				stream,
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
