//! Rewriting reverse proxy inbound: requests are retargeted at a configured
//! backend by patching the request head in place, then reinjected into the
//! stream for the egress side to forward.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use fluxgate_core::peek::PeekStream;
use serde::Deserialize;
use serde_json::Value;

use super::{
	AuthFn, BuildError, CloseSet, FORWARD_USER, Inbound, InboundConn, InboundRegistry,
	InboundVerdict, TargetAddr, WrapError,
};

#[derive(Deserialize)]
struct RevHttpConfig {
	address: Option<String>,
	forward_host: String,
}

pub struct RevHttpInbound {
	name: String,
	addr: String,
	forward_host: String,
	raw: Value,
	closes: Arc<CloseSet>,
}

pub fn build_inbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	_registry: &InboundRegistry,
) -> Result<Arc<dyn Inbound>, BuildError> {
	let cfg: RevHttpConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("rev_http inbound", e))?;
	let addr = cfg
		.address
		.or(inherited_addr)
		.ok_or(BuildError::MissingAddress("rev_http inbound"))?;
	Ok(Arc::new(RevHttpInbound {
		name: name.to_string(),
		addr,
		forward_host: cfg.forward_host,
		raw: config.clone(),
		closes: CloseSet::new(),
	}))
}

/// Rewrites the request head: `Host` points at the backend, the peer is
/// recorded in `X-Forwarded-For`, and keep-alive is disabled. Replacements
/// that matched no existing header are appended.
fn rewrite_head(raw: &str, forward_host: &str, peer: SocketAddr) -> String {
	let mut sections = raw.split("\r\n\r\n");
	let head = sections.next().unwrap_or("");

	let mut replacements: Vec<(&str, String)> = vec![
		("Host", forward_host.to_string()),
		("X-Forwarded-For", peer.to_string()),
		("Connection", "close".to_string()),
	];

	let mut out = String::new();
	for (i, line) in head.split("\r\n").enumerate() {
		if i == 0 {
			out.push_str(line);
			out.push_str("\r\n");
			continue;
		}
		let name = line.split_once(':').map(|(n, _)| n).unwrap_or("");
		match replacements.iter().position(|(k, _)| *k == name) {
			Some(idx) => {
				let (k, v) = replacements.remove(idx);
				out.push_str(&format!("{k}: {v}\r\n"));
			},
			None => {
				out.push_str(line);
				out.push_str("\r\n");
			},
		}
	}
	for (k, v) in replacements {
		out.push_str(&format!("{k}: {v}\r\n"));
	}
	out.push_str("\r\n");

	let body: Vec<&str> = sections.collect();
	out.push_str(&body.join("\r\n\r\n"));
	out
}

#[async_trait]
impl Inbound for RevHttpInbound {
	fn scheme(&self) -> String {
		"rev_http".to_string()
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
		_auth: &AuthFn,
	) -> Result<InboundVerdict, WrapError> {
		let mut peeked = PeekStream::new(stream);
		let head = peeked.peek(1024).await?.to_vec();
		if head.is_empty() {
			return Err(WrapError::Malformed("rev_http"));
		}

		let text = String::from_utf8_lossy(&head).into_owned();
		let rewritten = rewrite_head(&text, &self.forward_host, peer);
		peeked.set_peeked(rewritten.into_bytes());

		let backend = if self.forward_host.contains(':') {
			self.forward_host.clone()
		} else {
			format!("{}:80", self.forward_host)
		};
		let mut target = TargetAddr::lookup(&backend).await?;
		target.user_id = FORWARD_USER.to_string();

		Ok(InboundVerdict::Proxy(InboundConn {
			stream: Box::new(peeked),
			target,
			close: self.closes.clone().register(),
		}))
	}

	fn close_all(&self) {
		self.closes.close_all();
	}
}
