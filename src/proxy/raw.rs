//! Unframed pass-through. As an inbound it is a plain port forward to a
//! configured target; as an outbound the stream goes out untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use serde::Deserialize;
use serde_json::Value;

use super::{
	AuthFn, BuildError, CloseSet, Inbound, InboundConn, InboundRegistry, InboundVerdict, Outbound,
	OutboundConn, OutboundRegistry, TargetAddr, WrapError,
};

#[derive(Deserialize)]
struct RawInboundConfig {
	address: Option<String>,
	target: Option<String>,
}

pub struct RawInbound {
	name: String,
	addr: String,
	target: Option<String>,
	raw: Value,
	closes: Arc<CloseSet>,
}

pub fn build_inbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	_registry: &InboundRegistry,
) -> Result<Arc<dyn Inbound>, BuildError> {
	let cfg: RawInboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("raw inbound", e))?;
	let addr = cfg
		.address
		.or(inherited_addr)
		.ok_or(BuildError::MissingAddress("raw inbound"))?;
	Ok(Arc::new(RawInbound {
		name: name.to_string(),
		addr,
		target: cfg.target,
		raw: config.clone(),
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Inbound for RawInbound {
	fn scheme(&self) -> String {
		"raw".to_string()
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
		_peer: SocketAddr,
		_auth: &AuthFn,
	) -> Result<InboundVerdict, WrapError> {
		let target = match &self.target {
			Some(addr) => TargetAddr::lookup(addr).await?,
			None => return Err(WrapError::NoTarget(self.name.clone())),
		};
		Ok(InboundVerdict::Proxy(InboundConn {
			stream,
			target,
			close: self.closes.clone().register(),
		}))
	}

	fn close_all(&self) {
		self.closes.close_all();
	}
}

pub struct RawOutbound {
	name: String,
	addr: String,
	closes: Arc<CloseSet>,
}

#[derive(Deserialize)]
struct RawOutboundConfig {
	address: Option<String>,
}

pub fn build_outbound(
	name: &str,
	config: &Value,
	inherited_addr: Option<String>,
	_registry: &OutboundRegistry,
) -> Result<Arc<dyn Outbound>, BuildError> {
	let cfg: RawOutboundConfig = serde_json::from_value(config.clone())
		.map_err(|e| BuildError::InvalidConfig("raw outbound", e))?;
	let addr = cfg
		.address
		.or(inherited_addr)
		.ok_or(BuildError::MissingAddress("raw outbound"))?;
	Ok(Arc::new(RawOutbound {
		name: name.to_string(),
		addr,
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Outbound for RawOutbound {
	fn scheme(&self) -> String {
		"raw".to_string()
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
		_target: &TargetAddr,
	) -> Result<OutboundConn, WrapError> {
		Ok(OutboundConn {
			stream,
			close: self.closes.clone().register(),
		})
	}

	fn close_all(&self) {
		self.closes.close_all();
	}
}
