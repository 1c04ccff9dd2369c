//! The `direct` sentinel outbound: the pipeline dials the connection target
//! itself instead of a next hop.

use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use serde_json::Value;

use super::{
	BuildError, CloseSet, DIRECT_ADDR, Outbound, OutboundConn, OutboundRegistry, TargetAddr,
	WrapError, upper_config,
};

pub struct DirectOutbound {
	name: String,
	upper: Option<Arc<dyn Outbound>>,
	closes: Arc<CloseSet>,
}

pub fn build_outbound(
	name: &str,
	config: &Value,
	_inherited_addr: Option<String>,
	registry: &OutboundRegistry,
) -> Result<Arc<dyn Outbound>, BuildError> {
	let upper = match upper_config(config)? {
		Some(u) => Some(registry.build_with(name, u, Some(DIRECT_ADDR.to_string()))?),
		None => None,
	};
	Ok(Arc::new(DirectOutbound {
		name: name.to_string(),
		upper,
		closes: CloseSet::new(),
	}))
}

#[async_trait]
impl Outbound for DirectOutbound {
	fn scheme(&self) -> String {
		match &self.upper {
			Some(upper) => format!("direct {}", upper.scheme()),
			None => "direct".to_string(),
		}
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn addr(&self) -> &str {
		DIRECT_ADDR
	}

	async fn wrap(
		&self,
		stream: BoxedStream,
		target: &TargetAddr,
	) -> Result<OutboundConn, WrapError> {
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
