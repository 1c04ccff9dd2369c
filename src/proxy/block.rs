//! The `block` sentinel outbound. It is never dialed; the pipeline drops any
//! connection routed here after a single log line.

use std::sync::Arc;

use async_trait::async_trait;
use fluxgate_core::BoxedStream;
use serde_json::Value;

use super::{
	BLOCK_ADDR, BuildError, Outbound, OutboundConn, OutboundRegistry, TargetAddr, WrapError,
};

pub struct BlockOutbound {
	name: String,
}

pub fn build_outbound(
	name: &str,
	_config: &Value,
	_inherited_addr: Option<String>,
	_registry: &OutboundRegistry,
) -> Result<Arc<dyn Outbound>, BuildError> {
	Ok(Arc::new(BlockOutbound {
		name: name.to_string(),
	}))
}

#[async_trait]
impl Outbound for BlockOutbound {
	fn scheme(&self) -> String {
		"block".to_string()
	}

	fn name(&self) -> &str {
		&self.name
	}

	fn addr(&self) -> &str {
		BLOCK_ADDR
	}

	async fn wrap(
		&self,
		_stream: BoxedStream,
		_target: &TargetAddr,
	) -> Result<OutboundConn, WrapError> {
		Err(WrapError::Blocked)
	}

	fn close_all(&self) {}
}
