use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use tokio::net::lookup_host;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
	#[error("address {0} has no port")]
	MissingPort(String),
	#[error("address {0} has an invalid port")]
	BadPort(String),
}

/// Parsed destination of a proxied connection, plus the authenticated
/// principal and opaque extras a wrapper stack may attach along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetAddr {
	/// Fully-qualified domain name; empty when the peer supplied an IP
	/// literal.
	pub hostname: String,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub user_id: String,
	pub extras: HashMap<String, serde_json::Value>,
}

impl TargetAddr {
	/// Parses `host:port` without resolving. The port is required; an empty
	/// host means localhost. IPv6 literals use the usual bracket form.
	pub fn parse(addr: &str) -> Result<TargetAddr, AddrError> {
		let (host, port_str) = split_host_port(addr)?;
		let port: u16 = port_str
			.parse()
			.map_err(|_| AddrError::BadPort(addr.to_string()))?;
		let host = if host.is_empty() { "127.0.0.1" } else { host };

		let mut target = TargetAddr {
			port,
			..TargetAddr::default()
		};
		match host.parse::<IpAddr>() {
			Ok(ip) => target.ip = Some(ip),
			Err(_) => target.hostname = host.to_string(),
		}
		Ok(target)
	}

	/// Parses and, for DNS names, attempts resolution. Resolution failure is
	/// tolerated: callers that only need the hostname (SNI, geosite rules)
	/// still get a usable target with `ip = None`.
	pub async fn lookup(addr: &str) -> Result<TargetAddr, AddrError> {
		let mut target = Self::parse(addr)?;
		if target.ip.is_none() {
			if let Ok(mut addrs) = lookup_host((target.hostname.as_str(), target.port)).await {
				target.ip = addrs.next().map(|sa| sa.ip());
			}
		}
		Ok(target)
	}

	/// The hostname when known, otherwise the IP literal.
	pub fn host(&self) -> String {
		if self.hostname.is_empty() {
			match self.ip {
				Some(ip) => ip.to_string(),
				None => String::new(),
			}
		} else {
			self.hostname.clone()
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.hostname.is_empty() {
			match self.ip {
				Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
				Some(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
				None => write!(f, ":{}", self.port),
			}
		} else {
			write!(f, "{}:{}", self.hostname, self.port)
		}
	}
}

/// Splits `host:port`, handling bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Result<(&str, &str), AddrError> {
	if let Some(rest) = addr.strip_prefix('[') {
		let end = rest
			.find(']')
			.ok_or_else(|| AddrError::MissingPort(addr.to_string()))?;
		let host = &rest[..end];
		let tail = &rest[end + 1..];
		let port = tail
			.strip_prefix(':')
			.ok_or_else(|| AddrError::MissingPort(addr.to_string()))?;
		return Ok((host, port));
	}
	match addr.rfind(':') {
		// A second colon means an unbracketed IPv6 literal with no port.
		Some(i) if !addr[..i].contains(':') => Ok((&addr[..i], &addr[i + 1..])),
		_ => Err(AddrError::MissingPort(addr.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ip_literal_round_trips() {
		let target = TargetAddr::parse("93.184.216.34:443").unwrap();
		assert!(target.hostname.is_empty());
		assert_eq!(target.ip, Some("93.184.216.34".parse().unwrap()));
		assert_eq!(target.to_string(), "93.184.216.34:443");
	}

	#[test]
	fn hostname_round_trips() {
		let target = TargetAddr::parse("example.com:8080").unwrap();
		assert_eq!(target.hostname, "example.com");
		assert_eq!(target.ip, None);
		assert_eq!(target.to_string(), "example.com:8080");
	}

	#[test]
	fn ipv6_uses_brackets() {
		let target = TargetAddr::parse("[2001:db8::1]:443").unwrap();
		assert_eq!(target.ip, Some("2001:db8::1".parse().unwrap()));
		assert_eq!(target.to_string(), "[2001:db8::1]:443");
	}

	#[test]
	fn empty_host_means_localhost() {
		let target = TargetAddr::parse(":9000").unwrap();
		assert_eq!(target.ip, Some("127.0.0.1".parse().unwrap()));
		assert_eq!(target.port, 9000);
	}

	#[test]
	fn port_is_required() {
		assert_eq!(
			TargetAddr::parse("example.com"),
			Err(AddrError::MissingPort("example.com".to_string()))
		);
		assert!(TargetAddr::parse("example.com:http").is_err());
	}

	#[tokio::test]
	async fn lookup_tolerates_resolution_failure() {
		let target = TargetAddr::lookup("no-such-host.invalid:443").await.unwrap();
		assert_eq!(target.hostname, "no-such-host.invalid");
		assert_eq!(target.ip, None);
	}

	#[tokio::test]
	async fn lookup_resolves_localhost() {
		let target = TargetAddr::lookup("localhost:80").await.unwrap();
		assert_eq!(target.hostname, "localhost");
		assert!(target.ip.is_some());
	}
}
