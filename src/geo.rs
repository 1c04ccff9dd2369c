//! GeoSite / GeoIP databases in the v2fly `.dat` format: a single
//! length-delimited protobuf list per file, produced externally. Only the
//! fields the router consumes are modeled; unknown fields are skipped by the
//! decoder.

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use prost::Message;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("failed to read {0}: {1}")]
	Read(String, std::io::Error),
	#[error("failed to decode {0}: {1}")]
	Decode(String, prost::DecodeError),
}

pub mod proto {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
	#[repr(i32)]
	pub enum DomainType {
		Plain = 0,
		Regex = 1,
		Root = 2,
		Full = 3,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct Domain {
		#[prost(enumeration = "DomainType", tag = "1")]
		pub kind: i32,
		#[prost(string, tag = "2")]
		pub value: String,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct GeoSite {
		#[prost(string, tag = "1")]
		pub country_code: String,
		#[prost(message, repeated, tag = "2")]
		pub domain: Vec<Domain>,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct GeoSiteList {
		#[prost(message, repeated, tag = "1")]
		pub entry: Vec<GeoSite>,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct Cidr {
		/// 4 or 16 raw address bytes.
		#[prost(bytes = "vec", tag = "1")]
		pub ip: Vec<u8>,
		#[prost(uint32, tag = "2")]
		pub prefix: u32,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct GeoIp {
		#[prost(string, tag = "1")]
		pub country_code: String,
		#[prost(message, repeated, tag = "2")]
		pub cidr: Vec<Cidr>,
	}

	#[derive(Clone, PartialEq, prost::Message)]
	pub struct GeoIpList {
		#[prost(message, repeated, tag = "1")]
		pub entry: Vec<GeoIp>,
	}
}

enum DomainMatcher {
	Plain(String),
	Regex(regex::Regex),
	Root(String),
	Full(String),
}

impl DomainMatcher {
	fn matches(&self, host: &str) -> bool {
		match self {
			DomainMatcher::Plain(s) => host.contains(s.as_str()),
			DomainMatcher::Regex(re) => re.is_match(host),
			DomainMatcher::Root(s) => {
				host == s || (host.len() > s.len() && host.ends_with(s.as_str()) && {
					let boundary = host.len() - s.len() - 1;
					host.as_bytes()[boundary] == b'.'
				})
			},
			DomainMatcher::Full(s) => host == s,
		}
	}
}

struct SiteEntry {
	code: String,
	domains: Vec<DomainMatcher>,
}

struct IpEntry {
	code: String,
	nets: Vec<IpNet>,
}

/// In-memory lookup tables for both databases. An empty instance is valid and
/// matches nothing, for deployments (and tests) without geo rules.
pub struct GeoDb {
	sites: Vec<SiteEntry>,
	ips: Vec<IpEntry>,
}

impl GeoDb {
	pub fn empty() -> Self {
		GeoDb {
			sites: Vec::new(),
			ips: Vec::new(),
		}
	}

	/// Loads `geosite.dat` and `geoip.dat` from the given directory.
	pub fn load(dir: &Path) -> Result<Self, Error> {
		let site_path = dir.join("geosite.dat");
		let ip_path = dir.join("geoip.dat");
		let site_raw = std::fs::read(&site_path)
			.map_err(|e| Error::Read(site_path.display().to_string(), e))?;
		let ip_raw =
			std::fs::read(&ip_path).map_err(|e| Error::Read(ip_path.display().to_string(), e))?;
		let db = Self::from_bytes(&site_raw, &ip_raw)?;
		info!(
			sites = db.sites.len(),
			ip_entries = db.ips.len(),
			"loaded geo databases"
		);
		Ok(db)
	}

	pub fn from_bytes(site_raw: &[u8], ip_raw: &[u8]) -> Result<Self, Error> {
		let site_list = proto::GeoSiteList::decode(site_raw)
			.map_err(|e| Error::Decode("geosite.dat".to_string(), e))?;
		let ip_list = proto::GeoIpList::decode(ip_raw)
			.map_err(|e| Error::Decode("geoip.dat".to_string(), e))?;
		Ok(Self::from_lists(site_list, ip_list))
	}

	pub fn from_lists(site_list: proto::GeoSiteList, ip_list: proto::GeoIpList) -> Self {
		let sites = site_list
			.entry
			.into_iter()
			.map(|entry| SiteEntry {
				code: entry.country_code.to_ascii_lowercase(),
				domains: entry
					.domain
					.iter()
					.filter_map(|d| {
						let value = d.value.to_ascii_lowercase();
						match proto::DomainType::try_from(d.kind) {
							Ok(proto::DomainType::Plain) => Some(DomainMatcher::Plain(value)),
							Ok(proto::DomainType::Regex) => match regex::Regex::new(&d.value) {
								Ok(re) => Some(DomainMatcher::Regex(re)),
								Err(e) => {
									warn!(pattern = %d.value, error = %e, "skipping bad geosite regex");
									None
								},
							},
							Ok(proto::DomainType::Root) => Some(DomainMatcher::Root(value)),
							Ok(proto::DomainType::Full) => Some(DomainMatcher::Full(value)),
							Err(_) => None,
						}
					})
					.collect(),
			})
			.collect();

		let ips = ip_list
			.entry
			.into_iter()
			.map(|entry| IpEntry {
				code: entry.country_code.to_ascii_lowercase(),
				nets: entry.cidr.iter().filter_map(cidr_to_net).collect(),
			})
			.collect();

		GeoDb { sites, ips }
	}

	/// Every geosite code whose domain set matches the host.
	pub fn site_codes(&self, host: &str) -> Vec<String> {
		let host = host.to_ascii_lowercase();
		self
			.sites
			.iter()
			.filter(|entry| entry.domains.iter().any(|d| d.matches(&host)))
			.map(|entry| entry.code.clone())
			.collect()
	}

	/// Every geoip code whose CIDR set contains the address.
	pub fn ip_codes(&self, ip: IpAddr) -> Vec<String> {
		self
			.ips
			.iter()
			.filter(|entry| entry.nets.iter().any(|net| net.contains(&ip)))
			.map(|entry| entry.code.clone())
			.collect()
	}
}

fn cidr_to_net(cidr: &proto::Cidr) -> Option<IpNet> {
	let addr: IpAddr = match cidr.ip.len() {
		4 => {
			let octets: [u8; 4] = cidr.ip.as_slice().try_into().ok()?;
			IpAddr::from(octets)
		},
		16 => {
			let octets: [u8; 16] = cidr.ip.as_slice().try_into().ok()?;
			IpAddr::from(octets)
		},
		_ => return None,
	};
	IpNet::new(addr, cidr.prefix as u8).ok()
}

#[cfg(test)]
mod tests {
	use super::proto::*;
	use super::*;

	fn site(code: &str, domains: Vec<(DomainType, &str)>) -> GeoSite {
		GeoSite {
			country_code: code.to_string(),
			domain: domains
				.into_iter()
				.map(|(kind, value)| Domain {
					kind: kind as i32,
					value: value.to_string(),
				})
				.collect(),
		}
	}

	fn test_db() -> GeoDb {
		let sites = GeoSiteList {
			entry: vec![
				site(
					"GEOLOCATION-!CN",
					vec![(DomainType::Root, "github.com"), (DomainType::Root, "google.com")],
				),
				site("CN", vec![(DomainType::Root, "baidu.com")]),
				site("CATEGORY-DEV", vec![(DomainType::Plain, "git")]),
			],
		};
		let ips = GeoIpList {
			entry: vec![GeoIp {
				country_code: "PRIVATE".to_string(),
				cidr: vec![Cidr {
					ip: vec![10, 0, 0, 0],
					prefix: 8,
				}],
			}],
		};
		GeoDb::from_lists(sites, ips)
	}

	#[test]
	fn decodes_wire_format() {
		let sites = GeoSiteList {
			entry: vec![site("CN", vec![(DomainType::Full, "baidu.com")])],
		};
		let ips = GeoIpList { entry: vec![] };
		let db = GeoDb::from_bytes(&sites.encode_to_vec(), &ips.encode_to_vec()).unwrap();
		assert_eq!(db.site_codes("baidu.com"), vec!["cn"]);
	}

	#[test]
	fn root_domain_matching() {
		let db = test_db();
		let codes = db.site_codes("github.com");
		assert!(codes.contains(&"geolocation-!cn".to_string()));
		// Subdomains match a root entry, unrelated suffixes do not.
		assert!(db.site_codes("api.github.com").contains(&"geolocation-!cn".to_string()));
		assert!(!db.site_codes("evilgithub.com").contains(&"geolocation-!cn".to_string()));
		assert!(db.site_codes("baidu.com").contains(&"cn".to_string()));
	}

	#[test]
	fn plain_matching_is_substring() {
		let db = test_db();
		assert!(db.site_codes("github.com").contains(&"category-dev".to_string()));
		assert!(db.site_codes("example.org").is_empty());
	}

	#[test]
	fn ip_lookup_uses_cidr_containment() {
		let db = test_db();
		assert_eq!(db.ip_codes("10.1.2.3".parse().unwrap()), vec!["private"]);
		assert!(db.ip_codes("8.8.8.8".parse().unwrap()).is_empty());
	}
}
