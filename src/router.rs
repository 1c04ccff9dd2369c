//! Policy routing: user → group → scheme → ordered rules → outbound pick.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::geo::GeoDb;
use crate::proxy::{BLOCK_ADDR, DIRECT_ADDR, TargetAddr};
use crate::store::{RouteSchemeDetail, User, UserGroup};

/// Live policy snapshots, refreshed by the supervisor after store writes.
/// Scheme details are kept pre-sorted in evaluation order.
#[derive(Default)]
pub struct PolicyTables {
	users: RwLock<HashMap<String, User>>,
	tokens: RwLock<HashMap<String, String>>,
	groups: RwLock<HashMap<String, UserGroup>>,
	schemes: RwLock<HashMap<String, RouteSchemeDetail>>,
}

impl PolicyTables {
	pub fn new() -> Arc<PolicyTables> {
		Arc::new(PolicyTables::default())
	}

	pub fn user(&self, id: &str) -> Option<User> {
		self.users.read().get(id).cloned()
	}

	pub fn user_by_token(&self, token: &str) -> Option<User> {
		let id = self.tokens.read().get(token).cloned()?;
		self.user(&id)
	}

	pub fn group(&self, id: &str) -> Option<UserGroup> {
		self.groups.read().get(id).cloned()
	}

	pub fn scheme(&self, id: &str) -> Option<RouteSchemeDetail> {
		self.schemes.read().get(id).cloned()
	}

	pub fn sync_user(&self, user: User) {
		use crate::proxy::{FORWARD_USER, GUEST_USER};
		let mut tokens = self.tokens.write();
		tokens.retain(|_, id| id != &user.id);
		if user.id != GUEST_USER && user.id != FORWARD_USER {
			if let Some(token) = &user.link_token {
				if !token.is_empty() {
					tokens.insert(token.clone(), user.id.clone());
				}
			}
		}
		drop(tokens);
		self.users.write().insert(user.id.clone(), user);
	}

	pub fn remove_user(&self, id: &str) {
		self.users.write().remove(id);
		self.tokens.write().retain(|_, uid| uid != id);
	}

	pub fn sync_group(&self, group: UserGroup) {
		self.groups.write().insert(group.id.clone(), group);
	}

	pub fn remove_group(&self, id: &str) {
		self.groups.write().remove(id);
	}

	pub fn sync_scheme(&self, detail: RouteSchemeDetail) {
		self.schemes.write().insert(detail.scheme.id.clone(), detail);
	}

	pub fn remove_scheme(&self, id: &str) {
		self.schemes.write().remove(id);
	}
}

pub struct Router {
	geo: Arc<GeoDb>,
	tables: Arc<PolicyTables>,
}

impl Router {
	pub fn new(geo: Arc<GeoDb>, tables: Arc<PolicyTables>) -> Router {
		Router { geo, tables }
	}

	/// Resolves `(target, inbound)` to an outbound id. Unknown principals go
	/// `direct` (anonymous access from pipelines that bypassed auth); policy
	/// violations go to `block`; no matching rule falls back to `direct`.
	pub fn route(&self, target: &TargetAddr, inbound_id: &str) -> String {
		let geo_codes = if !target.hostname.is_empty() {
			self.geo.site_codes(&target.hostname)
		} else {
			match target.ip {
				Some(ip) => self.geo.ip_codes(ip),
				None => Vec::new(),
			}
		};

		let Some(user) = self.tables.user(&target.user_id) else {
			return DIRECT_ADDR.to_string();
		};
		let Some(group) = self.tables.group(&user.group_id) else {
			return DIRECT_ADDR.to_string();
		};
		if !group.avail_inbounds.contains(inbound_id) {
			debug!(user = %user.id, inbound = %inbound_id, "inbound not available to group");
			return BLOCK_ADDR.to_string();
		}
		let Some(detail) = self.tables.scheme(&group.route_scheme_id) else {
			return DIRECT_ADDR.to_string();
		};
		if !detail.scheme.enabled {
			return BLOCK_ADDR.to_string();
		}

		for rule in &detail.rules {
			if rule.outbounds.is_empty() {
				continue;
			}
			let matched = rule
				.pattern
				.split(',')
				.any(|pattern| match_pattern(&rule.kind, pattern.trim(), target, &geo_codes));
			if matched {
				let pick = rand::rng().random_range(0..rule.outbounds.len());
				return rule.outbounds[pick].clone();
			}
		}
		DIRECT_ADDR.to_string()
	}
}

fn match_pattern(kind: &str, pattern: &str, target: &TargetAddr, geo_codes: &[String]) -> bool {
	match kind {
		"any" => true,
		"domain" => match_domain(pattern, &target.hostname),
		"ip" => match_ip(pattern, target.ip),
		"geosite" => geo_codes.iter().any(|code| code == pattern),
		_ => false,
	}
}

/// Label-wise glob: `*` matches exactly one label, counts must agree.
fn match_domain(pattern: &str, domain: &str) -> bool {
	if pattern == "*" {
		return true;
	}
	let pattern_parts: Vec<&str> = pattern.split('.').collect();
	let domain_parts: Vec<&str> = domain.split('.').collect();
	if pattern_parts.len() != domain_parts.len() {
		return false;
	}
	pattern_parts
		.iter()
		.zip(domain_parts.iter())
		.all(|(p, d)| *p == "*" || p == d)
}

fn match_ip(pattern: &str, ip: Option<IpAddr>) -> bool {
	if pattern == "*" {
		return true;
	}
	let Some(ip) = ip else {
		return false;
	};
	if pattern.contains('/') {
		return match pattern.parse::<IpNet>() {
			Ok(net) => net.contains(&ip),
			Err(_) => false,
		};
	}
	pattern == ip.to_string()
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use crate::geo::proto::{Domain, DomainType, GeoIpList, GeoSite, GeoSiteList};
	use crate::store::{RouteScheme, Rule};

	fn geo() -> Arc<GeoDb> {
		Arc::new(GeoDb::from_lists(
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
		))
	}

	fn rule(priority: u32, kind: &str, pattern: &str, outbounds: &[&str]) -> Rule {
		Rule {
			id: priority as u64,
			name: format!("r{priority}"),
			kind: kind.to_string(),
			pattern: pattern.to_string(),
			outbounds: outbounds.iter().map(|s| s.to_string()).collect(),
			priority,
			scheme_id: "s1".to_string(),
		}
	}

	fn tables_with_rules(rules: Vec<Rule>, scheme_enabled: bool) -> Arc<PolicyTables> {
		let tables = PolicyTables::new();
		tables.sync_user(User {
			id: "alice".into(),
			password_hash: String::new(),
			link_token: Some("TOK1".into()),
			email: "alice@example.com".into(),
			enabled: true,
			group_id: "g1".into(),
		});
		tables.sync_group(UserGroup {
			id: "g1".into(),
			route_scheme_id: "s1".into(),
			avail_inbounds: BTreeSet::from(["http-in".to_string()]),
		});
		let mut sorted = rules;
		sorted.sort_by_key(|r| r.priority);
		tables.sync_scheme(RouteSchemeDetail {
			scheme: RouteScheme {
				id: "s1".into(),
				description: String::new(),
				enabled: scheme_enabled,
			},
			rules: sorted,
		});
		tables
	}

	fn target(addr: &str, user: &str) -> TargetAddr {
		let mut t = TargetAddr::parse(addr).unwrap();
		t.user_id = user.to_string();
		t
	}

	#[test]
	fn geosite_rule_wins_over_catch_all() {
		let tables = tables_with_rules(
			vec![
				rule(0, "geosite", "geolocation-!cn", &["us-node"]),
				rule(1, "any", "*", &["direct"]),
			],
			true,
		);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "alice"), "http-in"), "us-node");
		assert_eq!(router.route(&target("baidu.com:443", "alice"), "http-in"), "direct");
	}

	#[test]
	fn priority_reorder_changes_routing() {
		let tables = tables_with_rules(
			vec![
				rule(0, "any", "*", &["direct"]),
				rule(1, "geosite", "geolocation-!cn", &["us-node"]),
			],
			true,
		);
		let router = Router::new(geo(), tables);
		// The catch-all now shadows the geosite rule.
		assert_eq!(router.route(&target("github.com:443", "alice"), "http-in"), "direct");
	}

	#[test]
	fn unknown_user_goes_direct() {
		let tables = tables_with_rules(vec![rule(0, "any", "*", &["us-node"])], true);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "mallory"), "http-in"), "direct");
	}

	#[test]
	fn foreign_inbound_is_blocked() {
		let tables = tables_with_rules(vec![rule(0, "any", "*", &["us-node"])], true);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "alice"), "other-in"), "block");
	}

	#[test]
	fn disabled_scheme_blocks() {
		let tables = tables_with_rules(vec![rule(0, "any", "*", &["us-node"])], false);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "alice"), "http-in"), "block");
	}

	#[test]
	fn no_matching_rule_goes_direct() {
		let tables = tables_with_rules(vec![rule(0, "domain", "*.internal", &["us-node"])], true);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "alice"), "http-in"), "direct");
	}

	#[test]
	fn ip_rules_use_cidr_and_exact_form() {
		let tables = tables_with_rules(
			vec![
				rule(0, "ip", "10.0.0.0/8", &["lan"]),
				rule(1, "ip", "8.8.8.8", &["dns"]),
				rule(2, "any", "*", &["direct"]),
			],
			true,
		);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("10.1.2.3:443", "alice"), "http-in"), "lan");
		assert_eq!(router.route(&target("8.8.8.8:53", "alice"), "http-in"), "dns");
		assert_eq!(router.route(&target("9.9.9.9:443", "alice"), "http-in"), "direct");
	}

	#[test]
	fn comma_patterns_and_domain_globs() {
		let tables = tables_with_rules(
			vec![
				rule(0, "domain", "api.example.com,*.example.org", &["picked"]),
				rule(1, "any", "*", &["direct"]),
			],
			true,
		);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("api.example.com:443", "alice"), "http-in"), "picked");
		assert_eq!(router.route(&target("cdn.example.org:443", "alice"), "http-in"), "picked");
		// Glob labels must align one-to-one.
		assert_eq!(
			router.route(&target("a.b.example.org:443", "alice"), "http-in"),
			"direct"
		);
	}

	#[test]
	fn random_pick_stays_within_candidates() {
		let tables = tables_with_rules(vec![rule(0, "any", "*", &["a", "b", "c"])], true);
		let router = Router::new(geo(), tables);
		for _ in 0..32 {
			let picked = router.route(&target("github.com:443", "alice"), "http-in");
			assert!(["a", "b", "c"].contains(&picked.as_str()));
		}
	}

	#[test]
	fn unknown_rule_kind_never_matches() {
		let tables = tables_with_rules(
			vec![rule(0, "regexp", ".*", &["x"]), rule(1, "any", "*", &["direct"])],
			true,
		);
		let router = Router::new(geo(), tables);
		assert_eq!(router.route(&target("github.com:443", "alice"), "http-in"), "direct");
	}
}
