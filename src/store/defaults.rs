//! Seed data for a freshly created system store: a usable plain-HTTP inbound,
//! the two sentinel outbounds, one upstream example, and an admin account.

use serde_json::json;

use super::{Data, Direction, ProxyData, RouteScheme, Rule, SystemInfo, User, UserGroup};
use crate::utils;

pub(super) fn system_info() -> SystemInfo {
	SystemInfo {
		name: "Fluxgate".to_string(),
		description: "Multi-user forward proxy. Unauthenticated HTTP inbounds \
		              can be used directly by address."
			.to_string(),
		traffic_record_days: 30,
	}
}

pub(super) fn seed() -> Data {
	let mut data = Data {
		system: Some(system_info()),
		next_rule_id: 0,
		..Data::default()
	};

	data.schemes.insert(
		"default".to_string(),
		RouteScheme {
			id: "default".to_string(),
			description: "default routing scheme".to_string(),
			enabled: true,
		},
	);

	for proxy in [
		ProxyData {
			id: "default".to_string(),
			direction: Direction::In,
			enabled: true,
			config: json!({"scheme": "http", "address": "localhost:8080"}),
		},
		ProxyData {
			id: "direct".to_string(),
			direction: Direction::Out,
			enabled: true,
			config: json!({"scheme": "direct"}),
		},
		ProxyData {
			id: "block".to_string(),
			direction: Direction::Out,
			enabled: true,
			config: json!({"scheme": "block"}),
		},
		ProxyData {
			id: "upstream".to_string(),
			direction: Direction::Out,
			enabled: true,
			config: json!({"scheme": "http", "address": "localhost:1087"}),
		},
	] {
		data.proxies.insert(proxy.id.clone(), proxy);
	}

	for (name, kind, pattern, outbounds, priority) in [
		("abroad", "geosite", "geolocation-!cn", vec!["upstream"], 0u32),
		("any", "any", "*", vec!["direct"], 1),
	] {
		data.next_rule_id += 1;
		data.rules.push(Rule {
			id: data.next_rule_id,
			name: name.to_string(),
			kind: kind.to_string(),
			pattern: pattern.to_string(),
			outbounds: outbounds.into_iter().map(String::from).collect(),
			priority,
			scheme_id: "default".to_string(),
		});
	}

	for group in ["admin", "default"] {
		data.groups.insert(
			group.to_string(),
			UserGroup {
				id: group.to_string(),
				route_scheme_id: "default".to_string(),
				avail_inbounds: ["default".to_string()].into(),
			},
		);
	}

	data.users.insert(
		"admin".to_string(),
		User {
			id: "admin".to_string(),
			password_hash: utils::sha256_hex(b"admin"),
			link_token: Some(utils::random_token(16)),
			email: "admin@example.com".to_string(),
			enabled: true,
			group_id: "admin".to_string(),
		},
	);

	data
}
