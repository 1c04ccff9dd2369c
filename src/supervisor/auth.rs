//! Proxy-layer authentication: a `linkToken` header (or URL token) wins,
//! username/password is the fallback, anything else is a guest. The password
//! credential on the wire is the sha256 hex digest itself and is compared
//! literally against the stored value.

use std::collections::HashMap;

use crate::proxy::GUEST_USER;
use crate::router::PolicyTables;

pub fn authenticate(tables: &PolicyTables, headers: &HashMap<String, String>) -> String {
	if let Some(token) = headers.get("linkToken") {
		if !token.is_empty() {
			if let Some(user) = tables.user_by_token(token) {
				if user.enabled {
					return user.id;
				}
			}
		}
	}
	if let (Some(username), Some(password)) = (headers.get("username"), headers.get("password")) {
		if let Some(user) = tables.user(username) {
			if user.enabled && !user.password_hash.is_empty() && user.password_hash == *password {
				return user.id;
			}
		}
	}
	GUEST_USER.to_string()
}
