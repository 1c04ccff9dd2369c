//! Persistent data model: users, groups, routing schemes, proxy descriptors
//! and the singleton system record. The runtime never reads these directly on
//! the data path; the supervisor syncs snapshots out of here after writes.

mod defaults;
pub mod traffic;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use traffic::{RankEntry, TrafficRecord, TrafficStore};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("{0} not found: {1}")]
	NotFound(&'static str, String),
	#[error("{0} already exists: {1}")]
	AlreadyExists(&'static str, String),
	#[error("cannot delete user group {0} while it has members")]
	GroupNotEmpty(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
	#[serde(rename = "in")]
	In,
	#[serde(rename = "out")]
	Out,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
	pub name: String,
	pub description: String,
	pub traffic_record_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
	pub id: String,
	/// sha256 hex digest of the password.
	pub password_hash: String,
	#[serde(default)]
	pub link_token: Option<String>,
	pub email: String,
	pub enabled: bool,
	pub group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
	pub id: String,
	pub route_scheme_id: String,
	#[serde(default)]
	pub avail_inbounds: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyData {
	pub id: String,
	pub direction: Direction,
	pub enabled: bool,
	pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteScheme {
	pub id: String,
	pub description: String,
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
	pub id: u64,
	pub name: String,
	#[serde(rename = "type")]
	pub kind: String,
	pub pattern: String,
	pub outbounds: Vec<String>,
	pub priority: u32,
	pub scheme_id: String,
}

/// A scheme joined with its rules, already in evaluation order: ascending
/// priority, insertion order breaking ties.
#[derive(Debug, Clone)]
pub struct RouteSchemeDetail {
	pub scheme: RouteScheme,
	pub rules: Vec<Rule>,
}

/// A group joined with its member ids and governing scheme.
#[derive(Debug, Clone)]
pub struct UserGroupDetail {
	pub group: UserGroup,
	pub members: Vec<String>,
	pub scheme: Option<RouteScheme>,
}

/// Explicit field-by-field patches replace whole-record overwrites.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
	pub password_hash: Option<String>,
	pub link_token: Option<Option<String>>,
	pub email: Option<String>,
	pub enabled: Option<bool>,
	pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyDataPatch {
	pub enabled: Option<bool>,
	pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfoPatch {
	pub name: Option<String>,
	pub description: Option<String>,
	pub traffic_record_days: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Data {
	system: Option<SystemInfo>,
	users: BTreeMap<String, User>,
	groups: BTreeMap<String, UserGroup>,
	schemes: BTreeMap<String, RouteScheme>,
	rules: Vec<Rule>,
	next_rule_id: u64,
	proxies: BTreeMap<String, ProxyData>,
}

/// The system store. A single JSON document on disk, snapshot reads under a
/// shared lock, every mutation rewritten through [`Repo::flush`].
pub struct Repo {
	path: PathBuf,
	data: RwLock<Data>,
}

impl Repo {
	/// Opens the store, seeding default data when the file does not exist yet.
	/// The boolean reports whether the store was newly created.
	pub fn open(path: &Path) -> Result<(Self, bool), Error> {
		if let Some(dir) = path.parent() {
			if !dir.as_os_str().is_empty() {
				fs::create_dir_all(dir)?;
			}
		}
		let (data, is_new) = match fs::read(path) {
			Ok(raw) => (serde_json::from_slice(&raw)?, false),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!(path = %path.display(), "creating new system store");
				(defaults::seed(), true)
			},
			Err(e) => return Err(e.into()),
		};
		let repo = Repo {
			path: path.to_path_buf(),
			data: RwLock::new(data),
		};
		if is_new {
			repo.flush()?;
		}
		Ok((repo, is_new))
	}

	fn flush(&self) -> Result<(), Error> {
		let raw = serde_json::to_vec_pretty(&*self.data.read())?;
		fs::write(&self.path, raw)?;
		Ok(())
	}

	// System info

	pub fn system_info(&self) -> SystemInfo {
		self
			.data
			.read()
			.system
			.clone()
			.unwrap_or_else(defaults::system_info)
	}

	pub fn update_system_info(&self, patch: SystemInfoPatch) -> Result<SystemInfo, Error> {
		{
			let mut data = self.data.write();
			let mut info = data.system.clone().unwrap_or_else(defaults::system_info);
			if let Some(name) = patch.name {
				info.name = name;
			}
			if let Some(description) = patch.description {
				info.description = description;
			}
			if let Some(days) = patch.traffic_record_days {
				info.traffic_record_days = days;
			}
			data.system = Some(info);
		}
		self.flush()?;
		Ok(self.system_info())
	}

	// Users

	pub fn user_by_id(&self, id: &str) -> Option<User> {
		self.data.read().users.get(id).cloned()
	}

	pub fn user_list(&self) -> Vec<User> {
		self.data.read().users.values().cloned().collect()
	}

	pub fn create_user(&self, user: User) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if data.users.contains_key(&user.id) {
				return Err(Error::AlreadyExists("user", user.id));
			}
			if !data.groups.contains_key(&user.group_id) {
				return Err(Error::NotFound("user group", user.group_id));
			}
			data.users.insert(user.id.clone(), user);
		}
		self.flush()
	}

	pub fn update_user(&self, id: &str, patch: UserPatch) -> Result<User, Error> {
		let updated = {
			let mut data = self.data.write();
			if let Some(group_id) = &patch.group_id {
				if !data.groups.contains_key(group_id) {
					return Err(Error::NotFound("user group", group_id.clone()));
				}
			}
			let user = data
				.users
				.get_mut(id)
				.ok_or_else(|| Error::NotFound("user", id.to_string()))?;
			if let Some(hash) = patch.password_hash {
				user.password_hash = hash;
			}
			if let Some(token) = patch.link_token {
				user.link_token = token;
			}
			if let Some(email) = patch.email {
				user.email = email;
			}
			if let Some(enabled) = patch.enabled {
				user.enabled = enabled;
			}
			if let Some(group_id) = patch.group_id {
				user.group_id = group_id;
			}
			user.clone()
		};
		self.flush()?;
		Ok(updated)
	}

	pub fn delete_user(&self, id: &str) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			data
				.users
				.remove(id)
				.ok_or_else(|| Error::NotFound("user", id.to_string()))?;
		}
		self.flush()
	}

	// User groups

	pub fn group_by_id(&self, id: &str) -> Option<UserGroup> {
		self.data.read().groups.get(id).cloned()
	}

	pub fn group_detail(&self, id: &str) -> Option<UserGroupDetail> {
		let data = self.data.read();
		let group = data.groups.get(id)?.clone();
		let members = data
			.users
			.values()
			.filter(|u| u.group_id == id)
			.map(|u| u.id.clone())
			.collect();
		let scheme = data.schemes.get(&group.route_scheme_id).cloned();
		Some(UserGroupDetail {
			group,
			members,
			scheme,
		})
	}

	pub fn group_list(&self) -> Vec<UserGroup> {
		self.data.read().groups.values().cloned().collect()
	}

	pub fn create_group(&self, group: UserGroup) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if data.groups.contains_key(&group.id) {
				return Err(Error::AlreadyExists("user group", group.id));
			}
			data.groups.insert(group.id.clone(), group);
		}
		self.flush()
	}

	/// Deleting a group requires that no user still belongs to it. Its inbound
	/// associations are cleared as part of the delete.
	pub fn delete_group(&self, id: &str) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if !data.groups.contains_key(id) {
				return Err(Error::NotFound("user group", id.to_string()));
			}
			if data.users.values().any(|u| u.group_id == id) {
				return Err(Error::GroupNotEmpty(id.to_string()));
			}
			data.groups.remove(id);
		}
		self.flush()
	}

	pub fn set_group_inbounds(&self, id: &str, inbounds: BTreeSet<String>) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			let group = data
				.groups
				.get_mut(id)
				.ok_or_else(|| Error::NotFound("user group", id.to_string()))?;
			group.avail_inbounds = inbounds;
		}
		self.flush()
	}

	// Route schemes and rules

	pub fn scheme_by_id(&self, id: &str) -> Option<RouteSchemeDetail> {
		let data = self.data.read();
		let scheme = data.schemes.get(id)?.clone();
		let mut rules: Vec<Rule> = data
			.rules
			.iter()
			.filter(|r| r.scheme_id == id)
			.cloned()
			.collect();
		rules.sort_by_key(|r| r.priority);
		Some(RouteSchemeDetail { scheme, rules })
	}

	pub fn scheme_list(&self) -> Vec<RouteScheme> {
		self.data.read().schemes.values().cloned().collect()
	}

	pub fn create_scheme(&self, scheme: RouteScheme) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if data.schemes.contains_key(&scheme.id) {
				return Err(Error::AlreadyExists("route scheme", scheme.id));
			}
			data.schemes.insert(scheme.id.clone(), scheme);
		}
		self.flush()
	}

	pub fn set_scheme_enabled(&self, id: &str, enabled: bool) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			let scheme = data
				.schemes
				.get_mut(id)
				.ok_or_else(|| Error::NotFound("route scheme", id.to_string()))?;
			scheme.enabled = enabled;
		}
		self.flush()
	}

	pub fn delete_scheme(&self, id: &str) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if !data.schemes.contains_key(id) {
				return Err(Error::NotFound("route scheme", id.to_string()));
			}
			data.schemes.remove(id);
			data.rules.retain(|r| r.scheme_id != id);
		}
		self.flush()
	}

	pub fn add_rule(&self, mut rule: Rule) -> Result<Rule, Error> {
		let created = {
			let mut data = self.data.write();
			if !data.schemes.contains_key(&rule.scheme_id) {
				return Err(Error::NotFound("route scheme", rule.scheme_id));
			}
			data.next_rule_id += 1;
			rule.id = data.next_rule_id;
			data.rules.push(rule.clone());
			rule
		};
		self.flush()?;
		Ok(created)
	}

	pub fn delete_rule(&self, id: u64) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			let before = data.rules.len();
			data.rules.retain(|r| r.id != id);
			if data.rules.len() == before {
				return Err(Error::NotFound("rule", id.to_string()));
			}
		}
		self.flush()
	}

	// Proxy descriptors

	pub fn proxy_by_id(&self, id: &str) -> Option<ProxyData> {
		self.data.read().proxies.get(id).cloned()
	}

	pub fn proxy_list(&self, direction: Direction) -> Vec<ProxyData> {
		self
			.data
			.read()
			.proxies
			.values()
			.filter(|p| p.direction == direction)
			.cloned()
			.collect()
	}

	pub fn create_proxy(&self, proxy: ProxyData) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			if data.proxies.contains_key(&proxy.id) {
				return Err(Error::AlreadyExists("proxy", proxy.id));
			}
			data.proxies.insert(proxy.id.clone(), proxy);
		}
		self.flush()
	}

	/// Direction is immutable after creation; only `enabled` and `config`
	/// can change.
	pub fn update_proxy(&self, id: &str, patch: ProxyDataPatch) -> Result<ProxyData, Error> {
		let updated = {
			let mut data = self.data.write();
			let proxy = data
				.proxies
				.get_mut(id)
				.ok_or_else(|| Error::NotFound("proxy", id.to_string()))?;
			if let Some(enabled) = patch.enabled {
				proxy.enabled = enabled;
			}
			if let Some(config) = patch.config {
				proxy.config = config;
			}
			proxy.clone()
		};
		self.flush()?;
		Ok(updated)
	}

	/// Deleting a descriptor clears every policy cross-reference to it: group
	/// inbound associations and rule outbound lists.
	pub fn delete_proxy(&self, id: &str) -> Result<(), Error> {
		{
			let mut data = self.data.write();
			data
				.proxies
				.remove(id)
				.ok_or_else(|| Error::NotFound("proxy", id.to_string()))?;
			for group in data.groups.values_mut() {
				group.avail_inbounds.remove(id);
			}
			for rule in data.rules.iter_mut() {
				rule.outbounds.retain(|o| o != id);
			}
		}
		self.flush()
	}
}
