//! Append-only traffic statistics, one JSONL row per completed connection.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Direction, Error};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
	pub inbound_id: String,
	pub outbound_id: String,
	pub user_id: String,
	pub dest_addr: String,
	pub bytes_in: u64,
	pub bytes_out: u64,
	/// Unix seconds.
	pub time: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RankEntry {
	pub name: String,
	pub download: u64,
	pub upload: u64,
	pub traffic: u64,
}

pub struct TrafficStore {
	path: PathBuf,
	records: Mutex<Vec<TrafficRecord>>,
}

impl TrafficStore {
	pub fn open(path: &Path) -> Result<Self, Error> {
		if let Some(dir) = path.parent() {
			if !dir.as_os_str().is_empty() {
				fs::create_dir_all(dir)?;
			}
		}
		let mut records = Vec::new();
		match fs::read_to_string(path) {
			Ok(raw) => {
				for line in raw.lines().filter(|l| !l.trim().is_empty()) {
					match serde_json::from_str::<TrafficRecord>(line) {
						Ok(rec) => records.push(rec),
						Err(e) => warn!(error = %e, "skipping malformed traffic row"),
					}
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
			Err(e) => return Err(e.into()),
		}
		Ok(TrafficStore {
			path: path.to_path_buf(),
			records: Mutex::new(records),
		})
	}

	pub fn create(&self, record: TrafficRecord) -> Result<(), Error> {
		let mut records = self.records.lock();
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)?;
		let mut line = serde_json::to_string(&record)?;
		line.push('\n');
		file.write_all(line.as_bytes())?;
		records.push(record);
		Ok(())
	}

	/// Drops every record older than `before` (unix seconds) and rewrites the
	/// backing file.
	pub fn clean_before(&self, before: u64) -> Result<usize, Error> {
		let mut records = self.records.lock();
		let old = records.len();
		records.retain(|r| r.time >= before);
		let removed = old - records.len();
		if removed > 0 {
			let mut out = String::new();
			for rec in records.iter() {
				out.push_str(&serde_json::to_string(rec)?);
				out.push('\n');
			}
			fs::write(&self.path, out)?;
		}
		Ok(removed)
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.lock().is_empty()
	}

	/// Total (download, upload) within `[start, end]`.
	pub fn get_stats(&self, start: u64, end: u64) -> (u64, u64) {
		let records = self.records.lock();
		records
			.iter()
			.filter(|r| r.time >= start && r.time <= end)
			.fold((0, 0), |(i, o), r| (i + r.bytes_in, o + r.bytes_out))
	}

	pub fn rank_by_user(&self, start: u64, end: u64) -> Vec<RankEntry> {
		let records = self.records.lock();
		rank(
			records
				.iter()
				.filter(|r| r.time >= start && r.time <= end)
				.map(|r| (r.user_id.clone(), r.bytes_in, r.bytes_out)),
		)
	}

	pub fn rank_by_proxy(&self, direction: Direction, start: u64, end: u64) -> Vec<RankEntry> {
		let records = self.records.lock();
		rank(
			records
				.iter()
				.filter(|r| r.time >= start && r.time <= end)
				.map(|r| {
					let name = match direction {
						Direction::In => r.inbound_id.clone(),
						Direction::Out => r.outbound_id.clone(),
					};
					(name, r.bytes_in, r.bytes_out)
				}),
		)
	}
}

fn rank(rows: impl Iterator<Item = (String, u64, u64)>) -> Vec<RankEntry> {
	let mut sums: BTreeMap<String, (u64, u64)> = BTreeMap::new();
	for (name, bytes_in, bytes_out) in rows {
		let entry = sums.entry(name).or_default();
		entry.0 += bytes_in;
		entry.1 += bytes_out;
	}
	let mut out: Vec<RankEntry> = sums
		.into_iter()
		.map(|(name, (download, upload))| RankEntry {
			name,
			download,
			upload,
			traffic: download + upload,
		})
		.collect();
	out.sort_by(|a, b| b.traffic.cmp(&a.traffic));
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(user: &str, time: u64, bytes_in: u64, bytes_out: u64) -> TrafficRecord {
		TrafficRecord {
			inbound_id: "default".into(),
			outbound_id: "direct".into(),
			user_id: user.into(),
			dest_addr: "example.com:443".into(),
			bytes_in,
			bytes_out,
			time,
		}
	}

	#[test]
	fn stats_and_ranks() {
		let dir = tempfile::tempdir().unwrap();
		let store = TrafficStore::open(&dir.path().join("traffic.jsonl")).unwrap();
		store.create(record("alice", 100, 10, 1)).unwrap();
		store.create(record("bob", 150, 100, 5)).unwrap();
		store.create(record("alice", 200, 30, 2)).unwrap();

		assert_eq!(store.get_stats(0, 1000), (140, 8));
		assert_eq!(store.get_stats(120, 1000), (130, 7));

		let ranks = store.rank_by_user(0, 1000);
		assert_eq!(ranks[0].name, "bob");
		assert_eq!(ranks[0].traffic, 105);
		assert_eq!(ranks[1].name, "alice");
		assert_eq!(ranks[1].download, 40);
	}

	#[test]
	fn clean_trims_and_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("traffic.jsonl");
		{
			let store = TrafficStore::open(&path).unwrap();
			store.create(record("alice", 100, 1, 1)).unwrap();
			store.create(record("alice", 300, 1, 1)).unwrap();
			assert_eq!(store.clean_before(200).unwrap(), 1);
		}
		let store = TrafficStore::open(&path).unwrap();
		assert_eq!(store.len(), 1);
		assert_eq!(store.get_stats(0, 1000), (1, 1));
	}
}
