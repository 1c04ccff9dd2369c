//! Cache metadata index: key → serialized entry, LRU-bounded. Evicting a key
//! removes its metadata record and its on-disk body file, keeping the index
//! and the `file_cache` directory eventually consistent.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("cache capacity must be non-zero")]
	ZeroCapacity,
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub body_file: String,
	#[serde(default)]
	pub etag: String,
	#[serde(default)]
	pub last_modified: String,
	/// Unix seconds.
	pub expire_time: u64,
}

impl CacheEntry {
	pub fn is_fresh(&self, now: u64) -> bool {
		now < self.expire_time
	}
}

/// Body files are named after their key, squeezed into a filesystem-safe
/// alphabet.
pub fn sanitize_key(key: &str) -> String {
	key
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
				c
			} else {
				'_'
			}
		})
		.collect()
}

pub struct CacheIndex {
	meta_dir: PathBuf,
	body_dir: PathBuf,
	lru: Mutex<LruCache<String, ()>>,
}

impl CacheIndex {
	pub fn open(dir: &Path, capacity: usize) -> Result<CacheIndex, Error> {
		let capacity = NonZeroUsize::new(capacity).ok_or(Error::ZeroCapacity)?;
		let meta_dir = dir.join("meta");
		let body_dir = dir.join("file_cache");
		fs::create_dir_all(&meta_dir)?;
		fs::create_dir_all(&body_dir)?;

		let mut lru = LruCache::new(capacity);
		for entry in fs::read_dir(&meta_dir)? {
			let entry = entry?;
			if let Ok(raw) = fs::read(entry.path()) {
				if let Ok(meta) = serde_json::from_slice::<StoredEntry>(&raw) {
					lru.push(meta.key, ());
				}
			}
		}
		debug!(entries = lru.len(), "cache index loaded");
		Ok(CacheIndex {
			meta_dir,
			body_dir,
			lru: Mutex::new(lru),
		})
	}

	pub fn body_path(&self, entry: &CacheEntry) -> PathBuf {
		self.body_dir.join(&entry.body_file)
	}

	pub fn body_path_for_key(&self, key: &str) -> PathBuf {
		self.body_dir.join(sanitize_key(key))
	}

	fn meta_path(&self, key: &str) -> PathBuf {
		self.meta_dir.join(format!("{}.json", sanitize_key(key)))
	}

	pub fn len(&self) -> usize {
		self.lru.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lru.lock().is_empty()
	}

	/// Lookup without promising anything about freshness. A key present in
	/// the LRU whose metadata is missing or undecodable is dropped on the
	/// spot and reported as a miss.
	pub fn get(&self, key: &str) -> Option<CacheEntry> {
		{
			let mut lru = self.lru.lock();
			lru.get(key)?;
		}
		match fs::read(self.meta_path(key)) {
			Ok(raw) => match serde_json::from_slice::<StoredEntry>(&raw) {
				Ok(stored) => Some(stored.entry),
				Err(e) => {
					warn!(%key, error = %e, "evicting undecodable cache metadata");
					self.remove(key);
					None
				},
			},
			Err(_) => {
				self.lru.lock().pop(key);
				None
			},
		}
	}

	pub fn contains(&self, key: &str) -> bool {
		self.lru.lock().contains(key)
	}

	pub fn put(&self, key: &str, entry: CacheEntry) -> Result<(), Error> {
		let stored = StoredEntry {
			key: key.to_string(),
			entry,
		};
		fs::write(self.meta_path(key), serde_json::to_vec(&stored)?)?;
		let evicted = self.lru.lock().push(key.to_string(), ());
		if let Some((old_key, ())) = evicted {
			if old_key != key {
				debug!(key = %old_key, "cache capacity reached, evicting");
				self.remove_files(&old_key);
			}
		}
		Ok(())
	}

	pub fn remove(&self, key: &str) {
		self.lru.lock().pop(key);
		self.remove_files(key);
	}

	fn remove_files(&self, key: &str) {
		let _ = fs::remove_file(self.meta_path(key));
		let _ = fs::remove_file(self.body_dir.join(sanitize_key(key)));
	}
}

/// Metadata rows carry their own key so the index can be rebuilt from a
/// directory scan.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
	key: String,
	entry: CacheEntry,
}
