//! HTTP response cache, run over MITM-bridged client/server streams. One
//! `run_session` call services a whole keep-alive session: parse a request,
//! consult the index, serve / revalidate / forward, repeat.

pub mod http1;
mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use fluxgate_core::BoxedStream;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub use store::{CacheEntry, CacheIndex, sanitize_key};

use crate::utils::now_secs;
use http1::{BodyKind, Head};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Http(#[from] http1::Error),
	#[error(transparent)]
	Store(#[from] store::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheControl {
	pub max_age: Option<u64>,
	pub no_store: bool,
	pub no_cache: bool,
	pub public: bool,
	pub private: bool,
}

pub fn parse_cache_control(value: Option<&str>) -> CacheControl {
	let mut cc = CacheControl::default();
	let Some(value) = value else {
		return cc;
	};
	for part in value.split(',') {
		let part = part.trim();
		match part.to_ascii_lowercase().as_str() {
			"no-store" => cc.no_store = true,
			"no-cache" => cc.no_cache = true,
			"public" => cc.public = true,
			"private" => cc.private = true,
			other => {
				if let Some(age) = other.strip_prefix("max-age=") {
					cc.max_age = age.trim().parse().ok();
				}
			},
		}
	}
	cc
}

/// `METHOD:HOST:URL:VARY`. The vary component joins the request values of the
/// headers named by the `Vary` header with `|`; a wildcard collapses to the
/// literal `vary-*`.
pub fn cache_key(method: &str, host: &str, uri: &str, head: &Head) -> String {
	let vary = head.header("Vary").unwrap_or("");
	let vary_val = if vary == "*" {
		"vary-*".to_string()
	} else if vary.is_empty() {
		String::new()
	} else {
		vary
			.split(',')
			.map(|name| head.header(name.trim()).unwrap_or(""))
			.collect::<Vec<_>>()
			.join("|")
	};
	format!("{method}:{host}:{uri}:{vary_val}")
}

/// Secondary key form used by the 302 pre-check: the key a client following
/// the redirect would produce.
pub fn location_key(location: &str, current_host: &str) -> String {
	let (host, path) = match location.find("://") {
		Some(i) => {
			let rest = &location[i + 3..];
			match rest.find('/') {
				Some(j) => (&rest[..j], &rest[j..]),
				None => (rest, "/"),
			}
		},
		None => (current_host, location),
	};
	format!("GET:{host}:{path}:")
}

/// Start offset of a `Range: bytes=N-…` request, zero when absent or
/// unparsable.
pub fn range_start(head: &Head) -> u64 {
	let Some(range) = head.header("Range") else {
		return 0;
	};
	let Some(spec) = range.trim().strip_prefix("bytes=") else {
		return 0;
	};
	spec
		.split('-')
		.next()
		.and_then(|s| s.trim().parse().ok())
		.unwrap_or(0)
}

fn is_cachable(method: &str, resp_head: &Head) -> bool {
	if method != "GET" {
		return false;
	}
	let cc = parse_cache_control(resp_head.header("Cache-Control"));
	!cc.no_store && !cc.private
}

/// Rfc 7231 IMF-fixdate, i.e. rfc2822 with a symbolic GMT zone.
fn parse_http_date(value: &str) -> Option<u64> {
	let normalized = value.trim().replace("GMT", "+0000");
	let parsed = time::OffsetDateTime::parse(
		&normalized,
		&time::format_description::well_known::Rfc2822,
	)
	.ok()?;
	Some(parsed.unix_timestamp().max(0) as u64)
}

/// Freshness horizon: `max-age` wins, then `Expires`, then the configured
/// fallback.
fn expire_time(resp_head: &Head, now: u64, default_ttl: u64) -> u64 {
	let cc = parse_cache_control(resp_head.header("Cache-Control"));
	if let Some(age) = cc.max_age {
		return now + age;
	}
	if let Some(expires) = resp_head.header("Expires") {
		if let Some(t) = parse_http_date(expires) {
			return t;
		}
	}
	now + default_ttl
}

fn header_is_close(head: &Head) -> bool {
	head
		.header("Connection")
		.map(|v| v.eq_ignore_ascii_case("close"))
		.unwrap_or(false)
}

/// Original request head with the entry's validators spliced in.
fn conditional_head(head: &Head, entry: &CacheEntry) -> Vec<u8> {
	let text = String::from_utf8_lossy(&head.raw);
	let mut out = String::new();
	for (i, line) in text.split("\r\n").enumerate() {
		if line.is_empty() {
			continue;
		}
		if i > 0 {
			let name = line.split_once(':').map(|(n, _)| n.trim()).unwrap_or("");
			if name.eq_ignore_ascii_case("If-None-Match")
				|| name.eq_ignore_ascii_case("If-Modified-Since")
			{
				continue;
			}
		}
		out.push_str(line);
		out.push_str("\r\n");
	}
	if !entry.etag.is_empty() {
		out.push_str(&format!("If-None-Match: {}\r\n", entry.etag));
	}
	if !entry.last_modified.is_empty() {
		out.push_str(&format!("If-Modified-Since: {}\r\n", entry.last_modified));
	}
	out.push_str("\r\n");
	out.into_bytes()
}

/// Mirrors response bytes into the body file while they stream to the
/// client. A write failure downgrades gracefully: the tee goes dark, the
/// client keeps its bytes, and the partial file is removed at the end.
pub(crate) struct FileTee {
	file: Option<tokio::fs::File>,
	path: Option<PathBuf>,
	failed: bool,
}

impl FileTee {
	pub(crate) fn disabled() -> FileTee {
		FileTee {
			file: None,
			path: None,
			failed: false,
		}
	}

	pub(crate) async fn create(path: PathBuf) -> FileTee {
		match tokio::fs::File::create(&path).await {
			Ok(file) => FileTee {
				file: Some(file),
				path: Some(path),
				failed: false,
			},
			Err(e) => {
				warn!(path = %path.display(), error = %e, "cannot create cache body file");
				FileTee {
					file: None,
					path: Some(path),
					failed: true,
				}
			},
		}
	}

	pub(crate) async fn write(&mut self, bytes: &[u8]) {
		if let Some(file) = &mut self.file {
			if let Err(e) = file.write_all(bytes).await {
				warn!(error = %e, "cache body write failed, continuing uncached");
				self.failed = true;
				self.file = None;
			}
		}
	}

	/// Gives up on this body file and removes whatever was written.
	pub(crate) async fn abort(mut self) {
		self.failed = true;
		let _ = self.finish().await;
	}

	/// True when the body file was written completely.
	pub(crate) async fn finish(mut self) -> bool {
		let mut complete = self.file.is_some() && !self.failed;
		if let Some(mut file) = self.file.take() {
			if file.flush().await.is_err() {
				complete = false;
			}
		}
		if !complete {
			if let Some(path) = &self.path {
				let _ = tokio::fs::remove_file(path).await;
			}
		}
		complete
	}
}

pub struct HttpCache {
	index: CacheIndex,
	default_ttl: u64,
}

impl HttpCache {
	pub fn open(dir: &Path, capacity: usize, default_ttl: Duration) -> Result<HttpCache, Error> {
		Ok(HttpCache {
			index: CacheIndex::open(dir, capacity)?,
			default_ttl: default_ttl.as_secs(),
		})
	}

	pub fn index(&self) -> &CacheIndex {
		&self.index
	}

	/// Services one keep-alive session between a client and an origin. Ends
	/// on `Connection: close`, EOF, or a framing error.
	pub async fn run_session(
		&self,
		mut client: BoxedStream,
		mut server: BoxedStream,
		fallback_host: &str,
	) -> Result<(), Error> {
		loop {
			let raw = match http1::read_head(&mut client).await? {
				Some(raw) => raw,
				None => break,
			};
			let req = http1::parse_request(&raw)?;
			let host = req
				.head
				.header("Host")
				.unwrap_or(fallback_host)
				.to_string();
			let key = cache_key(&req.method, &host, &req.uri, &req.head);
			debug!(method = %req.method, %host, uri = %req.uri, "cache lookup");

			let range = range_start(&req.head);
			let mut connection_close = header_is_close(&req.head);
			let mut finished = false;

			if req.method == "GET" && range == 0 {
				if let Some(entry) = self.index.get(&key) {
					finished = self
						.serve_hit(
							&mut client,
							&mut server,
							&req,
							&host,
							&key,
							entry,
							&mut connection_close,
						)
						.await?;
				}
			}

			if !finished {
				// Miss, non-GET, or range bypass: forward the original request.
				server.write_all(&req.head.raw).await?;
				let mut no_tee = FileTee::disabled();
				http1::copy_body(
					&mut client,
					&mut server,
					&mut no_tee,
					http1::request_body_kind(&req.head),
				)
				.await?;

				let resp_raw = match http1::read_head(&mut server).await? {
					Some(raw) => raw,
					None => break,
				};
				let resp = http1::parse_response(&resp_raw)?;
				if header_is_close(&resp.head) {
					connection_close = true;
				}
				let body_kind = http1::response_body_kind(resp.status, &req.method, &resp.head);

				if range == 0 && is_cachable(&req.method, &resp.head) {
					self
						.store_response(&mut client, &mut server, &key, &resp, body_kind)
						.await?;
				} else {
					client.write_all(&resp.head.raw).await?;
					let mut no_tee = FileTee::disabled();
					http1::copy_body(&mut server, &mut client, &mut no_tee, body_kind).await?;
				}
				if body_kind == BodyKind::Eof {
					connection_close = true;
				}
			}

			if connection_close {
				break;
			}
		}
		Ok(())
	}

	/// Handles a GET with an index entry. Returns false when the caller
	/// should fall back to the plain miss path.
	#[allow(clippy::too_many_arguments)]
	async fn serve_hit(
		&self,
		client: &mut BoxedStream,
		server: &mut BoxedStream,
		req: &http1::Request,
		host: &str,
		key: &str,
		entry: CacheEntry,
		connection_close: &mut bool,
	) -> Result<bool, Error> {
		let now = now_secs();
		let req_cc = parse_cache_control(req.head.header("Cache-Control"));
		if entry.is_fresh(now) && !req_cc.no_cache {
			if self.serve_from_file(client, &entry).await? {
				info!(%key, "served from cache");
				return Ok(true);
			}
			self.index.remove(key);
			return Ok(false);
		}

		// Stale (or the client insists): revalidate against the origin.
		let cond = conditional_head(&req.head, &entry);
		server.write_all(&cond).await?;
		let resp_raw = match http1::read_head(server).await? {
			Some(raw) => raw,
			None => {
				*connection_close = true;
				return Ok(true);
			},
		};
		let resp = http1::parse_response(&resp_raw)?;
		if header_is_close(&resp.head) {
			*connection_close = true;
		}

		match resp.status {
			304 => {
				if self.serve_from_file(client, &entry).await? {
					let mut refreshed = entry;
					refreshed.expire_time = expire_time(&resp.head, now, self.default_ttl);
					if let Err(e) = self.index.put(key, refreshed) {
						warn!(%key, error = %e, "cannot refresh cache metadata");
					}
					info!(%key, "304 revalidated, refreshed freshness");
					Ok(true)
				} else {
					self.index.remove(key);
					Ok(false)
				}
			},
			200 => {
				info!(%key, "200 on revalidation, replacing cache entry");
				let body_kind = http1::response_body_kind(200, &req.method, &resp.head);
				self.store_response(client, server, key, &resp, body_kind).await?;
				if body_kind == BodyKind::Eof {
					*connection_close = true;
				}
				Ok(true)
			},
			302 => {
				let body_kind = http1::response_body_kind(302, &req.method, &resp.head);
				if let Some(location) = self.cached_302_location(&entry).await {
					let redirect_key = location_key(&location, host);
					if self.index.contains(&redirect_key)
						&& self.serve_from_file(client, &entry).await?
					{
						info!(%key, %location, "302 served from cache");
						// The fresh 302's body still has to leave the wire.
						let mut sink = tokio::io::sink();
						let mut no_tee = FileTee::disabled();
						http1::copy_body(server, &mut sink, &mut no_tee, body_kind).await?;
						return Ok(true);
					}
				}
				// The stored entry cannot be replayed; it is evicted and the
				// live response goes through uncached.
				self.index.remove(key);
				client.write_all(&resp.head.raw).await?;
				let mut no_tee = FileTee::disabled();
				http1::copy_body(server, client, &mut no_tee, body_kind).await?;
				if body_kind == BodyKind::Eof {
					*connection_close = true;
				}
				Ok(true)
			},
			status => {
				debug!(%key, status, "revalidation got an uncachable status, forwarding");
				client.write_all(&resp.head.raw).await?;
				let body_kind = http1::response_body_kind(status, &req.method, &resp.head);
				let mut no_tee = FileTee::disabled();
				http1::copy_body(server, client, &mut no_tee, body_kind).await?;
				if body_kind == BodyKind::Eof {
					*connection_close = true;
				}
				Ok(true)
			},
		}
	}

	/// Streams head and body to the client while teeing into a fresh body
	/// file; metadata lands in the index only if the file was fully written.
	async fn store_response(
		&self,
		client: &mut BoxedStream,
		server: &mut BoxedStream,
		key: &str,
		resp: &http1::Response,
		body_kind: BodyKind,
	) -> Result<(), Error> {
		let body_path = self.index.body_path_for_key(key);
		let _ = tokio::fs::remove_file(&body_path).await;
		let mut tee = FileTee::create(body_path).await;

		if let Err(e) = client.write_all(&resp.head.raw).await {
			tee.abort().await;
			return Err(e.into());
		}
		tee.write(&resp.head.raw).await;
		if let Err(e) = http1::copy_body(server, client, &mut tee, body_kind).await {
			tee.abort().await;
			return Err(e.into());
		}

		if tee.finish().await {
			let now = now_secs();
			let entry = CacheEntry {
				body_file: sanitize_key(key),
				etag: resp.head.header("ETag").unwrap_or("").to_string(),
				last_modified: resp.head.header("Last-Modified").unwrap_or("").to_string(),
				expire_time: expire_time(&resp.head, now, self.default_ttl),
			};
			if let Err(e) = self.index.put(key, entry) {
				warn!(%key, error = %e, "cannot store cache metadata");
			}
		}
		Ok(())
	}

	/// Replays the stored response bytes. False means the body file could not
	/// be opened and the entry should be treated as a miss.
	async fn serve_from_file(
		&self,
		client: &mut BoxedStream,
		entry: &CacheEntry,
	) -> Result<bool, Error> {
		let path = self.index.body_path(entry);
		match tokio::fs::File::open(&path).await {
			Ok(mut file) => {
				tokio::io::copy(&mut file, client).await?;
				client.flush().await?;
				Ok(true)
			},
			Err(e) => {
				warn!(path = %path.display(), error = %e, "cache body file unreadable");
				Ok(false)
			},
		}
	}

	/// The `Location` of the stored response, when that response is a 302.
	async fn cached_302_location(&self, entry: &CacheEntry) -> Option<String> {
		let raw = tokio::fs::read(self.index.body_path(entry)).await.ok()?;
		let head_end = raw
			.windows(4)
			.position(|w| w == b"\r\n\r\n")
			.map(|i| i + 4)?;
		let resp = http1::parse_response(&raw[..head_end]).ok()?;
		if resp.status != 302 {
			return None;
		}
		resp.head.header("Location").map(str::to_string)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn head_of(raw: &[u8]) -> Head {
		http1::parse_request(raw).unwrap().head
	}

	#[test]
	fn key_includes_vary_values() {
		let head = head_of(
			b"GET /y HTTP/1.1\r\nHost: x\r\nVary: Accept-Encoding, User-Agent\r\nAccept-Encoding: gzip\r\nUser-Agent: curl\r\n\r\n",
		);
		assert_eq!(cache_key("GET", "x", "/y", &head), "GET:x:/y:gzip|curl");

		let wildcard = head_of(b"GET /y HTTP/1.1\r\nHost: x\r\nVary: *\r\n\r\n");
		assert_eq!(cache_key("GET", "x", "/y", &wildcard), "GET:x:/y:vary-*");

		let plain = head_of(b"GET /y HTTP/1.1\r\nHost: x\r\n\r\n");
		assert_eq!(cache_key("GET", "x", "/y", &plain), "GET:x:/y:");
	}

	#[test]
	fn location_key_forms() {
		assert_eq!(location_key("https://x/y?q=1", "ignored"), "GET:x:/y?q=1:");
		assert_eq!(location_key("/moved", "x"), "GET:x:/moved:");
		assert_eq!(location_key("https://other.example", "x"), "GET:other.example:/:");
	}

	#[test]
	fn cache_control_parsing() {
		let cc = parse_cache_control(Some("public, max-age=3600"));
		assert_eq!(cc.max_age, Some(3600));
		assert!(cc.public && !cc.private && !cc.no_store);

		let cc = parse_cache_control(Some("no-store, no-cache"));
		assert!(cc.no_store && cc.no_cache);

		assert_eq!(parse_cache_control(None), CacheControl::default());
	}

	#[test]
	fn range_start_parsing() {
		assert_eq!(range_start(&head_of(b"GET / HTTP/1.1\r\nRange: bytes=100-\r\n\r\n")), 100);
		assert_eq!(range_start(&head_of(b"GET / HTTP/1.1\r\nRange: bytes=0-99\r\n\r\n")), 0);
		assert_eq!(range_start(&head_of(b"GET / HTTP/1.1\r\n\r\n")), 0);
	}

	#[test]
	fn expire_time_precedence() {
		let now = 1_000_000;
		let max_age =
			http1::parse_response(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=120\r\n\r\n").unwrap();
		assert_eq!(expire_time(&max_age.head, now, 60), now + 120);

		let expires = http1::parse_response(
			b"HTTP/1.1 200 OK\r\nExpires: Thu, 01 Jan 2026 00:00:00 GMT\r\n\r\n",
		)
		.unwrap();
		assert_eq!(expire_time(&expires.head, now, 60), 1_767_225_600);

		let bare = http1::parse_response(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
		assert_eq!(expire_time(&bare.head, now, 60), now + 60);
	}

	#[test]
	fn conditional_head_carries_validators() {
		let head = head_of(b"GET /y HTTP/1.1\r\nHost: x\r\nIf-None-Match: stale\r\n\r\n");
		let entry = CacheEntry {
			body_file: "f".into(),
			etag: "\"A\"".into(),
			last_modified: "Mon, 01 Jan 2024 00:00:00 GMT".into(),
			expire_time: 0,
		};
		let cond = String::from_utf8(conditional_head(&head, &entry)).unwrap();
		assert!(cond.contains("If-None-Match: \"A\"\r\n"));
		assert!(cond.contains("If-Modified-Since: Mon, 01 Jan 2024 00:00:00 GMT\r\n"));
		assert!(!cond.contains("stale"));
		assert!(cond.ends_with("\r\n\r\n"));
	}

	// Session-level behavior is covered in tests/cache_flow.rs with real
	// stream pairs.
}
