//! Just enough HTTP/1.1 to run the cache's request loop over raw MITM-bridged
//! streams: head reading, httparse-backed parsing, and body framing with an
//! optional tee towards the body store.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::FileTee;

const MAX_HEAD: usize = 64 * 1024;
const COPY_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	#[error("malformed http head: {0}")]
	Parse(#[from] httparse::Error),
	#[error("truncated http head")]
	Truncated,
	#[error("http head too large")]
	TooLarge,
	#[error("bad chunked framing")]
	BadChunk,
}

#[derive(Debug, Clone)]
pub struct Head {
	/// Exact head bytes, including the terminating blank line.
	pub raw: Vec<u8>,
	pub headers: Vec<(String, String)>,
}

impl Head {
	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct Request {
	pub method: String,
	pub uri: String,
	pub head: Head,
}

#[derive(Debug, Clone)]
pub struct Response {
	pub status: u16,
	pub head: Head,
}

/// Reads one head off the stream. `Ok(None)` means a clean EOF before any
/// byte, i.e. the peer is done with the session.
pub async fn read_head(
	stream: &mut (impl AsyncRead + Unpin),
) -> Result<Option<Vec<u8>>, Error> {
	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return if buf.is_empty() {
				Ok(None)
			} else {
				Err(Error::Truncated)
			};
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			return Ok(Some(buf));
		}
		if buf.len() > MAX_HEAD {
			return Err(Error::TooLarge);
		}
	}
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
	headers
		.iter()
		.map(|h| {
			(
				h.name.to_string(),
				String::from_utf8_lossy(h.value).into_owned(),
			)
		})
		.collect()
}

pub fn parse_request(raw: &[u8]) -> Result<Request, Error> {
	let mut headers = [httparse::EMPTY_HEADER; 64];
	let mut req = httparse::Request::new(&mut headers);
	match req.parse(raw)? {
		httparse::Status::Complete(_) => {},
		httparse::Status::Partial => return Err(Error::Truncated),
	}
	Ok(Request {
		method: req.method.unwrap_or("").to_string(),
		uri: req.path.unwrap_or("").to_string(),
		head: Head {
			raw: raw.to_vec(),
			headers: collect_headers(req.headers),
		},
	})
}

pub fn parse_response(raw: &[u8]) -> Result<Response, Error> {
	let mut headers = [httparse::EMPTY_HEADER; 64];
	let mut resp = httparse::Response::new(&mut headers);
	match resp.parse(raw)? {
		httparse::Status::Complete(_) => {},
		httparse::Status::Partial => return Err(Error::Truncated),
	}
	Ok(Response {
		status: resp.code.unwrap_or(0),
		head: Head {
			raw: raw.to_vec(),
			headers: collect_headers(resp.headers),
		},
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
	None,
	Length(u64),
	Chunked,
	/// Delimited only by connection close.
	Eof,
}

pub fn request_body_kind(head: &Head) -> BodyKind {
	if let Some(te) = head.header("Transfer-Encoding") {
		if te.to_ascii_lowercase().contains("chunked") {
			return BodyKind::Chunked;
		}
	}
	match head.header("Content-Length").and_then(|v| v.trim().parse::<u64>().ok()) {
		Some(0) | None => BodyKind::None,
		Some(n) => BodyKind::Length(n),
	}
}

pub fn response_body_kind(status: u16, request_method: &str, head: &Head) -> BodyKind {
	if request_method == "HEAD"
		|| status == 204
		|| status == 304
		|| (100..200).contains(&status)
	{
		return BodyKind::None;
	}
	if let Some(te) = head.header("Transfer-Encoding") {
		if te.to_ascii_lowercase().contains("chunked") {
			return BodyKind::Chunked;
		}
	}
	match head.header("Content-Length").and_then(|v| v.trim().parse::<u64>().ok()) {
		Some(n) => BodyKind::Length(n),
		None => BodyKind::Eof,
	}
}

async fn forward<W: AsyncWrite + Unpin>(
	sink: &mut W,
	tee: &mut FileTee,
	bytes: &[u8],
) -> io::Result<()> {
	sink.write_all(bytes).await?;
	tee.write(bytes).await;
	Ok(())
}

async fn read_crlf_line(
	reader: &mut (impl AsyncRead + Unpin),
) -> Result<Vec<u8>, Error> {
	let mut line = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		if reader.read(&mut byte).await? == 0 {
			return Err(Error::BadChunk);
		}
		line.push(byte[0]);
		if line.ends_with(b"\r\n") {
			return Ok(line);
		}
		if line.len() > MAX_HEAD {
			return Err(Error::BadChunk);
		}
	}
}

/// Streams one message body from `reader` to `sink`, mirroring every byte
/// into `tee`. The bytes pass through verbatim, chunked framing included.
pub async fn copy_body<R, W>(
	reader: &mut R,
	sink: &mut W,
	tee: &mut FileTee,
	kind: BodyKind,
) -> Result<u64, Error>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut total = 0u64;
	match kind {
		BodyKind::None => {},
		BodyKind::Length(mut remaining) => {
			let mut buf = [0u8; COPY_CHUNK];
			while remaining > 0 {
				let want = remaining.min(COPY_CHUNK as u64) as usize;
				let n = reader.read(&mut buf[..want]).await?;
				if n == 0 {
					return Err(Error::Truncated);
				}
				forward(sink, tee, &buf[..n]).await?;
				remaining -= n as u64;
				total += n as u64;
			}
		},
		BodyKind::Chunked => loop {
			let size_line = read_crlf_line(reader).await?;
			forward(sink, tee, &size_line).await?;
			let size_text = String::from_utf8_lossy(&size_line);
			let size_text = size_text.trim().split(';').next().unwrap_or("").trim();
			let size = u64::from_str_radix(size_text, 16).map_err(|_| Error::BadChunk)?;
			total += size;

			if size == 0 {
				// Trailer section, through the final blank line.
				loop {
					let line = read_crlf_line(reader).await?;
					forward(sink, tee, &line).await?;
					if line.as_slice() == &b"\r\n"[..] {
						break;
					}
				}
				break;
			}

			let mut remaining = size + 2; // chunk data plus its CRLF
			let mut buf = [0u8; COPY_CHUNK];
			while remaining > 0 {
				let want = remaining.min(COPY_CHUNK as u64) as usize;
				let n = reader.read(&mut buf[..want]).await?;
				if n == 0 {
					return Err(Error::BadChunk);
				}
				forward(sink, tee, &buf[..n]).await?;
				remaining -= n as u64;
			}
		},
		BodyKind::Eof => {
			let mut buf = [0u8; COPY_CHUNK];
			loop {
				let n = reader.read(&mut buf).await?;
				if n == 0 {
					break;
				}
				forward(sink, tee, &buf[..n]).await?;
				total += n as u64;
			}
		},
	}
	sink.flush().await?;
	Ok(total)
}
