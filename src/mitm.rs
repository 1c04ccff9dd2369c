//! TLS man-in-the-middle engine. Terminates a client's TLS session with a
//! leaf certificate issued on the fly for the requested SNI, signed by the
//! operator's CA, then re-establishes TLS towards the origin without
//! verification (interception is the feature). Without a configured CA the
//! engine is absent and the HTTP cache stays disabled.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use fluxgate_core::BoxedStream;
use fluxgate_core::peek::PeekStream;
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Issued leaves are short-lived; interception sessions are too.
const LEAF_VALIDITY_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("cannot read CA material: {0}")]
	Io(#[from] std::io::Error),
	#[error("bad CA material: {0}")]
	Ca(String),
	#[error("tls handshake: {0}")]
	Handshake(std::io::Error),
}

struct HostCertResolver {
	ca_cert: rcgen::Certificate,
	ca_key: KeyPair,
	cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for HostCertResolver {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("HostCertResolver")
			.field("cached", &self.cache.read().len())
			.finish()
	}
}

impl HostCertResolver {
	/// Issues (or returns the cached) leaf for an SNI host.
	fn certified_key_for(&self, host: &str) -> Option<Arc<CertifiedKey>> {
		if let Some(key) = self.cache.read().get(host) {
			debug!(%host, "mitm cert cache hit");
			return Some(key.clone());
		}
		match self.issue(host) {
			Ok(key) => {
				debug!(%host, "issued mitm certificate");
				self.cache.write().insert(host.to_string(), key.clone());
				Some(key)
			},
			Err(e) => {
				warn!(%host, error = %e, "mitm certificate issuance failed");
				None
			},
		}
	}

	fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, Error> {
		let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
			.map_err(|e| Error::Ca(e.to_string()))?;
		let mut params = CertificateParams::new(vec![host.to_string()])
			.map_err(|e| Error::Ca(e.to_string()))?;
		params.distinguished_name = DistinguishedName::new();
		params.distinguished_name.push(DnType::CommonName, host);
		let now = time::OffsetDateTime::now_utc();
		params.not_before = now - time::Duration::hours(1);
		params.not_after = now + time::Duration::hours(LEAF_VALIDITY_HOURS);

		let cert = params
			.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
			.map_err(|e| Error::Ca(e.to_string()))?;

		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
		let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
			.map_err(|e| Error::Ca(e.to_string()))?;
		Ok(Arc::new(CertifiedKey::new(
			vec![cert.der().clone()],
			signing_key,
		)))
	}
}

impl ResolvesServerCert for HostCertResolver {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		let host = client_hello.server_name()?.to_string();
		self.certified_key_for(&host)
	}
}

pub struct MitmEngine {
	resolver: Arc<HostCertResolver>,
	server_config: Arc<rustls::ServerConfig>,
	client_config: Arc<rustls::ClientConfig>,
}

impl MitmEngine {
	pub fn load(ca_cert_path: &Path, ca_key_path: &Path) -> Result<MitmEngine, Error> {
		let cert_pem = std::fs::read_to_string(ca_cert_path)?;
		let key_pem = std::fs::read_to_string(ca_key_path)?;
		Self::from_pem(&cert_pem, &key_pem)
	}

	/// Accepts the CA key in PKCS#8, PKCS#1 or SEC1 PEM form.
	pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<MitmEngine, Error> {
		let ca_key = KeyPair::from_pem(ca_key_pem).map_err(|e| Error::Ca(e.to_string()))?;
		let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
			.map_err(|e| Error::Ca(e.to_string()))?;
		// Re-signed with the same key and subject, so leaves chain up to the
		// operator-installed CA all the same.
		let ca_cert = ca_params
			.self_signed(&ca_key)
			.map_err(|e| Error::Ca(e.to_string()))?;

		let resolver = Arc::new(HostCertResolver {
			ca_cert,
			ca_key,
			cache: RwLock::new(HashMap::new()),
		});

		let server_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_cert_resolver(resolver.clone());

		let client_config = rustls::ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoUpstreamVerify::new()))
			.with_no_client_auth();

		Ok(MitmEngine {
			resolver,
			server_config: Arc::new(server_config),
			client_config: Arc::new(client_config),
		})
	}

	/// The (re-signed) CA certificate leaves chain up to.
	pub fn ca_certificate(&self) -> CertificateDer<'static> {
		self.resolver.ca_cert.der().clone()
	}

	pub fn cached_hosts(&self) -> usize {
		self.resolver.cache.read().len()
	}

	/// Sniffs the first bytes of the client stream. A TLS ClientHello gets
	/// terminated with an SNI-issued certificate; anything else passes through
	/// untouched, with the sniffed bytes still pending.
	pub async fn maybe_terminate(
		&self,
		stream: BoxedStream,
	) -> Result<(BoxedStream, bool), Error> {
		let mut peeked = PeekStream::new(stream);
		let head = peeked.peek(5).await?;
		if !is_client_hello(head) {
			debug!("client stream is not tls, relaying as-is");
			return Ok((Box::new(peeked), false));
		}
		let tls = TlsAcceptor::from(self.server_config.clone())
			.accept(peeked)
			.await
			.map_err(Error::Handshake)?;
		Ok((Box::new(tls), true))
	}

	/// Mirrors the client leg on the origin side: a TLS client handshake with
	/// the same SNI when the inbound leg was TLS, a pass-through otherwise.
	pub async fn reconnect_as_client(
		&self,
		stream: BoxedStream,
		sni: &str,
		was_tls: bool,
	) -> Result<BoxedStream, Error> {
		if !was_tls {
			return Ok(stream);
		}
		let server_name = ServerName::try_from(sni.to_string())
			.map_err(|e| Error::Ca(format!("bad sni {sni}: {e}")))?;
		let tls = TlsConnector::from(self.client_config.clone())
			.connect(server_name, stream)
			.await
			.map_err(Error::Handshake)?;
		Ok(Box::new(tls))
	}
}

/// TLS record sniff: handshake record type, a plausible protocol version and
/// a record length that can actually hold a ClientHello.
pub(crate) fn is_client_hello(head: &[u8]) -> bool {
	if head.len() < 5 {
		return false;
	}
	if head[0] != 0x16 {
		return false;
	}
	let version = u16::from_be_bytes([head[1], head[2]]);
	if version < 0x0300 {
		return false;
	}
	let msg_len = u16::from_be_bytes([head[3], head[4]]);
	msg_len > 39
}

/// Upstream certificates are deliberately not verified: the engine's whole
/// purpose is to sit between the client and the origin.
#[derive(Debug)]
pub(crate) struct NoUpstreamVerify {
	provider: Arc<CryptoProvider>,
}

impl NoUpstreamVerify {
	pub(crate) fn new() -> Self {
		NoUpstreamVerify {
			provider: Arc::new(rustls::crypto::ring::default_provider()),
		}
	}
}

impl ServerCertVerifier for NoUpstreamVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self
			.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}
