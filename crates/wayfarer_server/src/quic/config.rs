#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig};
use rustls_pemfile::{certs, private_key};

/// ALPN identifier for protocol v1.
pub const ALPN_V1: &[u8] = b"wayfarer-v1";

/// Where the endpoint's TLS identity comes from.
#[derive(Debug, Clone)]
pub enum CertSource {
	/// Generate a self-signed certificate for `localhost` (dev only).
	DevSelfSigned,
	/// Load PEM cert chain + private key from disk.
	Files { cert: PathBuf, key: PathBuf },
}

/// Wayfarer QUIC endpoint configuration (v1).
#[derive(Debug, Clone)]
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,
	pub cert_source: CertSource,
	pub max_concurrent_bidi_streams: u32,
	pub max_concurrent_uni_streams: u32,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr, cert_source: CertSource) -> Self {
		Self {
			bind_addr,
			cert_source,
			max_concurrent_bidi_streams: 16,
			max_concurrent_uni_streams: 16,
		}
	}

	/// Build and bind the endpoint. Returns the DER certificate when the
	/// dev self-signed path generated one.
	pub fn bind_endpoint(&self) -> anyhow::Result<(Endpoint, Option<Vec<u8>>)> {
		let (tls_config, cert_der) = match &self.cert_source {
			CertSource::DevSelfSigned => {
				let (tls, der) = dev_self_signed_tls()?;
				(tls, Some(der))
			}
			CertSource::Files { cert, key } => (tls_from_files(cert, key)?, None),
		};

		let mut tls_config = tls_config;
		tls_config.alpn_protocols = vec![ALPN_V1.to_vec()];

		let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
			.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

		let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));

		let mut transport = quinn::TransportConfig::default();
		transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_bidi_streams));
		transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(self.max_concurrent_uni_streams));
		server_config.transport_config(Arc::new(transport));

		let endpoint = Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")?;
		Ok((endpoint, cert_der))
	}
}

fn dev_self_signed_tls() -> anyhow::Result<(rustls::ServerConfig, Vec<u8>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_der = ck.cert.der().to_vec();
	let key_der = ck.signing_key.serialize_der();

	let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der.clone())];
	let key = rustls::pki_types::PrivateKeyDer::try_from(key_der).map_err(|e| anyhow!("parse private key der: {e}"))?;

	let tls = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;

	Ok((tls, cert_der))
}

fn tls_from_files(cert_path: &Path, key_path: &Path) -> anyhow::Result<rustls::ServerConfig> {
	let cert_chain = load_cert_chain(cert_path)?;
	let key = load_private_key(key_path)?;

	rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if certs.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}
