#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

pub const ALPN_PARLEY_V1: &[u8] = b"parley-v1";

/// Where the listener's TLS credentials come from.
pub enum TlsMode {
	/// Generate a throwaway self-signed certificate. Development only.
	SelfSigned,
	Pem { cert: PathBuf, key: PathBuf },
}

/// QUIC listener configuration.
pub struct QuicListenerConfig {
	pub bind_addr: SocketAddr,
	pub alpn_protocols: Vec<Vec<u8>>,
	pub max_concurrent_bidi_streams: u32,
	pub max_concurrent_uni_streams: u32,
}

impl QuicListenerConfig {
	pub fn new(bind_addr: SocketAddr) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![ALPN_PARLEY_V1.to_vec()],
			max_concurrent_bidi_streams: 64,
			max_concurrent_uni_streams: 64,
		}
	}

	/// Bind the endpoint. For self-signed mode the DER certificate is
	/// returned so local clients can pin it.
	pub fn bind(&self, mode: &TlsMode) -> anyhow::Result<(Endpoint, Option<Vec<u8>>)> {
		let (cert_chain, key, cert_der) = match mode {
			TlsMode::SelfSigned => {
				let (chain, key, der) = self_signed_credentials()?;
				(chain, key, Some(der))
			}
			TlsMode::Pem { cert, key } => {
				let chain = load_cert_chain(cert)?;
				let key = load_private_key(key)?;
				(chain, key, None)
			}
		};

		let mut tls_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(cert_chain, key)
			.context("build rustls server config")?;
		tls_config.alpn_protocols = self.alpn_protocols.clone();

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

type Credentials = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, Vec<u8>);

fn self_signed_credentials() -> anyhow::Result<Credentials> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_der = ck.cert.der().to_vec();
	let key_der = ck.signing_key.serialize_der();

	let chain = vec![CertificateDer::from(cert_der.clone())];
	let key = PrivateKeyDer::try_from(key_der).map_err(|e| anyhow!("parse private key der: {e}"))?;
	Ok((chain, key, cert_der))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;

	if certs.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}

	Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let Some(key) = private_key(&mut reader).context("parse tls key")? else {
		return Err(anyhow!("no private key found in {}", path.display()));
	};
	Ok(key)
}
