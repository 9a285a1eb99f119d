#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::{MsgId, SecretString, UserId};
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_split_payload_from_buffer};
use parley_protocol::frames::{
	AckFrame, AckStatus, AuthFrame, ChatFrame, ConnectedFrame, Envelope, OfflineKind, OfflineSummaryFrame, kind,
};
use tokio::time::timeout;

use crate::quic::{ALPN_PARLEY_V1, QuicListenerConfig, TlsMode};
use crate::server::auth::{AuthClaims, mint_hmac_token};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::hub::{Hub, HubConfig};
use crate::server::member_cache::MemberCache;
use crate::server::router::Router;
use crate::services::{MessageService as _, Services};
use crate::services::memory::MemoryBackend;
use crate::util::time::unix_secs_now;

const AUTH_SECRET: &str = "hush";

/// One full server stack bound to a loopback QUIC endpoint, with every
/// accepted connection driven through `handle_connection`.
struct Stack {
	backend: Arc<MemoryBackend>,
	hub: Arc<Hub>,
	addr: SocketAddr,
	cert_der: Vec<u8>,
}

fn install_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn test_settings(auth_timeout: Duration) -> ConnectionSettings {
	ConnectionSettings {
		max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		outbound_queue_capacity: 64,
		heartbeat_interval: Duration::from_secs(30),
		liveness_timeout: Duration::from_secs(30),
		auth_timeout,
		auth_hmac_secret: SecretString::new(AUTH_SECRET),
		offline_push_limit: 20,
	}
}

async fn start_stack(backend: Arc<MemoryBackend>, settings: ConnectionSettings) -> anyhow::Result<Stack> {
	install_crypto_provider();

	let services = Services {
		messages: backend.clone(),
		friends: backend.clone(),
		groups: backend.clone(),
		rpc_timeout: Duration::from_millis(500),
	};
	let cache = Arc::new(MemberCache::new(services.clone(), Duration::from_secs(60)));
	let hub = Hub::new(HubConfig::default(), services.clone(), cache);
	let router = Router::new(Arc::clone(&hub), services.clone());

	let quic_cfg = QuicListenerConfig::new("127.0.0.1:0".parse()?);
	let (endpoint, cert_der) = quic_cfg.bind(&TlsMode::SelfSigned)?;
	let cert_der = cert_der.context("self-signed bind returns the cert der")?;
	let addr = endpoint.local_addr()?;

	let accept_hub = Arc::clone(&hub);
	tokio::spawn(async move {
		let mut next_conn_id = 1u64;
		while let Some(connecting) = endpoint.accept().await {
			let conn_id = next_conn_id;
			next_conn_id += 1;

			let hub = Arc::clone(&accept_hub);
			let router = Arc::clone(&router);
			let services = services.clone();
			let settings = settings.clone();
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_connection(conn_id, connection, hub, router, services, settings).await;
				}
			});
		}
	});

	Ok(Stack {
		backend,
		hub,
		addr,
		cert_der,
	})
}

fn client_endpoint(cert_der: &[u8]) -> anyhow::Result<quinn::Endpoint> {
	let mut roots = rustls::RootCertStore::empty();
	roots
		.add(rustls::pki_types::CertificateDer::from(cert_der.to_vec()))
		.context("trust server cert")?;

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	tls.alpn_protocols = vec![ALPN_PARLEY_V1.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(|e| anyhow!("client tls: {e}"))?;
	let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse()?)?;
	endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_tls)));
	Ok(endpoint)
}

struct FrameReader {
	recv: quinn::RecvStream,
	buf: BytesMut,
}

impl FrameReader {
	fn new(recv: quinn::RecvStream) -> Self {
		Self {
			recv,
			buf: BytesMut::new(),
		}
	}

	async fn next(&mut self) -> anyhow::Result<Envelope> {
		loop {
			if let Some(payload) = try_split_payload_from_buffer(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))? {
				return Ok(serde_json::from_slice(&payload).context("decode envelope")?);
			}

			let mut tmp = [0u8; 4096];
			match self.recv.read(&mut tmp).await.context("stream read")? {
				Some(n) => self.buf.extend_from_slice(&tmp[..n]),
				None => return Err(anyhow!("stream closed")),
			}
		}
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: &Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

fn token_for(user: i64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: user,
		exp: unix_secs_now() + 60,
	};
	mint_hmac_token(&claims, secret).expect("mint token")
}

async fn next_frame(reader: &mut FrameReader) -> anyhow::Result<Envelope> {
	timeout(Duration::from_secs(2), reader.next()).await.context("frame deadline")?
}

async fn wait_online(hub: &Hub, user: UserId, want: bool) {
	for _ in 0..400 {
		if hub.is_online(user).await == want {
			return;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	panic!("user {user} online={want} never observed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_lifecycle_auth_ping_chat_over_quic() -> anyhow::Result<()> {
	let backend = Arc::new(MemoryBackend::new());
	let stack = start_stack(backend, test_settings(Duration::from_secs(2))).await?;

	let endpoint = client_endpoint(&stack.cert_der)?;
	let connection = endpoint.connect(stack.addr, "localhost")?.await.context("connect")?;
	let (mut send, recv) = connection.open_bi().await.context("open bi stream")?;
	let mut reader = FrameReader::new(recv);

	let auth = AuthFrame {
		token: token_for(7, AUTH_SECRET),
	};
	send_envelope(&mut send, &Envelope::new(kind::AUTH, &auth)?).await?;

	let env = next_frame(&mut reader).await?;
	assert_eq!(env.kind, kind::CONNECTED);
	let connected: ConnectedFrame = env.decode_data()?;
	assert_eq!(connected.user_id, UserId(7));
	wait_online(&stack.hub, UserId(7), true).await;

	send_envelope(&mut send, &Envelope::bare(kind::PING)).await?;
	let env = next_frame(&mut reader).await?;
	assert_eq!(env.kind, kind::PONG);

	// Chat to an offline peer: persisted and acked sent, never delivered.
	let chat = ChatFrame {
		msg_id: Some("m-1".to_string()),
		from_user_id: None,
		to_user_id: UserId(9),
		content: "hi".to_string(),
		content_type: 1,
		created_at: None,
	};
	send_envelope(&mut send, &Envelope::new(kind::CHAT, &chat)?).await?;
	let env = next_frame(&mut reader).await?;
	assert_eq!(env.kind, kind::ACK);
	let ack: AckFrame = env.decode_data()?;
	assert_eq!(ack.msg_id, "m-1");
	assert_eq!(ack.status, AckStatus::Sent);
	assert_eq!(stack.backend.send_message_calls(), 1);

	connection.close(0u32.into(), b"done");
	wait_online(&stack.hub, UserId(7), false).await;
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn private_backlog_is_replayed_over_the_wire() -> anyhow::Result<()> {
	let backend = Arc::new(MemoryBackend::new());
	backend.add_friends(UserId(7), UserId(8)).await;
	for (id, content) in [("m-1", "one"), ("m-2", "two")] {
		let msg_id = MsgId::new(id).expect("msg id");
		backend
			.send_message(UserId(8), UserId(7), &msg_id, content, 1)
			.await
			.expect("seed message");
	}
	let stack = start_stack(backend, test_settings(Duration::from_secs(2))).await?;

	let endpoint = client_endpoint(&stack.cert_der)?;
	let connection = endpoint.connect(stack.addr, "localhost")?.await.context("connect")?;
	let (mut send, recv) = connection.open_bi().await.context("open bi stream")?;
	let mut reader = FrameReader::new(recv);

	let auth = AuthFrame {
		token: token_for(7, AUTH_SECRET),
	};
	send_envelope(&mut send, &Envelope::new(kind::AUTH, &auth)?).await?;

	assert_eq!(next_frame(&mut reader).await?.kind, kind::CONNECTED);

	let env = next_frame(&mut reader).await?;
	assert_eq!(env.kind, kind::OFFLINE_SUMMARY);
	let summary: OfflineSummaryFrame = env.decode_data()?;
	assert_eq!(summary.total_count, 2);
	assert_eq!(summary.push_count, 2);
	assert!(!summary.has_more);
	assert_eq!(summary.message_type, OfflineKind::Private);

	for expected in ["one", "two"] {
		let env = next_frame(&mut reader).await?;
		assert_eq!(env.kind, kind::CHAT);
		let chat: ChatFrame = env.decode_data()?;
		assert_eq!(chat.from_user_id, Some(UserId(8)));
		assert_eq!(chat.content, expected);
	}

	connection.close(0u32.into(), b"done");
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_token_is_rejected_before_registration() -> anyhow::Result<()> {
	let backend = Arc::new(MemoryBackend::new());
	let stack = start_stack(backend, test_settings(Duration::from_secs(2))).await?;

	let endpoint = client_endpoint(&stack.cert_der)?;
	let connection = endpoint.connect(stack.addr, "localhost")?.await.context("connect")?;
	let (mut send, recv) = connection.open_bi().await.context("open bi stream")?;
	let mut reader = FrameReader::new(recv);

	let auth = AuthFrame {
		token: token_for(7, "not-the-secret"),
	};
	send_envelope(&mut send, &Envelope::new(kind::AUTH, &auth)?).await?;

	// The connection close can outrun the error frame.
	match timeout(Duration::from_secs(2), reader.next()).await.context("rejection deadline")? {
		Ok(env) => assert_eq!(env.kind, kind::ERROR),
		Err(_) => {}
	}

	assert_eq!(stack.hub.online_count().await, 0, "a rejected session never registers");
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_hits_the_auth_deadline() -> anyhow::Result<()> {
	let backend = Arc::new(MemoryBackend::new());
	let stack = start_stack(backend, test_settings(Duration::from_millis(300))).await?;

	let endpoint = client_endpoint(&stack.cert_der)?;
	let connection = endpoint.connect(stack.addr, "localhost")?.await.context("connect")?;
	let (mut send, recv) = connection.open_bi().await.context("open bi stream")?;
	let mut reader = FrameReader::new(recv);

	// A partial length prefix makes the stream visible without ever
	// completing an auth frame.
	send.write_all(&[0, 0]).await.context("write partial prefix")?;

	match timeout(Duration::from_secs(3), reader.next()).await.context("timeout deadline")? {
		Ok(env) => assert_eq!(env.kind, kind::ERROR),
		Err(_) => {}
	}

	assert_eq!(stack.hub.online_count().await, 0);
	Ok(())
}
