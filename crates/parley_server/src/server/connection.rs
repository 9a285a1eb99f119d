#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::{SecretString, UserId};
use parley_protocol::framing::{FramingError, encode_frame, try_split_payload_from_buffer};
use parley_protocol::frames::{AuthFrame, ConnectedFrame, Envelope, ErrorFrame, kind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::auth::verify_hmac_token;
use crate::server::hub::Hub;
use crate::server::offline::spawn_offline_push;
use crate::server::router::Router;
use crate::services::Services;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub outbound_queue_capacity: usize,

	pub heartbeat_interval: Duration,

	/// A connection with no inbound frames for this long is considered dead.
	pub liveness_timeout: Duration,

	/// How long the client gets to send its `auth` frame.
	pub auth_timeout: Duration,

	pub auth_hmac_secret: SecretString,

	pub offline_push_limit: usize,
}

/// Outcome of a non-blocking enqueue onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
	Accepted,
	/// Queue full: the consumer is stalled.
	Full,
	/// Writer already gone.
	Closed,
}

#[derive(Debug)]
struct HandleInner {
	conn_id: u64,
	user_id: UserId,
	outbound: mpsc::Sender<Envelope>,
	shutdown: watch::Sender<bool>,
}

/// Cheap cloneable handle to one live connection.
///
/// Holds the outbound queue sender and the shutdown flag; the read/write
/// tasks own the actual QUIC streams.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	inner: Arc<HandleInner>,
}

impl ConnectionHandle {
	pub(crate) fn new(
		conn_id: u64,
		user_id: UserId,
		queue_capacity: usize,
	) -> (Self, mpsc::Receiver<Envelope>, watch::Receiver<bool>) {
		let (outbound, outbound_rx) = mpsc::channel(queue_capacity);
		let (shutdown, shutdown_rx) = watch::channel(false);

		let handle = Self {
			inner: Arc::new(HandleInner {
				conn_id,
				user_id,
				outbound,
				shutdown,
			}),
		};
		(handle, outbound_rx, shutdown_rx)
	}

	pub fn conn_id(&self) -> u64 {
		self.inner.conn_id
	}

	pub fn user_id(&self) -> UserId {
		self.inner.user_id
	}

	/// Non-blocking enqueue onto the outbound queue.
	pub fn enqueue(&self, env: Envelope) -> Enqueue {
		match self.inner.outbound.try_send(env) {
			Ok(()) => Enqueue::Accepted,
			Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
			Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
		}
	}

	/// Signal both connection tasks to stop. Idempotent.
	pub fn close(&self) {
		self.inner.shutdown.send_replace(true);
	}

	pub fn is_closed(&self) -> bool {
		*self.inner.shutdown.borrow()
	}

	pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
		self.inner.shutdown.subscribe()
	}
}

/// Drive one client session: auth, registration, frame routing, teardown.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	hub: Arc<Hub>,
	router: Arc<Router>,
	services: Services,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let max_frame_bytes = settings.max_frame_bytes;
	let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("parley_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				let payload = match try_split_payload_from_buffer(&mut buf, max_frame_bytes) {
					Ok(Some(payload)) => payload,
					Ok(None) => break,
					Err(e @ FramingError::FrameTooLarge { .. }) => {
						metrics::counter!("parley_server_frames_oversized_total").increment(1);
						return Err(anyhow!(e).context("oversized inbound frame"));
					}
					Err(e) => return Err(anyhow!(e)),
				};

				match serde_json::from_slice::<Envelope>(&payload) {
					Ok(env) => {
						metrics::counter!("parley_server_envelopes_in_total").increment(1);
						if inbound_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Err(e) => {
						// One bad payload never kills the stream.
						metrics::counter!("parley_server_frames_malformed_total").increment(1);
						warn!(conn_id, error = %e, "dropping malformed inbound frame");
					}
				}
			}
		}
	});

	// Auth must complete before any registry state exists for this peer.
	let user_id = match authenticate(conn_id, &mut inbound_rx, &settings).await {
		Ok(user_id) => user_id,
		Err(reason) => {
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			warn!(conn_id, reason = %reason, "rejecting connection");
			let env = Envelope::new(
				kind::ERROR,
				&ErrorFrame {
					msg_id: None,
					message: reason.to_string(),
				},
			)?;
			let _ = write_envelope(&mut send, &env, max_frame_bytes).await;
			connection.close(1u32.into(), b"unauthorized");
			let _ = reader_task.await;
			return Ok(());
		}
	};

	info!(conn_id, %user_id, "authenticated");
	metrics::counter!("parley_server_auth_ok_total").increment(1);

	let (handle, mut outbound_rx, mut writer_shutdown) =
		ConnectionHandle::new(conn_id, user_id, settings.outbound_queue_capacity);
	let mut loop_shutdown = handle.subscribe_shutdown();

	hub.register(handle.clone()).await;

	let connected = Envelope::new(
		kind::CONNECTED,
		&ConnectedFrame {
			user_id,
			online_count: hub.online_count().await,
		},
	)?;
	if handle.enqueue(connected) != Enqueue::Accepted {
		// Fresh queue; only possible if something already tore us down.
		hub.unregister(conn_id, user_id).await;
		return Ok(());
	}

	let writer_handle = handle.clone();
	let heartbeat = settings.heartbeat_interval;
	let writer_task = tokio::spawn(async move {
		let mut ticker = tokio::time::interval(heartbeat);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// Swallow the immediate first tick.
		ticker.tick().await;

		let mut traffic_since_tick = false;

		loop {
			tokio::select! {
				_ = writer_shutdown.changed() => break,

				env = outbound_rx.recv() => {
					let Some(env) = env else { break };
					if let Err(e) = write_envelope(&mut send, &env, max_frame_bytes).await {
						debug!(conn_id, error = %e, "outbound write failed");
						writer_handle.close();
						break;
					}
					traffic_since_tick = true;
				}

				_ = ticker.tick() => {
					if !traffic_since_tick
						&& let Err(e) = write_envelope(&mut send, &Envelope::bare(kind::PING), max_frame_bytes).await
					{
						debug!(conn_id, error = %e, "heartbeat write failed");
						writer_handle.close();
						break;
					}
					traffic_since_tick = false;
				}
			}
		}

		let _ = send.finish();
	});

	spawn_offline_push(services.clone(), handle.clone(), settings.offline_push_limit);

	loop {
		tokio::select! {
			_ = loop_shutdown.changed() => break,

			recv = tokio::time::timeout(settings.liveness_timeout, inbound_rx.recv()) => {
				match recv {
					Ok(Some(env)) => router.handle_frame(&handle, env).await,
					Ok(None) => break,
					Err(_) => {
						metrics::counter!("parley_server_liveness_timeouts_total").increment(1);
						warn!(conn_id, %user_id, "liveness deadline lapsed; closing connection");
						break;
					}
				}
			}
		}
	}

	hub.unregister(conn_id, user_id).await;
	handle.close();
	connection.close(0u32.into(), b"session closed");

	let _ = writer_task.await;
	let _ = reader_task.await;

	debug!(conn_id, %user_id, "connection closed");
	Ok(())
}

async fn authenticate(
	conn_id: u64,
	inbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
	settings: &ConnectionSettings,
) -> Result<UserId, anyhow::Error> {
	let env = match tokio::time::timeout(settings.auth_timeout, inbound_rx.recv()).await {
		Ok(Some(env)) => env,
		Ok(None) => return Err(anyhow!("connection closed before auth")),
		Err(_) => return Err(anyhow!("auth timeout")),
	};

	if env.kind != kind::AUTH {
		return Err(anyhow!("expected auth frame, got {:?}", env.kind));
	}

	let auth: AuthFrame = env.decode_data().context("malformed auth frame")?;
	let token = auth.token.trim();
	if token.is_empty() {
		return Err(anyhow!("missing auth token"));
	}

	let claims = verify_hmac_token(token, settings.auth_hmac_secret.expose()).map_err(|e| {
		debug!(conn_id, error = %e, "token verification failed");
		anyhow!("invalid auth token")
	})?;

	Ok(UserId(claims.sub))
}

async fn write_envelope(send: &mut quinn::SendStream, env: &Envelope, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(env, max_frame_bytes).map_err(|e| anyhow!(e))?;
	metrics::counter!("parley_server_envelopes_out_total").increment(1);
	metrics::counter!("parley_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
