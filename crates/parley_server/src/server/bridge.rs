#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::{GroupId, SecretString, UserId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::hub::Hub;
use crate::server::member_cache::MemberCache;

/// Header carrying the shared secret for internal push requests.
pub const PUSH_SECRET_HEADER: &str = "X-Parley-Push-Secret";

/// Group events that change the roster and therefore invalidate the
/// member cache before fanout.
const ROSTER_EVENTS: &[&str] = &["group_member_join", "group_member_leave", "group_member_kick", "group_dismiss"];

/// Push request relayed by the platform's HTTP services.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
	/// "user" or "group".
	#[serde(rename = "type")]
	kind: String,

	user_id: Option<UserId>,
	notification_type: Option<String>,
	#[serde(default)]
	data: serde_json::Value,

	group_id: Option<String>,
	event_type: Option<String>,
	#[serde(default)]
	event_data: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PushResponse {
	code: u16,
	message: String,
}

/// Shared state for the inbound HTTP bridge.
#[derive(Clone)]
pub struct BridgeState {
	hub: Arc<Hub>,
	member_cache: Arc<MemberCache>,
	push_secret: Option<SecretString>,
	ready: Arc<AtomicBool>,
}

impl BridgeState {
	pub fn new(hub: Arc<Hub>, member_cache: Arc<MemberCache>, push_secret: Option<SecretString>) -> Self {
		Self {
			hub,
			member_cache,
			push_secret,
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_bridge_server(bind: SocketAddr, state: BridgeState) {
	tokio::spawn(async move {
		if let Err(err) = run_bridge_server(bind, state).await {
			warn!(error = %err, "bridge server stopped");
		}
	});
}

async fn run_bridge_server(bind: SocketAddr, state: BridgeState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "bridge listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "bridge connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: BridgeState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	match (req.method(), req.uri().path()) {
		(&Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, "ok")),
		(&Method::GET, "/readyz") => {
			if state.is_ready() {
				Ok(text_response(StatusCode::OK, "ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}
		(&Method::GET, "/health") => {
			let online = state.hub.online_count().await;
			let body = format!("{{\"status\":\"ok\",\"online\":{online}}}");
			Ok(text_response(StatusCode::OK, &body))
		}
		(&Method::POST, "/api/push") => handle_push(req, state).await,
		(&Method::POST, _) | (&Method::GET, _) => Ok(text_response(StatusCode::NOT_FOUND, "")),
		_ => Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "")),
	}
}

async fn handle_push(req: Request<Incoming>, state: BridgeState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let provided = req
		.headers()
		.get(PUSH_SECRET_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let body = req.into_body().collect().await?.to_bytes();
	Ok(route_push(&state, provided.as_deref(), &body).await)
}

pub(crate) async fn route_push(state: &BridgeState, provided_secret: Option<&str>, body: &[u8]) -> Response<Full<Bytes>> {
	if let Some(secret) = &state.push_secret {
		if provided_secret.unwrap_or_default() != secret.expose() {
			metrics::counter!("parley_server_push_unauthorized_total").increment(1);
			return push_response(StatusCode::UNAUTHORIZED, "invalid push secret");
		}
	}

	let push: PushRequest = match serde_json::from_slice(body) {
		Ok(push) => push,
		Err(e) => {
			warn!(error = %e, "malformed push request");
			return push_response(StatusCode::BAD_REQUEST, "malformed push request");
		}
	};

	metrics::counter!("parley_server_push_requests_total", "kind" => push.kind.clone()).increment(1);

	match push.kind.as_str() {
		"user" => {
			let (Some(user_id), Some(notification_type)) = (push.user_id, push.notification_type.as_deref()) else {
				return push_response(StatusCode::BAD_REQUEST, "user push needs userId and notificationType");
			};

			let envelope = parley_protocol::frames::Envelope {
				kind: notification_type.to_string(),
				data: push.data,
			};
			let delivered = state.hub.send_to_user(user_id, envelope).await;
			let message = if delivered { "delivered" } else { "user offline" };
			push_response(StatusCode::OK, message)
		}
		"group" => {
			let (Some(group_id), Some(event_type)) = (push.group_id.as_deref(), push.event_type.as_deref()) else {
				return push_response(StatusCode::BAD_REQUEST, "group push needs groupId and eventType");
			};
			let group = match GroupId::new(group_id) {
				Ok(group) => group,
				Err(_) => return push_response(StatusCode::BAD_REQUEST, "invalid groupId"),
			};

			if ROSTER_EVENTS.contains(&event_type) {
				state.member_cache.invalidate(&group).await;
			}
			state.hub.notify_group_event(group, event_type, push.event_data).await;
			push_response(StatusCode::OK, "accepted")
		}
		other => {
			warn!(kind = other, "unknown push kind");
			push_response(StatusCode::BAD_REQUEST, "unknown push kind")
		}
	}
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}

fn push_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	// Internal callers check the body's `code`, and 0 means success there.
	let body = PushResponse {
		code: if status.is_success() { 0 } else { status.as_u16() },
		message: message.to_string(),
	};
	let bytes = serde_json::to_vec(&body).unwrap_or_default();
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(bytes)))
		.unwrap()
}
