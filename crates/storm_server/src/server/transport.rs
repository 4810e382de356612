#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use storm_util::endpoint::WsEndpoint;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, info, warn};

use crate::server::auth::AuthClient;
use crate::server::connection::{ProtocolHandler, Session};
use crate::server::registry::{ConnId, ConnectionHandle, Outbound};

/// WebSocket listener settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
	/// Upgrade requests outside `endpoint.path` get a 404.
	pub endpoint: WsEndpoint,

	pub outbound_queue_capacity: usize,

	/// Close sockets without a valid token instead of running them anonymously.
	pub require_auth: bool,
}

/// Accepts WebSocket clients and runs each through the protocol handler.
#[derive(Clone)]
pub struct WsGateway {
	handler: ProtocolHandler,
	auth: AuthClient,
	cfg: Arc<TransportConfig>,
	next_conn_id: Arc<AtomicU64>,
}

impl WsGateway {
	pub fn new(handler: ProtocolHandler, auth: AuthClient, cfg: TransportConfig) -> Self {
		Self {
			handler,
			auth,
			cfg: Arc::new(cfg),
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	/// Accept connections until `shutdown` resolves. Live connections keep running.
	pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
		tokio::pin!(shutdown);

		loop {
			tokio::select! {
				_ = &mut shutdown => {
					info!("gateway stopped accepting connections");
					break;
				}
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
						metrics::counter!("storm_gateway_connections_total").increment(1);

						let gateway = self.clone();
						tokio::spawn(async move {
							if let Err(e) = gateway.handle_socket(conn_id, stream, peer).await {
								warn!(conn_id, %peer, error = %e, "connection handler exited with error");
							}
						});
					}
					Err(e) => {
						warn!(error = %e, "accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
					}
				},
			}
		}
	}

	async fn handle_socket(self, conn_id: ConnId, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
		struct ConnectionGaugeGuard;
		impl Drop for ConnectionGaugeGuard {
			fn drop(&mut self) {
				metrics::gauge!("storm_gateway_active_connections").decrement(1.0);
			}
		}

		let mut token: Option<String> = None;
		let endpoint = &self.cfg.endpoint;
		let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
			if !endpoint.accepts_path(req.uri().path()) {
				return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
			}
			token = bearer_token(req);
			Ok(resp)
		})
		.await
		.context("websocket handshake")?;

		metrics::gauge!("storm_gateway_active_connections").increment(1.0);
		let _conn_guard = ConnectionGaugeGuard;

		let identity = match token.as_deref() {
			Some(token) => self.auth.validate(token).await,
			None => None,
		};

		if identity.is_none() && self.cfg.require_auth {
			metrics::counter!("storm_gateway_auth_rejected_total").increment(1);
			info!(conn_id, %peer, "closing unauthenticated connection");
			let frame = CloseFrame {
				code: CloseCode::Policy,
				reason: Utf8Bytes::from_static("authentication required"),
			};
			if let Err(e) = ws.close(Some(frame)).await {
				debug!(conn_id, error = %e, "close after auth failure");
			}
			return Ok(());
		}

		info!(conn_id, %peer, authenticated = identity.is_some(), "accepted connection");

		let (mut sink, mut source) = ws.split();
		let (tx, mut rx) = mpsc::channel::<Outbound>(self.cfg.outbound_queue_capacity.max(1));
		let conn = ConnectionHandle::new(conn_id, tx);

		let writer = tokio::spawn(async move {
			while let Some(item) = rx.recv().await {
				let msg = match item {
					Outbound::Payload(bytes) => payload_message(bytes),
					Outbound::Ping => Message::Ping(Bytes::new()),
				};
				if let Err(e) = sink.send(msg).await {
					debug!(conn_id, error = %e, "socket write failed");
					break;
				}
			}
			let _ = sink.close().await;
		});

		let mut session = Session::new(conn_id, identity);
		let heartbeat = self.handler.on_open(&session, &conn).await;

		while let Some(next) = source.next().await {
			match next {
				Ok(Message::Text(text)) => self.handler.on_payload(&mut session, &conn, text.as_bytes()).await,
				Ok(Message::Binary(bytes)) => self.handler.on_payload(&mut session, &conn, &bytes).await,
				Ok(Message::Close(frame)) => {
					debug!(conn_id, ?frame, "client closed");
					break;
				}
				Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
				Err(e) => {
					debug!(conn_id, error = %e, "socket read failed");
					break;
				}
			}
		}

		self.handler.on_close(&session).await;
		heartbeat.abort();
		writer.abort();

		Ok(())
	}
}

/// JSON frames go out as text; anything else as binary.
fn payload_message(bytes: Bytes) -> Message {
	match std::str::from_utf8(&bytes) {
		Ok(text) => Message::text(text.to_owned()),
		Err(_) => Message::binary(bytes),
	}
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
	let mut resp = ErrorResponse::new(Some(reason.to_string()));
	*resp.status_mut() = status;
	resp
}

/// Token from `?token=`, else from `Authorization: Bearer`.
fn bearer_token(req: &Request) -> Option<String> {
	let from_query = req
		.uri()
		.query()
		.and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
		.filter(|t| !t.is_empty());
	if let Some(token) = from_query {
		return Some(token.to_string());
	}

	req.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.map(str::to_string)
}
