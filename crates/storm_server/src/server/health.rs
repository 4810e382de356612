#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	draining: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	/// Readiness flips to 503 once shutdown starts.
	pub fn mark_draining(&self) {
		self.draining.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed) && !self.is_draining()
	}

	pub fn is_draining(&self) -> bool {
		self.draining.load(Ordering::Relaxed)
	}
}

/// Bind the health endpoint and serve it in the background. Returns the bound address.
pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	info!(%local, "health endpoint listening");

	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});

	Ok(local)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body)));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, b""));
	}

	let resp = match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, b"ok"),
		"/readyz" => {
			if state.is_draining() {
				respond(StatusCode::SERVICE_UNAVAILABLE, b"draining")
			} else if state.is_ready() {
				respond(StatusCode::OK, b"ready")
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, b"not-ready")
			}
		}
		_ => respond(StatusCode::NOT_FOUND, b""),
	};

	Ok(resp)
}
