#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use storm_domain::BroadcastTopic;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::server::registry::Registry;

/// Settings for the fan-out relay.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
	pub debug_log_events: bool,
}

/// Relay that consumes the room broadcast topics and delivers into the local registry.
///
/// This is the only path by which a payload published on one gateway reaches
/// clients connected to another.
#[derive(Debug)]
pub struct FanoutRelay {
	cfg: RelayConfig,
	registry: Registry,
	sub: Subscription,
}

impl FanoutRelay {
	/// Subscribe to every room broadcast topic on `bus`.
	pub async fn subscribe(bus: &dyn Bus, registry: Registry, cfg: RelayConfig) -> anyhow::Result<Self> {
		let sub = bus
			.subscribe(BroadcastTopic::PATTERN)
			.await
			.context("subscribe room broadcast topics")?;

		Ok(Self { cfg, registry, sub })
	}

	/// Run the relay loop until the bus is closed.
	pub async fn run(mut self) {
		info!(pattern = BroadcastTopic::PATTERN, "fan-out relay started");

		while let Some(msg) = self.sub.next().await {
			let Some(room) = BroadcastTopic::room(&msg.subject) else {
				warn!(subject = %msg.subject, "fan-out relay got a subject without a room");
				continue;
			};

			let delivered = self.registry.broadcast_to_room(room, msg.payload.clone()).await;
			metrics::counter!("storm_gateway_relayed_total").increment(1);

			if self.cfg.debug_log_events {
				debug!(room, delivered, "relayed broadcast to room");
			}
		}

		info!("fan-out relay exiting (bus closed)");
	}
}

/// Spawn a background relay from `bus` into `registry`.
pub async fn spawn_fanout_relay(
	bus: Arc<dyn Bus>,
	registry: Registry,
	cfg: RelayConfig,
) -> anyhow::Result<JoinHandle<()>> {
	let relay = FanoutRelay::subscribe(bus.as_ref(), registry, cfg).await?;
	Ok(tokio::spawn(relay.run()))
}
