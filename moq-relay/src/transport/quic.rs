//! The real WebTransport/QUIC binding for [`super::Session`] (§6): accepts
//! connections on `moq_native`'s QUIC endpoint, routes each one by its
//! WebTransport request path, and runs the session through
//! [`crate::session::on_publisher_session`] / [`on_subscriber_session`].
//!
//! This is the one module in the crate that talks to `moq-transport`
//! directly; everywhere else only sees the [`super::Session`] trait, which
//! is what lets the router's own test suite run against
//! [`super::fake::FakeSession`] with no QUIC stack at all.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::session::{on_publisher_session, on_subscriber_session, RouterState};
use crate::tracer::{ConnectionTracer, TracerConfig};

use super::moq_transport_session::TransportSession;
use super::Role;

pub const PUBLISH_PATH: &str = "/webtransport/streamer";
pub const SUBSCRIBE_PATH: &str = "/webtransport/audience";

/// Matches a WebTransport CONNECT request path to the role the relay plays
/// for that session (§6). Trailing path segments after the two known
/// prefixes are treated as the requested audience display name.
pub fn route(path: &str) -> Option<(Role, Option<String>)> {
	if let Some(rest) = path.strip_prefix(PUBLISH_PATH) {
		return Some((Role::Publisher, non_empty(rest)));
	}
	if let Some(rest) = path.strip_prefix(SUBSCRIBE_PATH) {
		return Some((Role::Subscriber, non_empty(rest)));
	}
	None
}

fn non_empty(segment: &str) -> Option<String> {
	let trimmed = segment.trim_start_matches('/');
	if trimmed.is_empty() {
		None
	} else {
		Some(trimmed.to_string())
	}
}

/// Runs the accept loop for the lifetime of the process: every incoming
/// WebTransport session is handed to a fresh task so one slow or malicious
/// peer can never block another (§5).
pub async fn serve(quic: moq_native::quic::Endpoint, state: Arc<RouterState>, tracer_config: TracerConfig) -> anyhow::Result<()> {
	loop {
		let incoming = quic.server.accept().await.context("QUIC endpoint closed")?;
		let state = state.clone();
		let tracer_config = tracer_config.clone();

		tokio::spawn(async move {
			if let Err(err) = accept_one(incoming, state, tracer_config).await {
				warn!(error = %err, "session setup failed");
			}
		});
	}
}

async fn accept_one(incoming: moq_native::quic::Connecting, state: Arc<RouterState>, tracer_config: TracerConfig) -> anyhow::Result<()> {
	let session = TransportSession::accept(incoming).await.context("WebTransport handshake failed")?;

	let Some((role, name)) = route(session.path()) else {
		session.close().await;
		anyhow::bail!("unrecognized WebTransport path: {}", session.path());
	};

	let connection_id = session.connection_id();
	let tracer = match ConnectionTracer::new(connection_id.clone(), tracer_config.clone()) {
		Ok(tracer) => Arc::new(tracer),
		Err(err) => {
			// §7: a tracer that fails to initialize is logged once and the
			// session proceeds untraced rather than being rejected.
			error!(connection = %connection_id, error = %err, "failed to start connection tracer");
			Arc::new(ConnectionTracer::disabled(connection_id))
		}
	};

	let session: Arc<dyn super::Session> = Arc::new(session);
	let cancel = CancellationToken::new();

	spawn_metrics_ticker(session.clone(), tracer.clone(), state.clone(), tracer_config.check_interval, cancel.clone());

	let result = match role {
		Role::Publisher => match on_publisher_session(state.clone(), session.clone(), tracer, cancel.clone()).await {
			Ok(channel) => {
				// The announce+catalog handshake completing does not mean
				// the connection is done: the media-pump tasks it started
				// keep running in the background until the peer actually
				// disconnects, which is what this waits for before tearing
				// the channel down (§6, §8 scenario 1).
				session.closed().await;
				let _ = state.channels.remove_by_name(&channel.name()).await;
				Ok(())
			}
			Err(err) => Err(err),
		},
		Role::Subscriber => match on_subscriber_session(state.clone(), session.clone(), tracer, name, cancel.clone()).await {
			Ok(audience) => {
				session.closed().await;
				// §9: detach the audience from every channel's track set
				// before dropping it from the registry.
				state.channels.detach_audience_everywhere(&audience.id).await;
				let _ = state.audiences.remove_by_id(&audience.id).await;
				Ok(())
			}
			Err(err) => Err(err),
		},
	};

	cancel.cancel();
	session.close().await;
	result.map_err(anyhow::Error::from)
}

/// Polls `session.transport_stats()` at `interval` for the lifetime of the
/// connection, feeding each snapshot to `tracer`, and on a due fluctuation
/// check runs the rate-adaptation trigger/adapt sequence (§4.5, §4.6). A
/// session with no transport to sample (`transport_stats` returns `None`)
/// is simply never ticked.
fn spawn_metrics_ticker(session: Arc<dyn super::Session>, tracer: Arc<ConnectionTracer>, state: Arc<RouterState>, interval: std::time::Duration, cancel: CancellationToken) {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => return,
				_ = tokio::time::sleep(interval) => {}
			}

			let Some(stats) = session.transport_stats().await else {
				continue;
			};
			let update = tracer.sample(stats);

			if !update.fluctuation_check_due {
				continue;
			}

			let report = tracer.fluctuation_check();
			let Some(trigger) = crate::tracer::adaptation::trigger(report.rtt_ema_variance, update.drop_rate, update.retransmission_rate) else {
				continue;
			};

			if trigger.drop_rate_exceeded {
				tracer.reset_drop_counters();
			}
			if trigger.retransmission_rate_exceeded {
				tracer.reset_retransmission_counters();
			}

			let Ok(audience) = state.audiences.find_by_session(&session).await else {
				continue;
			};
			let Some(channel) = audience.current_channel().await else {
				continue;
			};
			if let Err(err) = state.rate_adaptation.adapt(&tracer, &channel, trigger.direction).await {
				warn!(audience = %audience.id, error = %err, "rate adaptation failed");
			}
		}
	});
}
