//! The session router (§4.4): the per-session control-message handler that
//! turns announcements and subscriptions into a dynamic subscription
//! graph, and that streams objects from each publisher's remote track onto
//! the fan-out local track of every matching subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moq_catalog::Catalog;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audience::{Audience, AudienceRegistry};
use crate::channel::{Channel, ChannelRegistry, AUDIO_TRACK};
use crate::error::RelayError;
use crate::index::{Entity, EntityTracerIndex};
use crate::tracer::adaptation::RateAdaptationController;
use crate::tracer::ConnectionTracer;
use crate::transport::{ForwardingPreference, Object, Session, TrackReader};

/// The bridge's internal subscribe/track-alias numbering (§4.4.3): the
/// private range with the top 32 bits set, chosen to never collide with
/// the catalog track's alias `0` or any publisher-assigned alias.
pub const BRIDGE_ALIAS_BASE: u64 = 0xFFFF_FFFF_0000_0000;

pub const CATALOG_TRACK_NAME: &str = "catalogTrack";
pub const CHANNELS_NAMESPACE: &str = "channels";
pub const CHANNELS_TRACK_NAME: &str = "list";

static NEXT_TRACK_SUBSCRIBE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(0);

fn next_bridge_id() -> u64 {
	BRIDGE_ALIAS_BASE + NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// The process-wide state every session handler needs (§2.1): constructed
/// once in `main` and handed by `Arc` clone to every accepted session.
pub struct RouterState {
	pub channels: Arc<ChannelRegistry>,
	pub audiences: Arc<AudienceRegistry>,
	pub index: Arc<EntityTracerIndex>,
	pub rate_adaptation: Arc<RateAdaptationController>,
}

impl RouterState {
	pub fn new(channels: Arc<ChannelRegistry>, audiences: Arc<AudienceRegistry>, index: Arc<EntityTracerIndex>) -> Arc<Self> {
		let rate_adaptation = Arc::new(RateAdaptationController::new(index.clone()));
		Arc::new(Self { channels, audiences, index, rate_adaptation })
	}
}

/// Handles one publisher (streamer) session end to end: registers it as a
/// pending channel, processes its single ANNOUNCE, fetches the catalog,
/// and starts a media-pump task per track. Returns once the announcement
/// handshake is complete; the pump tasks keep running in the background
/// until `cancel` fires or their remote reads fail.
pub async fn on_publisher_session(
	state: Arc<RouterState>,
	session: Arc<dyn Session>,
	tracer: Arc<ConnectionTracer>,
	cancel: CancellationToken,
) -> Result<Arc<Channel>, RelayError> {
	let channel = state.channels.create(None).await?;
	state.index.append(Entity::Channel(channel.clone()), tracer).await;

	let Some(namespace) = session
		.next_announce()
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?
	else {
		return Err(RelayError::Transport("session closed before announcing".into()));
	};

	if let Err(err) = state.channels.rename(&channel, namespace.clone()).await {
		let _ = session.reject_announce(err.status_code(), &err.to_string()).await;
		return Err(err);
	}
	channel.mark_live().await;
	info!(channel = %namespace, "publisher announced");

	let catalog = fetch_catalog(&session, &namespace).await?;
	let tracks = catalog.tracks.clone();
	channel.set_catalog(catalog).await;

	// Every fan-out bus exists before this function returns, so a
	// subscriber racing in immediately after catalog-known always finds
	// the track it's looking for (§4.8: catalog-known precedes any media
	// subscription being fulfillable).
	for track in &tracks {
		channel.local_track_sender(&track.name).await;
	}

	for track in tracks {
		let session = session.clone();
		let channel = channel.clone();
		let cancel = cancel.clone();
		let track_name = track.name.clone();
		tokio::spawn(async move {
			if let Err(err) = start_media_pump(session, channel, track_name.clone(), cancel).await {
				error!(track = %track_name, error = %err, "media pump exited");
			}
		});
	}

	Ok(channel)
}

/// Subscribes to `namespace/catalogTrack` (subscribe id 0, track alias 0),
/// reads exactly one object, parses it, and unsubscribes (§4.4 step 3).
async fn fetch_catalog(session: &Arc<dyn Session>, namespace: &str) -> Result<Catalog, RelayError> {
	let mut reader = session
		.subscribe(0, 0, namespace, CATALOG_TRACK_NAME)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?;

	let object = reader
		.read()
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?
		.ok_or_else(|| RelayError::Internal("publisher closed catalog track without writing".into()))?;

	let _ = session.unsubscribe(0).await;

	Catalog::parse(&object.payload).map_err(RelayError::MalformedCatalog)
}

/// `pump(remote_track, local_track)` (§4.4 Media-pump task): subscribes to
/// `track_name` on the publisher's session and forwards every object it
/// reads, unchanged, onto the channel's fan-out bus for that track.
async fn start_media_pump(
	session: Arc<dyn Session>,
	channel: Arc<Channel>,
	track_name: String,
	cancel: CancellationToken,
) -> Result<(), RelayError> {
	let subscribe_id = NEXT_TRACK_SUBSCRIBE_ID.fetch_add(1, Ordering::Relaxed);
	let mut remote = session
		.subscribe(subscribe_id, subscribe_id, &channel.name(), &track_name)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?;

	let bus = channel.local_track_sender(&track_name).await;

	loop {
		let object = tokio::select! {
			_ = cancel.cancelled() => {
				info!(track = %track_name, "media pump cancelled");
				return Ok(());
			}
			result = remote.read() => result,
		};

		match object {
			Ok(Some(object)) => {
				// A lagging/absent subscriber is not the pump's problem;
				// `send` only fails when there are zero receivers.
				let _ = bus.send(object);
			}
			Ok(None) => {
				info!(track = %track_name, "media pump: remote track ended");
				return Ok(());
			}
			Err(err) => {
				warn!(track = %track_name, error = %err, "media pump: remote read failed, terminating");
				return Ok(());
			}
		}
	}
}

/// Handles one subscriber (audience) session end to end (§6): the relay
/// immediately announces `"channels"`, then answers subscribe requests
/// until the session ends.
pub async fn on_subscriber_session(
	state: Arc<RouterState>,
	session: Arc<dyn Session>,
	tracer: Arc<ConnectionTracer>,
	name: Option<String>,
	cancel: CancellationToken,
) -> Result<Arc<Audience>, RelayError> {
	let audience = state.audiences.create(name, session.clone()).await;
	state.index.append(Entity::Audience(audience.clone()), tracer.clone()).await;

	session
		.announce(CHANNELS_NAMESPACE)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?;

	while let Some(request) = session
		.next_subscribe()
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?
	{
		if let Err(err) = handle_subscription(&state, &audience, &session, &tracer, &request.namespace, &request.track_name, cancel.clone()).await {
			warn!(namespace = %request.namespace, track = %request.track_name, error = %err, "subscription rejected");
			let _ = session.reject_subscribe(err.status_code(), &err.to_string()).await;
		}
	}

	Ok(audience)
}

/// Dispatches a SUBSCRIBE on the (namespace, track name) pair (§4.4
/// Subscription handler).
async fn handle_subscription(
	state: &Arc<RouterState>,
	audience: &Arc<Audience>,
	session: &Arc<dyn Session>,
	tracer: &Arc<ConnectionTracer>,
	namespace: &str,
	track_name: &str,
	cancel: CancellationToken,
) -> Result<(), RelayError> {
	if namespace == CHANNELS_NAMESPACE {
		let names = state.channels.list_names().await;
		let payload = serde_json::to_vec(&names).map_err(|e| RelayError::Internal(e.to_string()))?;
		return write_meta_object(session, CHANNELS_TRACK_NAME, 0, 0, payload).await;
	}

	let channel = state.channels.lookup_by_name(namespace).await?;

	if track_name == CATALOG_TRACK_NAME {
		let catalog = channel.catalog().await.ok_or_else(|| RelayError::NotFound(namespace.to_string()))?;
		let payload = catalog.encode_tracks().map_err(RelayError::MalformedCatalog)?;
		return write_meta_object(session, CATALOG_TRACK_NAME, 0, 1, payload).await;
	}

	// §8: a catalog with no tracks, or one that simply doesn't list
	// `track_name`, yields `NotFound` for any non-meta track. This must be
	// checked before any registry mutation below, so a lookup for a
	// nonexistent track never leaves a phantom audience entry behind.
	let catalog = channel.catalog().await.ok_or_else(|| RelayError::NotFound(track_name.to_string()))?;
	if catalog.track(track_name).is_none() {
		return Err(RelayError::NotFound(track_name.to_string()));
	}

	channel.add_audience_to_track(track_name, &audience.id).await?;
	audience.set_current_channel(Some(channel.clone())).await;
	if track_name != AUDIO_TRACK {
		audience.set_current_video_track(Some(track_name.to_string())).await;
	}

	let local_writer = match session.create_track(track_name).await {
		Ok(writer) => Some(writer),
		Err(err) => {
			// §4.4 step 3: "tolerating a DuplicateEntry error"; a bridge
			// task from a prior subscription to this track is presumably
			// still forwarding, so there's nothing more to wire up.
			info!(track = %track_name, error = %err, "local track already registered, tolerating");
			None
		}
	};

	if let Some(writer) = local_writer {
		let bridge_id = next_bridge_id();
		let is_video = track_name != AUDIO_TRACK;
		let Some(source) = channel.local_track_receiver(track_name).await else {
			return Err(RelayError::TrackNotFound(track_name.to_string()));
		};
		let track_name_owned = track_name.to_string();
		let tracer = tracer.clone();
		tokio::spawn(async move {
			bridge_forward(bridge_id, source, writer, track_name_owned, is_video, tracer, cancel).await;
		});
	}

	session
		.accept_subscribe(track_name)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))
}

/// The bridge-track join policy (§4.4.3): for video, discard objects until
/// the first `object_id == 0` arrives, then forward unconditionally.
/// Audio forwards unconditionally from the moment of subscription.
async fn bridge_forward(
	bridge_id: u64,
	mut source: tokio::sync::broadcast::Receiver<Object>,
	mut writer: Box<dyn crate::transport::TrackWriter>,
	track_name: String,
	is_video: bool,
	tracer: Arc<ConnectionTracer>,
	cancel: CancellationToken,
) {
	let mut joined = !is_video;
	loop {
		let object = tokio::select! {
			_ = cancel.cancelled() => return,
			result = source.recv() => result,
		};

		let object = match object {
			Ok(object) => object,
			Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
			Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
				warn!(bridge = bridge_id, track = %track_name, skipped, "bridge fell behind, skipping to latest");
				for _ in 0..skipped {
					tracer.on_dropped_packet();
				}
				continue;
			}
		};

		if !joined {
			if object.object_id == 0 {
				joined = true;
			} else {
				continue;
			}
		}

		if let Err(err) = writer.write(object).await {
			warn!(bridge = bridge_id, track = %track_name, error = %err, "bridge forward failed, closing");
			return;
		}
	}
}

/// The meta-object write helper (§4.4.2): creates a new local track,
/// registers it on the session, writes exactly one object with
/// forwarding-preference = stream, then accepts the subscription pointing
/// at that track.
async fn write_meta_object(
	session: &Arc<dyn Session>,
	track_name: &str,
	group_id: u64,
	object_id: u64,
	payload: Vec<u8>,
) -> Result<(), RelayError> {
	let mut writer = session
		.create_track(track_name)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?;

	writer
		.write(Object {
			group_id,
			object_id,
			payload: payload.into(),
			forwarding_preference: ForwardingPreference::Stream,
			publisher_priority: 0,
		})
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))?;

	session
		.accept_subscribe(track_name)
		.await
		.map_err(|e| RelayError::Transport(e.to_string()))
}
