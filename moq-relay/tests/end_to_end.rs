//! Literal end-to-end scenarios driven entirely against `FakeSession`: a
//! publisher announces and serves a catalog, audiences subscribe to the
//! channel list, the catalog, and individual tracks, and a drop-rate spike
//! drives a rate-adapted re-subscription.

use std::sync::Arc;
use std::time::Duration;

use moq_catalog::{Catalog, CommonTrackFields, SelectionParams, Track};
use moq_relay::audience::AudienceRegistry;
use moq_relay::channel::ChannelRegistry;
use moq_relay::index::EntityTracerIndex;
use moq_relay::session::{on_publisher_session, on_subscriber_session, RouterState};
use moq_relay::tracer::{ConnectionTracer, TracerConfig};
use moq_relay::transport::fake::{fake_object, FakeSession};
use tokio_util::sync::CancellationToken;

fn sample_catalog() -> Catalog {
	Catalog {
		version: 1,
		streaming_format: 1,
		streaming_format_version: "1".to_string(),
		common_track_fields: CommonTrackFields {
			namespace: "cam1".to_string(),
			packaging: "cmaf".to_string(),
			render_group: 0,
		},
		tracks: vec![
			Track {
				name: "audio".to_string(),
				label: None,
				alt_group: None,
				selection_params: SelectionParams {
					codec: "opus".to_string(),
					mime_type: "audio/webm".to_string(),
					bitrate: 64_000,
					samplerate: Some(48_000),
					..Default::default()
				},
			},
			Track {
				name: "hd".to_string(),
				label: None,
				alt_group: None,
				selection_params: SelectionParams {
					codec: "avc1".to_string(),
					mime_type: "video/mp4".to_string(),
					width: Some(1920),
					height: Some(1080),
					bitrate: 4_000_000,
					..Default::default()
				},
			},
			Track {
				name: "hd-ra".to_string(),
				label: None,
				alt_group: Some(1),
				selection_params: SelectionParams {
					codec: "avc1".to_string(),
					mime_type: "video/mp4".to_string(),
					width: Some(1280),
					height: Some(720),
					bitrate: 1_200_000,
					..Default::default()
				},
			},
		],
	}
}

fn router_state() -> Arc<RouterState> {
	RouterState::new(ChannelRegistry::new(), AudienceRegistry::new(), EntityTracerIndex::new())
}

fn tracer() -> Arc<ConnectionTracer> {
	Arc::new(ConnectionTracer::new("test-conn".to_string(), TracerConfig::default()).unwrap())
}

/// Spawns a publisher session: injects the ANNOUNCE and the catalog
/// object, and waits for `on_publisher_session` to return its channel.
/// Also returns a sender for each catalog track's *remote* side, so a test
/// can drive the real media-pump task instead of writing to the channel's
/// fan-out bus directly.
async fn publish_channel(
	state: &Arc<RouterState>,
	name: &str,
	catalog: &Catalog,
) -> (Arc<moq_relay::channel::Channel>, std::collections::HashMap<String, tokio::sync::mpsc::UnboundedSender<moq_relay::transport::Object>>) {
	let publisher = Arc::new(FakeSession::new(format!("publisher-{name}")));
	publisher.inject_announce(name);
	let catalog_tx = publisher.provide_remote_track("catalogTrack");
	catalog_tx.send(fake_object(0, 0, &catalog.encode().unwrap())).unwrap();

	let mut senders = std::collections::HashMap::new();
	for track in &catalog.tracks {
		senders.insert(track.name.clone(), publisher.provide_remote_track(&track.name));
	}

	let cancel = CancellationToken::new();
	let channel = on_publisher_session(state.clone(), publisher, tracer(), cancel).await.unwrap();
	(channel, senders)
}

#[tokio::test]
async fn announcing_a_catalog_makes_every_track_subscribable() {
	let state = router_state();
	let catalog = sample_catalog();
	let (channel, _senders) = publish_channel(&state, "cam1", &catalog).await;

	assert_eq!(channel.name(), "cam1");
	assert!(channel.is_live().await);
	assert_eq!(channel.catalog().await.unwrap().tracks.len(), 3);

	for track in &catalog.tracks {
		assert!(channel.local_track_receiver(&track.name).await.is_some());
	}
}

#[tokio::test]
async fn channels_list_subscription_returns_announced_names() {
	let state = router_state();
	publish_channel(&state, "cam1", &sample_catalog()).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("channels", "list");

	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state, audience_session_for_router, tracer(), None, cancel).await
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	handle.abort();

	let mut local = audience_session.take_local_track("list");
	let object = local.recv().await.unwrap();
	let names: Vec<String> = serde_json::from_slice(&object.payload).unwrap();
	assert_eq!(names, vec!["cam1"]);
	assert!(audience_session.accepted.lock().unwrap().contains(&"list".to_string()));
}

#[tokio::test]
async fn catalog_track_subscription_returns_tracks_array() {
	let state = router_state();
	let catalog = sample_catalog();
	publish_channel(&state, "cam1", &catalog).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("cam1", "catalogTrack");

	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state, audience_session_for_router, tracer(), None, cancel).await
	});

	tokio::time::sleep(Duration::from_millis(20)).await;
	handle.abort();

	let mut local = audience_session.take_local_track("catalogTrack");
	let object = local.recv().await.unwrap();
	let value: serde_json::Value = serde_json::from_slice(&object.payload).unwrap();
	assert_eq!(value["tracks"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn subscriber_receives_objects_published_after_catalog_join() {
	let state = router_state();
	let catalog = sample_catalog();
	let (channel, _senders) = publish_channel(&state, "cam1", &catalog).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("cam1", "hd");

	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state, audience_session_for_router, tracer(), None, cancel).await
	});

	// Give the subscription handler time to register the bridge before the
	// first object (object_id 0, the bridge's join point) is published.
	tokio::time::sleep(Duration::from_millis(20)).await;

	let bus = channel.local_track_sender("hd").await;
	bus.send(fake_object(0, 0, b"frame-0")).unwrap();

	let mut local = audience_session.take_local_track("hd");
	let object = tokio::time::timeout(Duration::from_millis(200), local.recv()).await.unwrap().unwrap();
	assert_eq!(&object.payload[..], b"frame-0");

	handle.abort();
}

#[tokio::test]
async fn object_written_by_the_publisher_reaches_the_subscriber_unchanged() {
	let state = router_state();
	let catalog = sample_catalog();
	let (_channel, senders) = publish_channel(&state, "cam1", &catalog).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("cam1", "hd");

	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state, audience_session_for_router, tracer(), None, cancel).await
	});

	// Lets the media-pump task's subscribe() and the subscriber's bridge
	// registration both land before the publisher writes.
	tokio::time::sleep(Duration::from_millis(20)).await;

	senders["hd"].send(fake_object(0, 0, b"exact-object")).unwrap();

	let mut local = audience_session.take_local_track("hd");
	let object = tokio::time::timeout(Duration::from_millis(200), local.recv()).await.unwrap().unwrap();
	assert_eq!(&object.payload[..], b"exact-object");
	assert_eq!(object.group_id, 0);
	assert_eq!(object.object_id, 0);

	handle.abort();
}

#[tokio::test]
async fn video_subscription_discards_objects_before_the_first_group_start() {
	let state = router_state();
	let catalog = sample_catalog();
	let (channel, _senders) = publish_channel(&state, "cam1", &catalog).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("cam1", "hd");

	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state, audience_session_for_router, tracer(), None, cancel).await
	});
	tokio::time::sleep(Duration::from_millis(20)).await;

	let bus = channel.local_track_sender("hd").await;
	// Mid-GoP objects before object_id 0 must never reach the subscriber.
	bus.send(fake_object(0, 3, b"mid-gop")).unwrap();
	bus.send(fake_object(0, 4, b"mid-gop")).unwrap();
	bus.send(fake_object(1, 0, b"keyframe")).unwrap();

	let mut local = audience_session.take_local_track("hd");
	let object = tokio::time::timeout(Duration::from_millis(200), local.recv()).await.unwrap().unwrap();
	assert_eq!(&object.payload[..], b"keyframe");

	handle.abort();
}

#[tokio::test]
async fn a_drop_rate_spike_resubscribes_the_audience_to_the_rate_adapted_track() {
	use moq_relay::index::Entity;
	use moq_relay::tracer::adaptation::{Direction, RateAdaptationController};

	let state = router_state();
	let catalog = sample_catalog();
	let (channel, _senders) = publish_channel(&state, "cam1", &catalog).await;

	let audience_session = Arc::new(FakeSession::new("audience"));
	audience_session.inject_subscribe("cam1", "hd");

	let audience_tracer = tracer();
	let cancel = CancellationToken::new();
	let audience_session_for_router = audience_session.clone();
	let tracer_for_router = audience_tracer.clone();
	let state_for_router = state.clone();
	let handle = tokio::spawn(async move {
		on_subscriber_session(state_for_router, audience_session_for_router, tracer_for_router, None, cancel).await
	});
	tokio::time::sleep(Duration::from_millis(20)).await;

	audience_tracer.on_received_packet(1, 100);
	for _ in 0..3 {
		audience_tracer.on_dropped_packet();
	}
	assert!(audience_tracer.drop_rate() > 0.1);

	let index = match state.index.index_by_tracer(&audience_tracer).await {
		Ok(i) => i,
		Err(_) => panic!("audience tracer was never appended to the index"),
	};
	let entity = state.index.entity_by_index(index).await.unwrap();
	let Entity::Audience(audience) = entity else {
		panic!("expected an audience entity");
	};
	assert_eq!(audience.current_video_track().await.as_deref(), Some("hd"));

	let controller = RateAdaptationController::new(state.index.clone());
	controller.adapt(&audience_tracer, &channel, Direction::Down).await.unwrap();

	assert_eq!(audience.current_video_track().await.as_deref(), Some("hd-ra"));
	assert!(channel.track_audiences("hd").await.is_empty());
	assert_eq!(channel.track_audiences("hd-ra").await, vec![audience.id.clone()]);
	assert!(audience_tracer.is_rate_adapted());

	handle.abort();
}

#[tokio::test]
async fn two_subscribers_on_the_same_track_each_see_every_object_in_order() {
	let state = router_state();
	let catalog = sample_catalog();
	let (channel, _senders) = publish_channel(&state, "cam1", &catalog).await;

	let first = Arc::new(FakeSession::new("first"));
	first.inject_subscribe("cam1", "audio");
	let second = Arc::new(FakeSession::new("second"));
	second.inject_subscribe("cam1", "audio");

	let cancel = CancellationToken::new();
	let (first_clone, second_clone) = (first.clone(), second.clone());
	let h1 = tokio::spawn({
		let state = state.clone();
		let cancel = cancel.clone();
		async move { on_subscriber_session(state, first_clone, tracer(), None, cancel).await }
	});
	let h2 = tokio::spawn({
		let cancel = cancel.clone();
		async move { on_subscriber_session(state, second_clone, tracer(), None, cancel).await }
	});
	tokio::time::sleep(Duration::from_millis(20)).await;

	let bus = channel.local_track_sender("audio").await;
	const N: u64 = 100;
	for i in 0..N {
		bus.send(fake_object(0, i, format!("sample-{i}").as_bytes())).unwrap();
	}

	let mut first_local = first.take_local_track("audio");
	let mut second_local = second.take_local_track("audio");

	for i in 0..N {
		let want = format!("sample-{i}");
		let a = tokio::time::timeout(Duration::from_millis(500), first_local.recv()).await.unwrap().unwrap();
		assert_eq!(&a.payload[..], want.as_bytes());
		let b = tokio::time::timeout(Duration::from_millis(500), second_local.recv()).await.unwrap().unwrap();
		assert_eq!(&b.payload[..], want.as_bytes());
	}

	h1.abort();
	h2.abort();
}
