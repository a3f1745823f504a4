//! An in-memory stand-in for a real QUIC/WebTransport session, used by the
//! router's own test suite and the crate's integration tests. It implements
//! just enough of [`super::Session`] to drive the scenarios in the router's
//! tests: announcements and subscribe requests are injected by the harness
//! through [`FakeSession::inject_announce`]/[`FakeSession::inject_subscribe`],
//! remote tracks are pre-registered with [`FakeSession::provide_remote_track`],
//! and objects written to a local track can be observed with
//! [`FakeSession::take_local_track`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use super::{ForwardingPreference, Object, Session, SubscribeRequest, TrackReader, TrackWriter, TransportStats};

pub struct FakeTrackReader {
	rx: mpsc::UnboundedReceiver<Object>,
}

#[async_trait]
impl TrackReader for FakeTrackReader {
	async fn read(&mut self) -> anyhow::Result<Option<Object>> {
		Ok(self.rx.recv().await)
	}
}

#[derive(Clone)]
pub struct FakeTrackWriter {
	tx: mpsc::UnboundedSender<Object>,
}

#[async_trait]
impl TrackWriter for FakeTrackWriter {
	async fn write(&mut self, object: Object) -> anyhow::Result<()> {
		self.tx
			.send(object)
			.map_err(|_| anyhow::anyhow!("fake track closed"))
	}
}

/// Creates a linked reader/writer pair, standing in for a track that a
/// publisher writes onto and the relay reads from.
pub fn track_pair() -> (FakeTrackWriter, FakeTrackReader) {
	let (tx, rx) = mpsc::unbounded_channel();
	(FakeTrackWriter { tx }, FakeTrackReader { rx })
}

pub struct FakeSession {
	name: String,
	remote_tracks: Mutex<HashMap<String, mpsc::UnboundedReceiver<Object>>>,
	local_tracks: Mutex<HashMap<String, Option<mpsc::UnboundedReceiver<Object>>>>,
	announces: AsyncMutex<mpsc::UnboundedReceiver<String>>,
	announce_tx: mpsc::UnboundedSender<String>,
	subscribes: AsyncMutex<mpsc::UnboundedReceiver<SubscribeRequest>>,
	subscribe_tx: mpsc::UnboundedSender<SubscribeRequest>,
	pub announced: Mutex<Vec<String>>,
	pub accepted: Mutex<Vec<String>>,
	pub rejected: Mutex<Vec<(u32, String)>>,
	pub announce_rejected: Mutex<Vec<(u32, String)>>,
	pub unsubscribed: Mutex<Vec<u64>>,
	is_closed: AtomicBool,
	closed_notify: Notify,
	transport_stats: Mutex<Option<TransportStats>>,
}

impl FakeSession {
	pub fn new(name: impl Into<String>) -> Self {
		let (announce_tx, announce_rx) = mpsc::unbounded_channel();
		let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
		Self {
			name: name.into(),
			remote_tracks: Mutex::new(HashMap::new()),
			local_tracks: Mutex::new(HashMap::new()),
			announces: AsyncMutex::new(announce_rx),
			announce_tx,
			subscribes: AsyncMutex::new(subscribe_rx),
			subscribe_tx,
			announced: Mutex::new(Vec::new()),
			accepted: Mutex::new(Vec::new()),
			rejected: Mutex::new(Vec::new()),
			announce_rejected: Mutex::new(Vec::new()),
			unsubscribed: Mutex::new(Vec::new()),
			is_closed: AtomicBool::new(false),
			closed_notify: Notify::new(),
			transport_stats: Mutex::new(None),
		}
	}

	/// Sets the snapshot `transport_stats` returns, for tests driving the
	/// metrics ticker without a real QUIC connection.
	pub fn set_transport_stats(&self, stats: TransportStats) {
		*self.transport_stats.lock().unwrap() = Some(stats);
	}

	/// Simulates the remote peer sending ANNOUNCE(namespace).
	pub fn inject_announce(&self, namespace: impl Into<String>) {
		let _ = self.announce_tx.send(namespace.into());
	}

	/// Simulates the remote peer sending SUBSCRIBE.
	pub fn inject_subscribe(&self, namespace: &str, track_name: &str) {
		let _ = self.subscribe_tx.send(SubscribeRequest {
			subscribe_id: next_id(),
			track_alias: next_id(),
			namespace: namespace.to_string(),
			track_name: track_name.to_string(),
		});
	}

	/// Registers a remote track the session will serve on `subscribe`, and
	/// returns the writer side so test code can push objects onto it.
	pub fn provide_remote_track(&self, name: &str) -> mpsc::UnboundedSender<Object> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.remote_tracks.lock().unwrap().insert(name.to_string(), rx);
		tx
	}

	/// Takes the receiver for a local track this session created via
	/// `create_track`, so test code can observe what the relay wrote to it.
	/// Panics if the track was never created or was already taken.
	pub fn take_local_track(&self, name: &str) -> mpsc::UnboundedReceiver<Object> {
		self.local_tracks
			.lock()
			.unwrap()
			.get_mut(name)
			.and_then(|slot| slot.take())
			.unwrap_or_else(|| panic!("local track {name} not created or already taken on {}", self.name))
	}
}

fn next_id() -> u64 {
	use std::sync::atomic::{AtomicU64, Ordering};
	static NEXT: AtomicU64 = AtomicU64::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}

#[async_trait]
impl Session for FakeSession {
	async fn announce(&self, namespace: &str) -> anyhow::Result<()> {
		self.announced.lock().unwrap().push(namespace.to_string());
		Ok(())
	}

	async fn next_announce(&self) -> anyhow::Result<Option<String>> {
		Ok(self.announces.lock().await.recv().await)
	}

	async fn reject_announce(&self, status_code: u32, reason: &str) -> anyhow::Result<()> {
		self.announce_rejected.lock().unwrap().push((status_code, reason.to_string()));
		Ok(())
	}

	async fn next_subscribe(&self) -> anyhow::Result<Option<SubscribeRequest>> {
		Ok(self.subscribes.lock().await.recv().await)
	}

	async fn subscribe(
		&self,
		_subscribe_id: u64,
		_track_alias: u64,
		_namespace: &str,
		track_name: &str,
	) -> anyhow::Result<Box<dyn TrackReader>> {
		let rx = self
			.remote_tracks
			.lock()
			.unwrap()
			.remove(track_name)
			.ok_or_else(|| anyhow::anyhow!("no such remote track: {track_name} on {}", self.name))?;
		Ok(Box::new(FakeTrackReader { rx }))
	}

	async fn unsubscribe(&self, subscribe_id: u64) -> anyhow::Result<()> {
		self.unsubscribed.lock().unwrap().push(subscribe_id);
		Ok(())
	}

	async fn create_track(&self, track_name: &str) -> anyhow::Result<Box<dyn TrackWriter>> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.local_tracks.lock().unwrap().insert(track_name.to_string(), Some(rx));
		Ok(Box::new(FakeTrackWriter { tx }))
	}

	async fn accept_subscribe(&self, track_name: &str) -> anyhow::Result<()> {
		self.accepted.lock().unwrap().push(track_name.to_string());
		Ok(())
	}

	async fn reject_subscribe(&self, status_code: u32, reason: &str) -> anyhow::Result<()> {
		self.rejected.lock().unwrap().push((status_code, reason.to_string()));
		Ok(())
	}

	async fn close(&self) {
		self.is_closed.store(true, Ordering::SeqCst);
		self.closed_notify.notify_waiters();
	}

	async fn closed(&self) {
		loop {
			if self.is_closed.load(Ordering::SeqCst) {
				return;
			}
			let notified = self.closed_notify.notified();
			if self.is_closed.load(Ordering::SeqCst) {
				return;
			}
			notified.await;
		}
	}

	async fn transport_stats(&self) -> Option<TransportStats> {
		*self.transport_stats.lock().unwrap()
	}
}

pub fn fake_object(group_id: u64, object_id: u64, payload: &[u8]) -> Object {
	Object {
		group_id,
		object_id,
		payload: bytes::Bytes::copy_from_slice(payload),
		forwarding_preference: ForwardingPreference::Stream,
		publisher_priority: 0,
	}
}
