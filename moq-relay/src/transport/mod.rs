//! The seam between the router and the raw QUIC/WebTransport library.
//!
//! `moq-transport` is an external collaborator (the real wire codec and
//! stream multiplexer). The router never calls into it directly; it only
//! ever sees these traits, so the whole core can be exercised against the
//! fake implementation under `tests/` without a QUIC stack.

pub mod fake;
pub mod quic;
mod moq_transport_session;

use async_trait::async_trait;
use bytes::Bytes;

/// The role a session plays with respect to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// Remote peer is a publisher; the relay subscribes to its tracks.
	Publisher,
	/// Remote peer is a subscriber; the relay publishes tracks to it.
	Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingPreference {
	Stream,
	Datagram,
}

/// A single MoQ transport object: the unit carried by a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
	pub group_id: u64,
	pub object_id: u64,
	pub payload: Bytes,
	pub forwarding_preference: ForwardingPreference,
	pub publisher_priority: u8,
}

/// A polled snapshot of the underlying QUIC connection's counters (§4.5),
/// the non-blocking surface a per-connection ticker samples at
/// `TracerConfig.check_interval` and feeds to `ConnectionTracer::sample`.
/// Cumulative since connection start, mirroring how a real QUIC stack
/// reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
	pub packets_sent: u64,
	pub bytes_sent: u64,
	pub packets_received: u64,
	pub bytes_received: u64,
	pub packets_lost: u64,
	pub rtt_us: f64,
	pub cwnd_bytes: f64,
}

/// A remote track being read from, group/object-ordered.
#[async_trait]
pub trait TrackReader: Send + Sync {
	/// Reads the next object. Returns `Ok(None)` on graceful end of track,
	/// `Err` on a transport failure (terminal; the caller must not retry).
	async fn read(&mut self) -> anyhow::Result<Option<Object>>;
}

/// A local (fan-out) track being written to, group/object-ordered.
#[async_trait]
pub trait TrackWriter: Send + Sync {
	async fn write(&mut self, object: Object) -> anyhow::Result<()>;
}

/// An incoming SUBSCRIBE control message (§6).
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
	pub subscribe_id: u64,
	pub track_alias: u64,
	pub namespace: String,
	pub track_name: String,
}

/// A MoQ session: either side of an accepted WebTransport connection.
#[async_trait]
pub trait Session: Send + Sync {
	/// Announces `namespace` to the remote peer. Used by the relay when
	/// accepting a subscriber session to pre-announce `"channels"`, and by
	/// a publisher session once its channel name is known.
	async fn announce(&self, namespace: &str) -> anyhow::Result<()>;

	/// Waits for the remote peer's next ANNOUNCE, returning the announced
	/// namespace. Returns `Ok(None)` when the session ends before one
	/// arrives.
	async fn next_announce(&self) -> anyhow::Result<Option<String>>;

	/// Rejects a pending ANNOUNCE with a MoQ status code (ANNOUNCE_ERROR).
	async fn reject_announce(&self, status_code: u32, reason: &str) -> anyhow::Result<()>;

	/// Waits for the remote peer's next SUBSCRIBE. Returns `Ok(None)` when
	/// the session ends before one arrives.
	async fn next_subscribe(&self) -> anyhow::Result<Option<SubscribeRequest>>;

	/// Subscribes to `track_name` under `namespace` on the remote peer,
	/// returning a reader for the resulting track.
	async fn subscribe(
		&self,
		subscribe_id: u64,
		track_alias: u64,
		namespace: &str,
		track_name: &str,
	) -> anyhow::Result<Box<dyn TrackReader>>;

	/// Unsubscribes a previously issued subscription, per the catalog-track
	/// handshake in §4.4 ("read exactly one object... unsubscribe").
	async fn unsubscribe(&self, subscribe_id: u64) -> anyhow::Result<()>;

	/// Registers a new local track that the remote peer may subscribe to.
	async fn create_track(&self, track_name: &str) -> anyhow::Result<Box<dyn TrackWriter>>;

	/// Accepts a pending subscription from the remote peer, binding it to
	/// `track_name` (a track previously returned by `create_track`).
	async fn accept_subscribe(&self, track_name: &str) -> anyhow::Result<()>;

	/// Rejects a pending subscription with a MoQ status code.
	async fn reject_subscribe(&self, status_code: u32, reason: &str) -> anyhow::Result<()>;

	async fn close(&self);

	/// Waits for the underlying connection to actually close (§6). This is
	/// distinct from the control-message exchange completing: a publisher's
	/// announce+catalog handshake finishing does not mean its connection is
	/// done, since the media-pump tasks it started keep running until the
	/// peer disconnects.
	async fn closed(&self);

	/// A snapshot of this session's transport counters, for the
	/// per-connection metrics ticker to feed into its `ConnectionTracer`.
	/// `None` when the session has no underlying transport to sample.
	async fn transport_stats(&self) -> Option<TransportStats> {
		None
	}
}
