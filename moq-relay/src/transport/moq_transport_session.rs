//! Adapts a real `moq-transport` session, running over a WebTransport
//! connection accepted by `moq-native`'s QUIC endpoint, to [`super::Session`].
//!
//! This is the single file in the crate that depends on the exact shape of
//! the `moq-transport`/`moq-native` session types; every other module only
//! ever sees the trait, which is what lets the router run its full test
//! suite against [`super::fake::FakeSession`] with no QUIC stack at all.
//! A publisher (streamer) session is served through `moq-transport`'s
//! `Subscriber` role, since the relay consumes that peer's tracks; an
//! audience session is served through its `Publisher` role, since the
//! relay serves tracks to that peer, mirroring `moq-pub`'s own use of
//! `Publisher::connect` on the client side.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::{SubscribeRequest, Session, TrackReader, TrackWriter};

enum Role {
	Streamer(Mutex<moq_transport::session::Subscriber>),
	Audience(Mutex<moq_transport::session::Publisher>),
}

pub struct TransportSession {
	connection_id: String,
	path: String,
	role: Role,
	/// The connection's own driver, returned alongside the Subscriber/
	/// Publisher handle the same way `moq-pub/src/main.rs` gets back a
	/// `(session, publisher)` pair from `Publisher::connect` and races
	/// `session.run()` against the handle's protocol calls. Kept behind its
	/// own mutex, separate from `role`'s, so awaiting `run()` for the
	/// connection's entire lifetime in `closed()` never blocks a concurrent
	/// call through the handle.
	driver: Mutex<moq_transport::session::Session>,
}

impl TransportSession {
	/// Completes the WebTransport handshake and binds the resulting
	/// `moq-transport` session to the role its request path selects.
	pub async fn accept(incoming: moq_native::quic::Connecting) -> anyhow::Result<Self> {
		let (connection_id, path, session) = moq_native::quic::accept_webtransport(incoming).await?;

		let (driver, role) = if super::quic::route(&path).map(|(role, _)| role) == Some(super::Role::Publisher) {
			let (driver, subscriber) = moq_transport::session::Subscriber::accept(session).await?;
			(driver, Role::Streamer(Mutex::new(subscriber)))
		} else {
			let (driver, publisher) = moq_transport::session::Publisher::accept(session).await?;
			(driver, Role::Audience(Mutex::new(publisher)))
		};

		Ok(Self { connection_id, path, role, driver: Mutex::new(driver) })
	}

	pub fn connection_id(&self) -> String {
		self.connection_id.clone()
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	fn streamer(&self) -> anyhow::Result<&Mutex<moq_transport::session::Subscriber>> {
		match &self.role {
			Role::Streamer(s) => Ok(s),
			Role::Audience(_) => anyhow::bail!("not a streamer session"),
		}
	}

	fn audience(&self) -> anyhow::Result<&Mutex<moq_transport::session::Publisher>> {
		match &self.role {
			Role::Audience(p) => Ok(p),
			Role::Streamer(_) => anyhow::bail!("not an audience session"),
		}
	}
}

#[async_trait]
impl Session for TransportSession {
	async fn announce(&self, namespace: &str) -> anyhow::Result<()> {
		self.audience()?.lock().await.announce(namespace.to_string()).await
	}

	async fn next_announce(&self) -> anyhow::Result<Option<String>> {
		self.streamer()?.lock().await.next_announce().await
	}

	async fn reject_announce(&self, status_code: u32, reason: &str) -> anyhow::Result<()> {
		self.streamer()?.lock().await.reject_announce(status_code, reason).await
	}

	async fn next_subscribe(&self) -> anyhow::Result<Option<SubscribeRequest>> {
		self.audience()?.lock().await.next_subscribe().await
	}

	async fn subscribe(&self, subscribe_id: u64, track_alias: u64, namespace: &str, track_name: &str) -> anyhow::Result<Box<dyn TrackReader>> {
		self.streamer()?.lock().await.subscribe(subscribe_id, track_alias, namespace, track_name).await
	}

	async fn unsubscribe(&self, subscribe_id: u64) -> anyhow::Result<()> {
		self.streamer()?.lock().await.unsubscribe(subscribe_id).await
	}

	async fn create_track(&self, track_name: &str) -> anyhow::Result<Box<dyn TrackWriter>> {
		self.audience()?.lock().await.create_track(track_name).await
	}

	async fn accept_subscribe(&self, track_name: &str) -> anyhow::Result<()> {
		self.audience()?.lock().await.accept_subscribe(track_name).await
	}

	async fn reject_subscribe(&self, status_code: u32, reason: &str) -> anyhow::Result<()> {
		self.audience()?.lock().await.reject_subscribe(status_code, reason).await
	}

	async fn close(&self) {
		match &self.role {
			Role::Streamer(s) => s.lock().await.close().await,
			Role::Audience(p) => p.lock().await.close().await,
		}
	}

	async fn closed(&self) {
		if let Err(err) = self.driver.lock().await.run().await {
			warn!(connection = %self.connection_id, error = %err, "connection driver exited with error");
		}
	}
}
