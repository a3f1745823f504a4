//! The process-singleton list of connected audiences (§4.3). Identifier
//! uniqueness is guaranteed by generation (128-bit random); the registry
//! never has to arbitrate a collision.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::Channel;
use crate::error::RelayError;
use crate::transport::Session;

/// Identified by an opaque id and a display name, defaulting to the id.
/// Holds a non-owning reference to the subscriber's session (§9: the
/// session is owned by the transport layer, not by the audience).
pub struct Audience {
	pub id: String,
	pub name: String,
	pub session: Arc<dyn Session>,
	/// The video track this audience currently receives, if any, used by
	/// the rate-adaptation controller to resolve "current track" (§4.6).
	current_video_track: Mutex<Option<String>>,
	/// The channel this audience is currently subscribed on, if any, used
	/// by the per-connection metrics ticker to resolve which channel's
	/// track-audience bookkeeping a rate-adaptation decision should mutate
	/// (§4.6) and by session teardown to detach the audience everywhere
	/// (§9).
	current_channel: Mutex<Option<Arc<Channel>>>,
}

impl Audience {
	pub async fn current_video_track(&self) -> Option<String> {
		self.current_video_track.lock().await.clone()
	}

	pub async fn set_current_video_track(&self, track: Option<String>) {
		*self.current_video_track.lock().await = track;
	}

	pub async fn current_channel(&self) -> Option<Arc<Channel>> {
		self.current_channel.lock().await.clone()
	}

	pub async fn set_current_channel(&self, channel: Option<Arc<Channel>>) {
		*self.current_channel.lock().await = channel;
	}
}

#[derive(Default)]
pub struct AudienceRegistry {
	audiences: Mutex<Vec<Arc<Audience>>>,
}

impl AudienceRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub async fn create(&self, name: Option<String>, session: Arc<dyn Session>) -> Arc<Audience> {
		let id = generate_id();
		let audience = Arc::new(Audience {
			name: name.unwrap_or_else(|| id.clone()),
			id,
			session,
			current_video_track: Mutex::new(None),
			current_channel: Mutex::new(None),
		});
		self.audiences.lock().await.push(audience.clone());
		audience
	}

	pub async fn remove_by_id(&self, id: &str) -> Result<(), RelayError> {
		let mut audiences = self.audiences.lock().await;
		let before = audiences.len();
		audiences.retain(|a| a.id != id);
		if audiences.len() == before {
			return Err(RelayError::NotFound(id.to_string()));
		}
		Ok(())
	}

	pub async fn find_by_id(&self, id: &str) -> Result<Arc<Audience>, RelayError> {
		self.audiences
			.lock()
			.await
			.iter()
			.find(|a| a.id == id)
			.cloned()
			.ok_or_else(|| RelayError::NotFound(id.to_string()))
	}

	pub async fn find_by_name(&self, name: &str) -> Result<Arc<Audience>, RelayError> {
		self.audiences
			.lock()
			.await
			.iter()
			.find(|a| a.name == name)
			.cloned()
			.ok_or_else(|| RelayError::NotFound(name.to_string()))
	}

	pub async fn names(&self) -> Vec<String> {
		self.audiences.lock().await.iter().map(|a| a.name.clone()).collect()
	}

	/// Finds the audience owning `session`, by pointer identity of the
	/// session handle (§4.3), the same `Arc::ptr_eq` pattern
	/// `EntityTracerIndex::index_by_tracer` uses to resolve a tracer back to
	/// its entity. Used by the metrics ticker and by session teardown,
	/// neither of which hold an audience id directly.
	pub async fn find_by_session(&self, session: &Arc<dyn Session>) -> Result<Arc<Audience>, RelayError> {
		self.audiences
			.lock()
			.await
			.iter()
			.find(|a| Arc::ptr_eq(&a.session, session))
			.cloned()
			.ok_or_else(|| RelayError::NotFound("no audience for session".to_string()))
	}
}

fn generate_id() -> String {
	use rand::RngCore;
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::fake::FakeSession;

	fn fake_session() -> Arc<dyn Session> {
		Arc::new(FakeSession::new("test"))
	}

	#[tokio::test]
	async fn create_and_find_by_name() {
		let registry = AudienceRegistry::new();
		let audience = registry.create(Some("alice".into()), fake_session()).await;

		let found = registry.find_by_name("alice").await.unwrap();
		assert_eq!(found.id, audience.id);
	}

	#[tokio::test]
	async fn remove_missing_audience_not_found() {
		let registry = AudienceRegistry::new();
		assert!(matches!(registry.remove_by_id("missing").await.unwrap_err(), RelayError::NotFound(_)));
	}

	#[tokio::test]
	async fn name_defaults_to_id_when_absent() {
		let registry = AudienceRegistry::new();
		let audience = registry.create(None, fake_session()).await;
		assert_eq!(audience.name, audience.id);
	}

	#[tokio::test]
	async fn find_by_session_matches_the_owning_audience() {
		let registry = AudienceRegistry::new();
		let session = fake_session();
		let audience = registry.create(Some("alice".into()), session.clone()).await;
		registry.create(Some("bob".into()), fake_session()).await;

		let found = registry.find_by_session(&session).await.unwrap();
		assert_eq!(found.id, audience.id);
	}

	#[tokio::test]
	async fn find_by_session_unknown_session_not_found() {
		let registry = AudienceRegistry::new();
		registry.create(Some("alice".into()), fake_session()).await;
		assert!(matches!(registry.find_by_session(&fake_session()).await.unwrap_err(), RelayError::NotFound(_)));
	}
}
