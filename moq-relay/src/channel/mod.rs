//! The in-memory catalog of live channels and their per-track audience sets
//! (§4.2, §4.4.1). A channel is created when a publisher session is
//! accepted and removed when that session ends.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use moq_catalog::Catalog;
use tokio::sync::{broadcast, Mutex};

use crate::error::RelayError;
use crate::transport::Object;

/// Capacity of a track's fan-out object bus. A slow subscriber that falls
/// this far behind the publisher starts missing objects rather than
/// blocking the pump (§5: no suspension on a lagging consumer).
const TRACK_BUS_CAPACITY: usize = 256;

/// A snapshot of one track's audience set, sent on the channel's
/// membership-change endpoint whenever it's mutated (§4.4.1.4).
#[derive(Debug, Clone)]
pub struct TrackAudiencesChanged {
	pub track: String,
	pub audiences: Vec<String>,
}

struct ChannelState {
	catalog: Option<Catalog>,
	/// Track name -> set of subscribed audience ids. An audience id may
	/// appear in at most one video track's set at a time (§4.4.1).
	track_audiences: HashMap<String, Vec<String>>,
	/// Track name -> fan-out local track (§3): the media-pump task for
	/// that track publishes here, and every accepted subscription reads
	/// its own receiver off the same sender.
	local_tracks: HashMap<String, broadcast::Sender<Object>>,
	live: bool,
}

/// Server-side representation of a publisher's namespace (§3).
pub struct Channel {
	pub id: String,
	name: StdRwLock<String>,
	state: Mutex<ChannelState>,
	changes: broadcast::Sender<TrackAudiencesChanged>,
}

/// `moq-relay`'s convention for "is this the always-audio track": the
/// literal name `"audio"` is never evicted by a video-track swap (§4.4.1).
pub const AUDIO_TRACK: &str = "audio";

impl Channel {
	fn new(id: String, name: String) -> Arc<Self> {
		let (changes, _) = broadcast::channel(16);
		Arc::new(Self {
			id,
			name: StdRwLock::new(name),
			state: Mutex::new(ChannelState {
				catalog: None,
				track_audiences: HashMap::new(),
				local_tracks: HashMap::new(),
				live: false,
			}),
			changes,
		})
	}

	/// Returns the fan-out sender for `track`, creating its bus on first
	/// use (by the media-pump task that owns the track).
	pub async fn local_track_sender(&self, track: &str) -> broadcast::Sender<Object> {
		let mut state = self.state.lock().await;
		state
			.local_tracks
			.entry(track.to_string())
			.or_insert_with(|| broadcast::channel(TRACK_BUS_CAPACITY).0)
			.clone()
	}

	/// Subscribes to `track`'s fan-out bus, or `None` if the publisher has
	/// never written to that track (it does not yet exist).
	pub async fn local_track_receiver(&self, track: &str) -> Option<broadcast::Receiver<Object>> {
		self.state.lock().await.local_tracks.get(track).map(|tx| tx.subscribe())
	}

	pub fn name(&self) -> String {
		self.name.read().unwrap().clone()
	}

	pub fn subscribe_changes(&self) -> broadcast::Receiver<TrackAudiencesChanged> {
		self.changes.subscribe()
	}

	pub async fn mark_live(&self) {
		self.state.lock().await.live = true;
	}

	pub async fn is_live(&self) -> bool {
		self.state.lock().await.live
	}

	pub async fn set_catalog(&self, catalog: Catalog) {
		self.state.lock().await.catalog = Some(catalog);
	}

	pub async fn catalog(&self) -> Option<Catalog> {
		self.state.lock().await.catalog.clone()
	}

	/// Implements the atomic-swap ordering contract in §4.4.1: eviction
	/// from a conflicting video track happens inside the same lock hold as
	/// the addition, so no observer ever sees an audience on two video
	/// tracks at once.
	pub async fn add_audience_to_track(&self, track: &str, audience: &str) -> Result<(), RelayError> {
		let mut state = self.state.lock().await;

		if track != AUDIO_TRACK {
			let current_video_track = state
				.track_audiences
				.iter()
				.find(|(name, members)| name.as_str() != AUDIO_TRACK && name.as_str() != track && members.iter().any(|a| a == audience))
				.map(|(name, _)| name.clone());

			if let Some(previous) = current_video_track {
				if let Some(members) = state.track_audiences.get_mut(&previous) {
					members.retain(|a| a != audience);
					let snapshot = TrackAudiencesChanged {
						track: previous,
						audiences: members.clone(),
					};
					let _ = self.changes.send(snapshot);
				}
			}
		}

		let members = state.track_audiences.entry(track.to_string()).or_default();
		if members.iter().any(|a| a == audience) {
			return Err(RelayError::AlreadySubscribed {
				audience: audience.to_string(),
				track: track.to_string(),
			});
		}
		members.push(audience.to_string());

		let snapshot = TrackAudiencesChanged {
			track: track.to_string(),
			audiences: members.clone(),
		};
		let _ = self.changes.send(snapshot);

		Ok(())
	}

	pub async fn remove_audience_from_track(&self, track: &str, audience: &str) -> Result<(), RelayError> {
		let mut state = self.state.lock().await;

		let members = state
			.track_audiences
			.get_mut(track)
			.ok_or_else(|| RelayError::TrackNotFound(track.to_string()))?;

		let before = members.len();
		members.retain(|a| a != audience);
		if members.len() == before {
			return Err(RelayError::NotSubscribed {
				audience: audience.to_string(),
				track: track.to_string(),
			});
		}

		let snapshot = TrackAudiencesChanged {
			track: track.to_string(),
			audiences: members.clone(),
		};
		let _ = self.changes.send(snapshot);

		Ok(())
	}

	/// Removes `audience` from every track's subscriber set on this channel
	/// (§9: on session end, an audience is detached from every channel's
	/// track set before it is dropped from the audience registry).
	pub async fn detach_audience(&self, audience: &str) {
		let mut state = self.state.lock().await;
		let mut changed = Vec::new();
		for (track, members) in state.track_audiences.iter_mut() {
			let before = members.len();
			members.retain(|a| a != audience);
			if members.len() != before {
				changed.push(TrackAudiencesChanged {
					track: track.clone(),
					audiences: members.clone(),
				});
			}
		}
		for snapshot in changed {
			let _ = self.changes.send(snapshot);
		}
	}

	pub async fn track_audiences(&self, track: &str) -> Vec<String> {
		self.state
			.lock()
			.await
			.track_audiences
			.get(track)
			.cloned()
			.unwrap_or_default()
	}
}

/// Process-singleton catalog of live channels (§4.2). All mutations are
/// serialized by a single mutex; reads that traverse the channel list also
/// take it, per the lock-ordering discipline in §5 (channel before
/// audience before tracer).
#[derive(Default)]
pub struct ChannelRegistry {
	channels: Mutex<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Allocates a channel with a freshly generated id; `name` defaults to
	/// the id when absent. Fails with `NameTaken` if the name collides.
	pub async fn create(&self, name: Option<String>) -> Result<Arc<Channel>, RelayError> {
		let id = generate_id();
		let name = name.unwrap_or_else(|| id.clone());

		let mut channels = self.channels.lock().await;
		if channels.iter().any(|c| c.name() == name) {
			return Err(RelayError::NameTaken(name));
		}

		let channel = Channel::new(id, name);
		channels.push(channel.clone());
		Ok(channel)
	}

	/// Renames a pending channel to the announced namespace, rejecting the
	/// announcement with `Conflict` if that name is already in use by a
	/// different channel (§4.4 Announcement handler, steps 1-2).
	pub async fn rename(&self, channel: &Arc<Channel>, name: String) -> Result<(), RelayError> {
		let channels = self.channels.lock().await;
		if channels.iter().any(|c| c.name() == name && c.id != channel.id) {
			return Err(RelayError::Conflict(name));
		}
		*channel.name.write().unwrap() = name;
		Ok(())
	}

	pub async fn lookup_by_name(&self, name: &str) -> Result<Arc<Channel>, RelayError> {
		self.channels
			.lock()
			.await
			.iter()
			.find(|c| c.name() == name)
			.cloned()
			.ok_or_else(|| RelayError::NotFound(name.to_string()))
	}

	pub async fn remove_by_name(&self, name: &str) -> Result<(), RelayError> {
		let mut channels = self.channels.lock().await;
		let before = channels.len();
		channels.retain(|c| c.name() != name);
		if channels.len() == before {
			return Err(RelayError::NotFound(name.to_string()));
		}
		Ok(())
	}

	pub async fn list_names(&self) -> Vec<String> {
		self.channels.lock().await.iter().map(|c| c.name()).collect()
	}

	/// Detaches `audience` from every channel's track set (§9), for the
	/// session-teardown hook run when a subscriber session ends.
	pub async fn detach_audience_everywhere(&self, audience: &str) {
		let channels = self.channels.lock().await;
		for channel in channels.iter() {
			channel.detach_audience(audience).await;
		}
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

	#[tokio::test]
	async fn create_rejects_duplicate_name() {
		let registry = ChannelRegistry::new();
		registry.create(Some("cam1".into())).await.unwrap();
		let err = registry.create(Some("cam1".into())).await.unwrap_err();
		assert!(matches!(err, RelayError::NameTaken(_)));
	}

	#[tokio::test]
	async fn lookup_missing_channel_not_found() {
		let registry = ChannelRegistry::new();
		assert!(matches!(
			registry.lookup_by_name("missing").await.unwrap_err(),
			RelayError::NotFound(_)
		));
	}

	#[tokio::test]
	async fn adding_to_audio_never_evicts_video() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		channel.add_audience_to_track("hd", "alice").await.unwrap();
		channel.add_audience_to_track(AUDIO_TRACK, "alice").await.unwrap();

		assert_eq!(channel.track_audiences("hd").await, vec!["alice"]);
		assert_eq!(channel.track_audiences(AUDIO_TRACK).await, vec!["alice"]);
	}

	#[tokio::test]
	async fn adding_to_new_video_track_evicts_old_one() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		channel.add_audience_to_track("hd", "alice").await.unwrap();
		channel.add_audience_to_track("md", "alice").await.unwrap();

		assert!(channel.track_audiences("hd").await.is_empty());
		assert_eq!(channel.track_audiences("md").await, vec!["alice"]);
	}

	#[tokio::test]
	async fn duplicate_subscribe_is_rejected_and_set_unchanged() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		channel.add_audience_to_track("hd", "alice").await.unwrap();
		let err = channel.add_audience_to_track("hd", "alice").await.unwrap_err();

		assert!(matches!(err, RelayError::AlreadySubscribed { .. }));
		assert_eq!(channel.track_audiences("hd").await, vec!["alice"]);
	}

	#[tokio::test]
	async fn remove_from_missing_track_is_track_not_found() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		let err = channel.remove_audience_from_track("hd", "alice").await.unwrap_err();
		assert!(matches!(err, RelayError::TrackNotFound(_)));
	}

	#[tokio::test]
	async fn add_then_remove_restores_prior_snapshot() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		channel.add_audience_to_track("hd", "alice").await.unwrap();
		channel.remove_audience_from_track("hd", "alice").await.unwrap();

		assert!(channel.track_audiences("hd").await.is_empty());
	}

	#[tokio::test]
	async fn detach_audience_removes_from_every_track() {
		let registry = ChannelRegistry::new();
		let channel = registry.create(Some("cam1".into())).await.unwrap();

		channel.add_audience_to_track("hd", "alice").await.unwrap();
		channel.add_audience_to_track(AUDIO_TRACK, "alice").await.unwrap();
		channel.detach_audience("alice").await;

		assert!(channel.track_audiences("hd").await.is_empty());
		assert!(channel.track_audiences(AUDIO_TRACK).await.is_empty());
	}

	#[tokio::test]
	async fn detach_audience_everywhere_spans_all_channels() {
		let registry = ChannelRegistry::new();
		let cam1 = registry.create(Some("cam1".into())).await.unwrap();
		let cam2 = registry.create(Some("cam2".into())).await.unwrap();

		cam1.add_audience_to_track(AUDIO_TRACK, "alice").await.unwrap();
		cam2.add_audience_to_track(AUDIO_TRACK, "alice").await.unwrap();
		registry.detach_audience_everywhere("alice").await;

		assert!(cam1.track_audiences(AUDIO_TRACK).await.is_empty());
		assert!(cam2.track_audiences(AUDIO_TRACK).await.is_empty());
	}
}
