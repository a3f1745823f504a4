//! The ordinal bridge from a transport-layer tracer callback back to the
//! session-layer entity it belongs to (§4.7, §9). The transport library
//! hands the tracer no back-reference to its owning session, so the relay
//! appends entity and tracer in lockstep and looks the entity up by the
//! tracer's position later.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::audience::Audience;
use crate::channel::Channel;
use crate::error::RelayError;
use crate::tracer::ConnectionTracer;

/// Either side of a traced connection: a channel (publisher) or an
/// audience (subscriber).
#[derive(Clone)]
pub enum Entity {
	Channel(Arc<Channel>),
	Audience(Arc<Audience>),
}

/// Two parallel append-only lists, guarded by one mutex so the "same
/// length" invariant is maintained by a single combined insertion
/// operation (§9).
#[derive(Default)]
pub struct EntityTracerIndex {
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	entities: Vec<Entity>,
	tracers: Vec<Arc<ConnectionTracer>>,
}

impl EntityTracerIndex {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Appends `entity` and its `tracer` at the same index. The entity
	/// must be appended before the tracer's first callback can look it up
	/// (§4.7), which this combined operation guarantees by construction.
	pub async fn append(&self, entity: Entity, tracer: Arc<ConnectionTracer>) -> usize {
		let mut inner = self.inner.lock().await;
		inner.entities.push(entity);
		inner.tracers.push(tracer);
		inner.entities.len() - 1
	}

	pub async fn entity_by_index(&self, index: usize) -> Result<Entity, RelayError> {
		let inner = self.inner.lock().await;
		inner
			.entities
			.get(index)
			.cloned()
			.ok_or(RelayError::IndexOutOfRange { index, len: inner.entities.len() })
	}

	/// Linear search by tracer identity, mirroring the reference
	/// implementation's pointer-equality scan.
	pub async fn index_by_tracer(&self, tracer: &Arc<ConnectionTracer>) -> Result<usize, RelayError> {
		let inner = self.inner.lock().await;
		inner
			.tracers
			.iter()
			.position(|t| Arc::ptr_eq(t, tracer))
			.ok_or(RelayError::IndexOutOfRange { index: usize::MAX, len: inner.tracers.len() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::audience::AudienceRegistry;
	use crate::tracer::TracerConfig;
	use crate::transport::fake::FakeSession;

	#[tokio::test]
	async fn entity_by_index_returns_entity_from_creation_time() {
		let index = EntityTracerIndex::new();
		let audiences = AudienceRegistry::new();
		let audience = audiences.create(Some("alice".into()), Arc::new(FakeSession::new("alice"))).await;
		let tracer = Arc::new(ConnectionTracer::new("conn-1".to_string(), TracerConfig::default()).unwrap());

		let i = index.append(Entity::Audience(audience.clone()), tracer).await;

		match index.entity_by_index(i).await.unwrap() {
			Entity::Audience(found) => assert_eq!(found.id, audience.id),
			Entity::Channel(_) => panic!("expected audience entity"),
		}
	}

	#[tokio::test]
	async fn out_of_range_index_is_an_error() {
		let index = EntityTracerIndex::new();
		assert!(matches!(
			index.entity_by_index(0).await.unwrap_err(),
			RelayError::IndexOutOfRange { .. }
		));
	}

	#[tokio::test]
	async fn index_by_tracer_finds_appended_position() {
		let index = EntityTracerIndex::new();
		let audiences = AudienceRegistry::new();
		let audience = audiences.create(Some("alice".into()), Arc::new(FakeSession::new("alice"))).await;
		let tracer_a = Arc::new(ConnectionTracer::new("conn-a".to_string(), TracerConfig::default()).unwrap());
		let tracer_b = Arc::new(ConnectionTracer::new("conn-b".to_string(), TracerConfig::default()).unwrap());

		index.append(Entity::Audience(audience.clone()), tracer_a.clone()).await;
		let pos_b = index.append(Entity::Audience(audience), tracer_b.clone()).await;

		assert_eq!(index.index_by_tracer(&tracer_b).await.unwrap(), pos_b);
	}
}
