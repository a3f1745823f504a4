//! Policy over tracer state that triggers re-subscription between a
//! regular track and its rate-adapted sibling (§4.6). Structured as a
//! controller that consumes a tracer's derived statistics the way
//! `BandwidthAdapter` consumes bandwidth-estimation feedback in the wider
//! MoQ/SFU ecosystem, but driving subscription changes instead of a
//! codec bitrate.

use std::sync::Arc;

use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::RelayError;
use crate::index::{Entity, EntityTracerIndex};
use crate::tracer::ConnectionTracer;
use moq_catalog::strip_rate_adapted_suffix;

/// The RTT EMA-variance threshold above which a subscriber is adapted down
/// (§4.6).
pub const RTT_VARIANCE_THRESHOLD: f64 = 50.0;
/// The drop-rate / retransmission-rate threshold above which a subscriber
/// is adapted down (§4.6, §4.5).
pub const RATE_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Up,
	Down,
}

/// The outcome of evaluating a tracer's latest sample against §4.6's
/// trigger conditions: the migration direction, plus which of the
/// rate-based conditions fired, since each one names a specific pair of
/// counters the caller must reset afterward (drop rate resets
/// received/dropped, retransmission rate resets sent/lost).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerReport {
	pub direction: Direction,
	pub drop_rate_exceeded: bool,
	pub retransmission_rate_exceeded: bool,
}

/// Evaluates a tracer's latest sample against the trigger conditions in
/// §4.6. Only one adapt-down is needed even if several thresholds are
/// crossed in the same tick; `None` means no adaptation is warranted.
pub fn trigger(rtt_ema_variance: f64, drop_rate: f64, retransmission_rate: f64) -> Option<TriggerReport> {
	let drop_rate_exceeded = drop_rate > RATE_THRESHOLD;
	let retransmission_rate_exceeded = retransmission_rate > RATE_THRESHOLD;

	if rtt_ema_variance > RTT_VARIANCE_THRESHOLD || drop_rate_exceeded || retransmission_rate_exceeded {
		Some(TriggerReport {
			direction: Direction::Down,
			drop_rate_exceeded,
			retransmission_rate_exceeded,
		})
	} else {
		None
	}
}

/// Resolves a tracer to its owning audience and channel, then adds or
/// removes it from tracks through the channel registry, per §4.6.
pub struct RateAdaptationController {
	index: Arc<EntityTracerIndex>,
}

impl RateAdaptationController {
	pub fn new(index: Arc<EntityTracerIndex>) -> Self {
		Self { index }
	}

	/// Runs one adaptation decision for `tracer`, given the channel it
	/// belongs to (resolved by the caller via the entity index) and the
	/// direction the trigger conditions selected. Every outcome, including
	/// errors, is also recorded into the tracer's own per-connection log
	/// (§6, §7), not just process-wide structured logging.
	pub async fn adapt(&self, tracer: &Arc<ConnectionTracer>, channel: &Arc<Channel>, direction: Direction) -> Result<(), RelayError> {
		let result = self.adapt_inner(tracer, channel, direction).await;
		if let Err(err) = &result {
			tracer.log_event(&format!("rate adaptation error: {err}"));
		}
		result
	}

	async fn adapt_inner(&self, tracer: &Arc<ConnectionTracer>, channel: &Arc<Channel>, direction: Direction) -> Result<(), RelayError> {
		let tracer_index = self.index.index_by_tracer(tracer).await?;
		let entity = self.index.entity_by_index(tracer_index).await?;

		let audience = match entity {
			Entity::Audience(audience) => audience,
			Entity::Channel(_) => {
				warn!("rate adaptation triggered on a publisher-side tracer, ignoring");
				tracer.log_event("rate adaptation triggered on a publisher-side tracer, ignoring");
				return Ok(());
			}
		};

		let current_track = audience.current_video_track().await;

		match direction {
			Direction::Down => {
				let Some(current_track) = current_track else {
					return Ok(());
				};
				if current_track.ends_with(moq_catalog::RATE_ADAPTED_SUFFIX) {
					return Ok(()); // already rate-adapted, no-op (§4.6)
				}
				let adapted = format!("{current_track}{}", moq_catalog::RATE_ADAPTED_SUFFIX);
				channel.remove_audience_from_track(&current_track, &audience.id).await?;
				channel.add_audience_to_track(&adapted, &audience.id).await?;
				audience.set_current_video_track(Some(adapted.clone())).await;
				tracer.set_rate_adapted(true);
				info!(audience = %audience.id, from = %current_track, to = %adapted, "adapted down");
				tracer.log_event(&format!("adapted down: {} -> {}", current_track, adapted));
			}
			Direction::Up => {
				let Some(current_track) = current_track else {
					return Ok(());
				};
				let Some(base) = strip_rate_adapted_suffix(&current_track) else {
					return Ok(()); // already on the regular track, no-op (§4.6)
				};
				let base = base.to_string();
				channel.remove_audience_from_track(&current_track, &audience.id).await?;
				channel.add_audience_to_track(&base, &audience.id).await?;
				audience.set_current_video_track(Some(base.clone())).await;
				tracer.set_rate_adapted(false);
				info!(audience = %audience.id, from = %current_track, to = %base, "adapted up");
				tracer.log_event(&format!("adapted up: {} -> {}", current_track, base));
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rtt_variance_over_threshold_triggers_down() {
		let report = trigger(51.0, 0.0, 0.0).unwrap();
		assert_eq!(report.direction, Direction::Down);
		assert!(!report.drop_rate_exceeded);
		assert!(!report.retransmission_rate_exceeded);
	}

	#[test]
	fn drop_rate_over_threshold_triggers_down() {
		let report = trigger(0.0, 0.2, 0.0).unwrap();
		assert_eq!(report.direction, Direction::Down);
		assert!(report.drop_rate_exceeded);
		assert!(!report.retransmission_rate_exceeded);
	}

	#[test]
	fn retransmission_rate_over_threshold_triggers_down() {
		let report = trigger(0.0, 0.0, 0.2).unwrap();
		assert_eq!(report.direction, Direction::Down);
		assert!(!report.drop_rate_exceeded);
		assert!(report.retransmission_rate_exceeded);
	}

	#[test]
	fn both_over_threshold_still_yields_one_direction_but_both_reasons() {
		let report = trigger(0.0, 0.2, 0.2).unwrap();
		assert_eq!(report.direction, Direction::Down);
		assert!(report.drop_rate_exceeded);
		assert!(report.retransmission_rate_exceeded);
	}

	#[test]
	fn nothing_over_threshold_triggers_nothing() {
		assert!(trigger(10.0, 0.01, 0.01).is_none());
	}
}
