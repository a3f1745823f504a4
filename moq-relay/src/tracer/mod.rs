//! Per-connection transport metric sampling and fluctuation analysis
//! (§4.5). One tracer is constructed at connection start and closed at
//! connection end; its callbacks must be non-blocking with respect to the
//! transport thread.

pub mod adaptation;

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::transport::TransportStats;

/// Bound on the RTT/congestion-window rolling histories (§4.5.1): an
/// implementation necessity the "rolling" qualifier left unstated upstream.
pub const HISTORY_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TracerConfig {
	pub log_dir: Option<PathBuf>,
	pub check_interval: std::time::Duration,
	pub ema_alpha: f64,
}

impl Default for TracerConfig {
	fn default() -> Self {
		Self {
			log_dir: None,
			check_interval: std::time::Duration::from_millis(1000),
			ema_alpha: 0.9,
		}
	}
}

struct Counters {
	packets_sent: u64,
	bytes_sent: u64,
	packets_received: u64,
	bytes_received: u64,
	packets_lost: u64,
	packets_dropped: u64,
}

impl Default for Counters {
	fn default() -> Self {
		Self {
			packets_sent: 0,
			bytes_sent: 0,
			packets_received: 0,
			bytes_received: 0,
			packets_lost: 0,
			packets_dropped: 0,
		}
	}
}

/// The last cumulative `TransportStats` snapshot a tracer saw, kept so
/// `sample` can turn the next snapshot into the same kind of per-tick delta
/// the per-packet callbacks (`on_sent_packet` and friends) accumulate.
#[derive(Default)]
struct RawSnapshot {
	packets_sent: u64,
	bytes_sent: u64,
	packets_received: u64,
	bytes_received: u64,
	packets_lost: u64,
}

struct State {
	counters: Counters,
	raw: RawSnapshot,
	rtt_history: VecDeque<f64>,
	cwnd_history: VecDeque<f64>,
	last_check: Instant,
	last_bandwidth_reset: Instant,
	rate_adapted: bool,
	last_adapted: Option<Instant>,
	log_file: Option<File>,
}

/// Per-connection observer of transport metrics (§3).
pub struct ConnectionTracer {
	pub connection_id: String,
	config: TracerConfig,
	state: Mutex<State>,
}

/// A tracer whose log file could not be opened is never installed (§7);
/// the caller is expected to log this once and skip `ConnectionTracer`
/// construction for that connection.
#[derive(Debug, thiserror::Error)]
#[error("failed to open tracer log for connection {connection_id}: {source}")]
pub struct TracerInitError {
	connection_id: String,
	#[source]
	source: std::io::Error,
}

impl ConnectionTracer {
	pub fn new(connection_id: String, config: TracerConfig) -> Result<Self, TracerInitError> {
		let log_file = match &config.log_dir {
			None => None,
			Some(dir) => {
				fs::create_dir_all(dir).map_err(|source| TracerInitError {
					connection_id: connection_id.clone(),
					source,
				})?;
				let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
				let path = dir.join(format!("{timestamp}_{connection_id}_server.log"));
				let file = OpenOptions::new()
					.create(true)
					.append(true)
					.open(&path)
					.map_err(|source| TracerInitError {
						connection_id: connection_id.clone(),
						source,
					})?;
				Some(file)
			}
		};

		Ok(Self {
			connection_id,
			config,
			state: Mutex::new(State {
				counters: Counters::default(),
				raw: RawSnapshot::default(),
				rtt_history: VecDeque::with_capacity(HISTORY_CAPACITY),
				cwnd_history: VecDeque::with_capacity(HISTORY_CAPACITY),
				last_check: Instant::now(),
				last_bandwidth_reset: Instant::now(),
				rate_adapted: false,
				last_adapted: None,
				log_file,
			}),
		})
	}

	/// A tracer with no log file, used when `new` fails so the session can
	/// proceed untraced rather than being rejected (§7).
	pub fn disabled(connection_id: String) -> Self {
		Self::new(connection_id, TracerConfig { log_dir: None, ..TracerConfig::default() }).expect("a tracer with no log file cannot fail to initialize")
	}

	fn log(state: &mut State, line: &str) {
		if let Some(file) = state.log_file.as_mut() {
			if let Err(err) = writeln!(file, "{line}") {
				warn!(error = %err, "failed to write tracer log line");
			}
		}
	}

	/// Appends a line to this connection's per-connection log, for events
	/// recorded by a caller outside the tracer itself — rate-adaptation
	/// decisions and errors (§6, §7) are the only current user.
	pub fn log_event(&self, message: &str) {
		let mut state = self.state.lock().unwrap();
		Self::log(&mut state, message);
	}

	pub fn on_sent_packet(&self, packet_number: u64, size: u64) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_sent = packet_number;
		state.counters.bytes_sent += size;
		Self::log(&mut state, &format!("sent packet {packet_number} ({size} bytes)"));
	}

	pub fn on_received_packet(&self, packet_number: u64, size: u64) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_received = packet_number;
		state.counters.bytes_received += size;
		Self::log(&mut state, &format!("received packet {packet_number} ({size} bytes)"));
	}

	pub fn on_lost_packet(&self) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_lost += 1;
		Self::log(&mut state, "lost packet");
	}

	pub fn on_dropped_packet(&self) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_dropped += 1;
		Self::log(&mut state, "dropped packet");
	}

	/// Samples RTT (appended only when non-zero) and congestion window
	/// (appended unconditionally), then returns the current drop rate,
	/// retransmission rate, and whether a fluctuation check is due so the
	/// caller can dispatch it to a background task (§4.5: tracer callbacks
	/// must stay non-blocking).
	pub fn on_updated_metrics(&self, latest_rtt_us: f64, cwnd_bytes: f64) -> MetricsUpdate {
		let mut state = self.state.lock().unwrap();

		if latest_rtt_us != 0.0 {
			push_bounded(&mut state.rtt_history, latest_rtt_us);
		}
		push_bounded(&mut state.cwnd_history, cwnd_bytes);

		Self::log(&mut state, &format!("updated metrics: rtt={latest_rtt_us} cwnd={cwnd_bytes}"));

		Self::finalize_tick(&mut state, self.config.check_interval)
	}

	/// Feeds one polled `TransportStats` snapshot into this tracer (§4.5):
	/// the non-blocking callback surface a per-connection ticker drives at
	/// `TracerConfig.check_interval`, turning the cumulative counters a real
	/// QUIC connection reports into the same per-tick deltas the
	/// `on_sent_packet`/`on_received_packet`/`on_lost_packet` callbacks
	/// accumulate one packet at a time.
	pub fn sample(&self, stats: TransportStats) -> MetricsUpdate {
		let mut state = self.state.lock().unwrap();

		let sent_delta = stats.packets_sent.saturating_sub(state.raw.packets_sent);
		let bytes_sent_delta = stats.bytes_sent.saturating_sub(state.raw.bytes_sent);
		let received_delta = stats.packets_received.saturating_sub(state.raw.packets_received);
		let bytes_received_delta = stats.bytes_received.saturating_sub(state.raw.bytes_received);
		let lost_delta = stats.packets_lost.saturating_sub(state.raw.packets_lost);

		state.raw.packets_sent = stats.packets_sent;
		state.raw.bytes_sent = stats.bytes_sent;
		state.raw.packets_received = stats.packets_received;
		state.raw.bytes_received = stats.bytes_received;
		state.raw.packets_lost = stats.packets_lost;

		state.counters.packets_sent += sent_delta;
		state.counters.bytes_sent += bytes_sent_delta;
		state.counters.packets_received += received_delta;
		state.counters.bytes_received += bytes_received_delta;
		state.counters.packets_lost += lost_delta;

		if stats.rtt_us != 0.0 {
			push_bounded(&mut state.rtt_history, stats.rtt_us);
		}
		push_bounded(&mut state.cwnd_history, stats.cwnd_bytes);

		Self::log(
			&mut state,
			&format!(
				"sampled metrics: rtt={} cwnd={} sent+={sent_delta} recv+={received_delta} lost+={lost_delta}",
				stats.rtt_us, stats.cwnd_bytes,
			),
		);

		Self::finalize_tick(&mut state, self.config.check_interval)
	}

	/// Derives drop rate, retransmission rate, whether a fluctuation check
	/// is due, and (§4.5's third derived per-tick statistic) bandwidth, from
	/// the counters a sampling call just updated. Bandwidth is computed over
	/// the elapsed time since it was last emitted and its byte counters are
	/// reset immediately after, independent of the drop/retransmission-rate
	/// counters, which persist until a rate-adaptation trigger resets them.
	fn finalize_tick(state: &mut State, check_interval: Duration) -> MetricsUpdate {
		let drop_rate = Self::drop_rate_locked(state);
		let retransmission_rate = Self::retransmission_rate_locked(state);
		let due = state.last_check.elapsed() >= check_interval;

		let bandwidth = if state.last_bandwidth_reset.elapsed() >= check_interval {
			let elapsed = state.last_bandwidth_reset.elapsed().as_secs_f64();
			let bandwidth = Bandwidth {
				upload_bps: if elapsed > 0.0 { state.counters.bytes_sent as f64 / elapsed } else { 0.0 },
				download_bps: if elapsed > 0.0 { state.counters.bytes_received as f64 / elapsed } else { 0.0 },
			};
			state.counters.bytes_sent = 0;
			state.counters.bytes_received = 0;
			state.last_bandwidth_reset = Instant::now();
			Self::log(
				state,
				&format!("bandwidth: upload={:.0}Bps download={:.0}Bps", bandwidth.upload_bps, bandwidth.download_bps),
			);
			Some(bandwidth)
		} else {
			None
		};

		MetricsUpdate {
			drop_rate,
			retransmission_rate,
			fluctuation_check_due: due,
			bandwidth,
		}
	}

	fn drop_rate_locked(state: &State) -> f64 {
		if state.counters.packets_received == 0 {
			0.0
		} else {
			state.counters.packets_dropped as f64 / state.counters.packets_received as f64
		}
	}

	fn retransmission_rate_locked(state: &State) -> f64 {
		if state.counters.packets_sent == 0 {
			0.0
		} else {
			state.counters.packets_lost as f64 / state.counters.packets_sent as f64
		}
	}

	pub fn drop_rate(&self) -> f64 {
		Self::drop_rate_locked(&self.state.lock().unwrap())
	}

	pub fn retransmission_rate(&self) -> f64 {
		Self::retransmission_rate_locked(&self.state.lock().unwrap())
	}

	/// Resets the received/dropped counters, per §4.6's adapt-down policy
	/// for a drop-rate trigger.
	pub fn reset_drop_counters(&self) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_received = 0;
		state.counters.packets_dropped = 0;
	}

	/// Resets the sent/lost counters, per §4.6's adapt-down policy for a
	/// retransmission-rate trigger.
	pub fn reset_retransmission_counters(&self) {
		let mut state = self.state.lock().unwrap();
		state.counters.packets_sent = 0;
		state.counters.packets_lost = 0;
	}

	pub fn is_rate_adapted(&self) -> bool {
		self.state.lock().unwrap().rate_adapted
	}

	pub fn set_rate_adapted(&self, adapted: bool) {
		let mut state = self.state.lock().unwrap();
		state.rate_adapted = adapted;
		state.last_adapted = Some(Instant::now());
	}

	/// Runs the three fluctuation-analysis methods (§4.5) over a snapshot
	/// of the current histories and logs all three; returns the EMA
	/// variance of RTT, the signal that drives adaptation.
	pub fn fluctuation_check(&self) -> FluctuationReport {
		let mut state = self.state.lock().unwrap();
		let rtt: Vec<f64> = state.rtt_history.iter().copied().collect();
		let cwnd: Vec<f64> = state.cwnd_history.iter().copied().collect();
		let alpha = self.config.ema_alpha;

		let report = FluctuationReport {
			rtt_second_derivative_variance: variance(&first_derivatives(&rtt)),
			cwnd_second_derivative_variance: variance(&first_derivatives(&cwnd)),
			rtt_ema_variance: ema_variance(&rtt, alpha),
			cwnd_ema_variance: ema_variance(&cwnd, alpha),
			rtt_custom_weighted_variance: custom_weighted_variance(&rtt, alpha),
			cwnd_custom_weighted_variance: custom_weighted_variance(&cwnd, alpha),
		};

		Self::log(
			&mut state,
			&format!(
				"fluctuation: method1=({}, {}) method2=({}, {}) method3=({}, {})",
				report.rtt_second_derivative_variance,
				report.cwnd_second_derivative_variance,
				report.rtt_ema_variance,
				report.cwnd_ema_variance,
				report.rtt_custom_weighted_variance,
				report.cwnd_custom_weighted_variance,
			),
		);

		state.last_check = Instant::now();
		report
	}
}

pub struct MetricsUpdate {
	pub drop_rate: f64,
	pub retransmission_rate: f64,
	pub fluctuation_check_due: bool,
	pub bandwidth: Option<Bandwidth>,
}

/// Upload/download bandwidth, in bytes per second, over the interval since
/// it was last emitted (§4.5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
	pub upload_bps: f64,
	pub download_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluctuationReport {
	pub rtt_second_derivative_variance: f64,
	pub cwnd_second_derivative_variance: f64,
	pub rtt_ema_variance: f64,
	pub cwnd_ema_variance: f64,
	pub rtt_custom_weighted_variance: f64,
	pub cwnd_custom_weighted_variance: f64,
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64) {
	if history.len() == HISTORY_CAPACITY {
		history.pop_front();
	}
	history.push_back(value);
}

fn first_derivatives(data: &[f64]) -> Vec<f64> {
	if data.len() < 2 {
		return Vec::new();
	}
	data.windows(2).map(|w| w[1] - w[0]).collect()
}

fn variance(data: &[f64]) -> f64 {
	if data.len() < 2 {
		return 0.0;
	}
	let mean = data.iter().sum::<f64>() / data.len() as f64;
	data.iter().map(|d| (d - mean) * (d - mean)).sum()
}

fn ema_variance(data: &[f64], alpha: f64) -> f64 {
	if data.len() < 2 {
		return 0.0;
	}
	let mut ema = data[0];
	let mut ema_variance = 0.0;
	for &x in &data[1..] {
		ema = alpha * x + (1.0 - alpha) * ema;
		ema_variance = alpha * (x - ema) * (x - ema) + (1.0 - alpha) * ema_variance;
	}
	ema_variance
}

fn custom_weighted_variance(data: &[f64], alpha: f64) -> f64 {
	if data.len() < 2 {
		return 0.0;
	}
	let mean = data.iter().sum::<f64>() / data.len() as f64;
	let mut variance = 0.0;
	let mut weight = 1.0;
	for &x in data.iter().rev() {
		variance += weight * (x - mean) * (x - mean);
		weight *= alpha;
	}
	variance
}
