mod error;

pub use error::Error;

use serde::{Deserialize, Serialize};

/// A parsed MoQ track catalog.
///
/// Immutable once received by a channel: the relay attaches the first
/// catalog object a publisher writes on `<namespace>/catalogTrack` and
/// never re-parses a later one for the same channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
	pub version: i64,

	#[serde(rename = "streamingFormat")]
	pub streaming_format: i64,

	#[serde(rename = "streamingFormatVersion")]
	pub streaming_format_version: String,

	#[serde(rename = "commonTrackFields", default)]
	pub common_track_fields: CommonTrackFields,

	#[serde(default)]
	pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonTrackFields {
	#[serde(default)]
	pub namespace: String,

	#[serde(default)]
	pub packaging: String,

	#[serde(rename = "renderGroup", default)]
	pub render_group: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
	pub name: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,

	#[serde(rename = "altGroup", skip_serializing_if = "Option::is_none")]
	pub alt_group: Option<i64>,

	#[serde(rename = "selectionParams")]
	pub selection_params: SelectionParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionParams {
	#[serde(default)]
	pub codec: String,

	#[serde(rename = "mimeType", default)]
	pub mime_type: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub width: Option<i64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub height: Option<i64>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub framerate: Option<i64>,

	#[serde(default)]
	pub bitrate: i64,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub samplerate: Option<i64>,

	#[serde(rename = "channelConfig", skip_serializing_if = "Option::is_none")]
	pub channel_config: Option<String>,
}

/// Wrapper used when publishing only the `tracks` array to a subscriber
/// of the `catalogTrack` meta-track, per the catalog meta-object encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracksOnly {
	pub tracks: Vec<Track>,
}

/// The literal suffix that marks a track as the rate-adapted sibling of
/// the track named by stripping it.
pub const RATE_ADAPTED_SUFFIX: &str = "-ra";

impl Track {
	/// Whether this track's name matches `^.+-ra$`.
	pub fn is_rate_adapted(&self) -> bool {
		is_rate_adapted_name(&self.name)
	}

	/// The name of this track's rate-adapted sibling, e.g. `hd` -> `hd-ra`.
	pub fn rate_adapted_name(&self) -> String {
		format!("{}{RATE_ADAPTED_SUFFIX}", self.name)
	}
}

/// Whether `name` matches `^.+-ra$`, i.e. is at least one character
/// followed by the rate-adapted suffix.
pub fn is_rate_adapted_name(name: &str) -> bool {
	name.len() > RATE_ADAPTED_SUFFIX.len() && name.ends_with(RATE_ADAPTED_SUFFIX)
}

/// Strips the rate-adapted suffix, returning the name of the regular
/// track this is a sibling of. Returns `None` if `name` isn't rate-adapted.
pub fn strip_rate_adapted_suffix(name: &str) -> Option<&str> {
	name.strip_suffix(RATE_ADAPTED_SUFFIX)
		.filter(|base| !base.is_empty())
}

impl Catalog {
	/// Parses a full catalog document, per §4.1: unknown fields are
	/// ignored, missing optional numeric fields default to zero, and
	/// `name` is required on every track.
	pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
		serde_json::from_slice(bytes).map_err(Error::MalformedCatalog)
	}

	/// Serializes the full catalog document.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		serde_json::to_vec(self).map_err(Error::MalformedCatalog)
	}

	/// Serializes just the `tracks` array, wrapped as `{"tracks": [...]}`,
	/// used when answering a `catalogTrack` meta-subscription.
	pub fn encode_tracks(&self) -> Result<Vec<u8>, Error> {
		serde_json::to_vec(&TracksOnly {
			tracks: self.tracks.clone(),
		})
		.map_err(Error::MalformedCatalog)
	}

	/// Looks up a track by name.
	pub fn track(&self, name: &str) -> Option<&Track> {
		self.tracks.iter().find(|t| t.name == name)
	}
}
