use thiserror::Error;

/// The structured error taxonomy returned by the registries and the session
/// router (§7). `anyhow::Error` is reserved for the outermost task/main
/// boundary, where a `RelayError` is wrapped with `.context(...)`.
#[derive(Error, Debug)]
pub enum RelayError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("channel name already taken: {0}")]
	NameTaken(String),

	#[error("announcement conflicts with an existing channel: {0}")]
	Conflict(String),

	#[error("audience {audience} is already subscribed to track {track}")]
	AlreadySubscribed { audience: String, track: String },

	#[error("audience {audience} is not subscribed to track {track}")]
	NotSubscribed { audience: String, track: String },

	#[error("track not found: {0}")]
	TrackNotFound(String),

	#[error("local track already registered: {0}")]
	DuplicateEntry(String),

	#[error("malformed catalog: {0}")]
	MalformedCatalog(#[from] moq_catalog::Error),

	#[error("index {index} out of range (len {len})")]
	IndexOutOfRange { index: usize, len: usize },

	#[error("transport error: {0}")]
	Transport(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl RelayError {
	/// The MoQ-level rejection status this error translates to when
	/// returned from the router to the transport layer (§7).
	pub fn status_code(&self) -> u32 {
		match self {
			RelayError::NotFound(_) | RelayError::TrackNotFound(_) => 404,
			RelayError::NotSubscribed { .. } => 404,
			RelayError::Conflict(_) | RelayError::NameTaken(_) => 409,
			RelayError::AlreadySubscribed { .. } => 409,
			_ => 500,
		}
	}
}
