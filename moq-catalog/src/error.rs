use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("malformed catalog: {0}")]
	MalformedCatalog(#[from] serde_json::Error),

	#[error("track name {0:?} is not unique within the catalog")]
	DuplicateTrackName(String),
}
