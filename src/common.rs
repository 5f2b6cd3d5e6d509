use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::StatusError;



pub type CameraList = Vec<CameraRecord>;
pub type CameraMap = BTreeMap<CameraId, CameraRecord>;

/// Name of the server-sent event carrying a [`StatusEvent`].
pub const STATUS_UPDATED_EVENT: &str = "cameraStatusUpdated";

/// Opaque camera identity.
///
/// Ids minted by [`CameraId::generate`] are 24 hex characters laid out as
/// creation seconds, a per-process random part and a counter, so they sort in
/// creation order. Any non-empty string is accepted when reading ids back.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
	pub fn new(id: impl Into<String>) -> CameraId {
		CameraId(id.into())
	}

	pub fn generate() -> CameraId {
		let generator = id_generator();
		let seconds = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| elapsed.as_secs() as u32)
			.unwrap_or(0);
		let count = generator.counter.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

		let mut id = String::with_capacity(24);
		let bytes = seconds.to_be_bytes().into_iter()
			.chain(generator.process)
			.chain(count.to_be_bytes().into_iter().skip(1));
		for byte in bytes {
			id.push_str(&format!("{:02x}", byte));
		}
		CameraId(id)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CameraId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for CameraId {
	fn from(id: &str) -> CameraId {
		CameraId(id.to_string())
	}
}

struct IdGenerator {
	process: [u8; 5],
	counter: AtomicU32,
}

fn id_generator() -> &'static IdGenerator {
	static GENERATOR: OnceLock<IdGenerator> = OnceLock::new();
	GENERATOR.get_or_init(|| {
		let mut rng = rand::thread_rng();
		IdGenerator {
			process: rng.gen(),
			counter: AtomicU32::new(rng.gen::<u32>() & 0x00ff_ffff),
		}
	})
}

#[derive(Clone, Copy)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
	Online,
	Offline,
}

impl CameraStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			CameraStatus::Online => "online",
			CameraStatus::Offline => "offline",
		}
	}
}

impl fmt::Display for CameraStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CameraStatus {
	type Err = StatusError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"online" => Ok(CameraStatus::Online),
			"offline" => Ok(CameraStatus::Offline),
			other => Err(StatusError::InvalidStatus(other.to_string())),
		}
	}
}

#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct CameraRecord {
	pub id: CameraId,
	pub name: String,
	pub status: CameraStatus,
}

/// Post-update snapshot pushed to viewers. Serializes as the bare record.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusEvent {
	pub record: CameraRecord,
}

impl From<CameraRecord> for StatusEvent {
	fn from(record: CameraRecord) -> StatusEvent {
		StatusEvent { record }
	}
}

/// Body of `POST /api/cameras`. Status stays a string until the service parses it.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize, Deserialize)]
pub struct NewCamera {
	pub name: String,
	pub status: String,
}

/// Body of `PUT /api/cameras/<id>`.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize, Deserialize)]
pub struct StatusUpdate {
	pub status: String,
}
