use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use log::{debug, info, warn, error};

use crate::common::{CameraId, CameraList, CameraMap, CameraRecord, CameraStatus};
use crate::error::StatusError;



/// Called with the updated record once a status write is durable.
pub type OnPersisted<'a> = &'a (dyn Fn(&CameraRecord) + Send + Sync);

/// Authoritative table of camera records.
///
/// Implementations must serialize writes per identity: two concurrent
/// `update_status` calls for one camera never interleave their
/// read-modify-write.
#[rocket::async_trait]
pub trait RecordStore: Send + Sync {
	async fn list_all(&self) -> Result<CameraList, StatusError>;
	async fn get(&self, id: &CameraId) -> Result<CameraRecord, StatusError>;
	async fn create(&self, name: String, status: CameraStatus) -> Result<CameraRecord, StatusError>;

	/// `on_persisted` runs before the write is released to the next writer,
	/// so its calls happen in persistence order.
	async fn update_status(&self, id: &CameraId, status: CameraStatus, on_persisted: OnPersisted<'_>) -> Result<CameraRecord, StatusError>;
}

/// In-memory camera table, optionally mirrored to a YAML file after every write.
pub struct CameraStore {
	// Using tokio::sync::RwLock rather than std::sync::RwLock so that:
	//     A.) Multiple readers can list cameras at the same time without blocking each other
	//     B.) A writer keeps the lock across the file write, so writes are applied one at a time
	cameras: RwLock<CameraMap>,
	file: Option<PathBuf>,
}

impl CameraStore {
	pub fn in_memory() -> CameraStore {
		CameraStore::with_cameras(CameraMap::new(), None)
	}

	/// Loads the table from `path`. A missing file starts an empty table.
	pub fn open(path: impl Into<PathBuf>) -> Result<CameraStore, StatusError> {
		let path = path.into();
		let cameras = read_store_file(&path)?;
		info!("Loaded {} camera(s) from {}", cameras.len(), path.display());
		Ok(CameraStore::with_cameras(cameras, Some(path)))
	}

	pub fn with_cameras(cameras: CameraMap, file: Option<PathBuf>) -> CameraStore {
		CameraStore {
			cameras: RwLock::new(cameras),
			file,
		}
	}

	async fn persist(&self, cameras: &CameraMap) -> Result<(), StatusError> {
		let Some(path) = &self.file else {
			return Ok(());
		};
		match write_store_file(path, cameras).await {
			Ok(_) => {
				debug!("Wrote camera store file {}", path.display());
				Ok(())
			},
			Err(err) => {
				error!("Failed to write camera store file {}; error was {}", path.display(), err);
				Err(StatusError::Persistence(err.to_string()))
			}
		}
	}
}

#[rocket::async_trait]
impl RecordStore for CameraStore {
	async fn list_all(&self) -> Result<CameraList, StatusError> {
		let cameras = self.cameras.read().await;
		Ok(cameras.values().cloned().collect())
	}

	async fn get(&self, id: &CameraId) -> Result<CameraRecord, StatusError> {
		let cameras = self.cameras.read().await;
		cameras.get(id)
			.cloned()
			.ok_or_else(|| StatusError::NotFound(id.clone()))
	}

	async fn create(&self, name: String, status: CameraStatus) -> Result<CameraRecord, StatusError> {
		let mut cameras = self.cameras.write().await;
		let mut id = CameraId::generate();
		while cameras.contains_key(&id) {
			id = CameraId::generate();
		}
		let camera = CameraRecord { id: id.clone(), name, status };
		cameras.insert(id.clone(), camera.clone());

		if let Err(err) = self.persist(&cameras).await {
			cameras.remove(&id);
			return Err(err);
		}
		info!("Added camera {} ({})", camera.id, camera.name);
		Ok(camera)
	}

	async fn update_status(&self, id: &CameraId, status: CameraStatus, on_persisted: OnPersisted<'_>) -> Result<CameraRecord, StatusError> {
		let mut cameras = self.cameras.write().await;
		let camera = cameras.get_mut(id).ok_or_else(|| StatusError::NotFound(id.clone()))?;
		let previous = camera.status;
		camera.status = status;
		let updated = camera.clone();

		if let Err(err) = self.persist(&cameras).await {
			if let Some(camera) = cameras.get_mut(id) {
				camera.status = previous;
			}
			return Err(err);
		}
		on_persisted(&updated);
		Ok(updated)
	}
}



fn read_store_file(path: &Path) -> Result<CameraMap, StatusError> {
	let file = match File::open(path) {
		Ok(file) => file,
		Err(err) if err.kind() == ErrorKind::NotFound => {
			// First time running (before the store file is created) we should encounter this, so not an error
			warn!("Camera store file {} does not exist yet; starting empty", path.display());
			return Ok(CameraMap::new());
		},
		Err(err) => {
			return Err(StatusError::Persistence(format!("failed to open {}: {}", path.display(), err)));
		}
	};

	let cameras: Option<CameraMap> = serde_yaml::from_reader(BufReader::new(file))
		.map_err(|err| StatusError::Persistence(format!("failed to parse {}: {}", path.display(), err)))?;
	// An empty file deserializes to None
	let cameras = cameras.unwrap_or_default();
	if let Some((key, camera)) = cameras.iter().find(|(key, camera)| **key != camera.id) {
		return Err(StatusError::Persistence(format!(
			"{}: entry {} holds camera {}", path.display(), key, camera.id
		)));
	}
	Ok(cameras)
}

/// Sibling path the next version of the store file is written to before it replaces the old one.
fn staging_path(path: &Path) -> anyhow::Result<PathBuf> {
	let mut file_name = path.file_name()
		.ok_or_else(|| anyhow::anyhow!("{} is not a file path", path.display()))?
		.to_os_string();
	file_name.push(".tmp");
	Ok(path.with_file_name(file_name))
}

async fn write_store_file(path: &Path, cameras: &CameraMap) -> anyhow::Result<()> {
	if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
		tokio::fs::create_dir_all(parent).await?;
	}
	let staging = staging_path(path)?;
	let yaml = serde_yaml::to_string(cameras)?;

	let written = async {
		let file = tokio::fs::File::create(&staging).await?;
		let mut writer = tokio::io::BufWriter::new(file);
		writer.write_all(yaml.as_bytes()).await?;
		writer.flush().await?;
		writer.into_inner().sync_all().await?;
		tokio::fs::rename(&staging, path).await
	}.await;

	if let Err(err) = written {
		// The old file is still intact; only the partial copy needs to go.
		let _ = tokio::fs::remove_file(&staging).await;
		return Err(err.into());
	}
	Ok(())
}
