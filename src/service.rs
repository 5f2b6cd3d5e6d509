use std::sync::Arc;

use log::{info, warn};

use crate::auth::{MutationPolicy, Principal};
use crate::broadcast::Publisher;
use crate::common::{CameraId, CameraList, CameraRecord, CameraStatus, StatusEvent};
use crate::error::StatusError;
use crate::store::RecordStore;



/// Couples camera mutations to the broadcast channel.
///
/// Only status updates are announced. Creation is not, so viewers pick new
/// cameras up on their next full fetch.
pub struct StatusService {
	store: Arc<dyn RecordStore>,
	publisher: Arc<dyn Publisher>,
	policy: MutationPolicy,
}

impl StatusService {
	pub fn new(store: Arc<dyn RecordStore>, publisher: Arc<dyn Publisher>, policy: MutationPolicy) -> StatusService {
		StatusService { store, publisher, policy }
	}

	pub async fn get_all(&self) -> Result<CameraList, StatusError> {
		self.store.list_all().await
	}

	pub async fn get(&self, id: &CameraId) -> Result<CameraRecord, StatusError> {
		self.store.get(id).await
	}

	pub async fn add(&self, name: String, status: &str) -> Result<CameraRecord, StatusError> {
		let status: CameraStatus = status.parse()?;
		self.store.create(name, status).await
	}

	/// Persists the new status, then publishes the updated record.
	///
	/// Nothing is published unless the write succeeded. The record is published
	/// before the store admits the next write, so broadcasts for one camera go
	/// out in the order they were persisted.
	pub async fn set_status(&self, caller: Option<&Principal>, id: &CameraId, status: &str) -> Result<CameraRecord, StatusError> {
		if let Err(err) = self.policy.authorize(caller) {
			warn!("Refused anonymous status change of camera {}", id);
			return Err(err);
		}
		let status: CameraStatus = status.parse()?;

		let announce = |camera: &CameraRecord| {
			match caller {
				Some(principal) => info!("{} set camera {} {}", principal.name, camera.id, camera.status),
				None => info!("Camera {} is now {}", camera.id, camera.status),
			}
			self.publisher.publish(StatusEvent::from(camera.clone()));
		};
		self.store.update_status(id, status, &announce).await
	}
}
