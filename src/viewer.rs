//! Viewer-side copy of the camera table, kept current from pushed status events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::Principal;
use crate::broadcast::Session;
use crate::common::{CameraId, CameraList, CameraMap, CameraRecord, StatusEvent};
use crate::error::StatusError;
use crate::service::StatusService;



/// Stream of pushed status events for one viewer.
#[rocket::async_trait]
pub trait EventFeed: Send {
	/// `None` once the feed has closed.
	async fn next_event(&mut self) -> Option<StatusEvent>;
}

#[rocket::async_trait]
impl EventFeed for Session {
	async fn next_event(&mut self) -> Option<StatusEvent> {
		self.recv().await
	}
}

#[rocket::async_trait]
impl EventFeed for mpsc::Receiver<StatusEvent> {
	async fn next_event(&mut self) -> Option<StatusEvent> {
		self.recv().await
	}
}

/// Read and write path a viewer uses to reach the authoritative table.
#[rocket::async_trait]
pub trait CameraSource: Send + Sync {
	async fn list_all(&self) -> Result<CameraList, StatusError>;
	async fn set_status(&self, id: &CameraId, status: &str) -> Result<CameraRecord, StatusError>;
}

/// In-process source acting for an optional principal.
pub struct LocalSource {
	service: Arc<StatusService>,
	principal: Option<Principal>,
}

impl LocalSource {
	pub fn new(service: Arc<StatusService>, principal: Option<Principal>) -> LocalSource {
		LocalSource { service, principal }
	}
}

#[rocket::async_trait]
impl CameraSource for LocalSource {
	async fn list_all(&self) -> Result<CameraList, StatusError> {
		self.service.get_all().await
	}

	async fn set_status(&self, id: &CameraId, status: &str) -> Result<CameraRecord, StatusError> {
		self.service.set_status(self.principal.as_ref(), id, status).await
	}
}

#[derive(Clone)]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ViewerState {
	cameras: CameraMap,
}

impl ViewerState {
	pub fn replace_all(&mut self, cameras: CameraList) {
		self.cameras = cameras.into_iter()
			.map(|camera| (camera.id.clone(), camera))
			.collect();
	}

	/// Replaces or inserts the record for `record.id`. Returns whether anything changed.
	pub fn apply(&mut self, record: CameraRecord) -> bool {
		if self.cameras.get(&record.id) == Some(&record) {
			return false;
		}
		self.cameras.insert(record.id.clone(), record);
		true
	}

	pub fn get(&self, id: &CameraId) -> Option<&CameraRecord> {
		self.cameras.get(id)
	}

	pub fn records(&self) -> impl Iterator<Item = &CameraRecord> {
		self.cameras.values()
	}

	pub fn len(&self) -> usize {
		self.cameras.len()
	}

	pub fn is_empty(&self) -> bool {
		self.cameras.is_empty()
	}
}

struct Shared {
	view: ViewerState,
	subscribed: bool,
	// Refreshes whose fetch is still in flight, and the records merged since the first of them started.
	refreshing: usize,
	merged_while_refreshing: CameraMap,
}

impl Shared {
	fn new(view: ViewerState) -> Shared {
		Shared {
			view,
			subscribed: true,
			refreshing: 0,
			merged_while_refreshing: CameraMap::new(),
		}
	}
}

type SharedState = Arc<Mutex<Shared>>;

pub struct Reconciler {
	source: Arc<dyn CameraSource>,
	shared: SharedState,
	revision: Arc<watch::Sender<u64>>,
	feed_task: Option<JoinHandle<()>>,
}

impl Reconciler {
	/// Fetches the full table and starts merging events from `feed`.
	///
	/// `feed` must already be subscribed so nothing published during the fetch is missed.
	pub async fn mount<F>(source: Arc<dyn CameraSource>, mut feed: F) -> Result<Reconciler, StatusError>
	where
		F: EventFeed + 'static,
	{
		let mut view = ViewerState::default();
		view.replace_all(source.list_all().await?);
		debug!("Viewer mounted with {} camera(s)", view.len());

		let shared = Arc::new(Mutex::new(Shared::new(view)));
		let revision = Arc::new(watch::channel(0).0);

		let feed_task = tokio::spawn({
			let shared = Arc::clone(&shared);
			let revision = Arc::clone(&revision);
			async move {
				while let Some(event) = feed.next_event().await {
					if !merge(&shared, &revision, event.record) {
						break;
					}
				}
				debug!("Viewer event feed closed");
			}
		});

		Ok(Reconciler {
			source,
			shared,
			revision,
			feed_task: Some(feed_task),
		})
	}

	/// Writes through the source and applies the returned record right away.
	///
	/// The broadcast for the same change may land before or after; both carry the same record.
	pub async fn set_status(&self, id: &CameraId, status: &str) -> Result<CameraRecord, StatusError> {
		let camera = self.source.set_status(id, status).await?;
		merge(&self.shared, &self.revision, camera.clone());
		Ok(camera)
	}

	/// Re-fetches the full table and replaces local state with it.
	///
	/// Records merged while the fetch was in flight are newer than the fetched
	/// list and are applied again on top of it.
	pub async fn refresh(&self) -> Result<(), StatusError> {
		lock(&self.shared).refreshing += 1;
		let fetched = self.source.list_all().await;

		let mut shared = lock(&self.shared);
		shared.refreshing -= 1;
		let merged = if shared.refreshing == 0 {
			std::mem::take(&mut shared.merged_while_refreshing)
		} else {
			shared.merged_while_refreshing.clone()
		};
		let cameras = fetched?;
		if shared.subscribed {
			shared.view.replace_all(cameras);
			for camera in merged.into_values() {
				shared.view.apply(camera);
			}
			debug!("Viewer refreshed with {} camera(s)", shared.view.len());
			self.revision.send_modify(|revision| *revision += 1);
		}
		Ok(())
	}

	/// Stops applying events. Takes effect immediately; queued events are discarded.
	pub fn unsubscribe(&mut self) {
		lock(&self.shared).subscribed = false;
		if let Some(feed_task) = self.feed_task.take() {
			feed_task.abort();
			debug!("Viewer unsubscribed");
		}
	}

	pub fn is_subscribed(&self) -> bool {
		lock(&self.shared).subscribed
	}

	pub fn state(&self) -> ViewerState {
		lock(&self.shared).view.clone()
	}

	pub fn snapshot(&self) -> CameraList {
		lock(&self.shared).view.records().cloned().collect()
	}

	/// Revision counter bumped after every change to local state.
	pub fn changes(&self) -> watch::Receiver<u64> {
		self.revision.subscribe()
	}
}

impl Drop for Reconciler {
	fn drop(&mut self) {
		self.unsubscribe();
	}
}

/// Returns false once the reconciler has unsubscribed.
fn merge(shared: &SharedState, revision: &watch::Sender<u64>, camera: CameraRecord) -> bool {
	let mut shared = lock(shared);
	if !shared.subscribed {
		return false;
	}
	if shared.refreshing > 0 {
		shared.merged_while_refreshing.insert(camera.id.clone(), camera.clone());
	}
	if shared.view.apply(camera) {
		revision.send_modify(|revision| *revision += 1);
	}
	true
}

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
	shared.lock().unwrap_or_else(PoisonError::into_inner)
}


#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::sync::Semaphore;

	use super::*;
	use crate::auth::MutationPolicy;
	use crate::broadcast::{Publisher, SessionChannel};
	use crate::common::CameraStatus;
	use crate::store::CameraStore;

	fn camera(id: &str, name: &str, status: CameraStatus) -> CameraRecord {
		CameraRecord {
			id: CameraId::from(id),
			name: name.to_string(),
			status,
		}
	}

	fn setup() -> (Arc<StatusService>, Arc<SessionChannel>) {
		let mut cameras = CameraMap::new();
		cameras.insert(CameraId::from("A"), camera("A", "Lobby", CameraStatus::Offline));
		let channel = Arc::new(SessionChannel::default());
		let store = Arc::new(CameraStore::with_cameras(cameras, None));
		let service = Arc::new(StatusService::new(store, channel.clone(), MutationPolicy::Open));
		(service, channel)
	}

	/// Serves a fixed table, one fetch per permit.
	struct GatedSource {
		cameras: CameraList,
		fetches: Semaphore,
	}

	#[rocket::async_trait]
	impl CameraSource for GatedSource {
		async fn list_all(&self) -> Result<CameraList, StatusError> {
			let permit = self.fetches.acquire().await
				.map_err(|err| StatusError::Unavailable(err.to_string()))?;
			permit.forget();
			Ok(self.cameras.clone())
		}

		async fn set_status(&self, _id: &CameraId, _status: &str) -> Result<CameraRecord, StatusError> {
			Err(StatusError::Unavailable("read-only".to_string()))
		}
	}

	async fn wait_for(reconciler: &Reconciler, done: impl Fn(&ViewerState) -> bool) {
		let mut changes = reconciler.changes();
		let waiting = async {
			while !done(&reconciler.state()) {
				if changes.changed().await.is_err() {
					break;
				}
			}
		};
		tokio::time::timeout(Duration::from_secs(5), waiting).await.unwrap();
	}

	#[test]
	fn applying_the_same_record_twice_is_idempotent() {
		let mut state = ViewerState::default();
		state.replace_all(vec![camera("A", "Lobby", CameraStatus::Offline)]);

		assert!(state.apply(camera("A", "Lobby", CameraStatus::Online)));
		let once = state.clone();
		assert!(!state.apply(camera("A", "Lobby", CameraStatus::Online)));
		assert_eq!(state, once);
	}

	#[test]
	fn unknown_records_are_inserted() {
		let mut state = ViewerState::default();
		assert!(state.apply(camera("B", "Garage", CameraStatus::Online)));
		assert_eq!(state.len(), 1);
		assert_eq!(state.get(&CameraId::from("B")).map(|c| c.status), Some(CameraStatus::Online));
	}

	#[test]
	fn replace_all_discards_previous_state() {
		let mut state = ViewerState::default();
		state.apply(camera("B", "Garage", CameraStatus::Online));
		state.replace_all(vec![camera("A", "Lobby", CameraStatus::Offline)]);
		assert_eq!(state.records().cloned().collect::<Vec<_>>(), vec![camera("A", "Lobby", CameraStatus::Offline)]);
	}

	#[rocket::async_test]
	async fn mount_loads_the_table_and_follows_broadcasts() {
		let (service, channel) = setup();
		let source = Arc::new(LocalSource::new(service.clone(), None));
		let reconciler = Reconciler::mount(source, channel.connect()).await.unwrap();
		assert_eq!(reconciler.snapshot(), vec![camera("A", "Lobby", CameraStatus::Offline)]);

		service.set_status(None, &CameraId::from("A"), "online").await.unwrap();
		wait_for(&reconciler, |state| {
			state.get(&CameraId::from("A")).map(|c| c.status) == Some(CameraStatus::Online)
		}).await;
	}

	#[rocket::async_test]
	async fn events_queued_during_mount_are_applied_after_the_fetch() {
		let (service, channel) = setup();
		let session = channel.connect();
		// Published after subscribing but before the fetch completes.
		channel.publish(StatusEvent::from(camera("B", "Garage", CameraStatus::Online)));

		let source = Arc::new(LocalSource::new(service, None));
		let reconciler = Reconciler::mount(source, session).await.unwrap();
		wait_for(&reconciler, |state| state.len() == 2).await;
		assert_eq!(
			reconciler.state().get(&CameraId::from("B")),
			Some(&camera("B", "Garage", CameraStatus::Online))
		);
	}

	#[rocket::async_test]
	async fn local_write_and_its_broadcast_apply_once() {
		let (service, _channel) = setup();
		let (feed, events) = mpsc::channel::<StatusEvent>(8);
		let source = Arc::new(LocalSource::new(service, None));
		let reconciler = Reconciler::mount(source, events).await.unwrap();

		let updated = reconciler.set_status(&CameraId::from("A"), "online").await.unwrap();
		assert_eq!(*reconciler.changes().borrow(), 1);

		// The broadcast of the same write arrives afterwards, followed by a marker event.
		feed.send(StatusEvent::from(updated.clone())).await.unwrap();
		feed.send(StatusEvent::from(camera("B", "Garage", CameraStatus::Online))).await.unwrap();
		wait_for(&reconciler, |state| state.len() == 2).await;

		assert_eq!(*reconciler.changes().borrow(), 2);
		assert_eq!(reconciler.state().get(&updated.id), Some(&updated));
	}

	#[rocket::async_test]
	async fn unsubscribed_reconciler_never_changes() {
		let (service, channel) = setup();
		let source = Arc::new(LocalSource::new(service.clone(), None));
		let mut reconciler = Reconciler::mount(source, channel.connect()).await.unwrap();
		let before = reconciler.state();

		reconciler.unsubscribe();
		assert!(!reconciler.is_subscribed());

		service.set_status(None, &CameraId::from("A"), "online").await.unwrap();
		channel.publish(StatusEvent::from(camera("B", "Garage", CameraStatus::Online)));
		reconciler.set_status(&CameraId::from("A"), "offline").await.unwrap();
		reconciler.refresh().await.unwrap();
		tokio::task::yield_now().await;

		assert_eq!(reconciler.state(), before);
		assert_eq!(*reconciler.changes().borrow(), 0);
	}

	#[rocket::async_test]
	async fn refresh_replaces_local_state() {
		let (service, _channel) = setup();
		let (_feed, events) = mpsc::channel::<StatusEvent>(8);
		let source = Arc::new(LocalSource::new(service.clone(), None));
		let reconciler = Reconciler::mount(source, events).await.unwrap();

		service.add("Garage".to_string(), "offline").await.unwrap();
		assert_eq!(reconciler.state().len(), 1);
		reconciler.refresh().await.unwrap();
		assert_eq!(reconciler.state().len(), 2);
	}

	#[rocket::async_test]
	async fn event_merged_during_refresh_outlives_the_fetched_list() {
		let source = Arc::new(GatedSource {
			cameras: vec![camera("A", "Lobby", CameraStatus::Offline)],
			fetches: Semaphore::new(1),
		});
		let (feed, events) = mpsc::channel::<StatusEvent>(8);
		let reconciler = Reconciler::mount(source.clone(), events).await.unwrap();
		let online = camera("A", "Lobby", CameraStatus::Online);

		// The fetch starts before the event and completes after it was merged.
		let pushing = async {
			feed.send(StatusEvent::from(online.clone())).await.unwrap();
			wait_for(&reconciler, |state| state.get(&online.id) == Some(&online)).await;
			source.fetches.add_permits(1);
		};
		let (refreshed, ()) = tokio::join!(reconciler.refresh(), pushing);
		refreshed.unwrap();
		assert_eq!(reconciler.state().get(&online.id), Some(&online));

		// Only events from during that fetch win; a later refresh takes the list as is.
		source.fetches.add_permits(1);
		reconciler.refresh().await.unwrap();
		assert_eq!(reconciler.snapshot(), vec![camera("A", "Lobby", CameraStatus::Offline)]);
	}
}
