use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::common::StatusEvent;



pub type SessionId = u64;

pub const DEFAULT_SESSION_BUFFER: usize = 64;

/// Capability the status service needs to announce a change.
///
/// Publishing is fire-and-forget: it never blocks on a slow viewer and never
/// reports per-session failures to the caller. Returns how many sessions the
/// event was queued for.
pub trait Publisher: Send + Sync {
	fn publish(&self, event: StatusEvent) -> usize;
}

/// Delivery failure for a single session. Logged and dropped.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("viewer session {0} is not keeping up; event dropped")]
	Lagging(SessionId),

	#[error("viewer session {0} has gone away")]
	Disconnected(SessionId),
}

/// Set of currently connected viewer sessions.
pub struct SessionRegistry {
	sessions: Mutex<HashMap<SessionId, mpsc::Sender<StatusEvent>>>,
	next_id: AtomicU64,
}

impl SessionRegistry {
	pub fn new() -> SessionRegistry {
		SessionRegistry {
			sessions: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
		}
	}

	pub fn add(&self, sender: mpsc::Sender<StatusEvent>) -> SessionId {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.lock().insert(id, sender);
		id
	}

	pub fn remove(&self, id: SessionId) -> bool {
		self.lock().remove(&id).is_some()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Queues `event` for every registered session, dropping sessions whose receiver is gone.
	fn deliver(&self, event: &StatusEvent) -> usize {
		let mut sessions = self.lock();
		let mut delivered = 0;
		let mut failures = Vec::new();

		for (id, sender) in sessions.iter() {
			match sender.try_send(event.clone()) {
				Ok(()) => delivered += 1,
				Err(TrySendError::Full(_)) => failures.push(TransportError::Lagging(*id)),
				Err(TrySendError::Closed(_)) => failures.push(TransportError::Disconnected(*id)),
			}
		}

		for failure in failures {
			warn!("{}", failure);
			if let TransportError::Disconnected(id) = failure {
				sessions.remove(&id);
			}
		}
		delivered
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<StatusEvent>>> {
		self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Default for SessionRegistry {
	fn default() -> Self {
		SessionRegistry::new()
	}
}

/// Broadcast channel that fans status events out to connected viewer sessions.
pub struct SessionChannel {
	registry: Arc<SessionRegistry>,
	buffer: usize,
}

impl SessionChannel {
	pub fn new(buffer: usize) -> SessionChannel {
		SessionChannel {
			registry: Arc::new(SessionRegistry::new()),
			buffer: buffer.max(1),
		}
	}

	/// Registers a new viewer. It only receives events published from now on.
	pub fn connect(&self) -> Session {
		let (sender, events) = mpsc::channel(self.buffer);
		let id = self.registry.add(sender);
		info!("Viewer session {} connected ({} active)", id, self.registry.len());
		Session {
			id,
			events,
			registry: Arc::clone(&self.registry),
		}
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.registry
	}
}

impl Default for SessionChannel {
	fn default() -> Self {
		SessionChannel::new(DEFAULT_SESSION_BUFFER)
	}
}

impl Publisher for SessionChannel {
	fn publish(&self, event: StatusEvent) -> usize {
		let delivered = self.registry.deliver(&event);
		debug!(
			"Published status {} of camera {} to {} session(s)",
			event.record.status, event.record.id, delivered
		);
		delivered
	}
}

/// One connected viewer. Dropping it unregisters the session.
pub struct Session {
	id: SessionId,
	events: mpsc::Receiver<StatusEvent>,
	registry: Arc<SessionRegistry>,
}

impl Session {
	pub fn id(&self) -> SessionId {
		self.id
	}

	pub async fn recv(&mut self) -> Option<StatusEvent> {
		self.events.recv().await
	}

	pub fn try_recv(&mut self) -> Option<StatusEvent> {
		self.events.try_recv().ok()
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		if self.registry.remove(self.id) {
			info!("Viewer session {} disconnected", self.id);
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use crate::common::{CameraId, CameraRecord, CameraStatus};

	fn event(id: &str, status: CameraStatus) -> StatusEvent {
		StatusEvent::from(CameraRecord {
			id: CameraId::from(id),
			name: "Lobby".to_string(),
			status,
		})
	}

	#[test]
	fn publish_reaches_every_connected_session() {
		let channel = SessionChannel::default();
		let mut first = channel.connect();
		let mut second = channel.connect();
		assert_ne!(first.id(), second.id());

		assert_eq!(channel.publish(event("A", CameraStatus::Online)), 2);
		assert_eq!(first.try_recv(), Some(event("A", CameraStatus::Online)));
		assert_eq!(second.try_recv(), Some(event("A", CameraStatus::Online)));
		assert_eq!(first.try_recv(), None);
	}

	#[test]
	fn publish_without_sessions_is_a_no_op() {
		let channel = SessionChannel::default();
		assert_eq!(channel.publish(event("A", CameraStatus::Online)), 0);
	}

	#[test]
	fn late_sessions_get_no_replay() {
		let channel = SessionChannel::default();
		channel.publish(event("A", CameraStatus::Online));

		let mut late = channel.connect();
		assert_eq!(late.try_recv(), None);
		channel.publish(event("A", CameraStatus::Offline));
		assert_eq!(late.try_recv(), Some(event("A", CameraStatus::Offline)));
	}

	#[test]
	fn full_session_drops_events_without_affecting_others() {
		let channel = SessionChannel::new(1);
		let mut slow = channel.connect();
		let mut fast = channel.connect();

		assert_eq!(channel.publish(event("A", CameraStatus::Online)), 2);
		assert_eq!(fast.try_recv(), Some(event("A", CameraStatus::Online)));
		assert_eq!(channel.publish(event("A", CameraStatus::Offline)), 1);
		assert_eq!(fast.try_recv(), Some(event("A", CameraStatus::Offline)));

		assert_eq!(slow.try_recv(), Some(event("A", CameraStatus::Online)));
		assert_eq!(slow.try_recv(), None);
		assert_eq!(channel.registry().len(), 2);
	}

	#[test]
	fn dropping_a_session_unregisters_it() {
		let channel = SessionChannel::default();
		let session = channel.connect();
		let _other = channel.connect();
		assert_eq!(channel.registry().len(), 2);

		drop(session);
		assert_eq!(channel.registry().len(), 1);
		assert_eq!(channel.publish(event("A", CameraStatus::Online)), 1);
	}

	#[test]
	fn closed_senders_are_pruned_on_publish() {
		let registry = SessionRegistry::new();
		let (sender, receiver) = mpsc::channel(4);
		registry.add(sender);
		drop(receiver);

		assert_eq!(registry.deliver(&event("A", CameraStatus::Online)), 0);
		assert!(registry.is_empty());
	}
}
