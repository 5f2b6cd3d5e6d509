use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::common::{CameraId, CameraList, CameraRecord, NewCamera, StatusEvent, StatusUpdate, STATUS_UPDATED_EVENT};
use crate::error::StatusError;
use crate::viewer::{CameraSource, EventFeed};



pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// HTTP client for a running board server.
#[derive(Clone)]
pub struct HttpCameraClient {
	http: reqwest::Client,
	base: Url,
	token: Option<String>,
}

impl HttpCameraClient {
	pub fn new(base: Url, token: Option<String>) -> HttpCameraClient {
		HttpCameraClient {
			http: reqwest::Client::new(),
			base,
			token,
		}
	}

	fn endpoint(&self, path: &str) -> Result<Url, StatusError> {
		self.base.join(path).map_err(|err| StatusError::Unavailable(format!("bad server url: {}", err)))
	}

	pub async fn add(&self, name: &str, status: &str) -> Result<CameraRecord, StatusError> {
		let body = NewCamera {
			name: name.to_string(),
			status: status.to_string(),
		};
		let response = self.http.post(self.endpoint("api/cameras")?)
			.json(&body)
			.send()
			.await
			.map_err(unavailable)?;
		read_json(response, None, Some(status)).await
	}

	/// Opens the server's event stream. Subscribe before fetching the list.
	pub async fn subscribe(&self) -> Result<SseFeed, StatusError> {
		let response = self.http.get(self.endpoint("api/events")?)
			.header(reqwest::header::ACCEPT, "text/event-stream")
			.send()
			.await
			.map_err(unavailable)?;
		if !response.status().is_success() {
			return Err(StatusError::Unavailable(format!("event stream refused: {}", response.status())));
		}
		debug!("Subscribed to {}", response.url());
		let chunks = response.bytes_stream()
			.map(|chunk| chunk.map(|bytes| bytes.to_vec()))
			.boxed();
		Ok(SseFeed {
			chunks,
			parser: SseParser::default(),
		})
	}
}

#[rocket::async_trait]
impl CameraSource for HttpCameraClient {
	async fn list_all(&self) -> Result<CameraList, StatusError> {
		let response = self.http.get(self.endpoint("api/cameras")?)
			.send()
			.await
			.map_err(unavailable)?;
		read_json(response, None, None).await
	}

	async fn set_status(&self, id: &CameraId, status: &str) -> Result<CameraRecord, StatusError> {
		let mut request = self.http.put(self.endpoint(&format!("api/cameras/{}", id))?)
			.json(&StatusUpdate { status: status.to_string() });
		if let Some(token) = &self.token {
			request = request.bearer_auth(token);
		}
		let response = request.send().await.map_err(unavailable)?;
		read_json(response, Some(id), Some(status)).await
	}
}

fn unavailable(err: reqwest::Error) -> StatusError {
	StatusError::Unavailable(err.to_string())
}

async fn read_json<T: DeserializeOwned>(response: Response, id: Option<&CameraId>, status: Option<&str>) -> Result<T, StatusError> {
	let code = response.status();
	if code.is_success() {
		return response.json().await.map_err(unavailable);
	}
	match (code, id, status) {
		(StatusCode::NOT_FOUND, Some(id), _) => Err(StatusError::NotFound(id.clone())),
		(StatusCode::BAD_REQUEST, _, Some(status)) => Err(StatusError::InvalidStatus(status.to_string())),
		(StatusCode::UNAUTHORIZED, _, _) => Err(StatusError::Unauthorized),
		_ => {
			let reason = response.text().await.unwrap_or_default();
			Err(StatusError::Unavailable(format!("{}: {}", code, reason)))
		}
	}
}

/// Server-sent `cameraStatusUpdated` events from `/api/events`.
pub struct SseFeed {
	chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
	parser: SseParser,
}

#[rocket::async_trait]
impl EventFeed for SseFeed {
	async fn next_event(&mut self) -> Option<StatusEvent> {
		loop {
			if let Some(event) = self.parser.next_event() {
				return Some(event);
			}
			match self.chunks.next().await {
				Some(Ok(chunk)) => self.parser.push(&chunk),
				Some(Err(err)) => {
					warn!("Event stream failed: {}", err);
					return None;
				},
				None => return None,
			}
		}
	}
}

/// Incremental `text/event-stream` decoder keeping only status events.
#[derive(Default)]
struct SseParser {
	buffer: Vec<u8>,
	event: Option<String>,
	data: Vec<String>,
}

impl SseParser {
	fn push(&mut self, chunk: &[u8]) {
		self.buffer.extend_from_slice(chunk);
	}

	fn next_event(&mut self) -> Option<StatusEvent> {
		while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
			let line: Vec<u8> = self.buffer.drain(..=end).collect();
			let line = String::from_utf8_lossy(&line);
			let line = line.trim_end_matches(&['\n', '\r'][..]);

			if line.is_empty() {
				if let Some(event) = self.dispatch() {
					return Some(event);
				}
				continue;
			}
			if line.starts_with(':') {
				continue;
			}
			let (field, value) = match line.split_once(':') {
				Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
				None => (line, ""),
			};
			match field {
				"event" => self.event = Some(value.to_string()),
				"data" => self.data.push(value.to_string()),
				_ => {},
			}
		}
		None
	}

	fn dispatch(&mut self) -> Option<StatusEvent> {
		let event = self.event.take();
		let data = std::mem::take(&mut self.data).join("\n");
		if event.as_deref() != Some(STATUS_UPDATED_EVENT) || data.is_empty() {
			return None;
		}
		match serde_json::from_str::<StatusEvent>(&data) {
			Ok(event) => Some(event),
			Err(err) => {
				warn!("Ignoring malformed status event: {}", err);
				None
			}
		}
	}
}
