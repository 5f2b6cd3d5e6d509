use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::request::FromParam;
use rocket::response::status;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::{json, Json, Value};
use rocket::tokio::select;
use rocket::{Build, Rocket, Shutdown, State};

use crate::auth::{Principal, TokenResolver};
use crate::broadcast::SessionChannel;
use crate::common::{CameraId, CameraList, CameraRecord, NewCamera, StatusUpdate, STATUS_UPDATED_EVENT};
use crate::config::BoardConfig;
use crate::cors::{self, CORS};
use crate::error::StatusError;
use crate::service::StatusService;
use crate::store::CameraStore;



impl<'a> FromParam<'a> for CameraId {
	type Error = &'a str;

	fn from_param(param: &'a str) -> Result<Self, Self::Error> {
		if param.is_empty() {
			Err(param)
		} else {
			Ok(CameraId::new(param))
		}
	}
}

#[get("/")]
async fn list_cameras(service: &State<Arc<StatusService>>) -> Result<Json<CameraList>, StatusError> {
	service.get_all().await.map(Json)
}

#[get("/<id>")]
async fn get_camera(id: CameraId, service: &State<Arc<StatusService>>) -> Result<Json<CameraRecord>, StatusError> {
	service.get(&id).await.map(Json)
}

#[post("/", data="<camera_json>")]
async fn new_camera(camera_json: Json<NewCamera>, service: &State<Arc<StatusService>>) -> Result<status::Created<Json<CameraRecord>>, StatusError> {
	let NewCamera { name, status } = camera_json.into_inner();
	let camera = service.add(name, &status).await?;
	let location = format!("/api/cameras/{}", camera.id);
	Ok(status::Created::new(location).body(Json(camera)))
}

#[put("/<id>", data="<update_json>")]
async fn update_status(
	id: CameraId,
	update_json: Json<StatusUpdate>,
	principal: Option<Principal>,
	service: &State<Arc<StatusService>>,
) -> Result<Json<CameraRecord>, StatusError> {
	service.set_status(principal.as_ref(), &id, &update_json.status).await.map(Json)
}

/// Pushes every status change to this viewer until it disconnects or the server shuts down.
#[get("/events")]
fn status_events(channel: &State<Arc<SessionChannel>>, mut shutdown: Shutdown) -> EventStream![] {
	let mut session = channel.connect();
	EventStream! {
		loop {
			let event = select! {
				event = session.recv() => match event {
					Some(event) => event,
					None => break,
				},
				_ = &mut shutdown => break,
			};
			yield Event::json(&event).event(STATUS_UPDATED_EVENT);
		}
	}
}

#[get("/health")]
fn health(channel: &State<Arc<SessionChannel>>) -> Value {
	json!({
		"status": "ok",
		"sessions": channel.registry().len(),
	})
}

fn error_body(reason: &str) -> Value {
	json!({
		"status": "error",
		"reason": reason,
	})
}

#[catch(400)]
fn bad_request() -> Value {
	error_body("The request could not be understood.")
}

#[catch(401)]
fn unauthorized() -> Value {
	error_body("Authentication is required.")
}

#[catch(404)]
fn not_found() -> Value {
	error_body("Resource was not found.")
}

#[catch(422)]
fn unprocessable() -> Value {
	error_body("The request body is not valid for this resource.")
}

#[catch(500)]
fn internal_error() -> Value {
	error_body("Internal server error.")
}



pub fn stage(board: &BoardConfig) -> Result<AdHoc, StatusError> {
	let store = match &board.store_file {
		Some(path) => CameraStore::open(path)?,
		None => CameraStore::in_memory(),
	};
	let channel = Arc::new(SessionChannel::new(board.session_buffer));
	let service = Arc::new(StatusService::new(Arc::new(store), channel.clone(), board.mutation_policy));
	let resolver = TokenResolver::new(&board.api_tokens);

	Ok(AdHoc::on_ignite("Camera status board", |rocket| async move {
		rocket
			.manage(service)
			.manage(channel)
			.manage(resolver)
			.register("/", catchers![bad_request, unauthorized, not_found, unprocessable, internal_error])
			.mount("/", routes![cors::preflight])
			.mount("/api", routes![status_events, health])
			.mount("/api/cameras", routes![list_cameras, get_camera, new_camera, update_status])
	}))
}

/// Attaches the board's routes, state and CORS handling to `rocket`.
pub fn attach(rocket: Rocket<Build>, board: &BoardConfig) -> Result<Rocket<Build>, StatusError> {
	Ok(rocket
		.attach(stage(board)?)
		.attach(CORS::new(board.allowed_origin())))
}
