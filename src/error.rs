use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::json;
use rocket::Request;
use thiserror::Error;

use crate::common::CameraId;



#[derive(Debug, Error)]
pub enum StatusError {
	#[error("Camera {0} was not found.")]
	NotFound(CameraId),

	#[error("Invalid camera status '{0}'; expected 'online' or 'offline'.")]
	InvalidStatus(String),

	#[error("Camera store failure: {0}")]
	Persistence(String),

	#[error("Changing camera status requires an authenticated caller.")]
	Unauthorized,

	#[error("Camera server unavailable: {0}")]
	Unavailable(String),
}

impl StatusError {
	pub fn http_status(&self) -> Status {
		match self {
			StatusError::NotFound(_) => Status::NotFound,
			StatusError::InvalidStatus(_) => Status::BadRequest,
			StatusError::Persistence(_) => Status::InternalServerError,
			StatusError::Unauthorized => Status::Unauthorized,
			StatusError::Unavailable(_) => Status::BadGateway,
		}
	}
}

impl<'r> Responder<'r, 'static> for StatusError {
	fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
		let body = json!({
			"status": "error",
			"reason": self.to_string(),
		});
		Response::build_from(body.respond_to(request)?)
			.status(self.http_status())
			.ok()
	}
}
