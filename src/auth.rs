use std::collections::HashMap;

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::State;

use log::warn;

use crate::error::StatusError;



/// An authenticated caller. How it was established is up to the resolver.
#[derive(Clone)]
#[derive(Debug, PartialEq, Eq)]
pub struct Principal {
	pub name: String,
}

#[derive(Clone, Copy)]
#[derive(Debug, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationPolicy {
	/// Anyone may change a camera's status.
	#[default]
	Open,
	/// Status changes need a principal.
	Authenticated,
}

impl MutationPolicy {
	pub fn authorize(&self, caller: Option<&Principal>) -> Result<(), StatusError> {
		match (self, caller) {
			(MutationPolicy::Open, _) => Ok(()),
			(MutationPolicy::Authenticated, Some(_)) => Ok(()),
			(MutationPolicy::Authenticated, None) => Err(StatusError::Unauthorized),
		}
	}
}

#[derive(Clone)]
#[derive(Debug)]
#[derive(Serialize, Deserialize)]
pub struct ApiToken {
	pub name: String,
	pub token: String,
}

/// Maps static bearer tokens to principals.
pub struct TokenResolver {
	tokens: HashMap<String, String>,
}

impl TokenResolver {
	pub fn new(tokens: &[ApiToken]) -> TokenResolver {
		TokenResolver {
			tokens: tokens.iter()
				.map(|api_token| (api_token.token.clone(), api_token.name.clone()))
				.collect(),
		}
	}

	pub fn resolve(&self, token: &str) -> Option<Principal> {
		self.tokens.get(token).map(|name| Principal { name: name.clone() })
	}
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Principal {
	type Error = StatusError;

	async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
		let Some(header) = request.headers().get_one("Authorization") else {
			return Outcome::Forward(Status::Unauthorized);
		};
		let Some(token) = header.strip_prefix("Bearer ") else {
			return Outcome::Error((Status::Unauthorized, StatusError::Unauthorized));
		};
		let resolver = match request.guard::<&State<TokenResolver>>().await {
			Outcome::Success(resolver) => resolver,
			_ => return Outcome::Error((Status::InternalServerError, StatusError::Unauthorized)),
		};

		match resolver.resolve(token.trim()) {
			Some(principal) => Outcome::Success(principal),
			None => {
				warn!("Rejected unknown bearer token from {:?}", request.client_ip());
				Outcome::Error((Status::Unauthorized, StatusError::Unauthorized))
			}
		}
	}
}
