use rocket::{Request, Response};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Header;



// The dashboard UI is served by another server, so responses must carry CORS headers for its origin.
pub struct CORS {
	allowed_origin: String,
}

impl CORS {
	pub fn new(allowed_origin: impl Into<String>) -> CORS {
		CORS {
			allowed_origin: allowed_origin.into(),
		}
	}
}

#[rocket::async_trait]
impl Fairing for CORS {
	fn info(&self) -> Info {
		Info {
			name: "Add CORS headers to responses",
			kind: Kind::Response
		}
	}

	async fn on_response<'r>(&self, _request: &'r Request<'_>, response: &mut Response<'r>) {
		response.set_header(Header::new("Access-Control-Allow-Origin", self.allowed_origin.clone()));
		response.set_header(Header::new("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS"));
		response.set_header(Header::new("Access-Control-Allow-Headers", "*"));
		response.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
	}
}

// Preflight requests only need the headers added above.
#[options("/<_..>")]
pub fn preflight() {}
