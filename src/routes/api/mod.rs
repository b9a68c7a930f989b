use std::io::Cursor;

use log::error;
use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;

use crate::errors::Error;

pub mod race;
pub mod driver;
pub mod lap;
pub mod weather;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Error payload of every handler: `{ "message": ... }` with a 4xx status
/// for user errors and a 5xx for server-side faults.
#[derive(Debug)]
pub struct ApiError {
    pub status: Status,
    pub message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> ApiError {
        let status = match &error {
            Error::RaceNotFoundError { .. }
            | Error::DriverNotFoundError { .. }
            | Error::LapNotFoundError { .. } => Status::NotFound,
            Error::InvalidTransitionError { .. }
            | Error::RaceNotRunningError { .. }
            | Error::InvalidDurationError { .. }
            | Error::ValidationError { .. } => Status::BadRequest,
            Error::InconsistentStateError { .. } => {
                // integrity fault: log loudly, a recompute pass repairs it
                error!(target:"routes/api", "integrity fault: {}", error);
                Status::InternalServerError
            }
            Error::DatabaseError { .. } | Error::ConnectivityError { .. } => {
                error!(target:"routes/api", "{}", error);
                Status::InternalServerError
            }
        };

        ApiError {
            status,
            message: error.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        let body = serde_json::json!({ "message": self.message }).to_string();

        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
