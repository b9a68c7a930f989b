use snafu::Snafu;

use crate::modules::models::race::RaceStatus;

pub type CustomResult<T> = Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("race {id} not found"))]
    RaceNotFoundError { id: i32 },

    #[snafu(display("driver {id} not found"))]
    DriverNotFoundError { id: i32 },

    #[snafu(display("lap {id} not found"))]
    LapNotFoundError { id: i32 },

    #[snafu(display("illegal race transition: {from} -> {to}"))]
    InvalidTransitionError { from: RaceStatus, to: RaceStatus },

    #[snafu(display("race is not running (status: {status})"))]
    RaceNotRunningError { status: RaceStatus },

    #[snafu(display("invalid stint duration: {millis}ms"))]
    InvalidDurationError { millis: i64 },

    /// Aggregate rollback would produce negative totals. Integrity fault,
    /// repairable with a full recompute, not a user error.
    #[snafu(display("inconsistent aggregate state: {details}"))]
    InconsistentStateError { details: String },

    #[snafu(display("{details}"))]
    ValidationError { details: String },

    #[snafu(display("database error: {source}"))]
    DatabaseError { source: diesel::result::Error },

    #[snafu(display("connectivity error: {details}"))]
    ConnectivityError { details: String },
}

impl From<diesel::result::Error> for Error {
    fn from(source: diesel::result::Error) -> Self {
        Error::DatabaseError { source }
    }
}
