use shared::{domain::SeatId, error::ApiException};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("not logged in")]
    NotAuthenticated,
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn api(&self) -> Option<&ApiException> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("seat {seat_number} is already locked by you; confirm or release it first")]
    SessionActive { seat_number: String },
    #[error("no seat is currently locked")]
    NoActiveSession,
    #[error("seat {0} is not available")]
    SeatUnavailable(String),
    #[error("seat {0} is not in the seat list")]
    UnknownSeat(SeatId),
    #[error("another seat action is still in progress")]
    ActionInProgress,
    #[error("seat view has been closed")]
    Unmounted,
    #[error(transparent)]
    Client(#[from] ClientError),
}
