use serde::{Deserialize, Serialize};

use crate::domain::{Role, SeatId, SeatState, SeatStatus};

pub const SEAT_UPDATES_TOPIC: &str = "/topic/seats";
pub const SEAT_REFRESH_TOPIC: &str = "/topic/seats/refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    // Public sign-up takes PARTICIPANT or ORGANIZER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub token: String,
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "WireSeatUpdate")]
pub struct SeatUpdate {
    pub seat_id: SeatId,
    pub seat_number: Option<String>,
    pub state: SeatState,
    pub message: Option<String>,
}

impl SeatUpdate {
    pub fn new(seat_id: SeatId, state: SeatState) -> Self {
        Self {
            seat_id,
            seat_number: None,
            state,
            message: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSeatUpdate {
    seat_id: SeatId,
    #[serde(default)]
    seat_number: Option<String>,
    status: SeatStatus,
    #[serde(default)]
    locked_by: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl TryFrom<WireSeatUpdate> for SeatUpdate {
    type Error = String;

    fn try_from(value: WireSeatUpdate) -> Result<Self, Self::Error> {
        let state = SeatState::from_wire(value.status, value.locked_by)
            .map_err(|err| format!("seat update {}: {err}", value.seat_id.0))?;
        Ok(SeatUpdate {
            seat_id: value.seat_id,
            seat_number: value.seat_number,
            state,
            message: value.message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    SeatUpdated(SeatUpdate),
    Refresh { released: u32 },
}
