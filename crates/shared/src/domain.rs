use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(SeatId);
id_newtype!(EventId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Organizer,
    Participant,
}

impl Role {
    pub fn can_book_seats(self) -> bool {
        matches!(self, Role::Participant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Locked,
    Booked,
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Locked => "LOCKED",
            SeatStatus::Booked => "BOOKED",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeatState {
    Available,
    Locked { by: String },
    Booked,
}

impl SeatState {
    /// Builds a state from the wire pair. A holder on a non-locked status is
    /// dropped; a locked status without a holder is rejected.
    pub fn from_wire(status: SeatStatus, locked_by: Option<String>) -> Result<Self, String> {
        match status {
            SeatStatus::Available => Ok(SeatState::Available),
            SeatStatus::Booked => Ok(SeatState::Booked),
            SeatStatus::Locked => match locked_by {
                Some(by) if !by.is_empty() => Ok(SeatState::Locked { by }),
                _ => Err("LOCKED seat is missing lockedBy".to_string()),
            },
        }
    }

    pub fn status(&self) -> SeatStatus {
        match self {
            SeatState::Available => SeatStatus::Available,
            SeatState::Locked { .. } => SeatStatus::Locked,
            SeatState::Booked => SeatStatus::Booked,
        }
    }

    pub fn locked_by(&self) -> Option<&str> {
        match self {
            SeatState::Locked { by } => Some(by),
            _ => None,
        }
    }

    pub fn is_locked_by(&self, viewer: &str) -> bool {
        self.locked_by() == Some(viewer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSeat", into = "WireSeat")]
pub struct Seat {
    pub id: SeatId,
    pub seat_number: String,
    pub state: SeatState,
}

impl Seat {
    pub fn new(id: SeatId, seat_number: impl Into<String>, state: SeatState) -> Self {
        Self {
            id,
            seat_number: seat_number.into(),
            state,
        }
    }

    pub fn status(&self) -> SeatStatus {
        self.state.status()
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.state.locked_by()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSeat {
    id: SeatId,
    seat_number: String,
    status: SeatStatus,
    #[serde(default)]
    locked_by: Option<String>,
}

impl TryFrom<WireSeat> for Seat {
    type Error = String;

    fn try_from(value: WireSeat) -> Result<Self, Self::Error> {
        let state = SeatState::from_wire(value.status, value.locked_by)
            .map_err(|err| format!("seat {}: {err}", value.id.0))?;
        Ok(Seat {
            id: value.id,
            seat_number: value.seat_number,
            state,
        })
    }
}

impl From<Seat> for WireSeat {
    fn from(value: Seat) -> Self {
        let status = value.status();
        let locked_by = match value.state {
            SeatState::Locked { by } => Some(by),
            _ => None,
        };
        WireSeat {
            id: value.id,
            seat_number: value.seat_number,
            status,
            locked_by,
        }
    }
}
