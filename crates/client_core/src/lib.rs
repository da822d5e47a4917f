pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod reservation;
pub mod seats;
pub mod session;
pub mod stomp;
pub mod view;

pub use api::{HttpSeatApi, SeatApi};
pub use config::{load_settings, load_settings_from, ReleasePolicy, Settings};
pub use error::{ClientError, ReservationError};
pub use feed::{FeedCallbacks, FeedConnector, FeedStatus, SeatFeed, TungsteniteConnector};
pub use reservation::{
    ClickOutcome, ReservationController, ReservationEvent, ReservationSession, SeatAction,
    SeatScope, SessionEndReason,
};
pub use seats::SeatList;
pub use session::{AuthSession, AuthenticatedUser};
pub use view::SeatView;
