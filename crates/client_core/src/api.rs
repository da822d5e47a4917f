use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use shared::domain::{EventId, Seat, SeatId};
use tracing::{debug, warn};

use crate::{error::ClientError, session::AuthSession};

#[async_trait]
pub trait SeatApi: Send + Sync {
    async fn list_seats(&self) -> Result<Vec<Seat>, ClientError>;
    async fn list_event_seats(&self, event_id: EventId) -> Result<Vec<Seat>, ClientError>;
    async fn get_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError>;
    async fn get_seat_by_number(&self, seat_number: &str) -> Result<Seat, ClientError>;
    async fn create_seat(&self, seat_number: &str) -> Result<Seat, ClientError>;
    async fn lock_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError>;
    async fn confirm_seat(&self, seat_id: SeatId) -> Result<(), ClientError>;
    async fn release_seat(&self, seat_id: SeatId) -> Result<(), ClientError>;
}

pub struct HttpSeatApi {
    auth: AuthSession,
}

impl HttpSeatApi {
    pub fn new(auth: AuthSession) -> Self {
        Self { auth }
    }

    fn seats_url(&self, suffix: &str) -> String {
        let settings = self.auth.settings();
        settings.endpoint(&format!("{}/seats{suffix}", settings.booking_path))
    }

    async fn require_login(&self) -> Result<(), ClientError> {
        if self.auth.is_authenticated().await {
            Ok(())
        } else {
            Err(ClientError::NotAuthenticated)
        }
    }

    async fn call(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        self.require_login().await?;
        self.auth.send(request).await
    }

    async fn seat_action(&self, seat_id: SeatId, action: &str) -> Result<Response, ClientError> {
        debug!(seat_id = seat_id.0, action, "api: seat action");
        let url = self.seats_url(&format!("/{}/{action}", seat_id.0));
        self.call(self.auth.http().post(url)).await
    }

    async fn seat_list(&self, request: RequestBuilder) -> Result<Vec<Seat>, ClientError> {
        let entries: Vec<serde_json::Value> = self.call(request).await?.json().await?;
        Ok(decode_seat_list(entries))
    }
}

fn decode_seat_list(entries: Vec<serde_json::Value>) -> Vec<Seat> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Seat>(entry) {
            Ok(seat) => Some(seat),
            Err(err) => {
                warn!(error = %err, "api: skipping malformed seat");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SeatApi for HttpSeatApi {
    async fn list_seats(&self) -> Result<Vec<Seat>, ClientError> {
        self.seat_list(self.auth.http().get(self.seats_url(""))).await
    }

    async fn list_event_seats(&self, event_id: EventId) -> Result<Vec<Seat>, ClientError> {
        let settings = self.auth.settings();
        let url = settings.endpoint(&format!("{}/{}/seats", settings.events_path, event_id.0));
        self.seat_list(self.auth.http().get(url)).await
    }

    async fn get_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        let url = self.seats_url(&format!("/{}", seat_id.0));
        let res = self.call(self.auth.http().get(url)).await?;
        Ok(res.json().await?)
    }

    async fn get_seat_by_number(&self, seat_number: &str) -> Result<Seat, ClientError> {
        let mut url = url::Url::parse(&self.seats_url("/number"))
            .map_err(|err| ClientError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl("seat url cannot take path segments".into()))?
            .push(seat_number);
        let res = self.call(self.auth.http().get(url)).await?;
        Ok(res.json().await?)
    }

    async fn create_seat(&self, seat_number: &str) -> Result<Seat, ClientError> {
        let request = self
            .auth
            .http()
            .post(self.seats_url(""))
            .query(&[("number", seat_number)]);
        let res = self.call(request).await?;
        Ok(res.json().await?)
    }

    async fn lock_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        let res = self.seat_action(seat_id, "lock").await?;
        Ok(res.json().await?)
    }

    async fn confirm_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        self.seat_action(seat_id, "confirm").await?;
        Ok(())
    }

    async fn release_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        self.seat_action(seat_id, "release").await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
