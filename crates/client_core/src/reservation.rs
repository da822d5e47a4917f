use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{EventId, Seat, SeatId, SeatStatus},
    protocol::SeatUpdate,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    api::SeatApi,
    config::{ReleasePolicy, Settings},
    error::ReservationError,
    seats::SeatList,
};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatScope {
    All,
    Event(EventId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSession {
    pub seat_id: SeatId,
    pub seat_number: String,
    pub lock_acquired_at: DateTime<Utc>,
    pub time_left: u64,
}

impl ReservationSession {
    pub fn time_left(&self) -> Duration {
        Duration::from_secs(self.time_left)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    Confirmed,
    Released,
    Expired,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatAction {
    Lock,
    Confirm,
    Release,
    Refresh,
}

impl fmt::Display for SeatAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SeatAction::Lock => "lock",
            SeatAction::Confirm => "confirm",
            SeatAction::Release => "release",
            SeatAction::Refresh => "refresh",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub enum ReservationEvent {
    SeatsChanged(SeatList),
    SessionStarted(ReservationSession),
    SessionReopened(ReservationSession),
    Tick {
        seat_id: SeatId,
        time_left: u64,
    },
    SessionEnded {
        seat_id: SeatId,
        seat_number: String,
        reason: SessionEndReason,
    },
    ActionFailed {
        action: SeatAction,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Locked(ReservationSession),
    Reopened(ReservationSession),
    Ignored,
}

struct ActiveSession {
    view: ReservationSession,
    generation: u64,
    // Fetches issued at or before this sequence number predate the lock.
    since_refresh: u64,
    // Set while confirm or release for this seat awaits the server.
    action_pending: bool,
    // The server stopped showing our lock while an action was pending.
    lost_during_action: bool,
}

struct ControllerState {
    seats: SeatList,
    session: Option<ActiveSession>,
    countdown: Option<JoinHandle<()>>,
    action_in_flight: bool,
    refresh_issued: u64,
    refresh_applied: u64,
    generation: u64,
}

pub struct ReservationController {
    api: Arc<dyn SeatApi>,
    viewer: String,
    scope: SeatScope,
    lock_duration: Duration,
    release_policy: ReleasePolicy,
    inner: Mutex<ControllerState>,
    mounted: AtomicBool,
    events: broadcast::Sender<ReservationEvent>,
}

impl ReservationController {
    pub fn new(
        api: Arc<dyn SeatApi>,
        viewer: impl Into<String>,
        settings: &Settings,
        scope: SeatScope,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            api,
            viewer: viewer.into(),
            scope,
            lock_duration: settings.lock_duration,
            release_policy: settings.release_policy,
            inner: Mutex::new(ControllerState {
                seats: SeatList::default(),
                session: None,
                countdown: None,
                action_in_flight: false,
                refresh_issued: 0,
                refresh_applied: 0,
                generation: 0,
            }),
            mounted: AtomicBool::new(true),
            events,
        })
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ReservationEvent> {
        self.events.subscribe()
    }

    pub async fn seats(&self) -> SeatList {
        self.inner.lock().await.seats.clone()
    }

    pub async fn session(&self) -> Option<ReservationSession> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|active| active.view.clone())
    }

    /// A response that arrives after a newer one has been applied is dropped.
    pub async fn refresh_seats(self: &Arc<Self>) -> Result<SeatList, ReservationError> {
        self.ensure_mounted()?;
        let seq = {
            let mut guard = self.inner.lock().await;
            guard.refresh_issued += 1;
            guard.refresh_issued
        };

        let fetched = match self.scope {
            SeatScope::All => self.api.list_seats().await,
            SeatScope::Event(event_id) => self.api.list_event_seats(event_id).await,
        };
        self.ensure_mounted()?;

        let seats = match fetched {
            Ok(seats) => seats,
            Err(err) => {
                warn!(error = %err, "reservation: seat list fetch failed");
                self.emit_failure(SeatAction::Refresh, err.to_string());
                return Err(err.into());
            }
        };

        let mut guard = self.inner.lock().await;
        if seq <= guard.refresh_applied {
            debug!(
                seq,
                applied = guard.refresh_applied,
                "reservation: discarding stale seat list"
            );
            return Ok(guard.seats.clone());
        }
        guard.refresh_applied = seq;
        guard.seats = SeatList::new(seats);

        let stale_session = guard.session.as_ref().is_some_and(|active| {
            seq > active.since_refresh
                && guard
                    .seats
                    .get(active.view.seat_id)
                    .is_some_and(|seat| !seat.state.is_locked_by(&self.viewer))
        });
        if stale_session {
            self.invalidate_session(&mut guard, "seat list no longer shows our lock");
        }

        debug!(seats = guard.seats.len(), "reservation: seat list refreshed");
        let _ = self
            .events
            .send(ReservationEvent::SeatsChanged(guard.seats.clone()));
        Ok(guard.seats.clone())
    }

    pub async fn lock(self: &Arc<Self>, seat_id: SeatId) -> Result<ReservationSession, ReservationError> {
        self.ensure_mounted()?;
        {
            let mut guard = self.inner.lock().await;
            if let Some(active) = &guard.session {
                return Err(ReservationError::SessionActive {
                    seat_number: active.view.seat_number.clone(),
                });
            }
            if guard.action_in_flight {
                return Err(ReservationError::ActionInProgress);
            }
            let seat = guard
                .seats
                .get(seat_id)
                .ok_or(ReservationError::UnknownSeat(seat_id))?;
            if seat.status() != SeatStatus::Available {
                return Err(ReservationError::SeatUnavailable(seat.seat_number.clone()));
            }
            guard.action_in_flight = true;
        }

        info!(seat_id = seat_id.0, "reservation: requesting lock");
        let result = self.api.lock_seat(seat_id).await;
        if !self.is_mounted() {
            debug!(seat_id = seat_id.0, "reservation: dropping lock result after unmount");
            return Err(ReservationError::Unmounted);
        }

        let seat = match result {
            Ok(seat) => seat,
            Err(err) => {
                self.inner.lock().await.action_in_flight = false;
                warn!(seat_id = seat_id.0, error = %err, "reservation: lock rejected");
                self.emit_failure(SeatAction::Lock, err.to_string());
                return Err(err.into());
            }
        };

        let session = {
            let mut guard = self.inner.lock().await;
            guard.action_in_flight = false;
            guard.seats = guard.seats.with_seat(&seat);
            let session = self.start_session(&mut guard, &seat);
            let _ = self
                .events
                .send(ReservationEvent::SeatsChanged(guard.seats.clone()));
            session
        };
        let _ = self
            .events
            .send(ReservationEvent::SessionStarted(session.clone()));

        self.refresh_after(SeatAction::Lock).await;
        Ok(session)
    }

    pub async fn confirm(self: &Arc<Self>) -> Result<(), ReservationError> {
        let (seat_id, generation) = self.begin_session_action().await?;

        info!(seat_id = seat_id.0, "reservation: confirming booking");
        let result = self.api.confirm_seat(seat_id).await;
        if !self.is_mounted() {
            return Err(ReservationError::Unmounted);
        }

        let mut guard = self.inner.lock().await;
        let lost = self.finish_session_action(&mut guard, generation);
        if let Err(err) = result {
            if lost {
                self.end_session_if(&mut guard, generation, SessionEndReason::Invalidated);
            }
            drop(guard);
            warn!(seat_id = seat_id.0, error = %err, "reservation: confirm failed");
            self.emit_failure(SeatAction::Confirm, err.to_string());
            return Err(err.into());
        }
        self.end_session_if(&mut guard, generation, SessionEndReason::Confirmed);
        drop(guard);

        self.refresh_after(SeatAction::Confirm).await;
        Ok(())
    }

    pub async fn release(self: &Arc<Self>) -> Result<(), ReservationError> {
        let (seat_id, generation) = self.begin_session_action().await?;

        info!(seat_id = seat_id.0, "reservation: releasing seat");
        let result = self.api.release_seat(seat_id).await;
        if !self.is_mounted() {
            return Err(ReservationError::Unmounted);
        }

        let mut guard = self.inner.lock().await;
        let lost = self.finish_session_action(&mut guard, generation);
        match result {
            Ok(()) => {
                self.end_session_if(&mut guard, generation, SessionEndReason::Released);
                drop(guard);
                self.refresh_after(SeatAction::Release).await;
                Ok(())
            }
            Err(err) => {
                warn!(
                    seat_id = seat_id.0,
                    error = %err,
                    policy = ?self.release_policy,
                    "reservation: release failed"
                );
                let clear = self.release_policy == ReleasePolicy::ClearAlways;
                if clear {
                    self.end_session_if(&mut guard, generation, SessionEndReason::Released);
                } else if lost {
                    self.end_session_if(&mut guard, generation, SessionEndReason::Invalidated);
                }
                drop(guard);
                self.emit_failure(SeatAction::Release, err.to_string());
                if clear {
                    self.refresh_after(SeatAction::Release).await;
                }
                Err(err.into())
            }
        }
    }

    /// A delta that no longer shows our lock ends the session silently,
    /// unless a confirm or release for the seat is still pending.
    pub async fn apply_feed_update(&self, update: &SeatUpdate) {
        if !self.is_mounted() {
            return;
        }
        let mut guard = self.inner.lock().await;
        let merged = guard.seats.with_update(update);
        let changed = merged != guard.seats;
        guard.seats = merged;

        let invalidated = guard.session.as_ref().is_some_and(|active| {
            active.view.seat_id == update.seat_id && !update.state.is_locked_by(&self.viewer)
        });
        if invalidated {
            debug!(
                seat_id = update.seat_id.0,
                status = %update.state.status(),
                "reservation: feed no longer shows our lock"
            );
            self.invalidate_session(&mut guard, "lock taken over by the server");
        }
        if changed {
            let _ = self
                .events
                .send(ReservationEvent::SeatsChanged(guard.seats.clone()));
        }
    }

    pub async fn handle_refresh_signal(self: &Arc<Self>, released: u32) -> Result<SeatList, ReservationError> {
        debug!(released, "reservation: server released expired locks");
        self.refresh_seats().await
    }

    pub async fn click(self: &Arc<Self>, seat_id: SeatId) -> Result<ClickOutcome, ReservationError> {
        self.ensure_mounted()?;
        let seat = {
            let guard = self.inner.lock().await;
            guard
                .seats
                .get(seat_id)
                .cloned()
                .ok_or(ReservationError::UnknownSeat(seat_id))?
        };

        if seat.status() == SeatStatus::Available {
            return self.lock(seat_id).await.map(ClickOutcome::Locked);
        }
        if !seat.state.is_locked_by(&self.viewer) {
            debug!(seat_id = seat_id.0, status = %seat.status(), "reservation: click ignored");
            return Ok(ClickOutcome::Ignored);
        }

        let mut guard = self.inner.lock().await;
        let current = guard.session.as_ref().map(|active| active.view.clone());
        let session = match current {
            Some(view) if view.seat_id == seat_id => view,
            Some(_) => return Ok(ClickOutcome::Ignored),
            None => {
                info!(seat_id = seat_id.0, "reservation: adopting lock held by this viewer");
                self.start_session(&mut guard, &seat)
            }
        };
        drop(guard);
        let _ = self
            .events
            .send(ReservationEvent::SessionReopened(session.clone()));
        Ok(ClickOutcome::Reopened(session))
    }

    pub async fn unmount(&self) {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.inner.lock().await;
        if let Some(countdown) = guard.countdown.take() {
            countdown.abort();
        }
        guard.session = None;
        guard.action_in_flight = false;
        debug!("reservation: unmounted");
    }

    fn ensure_mounted(&self) -> Result<(), ReservationError> {
        if self.is_mounted() {
            Ok(())
        } else {
            Err(ReservationError::Unmounted)
        }
    }

    async fn begin_session_action(&self) -> Result<(SeatId, u64), ReservationError> {
        self.ensure_mounted()?;
        let mut guard = self.inner.lock().await;
        if guard.action_in_flight {
            return Err(ReservationError::ActionInProgress);
        }
        let active = guard
            .session
            .as_mut()
            .ok_or(ReservationError::NoActiveSession)?;
        active.action_pending = true;
        active.lost_during_action = false;
        let started = (active.view.seat_id, active.generation);
        guard.action_in_flight = true;
        Ok(started)
    }

    // True when the server dropped our lock while the action was pending.
    fn finish_session_action(&self, state: &mut ControllerState, generation: u64) -> bool {
        state.action_in_flight = false;
        match state
            .session
            .as_mut()
            .filter(|active| active.generation == generation)
        {
            Some(active) => {
                active.action_pending = false;
                std::mem::take(&mut active.lost_during_action)
            }
            None => false,
        }
    }

    // Confirm and release change the seat on the server before they answer,
    // so a conflicting state seen meanwhile is settled by their result.
    fn invalidate_session(&self, state: &mut ControllerState, why: &str) {
        let Some(active) = state.session.as_mut() else {
            return;
        };
        if active.action_pending {
            debug!(
                seat_id = active.view.seat_id.0,
                why, "reservation: deferring session decision to pending action"
            );
            active.lost_during_action = true;
            return;
        }
        info!(why, "reservation: clearing session");
        self.end_session(state, SessionEndReason::Invalidated);
    }

    // A failed refresh after a successful action is reported but does not
    // undo the action.
    async fn refresh_after(self: &Arc<Self>, action: SeatAction) {
        if let Err(err) = self.refresh_seats().await {
            debug!(%action, error = %err, "reservation: follow-up refresh failed");
        }
    }

    fn start_session(self: &Arc<Self>, state: &mut ControllerState, seat: &Seat) -> ReservationSession {
        state.generation += 1;
        let generation = state.generation;
        let view = ReservationSession {
            seat_id: seat.id,
            seat_number: seat.seat_number.clone(),
            lock_acquired_at: Utc::now(),
            time_left: self.lock_duration.as_secs(),
        };
        state.session = Some(ActiveSession {
            view: view.clone(),
            generation,
            since_refresh: state.refresh_issued,
            action_pending: false,
            lost_during_action: false,
        });
        if let Some(previous) = state.countdown.take() {
            previous.abort();
        }
        state.countdown = Some(self.spawn_countdown(generation));
        info!(
            seat_id = seat.id.0,
            seat_number = %seat.seat_number,
            time_left = view.time_left,
            "reservation: session started"
        );
        view
    }

    fn spawn_countdown(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !controller.is_mounted() {
                    return;
                }
                let mut guard = controller.inner.lock().await;
                let Some(active) = guard
                    .session
                    .as_mut()
                    .filter(|active| active.generation == generation)
                else {
                    return;
                };
                active.view.time_left = active.view.time_left.saturating_sub(1);
                let seat_id = active.view.seat_id;
                let time_left = active.view.time_left;
                let _ = controller
                    .events
                    .send(ReservationEvent::Tick { seat_id, time_left });
                if time_left > 0 {
                    continue;
                }

                // Detach our own handle so ending the session does not abort
                // the refresh below.
                guard.countdown.take();
                info!(seat_id = seat_id.0, "reservation: lock expired locally");
                controller.end_session(&mut guard, SessionEndReason::Expired);
                drop(guard);
                controller.refresh_after(SeatAction::Refresh).await;
                return;
            }
        })
    }

    fn end_session_if(&self, state: &mut ControllerState, generation: u64, reason: SessionEndReason) {
        let current = state
            .session
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if current {
            self.end_session(state, reason);
        }
    }

    fn end_session(&self, state: &mut ControllerState, reason: SessionEndReason) {
        let Some(active) = state.session.take() else {
            return;
        };
        if let Some(countdown) = state.countdown.take() {
            countdown.abort();
        }
        info!(
            seat_id = active.view.seat_id.0,
            reason = ?reason,
            "reservation: session ended"
        );
        let _ = self.events.send(ReservationEvent::SessionEnded {
            seat_id: active.view.seat_id,
            seat_number: active.view.seat_number,
            reason,
        });
    }

    fn emit_failure(&self, action: SeatAction, message: String) {
        let _ = self
            .events
            .send(ReservationEvent::ActionFailed { action, message });
    }
}

#[cfg(test)]
#[path = "tests/reservation_tests.rs"]
mod tests;
