use super::*;

use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use shared::{
    domain::SeatState,
    error::{ApiException, ErrorCode},
};
use tokio::sync::Notify;

use crate::error::ClientError;

const VIEWER: &str = "ana";
const TAKEN: &str = "Assento já está bloqueado por outro utilizador";

struct TestSeatApi {
    seats: Mutex<Vec<Seat>>,
    viewer: String,
    confirm_error: Mutex<Option<String>>,
    release_error: Mutex<Option<String>>,
    lock_gate: Option<Arc<Notify>>,
    list_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl TestSeatApi {
    fn new(seats: Vec<Seat>) -> Self {
        Self {
            seats: Mutex::new(seats),
            viewer: VIEWER.to_string(),
            confirm_error: Mutex::new(None),
            release_error: Mutex::new(None),
            lock_gate: None,
            list_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    fn with_lock_gate(mut self, gate: Arc<Notify>) -> Self {
        self.lock_gate = Some(gate);
        self
    }

    async fn set_state(&self, seat_id: SeatId, state: SeatState) {
        let mut seats = self.seats.lock().await;
        if let Some(seat) = seats.iter_mut().find(|seat| seat.id == seat_id) {
            seat.state = state;
        }
    }

    async fn status_of(&self, seat_id: SeatId) -> Option<SeatStatus> {
        self.seats
            .lock()
            .await
            .iter()
            .find(|seat| seat.id == seat_id)
            .map(|seat| seat.status())
    }
}

fn rejected(message: &str) -> ClientError {
    ApiException::new(400, ErrorCode::Rejected, message).into()
}

#[async_trait]
impl SeatApi for TestSeatApi {
    async fn list_seats(&self) -> Result<Vec<Seat>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.seats.lock().await.clone())
    }

    async fn list_event_seats(&self, _event_id: EventId) -> Result<Vec<Seat>, ClientError> {
        self.list_seats().await
    }

    async fn get_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        self.seats
            .lock()
            .await
            .iter()
            .find(|seat| seat.id == seat_id)
            .cloned()
            .ok_or_else(|| rejected("Assento não encontrado"))
    }

    async fn get_seat_by_number(&self, seat_number: &str) -> Result<Seat, ClientError> {
        self.seats
            .lock()
            .await
            .iter()
            .find(|seat| seat.seat_number == seat_number)
            .cloned()
            .ok_or_else(|| rejected("Assento não encontrado"))
    }

    async fn create_seat(&self, seat_number: &str) -> Result<Seat, ClientError> {
        let mut seats = self.seats.lock().await;
        let seat = Seat::new(
            SeatId(seats.len() as i64 + 1),
            seat_number,
            SeatState::Available,
        );
        seats.push(seat.clone());
        Ok(seat)
    }

    async fn lock_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        if let Some(gate) = &self.lock_gate {
            gate.notified().await;
        }
        let mut seats = self.seats.lock().await;
        let seat = seats
            .iter_mut()
            .find(|seat| seat.id == seat_id)
            .ok_or_else(|| rejected("Assento não encontrado"))?;
        if seat.status() != SeatStatus::Available {
            return Err(rejected(TAKEN));
        }
        seat.state = SeatState::Locked {
            by: self.viewer.clone(),
        };
        Ok(seat.clone())
    }

    async fn confirm_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        if let Some(message) = self.confirm_error.lock().await.clone() {
            return Err(rejected(&message));
        }
        self.set_state(seat_id, SeatState::Booked).await;
        Ok(())
    }

    async fn release_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.release_error.lock().await.clone() {
            return Err(rejected(&message));
        }
        self.set_state(seat_id, SeatState::Available).await;
        Ok(())
    }
}

fn hall() -> Vec<Seat> {
    vec![
        Seat::new(SeatId(1), "B11", SeatState::Available),
        Seat::new(SeatId(2), "B12", SeatState::Available),
        Seat::new(SeatId(3), "C5", SeatState::Available),
        Seat::new(SeatId(4), "C6", SeatState::Booked),
        Seat::new(
            SeatId(5),
            "C7",
            SeatState::Locked {
                by: "bob".to_string(),
            },
        ),
    ]
}

async fn mounted_controller(
    api: Arc<TestSeatApi>,
    settings: Settings,
) -> Arc<ReservationController> {
    let controller = ReservationController::new(api, VIEWER, &settings, SeatScope::All);
    controller.refresh_seats().await.expect("initial refresh");
    controller
}

async fn controller_with_hall() -> (Arc<TestSeatApi>, Arc<ReservationController>) {
    let api = Arc::new(TestSeatApi::new(hall()));
    let controller = mounted_controller(Arc::clone(&api), Settings::default()).await;
    (api, controller)
}

fn assert_lock_holder_invariant(seats: &SeatList) {
    for seat in seats.iter() {
        assert_eq!(
            seat.status() == SeatStatus::Locked,
            seat.locked_by().is_some(),
            "seat {} breaks the lock-holder rule",
            seat.seat_number
        );
    }
}

#[tokio::test(start_paused = true)]
async fn lock_then_confirm_books_the_seat() {
    let (api, controller) = controller_with_hall().await;

    let session = controller.lock(SeatId(3)).await.expect("lock");
    assert_eq!(session.seat_number, "C5");
    assert_eq!(session.time_left, 600);
    let seats = controller.seats().await;
    assert!(seats
        .get(SeatId(3))
        .expect("seat")
        .state
        .is_locked_by(VIEWER));

    controller.confirm().await.expect("confirm");
    assert!(controller.session().await.is_none());
    assert_eq!(
        controller.seats().await.get(SeatId(3)).map(|s| s.status()),
        Some(SeatStatus::Booked)
    );
    assert_eq!(api.status_of(SeatId(3)).await, Some(SeatStatus::Booked));
    assert_lock_holder_invariant(&controller.seats().await);
}

#[tokio::test(start_paused = true)]
async fn confirm_failure_keeps_the_session_and_reports_the_server_text() {
    let (api, controller) = controller_with_hall().await;
    let mut events = controller.subscribe_events();
    controller.lock(SeatId(3)).await.expect("lock");
    *api.confirm_error.lock().await = Some("Bloqueio expirado".to_string());

    let err = controller.confirm().await.expect_err("confirm should fail");
    assert_eq!(err.to_string(), "Bloqueio expirado");
    assert_eq!(
        controller.session().await.map(|s| s.seat_id),
        Some(SeatId(3))
    );

    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let ReservationEvent::ActionFailed { action, message } = event {
            reported = Some((action, message));
        }
    }
    assert_eq!(
        reported,
        Some((SeatAction::Confirm, "Bloqueio expirado".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn lock_rejection_stays_idle_with_verbatim_message() {
    let (api, controller) = controller_with_hall().await;
    // Someone else takes the seat before our click reaches the server.
    api.set_state(
        SeatId(2),
        SeatState::Locked {
            by: "bob".to_string(),
        },
    )
    .await;

    let err = controller.lock(SeatId(2)).await.expect_err("lock should fail");
    assert_eq!(err.to_string(), TAKEN);
    assert!(controller.session().await.is_none());

    // The controller is usable again straight away.
    controller.lock(SeatId(1)).await.expect("second lock");
}

#[tokio::test(start_paused = true)]
async fn second_lock_is_rejected_while_a_session_is_active() {
    let (api, controller) = controller_with_hall().await;
    controller.lock(SeatId(1)).await.expect("lock");

    let err = controller.lock(SeatId(2)).await.expect_err("second lock");
    assert!(matches!(
        err,
        ReservationError::SessionActive { ref seat_number } if seat_number == "B11"
    ));
    assert_eq!(api.status_of(SeatId(2)).await, Some(SeatStatus::Available));
}

#[tokio::test(start_paused = true)]
async fn concurrent_locks_only_send_one_request() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(TestSeatApi::new(hall()).with_lock_gate(Arc::clone(&gate)));
    let controller = mounted_controller(Arc::clone(&api), Settings::default()).await;

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.lock(SeatId(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = controller.lock(SeatId(2)).await.expect_err("in-flight lock");
    assert!(matches!(err, ReservationError::ActionInProgress));

    gate.notify_one();
    first.await.expect("join").expect("first lock");
    assert_eq!(api.status_of(SeatId(2)).await, Some(SeatStatus::Available));
}

#[tokio::test(start_paused = true)]
async fn locking_a_seat_that_is_not_available_locally_is_refused() {
    let (_api, controller) = controller_with_hall().await;
    assert!(matches!(
        controller.lock(SeatId(4)).await,
        Err(ReservationError::SeatUnavailable(ref n)) if n == "C6"
    ));
    assert!(matches!(
        controller.lock(SeatId(99)).await,
        Err(ReservationError::UnknownSeat(SeatId(99)))
    ));
}

#[tokio::test(start_paused = true)]
async fn countdown_ticks_down_and_expires_exactly_once() {
    let api = Arc::new(TestSeatApi::new(hall()));
    let mut settings = Settings::default();
    settings.lock_duration = Duration::from_secs(5);
    let controller = mounted_controller(Arc::clone(&api), settings).await;
    let mut events = controller.subscribe_events();

    controller.lock(SeatId(2)).await.expect("lock");

    let mut ticks = Vec::new();
    let mut expirations = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Ok(ReservationEvent::Tick { time_left, .. })) => ticks.push(time_left),
            Ok(Ok(ReservationEvent::SessionEnded { reason, .. })) => {
                assert_eq!(reason, SessionEndReason::Expired);
                expirations += 1;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => panic!("event channel: {err}"),
            Err(_) => break,
        }
    }

    assert_eq!(ticks, vec![4, 3, 2, 1, 0]);
    assert_eq!(expirations, 1);
    assert!(controller.session().await.is_none());
    assert_eq!(api.release_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn expiry_refreshes_the_seat_list() {
    let api = Arc::new(TestSeatApi::new(hall()));
    let mut settings = Settings::default();
    settings.lock_duration = Duration::from_secs(2);
    let controller = mounted_controller(Arc::clone(&api), settings).await;
    controller.lock(SeatId(2)).await.expect("lock");
    let calls_after_lock = api.list_calls.load(Ordering::SeqCst);

    // The server releases the lock on its own schedule.
    api.set_state(SeatId(2), SeatState::Available).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(controller.session().await.is_none());
    assert!(api.list_calls.load(Ordering::SeqCst) > calls_after_lock);
    assert_eq!(
        controller.seats().await.get(SeatId(2)).map(|s| s.status()),
        Some(SeatStatus::Available)
    );
}

#[tokio::test(start_paused = true)]
async fn booked_delta_for_our_seat_clears_the_session_silently() {
    let (_api, controller) = controller_with_hall().await;
    controller.lock(SeatId(2)).await.expect("lock");
    let mut events = controller.subscribe_events();

    let delta: SeatUpdate = serde_json::from_str(
        r#"{"seatId":2,"seatNumber":"B12","status":"BOOKED","lockedBy":"other-user"}"#,
    )
    .expect("delta");
    controller.apply_feed_update(&delta).await;

    assert!(controller.session().await.is_none());
    let seats = controller.seats().await;
    let seat = seats.get(SeatId(2)).expect("seat");
    assert_eq!(seat.status(), SeatStatus::Booked);
    assert_eq!(seat.locked_by(), None);

    let mut ended = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ReservationEvent::SessionEnded { reason, .. } => ended = Some(reason),
            ReservationEvent::ActionFailed { .. } => panic!("no error should be reported"),
            _ => {}
        }
    }
    assert_eq!(ended, Some(SessionEndReason::Invalidated));
}

#[tokio::test(start_paused = true)]
async fn deltas_for_other_seats_leave_the_session_alone() {
    let (_api, controller) = controller_with_hall().await;
    controller.lock(SeatId(2)).await.expect("lock");

    let delta = SeatUpdate::new(SeatId(1), SeatState::Booked);
    controller.apply_feed_update(&delta).await;
    controller.apply_feed_update(&delta).await;

    assert_eq!(
        controller.session().await.map(|s| s.seat_id),
        Some(SeatId(2))
    );
    assert_eq!(
        controller.seats().await.get(SeatId(1)).map(|s| s.status()),
        Some(SeatStatus::Booked)
    );
    assert_lock_holder_invariant(&controller.seats().await);
}

#[tokio::test(start_paused = true)]
async fn release_failure_respects_the_policy() {
    let (api, strict) = controller_with_hall().await;
    strict.lock(SeatId(1)).await.expect("lock");
    *api.release_error.lock().await = Some("Erro ao libertar".to_string());

    let err = strict.release().await.expect_err("release should fail");
    assert_eq!(err.to_string(), "Erro ao libertar");
    assert!(strict.session().await.is_some());

    let api = Arc::new(TestSeatApi::new(hall()));
    let mut settings = Settings::default();
    settings.release_policy = ReleasePolicy::ClearAlways;
    let lenient = mounted_controller(Arc::clone(&api), settings).await;
    lenient.lock(SeatId(1)).await.expect("lock");
    *api.release_error.lock().await = Some("Erro ao libertar".to_string());

    lenient.release().await.expect_err("release should fail");
    assert!(lenient.session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn release_frees_the_seat() {
    let (api, controller) = controller_with_hall().await;
    controller.lock(SeatId(1)).await.expect("lock");

    controller.release().await.expect("release");

    assert!(controller.session().await.is_none());
    assert_eq!(api.release_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        controller.seats().await.get(SeatId(1)).map(|s| s.status()),
        Some(SeatStatus::Available)
    );
    assert!(matches!(
        controller.confirm().await,
        Err(ReservationError::NoActiveSession)
    ));
}

#[tokio::test(start_paused = true)]
async fn click_dispatches_by_seat_state() {
    let (api, controller) = controller_with_hall().await;

    assert_eq!(
        controller.click(SeatId(4)).await.expect("booked"),
        ClickOutcome::Ignored
    );
    assert_eq!(
        controller.click(SeatId(5)).await.expect("locked by bob"),
        ClickOutcome::Ignored
    );

    let locked = match controller.click(SeatId(3)).await.expect("available") {
        ClickOutcome::Locked(session) => session,
        other => panic!("expected a lock, got {other:?}"),
    };
    let lists_before = api.list_calls.load(Ordering::SeqCst);

    match controller.click(SeatId(3)).await.expect("own seat") {
        ClickOutcome::Reopened(session) => assert_eq!(session.seat_id, locked.seat_id),
        other => panic!("expected reopen, got {other:?}"),
    }
    assert_eq!(api.list_calls.load(Ordering::SeqCst), lists_before);
}

#[tokio::test(start_paused = true)]
async fn click_adopts_a_lock_held_from_elsewhere() {
    let mut seats = hall();
    seats[0].state = SeatState::Locked {
        by: VIEWER.to_string(),
    };
    let api = Arc::new(TestSeatApi::new(seats));
    let controller = mounted_controller(api, Settings::default()).await;
    assert!(controller.session().await.is_none());

    match controller.click(SeatId(1)).await.expect("click") {
        ClickOutcome::Reopened(session) => {
            assert_eq!(session.seat_number, "B11");
            assert_eq!(session.time_left, 600);
        }
        other => panic!("expected adoption, got {other:?}"),
    }
    controller.confirm().await.expect("confirm adopted seat");
}

#[tokio::test(start_paused = true)]
async fn refresh_that_no_longer_shows_our_lock_ends_the_session() {
    let (api, controller) = controller_with_hall().await;
    controller.lock(SeatId(2)).await.expect("lock");

    api.set_state(SeatId(2), SeatState::Available).await;
    controller.handle_refresh_signal(1).await.expect("refresh");

    assert!(controller.session().await.is_none());
}

struct SlowFirstListApi {
    inner: TestSeatApi,
    first_gate: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl SeatApi for SlowFirstListApi {
    async fn list_seats(&self) -> Result<Vec<Seat>, ClientError> {
        let snapshot = self.inner.list_seats().await;
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first_gate.notified().await;
        }
        snapshot
    }

    async fn list_event_seats(&self, event_id: EventId) -> Result<Vec<Seat>, ClientError> {
        self.inner.list_event_seats(event_id).await
    }

    async fn get_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        self.inner.get_seat(seat_id).await
    }

    async fn get_seat_by_number(&self, seat_number: &str) -> Result<Seat, ClientError> {
        self.inner.get_seat_by_number(seat_number).await
    }

    async fn create_seat(&self, seat_number: &str) -> Result<Seat, ClientError> {
        self.inner.create_seat(seat_number).await
    }

    async fn lock_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        self.inner.lock_seat(seat_id).await
    }

    async fn confirm_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        self.inner.confirm_seat(seat_id).await
    }

    async fn release_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        self.inner.release_seat(seat_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn older_seat_list_arriving_late_is_discarded() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(SlowFirstListApi {
        inner: TestSeatApi::new(hall()),
        first_gate: Arc::clone(&gate),
        calls: AtomicUsize::new(0),
    });
    let controller = ReservationController::new(
        Arc::clone(&api) as Arc<dyn SeatApi>,
        VIEWER,
        &Settings::default(),
        SeatScope::All,
    );

    // The first fetch reads the hall, then stalls.
    let slow = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.refresh_seats().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    api.inner.set_state(SeatId(1), SeatState::Booked).await;
    let fresh = controller.refresh_seats().await.expect("fresh refresh");
    assert_eq!(fresh.get(SeatId(1)).map(|s| s.status()), Some(SeatStatus::Booked));

    gate.notify_one();
    let stale = slow.await.expect("join").expect("stale refresh");
    assert_eq!(stale, fresh);
    assert_eq!(
        controller.seats().await.get(SeatId(1)).map(|s| s.status()),
        Some(SeatStatus::Booked)
    );
}

#[tokio::test(start_paused = true)]
async fn unmount_during_lock_discards_the_result() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(TestSeatApi::new(hall()).with_lock_gate(Arc::clone(&gate)));
    let controller = mounted_controller(Arc::clone(&api), Settings::default()).await;
    let mut events = controller.subscribe_events();

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.lock(SeatId(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    controller.unmount().await;
    gate.notify_one();

    let result = pending.await.expect("lock task must not panic");
    assert!(matches!(result, Err(ReservationError::Unmounted)));
    assert!(controller.session().await.is_none());
    assert!(events.try_recv().is_err());
    assert!(matches!(
        controller.refresh_seats().await,
        Err(ReservationError::Unmounted)
    ));
}

#[tokio::test(start_paused = true)]
async fn unmount_stops_the_countdown() {
    let (_api, controller) = controller_with_hall().await;
    controller.lock(SeatId(1)).await.expect("lock");
    let mut events = controller.subscribe_events();

    controller.unmount().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(events.try_recv().is_err());
}

/// Publishes the seat's new state on the feed before answering confirm or
/// release, the order the booking server uses.
struct FeedFirstApi {
    inner: TestSeatApi,
    controller: std::sync::OnceLock<std::sync::Weak<ReservationController>>,
}

impl FeedFirstApi {
    async fn publish(&self, seat_id: SeatId) {
        let Some(controller) = self.controller.get().and_then(std::sync::Weak::upgrade) else {
            return;
        };
        if let Ok(seat) = self.inner.get_seat(seat_id).await {
            controller
                .apply_feed_update(&SeatUpdate::new(seat_id, seat.state))
                .await;
        }
    }
}

#[async_trait]
impl SeatApi for FeedFirstApi {
    async fn list_seats(&self) -> Result<Vec<Seat>, ClientError> {
        self.inner.list_seats().await
    }

    async fn list_event_seats(&self, event_id: EventId) -> Result<Vec<Seat>, ClientError> {
        self.inner.list_event_seats(event_id).await
    }

    async fn get_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        self.inner.get_seat(seat_id).await
    }

    async fn get_seat_by_number(&self, seat_number: &str) -> Result<Seat, ClientError> {
        self.inner.get_seat_by_number(seat_number).await
    }

    async fn create_seat(&self, seat_number: &str) -> Result<Seat, ClientError> {
        self.inner.create_seat(seat_number).await
    }

    async fn lock_seat(&self, seat_id: SeatId) -> Result<Seat, ClientError> {
        self.inner.lock_seat(seat_id).await
    }

    async fn confirm_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        let result = self.inner.confirm_seat(seat_id).await;
        self.publish(seat_id).await;
        result
    }

    async fn release_seat(&self, seat_id: SeatId) -> Result<(), ClientError> {
        let result = self.inner.release_seat(seat_id).await;
        self.publish(seat_id).await;
        result
    }
}

async fn feed_first_controller() -> (Arc<FeedFirstApi>, Arc<ReservationController>) {
    let api = Arc::new(FeedFirstApi {
        inner: TestSeatApi::new(hall()),
        controller: std::sync::OnceLock::new(),
    });
    let controller = ReservationController::new(
        Arc::clone(&api) as Arc<dyn SeatApi>,
        VIEWER,
        &Settings::default(),
        SeatScope::All,
    );
    api.controller
        .set(Arc::downgrade(&controller))
        .expect("controller slot is empty");
    controller.refresh_seats().await.expect("initial refresh");
    (api, controller)
}

fn end_reasons(events: &mut broadcast::Receiver<ReservationEvent>) -> Vec<SessionEndReason> {
    let mut reasons = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ReservationEvent::SessionEnded { reason, .. } = event {
            reasons.push(reason);
        }
    }
    reasons
}

#[tokio::test(start_paused = true)]
async fn confirm_wins_over_its_own_booked_delta() {
    let (_api, controller) = feed_first_controller().await;
    controller.lock(SeatId(3)).await.expect("lock");
    let mut events = controller.subscribe_events();

    controller.confirm().await.expect("confirm");

    assert_eq!(end_reasons(&mut events), vec![SessionEndReason::Confirmed]);
    assert!(controller.session().await.is_none());
    assert_eq!(
        controller.seats().await.get(SeatId(3)).map(|s| s.status()),
        Some(SeatStatus::Booked)
    );
}

#[tokio::test(start_paused = true)]
async fn release_wins_over_its_own_available_delta() {
    let (_api, controller) = feed_first_controller().await;
    controller.lock(SeatId(1)).await.expect("lock");
    let mut events = controller.subscribe_events();

    controller.release().await.expect("release");

    assert_eq!(end_reasons(&mut events), vec![SessionEndReason::Released]);
    assert!(controller.session().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_confirm_after_a_takeover_delta_invalidates_the_session() {
    let (api, controller) = feed_first_controller().await;
    controller.lock(SeatId(2)).await.expect("lock");
    api.inner
        .set_state(
            SeatId(2),
            SeatState::Locked {
                by: "bob".to_string(),
            },
        )
        .await;
    *api.inner.confirm_error.lock().await = Some(TAKEN.to_string());
    let mut events = controller.subscribe_events();

    let err = controller.confirm().await.expect_err("confirm should fail");

    assert_eq!(err.to_string(), TAKEN);
    assert_eq!(end_reasons(&mut events), vec![SessionEndReason::Invalidated]);
    assert!(controller.session().await.is_none());
    assert_eq!(
        controller
            .seats()
            .await
            .get(SeatId(2))
            .and_then(|s| s.locked_by().map(str::to_string)),
        Some("bob".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn takeover_delta_without_a_pending_action_still_invalidates_at_once() {
    let (_api, controller) = feed_first_controller().await;
    controller.lock(SeatId(2)).await.expect("lock");
    let mut events = controller.subscribe_events();

    controller
        .apply_feed_update(&SeatUpdate::new(SeatId(2), SeatState::Available))
        .await;

    assert_eq!(end_reasons(&mut events), vec![SessionEndReason::Invalidated]);
    assert!(matches!(
        controller.confirm().await,
        Err(ReservationError::NoActiveSession)
    ));
}
