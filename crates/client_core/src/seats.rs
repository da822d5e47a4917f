use std::sync::Arc;

use shared::{
    domain::{Seat, SeatId, SeatStatus},
    protocol::SeatUpdate,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatList {
    seats: Arc<[Seat]>,
}

impl Default for SeatList {
    fn default() -> Self {
        SeatList::new(Vec::new())
    }
}

impl SeatList {
    pub fn new(seats: Vec<Seat>) -> Self {
        Self {
            seats: seats.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seat> {
        self.seats.iter()
    }

    pub fn get(&self, seat_id: SeatId) -> Option<&Seat> {
        self.seats.iter().find(|seat| seat.id == seat_id)
    }

    pub fn find_by_number(&self, seat_number: &str) -> Option<&Seat> {
        self.seats
            .iter()
            .find(|seat| seat.seat_number.eq_ignore_ascii_case(seat_number))
    }

    pub fn count(&self, status: SeatStatus) -> usize {
        self.seats
            .iter()
            .filter(|seat| seat.status() == status)
            .count()
    }

    // Seats not in the list are left alone.
    pub fn with_update(&self, update: &SeatUpdate) -> SeatList {
        if self.get(update.seat_id).is_none() {
            return self.clone();
        }
        let seats = self
            .seats
            .iter()
            .map(|seat| {
                if seat.id == update.seat_id {
                    Seat {
                        id: seat.id,
                        seat_number: seat.seat_number.clone(),
                        state: update.state.clone(),
                    }
                } else {
                    seat.clone()
                }
            })
            .collect::<Vec<_>>();
        SeatList::new(seats)
    }

    pub fn with_seat(&self, replacement: &Seat) -> SeatList {
        let mut seats = self.seats.to_vec();
        match seats.iter_mut().find(|seat| seat.id == replacement.id) {
            Some(slot) => *slot = replacement.clone(),
            None => seats.push(replacement.clone()),
        }
        SeatList::new(seats)
    }
}

impl FromIterator<Seat> for SeatList {
    fn from_iter<T: IntoIterator<Item = Seat>>(iter: T) -> Self {
        SeatList::new(iter.into_iter().collect())
    }
}
