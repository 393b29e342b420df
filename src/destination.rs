//! A named group of units that currently serve a role. Round-robin picks
//! an arbitrary member when no specific unit is requested.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use protocol::Value;

use crate::correlation::ResponseOutcome;
use crate::error::SendError;
use crate::stream::{StreamReader, StreamWriter};
use crate::unit::Unit;

pub type ArrivalHandler = Box<dyn Fn(&Arc<Unit>) + Send + Sync>;
pub type DepartureHandler = Box<dyn Fn() + Send + Sync>;

/// Aggregates every currently-attached unit serving a role by this name.
pub struct Destination {
    pub name: String,
    units: RwLock<Vec<Arc<Unit>>>,
    index: AtomicUsize,
    ready: AtomicBool,
    arrival_handlers: std::sync::Mutex<Vec<ArrivalHandler>>,
    departure_handlers: std::sync::Mutex<Vec<DepartureHandler>>,
}

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: RwLock::new(Vec::new()),
            index: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            arrival_handlers: std::sync::Mutex::new(Vec::new()),
            departure_handlers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.read().unwrap().clone()
    }

    pub fn on_unit_arrival(&self, handler: ArrivalHandler) {
        self.arrival_handlers.lock().unwrap().push(handler);
    }

    pub fn on_last_unit_left(&self, handler: DepartureHandler) {
        self.departure_handlers.lock().unwrap().push(handler);
    }

    /// Adds `unit` if it is not already a member. Fires arrival handlers.
    pub fn add_unit(&self, unit: Arc<Unit>) {
        let mut units = self.units.write().unwrap();
        if units.iter().any(|u| u.id == unit.id) {
            return;
        }
        units.push(unit.clone());
        self.ready.store(true, Ordering::Release);
        drop(units);
        for handler in self.arrival_handlers.lock().unwrap().iter() {
            handler(&unit);
        }
    }

    /// Removes the member matching `unit_id`. Fires the last-unit-left
    /// handlers if this emptied the destination.
    pub fn remove_unit(&self, unit_id: &str) {
        let now_empty = {
            let mut units = self.units.write().unwrap();
            units.retain(|u| u.id != unit_id);
            units.is_empty()
        };
        if now_empty {
            self.ready.store(false, Ordering::Release);
            for handler in self.departure_handlers.lock().unwrap().iter() {
                handler();
            }
        }
    }

    /// Picks the next unit in round-robin order. The index always
    /// advances, even when the set is empty — an intentional quirk: a
    /// racing `add_unit` right after an empty check does not retroactively
    /// align the index with the newcomer.
    pub fn next_unit(&self) -> Result<Arc<Unit>, SendError> {
        let units = self.units.read().unwrap();
        let i = self.index.fetch_add(1, Ordering::AcqRel);
        if units.is_empty() {
            return Err(SendError::NoUnitsForRole(self.name.clone()));
        }
        Ok(units[i % units.len()].clone())
    }

    fn resolve_unit(&self, explicit: Option<Arc<Unit>>) -> Result<Arc<Unit>, SendError> {
        match explicit {
            Some(u) => Ok(u),
            None => self.next_unit(),
        }
    }

    pub async fn send(&self, unit: Option<Arc<Unit>>, event: &str, value: Value) -> Result<(), SendError> {
        self.resolve_unit(unit)?.send(&self.name, event, value).await
    }

    pub async fn request(
        &self,
        unit: Option<Arc<Unit>>,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
        ignore_unit_close: bool,
    ) -> Result<ResponseOutcome, SendError> {
        self.resolve_unit(unit)?
            .request(&self.name, event, value, timeout, ignore_unit_close)
            .await
    }

    pub async fn new_reader(
        &self,
        unit: Option<Arc<Unit>>,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<(ResponseOutcome, Option<StreamReader>), SendError> {
        self.resolve_unit(unit)?.new_reader(&self.name, event, value, timeout).await
    }

    pub async fn new_writer(
        &self,
        unit: Option<Arc<Unit>>,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<(ResponseOutcome, Option<StreamWriter>), SendError> {
        self.resolve_unit(unit)?.new_writer(&self.name, event, value, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fake_unit(id: &str) -> Arc<Unit> {
        Unit::new_detached(id.to_owned())
    }

    #[test]
    fn round_robin_advances_index_unconditionally() {
        let dest = Destination::new("worker");
        assert!(matches!(dest.next_unit(), Err(SendError::NoUnitsForRole(_))));
        dest.add_unit(fake_unit("a"));
        dest.add_unit(fake_unit("b"));
        let first = dest.next_unit().unwrap().id.clone();
        let second = dest.next_unit().unwrap().id.clone();
        assert_ne!(first, second);
        let third = dest.next_unit().unwrap().id.clone();
        assert_eq!(first, third);
    }

    #[test]
    fn ready_flag_tracks_membership() {
        let dest = Destination::new("worker");
        assert!(!dest.is_ready());
        dest.add_unit(fake_unit("a"));
        assert!(dest.is_ready());
        dest.remove_unit("a");
        assert!(!dest.is_ready());
    }

    #[test]
    fn arrival_and_departure_handlers_fire() {
        let dest = Destination::new("worker");
        let arrivals = Arc::new(AtomicU32::new(0));
        let departures = Arc::new(AtomicU32::new(0));
        let a = arrivals.clone();
        dest.on_unit_arrival(Box::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }));
        let d = departures.clone();
        dest.on_last_unit_left(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));
        dest.add_unit(fake_unit("a"));
        assert_eq!(arrivals.load(Ordering::SeqCst), 1);
        dest.remove_unit("a");
        assert_eq!(departures.load(Ordering::SeqCst), 1);
    }
}
