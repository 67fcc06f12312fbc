//! Event fanout to protocol handlers and other subscribers.
//!
//! Subscribers register a channel along with a mask of the events they care
//! about. Emitters fire a mask; every subscriber whose registration overlaps
//! gets one message with the overlapping bits. Coalescing of scan-driven
//! events happens in the library worker, not here.

use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};

use strum::{Display, EnumIter};

/// One catalog event. The discriminants are bit positions so masks can be
/// OR-ed together.
#[derive(Debug, Display, EnumIter, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Event {
    Database = 1 << 0,
    Update = 1 << 1,
    Queue = 1 << 2,
    Rating = 1 << 3,
    Pairing = 1 << 4,
    Spotify = 1 << 5,
}

impl Event {
    pub const ALL: u16 = 0x3f;

    pub fn bit(self) -> u16 {
        self as u16
    }
}

struct Subscriber {
    mask: u16,
    tx: mpsc::Sender<u16>,
}

fn registry() -> &'static Mutex<Vec<Subscriber>> {
    static REGISTRY: OnceLock<Mutex<Vec<Subscriber>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a subscriber for the events in `mask`. Returns the receiving end.
pub fn subscribe(mask: u16) -> mpsc::Receiver<u16> {
    let (tx, rx) = mpsc::channel();
    registry().lock().unwrap().push(Subscriber { mask, tx });
    rx
}

/// Notify all subscribers whose mask overlaps `mask`. Subscribers whose
/// receiver is gone are dropped from the registry.
pub fn notify(mask: u16) {
    let mut subscribers = registry().lock().unwrap();
    subscribers.retain(|s| {
        if s.mask & mask == 0 {
            return true;
        }
        s.tx.send(s.mask & mask).is_ok()
    });
}

pub fn notify_event(event: Event) {
    notify(event.bit());
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn masked_delivery() {
        let rx = subscribe(Event::Queue.bit() | Event::Rating.bit());

        notify(Event::Database.bit());
        assert!(rx.try_recv().is_err());

        notify(Event::Queue.bit() | Event::Update.bit());
        assert_eq!(rx.try_recv().unwrap(), Event::Queue.bit());
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let rx = subscribe(Event::Pairing.bit());
        drop(rx);
        // must not panic or error
        notify_event(Event::Pairing);
    }
}
