use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-facility feed of committed events. Slow receivers lag and skip.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, facility_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(facility_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op without subscribers. Channels whose receivers are all gone are dropped.
    pub fn send(&self, facility_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&facility_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.channels
                .remove_if(&facility_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperatingHours;

    fn created(id: Ulid) -> Event {
        Event::FacilityCreated {
            id,
            name: None,
            slot_minutes: 15,
            auto_confirm: false,
            hours: OperatingHours::default(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_facility_events() {
        let hub = NotifyHub::new();
        let fid = Ulid::new();
        let mut rx = hub.subscribe(fid);
        hub.send(fid, &created(fid));
        assert_eq!(rx.recv().await.unwrap(), created(fid));
    }

    #[tokio::test]
    async fn other_facilities_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(mine);
        hub.send(other, &created(other));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let fid = Ulid::new();
        hub.send(fid, &created(fid));
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn dropped_receivers_release_channel() {
        let hub = NotifyHub::new();
        let fid = Ulid::new();
        drop(hub.subscribe(fid));
        assert_eq!(hub.channel_count(), 1);
        hub.send(fid, &created(fid));
        assert_eq!(hub.channel_count(), 0);
    }
}
