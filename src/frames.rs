//! Sender-side frame timestamp table and the ticker that fills it.

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::protocol::FrameStamp;
use crate::shutdown::Shutdown;

/// Frame id → capture time, bounded; the oldest ids are evicted first.
#[derive(Debug)]
pub struct FrameTimestampTable {
    entries: BTreeMap<u64, DateTime<Local>>,
    capacity: usize,
}

impl FrameTimestampTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, frame_id: u64, captured_at: DateTime<Local>) {
        self.entries.insert(frame_id, captured_at);
        while self.entries.len() > self.capacity {
            self.entries.pop_first();
        }
    }

    pub fn get(&self, frame_id: u64) -> Option<FrameStamp> {
        self.entries.get(&frame_id).map(|t| FrameStamp::new(frame_id, *t))
    }

    pub fn latest(&self) -> Option<FrameStamp> {
        self.entries
            .last_key_value()
            .map(|(id, t)| FrameStamp::new(*id, *t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedFrameTable = Arc<Mutex<FrameTimestampTable>>;

pub fn shared(capacity: usize) -> SharedFrameTable {
    Arc::new(Mutex::new(FrameTimestampTable::new(capacity)))
}

/// Stamps a new, monotonically increasing frame id at the capture rate.
pub async fn run_frame_ticker(table: SharedFrameTable, fps: u32, mut shutdown: Shutdown) {
    let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = interval.tick() => {
                frame_id += 1;
                match table.lock() {
                    Ok(mut t) => t.insert(frame_id, Local::now()),
                    Err(_) => {
                        log::error!("Frame table lock poisoned, stopping frame ticker");
                        break;
                    }
                }
            }
        }
    }
    log::info!("Frame ticker stopped after {} frames", frame_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut table = FrameTimestampTable::new(100);
        let now = Local::now();
        for id in 1..=150 {
            table.insert(id, now);
        }
        assert_eq!(table.len(), 100);
        assert!(table.get(50).is_none());
        assert!(table.get(51).is_some());
        assert_eq!(table.latest().unwrap().frame_id, 150);
    }

    #[test]
    fn empty_table_has_no_latest() {
        let table = FrameTimestampTable::new(10);
        assert!(table.is_empty());
        assert!(table.latest().is_none());
        assert!(table.get(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_produces_increasing_ids() {
        let table = shared(100);
        let (trigger, stop) = shutdown::channel();
        let task = tokio::spawn(run_frame_ticker(table.clone(), 30, stop));
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.trigger();
        task.await.unwrap();

        let t = table.lock().unwrap();
        let latest = t.latest().unwrap();
        assert!(latest.frame_id >= 14, "only {} frames", latest.frame_id);
        assert_eq!(t.len() as u64, latest.frame_id);
    }
}
