//! Wall-clock settlement slots and the background loop that fires them.

use crate::core::settlement::SettlementEngine;
use chrono::{DateTime, Days, Local, NaiveDateTime, NaiveTime, TimeDelta};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How far past a slot a manual trigger still carries that slot's label.
const SLOT_LABEL_GRACE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub time: NaiveTime,
    /// Whether firing this slot rolls the day's profit into lifetime earnings.
    pub rollup: bool,
}

impl Slot {
    pub fn label(&self) -> String {
        self.time.format("%H:%M").to_string()
    }
}

/// Ordered, non-empty list of daily settlement slots.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    #[cfg(test)]
    fn new(mut slots: Vec<Slot>) -> anyhow::Result<Self> {
        if slots.is_empty() {
            anyhow::bail!("Slot table must contain at least one slot");
        }
        slots.sort_by_key(|s| s.time);
        slots.dedup_by_key(|s| s.time);
        Ok(Self { slots })
    }

    /// Every half hour from 18:00 through 23:30, then the 23:50 rollup slot.
    pub fn standard() -> Self {
        let mut slots: Vec<Slot> = (18..=23)
            .flat_map(|hour| [0, 30].map(|minute| (hour, minute)))
            .filter_map(|(hour, minute)| NaiveTime::from_hms_opt(hour, minute, 0))
            .map(|time| Slot {
                time,
                rollup: false,
            })
            .collect();
        slots.extend(NaiveTime::from_hms_opt(23, 50, 0).map(|time| Slot { time, rollup: true }));
        Self { slots }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// The first slot strictly after `now`, wrapping to tomorrow's first slot.
    pub fn next_after(&self, now: NaiveDateTime) -> (NaiveDateTime, Slot) {
        let today = now.date();
        if let Some(slot) = self.slots.iter().find(|s| today.and_time(s.time) > now) {
            return (today.and_time(slot.time), *slot);
        }
        let first = self.slots[0];
        ((today + Days::new(1)).and_time(first.time), first)
    }

    /// Label for an out-of-band run at `now`: the slot at the current minute,
    /// else a slot passed within the last five minutes, else `HH:MM`.
    pub fn label_for(&self, now: NaiveDateTime) -> String {
        let minute = now.time().format("%H:%M").to_string();
        if let Some(slot) = self.slots.iter().find(|s| s.label() == minute) {
            return slot.label();
        }
        let grace = TimeDelta::seconds(SLOT_LABEL_GRACE_SECS);
        self.slots
            .iter()
            .find(|s| {
                let elapsed = now - now.date().and_time(s.time);
                elapsed >= TimeDelta::zero() && elapsed <= grace
            })
            .map(Slot::label)
            .unwrap_or(minute)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Idle,
    Waiting { next: NaiveDateTime, slot: String },
    Firing { slot: String },
    Stopped,
}

/// Source of the current wall-clock time.
type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Fires [`SettlementEngine::settle_at`] at every slot of a [`SlotTable`]
/// until shut down.
pub struct Scheduler {
    engine: Arc<SettlementEngine>,
    slots: SlotTable,
    max_sleep: Duration,
    clock: Clock,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(engine: Arc<SettlementEngine>, max_sleep: Duration) -> Self {
        let slots = engine.slots().clone();
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            engine,
            slots,
            max_sleep: max_sleep.max(Duration::from_secs(1)),
            clock: Arc::new(Local::now),
            state,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> DateTime<Local> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` is cancelled. A settlement already in progress
    /// is always allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(slots = self.slots.slots().len(), "Settlement scheduler started");
        loop {
            let now = (self.clock)().naive_local();
            let (fire_at, slot) = self.slots.next_after(now);
            let label = slot.label();
            debug!(next = %fire_at, slot = %label, "Waiting for next settlement slot");
            self.state.send_replace(SchedulerState::Waiting {
                next: fire_at,
                slot: label.clone(),
            });

            if !self.sleep_until(fire_at, &shutdown).await {
                break;
            }

            self.state.send_replace(SchedulerState::Firing {
                slot: label.clone(),
            });
            match self.engine.settle_at(&label, slot.rollup, (self.clock)()).await {
                Ok(run) => info!(
                    slot = %label,
                    count = run.count,
                    skipped = run.skipped,
                    rollup = slot.rollup,
                    "Scheduled settlement finished"
                ),
                Err(e) => error!(slot = %label, error = %e, "Scheduled settlement failed"),
            }

            if shutdown.is_cancelled() {
                break;
            }
        }
        self.state.send_replace(SchedulerState::Stopped);
        info!("Settlement scheduler stopped");
    }

    /// Sleeps in bounded chunks, re-reading the clock after each one. Returns
    /// `false` when shutdown was requested first.
    async fn sleep_until(&self, fire_at: NaiveDateTime, shutdown: &CancellationToken) -> bool {
        loop {
            let remaining = fire_at - (self.clock)().naive_local();
            let Ok(remaining) = remaining.to_std() else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(remaining.min(self.max_sleep)) => {}
            }
        }
    }
}
