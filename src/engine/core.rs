use crate::bridge::TrackingContext;
use crate::engine::{ElapsedUpdate, StartOutcome, TimerEngine, TimerView};
use crate::error::{EngineError, EngineResult, StartRejection};
use crate::ipc::EngineEvent;
use crate::models::{earnings, StoppedTimer, SubTaskInfo, TaskInfo, TimerRecord, WorkSegment};
use std::collections::BTreeMap;
use std::sync::MutexGuard;
use tracing::{debug, error, info, warn};

impl TimerEngine {
    pub(crate) fn lock_timers(&self) -> EngineResult<MutexGuard<'_, BTreeMap<String, TimerRecord>>> {
        self.timers
            .lock()
            .map_err(|e| EngineError::Internal(format!("Mutex poisoned: {}", e)))
    }

    /// Переход: Idle → Running (или Paused → Running, если запись уже есть)
    /// Validation runs first; a rejected start changes nothing.
    pub fn start(&self, task: &TaskInfo, sub_task: &SubTaskInfo) -> EngineResult<StartOutcome> {
        let now = self.clock.now_secs();

        if !task.is_active {
            info!("[TIMER] Start rejected: task {} is deactivated", task.id);
            return Err(StartRejection::Deactivated.into());
        }
        if let Some(schedule) = &sub_task.schedule {
            schedule.check_start(now).map_err(|rejection| {
                info!(
                    "[TIMER] Start rejected for {}: {} (window {})",
                    sub_task.id,
                    rejection,
                    schedule.describe()
                );
                rejection
            })?;
        }

        let existing_paused = {
            let timers = self.lock_timers()?;
            match timers.get(&sub_task.id) {
                Some(record) if !record.is_paused => {
                    debug!("[TIMER] {} already running, start ignored", sub_task.id);
                    return Ok(StartOutcome::AlreadyRunning);
                }
                Some(_) => true,
                None => false,
            }
        };
        if existing_paused {
            self.resume(&sub_task.id)?;
            return Ok(StartOutcome::Resumed);
        }

        // Store read happens outside the timers lock
        let seeded = self.seed_accumulated(&sub_task.id, sub_task.tracked_seconds);
        let record = TimerRecord {
            sub_task_id: sub_task.id.clone(),
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            sub_task_title: sub_task.title.clone(),
            started_at: now,
            accumulated_seconds: seeded,
            is_paused: false,
            hourly_rate: sub_task.hourly_rate,
            screenshot_interval_seconds: sub_task
                .screenshot_interval_secs
                .filter(|s| *s > 0)
                .unwrap_or(self.default_screenshot_interval),
            monitoring_mode: sub_task.monitoring_mode,
            last_screenshot_elapsed: seeded,
            screenshot_enabled: sub_task.screenshot_enabled,
            activity_enabled: sub_task.activity_enabled,
            elapsed_seconds: seeded,
        };
        let context = TrackingContext {
            task_id: record.task_id.clone(),
            sub_task_id: record.sub_task_id.clone(),
            task_title: record.task_title.clone(),
            sub_task_title: record.sub_task_title.clone(),
            monitoring_mode: record.monitoring_mode,
        };

        {
            let mut timers = self.lock_timers()?;
            if timers.contains_key(&sub_task.id) {
                // Lost a race with a concurrent start of the same sub-task
                return Ok(StartOutcome::AlreadyRunning);
            }
            timers.insert(sub_task.id.clone(), record);
        }

        info!(
            "[TIMER] Started {} ({} / {}), seeded {}s",
            sub_task.id, task.title, sub_task.title, seeded
        );
        self.bridge.notify_tracking_started(&context);
        self.events.emit(EngineEvent::TimerStarted {
            sub_task_id: sub_task.id.clone(),
        });
        Ok(StartOutcome::Started)
    }

    /// Fold the live segment of a running record. Returns (segment, new total).
    fn fold_segment(record: &TimerRecord, now: u64) -> (WorkSegment, u64) {
        let duration = now.saturating_sub(record.started_at);
        let new_total = record
            .accumulated_seconds
            .saturating_add(duration)
            .max(record.elapsed_seconds);
        let segment = WorkSegment {
            task_id: record.task_id.clone(),
            sub_task_id: record.sub_task_id.clone(),
            started_at: record.started_at,
            ended_at: now,
            duration_seconds: duration,
            total_seconds: new_total,
            earnings: record.hourly_rate.map(|rate| earnings(new_total, rate)),
        };
        (segment, new_total)
    }

    /// Переход: Running → Paused
    /// `None` if the timer is absent or already paused.
    /// CRITICAL: новый total сначала сохраняется, и только потом применяется в памяти.
    pub fn pause(&self, sub_task_id: &str) -> EngineResult<Option<WorkSegment>> {
        let now = self.clock.now_secs();
        let mut timers = self.lock_timers()?;

        let (segment, new_total) = match timers.get(sub_task_id) {
            Some(record) if !record.is_paused => Self::fold_segment(record, now),
            _ => return Ok(None),
        };

        let task_id = segment.task_id.clone();
        self.persist_total(&task_id, sub_task_id, new_total, now)
            .map_err(|e| {
                error!("[TIMER] Failed to save total after pause: {}", e);
                e
            })?;

        if let Some(record) = timers.get_mut(sub_task_id) {
            record.accumulated_seconds = new_total;
            record.elapsed_seconds = new_total;
            record.is_paused = true;
        }
        drop(timers);

        info!("[TIMER] Paused {} at {}s", sub_task_id, new_total);
        self.events.emit(EngineEvent::TimerPaused {
            sub_task_id: sub_task_id.to_string(),
            elapsed_seconds: new_total,
        });
        Ok(Some(segment))
    }

    /// Переход: Paused → Running
    /// Only `started_at` moves; the accumulated total is never touched.
    pub fn resume(&self, sub_task_id: &str) -> EngineResult<bool> {
        let now = self.clock.now_secs();
        {
            let mut timers = self.lock_timers()?;
            match timers.get_mut(sub_task_id) {
                Some(record) if record.is_paused => {
                    record.is_paused = false;
                    record.started_at = now;
                }
                _ => return Ok(false),
            }
        }
        info!("[TIMER] Resumed {}", sub_task_id);
        self.events.emit(EngineEvent::TimerResumed {
            sub_task_id: sub_task_id.to_string(),
        });
        Ok(true)
    }

    /// Переход: Running/Paused → Stopped (запись удаляется)
    /// Stopping an absent timer is a no-op.
    pub fn stop(&self, sub_task_id: &str) -> EngineResult<Option<StoppedTimer>> {
        let now = self.clock.now_secs();
        let mut timers = self.lock_timers()?;

        let (segment, final_total, task_id, rate) = match timers.get(sub_task_id) {
            None => return Ok(None),
            Some(record) if record.is_paused => (
                None,
                record.accumulated_seconds,
                record.task_id.clone(),
                record.hourly_rate,
            ),
            Some(record) => {
                let (segment, total) = Self::fold_segment(record, now);
                (Some(segment), total, record.task_id.clone(), record.hourly_rate)
            }
        };

        self.persist_total(&task_id, sub_task_id, final_total, now)
            .map_err(|e| {
                error!("[TIMER] Failed to save total after stop: {}", e);
                e
            })?;

        timers.remove(sub_task_id);
        let last_one = timers.is_empty();
        drop(timers);

        info!("[TIMER] Stopped {} at {}s", sub_task_id, final_total);
        self.events.emit(EngineEvent::TimerStopped {
            sub_task_id: sub_task_id.to_string(),
            elapsed_seconds: final_total,
        });
        if last_one {
            self.bridge.notify_tracking_stopped();
            self.events.emit(EngineEvent::TrackingStopped);
        }

        Ok(Some(StoppedTimer {
            sub_task_id: sub_task_id.to_string(),
            task_id,
            elapsed_seconds: final_total,
            earnings: rate.map(|r| earnings(final_total, r)),
            segment,
        }))
    }

    /// Остановить все таймеры (logout, «завершить день»)
    /// A timer whose total cannot be saved stays in memory; the rest are still stopped.
    pub fn stop_all(&self) -> EngineResult<Vec<StoppedTimer>> {
        let ids: Vec<String> = self.lock_timers()?.keys().cloned().collect();
        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            match self.stop(&id) {
                Ok(Some(s)) => stopped.push(s),
                Ok(None) => {}
                Err(e) => warn!("[TIMER] stop_all: failed to stop {}: {}", id, e),
            }
        }
        Ok(stopped)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().map(|t| t.is_empty()).unwrap_or(true)
    }

    pub fn get(&self, sub_task_id: &str) -> Option<TimerRecord> {
        self.timers
            .lock()
            .ok()
            .and_then(|t| t.get(sub_task_id).cloned())
    }

    /// Текущее время таймера (с учётом живого сегмента)
    pub fn elapsed(&self, sub_task_id: &str) -> Option<u64> {
        let now = self.clock.now_secs();
        self.get(sub_task_id)
            .map(|r| r.elapsed_at(now).max(r.elapsed_seconds))
    }

    pub fn records(&self) -> EngineResult<Vec<TimerRecord>> {
        Ok(self.lock_timers()?.values().cloned().collect())
    }

    pub fn snapshot(&self) -> EngineResult<Vec<TimerView>> {
        let now = self.clock.now_secs();
        let timers = self.lock_timers()?;
        Ok(timers
            .values()
            .map(|r| {
                let elapsed = r.elapsed_at(now).max(r.elapsed_seconds);
                TimerView {
                    sub_task_id: r.sub_task_id.clone(),
                    task_id: r.task_id.clone(),
                    task_title: r.task_title.clone(),
                    sub_task_title: r.sub_task_title.clone(),
                    is_paused: r.is_paused,
                    elapsed_seconds: elapsed,
                    earnings: r.hourly_rate.map(|rate| earnings(elapsed, rate)),
                    monitoring_mode: r.monitoring_mode,
                }
            })
            .collect())
    }

    /// Recompute elapsed for every running record. Published values never go down.
    pub(crate) fn refresh_elapsed(&self, now: u64) -> EngineResult<ElapsedUpdate> {
        let mut timers = self.lock_timers()?;
        let mut changed = false;
        let mut total: u64 = 0;
        for record in timers.values_mut() {
            if !record.is_paused {
                let computed = record.elapsed_at(now).max(record.elapsed_seconds);
                if computed != record.elapsed_seconds {
                    record.elapsed_seconds = computed;
                    changed = true;
                }
            }
            total = total.saturating_add(record.elapsed_seconds);
        }
        Ok(ElapsedUpdate {
            changed,
            total_seconds: total,
        })
    }

    /// Records due for evidence. `last_screenshot_elapsed` is advanced here, before any
    /// capture starts, so a slow capture cannot trigger the same timer twice.
    pub(crate) fn take_due_captures(&self) -> EngineResult<Vec<TimerRecord>> {
        let mut timers = self.lock_timers()?;
        let mut due = Vec::new();
        for record in timers.values_mut() {
            if record.is_paused || !record.screenshot_enabled {
                continue;
            }
            if record.elapsed_seconds.saturating_sub(record.last_screenshot_elapsed)
                >= record.screenshot_interval_seconds
            {
                record.last_screenshot_elapsed = record.elapsed_seconds;
                due.push(record.clone());
            }
        }
        Ok(due)
    }

    /// Running (unpaused) records.
    pub(crate) fn running(&self) -> EngineResult<Vec<TimerRecord>> {
        Ok(self
            .lock_timers()?
            .values()
            .filter(|r| !r.is_paused)
            .cloned()
            .collect())
    }

    pub(crate) fn any_activity_enabled(&self) -> bool {
        self.timers
            .lock()
            .map(|t| t.values().any(|r| r.activity_enabled))
            .unwrap_or(false)
    }
}
