//! Per-second tick: elapsed accounting plus heartbeat, activity and capture cadences.

use crate::api::{Heartbeat, RemoteApi};
use crate::bridge::HostBridge;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::engine::TimerEngine;
use crate::evidence::{CaptureReport, EvidencePipeline};
use crate::health::ApiHealth;
use crate::ipc::{EngineEvent, EventBus};
use crate::models::{ActivitySummary, QueueKind, TimerRecord};
use crate::network::Connectivity;
use crate::queue::LocalQueue;
use crate::sync::{DrainReport, SyncError, SyncOrchestrator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// What one tick did. Handles let tests await the detached work; the live loop drops them.
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub total_seconds: Option<u64>,
    pub elapsed_changed: bool,
    pub heartbeat: Option<JoinHandle<()>>,
    pub activity_flushed: usize,
    pub drain: Option<JoinHandle<Result<DrainReport, SyncError>>>,
    pub capture: Option<JoinHandle<CaptureReport>>,
}

pub struct Scheduler {
    tick_count: AtomicU64,
    activity_window_start: AtomicU64,
    heartbeat_every: u64,
    activity_every: u64,
    tick_wrap: u64,
    timers: Arc<TimerEngine>,
    evidence: Arc<EvidencePipeline>,
    orchestrator: Arc<SyncOrchestrator>,
    queue: Arc<LocalQueue>,
    api: Arc<dyn RemoteApi>,
    health: Arc<ApiHealth>,
    bridge: Arc<dyn HostBridge>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        timers: Arc<TimerEngine>,
        evidence: Arc<EvidencePipeline>,
        orchestrator: Arc<SyncOrchestrator>,
        queue: Arc<LocalQueue>,
        api: Arc<dyn RemoteApi>,
        health: Arc<ApiHealth>,
        bridge: Arc<dyn HostBridge>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let now = clock.now_secs();
        Self {
            tick_count: AtomicU64::new(0),
            activity_window_start: AtomicU64::new(now),
            heartbeat_every: config.heartbeat_every_ticks.max(1),
            activity_every: config.activity_flush_every_ticks.max(1),
            tick_wrap: config.tick_wrap.max(1),
            timers,
            evidence,
            orchestrator,
            queue,
            api,
            health,
            bridge,
            connectivity,
            clock,
            events,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    fn next_tick(&self) -> u64 {
        let next = (self.tick_count.load(Ordering::Acquire) + 1) % self.tick_wrap;
        self.tick_count.store(next, Ordering::Release);
        next
    }

    /// One scheduler step. Never waits on network or capture I/O.
    pub fn tick(&self) -> TickReport {
        let tick = self.next_tick();
        // Fast path: no timers, no allocation
        if self.timers.is_empty() {
            return TickReport {
                tick,
                ..Default::default()
            };
        }

        let now = self.clock.now_secs();
        let mut report = TickReport {
            tick,
            ..Default::default()
        };

        // 1. elapsed first, cadences after
        match self.timers.refresh_elapsed(now) {
            Ok(update) => {
                report.total_seconds = Some(update.total_seconds);
                report.elapsed_changed = update.changed;
                self.bridge.notify_tick(update.total_seconds);
                if update.changed {
                    self.events.emit(EngineEvent::TimersUpdated {
                        total_seconds: update.total_seconds,
                    });
                }
            }
            Err(e) => {
                error!("[TICK] Failed to refresh elapsed: {}", e);
                return report;
            }
        }

        // 2. heartbeat
        if tick % self.heartbeat_every == 0 {
            if self.connectivity.is_online() && self.health.healthy() {
                report.heartbeat = self.spawn_heartbeats();
            } else {
                self.health.ensure_probe();
            }
        }

        // 3. activity summaries
        if tick % self.activity_every == 0
            && self.health.healthy()
            && self.timers.any_activity_enabled()
        {
            report.activity_flushed = self.flush_activity(now);
            if report.activity_flushed > 0 {
                let orchestrator = Arc::clone(&self.orchestrator);
                report.drain = Some(tokio::spawn(async move { orchestrator.drain().await }));
            }
        }

        // 4. evidence; a busy pipeline means this tick neither marks nor captures
        if !self.evidence.is_busy() {
            match self.timers.take_due_captures() {
                Ok(due) => report.capture = self.evidence.dispatch(due),
                Err(e) => error!("[TICK] Failed to collect due captures: {}", e),
            }
        }

        report
    }

    fn spawn_heartbeats(&self) -> Option<JoinHandle<()>> {
        let running = match self.timers.running() {
            Ok(running) if !running.is_empty() => running,
            Ok(_) => return None,
            Err(e) => {
                error!("[TICK] Failed to read timers for heartbeat: {}", e);
                return None;
            }
        };
        let current_app = self.bridge.active_app_name();
        let api = Arc::clone(&self.api);
        let health = Arc::clone(&self.health);
        let evidence = Arc::clone(&self.evidence);

        Some(tokio::spawn(async move {
            let mut capture_now: Vec<TimerRecord> = Vec::new();
            for record in running {
                let heartbeat = Heartbeat {
                    task_id: record.task_id.clone(),
                    sub_task_id: record.sub_task_id.clone(),
                    elapsed_seconds: record.elapsed_seconds,
                    current_app: current_app.clone(),
                };
                match api.heartbeat(&heartbeat).await {
                    Ok(reply) => {
                        health.record_success();
                        if reply.capture_now {
                            debug!("[TICK] Server requested capture for {}", record.sub_task_id);
                            capture_now.push(record);
                        }
                    }
                    Err(e) => {
                        warn!("[TICK] Heartbeat failed: {}", e);
                        health.record_failure();
                        break;
                    }
                }
            }
            if let Some(handle) = evidence.dispatch(capture_now) {
                if let Err(e) = handle.await {
                    error!("[TICK] On-demand capture task failed: {}", e);
                }
            }
        }))
    }

    /// Counters are read once and reset; every running timer with activity logging gets the
    /// same window.
    fn flush_activity(&self, now: u64) -> usize {
        let window_start = self.activity_window_start.swap(now, Ordering::AcqRel);
        let counters = self.bridge.activity_counters();
        self.bridge.reset_activity_counters();

        let running = match self.timers.running() {
            Ok(running) => running,
            Err(e) => {
                error!("[TICK] Failed to read timers for activity flush: {}", e);
                return 0;
            }
        };

        let mut flushed = 0;
        for record in running.iter().filter(|r| r.activity_enabled) {
            let summary = ActivitySummary {
                task_id: record.task_id.clone(),
                sub_task_id: record.sub_task_id.clone(),
                window_start,
                window_end: now,
                counters,
            };
            match self.queue.enqueue(QueueKind::Activity, &summary) {
                Ok(_) => flushed += 1,
                Err(e) => error!("[TICK] Failed to queue activity summary: {}", e.user_message()),
            }
        }
        debug!("[TICK] Flushed {} activity summaries", flushed);
        flushed
    }
}
