use crate::engine::TimerEngine;
use crate::error::EngineResult;
use tracing::{error, warn};

impl TimerEngine {
    /// Начальное накопленное время: max(локально сохранённое, серверное).
    /// GUARD: НИКОГДА не падать на ошибке чтения, используем серверное значение.
    pub(crate) fn seed_accumulated(&self, sub_task_id: &str, server_tracked: u64) -> u64 {
        match self.store.load_tracked(sub_task_id) {
            Ok(Some(local)) => {
                if local != server_tracked {
                    warn!(
                        "[TIMER] Local total {}s differs from server {}s for {}, using max",
                        local, server_tracked, sub_task_id
                    );
                }
                local.max(server_tracked)
            }
            Ok(None) => server_tracked,
            Err(e) => {
                error!(
                    "[TIMER] Failed to load tracked total for {}: {}. Using server value.",
                    sub_task_id, e
                );
                server_tracked
            }
        }
    }

    /// Сохранить накопленное время sub-task сразу (не откладывая)
    pub(crate) fn persist_total(
        &self,
        task_id: &str,
        sub_task_id: &str,
        total_seconds: u64,
        now: u64,
    ) -> EngineResult<()> {
        self.store
            .save_tracked(task_id, sub_task_id, total_seconds, now)?;
        Ok(())
    }
}
