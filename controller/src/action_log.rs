use chrono::{DateTime, Utc};
use tracing::{info, warn};

use heating_common::{ActionId, ActionLogEntry, RelayState};

use crate::store::StateStore;

#[derive(Clone)]
pub struct ActionLogger {
    store: StateStore,
    enabled: bool,
}

impl ActionLogger {
    pub fn new(store: StateStore, enabled: bool) -> Self {
        Self { store, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn log(
        &self,
        action: ActionId,
        state: RelayState,
        target: f32,
        at: DateTime<Utc>,
    ) -> bool {
        info!("action {action} -> {} (target {target:.1}°F)", state.as_str());
        if !self.enabled {
            return false;
        }

        let entry = ActionLogEntry {
            action,
            state,
            target,
            record_time: at,
        };
        match self.store.log_action(&entry).await {
            Ok(_) => true,
            Err(err) => {
                warn!("action log entry for action {action} lost: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::store::{Backend, LOCAL, REMOTE};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn logs_through_to_the_store() {
        let store = StateStore::new(
            Backend::offline(REMOTE),
            Backend::open_local(LOCAL, ":memory:").await.unwrap(),
            Duration::from_secs(5),
        );
        let logger = ActionLogger::new(store.clone(), true);

        assert!(logger.log(4, RelayState::HeatOn, 68.0, at(7)).await);

        let entries = store.action_log_since(4, at(0)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, 68.0);
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let store = StateStore::new(Backend::offline(REMOTE), Backend::offline(LOCAL), Duration::from_secs(5));
        let logger = ActionLogger::new(store, true);
        assert!(!logger.log(4, RelayState::HeatOff, 68.0, at(7)).await);
    }

    #[tokio::test]
    async fn disabled_logger_writes_nothing() {
        let store = StateStore::new(
            Backend::offline(REMOTE),
            Backend::open_local(LOCAL, ":memory:").await.unwrap(),
            Duration::from_secs(5),
        );
        let logger = ActionLogger::new(store.clone(), false);

        assert!(!logger.log(4, RelayState::HeatOn, 68.0, at(7)).await);
        assert!(store.action_log_since(4, at(0)).await.unwrap().is_empty());
    }
}
