//! Populating the state cache from the worker.

use crate::cache::{CharacteristicValues, StateCache, device_hash};
use crate::config::SharedConfig;
use crate::error::Result;
use crate::worker::WorkerClient;
use log::info;
use std::collections::HashMap;

/// Fetch every accessory's values from the worker and install them.
///
/// Accessories outside the allow-list are left out of both the values and
/// the device hash. Returns the number of cached accessories.
pub async fn warm_cache(
    cache: &StateCache,
    client: &dyn WorkerClient,
    config: &SharedConfig,
) -> Result<usize> {
    let states = client.accessory_states().await?;

    let values: HashMap<String, CharacteristicValues> = {
        let config = config.read();
        states
            .into_iter()
            .filter(|state| config.accessory_allowed(&state.id))
            .map(|state| (state.id, state.values))
            .collect()
    };
    let hash = device_hash(values.keys().map(String::as_str));
    let reused = cache.device_hash_matches(&hash);
    let count = values.len();

    cache.apply_warm(values, hash);
    info!(
        "[Cache] Warmed {} accessories ({})",
        count,
        if reused { "refreshed" } else { "rebuilt" }
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Config, FilterMode};
    use crate::error::DaemonError;
    use crate::worker::{AccessoryState, HomeInfo, WorkerConfig, WorkerStatus};
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::sync::Arc;

    struct FixedStates(Vec<AccessoryState>);

    #[async_trait]
    impl WorkerClient for FixedStates {
        async fn status_query(&self) -> Result<WorkerStatus> {
            Ok(WorkerStatus {
                ready: true,
                home_count: 1,
            })
        }

        async fn list_homes(&self) -> Result<Vec<HomeInfo>> {
            Ok(Vec::new())
        }

        async fn get_config(&self) -> Result<WorkerConfig> {
            Ok(WorkerConfig::default())
        }

        async fn accessory_states(&self) -> Result<Vec<AccessoryState>> {
            if self.0.is_empty() {
                return Err(DaemonError::WorkerQuery("no accessories".into()));
            }
            Ok(self.0.clone())
        }
    }

    fn state(id: &str, power: &str) -> AccessoryState {
        AccessoryState {
            id: id.into(),
            values: [("power".to_string(), power.to_string())].into(),
        }
    }

    #[tokio::test]
    async fn test_warm_applies_allow_list() {
        let mut config = Config::default();
        config.filter_mode = FilterMode::AllowList;
        config.allowed_accessory_ids = vec!["lamp".into()];
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let cache = StateCache::in_memory(300, Arc::new(ManualClock::default()));
        let client = FixedStates(vec![state("lamp", "true"), state("fan", "false")]);

        let count = warm_cache(&cache, &client, &config).await.unwrap();

        assert_eq!(count, 1);
        assert!(cache.cached_state("fan").is_none());
        assert_eq!(cache.cached_state("lamp").unwrap()["power"], "true");
        assert!(cache.device_hash_matches(&device_hash(["lamp"])));
        assert!(!cache.is_stale());
    }

    #[tokio::test]
    async fn test_topology_change_drops_old_entries() {
        let config: SharedConfig = Arc::new(RwLock::new(Config::default()));
        let cache = StateCache::in_memory(300, Arc::new(ManualClock::default()));

        warm_cache(&cache, &FixedStates(vec![state("a", "1"), state("b", "0")]), &config)
            .await
            .unwrap();
        warm_cache(&cache, &FixedStates(vec![state("a", "0")]), &config)
            .await
            .unwrap();

        assert_eq!(cache.cached_accessory_count(), 1);
        assert_eq!(cache.cached_state("a").unwrap()["power"], "0");
    }

    #[tokio::test]
    async fn test_worker_error_leaves_cache_alone() {
        let config: SharedConfig = Arc::new(RwLock::new(Config::default()));
        let cache = StateCache::in_memory(300, Arc::new(ManualClock::default()));
        cache.set_values("a", CharacteristicValues::new());

        assert!(warm_cache(&cache, &FixedStates(Vec::new()), &config).await.is_err());
        assert_eq!(cache.cached_accessory_count(), 1);
        assert!(cache.is_stale());
    }
}
