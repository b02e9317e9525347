#![cfg(test)]

use crate::auth::SubscriberKeys;
use crate::config_parser::Config;
use crate::gateway_util::AppStateData;
use crate::quota::store::InMemoryCounterStore;
use crate::quota::QuotaStore;

/// App state with in-process counters and the given comma-separated keys
pub fn get_unit_test_app_state_data(config: Config, subscriber_keys: &str) -> AppStateData {
    get_unit_test_app_state_data_with_store(
        config,
        subscriber_keys,
        QuotaStore::InMemory(InMemoryCounterStore::new()),
    )
}

pub fn get_unit_test_app_state_data_with_store(
    config: Config,
    subscriber_keys: &str,
    store: QuotaStore,
) -> AppStateData {
    AppStateData::new_with_store(
        &config,
        SubscriberKeys::from_env_value(subscriber_keys),
        store,
    )
}
