use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DeviceId, DeviceType, Endpoints, HttpClient};

/// Known device ids per device type. A type whose discovery failed is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory(BTreeMap<DeviceType, BTreeSet<DeviceId>>);

impl Inventory {
    pub fn devices(&self, device_type: DeviceType) -> impl Iterator<Item = &DeviceId> {
        self.0.get(&device_type).into_iter().flatten()
    }

    pub fn contains_type(&self, device_type: DeviceType) -> bool {
        self.0.contains_key(&device_type)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }
}

impl FromIterator<(DeviceType, BTreeSet<DeviceId>)> for Inventory {
    fn from_iter<I: IntoIterator<Item = (DeviceType, BTreeSet<DeviceId>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct Cached {
    inventory: Arc<Inventory>,
    fetched_at: Instant,
}

/// Discovers lights and groups from the gateway and caches the result for
/// `ttl`.
///
/// Refreshes happen under the cache lock, so concurrent callers that hit an
/// expired entry wait for the single in-flight refresh instead of issuing
/// their own requests.
pub struct DeviceDirectory<H> {
    http: H,
    endpoints: Endpoints,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl<H: HttpClient> DeviceDirectory<H> {
    pub fn new(http: H, endpoints: Endpoints, ttl: Duration) -> Self {
        Self {
            http,
            endpoints,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> Arc<Inventory> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Arc::clone(&cached.inventory);
            }
        }

        let inventory = Arc::new(self.discover().await);
        *cache = Some(Cached {
            inventory: Arc::clone(&inventory),
            fetched_at: Instant::now(),
        });
        inventory
    }

    async fn discover(&self) -> Inventory {
        debug!("Requesting devices from deCONZ");
        let mut inventory = BTreeMap::new();
        for device_type in DeviceType::ALL {
            let url = self.endpoints.inventory(device_type);
            let body = match self.http.get_json(&url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to discover {}: {}", device_type, e);
                    continue;
                }
            };
            let Some(devices) = body.as_object() else {
                warn!(
                    "Unexpected {} response from deCONZ, check deconz.apikey: {}",
                    device_type, body
                );
                continue;
            };
            let ids: BTreeSet<DeviceId> =
                devices.keys().map(|k| DeviceId::from(k.as_str())).collect();
            inventory.insert(device_type, ids);
        }
        let inventory = Inventory(inventory);
        debug!("Retrieved {} devices: {:?}", inventory.len(), inventory);
        inventory
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::DeconzConfig;
    use crate::testing::FakeHttp;

    const LIGHTS: &str = "http://gw/api/KEY/lights";
    const GROUPS: &str = "http://gw/api/KEY/groups";

    fn directory(http: Arc<FakeHttp>, ttl: Duration) -> DeviceDirectory<Arc<FakeHttp>> {
        let endpoints = Endpoints::new(&DeconzConfig {
            uri: "http://gw".to_string(),
            apikey: "KEY".to_string(),
            discovery_ttl: ttl,
            request_timeout: Duration::from_secs(10),
        });
        DeviceDirectory::new(http, endpoints, ttl)
    }

    fn ids(inventory: &Inventory, device_type: DeviceType) -> Vec<String> {
        inventory
            .devices(device_type)
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn should_return_top_level_keys_per_type() {
        let http = Arc::new(FakeHttp::new());
        http.answer(LIGHTS, json!({"1": {"name": "desk"}, "12": {"name": "hall"}}))
            .answer(GROUPS, json!({"3": {"name": "kitchen"}}));

        let inventory = directory(http, Duration::from_secs(600)).snapshot().await;

        assert_eq!(ids(&inventory, DeviceType::Light), vec!["1", "12"]);
        assert_eq!(ids(&inventory, DeviceType::Group), vec!["3"]);
        assert_eq!(inventory.len(), 3);
    }

    #[tokio::test]
    async fn should_serve_cached_snapshot_within_ttl() {
        let http = Arc::new(FakeHttp::new());
        http.answer(LIGHTS, json!({"1": {}}))
            .answer(GROUPS, json!({"2": {}}));
        let directory = directory(Arc::clone(&http), Duration::from_secs(600));

        let first = directory.snapshot().await;
        let second = directory.snapshot().await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(http.gets(), vec![LIGHTS, GROUPS]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_refresh_after_ttl_expiry() {
        let http = Arc::new(FakeHttp::new());
        http.answer(LIGHTS, json!({"1": {}}))
            .answer(LIGHTS, json!({"1": {}, "2": {}}))
            .answer(GROUPS, json!({}));
        let directory = directory(Arc::clone(&http), Duration::from_secs(600));

        let first = directory.snapshot().await;
        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(Arc::ptr_eq(&first, &directory.snapshot().await));

        tokio::time::advance(Duration::from_secs(1)).await;
        let refreshed = directory.snapshot().await;

        assert!(!Arc::ptr_eq(&first, &refreshed));
        assert_eq!(ids(&refreshed, DeviceType::Light), vec!["1", "2"]);
        assert_eq!(http.gets().len(), 4);
    }

    #[tokio::test]
    async fn should_share_single_refresh_between_concurrent_callers() {
        let http = Arc::new(FakeHttp::new());
        http.answer(LIGHTS, json!({"1": {}}))
            .answer(GROUPS, json!({"2": {}}));
        let directory = directory(Arc::clone(&http), Duration::from_secs(600));

        let (a, b) = tokio::join!(directory.snapshot(), directory.snapshot());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(http.gets().len(), 2);
    }

    #[tokio::test]
    async fn should_omit_type_with_non_object_response() {
        let http = Arc::new(FakeHttp::new());
        http.answer(
            LIGHTS,
            json!([{"error": {"type": 1, "description": "unauthorized user"}}]),
        )
        .answer(GROUPS, json!({"5": {}}));

        let inventory = directory(http, Duration::from_secs(600)).snapshot().await;

        assert!(!inventory.contains_type(DeviceType::Light));
        assert_eq!(ids(&inventory, DeviceType::Light), Vec::<String>::new());
        assert_eq!(ids(&inventory, DeviceType::Group), vec!["5"]);
    }

    #[tokio::test]
    async fn should_omit_type_with_null_response() {
        let http = Arc::new(FakeHttp::new());
        http.answer(LIGHTS, json!({"1": {}}))
            .answer(GROUPS, serde_json::Value::Null);

        let inventory = directory(http, Duration::from_secs(600)).snapshot().await;

        assert!(!inventory.contains_type(DeviceType::Group));
        assert_eq!(ids(&inventory, DeviceType::Light), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_failed_type_after_ttl() {
        let http = Arc::new(FakeHttp::new());
        http.fail(LIGHTS)
            .answer(LIGHTS, json!({"7": {}}))
            .answer(GROUPS, json!({}));
        let directory = directory(Arc::clone(&http), Duration::from_secs(60));

        let degraded = directory.snapshot().await;
        assert!(!degraded.contains_type(DeviceType::Light));
        assert!(degraded.contains_type(DeviceType::Group));
        assert_eq!(ids(&*directory.snapshot().await, DeviceType::Light), Vec::<String>::new());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ids(&*directory.snapshot().await, DeviceType::Light), vec!["7"]);
    }
}
