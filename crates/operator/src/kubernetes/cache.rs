use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::object_key;

/// Called for every applied object with the previously cached version, if any.
pub type UpdateHook<K> = Box<dyn Fn(Option<&K>, &K) + Send + Sync>;

/// In-memory copy of the objects selected by a watch, keyed `namespace/name`.
pub struct WatchCache<K> {
    kind: &'static str,
    objects: RwLock<HashMap<String, K>>,
    synced: watch::Sender<bool>,
    on_update: Option<UpdateHook<K>>,
}

impl<K> WatchCache<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            objects: RwLock::new(HashMap::new()),
            synced,
            on_update: None,
        }
    }

    pub fn with_update_hook(mut self, hook: UpdateHook<K>) -> Self {
        self.on_update = Some(hook);
        self
    }

    pub async fn get(&self, key: &str) -> Option<K> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<K> {
        self.objects.read().await.values().cloned().collect()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Apply one watch event. The cache counts as synced once the first full
    /// listing has been applied.
    pub async fn apply(&self, event: Event<K>) {
        match event {
            Event::Applied(obj) => {
                let key = key_of(&obj);
                let mut objects = self.objects.write().await;
                self.notify(objects.get(&key), &obj);
                debug!(kind = self.kind, key = %key, "Object updated in cache");
                objects.insert(key, obj);
            }
            Event::Deleted(obj) => {
                let key = key_of(&obj);
                self.objects.write().await.remove(&key);
                debug!(kind = self.kind, key = %key, "Object removed from cache");
            }
            Event::Restarted(list) => {
                let mut objects = self.objects.write().await;
                let mut fresh = HashMap::with_capacity(list.len());
                for obj in list {
                    let key = key_of(&obj);
                    self.notify(objects.get(&key), &obj);
                    fresh.insert(key, obj);
                }
                *objects = fresh;
                drop(objects);

                if !self.is_synced() {
                    info!(kind = self.kind, "Cache synced");
                }
                self.synced.send_replace(true);
            }
        }
    }

    fn notify(&self, old: Option<&K>, new: &K) {
        if let Some(hook) = &self.on_update {
            hook(old, new);
        }
    }

    /// Feed the cache from a watch on `api` until the task is aborted.
    pub fn spawn(self: &Arc<Self>, api: Api<K>, config: watcher::Config) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = watcher::watcher(api, config).default_backoff().boxed();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => cache.apply(event).await,
                    Err(e) => warn!(kind = cache.kind, "Watch error: {}", e),
                }
            }
        })
    }

    pub async fn wait_synced(&self, timeout: Duration) -> crate::Result<()> {
        let mut rx = self.synced.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(crate::Error::Config(format!("{} cache closed", self.kind))),
            Err(_) => Err(crate::Error::Timeout(format!(
                "{} cache did not sync within {:?}",
                self.kind, timeout
            ))),
        };
        result
    }
}

fn key_of<K: Resource>(obj: &K) -> String {
    object_key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}
