use std::{collections::HashMap, sync::Arc};

use lyceum_logger::debug;

use crate::{api::RoomApi, model::UserProfile, types::RoomResult};

/// Session-lifetime member-profile cache.
///
/// Profiles never change within a session and a room's population is
/// bounded, so entries are kept until the session ends; there is no
/// eviction. All uncached ids are resolved in one batched lookup.
pub struct ProfileCache {
    api: Arc<dyn RoomApi>,
    room_id: String,
    cache: HashMap<String, UserProfile>,
}

impl ProfileCache {
    pub fn new(api: Arc<dyn RoomApi>, room_id: String) -> Self {
        Self {
            api,
            room_id,
            cache: HashMap::new(),
        }
    }

    /// Resolves profiles for `ids`, fetching only the ones not seen before.
    pub async fn resolve(&mut self, ids: &[String]) -> RoomResult<HashMap<String, UserProfile>> {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !self.cache.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            debug!("resolving {} member profiles", missing.len());
            let fetched = self.api.member_profiles(&self.room_id, &missing).await?;
            self.cache.extend(fetched);
        }
        Ok(self.cached(ids))
    }

    /// Cache-only view, for callers that must degrade instead of fetch.
    pub fn cached(&self, ids: &[String]) -> HashMap<String, UserProfile> {
        ids.iter()
            .filter_map(|id| self.cache.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&UserProfile> {
        self.cache.get(id)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{model::RoomStartStatus, types::RoomError};

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
        requested: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl RoomApi for CountingApi {
        async fn update_room_status(&self, _: &str, _: RoomStartStatus) -> RoomResult {
            Err(RoomError::Transport("not under test".into()))
        }

        async fn member_profiles(
            &self,
            _: &str,
            ids: &[String],
        ) -> RoomResult<HashMap<String, UserProfile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        UserProfile {
                            name: format!("name-{id}"),
                            ..UserProfile::default()
                        },
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn second_resolve_hits_the_cache() {
        let api = Arc::new(CountingApi::default());
        let mut cache = ProfileCache::new(api.clone(), "room".into());

        let ids = vec!["u1".to_owned(), "u2".to_owned()];
        let first = cache.resolve(&ids).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        let second = cache.resolve(&ids).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn only_missing_ids_are_fetched() {
        let api = Arc::new(CountingApi::default());
        let mut cache = ProfileCache::new(api.clone(), "room".into());

        cache.resolve(&["u1".to_owned()]).await.unwrap();
        cache
            .resolve(&["u1".to_owned(), "u2".to_owned()])
            .await
            .unwrap();

        let requested = api.requested.lock().unwrap();
        assert_eq!(*requested, vec![vec!["u1".to_owned()], vec!["u2".to_owned()]]);
    }

    #[tokio::test]
    async fn cached_view_never_calls_out() {
        let api = Arc::new(CountingApi::default());
        let mut cache = ProfileCache::new(api.clone(), "room".into());
        cache.resolve(&["u1".to_owned()]).await.unwrap();

        let view = cache.cached(&["u1".to_owned(), "u2".to_owned()]);
        assert_eq!(view.len(), 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}
