//! Peer presence tracking.
//!
//! Maintains the peer-id → online/offline cache for the process lifetime.
//! Update sources are trust-ordered: a pushed status change always
//! overwrites, the heartbeat self-refresh overwrites only the bound self
//! entry, and query responses only fill slots that are still vacant — a
//! stale batched response must never clobber a fresher push.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use campus_shared::constants::PRESENCE_BATCH_MAX;
use campus_shared::error::NetworkError;
use campus_shared::types::{PresenceStatus, UserId};

/// Status query operations on the remote API.
#[async_trait]
pub trait PresenceApi: Send + Sync {
    async fn fetch_status(&self, user: &UserId) -> Result<PresenceStatus, NetworkError>;

    /// Batched query. The reply is positional: `result[i]` belongs to
    /// `users[i]`; it carries no ids of its own.
    async fn fetch_status_batch(
        &self,
        users: &[UserId],
    ) -> Result<Vec<PresenceStatus>, NetworkError>;
}

/// Pending-query slot. `None` while the query is in flight; followers await
/// the leader's per-call result instead of issuing their own query.
type InFlight = watch::Receiver<Option<PresenceStatus>>;

pub struct PresenceTracker {
    api: Arc<dyn PresenceApi>,
    cache: Mutex<HashMap<UserId, PresenceStatus>>,
    in_flight: Mutex<HashMap<UserId, InFlight>>,
    self_id: Mutex<Option<UserId>>,
}

impl PresenceTracker {
    pub fn new(api: Arc<dyn PresenceApi>) -> Self {
        Self {
            api,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            self_id: Mutex::new(None),
        }
    }

    /// Bind the logged-in user. Their entry is refreshed locally on connect,
    /// every heartbeat tick and on visibility regain, independent of any
    /// server push.
    pub fn bind_self(&self, user: UserId) {
        *self.self_id.lock().expect("self lock") = Some(user);
        self.mark_self_online();
    }

    pub fn mark_self_online(&self) {
        let self_id = self.self_id.lock().expect("self lock").clone();
        if let Some(user) = self_id {
            self.cache
                .lock()
                .expect("cache lock")
                .insert(user, PresenceStatus::Online);
        }
    }

    /// Apply an authoritative pushed status change. Always overwrites.
    pub fn apply_push(&self, user: UserId, status: PresenceStatus) {
        debug!(user = %user.short(), ?status, "Presence push");
        self.cache
            .lock()
            .expect("cache lock")
            .insert(user, status);
    }

    /// Resolve one peer's status. Cache hits return without a network trip;
    /// concurrent misses for the same id coalesce into a single query.
    pub async fn status(&self, user: &UserId) -> PresenceStatus {
        if let Some(status) = self.cache.lock().expect("cache lock").get(user) {
            return *status;
        }

        enum Role {
            Leader(watch::Sender<Option<PresenceStatus>>),
            Follower(InFlight),
        }

        let role = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock");
            match in_flight.get(user) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(user.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(rx) => await_in_flight(rx).await,
            Role::Leader(tx) => {
                let result = self.api.fetch_status(user).await;
                self.in_flight.lock().expect("in-flight lock").remove(user);
                match result {
                    Ok(status) => {
                        let effective = self.fill_from_query(user, status);
                        let _ = tx.send(Some(effective));
                        effective
                    }
                    Err(e) => {
                        // No cache write: the id stays unresolved so a later
                        // query can retry. This call degrades to offline.
                        warn!(user = %user.short(), error = %e, "Presence query failed");
                        let _ = tx.send(Some(PresenceStatus::Offline));
                        PresenceStatus::Offline
                    }
                }
            }
        }
    }

    /// Resolve many peers at once. Ids already cached or in flight are not
    /// re-queried; the remainder goes out as one batched request.
    pub async fn batch_status(&self, users: &[UserId]) -> Vec<(UserId, PresenceStatus)> {
        let mut resolved: HashMap<UserId, PresenceStatus> = HashMap::new();
        let mut followers: Vec<(UserId, InFlight)> = Vec::new();
        let mut misses: Vec<UserId> = Vec::new();
        let mut leaders: HashMap<UserId, watch::Sender<Option<PresenceStatus>>> = HashMap::new();

        {
            let cache = self.cache.lock().expect("cache lock");
            let mut in_flight = self.in_flight.lock().expect("in-flight lock");
            for user in users {
                if resolved.contains_key(user) || leaders.contains_key(user) {
                    continue;
                }
                if let Some(status) = cache.get(user) {
                    resolved.insert(user.clone(), *status);
                } else if let Some(rx) = in_flight.get(user) {
                    followers.push((user.clone(), rx.clone()));
                } else if misses.len() < PRESENCE_BATCH_MAX {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(user.clone(), rx);
                    leaders.insert(user.clone(), tx);
                    misses.push(user.clone());
                } else {
                    warn!(user = %user.short(), "Presence batch overflow, degrading to offline");
                }
            }
        }

        if !misses.is_empty() {
            let result = self.api.fetch_status_batch(&misses).await;
            let statuses = match &result {
                Ok(statuses) => {
                    if statuses.len() != misses.len() {
                        warn!(
                            requested = misses.len(),
                            received = statuses.len(),
                            "Presence batch reply length mismatch"
                        );
                    }
                    statuses.as_slice()
                }
                Err(e) => {
                    warn!(error = %e, count = misses.len(), "Presence batch query failed");
                    &[]
                }
            };

            // Zip positionally against the id list we actually sent. Ids
            // beyond the reply length stay unresolved (offline for this
            // call only, no cache write).
            for (index, user) in misses.iter().enumerate() {
                self.in_flight.lock().expect("in-flight lock").remove(user);
                let tx = leaders.remove(user).expect("leader slot");
                match statuses.get(index) {
                    Some(status) => {
                        let effective = self.fill_from_query(user, *status);
                        resolved.insert(user.clone(), effective);
                        let _ = tx.send(Some(effective));
                    }
                    None => {
                        resolved.insert(user.clone(), PresenceStatus::Offline);
                        let _ = tx.send(Some(PresenceStatus::Offline));
                    }
                }
            }
        }

        for (user, rx) in followers {
            let status = await_in_flight(rx).await;
            resolved.insert(user, status);
        }

        users
            .iter()
            .map(|user| {
                let status = resolved
                    .get(user)
                    .copied()
                    .unwrap_or(PresenceStatus::Offline);
                (user.clone(), status)
            })
            .collect()
    }

    /// Write a query result into the cache unless something fresher got
    /// there first. Returns the entry's effective value.
    fn fill_from_query(&self, user: &UserId, status: PresenceStatus) -> PresenceStatus {
        let mut cache = self.cache.lock().expect("cache lock");
        *cache.entry(user.clone()).or_insert(status)
    }
}

async fn await_in_flight(mut rx: InFlight) -> PresenceStatus {
    loop {
        if let Some(status) = *rx.borrow() {
            return status;
        }
        if rx.changed().await.is_err() {
            return PresenceStatus::Offline;
        }
    }
}
