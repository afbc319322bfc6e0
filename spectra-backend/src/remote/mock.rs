//! Scriptable in-memory remote service for tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    AccessibleEntity, Destination, EntityRef, RelayRequest, RemoteClient, RemoteItem, RemoteUser, Session, TaskContext,
};
use crate::error::FetchFailure;
use crate::models::{Credential, EgressRoute};

#[derive(Debug, Clone)]
pub struct RelayRecord {
    pub credential_id: String,
    pub request: RelayRequest,
}

#[derive(Default)]
struct Script {
    content: HashMap<String, BTreeMap<i64, RemoteItem>>,
    resolvable: HashMap<String, EntityRef>,
    accessible: HashMap<String, Vec<AccessibleEntity>>,
    next_failures: HashMap<(String, String), VecDeque<FetchFailure>>,
    sticky_failures: HashMap<(String, String), FetchFailure>,
    relays: Vec<RelayRecord>,
    calls: Vec<(String, String)>,
    in_flight_by_credential: HashMap<String, usize>,
    latency: Duration,
    /// Extra latency for calls on one subject
    delays: HashMap<String, Duration>,
}

#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    shared_credential: AtomicBool,
    personal_in_flight: AtomicUsize,
    personal_high_water: AtomicUsize,
}

pub fn base_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn credential(id: &str) -> Credential {
    Credential {
        id: id.to_string(),
        api_id: 1000,
        api_hash: "0123456789abcdef".to_string(),
        phone: None,
    }
}

pub fn test_context(credential_id: &str) -> TaskContext {
    TaskContext {
        task_id: format!("test-{}", credential_id),
        credential: Arc::new(credential(credential_id)),
        route: Arc::new(EgressRoute::direct()),
        cancel: CancellationToken::new(),
    }
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain items `ids` in `entity`, each sent by user 1
    pub fn add_items(&self, entity: &str, ids: impl IntoIterator<Item = i64>) {
        let mut script = self.script.lock();
        let items = script.content.entry(entity.to_string()).or_default();
        for id in ids {
            items.insert(
                id,
                RemoteItem {
                    id,
                    date: base_date() + ChronoDuration::minutes(id),
                    edit_date: None,
                    text: Some(format!("message {} in {}", id, entity)),
                    sender: Some(RemoteUser {
                        id: 1,
                        username: Some("poster".to_string()),
                        first_name: None,
                        last_name: None,
                    }),
                    media: None,
                    reply_to: None,
                },
            );
        }
    }

    pub fn add_item(&self, entity: &str, item: RemoteItem) {
        let mut script = self.script.lock();
        script.content.entry(entity.to_string()).or_default().insert(item.id, item);
    }

    /// Replace an item's text with a newer edit
    pub fn edit_item(&self, entity: &str, id: i64, text: &str, edit_minutes: i64) {
        let mut script = self.script.lock();
        if let Some(item) = script.content.get_mut(entity).and_then(|items| items.get_mut(&id)) {
            item.text = Some(text.to_string());
            item.edit_date = Some(item.date + ChronoDuration::minutes(edit_minutes));
        }
    }

    /// Make `source` mention each of `targets` and make them resolvable
    pub fn link(&self, source: &str, targets: &[&str]) {
        let mut script = self.script.lock();
        for target in targets.iter().chain(std::iter::once(&source)) {
            script
                .resolvable
                .entry(target.to_string())
                .or_insert_with(|| EntityRef::new(*target));
        }
        let items = script.content.entry(source.to_string()).or_default();
        let next_id = items.keys().next_back().copied().unwrap_or(0) + 1;
        let text = targets.iter().map(|t| format!("see @{}", t)).collect::<Vec<_>>().join(" ");
        items.insert(
            next_id,
            RemoteItem {
                id: next_id,
                date: base_date() + ChronoDuration::minutes(next_id),
                edit_date: None,
                text: Some(text),
                sender: None,
                media: None,
                reply_to: None,
            },
        );
    }

    pub fn grant_access(&self, credential_id: &str, entities: &[&str]) {
        let mut script = self.script.lock();
        let list = script.accessible.entry(credential_id.to_string()).or_default();
        for key in entities {
            list.push(AccessibleEntity {
                entity: EntityRef::new(*key),
                access_handle: Some(format!("handle-{}-{}", credential_id, key)),
            });
        }
    }

    /// Fail the next `op` call on `subject` once
    pub fn fail_next(&self, op: &str, subject: &str, failure: FetchFailure) {
        let mut script = self.script.lock();
        script
            .next_failures
            .entry((op.to_string(), subject.to_string()))
            .or_default()
            .push_back(failure);
    }

    /// Fail every `op` call on `subject`
    pub fn fail_always(&self, op: &str, subject: &str, failure: FetchFailure) {
        let mut script = self.script.lock();
        script.sticky_failures.insert((op.to_string(), subject.to_string()), failure);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().latency = latency;
    }

    pub fn delay_subject(&self, subject: &str, delay: Duration) {
        self.script.lock().delays.insert(subject.to_string(), delay);
    }

    pub fn relays(&self) -> Vec<RelayRecord> {
        self.script.lock().relays.clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, op: &str, subject: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|(o, s)| o == op && s == subject)
            .count()
    }

    /// Subjects of every `op` call, in call order
    pub fn call_order(&self, op: &str) -> Vec<String> {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Most personal-archive relays that were in flight at once
    pub fn personal_high_water(&self) -> usize {
        self.personal_high_water.load(Ordering::SeqCst)
    }

    /// Most calls that were in flight at once
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Whether one credential ever had two calls in flight
    pub fn credential_was_shared(&self) -> bool {
        self.shared_credential.load(Ordering::SeqCst)
    }

    async fn enter(&self, session: Session<'_>, op: &str, subject: &str) -> Result<(), FetchFailure> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);

        let (latency, failure) = {
            let mut script = self.script.lock();
            script.calls.push((op.to_string(), subject.to_string()));
            let count = script
                .in_flight_by_credential
                .entry(session.credential.id.clone())
                .or_insert(0);
            *count += 1;
            if *count > 1 {
                self.shared_credential.store(true, Ordering::SeqCst);
            }

            let key = (op.to_string(), subject.to_string());
            let mut failure = script.next_failures.get_mut(&key).and_then(|queue| queue.pop_front());
            if failure.is_none() {
                failure = script.sticky_failures.get(&key).cloned();
            }
            let delay = script.delays.get(subject).copied().unwrap_or_default();
            (script.latency + delay, failure)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.exit(session);
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn exit(&self, session: Session<'_>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if let Some(count) = script.in_flight_by_credential.get_mut(&session.credential.id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemote {
    async fn list_entity_content(
        &self,
        session: Session<'_>,
        entity: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RemoteItem>, FetchFailure> {
        self.enter(session, "list_entity_content", entity).await?;
        let script = self.script.lock();
        let Some(items) = script.content.get(entity) else {
            return Ok(Vec::new());
        };
        Ok(items
            .range(after_id + 1..)
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn get_items(&self, session: Session<'_>, entity: &str, ids: &[i64]) -> Result<Vec<RemoteItem>, FetchFailure> {
        self.enter(session, "get_items", entity).await?;
        let script = self.script.lock();
        let Some(items) = script.content.get(entity) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| items.get(id).cloned()).collect())
    }

    async fn resolve_references(
        &self,
        session: Session<'_>,
        candidates: &[String],
    ) -> Result<Vec<EntityRef>, FetchFailure> {
        self.enter(session, "resolve_references", "*").await?;
        let script = self.script.lock();
        Ok(candidates
            .iter()
            .filter_map(|c| script.resolvable.get(c).cloned())
            .collect())
    }

    async fn relay(&self, session: Session<'_>, request: &RelayRequest) -> Result<(), FetchFailure> {
        let personal = request.destination == Destination::Personal;
        if personal {
            let now = self.personal_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.personal_high_water.fetch_max(now, Ordering::SeqCst);
        }
        let entered = self.enter(session, "relay", &request.origin).await;
        if personal {
            self.personal_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        entered?;
        self.script.lock().relays.push(RelayRecord {
            credential_id: session.credential.id.clone(),
            request: request.clone(),
        });
        Ok(())
    }

    async fn list_accessible_entities(&self, session: Session<'_>) -> Result<Vec<AccessibleEntity>, FetchFailure> {
        self.enter(session, "list_accessible_entities", &session.credential.id).await?;
        let script = self.script.lock();
        Ok(script
            .accessible
            .get(&session.credential.id)
            .cloned()
            .unwrap_or_default())
    }
}
