//! Credential pool: rotation over healthy credentials with cooldowns and
//! disablement

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Acquire, Outcome};
use crate::models::{Credential, CredentialHealth, CredentialStatus};

/// Window after which `recent_usage` counters start over
const USAGE_WINDOW_SECS: i64 = 3600;

/// How `acquire` picks among healthy, idle credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Lowest recent usage, then longest idle
    #[default]
    #[serde(alias = "weighted")]
    LeastUsed,
    /// Round robin in configuration order
    Sequential,
    Random,
    /// Mostly time since last use, partly inverse lifetime usage
    Smart,
}

struct Slot {
    credential: Arc<Credential>,
    status: CredentialStatus,
    /// `last_used` before the current checkout
    prior_last_used: Option<DateTime<Utc>>,
}

struct PoolState {
    slots: Vec<Slot>,
    window_started: DateTime<Utc>,
    /// Next slot for sequential rotation
    cursor: usize,
}

pub struct CredentialPool {
    state: Mutex<PoolState>,
    rotation: RotationMode,
    failure_threshold: u32,
    released: Notify,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, failure_threshold: u32) -> Self {
        let slots = credentials
            .into_iter()
            .map(|credential| Slot {
                status: CredentialStatus::new(&credential.id),
                credential: Arc::new(credential),
                prior_last_used: None,
            })
            .collect();

        Self {
            state: Mutex::new(PoolState {
                slots,
                window_started: Utc::now(),
                cursor: 0,
            }),
            rotation: RotationMode::default(),
            failure_threshold: failure_threshold.max(1),
            released: Notify::new(),
        }
    }

    pub fn with_rotation(mut self, rotation: RotationMode) -> Self {
        self.rotation = rotation;
        self
    }

    /// Apply persisted state (cooldowns, disables, counters) to known credentials
    pub fn restore(&self, statuses: Vec<CredentialStatus>) {
        let mut state = self.state.lock();
        for persisted in statuses {
            if let Some(slot) = state.slots.iter_mut().find(|s| s.credential.id == persisted.credential_id) {
                slot.status = CredentialStatus {
                    in_use: false,
                    recent_usage: 0,
                    ..persisted
                };
                if slot.status.health != CredentialHealth::Healthy {
                    log::info!(
                        "[CREDENTIALS] restored '{}' as {}",
                        slot.credential.id,
                        slot.status.health
                    );
                }
            }
        }
    }

    /// Check out a healthy, idle credential picked by the rotation mode
    pub fn acquire(&self) -> Acquire<Arc<Credential>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        Self::roll_window(&mut state, now);
        Self::expire_cooldowns(&mut state.slots, now);

        let candidates: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status.health == CredentialHealth::Healthy && !s.status.in_use)
            .map(|(i, _)| i)
            .collect();

        let Some(index) = self.pick(&mut state, &candidates, now) else {
            return Self::blocked(&state.slots, now);
        };
        let slot = &mut state.slots[index];
        Self::check_out(slot, now);
        log::debug!("[CREDENTIALS] acquired '{}'", slot.credential.id);
        Acquire::Granted(slot.credential.clone())
    }

    fn pick(&self, state: &mut PoolState, candidates: &[usize], now: DateTime<Utc>) -> Option<usize> {
        let slots = &state.slots;
        match self.rotation {
            RotationMode::LeastUsed => candidates.iter().copied().min_by(|&a, &b| {
                let (a, b) = (&slots[a].status, &slots[b].status);
                a.recent_usage
                    .cmp(&b.recent_usage)
                    .then(a.last_used.cmp(&b.last_used))
            }),
            RotationMode::Sequential => {
                let len = slots.len().max(1);
                let start = state.cursor % len;
                let index = candidates
                    .iter()
                    .copied()
                    .min_by_key(|&i| (i + len - start) % len)?;
                state.cursor = index + 1;
                Some(index)
            }
            RotationMode::Random => candidates.choose(&mut rand::thread_rng()).copied(),
            RotationMode::Smart => {
                let score = |i: usize| {
                    let status = &slots[i].status;
                    let idle_hours = match status.last_used {
                        Some(at) => (now - at).num_seconds().max(0) as f64 / 3600.0,
                        None => f64::INFINITY,
                    };
                    idle_hours * 0.7 + 0.3 / (status.usage_count.max(0) as f64 + 1.0)
                };
                let mut best: Option<(usize, f64)> = None;
                for &i in candidates {
                    let s = score(i);
                    if best.map_or(true, |(_, top)| s > top) {
                        best = Some((i, s));
                    }
                }
                best.map(|(i, _)| i)
            }
        }
    }

    /// Check out one specific credential
    pub fn acquire_specific(&self, credential_id: &str) -> Acquire<Arc<Credential>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        Self::roll_window(&mut state, now);
        Self::expire_cooldowns(&mut state.slots, now);

        let Some(slot) = state.slots.iter_mut().find(|s| s.credential.id == credential_id) else {
            return Acquire::Unavailable;
        };

        match slot.status.health {
            CredentialHealth::Disabled => Acquire::Unavailable,
            CredentialHealth::CoolingDown => Acquire::Blocked {
                retry_in: slot.status.cooldown_until.map(|until| remaining(until, now)),
            },
            CredentialHealth::Healthy if slot.status.in_use => Acquire::Blocked { retry_in: None },
            CredentialHealth::Healthy => {
                Self::check_out(slot, now);
                Acquire::Granted(slot.credential.clone())
            }
        }
    }

    /// Return a credential with the outcome of its task. Returns the
    /// updated status for persistence.
    pub fn release(&self, credential_id: &str, outcome: Outcome) -> Option<CredentialStatus> {
        let snapshot = {
            let mut state = self.state.lock();
            let slot = state.slots.iter_mut().find(|s| s.credential.id == credential_id)?;
            let status = &mut slot.status;
            status.in_use = false;

            match outcome {
                Outcome::Success => {
                    status.success_count += 1;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                }
                Outcome::Neutral => {}
                Outcome::RateLimited(wait) => {
                    status.rate_limit_count += 1;
                    if status.health != CredentialHealth::Disabled {
                        let until = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                        status.cooldown_until = Some(status.cooldown_until.map_or(until, |t| t.max(until)));
                        status.health = CredentialHealth::CoolingDown;
                        log::warn!(
                            "[CREDENTIALS] '{}' rate limited, cooling down for {}s",
                            credential_id,
                            wait.as_secs()
                        );
                    }
                }
                Outcome::Failure(reason) => {
                    status.consecutive_failures += 1;
                    status.last_error = Some(reason);
                    if status.consecutive_failures >= self.failure_threshold as i64
                        && status.health != CredentialHealth::Disabled
                    {
                        status.health = CredentialHealth::Disabled;
                        log::warn!(
                            "[CREDENTIALS] '{}' disabled after {} consecutive failures",
                            credential_id,
                            status.consecutive_failures
                        );
                    }
                }
                Outcome::Revoked(reason) => {
                    status.health = CredentialHealth::Disabled;
                    log::warn!("[CREDENTIALS] '{}' disabled: {}", credential_id, reason);
                    status.last_error = Some(reason);
                }
            }
            status.clone()
        };

        self.released.notify_waiters();
        Some(snapshot)
    }

    /// Undo a checkout that never ran a task, leaving the counters as they were
    pub fn cancel_checkout(&self, credential_id: &str) {
        {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.iter_mut().find(|s| s.credential.id == credential_id) else {
                return;
            };
            if !slot.status.in_use {
                return;
            }
            slot.status.in_use = false;
            slot.status.usage_count = (slot.status.usage_count - 1).max(0);
            slot.status.recent_usage = (slot.status.recent_usage - 1).max(0);
            slot.status.last_used = slot.prior_last_used;
        }
        self.released.notify_waiters();
    }

    /// Zero usage counters of every credential that is not disabled.
    /// Returns the changed statuses.
    pub fn reset_usage(&self) -> Vec<CredentialStatus> {
        let mut state = self.state.lock();
        let reset: Vec<CredentialStatus> = state
            .slots
            .iter_mut()
            .filter(|s| s.status.health != CredentialHealth::Disabled)
            .map(|slot| {
                slot.status.usage_count = 0;
                slot.status.recent_usage = 0;
                slot.status.clone()
            })
            .collect();
        log::info!("[CREDENTIALS] usage counters reset for {} credentials", reset.len());
        reset
    }

    /// Manually re-enable a credential
    pub fn reset(&self, credential_id: &str) -> Option<CredentialStatus> {
        let snapshot = {
            let mut state = self.state.lock();
            let slot = state.slots.iter_mut().find(|s| s.credential.id == credential_id)?;
            slot.status.health = CredentialHealth::Healthy;
            slot.status.cooldown_until = None;
            slot.status.consecutive_failures = 0;
            slot.status.last_error = None;
            log::info!("[CREDENTIALS] '{}' reset to healthy", credential_id);
            slot.status.clone()
        };
        self.released.notify_waiters();
        Some(snapshot)
    }

    /// Wait until something is released, or `max` elapses
    pub async fn wait_for_release(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.released.notified()).await;
    }

    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        let mut state = self.state.lock();
        let now = Utc::now();
        Self::expire_cooldowns(&mut state.slots, now);
        state.slots.iter().map(|s| s.status.clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let state = self.state.lock();
        state.slots.iter().map(|s| s.credential.id.clone()).collect()
    }

    /// Whether the credential is not disabled
    pub fn is_usable(&self, credential_id: &str) -> bool {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .any(|s| s.credential.id == credential_id && s.status.health != CredentialHealth::Disabled)
    }

    pub fn in_use_count(&self) -> usize {
        let state = self.state.lock();
        state.slots.iter().filter(|s| s.status.in_use).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    fn check_out(slot: &mut Slot, now: DateTime<Utc>) {
        slot.prior_last_used = slot.status.last_used;
        slot.status.in_use = true;
        slot.status.usage_count += 1;
        slot.status.recent_usage += 1;
        slot.status.last_used = Some(now);
    }

    fn roll_window(state: &mut PoolState, now: DateTime<Utc>) {
        if (now - state.window_started).num_seconds() >= USAGE_WINDOW_SECS {
            for slot in state.slots.iter_mut() {
                slot.status.recent_usage = 0;
            }
            state.window_started = now;
        }
    }

    fn expire_cooldowns(slots: &mut [Slot], now: DateTime<Utc>) {
        for slot in slots.iter_mut() {
            if slot.status.health == CredentialHealth::CoolingDown
                && slot.status.cooldown_until.map_or(true, |until| until <= now)
            {
                slot.status.health = CredentialHealth::Healthy;
                slot.status.cooldown_until = None;
                log::info!("[CREDENTIALS] '{}' cooldown over", slot.credential.id);
            }
        }
    }

    fn blocked(slots: &[Slot], now: DateTime<Utc>) -> Acquire<Arc<Credential>> {
        if slots.iter().all(|s| s.status.health == CredentialHealth::Disabled) {
            return Acquire::Unavailable;
        }
        let busy = slots
            .iter()
            .any(|s| s.status.health == CredentialHealth::Healthy && s.status.in_use);
        let earliest = slots
            .iter()
            .filter(|s| s.status.health == CredentialHealth::CoolingDown)
            .filter_map(|s| s.status.cooldown_until)
            .min();
        Acquire::Blocked {
            retry_in: if busy { None } else { earliest.map(|until| remaining(until, now)) },
        }
    }
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}
