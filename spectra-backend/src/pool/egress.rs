//! Egress pool: exclusive route checkout with sticky credential bindings

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Acquire, Outcome};
use crate::models::{EgressRoute, RouteHealth, RouteStatus};

/// Cooldown per consecutive route failure
const ROUTE_COOLDOWN_STEP_SECS: i64 = 30;
const ROUTE_COOLDOWN_MAX_SECS: i64 = 600;

struct RouteSlot {
    route: Arc<EgressRoute>,
    health: RouteHealth,
    cooldown_until: Option<DateTime<Utc>>,
    in_use: bool,
    usage_count: i64,
    consecutive_failures: i64,
}

impl RouteSlot {
    fn usable(&self) -> bool {
        self.health == RouteHealth::Healthy && !self.in_use
    }
}

struct EgressState {
    routes: Vec<RouteSlot>,
    /// credential id -> route id
    bindings: HashMap<String, String>,
}

pub struct EgressPool {
    state: Mutex<EgressState>,
    direct: Arc<EgressRoute>,
    failure_threshold: u32,
}

impl EgressPool {
    /// An empty route list means direct connections only
    pub fn new(routes: Vec<EgressRoute>, failure_threshold: u32) -> Self {
        let routes = routes
            .into_iter()
            .map(|route| RouteSlot {
                route: Arc::new(route),
                health: RouteHealth::Healthy,
                cooldown_until: None,
                in_use: false,
                usage_count: 0,
                consecutive_failures: 0,
            })
            .collect();

        Self {
            state: Mutex::new(EgressState {
                routes,
                bindings: HashMap::new(),
            }),
            direct: Arc::new(EgressRoute::direct()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.state.lock().routes.is_empty()
    }

    /// Check out a route for `credential_id`, preferring its bound route
    pub fn acquire(&self, credential_id: &str) -> Acquire<Arc<EgressRoute>> {
        let mut state = self.state.lock();
        if state.routes.is_empty() {
            return Acquire::Granted(self.direct.clone());
        }

        let now = Utc::now();
        Self::expire_cooldowns(&mut state.routes, now);

        if let Some(bound_id) = state.bindings.get(credential_id).cloned() {
            let bound = state.routes.iter_mut().find(|r| r.route.id == bound_id);
            match bound {
                Some(slot) if slot.usable() => {
                    slot.in_use = true;
                    slot.usage_count += 1;
                    return Acquire::Granted(slot.route.clone());
                }
                // Keep the binding; a busy bound route is only a short wait
                Some(slot) if slot.health == RouteHealth::Healthy => {
                    return Acquire::Blocked { retry_in: None };
                }
                _ => {
                    state.bindings.remove(credential_id);
                }
            }
        }

        let mut load: HashMap<&str, usize> = HashMap::new();
        for route_id in state.bindings.values() {
            *load.entry(route_id.as_str()).or_default() += 1;
        }

        let chosen = state
            .routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.usable())
            .min_by_key(|(_, r)| (load.get(r.route.id.as_str()).copied().unwrap_or(0), r.usage_count))
            .map(|(i, _)| i);

        match chosen {
            Some(index) => {
                let slot = &mut state.routes[index];
                slot.in_use = true;
                slot.usage_count += 1;
                Acquire::Granted(slot.route.clone())
            }
            None => {
                if state.routes.iter().all(|r| r.health == RouteHealth::Disabled) {
                    return Acquire::Unavailable;
                }
                let busy = state.routes.iter().any(|r| r.health == RouteHealth::Healthy);
                let earliest = state
                    .routes
                    .iter()
                    .filter(|r| r.health == RouteHealth::CoolingDown)
                    .filter_map(|r| r.cooldown_until)
                    .min();
                Acquire::Blocked {
                    retry_in: if busy {
                        None
                    } else {
                        earliest.map(|until| (until - now).to_std().unwrap_or(Duration::ZERO))
                    },
                }
            }
        }
    }

    /// Return a route. Success binds it to the credential if unbound; a
    /// failure cools it down and drops every binding to it.
    pub fn release(&self, route_id: &str, credential_id: &str, outcome: &Outcome) {
        let mut state = self.state.lock();
        let EgressState { routes, bindings } = &mut *state;
        let Some(slot) = routes.iter_mut().find(|r| r.route.id == route_id) else {
            return;
        };
        slot.in_use = false;

        match outcome {
            Outcome::Success => {
                slot.consecutive_failures = 0;
                if !bindings.contains_key(credential_id) {
                    bindings.insert(credential_id.to_string(), route_id.to_string());
                    log::info!(
                        "[EGRESS] bound '{}' to {}",
                        credential_id,
                        slot.route.display_endpoint()
                    );
                }
            }
            Outcome::Failure(reason) => {
                slot.consecutive_failures += 1;
                let secs = (ROUTE_COOLDOWN_STEP_SECS * slot.consecutive_failures).min(ROUTE_COOLDOWN_MAX_SECS);
                bindings.retain(|_, bound| bound != route_id);

                if slot.consecutive_failures >= self.failure_threshold as i64 {
                    slot.health = RouteHealth::Disabled;
                    slot.cooldown_until = None;
                    log::warn!(
                        "[EGRESS] {} disabled after {} failures: {}",
                        slot.route.display_endpoint(),
                        slot.consecutive_failures,
                        reason
                    );
                } else {
                    slot.health = RouteHealth::CoolingDown;
                    slot.cooldown_until = Some(Utc::now() + chrono::Duration::seconds(secs));
                    log::warn!(
                        "[EGRESS] {} cooling down for {}s: {}",
                        slot.route.display_endpoint(),
                        secs,
                        reason
                    );
                }
            }
            // Rate limits and revocations belong to the credential
            Outcome::Neutral | Outcome::RateLimited(_) | Outcome::Revoked(_) => {}
        }
    }

    pub fn reset(&self, route_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.routes.iter_mut().find(|r| r.route.id == route_id) {
            Some(slot) => {
                slot.health = RouteHealth::Healthy;
                slot.cooldown_until = None;
                slot.consecutive_failures = 0;
                log::info!("[EGRESS] {} reset", slot.route.display_endpoint());
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn binding_for(&self, credential_id: &str) -> Option<String> {
        self.state.lock().bindings.get(credential_id).cloned()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.lock().routes.iter().filter(|r| r.in_use).count()
    }

    pub fn snapshot(&self) -> Vec<RouteStatus> {
        let mut state = self.state.lock();
        Self::expire_cooldowns(&mut state.routes, Utc::now());
        state
            .routes
            .iter()
            .map(|slot| {
                let mut bound_to: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|(_, route)| **route == slot.route.id)
                    .map(|(credential, _)| credential.clone())
                    .collect();
                bound_to.sort();
                RouteStatus {
                    route_id: slot.route.id.clone(),
                    endpoint: slot.route.display_endpoint(),
                    health: slot.health,
                    cooldown_until: slot.cooldown_until,
                    in_use: slot.in_use,
                    bound_to,
                    usage_count: slot.usage_count,
                    consecutive_failures: slot.consecutive_failures,
                }
            })
            .collect()
    }

    fn expire_cooldowns(routes: &mut [RouteSlot], now: DateTime<Utc>) {
        for slot in routes.iter_mut() {
            if slot.health == RouteHealth::CoolingDown && slot.cooldown_until.map_or(true, |t| t <= now) {
                slot.health = RouteHealth::Healthy;
                slot.cooldown_until = None;
            }
        }
    }
}
