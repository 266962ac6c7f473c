//! WIP-limited admission: CONWIP token pools per route and POLCA cards per
//! (upstream, downstream) cell pair.

use super::error::{SimError, SimResult};
use super::project::{ProjectConfig, Route};
use super::types::{CellId, CellPair, JobId, RouteId, SimTime};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReleasePolicy {
    /// Release on arrival, no WIP control
    Push,
    /// Constant WIP per route
    Conwip,
    /// Paired-cell overlapping loops of cards
    Polca,
}

impl ReleasePolicy {
    pub const ALL: [ReleasePolicy; 3] = [ReleasePolicy::Push, ReleasePolicy::Conwip, ReleasePolicy::Polca];

    pub fn name(&self) -> &'static str {
        match self {
            ReleasePolicy::Push => "PUSH",
            ReleasePolicy::Conwip => "CONWIP",
            ReleasePolicy::Polca => "POLCA",
        }
    }
}

impl std::fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ReleasePolicy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReleasePolicy::ALL
            .iter()
            .copied()
            .find(|policy| policy.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimError::config(format!("invalid release policy '{}'", s)))
    }
}

/// Fixed-size pool of WIP cards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPool {
    capacity: u32,
    available: u32,
}

impl TokenPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            available: capacity,
        }
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take one card if any is left
    pub fn take(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    pub fn give_back(&mut self) {
        debug_assert!(self.available < self.capacity, "token returned to a full pool");
        self.available = (self.available + 1).min(self.capacity);
    }
}

/// Cell of every step of `route`
pub fn route_cells(project: &ProjectConfig, route: &Route) -> Vec<CellId> {
    route
        .steps
        .iter()
        .map(|step| {
            project
                .group_cell(&step.machine_group_id)
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

/// POLCA loop a job must hold a card for while working at `index`: its cell
/// paired with the next different cell on the route
pub fn loop_at(cells: &[CellId], index: usize) -> Option<CellPair> {
    let here = cells.get(index)?;
    cells[index..]
        .iter()
        .find(|cell| *cell != here)
        .map(|next| CellPair::new(here.clone(), next.clone()))
}

/// Every distinct loop a route passes through
pub fn route_loops(cells: &[CellId]) -> Vec<CellPair> {
    let mut loops = Vec::new();
    for index in 0..cells.len() {
        if let Some(pair) = loop_at(cells, index) {
            if !loops.contains(&pair) {
                loops.push(pair);
            }
        }
    }
    loops
}

/// A backlog entry waiting for admission
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseCandidate {
    pub job_id: JobId,
    pub route_id: RouteId,
    /// POLCA loop the job enters with its first cell, if the route spans cells
    pub entry_pair: Option<CellPair>,
}

#[derive(Debug, Clone)]
pub struct ReleaseController {
    policy: ReleasePolicy,
    caps: BTreeMap<RouteId, u32>,
    route_tokens: BTreeMap<RouteId, TokenPool>,
    cards: BTreeMap<CellPair, TokenPool>,
    wip: BTreeMap<RouteId, u32>,
}

impl ReleaseController {
    /// Build the pools. `caps` and `token_counts` are per route (CONWIP),
    /// `cards` per cell pair (POLCA); pools irrelevant to the policy stay empty.
    pub fn new(
        policy: ReleasePolicy,
        caps: BTreeMap<RouteId, u32>,
        token_counts: &BTreeMap<RouteId, u32>,
        cards: BTreeMap<CellPair, u32>,
    ) -> SimResult<Self> {
        let mut route_tokens = BTreeMap::new();
        if policy == ReleasePolicy::Conwip {
            for (route, cap) in &caps {
                if *cap == 0 {
                    return Err(SimError::config(format!("wip cap of route '{}' must be >= 1", route)));
                }
                let tokens = token_counts.get(route).copied().unwrap_or(*cap);
                if tokens == 0 {
                    return Err(SimError::config(format!("token count of route '{}' must be >= 1", route)));
                }
                route_tokens.insert(route.clone(), TokenPool::new(tokens));
            }
        }
        let mut card_pools = BTreeMap::new();
        if policy == ReleasePolicy::Polca {
            for (pair, count) in cards {
                if count == 0 {
                    return Err(SimError::config(format!("POLCA loop {} needs at least one card", pair)));
                }
                card_pools.insert(pair, TokenPool::new(count));
            }
        }
        Ok(Self {
            policy,
            caps,
            route_tokens,
            cards: card_pools,
            wip: BTreeMap::new(),
        })
    }

    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    /// Cards currently available to admit work on `route`.
    ///
    /// CONWIP reports the route pool; POLCA reports the pool of the loop the
    /// route is entered through, which the caller supplies. `None` means the
    /// route is not token controlled.
    pub fn token_balance(&self, route: &str, entry_pair: Option<&CellPair>) -> Option<u32> {
        match self.policy {
            ReleasePolicy::Push => None,
            ReleasePolicy::Conwip => self.route_tokens.get(route).map(TokenPool::available),
            ReleasePolicy::Polca => entry_pair
                .and_then(|pair| self.cards.get(pair))
                .map(TokenPool::available),
        }
    }

    pub fn card_balance(&self, pair: &CellPair) -> Option<u32> {
        self.cards.get(pair).map(TokenPool::available)
    }

    pub fn wip(&self, route: &str) -> u32 {
        self.wip.get(route).copied().unwrap_or(0)
    }

    pub fn wip_by_route(&self) -> &BTreeMap<RouteId, u32> {
        &self.wip
    }

    pub fn wip_cap(&self, route: &str) -> Option<u32> {
        match self.policy {
            ReleasePolicy::Conwip => self.caps.get(route).copied(),
            _ => None,
        }
    }

    pub fn tokens_available(&self, route: &str) -> bool {
        self.route_tokens
            .get(route)
            .map_or(false, |pool| pool.available() > 0)
    }

    /// Admit backlog jobs in order while the policy allows.
    ///
    /// Admitted candidates are removed from `backlog` and returned; blocked
    /// ones keep their place. Under POLCA the entry card is taken here and is
    /// owned by the job from then on.
    pub fn release_jobs(&mut self, now: SimTime, backlog: &mut Vec<ReleaseCandidate>) -> Vec<JobId> {
        let mut released = Vec::new();
        let mut waiting = Vec::with_capacity(backlog.len());

        for candidate in backlog.drain(..) {
            let admitted = match self.policy {
                ReleasePolicy::Push => true,
                ReleasePolicy::Conwip => {
                    let route = candidate.route_id.as_str();
                    let under_cap = self
                        .caps
                        .get(route)
                        .map_or(false, |cap| self.wip(route) < *cap);
                    if under_cap && self.tokens_available(route) {
                        if let Some(pool) = self.route_tokens.get_mut(route) {
                            pool.take();
                        }
                        true
                    } else {
                        false
                    }
                }
                ReleasePolicy::Polca => match &candidate.entry_pair {
                    Some(pair) => self.acquire_card(pair),
                    None => true,
                },
            };

            if admitted {
                *self.wip.entry(candidate.route_id.clone()).or_insert(0) += 1;
                debug!("t={:.3}: released {} on route {}", now, candidate.job_id, candidate.route_id);
                released.push(candidate.job_id);
            } else {
                waiting.push(candidate);
            }
        }

        *backlog = waiting;
        released
    }

    /// A job finished or was scrapped: return its route token
    pub fn on_job_exit(&mut self, route: &str) {
        if let Some(count) = self.wip.get_mut(route) {
            *count = count.saturating_sub(1);
        }
        if self.policy == ReleasePolicy::Conwip {
            if let Some(pool) = self.route_tokens.get_mut(route) {
                pool.give_back();
            }
        }
    }

    /// Take a POLCA card for `pair`; loops without a pool are uncontrolled
    pub fn acquire_card(&mut self, pair: &CellPair) -> bool {
        match self.cards.get_mut(pair) {
            Some(pool) => pool.take(),
            None => self.policy != ReleasePolicy::Polca,
        }
    }

    /// Return a POLCA card once the job leaves the downstream cell
    pub fn return_card(&mut self, pair: &CellPair) {
        if let Some(pool) = self.cards.get_mut(pair) {
            pool.give_back();
        }
    }
}
