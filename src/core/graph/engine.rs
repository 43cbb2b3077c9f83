// Copyright (c) 2026 Hashtree
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Social graph engine: follows/mutes with distances and overmute
//! detection.
//!
//! Forward and reverse indices are mirrored on every mutation. Distance 0
//! contains exactly the root; unreachable users report 1000. Event
//! rejection is silent: stale timestamps, far-future timestamps,
//! overmuted authors, and unknown authors (when disallowed) are dropped.

use crate::core::graph::ids::{Uid, UniqueIds};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Distance reported for unreachable users.
pub const UNREACHABLE_DISTANCE: u32 = 1000;
/// Events more than this far in the future are dropped (seconds).
pub const MAX_FUTURE_DRIFT_SECS: u64 = 600;
/// Follow-list event kind.
pub const FOLLOW_LIST_KIND: u64 = 3;
/// Mute-list event kind.
pub const MUTE_LIST_KIND: u64 = 10_000;
/// Deepest distance swept by the overmute pruner.
pub const PRUNE_MAX_DISTANCE: u32 = 20;

/// A follow- or mute-list event.
#[derive(Clone, Debug)]
pub struct GraphEvent {
    /// Author identity (hex, 32 bytes).
    pub pubkey: String,
    /// Author wall-clock seconds since the UNIX epoch.
    pub created_at: u64,
    /// Event kind (3 follows, 10000 mutes).
    pub kind: u64,
    /// Tag rows; `["p", "<hex>"]` rows carry targets.
    pub tags: Vec<Vec<String>>,
}

impl GraphEvent {
    /// Extract p-tag targets.
    pub fn targets(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| t.len() >= 2 && t[0] == "p")
            .map(|t| t[1].clone())
            .collect()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// In-memory directed follows/mutes graph.
#[derive(Debug, PartialEq)]
pub struct SocialGraph {
    root: Uid,
    pub(crate) ids: UniqueIds,
    pub(crate) followed_by_user: HashMap<Uid, BTreeSet<Uid>>,
    pub(crate) followers_by_user: HashMap<Uid, BTreeSet<Uid>>,
    pub(crate) muted_by_user: HashMap<Uid, BTreeSet<Uid>>,
    pub(crate) user_muted_by: HashMap<Uid, BTreeSet<Uid>>,
    pub(crate) follow_list_created_at: HashMap<Uid, u64>,
    pub(crate) mute_list_created_at: HashMap<Uid, u64>,
    follow_distance: HashMap<Uid, u32>,
    users_by_distance: BTreeMap<u32, BTreeSet<Uid>>,
}

impl SocialGraph {
    /// Graph rooted at `root_hex`. A malformed root yields an empty-keyed
    /// placeholder at uid 0.
    pub fn new(root_hex: &str) -> Self {
        let mut ids = UniqueIds::new();
        let root = ids.id_for_hex(root_hex).unwrap_or_else(|| ids.id_for_key([0u8; 32]));
        let mut graph = Self {
            root,
            ids,
            followed_by_user: HashMap::new(),
            followers_by_user: HashMap::new(),
            muted_by_user: HashMap::new(),
            user_muted_by: HashMap::new(),
            follow_list_created_at: HashMap::new(),
            mute_list_created_at: HashMap::new(),
            follow_distance: HashMap::new(),
            users_by_distance: BTreeMap::new(),
        };
        graph.set_distance(root, 0);
        graph
    }

    /// Root identity as hex.
    pub fn root_hex(&self) -> String {
        self.ids.hex(self.root).unwrap_or_default()
    }

    pub(crate) fn root_uid(&self) -> Uid {
        self.root
    }

    // ---- event handling -------------------------------------------------

    /// Apply a follow- or mute-list event. Rejections are silent; the
    /// return value exists for tests.
    pub fn handle_event(
        &mut self,
        event: &GraphEvent,
        allow_unknown_author: bool,
        overmute_threshold: u32,
    ) -> bool {
        if event.kind != FOLLOW_LIST_KIND && event.kind != MUTE_LIST_KIND {
            return false;
        }
        if event.created_at > now_secs() + MAX_FUTURE_DRIFT_SECS {
            return false;
        }
        let known = self.ids.get_hex(&event.pubkey).is_some();
        if !known && !allow_unknown_author {
            return false;
        }
        if known && self.is_overmuted(&event.pubkey, overmute_threshold) {
            return false;
        }
        let Some(author) = self.ids.id_for_hex(&event.pubkey) else {
            return false;
        };
        let stored = if event.kind == FOLLOW_LIST_KIND {
            self.follow_list_created_at.get(&author)
        } else {
            self.mute_list_created_at.get(&author)
        };
        if let Some(&stored) = stored {
            if event.created_at <= stored {
                return false;
            }
        }
        let targets: BTreeSet<Uid> = event
            .targets()
            .iter()
            .filter_map(|hex_key| self.ids.id_for_hex(hex_key))
            .filter(|uid| *uid != author)
            .collect();
        if event.kind == FOLLOW_LIST_KIND {
            self.set_follow_list(author, targets, event.created_at);
        } else {
            self.set_mute_list(author, targets, event.created_at);
        }
        true
    }

    pub(crate) fn set_follow_list(&mut self, author: Uid, targets: BTreeSet<Uid>, created_at: u64) {
        let current = self.followed_by_user.get(&author).cloned().unwrap_or_default();
        let added: Vec<Uid> = targets.difference(&current).copied().collect();
        let removed: Vec<Uid> = current.difference(&targets).copied().collect();
        for target in added {
            self.add_follow_uid(author, target);
        }
        let mut need_recalc = false;
        for target in removed {
            need_recalc |= self.remove_follow_edge(author, target);
        }
        self.follow_list_created_at.insert(author, created_at);
        if need_recalc {
            self.recalculate_sync();
        }
    }

    pub(crate) fn set_mute_list(&mut self, author: Uid, targets: BTreeSet<Uid>, created_at: u64) {
        let current = self.muted_by_user.get(&author).cloned().unwrap_or_default();
        for target in targets.difference(&current) {
            self.add_mute_uid(author, *target);
        }
        for target in current.difference(&targets) {
            self.remove_mute_uid(author, *target);
        }
        self.mute_list_created_at.insert(author, created_at);
    }

    // ---- incremental edge maintenance -----------------------------------

    /// Add one follow edge, maintaining mirrors and distances.
    pub fn add_follow(&mut self, follower_hex: &str, followee_hex: &str) {
        let Some(follower) = self.ids.id_for_hex(follower_hex) else {
            return;
        };
        let Some(followee) = self.ids.id_for_hex(followee_hex) else {
            return;
        };
        if follower != followee {
            self.add_follow_uid(follower, followee);
        }
    }

    /// Remove one follow edge, maintaining mirrors and distances.
    pub fn remove_follow(&mut self, follower_hex: &str, followee_hex: &str) {
        let Some(follower) = self.ids.get_hex(follower_hex) else {
            return;
        };
        let Some(followee) = self.ids.get_hex(followee_hex) else {
            return;
        };
        if self.remove_follow_edge(follower, followee) {
            self.recalculate_sync();
        }
    }

    /// Add one mute edge.
    pub fn add_mute(&mut self, muter_hex: &str, muted_hex: &str) {
        let Some(muter) = self.ids.id_for_hex(muter_hex) else {
            return;
        };
        let Some(muted) = self.ids.id_for_hex(muted_hex) else {
            return;
        };
        if muter != muted {
            self.add_mute_uid(muter, muted);
        }
    }

    /// Remove one mute edge.
    pub fn remove_mute(&mut self, muter_hex: &str, muted_hex: &str) {
        let Some(muter) = self.ids.get_hex(muter_hex) else {
            return;
        };
        let Some(muted) = self.ids.get_hex(muted_hex) else {
            return;
        };
        self.remove_mute_uid(muter, muted);
    }

    fn add_follow_uid(&mut self, follower: Uid, followee: Uid) {
        self.followed_by_user.entry(follower).or_default().insert(followee);
        self.followers_by_user.entry(followee).or_default().insert(follower);
        // Relax: a new edge can only shorten distances downstream.
        let through = self.distance_uid(follower).saturating_add(1);
        if through < self.distance_uid(followee) {
            self.set_distance(followee, through);
            let mut frontier = VecDeque::from([followee]);
            while let Some(user) = frontier.pop_front() {
                let next = self.distance_uid(user).saturating_add(1);
                let targets: Vec<Uid> = self
                    .followed_by_user
                    .get(&user)
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default();
                for target in targets {
                    if next < self.distance_uid(target) {
                        self.set_distance(target, next);
                        frontier.push_back(target);
                    }
                }
            }
        }
    }

    /// Returns true when the removal may have lengthened a shortest path.
    fn remove_follow_edge(&mut self, follower: Uid, followee: Uid) -> bool {
        let removed = self
            .followed_by_user
            .get_mut(&follower)
            .map(|s| s.remove(&followee))
            .unwrap_or(false);
        if !removed {
            return false;
        }
        if let Some(s) = self.followers_by_user.get_mut(&followee) {
            s.remove(&follower);
        }
        self.distance_uid(followee) == self.distance_uid(follower).saturating_add(1)
    }

    fn add_mute_uid(&mut self, muter: Uid, muted: Uid) {
        self.muted_by_user.entry(muter).or_default().insert(muted);
        self.user_muted_by.entry(muted).or_default().insert(muter);
    }

    fn remove_mute_uid(&mut self, muter: Uid, muted: Uid) {
        if let Some(s) = self.muted_by_user.get_mut(&muter) {
            s.remove(&muted);
        }
        if let Some(s) = self.user_muted_by.get_mut(&muted) {
            s.remove(&muter);
        }
    }

    // ---- queries --------------------------------------------------------

    /// Whether `a` follows `b`.
    pub fn is_following(&self, a_hex: &str, b_hex: &str) -> bool {
        let (Some(a), Some(b)) = (self.ids.get_hex(a_hex), self.ids.get_hex(b_hex)) else {
            return false;
        };
        self.followed_by_user.get(&a).map(|s| s.contains(&b)).unwrap_or(false)
    }

    /// Whether `a` mutes `b`.
    pub fn is_muting(&self, a_hex: &str, b_hex: &str) -> bool {
        let (Some(a), Some(b)) = (self.ids.get_hex(a_hex), self.ids.get_hex(b_hex)) else {
            return false;
        };
        self.muted_by_user.get(&a).map(|s| s.contains(&b)).unwrap_or(false)
    }

    /// Users `user` follows.
    pub fn get_followed_by_user(&self, user_hex: &str) -> BTreeSet<String> {
        self.hex_set(self.ids.get_hex(user_hex).and_then(|u| self.followed_by_user.get(&u)))
    }

    /// Users following `user`.
    pub fn get_followers_by_user(&self, user_hex: &str) -> BTreeSet<String> {
        self.hex_set(self.ids.get_hex(user_hex).and_then(|u| self.followers_by_user.get(&u)))
    }

    /// Users `user` mutes.
    pub fn get_muted_by_user(&self, user_hex: &str) -> BTreeSet<String> {
        self.hex_set(self.ids.get_hex(user_hex).and_then(|u| self.muted_by_user.get(&u)))
    }

    /// Users muting `user`.
    pub fn get_user_muted_by(&self, user_hex: &str) -> BTreeSet<String> {
        self.hex_set(self.ids.get_hex(user_hex).and_then(|u| self.user_muted_by.get(&u)))
    }

    /// O(1) via the reverse index.
    pub fn has_followers(&self, user_hex: &str) -> bool {
        self.ids
            .get_hex(user_hex)
            .and_then(|u| self.followers_by_user.get(&u))
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Minimum hop count from root; 1000 when unreachable.
    pub fn get_follow_distance(&self, user_hex: &str) -> u32 {
        self.ids
            .get_hex(user_hex)
            .map(|u| self.distance_uid(u))
            .unwrap_or(UNREACHABLE_DISTANCE)
    }

    /// All users at distance `d`.
    pub fn get_users_by_follow_distance(&self, d: u32) -> BTreeSet<String> {
        self.hex_set(self.users_by_distance.get(&d))
    }

    /// Number of known identities.
    pub fn user_count(&self) -> usize {
        self.ids.len()
    }

    fn hex_set(&self, set: Option<&BTreeSet<Uid>>) -> BTreeSet<String> {
        set.map(|s| s.iter().filter_map(|u| self.ids.hex(*u)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn distance_uid(&self, uid: Uid) -> u32 {
        self.follow_distance.get(&uid).copied().unwrap_or(UNREACHABLE_DISTANCE)
    }

    fn set_distance(&mut self, uid: Uid, d: u32) {
        if let Some(old) = self.follow_distance.insert(uid, d) {
            if let Some(set) = self.users_by_distance.get_mut(&old) {
                set.remove(&uid);
            }
        }
        self.users_by_distance.entry(d).or_default().insert(uid);
    }

    // ---- overmute -------------------------------------------------------

    /// Overmute check: at the numerically smallest distance where the user
    /// has any follower or muter, muters outweigh followers by more than
    /// `threshold`. The root is never overmuted; a user muted by the root
    /// always is.
    pub fn is_overmuted(&self, user_hex: &str, threshold: u32) -> bool {
        let Some(uid) = self.ids.get_hex(user_hex) else {
            return false;
        };
        self.is_overmuted_uid(uid, threshold)
    }

    fn is_overmuted_uid(&self, uid: Uid, threshold: u32) -> bool {
        if uid == self.root {
            return false;
        }
        if self
            .muted_by_user
            .get(&self.root)
            .map(|s| s.contains(&uid))
            .unwrap_or(false)
        {
            return true;
        }
        let mut followers_at: BTreeMap<u32, u64> = BTreeMap::new();
        let mut muters_at: BTreeMap<u32, u64> = BTreeMap::new();
        if let Some(followers) = self.followers_by_user.get(&uid) {
            for f in followers {
                *followers_at.entry(self.distance_uid(*f)).or_default() += 1;
            }
        }
        if let Some(muters) = self.user_muted_by.get(&uid) {
            for m in muters {
                *muters_at.entry(self.distance_uid(*m)).or_default() += 1;
            }
        }
        let closest = match (followers_at.keys().next(), muters_at.keys().next()) {
            (Some(f), Some(m)) => *f.min(m),
            (Some(f), None) => *f,
            (None, Some(m)) => *m,
            (None, None) => return false,
        };
        let followers = followers_at.get(&closest).copied().unwrap_or(0);
        let muters = muters_at.get(&closest).copied().unwrap_or(0);
        muters * u64::from(threshold) > followers
    }

    /// Sweep distances 1..=20 in ascending order, removing overmuted users
    /// in one batched pass per distance. Returns the removal count.
    pub fn prune_overmuted_users(&mut self, threshold: u32) -> usize {
        let mut removed = 0usize;
        for d in 1..=PRUNE_MAX_DISTANCE {
            let Some(at_distance) = self.users_by_distance.get(&d) else {
                continue;
            };
            let victims: Vec<Uid> = at_distance
                .iter()
                .copied()
                .filter(|uid| self.is_overmuted_uid(*uid, threshold))
                .collect();
            for uid in &victims {
                self.remove_user(*uid);
            }
            removed += victims.len();
        }
        if removed > 0 {
            self.recalculate_sync();
        }
        removed
    }

    /// Remove muted users that nobody follows. Returns the removal count.
    pub fn remove_muted_not_followed_users(&mut self) -> usize {
        // Phase 1: users with at least one follower.
        let followed: BTreeSet<Uid> = self
            .followers_by_user
            .iter()
            .filter(|(_, followers)| !followers.is_empty())
            .map(|(uid, _)| *uid)
            .collect();
        // Phase 2: muted users absent from it.
        let mut victims: BTreeSet<Uid> = BTreeSet::new();
        for muted in self.muted_by_user.values() {
            for uid in muted {
                if !followed.contains(uid) && *uid != self.root {
                    victims.insert(*uid);
                }
            }
        }
        // Phase 3: batched removal.
        let count = victims.len();
        for uid in victims {
            self.remove_user(uid);
        }
        if count > 0 {
            self.recalculate_sync();
        }
        count
    }

    fn remove_user(&mut self, uid: Uid) {
        if let Some(followed) = self.followed_by_user.remove(&uid) {
            for target in followed {
                if let Some(s) = self.followers_by_user.get_mut(&target) {
                    s.remove(&uid);
                }
            }
        }
        if let Some(followers) = self.followers_by_user.remove(&uid) {
            for follower in followers {
                if let Some(s) = self.followed_by_user.get_mut(&follower) {
                    s.remove(&uid);
                }
            }
        }
        if let Some(muted) = self.muted_by_user.remove(&uid) {
            for target in muted {
                if let Some(s) = self.user_muted_by.get_mut(&target) {
                    s.remove(&uid);
                }
            }
        }
        if let Some(muters) = self.user_muted_by.remove(&uid) {
            for muter in muters {
                if let Some(s) = self.muted_by_user.get_mut(&muter) {
                    s.remove(&uid);
                }
            }
        }
        self.follow_list_created_at.remove(&uid);
        self.mute_list_created_at.remove(&uid);
        if let Some(d) = self.follow_distance.remove(&uid) {
            if let Some(set) = self.users_by_distance.get_mut(&d) {
                set.remove(&uid);
            }
        }
    }

    // ---- merge and recalculation ----------------------------------------

    /// Per-user last-writer-wins merge of another graph, then a distance
    /// recalculation.
    pub fn merge(&mut self, other: &SocialGraph) {
        for (other_uid, other_ts) in &other.follow_list_created_at {
            let Some(hex_key) = other.ids.hex(*other_uid) else {
                continue;
            };
            let Some(author) = self.ids.id_for_hex(&hex_key) else {
                continue;
            };
            let ours = self.follow_list_created_at.get(&author).copied().unwrap_or(0);
            if *other_ts > ours {
                let targets: BTreeSet<Uid> = other
                    .followed_by_user
                    .get(other_uid)
                    .map(|s| {
                        s.iter()
                            .filter_map(|t| other.ids.hex(*t))
                            .filter_map(|hex_key| self.ids.id_for_hex(&hex_key))
                            .collect()
                    })
                    .unwrap_or_default();
                self.set_follow_list(author, targets, *other_ts);
            }
        }
        for (other_uid, other_ts) in &other.mute_list_created_at {
            let Some(hex_key) = other.ids.hex(*other_uid) else {
                continue;
            };
            let Some(author) = self.ids.id_for_hex(&hex_key) else {
                continue;
            };
            let ours = self.mute_list_created_at.get(&author).copied().unwrap_or(0);
            if *other_ts > ours {
                let targets: BTreeSet<Uid> = other
                    .muted_by_user
                    .get(other_uid)
                    .map(|s| {
                        s.iter()
                            .filter_map(|t| other.ids.hex(*t))
                            .filter_map(|hex_key| self.ids.id_for_hex(&hex_key))
                            .collect()
                    })
                    .unwrap_or_default();
                self.set_mute_list(author, targets, *other_ts);
            }
        }
        self.recalculate_sync();
    }

    /// Change the root and recalculate distances.
    pub fn set_root_sync(&mut self, new_root_hex: &str) {
        if let Some(uid) = self.ids.id_for_hex(new_root_hex) {
            self.root = uid;
            self.recalculate_sync();
        }
    }

    /// Full BFS from root (blocking variant).
    pub fn recalculate_sync(&mut self) {
        let mut frontier = self.begin_recalc();
        while self.step_recalc(&mut frontier, usize::MAX) > 0 {}
    }

    pub(crate) fn begin_recalc(&mut self) -> VecDeque<Uid> {
        self.follow_distance.clear();
        self.users_by_distance.clear();
        self.set_distance(self.root, 0);
        VecDeque::from([self.root])
    }

    /// Process up to `batch` frontier nodes; returns how many were taken.
    pub(crate) fn step_recalc(&mut self, frontier: &mut VecDeque<Uid>, batch: usize) -> usize {
        let mut processed = 0;
        while processed < batch {
            let Some(user) = frontier.pop_front() else {
                break;
            };
            processed += 1;
            let next = self.distance_uid(user).saturating_add(1);
            let targets: Vec<Uid> = self
                .followed_by_user
                .get(&user)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for target in targets {
                if next < self.distance_uid(target) {
                    self.set_distance(target, next);
                    frontier.push_back(target);
                }
            }
        }
        processed
    }
}

struct RecalcControl {
    running: bool,
    rerun: bool,
}

/// Shared async handle: time-sliced recalculation with continuation
/// chaining so re-entrant runs cannot corrupt the frontier.
#[derive(Clone)]
pub struct SharedSocialGraph {
    graph: Arc<Mutex<SocialGraph>>,
    control: Arc<Mutex<RecalcControl>>,
}

impl SharedSocialGraph {
    /// Shared graph rooted at `root_hex`.
    pub fn new(root_hex: &str) -> Self {
        Self {
            graph: Arc::new(Mutex::new(SocialGraph::new(root_hex))),
            control: Arc::new(Mutex::new(RecalcControl {
                running: false,
                rerun: false,
            })),
        }
    }

    /// Run a closure against the underlying graph.
    pub fn with<R>(&self, f: impl FnOnce(&mut SocialGraph) -> R) -> R {
        let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut graph)
    }

    /// Time-sliced BFS from root. A call made while a run is in flight
    /// chains one more run after it and returns.
    pub async fn recalculate_follow_distances(&self, batch_size: usize, log_every: usize) {
        {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            if control.running {
                control.rerun = true;
                return;
            }
            control.running = true;
        }
        let batch = batch_size.max(1);
        loop {
            let mut frontier = {
                let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
                graph.begin_recalc()
            };
            let mut processed_total = 0usize;
            loop {
                let processed = {
                    let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
                    graph.step_recalc(&mut frontier, batch)
                };
                if processed == 0 {
                    break;
                }
                processed_total += processed;
                if log_every > 0 && processed_total % log_every < processed {
                    debug!(processed = processed_total, "recalculating follow distances");
                }
                tokio::task::yield_now().await;
            }
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            if control.rerun {
                control.rerun = false;
                continue;
            }
            control.running = false;
            break;
        }
    }

    /// Change the root; if a recalculation is in flight the rerun is
    /// chained after it.
    pub async fn set_root(&self, new_root_hex: &str) {
        self.with(|g| {
            if let Some(uid) = g.ids.id_for_hex(new_root_hex) {
                g.root = uid;
            }
        });
        self.recalculate_follow_distances(500, 0).await;
    }
}
