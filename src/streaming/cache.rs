//! Four-tier cache with policy-driven eviction
//!
//! Entries live in one of four tiers, each with a byte quota carved out of
//! the total capacity. When a tier or the global threshold would overflow,
//! entries are evicted from the non-critical tiers (temporary first, then
//! nearby, then active) according to the configured [`EvictionPolicy`].
//! Critical entries are never evicted.
//!
//! All reads and writes go through a single mutex per cache.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::Error;
use crate::core::types::Result;

/// Access intervals kept per entry for the adaptive policy
const INTERVAL_HISTORY: usize = 10;

/// Order in which tiers give up entries under global pressure
const EVICTION_ORDER: [CacheTier; 3] = [CacheTier::Temporary, CacheTier::Nearby, CacheTier::Active];

/// Retention class of a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Never evicted
    Critical,
    /// Current viewport
    Active,
    /// Likely needed soon
    Nearby,
    /// Evicted first
    Temporary,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [CacheTier::Critical, CacheTier::Active, CacheTier::Nearby, CacheTier::Temporary];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Critical => "critical",
            CacheTier::Active => "active",
            CacheTier::Nearby => "nearby",
            CacheTier::Temporary => "temporary",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How eviction victims are chosen within a tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently inserted or read
    Lru,
    /// Lowest access count
    Lfu,
    /// Largest size per access
    SizeAware,
    /// Weighted blend of age, frequency, size and access irregularity
    #[default]
    Adaptive,
}

impl EvictionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::SizeAware => "size_aware",
            EvictionPolicy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "size_aware" => Ok(EvictionPolicy::SizeAware),
            "adaptive" => Ok(EvictionPolicy::Adaptive),
            _ => Err(Error::UnknownPolicy(s.to_string())),
        }
    }
}

/// Fraction of total capacity reserved per tier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierQuotas {
    pub critical: f64,
    pub active: f64,
    pub nearby: f64,
    pub temporary: f64,
}

impl Default for TierQuotas {
    fn default() -> Self {
        Self {
            critical: 0.30,
            active: 0.40,
            nearby: 0.20,
            temporary: 0.10,
        }
    }
}

impl TierQuotas {
    pub fn get(&self, tier: CacheTier) -> f64 {
        match tier {
            CacheTier::Critical => self.critical,
            CacheTier::Active => self.active,
            CacheTier::Nearby => self.nearby,
            CacheTier::Temporary => self.temporary,
        }
    }
}

/// Weights of the adaptive eviction score
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveWeights {
    pub age: f64,
    pub frequency: f64,
    pub size: f64,
    pub irregularity: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            age: 0.3,
            frequency: 0.4,
            size: 0.2,
            irregularity: 0.1,
        }
    }
}

/// Configuration for [`SmartCache`]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
    /// Fraction of capacity above which non-critical tiers are drained
    pub global_threshold: f64,
    pub policy: EvictionPolicy,
    pub quotas: TierQuotas,
    pub adaptive: AdaptiveWeights,
    /// TTL applied when `put` is given none
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 50 * 1024 * 1024,
            global_threshold: 0.8,
            policy: EvictionPolicy::default(),
            quotas: TierQuotas::default(),
            adaptive: AdaptiveWeights::default(),
            default_ttl_secs: None,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(Error::Config("cache capacity must be positive".into()));
        }
        if !(self.global_threshold > 0.0 && self.global_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "global threshold must be in (0, 1], got {}",
                self.global_threshold
            )));
        }
        let quotas = CacheTier::ALL.map(|t| self.quotas.get(t));
        if quotas.iter().any(|q| !(0.0..=1.0).contains(q)) || quotas.iter().sum::<f64>() > 1.0 + 1e-9 {
            return Err(Error::Config(format!("invalid tier quotas {:?}", self.quotas)));
        }
        let w = &self.adaptive;
        if [w.age, w.frequency, w.size, w.irregularity].iter().any(|x| *x < 0.0 || !x.is_finite()) {
            return Err(Error::Config("adaptive weights must be non-negative".into()));
        }
        Ok(())
    }
}

/// Usage snapshot for one tier
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: CacheTier,
    pub entries: usize,
    pub size_bytes: usize,
    pub size_limit_bytes: usize,
    pub utilization_percent: f64,
}

/// Usage snapshot for the whole cache
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStatus {
    pub policy: EvictionPolicy,
    pub capacity_bytes: usize,
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub tiers: Vec<TierStatus>,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
}

impl CacheStatus {
    pub fn tier(&self, tier: CacheTier) -> Option<&TierStatus> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

struct CacheEntry<V> {
    value: V,
    tier: CacheTier,
    size_bytes: usize,
    access_count: u64,
    created_at: Instant,
    last_access: Instant,
    /// Logical clock of the last insert or read
    last_tick: u64,
    expires_at: Option<Instant>,
    /// Recent gaps between accesses, in ticks
    intervals: VecDeque<f64>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }

    fn cost_per_access(&self) -> f64 {
        self.size_bytes as f64 / self.access_count.max(1) as f64
    }

    /// Coefficient of variation of access intervals, clamped to [0, 1]
    fn irregularity(&self) -> f64 {
        if self.intervals.len() < 2 {
            return 0.0;
        }
        let n = self.intervals.len() as f64;
        let mean = self.intervals.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = self.intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (variance.sqrt() / mean).min(1.0)
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejections: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tier_bytes: [usize; 4],
    tick: u64,
    counters: Counters,
}

impl<V> CacheState<V> {
    fn total_bytes(&self) -> usize {
        self.tier_bytes.iter().sum()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn detach(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        let slot = &mut self.tier_bytes[entry.tier.index()];
        *slot = slot.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn attach(&mut self, key: String, entry: CacheEntry<V>) {
        self.tier_bytes[entry.tier.index()] += entry.size_bytes;
        self.entries.insert(key, entry);
    }
}

/// Hierarchical byte-bounded cache.
///
/// Values are cloned out on `get`; wrap large payloads in `Arc`.
pub struct SmartCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone + Serialize> SmartCache<V> {
    /// Create an empty cache.
    ///
    /// # Arguments
    /// * `config` - Capacity, tier quotas, threshold and eviction policy
    ///
    /// # Returns
    /// The cache, or `Error::Config` when the configuration is invalid
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Cache ready: {} bytes, policy {}, threshold {:.0}%",
            config.capacity_bytes,
            config.policy,
            config.global_threshold * 100.0
        );
        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tier_bytes: [0; 4],
                tick: 0,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Byte quota of a tier
    pub fn tier_limit(&self, tier: CacheTier) -> usize {
        (self.config.capacity_bytes as f64 * self.config.quotas.get(tier)) as usize
    }

    fn threshold_bytes(&self) -> usize {
        (self.config.capacity_bytes as f64 * self.config.global_threshold) as usize
    }

    /// Insert or replace `key`.
    ///
    /// A key already pinned in [`CacheTier::Critical`] stays there whatever
    /// tier the replacement asks for.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `value` - Value to store; its size is estimated from its JSON form
    /// * `tier` - Requested tier
    /// * `ttl` - Time to live; falls back to `default_ttl_secs`
    ///
    /// # Returns
    /// False if the entry could not be admitted. A rejected replacement
    /// leaves the previous value in place.
    pub fn put(&self, key: impl Into<String>, value: V, tier: CacheTier, ttl: Option<Duration>) -> bool {
        let key = key.into();
        let size_bytes = estimate_size(&value);
        let now = Instant::now();
        let ttl = ttl.or(self.config.default_ttl_secs.map(Duration::from_secs));

        let mut state = self.state.lock();
        let previous = state.detach(&key);
        let tier = match &previous {
            Some(entry) if entry.tier == CacheTier::Critical && tier != CacheTier::Critical => {
                log::debug!("{} stays pinned in the critical tier", key);
                CacheTier::Critical
            }
            _ => tier,
        };

        if !self.make_room(&mut state, tier, size_bytes) {
            state.counters.rejections += 1;
            log::debug!("Rejected {} ({} bytes) for tier {}", key, size_bytes, tier);
            if let Some(previous) = previous {
                state.attach(key, previous);
            }
            return false;
        }

        let tick = state.next_tick();
        state.attach(
            key,
            CacheEntry {
                value,
                tier,
                size_bytes,
                access_count: 0,
                created_at: now,
                last_access: now,
                last_tick: tick,
                expires_at: ttl.map(|d| now + d),
                intervals: VecDeque::new(),
            },
        );
        true
    }

    /// Evict until `size_bytes` more fits the tier quota and the global
    /// threshold. False if the hard limits still cannot be met.
    fn make_room(&self, state: &mut CacheState<V>, tier: CacheTier, size_bytes: usize) -> bool {
        let tier_limit = self.tier_limit(tier);
        if size_bytes > tier_limit {
            return false;
        }

        while state.tier_bytes[tier.index()] + size_bytes > tier_limit {
            if tier == CacheTier::Critical {
                return false;
            }
            match self.pick_victim(state, tier) {
                Some(victim) => self.evict(state, &victim),
                None => return false,
            }
        }

        let threshold = self.threshold_bytes();
        'global: while state.total_bytes() + size_bytes > threshold {
            for candidate_tier in EVICTION_ORDER {
                if let Some(victim) = self.pick_victim(state, candidate_tier) {
                    self.evict(state, &victim);
                    continue 'global;
                }
            }
            break;
        }

        state.total_bytes() + size_bytes <= self.config.capacity_bytes
    }

    fn evict(&self, state: &mut CacheState<V>, key: &str) {
        if let Some(entry) = state.detach(key) {
            state.counters.evictions += 1;
            log::debug!("Evicted {} from {} ({} bytes)", key, entry.tier, entry.size_bytes);
        }
    }

    /// Choose the entry of `tier` to evict under the configured policy
    fn pick_victim(&self, state: &CacheState<V>, tier: CacheTier) -> Option<String> {
        if tier == CacheTier::Critical {
            return None;
        }
        let candidates: Vec<(&String, &CacheEntry<V>)> =
            state.entries.iter().filter(|(_, e)| e.tier == tier).collect();
        if candidates.is_empty() {
            return None;
        }

        let victim = match self.config.policy {
            EvictionPolicy::Lru => candidates.iter().min_by_key(|(_, e)| e.last_tick),
            EvictionPolicy::Lfu => candidates.iter().min_by_key(|(_, e)| (e.access_count, e.last_tick)),
            EvictionPolicy::SizeAware => candidates.iter().max_by(|(_, a), (_, b)| {
                a.cost_per_access()
                    .total_cmp(&b.cost_per_access())
                    .then(b.last_tick.cmp(&a.last_tick))
            }),
            EvictionPolicy::Adaptive => {
                let max_age = candidates
                    .iter()
                    .map(|(_, e)| state.tick.saturating_sub(e.last_tick))
                    .max()
                    .unwrap_or(0)
                    .max(1) as f64;
                let max_size = candidates.iter().map(|(_, e)| e.size_bytes).max().unwrap_or(0).max(1) as f64;
                let score = |e: &CacheEntry<V>| self.retention(e, state.tick, max_age, max_size);

                candidates.iter().min_by(|(_, a), (_, b)| {
                    score(*a)
                        .total_cmp(&score(*b))
                        .then(a.last_tick.cmp(&b.last_tick))
                })
            }
        };
        victim.map(|(key, _)| (*key).clone())
    }

    /// Adaptive retention score; the lowest scoring entry is evicted.
    ///
    /// `1 - pressure`, where pressure blends normalized idle age, inverse
    /// access frequency, relative size and access-interval irregularity.
    fn retention(&self, entry: &CacheEntry<V>, tick: u64, max_age: f64, max_size: f64) -> f64 {
        let w = &self.config.adaptive;
        let age = tick.saturating_sub(entry.last_tick) as f64 / max_age;
        let inverse_frequency = 1.0 / (1.0 + entry.access_count as f64);
        let size = entry.size_bytes as f64 / max_size;
        let pressure = w.age * age
            + w.frequency * inverse_frequency
            + w.size * size
            + w.irregularity * entry.irregularity();
        1.0 - pressure
    }

    /// Read `key`, optionally requiring it to live in `tier`.
    ///
    /// Expired entries are dropped and reported as misses.
    ///
    /// # Arguments
    /// * `key` - Entry key
    /// * `tier` - When set, an entry in any other tier counts as a miss
    ///
    /// # Returns
    /// A clone of the stored value on a hit
    pub fn get(&self, key: &str, tier: Option<CacheTier>) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let status = match state.entries.get(key) {
            None => None,
            Some(entry) if tier.is_some_and(|t| t != entry.tier) => None,
            Some(entry) => Some(entry.is_expired(now)),
        };

        match status {
            None => {
                state.counters.misses += 1;
                None
            }
            Some(true) => {
                state.detach(key);
                state.counters.expirations += 1;
                state.counters.misses += 1;
                None
            }
            Some(false) => {
                let tick = state.next_tick();
                state.counters.hits += 1;
                let entry = state.entries.get_mut(key)?;
                entry.intervals.push_back(tick.saturating_sub(entry.last_tick) as f64);
                if entry.intervals.len() > INTERVAL_HISTORY {
                    entry.intervals.pop_front();
                }
                entry.last_tick = tick;
                entry.last_access = now;
                entry.access_count += 1;
                Some(entry.value.clone())
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().detach(key).is_some()
    }

    /// Drop every entry of a non-critical tier.
    ///
    /// # Arguments
    /// * `tier` - Tier to empty
    ///
    /// # Returns
    /// Number of entries dropped, or `Error::CriticalTierEviction`
    pub fn evict_tier(&self, tier: CacheTier) -> Result<usize> {
        if tier == CacheTier::Critical {
            return Err(Error::CriticalTierEviction);
        }
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.tier == tier)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.detach(key);
        }
        state.counters.evictions += keys.len() as u64;
        if !keys.is_empty() {
            log::info!("Evicted {} entries from tier {}", keys.len(), tier);
        }
        Ok(keys.len())
    }

    /// Remove every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.detach(key);
        }
        state.counters.expirations += expired.len() as u64;
        expired.len()
    }

    /// True if a live entry exists; does not count as an access
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    pub fn tier_of(&self, key: &str) -> Option<CacheTier> {
        self.state.lock().entries.get(key).map(|e| e.tier)
    }

    /// Seconds since the entry was written
    pub fn age_of(&self, key: &str) -> Option<f64> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| e.created_at.elapsed().as_secs_f64())
    }

    /// Seconds since the entry was last read or written
    pub fn idle_time_of(&self, key: &str) -> Option<f64> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| e.last_access.elapsed().as_secs_f64())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.tier_bytes = [0; 4];
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.state.lock();
        let tiers = CacheTier::ALL
            .iter()
            .map(|&tier| {
                let size_bytes = state.tier_bytes[tier.index()];
                let size_limit_bytes = self.tier_limit(tier);
                TierStatus {
                    tier,
                    entries: state.entries.values().filter(|e| e.tier == tier).count(),
                    size_bytes,
                    size_limit_bytes,
                    utilization_percent: if size_limit_bytes > 0 {
                        size_bytes as f64 / size_limit_bytes as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        let c = &state.counters;
        let lookups = c.hits + c.misses;
        CacheStatus {
            policy: self.config.policy,
            capacity_bytes: self.config.capacity_bytes,
            total_entries: state.entries.len(),
            total_size_bytes: state.total_bytes(),
            tiers,
            hits: c.hits,
            misses: c.misses,
            hit_rate: if lookups > 0 { c.hits as f64 / lookups as f64 } else { 0.0 },
            evictions: c.evictions,
            expirations: c.expirations,
            rejections: c.rejections,
        }
    }
}

/// Approximate serialized size of a value (compact JSON length)
pub fn estimate_size<V: Serialize>(value: &V) -> usize {
    serde_json::to_vec(value)
        .map(|v| v.len())
        .unwrap_or(std::mem::size_of::<V>())
}
