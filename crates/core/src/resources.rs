//! Resource arithmetic for hosts, procs and local assignments.
//!
//! Pure logic, no database access. The ledger itself lives in the store
//! (conditional `UPDATE`s on `hosts` and `host_local`); these helpers compute
//! what to ask it for and how to interpret what it returned.
//!
//! Units:
//! - cores are *core units*, [`CORE_UNITS_PER_CORE`] units to a whole core;
//! - memory and GPU memory are kilobytes;
//! - GPUs are whole devices.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Core units making up one whole core.
pub const CORE_UNITS_PER_CORE: i32 = 100;

/// Default idle memory a host must keep per offered core. Below this the
/// host's idle cores are reported as stranded rather than offered.
pub const DEFAULT_MIN_MEMORY_PER_CORE_KB: i64 = 256 * 1024;

// ---------------------------------------------------------------------------
// ResourceSlice
// ---------------------------------------------------------------------------

/// A quantity of every resource the ledger tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlice {
    pub cores: i32,
    pub memory: i64,
    pub gpus: i32,
    pub gpu_memory: i64,
}

impl ResourceSlice {
    pub const ZERO: ResourceSlice = ResourceSlice {
        cores: 0,
        memory: 0,
        gpus: 0,
        gpu_memory: 0,
    };

    pub fn new(cores: i32, memory: i64, gpus: i32, gpu_memory: i64) -> Self {
        Self {
            cores,
            memory,
            gpus,
            gpu_memory,
        }
    }

    /// True when every dimension of `self` is available in `available`.
    pub fn fits_within(&self, available: &ResourceSlice) -> bool {
        self.cores <= available.cores
            && self.memory <= available.memory
            && self.gpus <= available.gpus
            && self.gpu_memory <= available.gpu_memory
    }

    /// Subtract `other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &ResourceSlice) -> Option<ResourceSlice> {
        let out = ResourceSlice {
            cores: self.cores - other.cores,
            memory: self.memory - other.memory,
            gpus: self.gpus - other.gpus,
            gpu_memory: self.gpu_memory - other.gpu_memory,
        };
        (!out.has_negative()).then_some(out)
    }

    /// Component-wise sum.
    pub fn plus(&self, other: &ResourceSlice) -> ResourceSlice {
        ResourceSlice {
            cores: self.cores + other.cores,
            memory: self.memory + other.memory,
            gpus: self.gpus + other.gpus,
            gpu_memory: self.gpu_memory + other.gpu_memory,
        }
    }

    pub fn has_negative(&self) -> bool {
        self.cores < 0 || self.memory < 0 || self.gpus < 0 || self.gpu_memory < 0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for ResourceSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.2} cores / {} KB / {} gpus / {} KB gpu",
            self.cores as f64 / CORE_UNITS_PER_CORE as f64,
            self.memory,
            self.gpus,
            self.gpu_memory
        )
    }
}

// ---------------------------------------------------------------------------
// Conservation
// ---------------------------------------------------------------------------

/// Check `idle + sum(reserved) == total` for every dimension.
pub fn is_conserved<'a>(
    total: &ResourceSlice,
    idle: &ResourceSlice,
    reservations: impl IntoIterator<Item = &'a ResourceSlice>,
) -> bool {
    let committed = reservations
        .into_iter()
        .fold(ResourceSlice::ZERO, |acc, r| acc.plus(r));
    idle.plus(&committed) == *total
}

// ---------------------------------------------------------------------------
// Offerable capacity
// ---------------------------------------------------------------------------

/// Round a core-unit amount down to whole cores.
pub fn whole_core_units(core_units: i32) -> i32 {
    if core_units <= 0 {
        return 0;
    }
    core_units - core_units % CORE_UNITS_PER_CORE
}

/// What a host can offer to the matcher after stranded capacity is excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub offerable: ResourceSlice,
    /// Idle core units that cannot be offered.
    pub stranded_cores: i32,
}

/// Split idle capacity into offerable and stranded parts.
///
/// Fractional cores below one whole core are stranded. If the host's idle
/// memory cannot back even one core (`min_memory_per_core`), all idle cores
/// are stranded.
pub fn offerable(idle: &ResourceSlice, min_memory_per_core: i64) -> Offer {
    let mut cores = whole_core_units(idle.cores);
    if cores > 0 && idle.memory < min_memory_per_core {
        cores = 0;
    }
    Offer {
        offerable: ResourceSlice {
            cores,
            ..*idle
        },
        stranded_cores: idle.cores.max(0) - cores,
    }
}

/// Cores to reserve for a layer asking for `min_cores`.
///
/// Non-threadable layers are capped to one whole core.
pub fn cores_for_layer(min_cores: i32, threadable: bool) -> i32 {
    if threadable {
        min_cores
    } else {
        min_cores.min(CORE_UNITS_PER_CORE)
    }
}

// ---------------------------------------------------------------------------
// Local assignment pools
// ---------------------------------------------------------------------------

/// Outcome of resizing one dimension of a local assignment pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolResize {
    pub max: i64,
    pub idle: i64,
    /// Committed capacity now exceeding the pool's max. Reported, not reclaimed.
    pub oversubscribed: i64,
}

/// Resize a pool from `old_max` to `new_max`.
///
/// The idle amount moves by the same delta as the max, so growing a pool
/// never steals committed capacity; shrinking it clamps idle at zero and
/// reports the excess.
pub fn resize_pool(old_max: i64, old_idle: i64, new_max: i64) -> PoolResize {
    let raw = old_idle + (new_max - old_max);
    PoolResize {
        max: new_max,
        idle: raw.max(0),
        oversubscribed: (-raw).max(0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
