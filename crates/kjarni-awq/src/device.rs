//! Device placement and residency bookkeeping for block streaming.
//!
//! Blocks live on the host until the pipeline makes one resident on the
//! compute device it was assigned to. At most one block is resident at a
//! time: every resident block is evicted before the next one is admitted, so
//! freeing memory always happens before the next reservation.
//!
//! Residency is accounting only. All tensors are host `ndarray` buffers and
//! nothing is copied when a block becomes resident or is evicted; a device is
//! a memory budget that the pipeline must stay within, so a run that fits
//! here fits on real devices with the same capacities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AwqError, AwqResult};

/// Where a block's parameters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Host,
    Compute(usize),
}

impl Device {
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Compute(i) => write!(f, "compute:{}", i),
        }
    }
}

/// Memory capacity and current use of each compute device.
///
/// An empty pool means everything runs on the host without accounting.
#[derive(Debug, Clone, Default)]
pub struct DevicePool {
    capacities: Vec<u64>,
    used: Vec<u64>,
}

impl DevicePool {
    pub fn new(capacities: Vec<u64>) -> Self {
        let used = vec![0; capacities.len()];
        Self { capacities, used }
    }

    pub fn host_only() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.capacities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capacities.is_empty()
    }

    pub fn capacities(&self) -> &[u64] {
        &self.capacities
    }

    pub fn available(&self, device: Device) -> u64 {
        match device {
            Device::Host => u64::MAX,
            Device::Compute(i) => self
                .capacities
                .get(i)
                .map_or(0, |c| c.saturating_sub(self.used[i])),
        }
    }

    /// Reserves `bytes` on `device` for block `block`.
    pub fn reserve(&mut self, device: Device, bytes: u64, block: usize) -> AwqResult<()> {
        let Device::Compute(i) = device else {
            return Ok(());
        };
        let available = self.available(device);
        if bytes > available {
            return Err(AwqError::ResourceExhausted {
                block,
                device: i,
                required: bytes,
                available,
            });
        }
        self.used[i] += bytes;
        Ok(())
    }

    pub fn release(&mut self, device: Device, bytes: u64) {
        if let Device::Compute(i) = device {
            if let Some(used) = self.used.get_mut(i) {
                *used = used.saturating_sub(bytes);
            }
        }
    }
}

/// Places blocks on devices contiguously, in proportion to capacity.
///
/// Block `i` goes to the first device whose cumulative share of total
/// capacity exceeds the cumulative midpoint of block `i` in total block bytes.
/// Without devices every block stays on the host.
pub fn assign_blocks(block_bytes: &[u64], capacities: &[u64]) -> Vec<Device> {
    if capacities.is_empty() {
        return vec![Device::Host; block_bytes.len()];
    }
    let total_cap: f64 = capacities.iter().map(|&c| c as f64).sum();
    let total_bytes: f64 = block_bytes.iter().map(|&b| b as f64).sum();
    if total_cap <= 0.0 || total_bytes <= 0.0 {
        return vec![Device::Compute(0); block_bytes.len()];
    }

    let mut bounds = Vec::with_capacity(capacities.len());
    let mut acc = 0.0;
    for &c in capacities {
        acc += c as f64 / total_cap;
        bounds.push(acc);
    }

    let mut placement = Vec::with_capacity(block_bytes.len());
    let mut prefix = 0.0;
    for &b in block_bytes {
        let mid = (prefix + b as f64 / 2.0) / total_bytes;
        prefix += b as f64;
        let device = bounds
            .iter()
            .position(|&bound| mid < bound)
            .unwrap_or(capacities.len() - 1);
        placement.push(Device::Compute(device));
    }
    placement
}

/// Tracks which block is resident and what it reserved.
#[derive(Debug)]
pub struct Residency {
    pool: DevicePool,
    placement: Vec<Device>,
    resident: Vec<(usize, Device, u64)>,
    transient: Vec<(Device, u64)>,
}

impl Residency {
    pub fn new(pool: DevicePool, placement: Vec<Device>) -> Self {
        Self {
            pool,
            placement,
            resident: Vec::new(),
            transient: Vec::new(),
        }
    }

    /// Places `block_bytes` over `pool` with [`assign_blocks`].
    pub fn plan(pool: DevicePool, block_bytes: &[u64]) -> Self {
        let placement = assign_blocks(block_bytes, pool.capacities());
        for (i, d) in placement.iter().enumerate() {
            log::debug!("block {} assigned to {}", i, d);
        }
        Self::new(pool, placement)
    }

    pub fn device_of(&self, block: usize) -> Device {
        self.placement.get(block).copied().unwrap_or_default()
    }

    pub fn resident_blocks(&self) -> Vec<usize> {
        self.resident.iter().map(|(b, _, _)| *b).collect()
    }

    /// Evicts whatever is resident, then admits `block` with its parameter
    /// and activation footprint.
    pub fn make_resident(&mut self, block: usize, bytes: u64) -> AwqResult<Device> {
        self.evict_all();
        let device = self.device_of(block);
        self.pool.reserve(device, bytes, block)?;
        self.resident.push((block, device, bytes));
        log::debug!("block {} resident on {} ({} bytes)", block, device, bytes);
        Ok(device)
    }

    pub fn evict(&mut self, block: usize) {
        let pool = &mut self.pool;
        self.resident.retain(|&(b, device, bytes)| {
            if b == block {
                pool.release(device, bytes);
                log::debug!("block {} evicted from {}", b, device);
                false
            } else {
                true
            }
        });
    }

    pub fn evict_all(&mut self) {
        for (block, device, bytes) in self.resident.drain(..) {
            self.pool.release(device, bytes);
            log::debug!("block {} evicted from {}", block, device);
        }
    }

    /// Reserves memory not owned by a block, such as the embeddings during
    /// the prefix forward.
    pub fn reserve_transient(&mut self, device: Device, bytes: u64, block: usize) -> AwqResult<()> {
        self.pool.reserve(device, bytes, block)?;
        self.transient.push((device, bytes));
        Ok(())
    }

    pub fn release_transient(&mut self) {
        for (device, bytes) in self.transient.drain(..) {
            self.pool.release(device, bytes);
        }
    }

    pub fn available(&self, device: Device) -> u64 {
        self.pool.available(device)
    }
}
