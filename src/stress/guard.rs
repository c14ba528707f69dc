//! Pre-flight memory and disk headroom checks.
//!
//! Memory checks hand out a [`MemoryReservation`] that stays alive for as long
//! as the chunk buffer it was taken for. Reservations still held by other
//! buffers (the previous chunk being persisted, or another scheme's chunk)
//! count against the headroom of the next check.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use sysinfo::System;
#[cfg(not(unix))]
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::constants::MB_AS_F64;
#[cfg(not(unix))]
use crate::stress::error::IoResultExt;
use crate::stress::error::{Resource, StressError, StressResult};

/// Source of system resource readings.
pub trait ResourceProbe: Send + Sync {
    fn available_memory_bytes(&self) -> StressResult<u64>;
    fn available_disk_bytes(&self, path: &Path) -> StressResult<u64>;
}

/// Reads memory through `sysinfo` and disk space through `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl ResourceProbe for SysinfoProbe {
    fn available_memory_bytes(&self) -> StressResult<u64> {
        let mut system = System::new();
        system.refresh_memory();
        Ok(system.available_memory())
    }

    /// Free space available to unprivileged writers on the filesystem that
    /// holds `path` itself, tmpfs included.
    #[cfg(unix)]
    fn available_disk_bytes(&self, path: &Path) -> StressResult<u64> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            StressError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains a NUL byte"),
            )
        })?;

        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(StressError::io(path, std::io::Error::last_os_error()));
            }
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(not(unix))]
    fn available_disk_bytes(&self, path: &Path) -> StressResult<u64> {
        let target = path.canonicalize().with_path(path)?;
        let disks = Disks::new_with_refreshed_list();

        // Deepest mount point containing the path wins.
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                StressError::io(
                    &target,
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no mounted filesystem contains this path",
                    ),
                )
            })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuardStats {
    pub memory_checks: u64,
    pub disk_checks: u64,
    pub rejections: u64,
    pub reserved_bytes: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    stats: GuardStats,
}

#[derive(Clone)]
pub struct ResourceGuard {
    probe: Arc<dyn ResourceProbe>,
    state: Arc<Mutex<GuardState>>,
}

impl ResourceGuard {
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            state: Arc::new(Mutex::new(GuardState::default())),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SysinfoProbe))
    }

    /// Fails with `ResourceExhausted` unless available memory covers
    /// `target_count * bytes_per_id`, everything already reserved, and
    /// `guard_mb` on top.
    pub fn check_memory(
        &self,
        target_count: u64,
        bytes_per_id: u64,
        guard_mb: f64,
    ) -> StressResult<MemoryReservation> {
        let required_bytes = target_count.saturating_mul(bytes_per_id);

        // The lock spans probe and decision so concurrent producers never
        // both claim the same headroom.
        let mut state = self.state.lock();
        state.stats.memory_checks += 1;

        if required_bytes == 0 && guard_mb <= 0.0 {
            return Ok(MemoryReservation {
                bytes: 0,
                state: None,
            });
        }

        let available_bytes = self.probe.available_memory_bytes()?;
        let needed_mb =
            (required_bytes.saturating_add(state.stats.reserved_bytes)) as f64 / MB_AS_F64;
        let threshold_mb = needed_mb + guard_mb;
        let available_mb = available_bytes as f64 / MB_AS_F64;

        if available_mb < threshold_mb {
            state.stats.rejections += 1;
            warn!(
                "memory guard rejected chunk: need {:.2} MB, available {:.2} MB",
                threshold_mb, available_mb
            );
            return Err(StressError::ResourceExhausted {
                resource: Resource::Memory,
                required_mb: threshold_mb,
                available_mb,
            });
        }

        state.stats.reserved_bytes = state.stats.reserved_bytes.saturating_add(required_bytes);
        debug!(
            "memory guard reserved {} bytes ({:.2} MB available)",
            required_bytes, available_mb
        );

        Ok(MemoryReservation {
            bytes: required_bytes,
            state: Some(Arc::clone(&self.state)),
        })
    }

    /// Fails with `ResourceExhausted` unless the filesystem holding `path` has
    /// at least `estimated_total_bytes * safety_factor` free.
    pub fn check_disk(
        &self,
        path: &Path,
        estimated_total_bytes: u64,
        safety_factor: f64,
    ) -> StressResult<()> {
        let mut state = self.state.lock();
        state.stats.disk_checks += 1;

        let free_bytes = self.probe.available_disk_bytes(path)?;
        let required = estimated_total_bytes as f64 * safety_factor;

        if (free_bytes as f64) < required {
            state.stats.rejections += 1;
            return Err(StressError::ResourceExhausted {
                resource: Resource::Disk,
                required_mb: required / MB_AS_F64,
                available_mb: free_bytes as f64 / MB_AS_F64,
            });
        }

        debug!(
            "disk guard passed for {}: need {:.2} MB, free {:.2} MB",
            path.display(),
            required / MB_AS_F64,
            free_bytes as f64 / MB_AS_F64
        );
        Ok(())
    }

    pub fn stats(&self) -> GuardStats {
        self.state.lock().stats
    }
}

/// Headroom claimed for one in-flight chunk buffer; released on drop.
#[must_use = "dropping the reservation releases the memory it accounts for"]
pub struct MemoryReservation {
    bytes: u64,
    state: Option<Arc<Mutex<GuardState>>>,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let mut state = state.lock();
            state.stats.reserved_bytes = state.stats.reserved_bytes.saturating_sub(self.bytes);
        }
    }
}
