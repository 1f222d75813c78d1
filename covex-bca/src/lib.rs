//! Branch Control Array (BCA): the shared-memory coordination channel
//! between the explorer and the stubs it fault-injects into.
//!
//! Layout (packed, little-endian), matching `spec.md` §3:
//!
//! | offset | size  | field   |
//! |-------:|------:|---------|
//! | 0      | 2     | `count` |
//! | 2      | `L-2` | `map`   |
//!
//! There is no locking: between iterations the explorer is the sole writer,
//! during an iteration only the (single-threaded) test process's stubs
//! write `count` and read `map`. See `spec.md` §5.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapOptions, MmapRaw};
use thiserror::Error;

/// Default BCA region size in bytes, matching the original `LARMIER_LEN`.
pub const DEFAULT_LEN: usize = 4096;

/// Environment variable the driver sets and stubs read to find the BCA.
pub const BCA_ENV_VAR: &str = "COVEX_BCA";

const COUNT_SIZE: usize = std::mem::size_of::<u16>();

#[derive(Debug, Error)]
pub enum BcaError {
    #[error("invalid shared-memory name (contains NUL?)")]
    InvalidName,
    #[error("region must be larger than the count field ({COUNT_SIZE} bytes)")]
    RegionTooSmall,
    #[error("{action} failed: {source}")]
    Resource {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl BcaError {
    fn resource(action: &'static str, source: io::Error) -> Self {
        Self::Resource { action, source }
    }
}

/// Outcome of consulting the schedule for the next intercept point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `map[count] == 0`: this call must fail.
    Fail,
    /// `map[count] == 1`: this call must succeed (forward to the real fn).
    Succeed,
    /// `count` has reached the map's capacity; the BCA cannot record more
    /// intercepts. Non-goal per `spec.md` §1 — callers should forward to
    /// the real function rather than injecting a fault here.
    CapacityExceeded,
}

/// A mapped Branch Control Array, either created (owning, will `shm_unlink`
/// on drop) or attached (borrowing an existing region).
pub struct Bca {
    mmap: MmapRaw,
    len: usize,
    name: String,
    owner: bool,
}

// SAFETY: the mapping is backed by shared memory that is deliberately
// mutated without Rust-level synchronization; callers uphold the
// single-writer-at-a-time discipline documented in `spec.md` §5.
unsafe impl Send for Bca {}

impl Bca {
    /// Create a new, zero-filled BCA under the process-unique name.
    /// Fails if the region already exists, cannot be truncated, or cannot
    /// be mapped.
    pub fn create(name: &str, len: usize) -> Result<Self, BcaError> {
        if len <= COUNT_SIZE {
            return Err(BcaError::RegionTooSmall);
        }
        let cname = CString::new(name).map_err(|_| BcaError::InvalidName)?;

        // SAFETY: standard POSIX shm_open/ftruncate sequence; `fd` is
        // checked for failure before any further use.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(BcaError::resource("shm_open", io::Error::last_os_error()));
        }

        // SAFETY: `fd` was just validated above.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let source = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(BcaError::resource("ftruncate", source));
        }

        // SAFETY: `fd` is a valid, open file descriptor we just created and
        // sized; ownership transfers into `File`, which will close it once
        // the mapping below has been established (mmap keeps its own
        // reference to the underlying object).
        let file = unsafe { File::from_raw_fd(fd) };
        let mmap = unsafe { MmapOptions::new().len(len).map_raw(&file) }
            .map_err(|source| BcaError::resource("mmap", source))?;

        // SAFETY: `mmap` is MAP_SHARED and sized `len`; zero-filling it is
        // the explorer's job before the first iteration (spec.md §4.4).
        unsafe {
            std::ptr::write_bytes(mmap.as_mut_ptr(), 0, len);
        }

        Ok(Self {
            mmap,
            len,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Attach to an existing BCA by name. Returns `None` (not an error) if
    /// the region does not exist or cannot be mapped, per `spec.md` §4.1:
    /// stubs treat unavailability as "no fault injection requested".
    pub fn attach(name: &str, len: usize) -> Option<Self> {
        let cname = CString::new(name).ok()?;

        // SAFETY: opening an existing named shared-memory region read/write.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return None;
        }

        // SAFETY: `fd` validated above; see `create` for the same pattern.
        let file = unsafe { File::from_raw_fd(fd) };
        let mmap = unsafe { MmapOptions::new().len(len).map_raw(&file) }.ok()?;

        Some(Self {
            mmap,
            len,
            name: name.to_string(),
            owner: false,
        })
    }

    /// The region's shared-memory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of schedule bytes available (`L - 2`).
    pub fn capacity(&self) -> usize {
        self.len - COUNT_SIZE
    }

    /// Current `count`: number of intercepts observed so far this iteration.
    pub fn count(&self) -> u16 {
        let mut buf = [0u8; COUNT_SIZE];
        // SAFETY: the mapping is at least COUNT_SIZE bytes (enforced in
        // `create`/by construction of `len`).
        unsafe { std::ptr::copy_nonoverlapping(self.mmap.as_ptr(), buf.as_mut_ptr(), COUNT_SIZE) };
        u16::from_le_bytes(buf)
    }

    /// Overwrite `count`. Used by the explorer to reset between iterations.
    pub fn set_count(&self, value: u16) {
        let bytes = value.to_le_bytes();
        // SAFETY: see `count`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mmap.as_mut_ptr(), COUNT_SIZE) };
    }

    /// Read `map[index]` without mutating `count`. Returns `None` if
    /// `index` is outside the map's capacity.
    pub fn schedule_bit(&self, index: u16) -> Option<u8> {
        let idx = index as usize;
        if idx >= self.capacity() {
            return None;
        }
        // SAFETY: bounds-checked above.
        Some(unsafe { *self.mmap.as_ptr().add(COUNT_SIZE + idx) })
    }

    /// Write `map[index] = value`.
    pub fn set_map_byte(&self, index: u16, value: u8) {
        let idx = index as usize;
        assert!(idx < self.capacity(), "map index out of bounds");
        // SAFETY: bounds-checked above.
        unsafe { *self.mmap.as_mut_ptr().add(COUNT_SIZE + idx) = value };
    }

    /// Zero `map[from ..]`, used when advancing the schedule (spec.md §4.4).
    pub fn reset_suffix_from(&self, from: u16) {
        let idx = from as usize;
        let cap = self.capacity();
        assert!(idx <= cap, "suffix start out of bounds");
        // SAFETY: bounds-checked above.
        unsafe { std::ptr::write_bytes(self.mmap.as_mut_ptr().add(COUNT_SIZE + idx), 0, cap - idx) };
    }

    /// Copy out `map[0 .. k]`, the decision prefix observed by the just-run
    /// iteration. Used by the explorer to compute the next schedule and for
    /// debug dumps (spec.md §4.4's `bca_dump`).
    pub fn map_prefix(&self, k: u16) -> Vec<u8> {
        let k = (k as usize).min(self.capacity());
        let mut out = vec![0u8; k];
        // SAFETY: `k` clamped to capacity above.
        unsafe { std::ptr::copy_nonoverlapping(self.mmap.as_ptr().add(COUNT_SIZE), out.as_mut_ptr(), k) };
        out
    }

    /// The stub-side protocol step: consult `map[count]`, then increment
    /// `count`, in that order (spec.md §4.2 step 5 — deciding before
    /// incrementing is what lets the explorer reason about the observed
    /// count after the fact).
    pub fn next_decision(&self) -> Decision {
        let count = self.count();
        match self.schedule_bit(count) {
            None => Decision::CapacityExceeded,
            Some(0) => {
                self.set_count(count + 1);
                Decision::Fail
            }
            Some(_) => {
                self.set_count(count + 1);
                Decision::Succeed
            }
        }
    }
}

impl Drop for Bca {
    fn drop(&mut self) {
        if self.owner {
            if let Ok(cname) = CString::new(self.name.as_str()) {
                // SAFETY: unlinking a name we created; errors are
                // unrecoverable at drop time and intentionally ignored.
                unsafe {
                    libc::shm_unlink(cname.as_ptr());
                }
            }
        }
    }
}

/// Derive the process-unique BCA name the explorer uses, matching the
/// original `larmier_%u` convention (`examples/original_source/larmier.c`).
pub fn default_name(pid: u32) -> String {
    format!("covex_{pid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn unique_name(tag: &str) -> String {
        format!("covex_test_{tag}_{}", std::process::id())
    }

    #[test]
    #[serial]
    fn create_then_attach_shares_state() {
        let name = unique_name("create_attach");
        let creator = Bca::create(&name, DEFAULT_LEN).expect("create");
        assert_eq!(creator.count(), 0);
        assert_eq!(creator.capacity(), DEFAULT_LEN - COUNT_SIZE);

        creator.set_map_byte(0, 1);
        creator.set_count(0);

        let attached = Bca::attach(&name, DEFAULT_LEN).expect("attach");
        assert_eq!(attached.schedule_bit(0), Some(1));
        assert_eq!(attached.count(), 0);
    }

    #[test]
    #[serial]
    fn attach_to_missing_region_is_none() {
        let name = unique_name("missing");
        assert!(Bca::attach(&name, DEFAULT_LEN).is_none());
    }

    #[test]
    #[serial]
    fn next_decision_reads_then_increments() {
        let name = unique_name("decision");
        let bca = Bca::create(&name, DEFAULT_LEN).expect("create");
        // map is all-zero initially: first call must fail.
        assert_eq!(bca.next_decision(), Decision::Fail);
        assert_eq!(bca.count(), 1);

        bca.set_map_byte(1, 1);
        assert_eq!(bca.next_decision(), Decision::Succeed);
        assert_eq!(bca.count(), 2);
    }

    #[test]
    #[serial]
    fn reset_suffix_zeroes_tail_only() {
        let name = unique_name("reset_suffix");
        let bca = Bca::create(&name, DEFAULT_LEN).expect("create");
        bca.set_map_byte(0, 1);
        bca.set_map_byte(1, 1);
        bca.set_map_byte(2, 1);

        bca.reset_suffix_from(1);

        assert_eq!(bca.schedule_bit(0), Some(1));
        assert_eq!(bca.schedule_bit(1), Some(0));
        assert_eq!(bca.schedule_bit(2), Some(0));
    }

    #[test]
    #[serial]
    fn create_twice_with_same_name_fails() {
        let name = unique_name("dup");
        let _first = Bca::create(&name, DEFAULT_LEN).expect("create");
        let second = Bca::create(&name, DEFAULT_LEN);
        assert!(second.is_err());
    }

    #[test]
    fn region_too_small_is_rejected() {
        let name = unique_name("too_small");
        let err = Bca::create(&name, 1).unwrap_err();
        assert!(matches!(err, BcaError::RegionTooSmall));
    }

    #[test]
    fn default_name_includes_pid() {
        let name = default_name(1234);
        assert_eq!(name, "covex_1234");
    }
}
