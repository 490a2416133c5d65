//! Device enumerator backed by the udev database.
//!
//! We do not link against libudev; the daemon only needs two things from
//! udev: whether a network device has finished rule processing (its entry
//! exists in `/run/udev/data`), and a stable per-device seed for IPv4LL
//! address selection. Inside a container there is no udev, so callers skip
//! the initialization wait entirely.

use std::fs;
use std::path::{Path, PathBuf};

const UDEV_DATA_DIR: &str = "/run/udev/data";

/// Resolves interface indices to udev device records.
#[derive(Debug, Clone)]
pub struct DeviceEnumerator {
    data_dir: PathBuf,
}

impl DeviceEnumerator {
    pub fn new() -> Self {
        Self {
            data_dir: PathBuf::from(UDEV_DATA_DIR),
        }
    }

    /// Enumerator over an alternate database root (tests).
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Look up the device record for a network interface. Network devices
    /// are keyed `n<ifindex>` in the udev database.
    pub fn device(&self, ifindex: u64) -> Option<Device> {
        let db_path = self.data_dir.join(format!("n{ifindex}"));
        if !db_path.exists() {
            return None;
        }
        Some(Device { ifindex, db_path })
    }
}

impl Default for DeviceEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A udev device record for one interface.
#[derive(Debug, Clone)]
pub struct Device {
    pub ifindex: u64,
    db_path: PathBuf,
}

impl Device {
    /// Whether udev has finished processing the device. The database entry
    /// is only written once rules ran, so existence is the signal.
    pub fn is_initialized(&self) -> bool {
        self.db_path.exists()
    }

    /// Stable 8-byte seed for this device, fed to the IPv4LL client so the
    /// same interface prefers the same link-local address across runs.
    pub fn seed(&self) -> [u8; 8] {
        let content = fs::read(&self.db_path).unwrap_or_default();
        let mut h = fnv1a(self.db_path.as_os_str().as_encoded_bytes());
        h = h.wrapping_mul(0x100000001b3) ^ fnv1a(&content);
        h.to_be_bytes()
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Whether we are running inside a container (no udev to wait for).
pub fn detect_container() -> bool {
    if Path::new("/run/systemd/container").exists() {
        return true;
    }
    match fs::read("/proc/1/environ") {
        Ok(environ) => environ
            .split(|&b| b == 0)
            .any(|kv| kv.starts_with(b"container=")),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
