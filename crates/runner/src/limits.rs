//! Best-effort process resource limit adjustment

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tracing::debug;

/// Adjusts a process resource limit. Failures are reported, never fatal.
pub trait LimitAdjuster: Send + Sync {
    /// Apply the limit, returning the value now in effect
    fn try_apply(&self) -> Result<u64, String>;
}

/// Raises the soft open file descriptor limit toward a ceiling, capped by
/// the hard limit
#[derive(Debug, Clone, Copy)]
pub struct FileDescriptorLimit {
    target: u64,
}

impl FileDescriptorLimit {
    pub fn new(target: u64) -> Self {
        Self { target }
    }
}

impl LimitAdjuster for FileDescriptorLimit {
    fn try_apply(&self) -> Result<u64, String> {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)
            .map_err(|e| format!("failed to read file descriptor limit: {}", e))?;

        let wanted = self.target.min(hard);
        if wanted <= soft {
            return Ok(soft);
        }

        setrlimit(Resource::RLIMIT_NOFILE, wanted, hard).map_err(|e| {
            format!(
                "failed to set file descriptor limit to {} (hard {}): {}",
                wanted, hard, e
            )
        })?;
        debug!("File descriptor limit set to {} (was {})", wanted, soft);
        Ok(wanted)
    }
}
