//! Process hardening for a secret holder.
//!
//! Unseal shares, the root key and decrypted secrets live in this process's
//! memory. [`harden`] keeps them out of core dumps (`RLIMIT_CORE = 0`) and,
//! unless told otherwise, out of swap (`mlockall`). On non-Unix targets both
//! steps are no-ops.

/// A hardening step that did not take effect.
#[derive(Debug, thiserror::Error)]
pub enum HardeningError {
    #[error("setrlimit(RLIMIT_CORE, 0) failed: {0}")]
    CoreDumps(std::io::Error),

    #[error("mlockall(MCL_CURRENT | MCL_FUTURE) failed: {0} (set SECMAN_DISABLE_MLOCK=true for dev)")]
    LockMemory(std::io::Error),
}

/// Apply every hardening step and return the ones that failed.
///
/// Failures are not fatal: a development machine without `CAP_IPC_LOCK`
/// should still be able to run the server.
pub fn harden(disable_mlock: bool) -> Vec<HardeningError> {
    let mut failures = Vec::new();
    if let Err(e) = disable_core_dumps() {
        failures.push(e);
    }
    if !disable_mlock {
        if let Err(e) = lock_memory() {
            failures.push(e);
        }
    }
    failures
}

#[cfg(unix)]
fn disable_core_dumps() -> Result<(), HardeningError> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, initialized `rlimit` that outlives the call.
    #[allow(unsafe_code)]
    let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if result == 0 {
        Ok(())
    } else {
        Err(HardeningError::CoreDumps(std::io::Error::last_os_error()))
    }
}

#[cfg(unix)]
fn lock_memory() -> Result<(), HardeningError> {
    // SAFETY: `mlockall` takes only flags and touches no caller memory.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if result == 0 {
        Ok(())
    } else {
        Err(HardeningError::LockMemory(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn disable_core_dumps() -> Result<(), HardeningError> {
    Ok(())
}

#[cfg(not(unix))]
fn lock_memory() -> Result<(), HardeningError> {
    Ok(())
}
