//! Privilege drop (§6: "if `setuid_on_start`, drop to `uid` before
//! entering `main`").

use std::io;

/// Calls `setuid(2)` if `config.setuid_on_start`; a no-op otherwise.
///
/// Must run before any listener socket is bound, matching the original's
/// intent of shedding root as early as possible once the privileged bind
/// is no longer needed. Non-Unix targets have no such syscall and treat
/// this as unconditionally a no-op.
pub fn drop_if_configured(setuid_on_start: bool, uid: u32) -> io::Result<()> {
    if !setuid_on_start {
        return Ok(());
    }
    imp::setuid(uid)
}

#[cfg(unix)]
mod imp {
    use std::io;

    pub(super) fn setuid(uid: u32) -> io::Result<()> {
        // SAFETY: `setuid` takes a plain uid_t and has no aliasing or
        // lifetime requirements; a non-zero return is reported via errno.
        let rc = unsafe { libc::setuid(uid) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!(uid, "dropped privileges");
        Ok(())
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;

    pub(super) fn setuid(_uid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "setuid_on_start is not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_is_always_a_no_op() {
        drop_if_configured(false, 0).unwrap();
    }
}
