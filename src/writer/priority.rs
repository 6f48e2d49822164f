use std::io;

use nix::errno::Errno;

use crate::logger::thread_id;

/// Nice value of the calling thread.
pub fn current_priority() -> io::Result<i32> {
    let tid = thread_id();
    Errno::clear();
    // SAFETY: plain syscall wrapper; -1 is a valid result so errno decides.
    let prio = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
    if prio == -1 && Errno::last() != Errno::UnknownErrno {
        return Err(io::Error::last_os_error());
    }
    Ok(prio)
}

fn set_priority(tid: i32, priority: i32) -> io::Result<()> {
    // SAFETY: plain syscall wrapper.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Changes the nice value of the calling thread and restores the previous
/// one when dropped.
///
/// Must be dropped on the thread that created it.
pub struct ScopedThreadPriority {
    tid: i32,
    previous: i32,
}

impl ScopedThreadPriority {
    pub fn new(priority: i32) -> io::Result<Self> {
        let tid = thread_id();
        let previous = current_priority()?;
        set_priority(tid, priority)?;
        tracing::debug!("Thread {} priority {} -> {}", tid, previous, priority);
        Ok(Self { tid, previous })
    }

    pub fn previous(&self) -> i32 {
        self.previous
    }
}

impl Drop for ScopedThreadPriority {
    fn drop(&mut self) {
        // Lowering the nice value again needs privileges we may not have.
        if let Err(e) = set_priority(self.tid, self.previous) {
            tracing::debug!(
                "Could not restore priority {} of thread {}: {}",
                self.previous,
                self.tid,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_applied_in_scope() {
        // Run on a fresh thread so the test runner's thread keeps its nice value.
        std::thread::spawn(|| {
            let before = current_priority().unwrap();
            let target = (before + 1).min(19);
            let guard = ScopedThreadPriority::new(target).unwrap();
            assert_eq!(guard.previous(), before);
            assert_eq!(current_priority().unwrap(), target);
        })
        .join()
        .unwrap();
    }
}
