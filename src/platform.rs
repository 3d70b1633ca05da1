//! Platform process primitives.
//!
//! Two capabilities sit behind a platform-neutral surface: probing whether a pid is
//! still alive, and signaling a whole process tree. On Unix the tree is the process
//! group the child leads; on Windows it is the console process group created with
//! `CREATE_NEW_PROCESS_GROUP`, falling back to the single process for a forced kill.

use std::io;

/// How hard to ask a process tree to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination (SIGTERM / CTRL_BREAK).
    Terminate,
    /// Forced kill (SIGKILL / TerminateProcess).
    Kill,
}

impl Signal {
    pub fn label(&self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Result of signaling a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal reached at least one process.
    Sent,
    /// Nothing was there to receive it (already exited, or owned by another user).
    Gone,
}

#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Some(pid) = to_raw_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
pub fn signal_tree(pid: u32, signal: Signal) -> io::Result<Delivery> {
    let Some(pid) = to_raw_pid(pid) else {
        return Ok(Delivery::Gone);
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Group first; a reclaimed pid that never led a group still gets the signal directly.
    for target in [-pid, pid] {
        // SAFETY: plain kill(2); target is never 0 or -1 because pid > 1.
        if unsafe { libc::kill(target, sig) } == 0 {
            return Ok(Delivery::Sent);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => continue,
            Some(libc::EPERM) => return Ok(Delivery::Gone),
            _ => return Err(err),
        }
    }
    Ok(Delivery::Gone)
}

#[cfg(unix)]
fn to_raw_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and 1 would address our own group or init.
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 1)
}

#[cfg(windows)]
pub fn is_pid_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    if pid == 0 {
        return false;
    }
    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code) != 0;
        CloseHandle(handle);
        ok && code == STILL_ACTIVE as u32
    }
}

#[cfg(windows)]
pub fn signal_tree(pid: u32, signal: Signal) -> io::Result<Delivery> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    if !is_pid_alive(pid) {
        return Ok(Delivery::Gone);
    }
    match signal {
        Signal::Terminate => {
            // Windows has no SIGTERM; CTRL_BREAK to the group is the closest console signal.
            // SAFETY: plain FFI call with a process group id.
            if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Delivery::Sent)
        }
        Signal::Kill => {
            // SAFETY: the handle is checked for null and closed before returning.
            unsafe {
                let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
                if handle == 0 {
                    return Ok(Delivery::Gone);
                }
                let ok = TerminateProcess(handle, 1) != 0;
                CloseHandle(handle);
                if ok {
                    Ok(Delivery::Sent)
                } else {
                    Err(io::Error::last_os_error())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn reserved_pids_are_never_alive() {
        assert!(!is_pid_alive(0));
        assert_eq!(signal_tree(0, Signal::Kill).unwrap(), Delivery::Gone);
    }

    #[cfg(unix)]
    #[test]
    fn signaling_a_reaped_child_reports_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_pid_alive(pid));
        assert_eq!(signal_tree(pid, Signal::Terminate).unwrap(), Delivery::Gone);
    }

    #[cfg(unix)]
    #[test]
    fn kill_takes_down_a_sleeping_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_pid_alive(pid));
        assert_eq!(signal_tree(pid, Signal::Kill).unwrap(), Delivery::Sent);
        child.wait().unwrap();
        assert!(!is_pid_alive(pid));
    }
}
