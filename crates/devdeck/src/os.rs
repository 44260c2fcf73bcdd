use std::{path::PathBuf, process::Stdio};

/// A process to start, already split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// The only place devdeck touches the OS process table.
pub trait ProcessOs: Send + Sync {
    /// Starts a detached process and returns its pid.
    fn spawn(&self, req: &SpawnRequest) -> std::io::Result<u32>;

    /// Non-destructive liveness probe.
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends the terminate signal. Does not wait for exit.
    ///
    /// With `tree`, a pid that leads its own process group has the whole group
    /// signalled. Only pass it for processes devdeck started.
    fn terminate(&self, pid: u32, tree: bool) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOs;

impl ProcessOs for SystemOs {
    fn spawn(&self, req: &SpawnRequest) -> std::io::Result<u32> {
        let mut cmd = tokio::process::Command::new(&req.program);
        cmd.args(&req.args)
            .current_dir(&req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        // New session: the child outlives this CLI invocation and leads its own
        // process group, so terminate() can take its descendants along.
        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn()?;
        let Some(pid) = child.id() else {
            return Err(std::io::Error::other("spawned process has no pid"));
        };

        // Reap on exit so a dead child does not linger as a zombie that still
        // answers kill(pid, 0).
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }

    fn terminate(&self, pid: u32, tree: bool) -> std::io::Result<()> {
        terminate_pid(pid, tree)
    }
}

/// Pids devdeck will ever signal. 0 and negatives address groups, and 1 is
/// init; `kill(-1, ..)` would reach every process we may signal.
fn to_pid_t(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|p| *p > 1)
}

/// Signal targets for `raw`, in order: the group first, only when asked for
/// and `raw` is its leader, then the bare pid.
fn signal_targets(raw: i32, pgid: Option<i32>, tree: bool) -> Vec<i32> {
    if raw <= 1 {
        return Vec::new();
    }
    if tree && pgid == Some(raw) {
        vec![-raw, raw]
    } else {
        vec![raw]
    }
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    let Some(raw) = to_pid_t(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        // EPERM: the pid exists but belongs to someone else.
        return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let Some(end) = s.rfind(')') else {
        return false;
    };
    s.get((end + 2)..)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate_pid(pid: u32, tree: bool) -> std::io::Result<()> {
    let Some(raw) = to_pid_t(pid) else {
        return Err(std::io::Error::from_raw_os_error(libc::ESRCH));
    };
    let pgid = match unsafe { libc::getpgid(raw) } {
        -1 => None,
        g => Some(g),
    };
    let mut last = std::io::Error::from_raw_os_error(libc::ESRCH);
    for target in signal_targets(raw, pgid, tree) {
        if unsafe { libc::kill(target, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        last = std::io::Error::last_os_error();
    }
    Err(last)
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32, _tree: bool) -> std::io::Result<()> {
    Err(std::io::Error::other("terminate is only supported on unix"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(SystemOs.is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_never_alive() {
        assert!(!SystemOs.is_alive(0));
        assert!(!SystemOs.is_alive(u32::MAX));
    }

    #[test]
    fn terminate_refuses_init_and_group_addresses() {
        assert!(SystemOs.terminate(0, true).is_err());
        assert!(SystemOs.terminate(1, true).is_err());
        assert!(SystemOs.terminate(1, false).is_err());
        assert!(SystemOs.terminate(u32::MAX, true).is_err());
    }

    #[test]
    fn pid_one_is_never_a_signal_target() {
        assert_eq!(to_pid_t(1), None);
        assert!(signal_targets(1, Some(1), true).is_empty());
        assert!(signal_targets(0, Some(0), true).is_empty());
        assert!(!signal_targets(2, Some(1), true).contains(&-1));
    }

    #[test]
    fn group_is_signalled_only_for_tracked_leaders() {
        assert_eq!(signal_targets(500, Some(500), true), vec![-500, 500]);
        // Not the leader: the group belongs to someone else.
        assert_eq!(signal_targets(500, Some(400), true), vec![500]);
        assert_eq!(signal_targets(500, None, true), vec![500]);
        // Untracked pid: never its group, even when it leads one.
        assert_eq!(signal_targets(500, Some(500), false), vec![500]);
    }

    #[tokio::test]
    async fn spawn_probe_terminate() {
        let req = SpawnRequest {
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
            cwd: std::env::temp_dir(),
        };
        let pid = SystemOs.spawn(&req).unwrap();
        assert!(SystemOs.is_alive(pid));

        SystemOs.terminate(pid, true).unwrap();
        let mut alive = true;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if !SystemOs.is_alive(pid) {
                alive = false;
                break;
            }
        }
        assert!(!alive);
    }

    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let req = SpawnRequest {
            program: "devdeck-definitely-not-a-program".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };
        assert!(SystemOs.spawn(&req).is_err());
    }
}
