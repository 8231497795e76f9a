use std::fs;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::errors::{Result, TraceError};

/// scheduler state of a task by reading procfs
/// kernel 3.13+ is required, prior to 3.13, there're
/// more states, which we don't plan to support
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskState {
    Running,
    SleepInterruptible,
    SleepUninterruptible,
    Zombie,
    Stopped,
    Ptraced,
    Dead,
}

impl TaskState {
    /// A task in this state fails ptrace with `EPERM` without any actual
    /// permission problem.
    pub fn is_defunct(self) -> bool {
        match self {
            TaskState::Zombie | TaskState::Dead => true,
            _otherwise => false,
        }
    }
}

/// Enumerate the task (thread) ids of a thread group. A missing task
/// directory means the whole process is gone.
pub fn thread_ids(pid: Pid) -> Result<Vec<Pid>> {
    let task_dir = PathBuf::from("/proc").join(format!("{}", pid)).join("task");
    let entries = fs::read_dir(&task_dir).map_err(|_| TraceError::Syscall(Errno::ESRCH))?;
    let mut tids = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue, // task exited mid-listing
        };
        let name = entry.file_name();
        if let Some(tid) = name.to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort_by_key(|tid| tid.as_raw());
    Ok(tids)
}

/// get task (`tid`) state by reading procfs
pub fn task_state(tid: Pid) -> Result<TaskState> {
    let status = PathBuf::from("/proc").join(format!("{}", tid)).join("status");
    let contents = fs::read_to_string(&status).map_err(|_| TraceError::ThreadGone)?;
    contents
        .lines()
        .find(|line| line.starts_with("State:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|state| match state {
            "R" => Some(TaskState::Running),
            "S" => Some(TaskState::SleepInterruptible),
            "D" => Some(TaskState::SleepUninterruptible),
            "T" => Some(TaskState::Stopped),
            "t" => Some(TaskState::Ptraced),
            "X" => Some(TaskState::Dead),
            "Z" => Some(TaskState::Zombie),
            _ => None,
        })
        .ok_or(TraceError::ThreadGone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn can_enumerate_own_tasks() {
        let tids = thread_ids(unistd::getpid()).unwrap();
        assert!(tids.contains(&unistd::gettid()));
    }

    #[test]
    fn enumerating_a_bogus_pid_is_esrch() {
        let err = thread_ids(Pid::from_raw(0x3fff_fff0)).unwrap_err();
        assert!(matches!(err, TraceError::Syscall(Errno::ESRCH)));
    }

    #[test]
    fn can_probe_own_task_state() {
        let state = task_state(unistd::gettid()).unwrap();
        assert!(!state.is_defunct());
    }
}
