use std::collections::HashMap;

use nix::unistd::Pid;
use parking_lot::Mutex;
use unwind::{Accessors, AddressSpace, Byteorder, Cursor, PTraceState, RegNum};

use crate::errors::Result;
use crate::frame::{Frame, Stacktrace, MAX_STACK_DEPTH};

pub const UNKNOWN_PROC: &str = "{unknown}";

lazy_static! {
    // ip -> procedure name, shared by every tracer for the life of the
    // process; resolving a name is far more expensive than a stack walk and
    // ips repeat across virtually every sample
    static ref PROC_NAMES: Mutex<HashMap<u64, String>> = Mutex::new(HashMap::new());
}

/// Remote unwinding for one stopped tracee, bound to its tid.
pub struct RemoteUnwinder {
    state: PTraceState,
}

impl RemoteUnwinder {
    pub fn new(tid: Pid) -> Result<RemoteUnwinder> {
        let state = PTraceState::new(tid.as_raw() as u32)?;
        Ok(RemoteUnwinder { state })
    }

    /// Walk the tracee's user-space call stack, innermost frame first.
    /// The tracee must be in a ptrace stop.
    pub fn stacktrace(&self) -> Result<Stacktrace> {
        let space = AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT)?;
        let mut cursor = Cursor::remote(&space, &self.state)?;
        let mut frames = Vec::new();
        loop {
            let ip = cursor.register(RegNum::IP)?;
            let sp = cursor.register(RegNum::SP)?;
            let proc_name = cached_proc_name(ip, || cursor.procedure_name().ok().map(|p| p.name().to_string()));
            frames.push(Frame { ip, sp, proc_name });
            if frames.len() == MAX_STACK_DEPTH {
                break;
            }
            if !cursor.step()? {
                break;
            }
        }
        Ok(frames)
    }
}

/// First lookup wins, including failed ones: a name that would not resolve
/// once will not resolve later either.
fn cached_proc_name(ip: u64, lookup: impl FnOnce() -> Option<String>) -> String {
    if let Some(name) = PROC_NAMES.lock().get(&ip) {
        return name.clone();
    }
    let name = lookup().unwrap_or_else(|| UNKNOWN_PROC.to_string());
    PROC_NAMES.lock().insert(ip, name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_first_resolved_name_sticks() {
        let ip = 0xdead_0001;
        assert_eq!(cached_proc_name(ip, || Some("first".to_string())), "first");
        assert_eq!(cached_proc_name(ip, || Some("second".to_string())), "first");
        assert_eq!(cached_proc_name(ip, || None), "first");
    }

    #[test]
    fn failed_lookups_are_cached_too() {
        let ip = 0xdead_0002;
        assert_eq!(cached_proc_name(ip, || None), UNKNOWN_PROC);
        assert_eq!(cached_proc_name(ip, || Some("late".to_string())), UNKNOWN_PROC);
    }
}
