use std::cmp::Ordering;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Unwinding stops here even if the tracee is deeper in a runaway recursion.
pub const MAX_STACK_DEPTH: usize = 200;

/// One entry of a call stack, innermost first in a [`Stacktrace`].
///
/// Frames compare, order and hash by instruction pointer alone; aggregation
/// across samples keys on the procedure name instead.
#[derive(Clone, Debug)]
pub struct Frame {
    pub ip: u64,
    pub sp: u64,
    pub proc_name: String,
}

pub type Stacktrace = Vec<Frame>;

impl PartialEq for Frame {
    fn eq(&self, other: &Frame) -> bool {
        self.ip == other.ip
    }
}

impl Eq for Frame {}

impl PartialOrd for Frame {
    fn partial_cmp(&self, other: &Frame) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frame {
    fn cmp(&self, other: &Frame) -> Ordering {
        self.ip.cmp(&other.ip)
    }
}

impl Hash for Frame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

/// Collapse repeated procedure names within one stacktrace, keeping the first
/// occurrence, so that a deep recursion counts as a single hit.
pub fn dedup_by_proc_name(frames: &[Frame]) -> Vec<Frame> {
    let mut seen = HashSet::new();
    frames
        .iter()
        .filter(|frame| seen.insert(frame.proc_name.clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ip: u64, name: &str) -> Frame {
        Frame {
            ip,
            sp: 0,
            proc_name: name.to_string(),
        }
    }

    #[test]
    fn frames_order_by_ip() {
        assert!(frame(1, "b") < frame(2, "a"));
    }

    #[test]
    fn frames_compare_by_ip_alone() {
        assert_eq!(frame(7, "a"), frame(7, "b"));
        assert_ne!(frame(7, "a"), frame(8, "a"));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let frames = vec![
            frame(1, "recurse"),
            frame(2, "recurse"),
            frame(3, "main"),
            frame(4, "recurse"),
        ];
        let deduped = dedup_by_proc_name(&frames);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].ip, 1);
        assert_eq!(deduped[1].proc_name, "main");
    }

    #[test]
    fn dedup_of_distinct_names_is_identity() {
        let frames = vec![frame(1, "a"), frame(2, "b")];
        assert_eq!(dedup_by_proc_name(&frames), frames);
    }
}
