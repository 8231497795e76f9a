//! End-to-end coverage against real child processes. Attaching to our own
//! children is permitted even under Yama's restricted ptrace scope.

use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use nix::unistd::Pid;

use stacktop::errors::TraceError;
use stacktop::frame::Stacktrace;
use stacktop::heartbeat::Heartbeat;
use stacktop::profiler::Profiler;
use stacktop::sink::Sink;

#[derive(Default)]
struct CollectingSink {
    ticks: Vec<Vec<(Pid, Stacktrace)>>,
    info: Vec<String>,
}

impl Sink for CollectingSink {
    fn tick(&mut self, stacktraces: Vec<(Pid, Stacktrace)>) {
        self.ticks.push(stacktraces);
    }

    fn info_line(&mut self, line: String) {
        self.info.push(line);
    }
}

fn spawn_sleeper() -> Child {
    let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
    // give it time to get through exec and into the sleep syscall
    thread::sleep(Duration::from_millis(300));
    child
}

fn child_pid(child: &Child) -> Pid {
    Pid::from_raw(child.id() as libc::pid_t)
}

#[test]
fn oneshot_round_captures_a_sleeping_child() {
    let mut child = spawn_sleeper();

    let mut profiler = Profiler::new(child_pid(&child)).expect("attach");
    let mut sink = CollectingSink::default();
    profiler.event_loop(&mut sink, None).expect("single round");
    drop(profiler);

    assert_eq!(sink.ticks.len(), 1, "info: {:?}", sink.info);
    let round = &sink.ticks[0];
    assert_eq!(round.len(), 1, "info: {:?}", sink.info);
    let (tid, stacktrace) = &round[0];
    assert_eq!(*tid, child_pid(&child));
    assert!(!stacktrace.is_empty());

    // the tracee must be released and killable afterwards
    child.kill().expect("kill released child");
    child.wait().expect("reap child");
}

#[test]
fn repeated_rounds_reuse_the_same_attachment() {
    let mut child = spawn_sleeper();

    let mut profiler = Profiler::new(child_pid(&child)).expect("attach");
    for _ in 0..5 {
        let mut sink = CollectingSink::default();
        profiler.event_loop(&mut sink, None).expect("round");
        assert_eq!(sink.ticks.len(), 1);
    }
    drop(profiler);

    child.kill().expect("kill released child");
    child.wait().expect("reap child");
}

#[test]
fn attaching_to_a_bogus_pid_mentions_esrch() {
    let err = Profiler::new(Pid::from_raw(0x3fff_fff0)).unwrap_err();
    assert!(format!("{}", err).contains("ESRCH"), "got: {}", err);
    match err {
        TraceError::Syscall(errno) => assert_eq!(errno, nix::errno::Errno::ESRCH),
        other => panic!("expected a syscall error, got {}", other),
    }
}

#[test]
fn event_loop_ends_when_the_tracee_is_killed() {
    let mut child = spawn_sleeper();
    let pid = child_pid(&child);

    let worker = thread::spawn(move || {
        let mut profiler = Profiler::new(pid)?;
        let mut sink = CollectingSink::default();
        let mut heartbeat = Heartbeat::new(200);
        profiler.event_loop(&mut sink, Some(&mut heartbeat))?;
        Ok::<_, TraceError>(sink)
    });

    thread::sleep(Duration::from_millis(500));
    child.kill().expect("kill tracee");
    child.wait().expect("reap tracee");

    let sink = worker.join().expect("profiler thread").expect("clean exit");
    assert!(!sink.ticks.is_empty());
}
