//! The per-thread tracer-and-stop controller.
//!
//! The kernel only accepts ptrace requests for a tracee from the task that
//! attached to it, so every tracee gets a dedicated worker thread. The worker
//! owns the whole ptrace state machine: it attaches, parks in `waitpid`,
//! services stop requests injected by the sampling loop, hands freshly cloned
//! threads over to the profiler and detaches on demand.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::errors::{Result, TraceError};
use crate::frame::Stacktrace;
use crate::proc;
use crate::profiler::ProfilerInner;
use crate::signals;
use crate::unwinder::RemoteUnwinder;

type StackPromise = Sender<Result<Stacktrace>>;
pub type StackFuture = Receiver<Result<Stacktrace>>;

/// Flags shared between the owning profiler and the worker. The promise is
/// only ever fulfilled from the worker.
struct TracerState {
    alive: bool,
    detach_requested: bool,
    sample_pending: Option<StackPromise>,
}

/// Handle to one traced thread. Owned by the profiler; dropping it detaches
/// the tracee.
pub struct ThreadTracer {
    pid: Pid,
    tid: Pid,
    state: Arc<Mutex<TracerState>>,
    worker: Option<JoinHandle<Result<()>>>,
    worker_thread: libc::pthread_t,
}

/// A tracer whose tracee is attached but still held at its first stop. The
/// worker will not resume the tracee (and so cannot report clones) until
/// [`Attached::resume`] releases it, which gives the profiler room to publish
/// the tracer first.
pub struct Attached {
    // declared before the tracer: if this handle is dropped unreleased, the
    // closed channel frees the worker before the tracer's drop joins it
    good_to_go: Sender<()>,
    tracer: ThreadTracer,
}

impl Attached {
    pub fn resume(self) -> ThreadTracer {
        let _ = self.good_to_go.send(());
        self.tracer
    }
}

impl ThreadTracer {
    /// Attach to `tid` and block until the worker has it under trace (clone
    /// tracking enabled) or has failed. A task that vanished mid-attach is
    /// reported as `ThreadGone`.
    pub(crate) fn attach(pid: Pid, tid: Pid, profiler: Weak<ProfilerInner>) -> Result<Attached> {
        let state = Arc::new(Mutex::new(TracerState {
            alive: true,
            detach_requested: false,
            sample_pending: None,
        }));
        let (ready_tx, ready_rx) = bounded(1);
        let (go_tx, go_rx) = bounded(1);
        let worker_state = state.clone();
        let worker = thread::Builder::new()
            .name(format!("tracer-{}", tid))
            .spawn(move || {
                Worker {
                    pid,
                    tid,
                    state: worker_state,
                    profiler,
                }
                .run(ready_tx, go_rx)
            })
            .map_err(TraceError::Io)?;

        match ready_rx.recv() {
            Ok(Ok(worker_thread)) => Ok(Attached {
                good_to_go: go_tx,
                tracer: ThreadTracer {
                    pid,
                    tid,
                    state,
                    worker: Some(worker),
                    worker_thread,
                },
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => match worker.join() {
                Ok(Err(err)) => Err(err),
                _otherwise => Err(TraceError::ThreadGone),
            },
        }
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// Ask the worker for a stacktrace. Non-blocking; the returned future
    /// resolves once the worker has stopped and unwound the tracee. At most
    /// one request may be in flight.
    pub fn request_stacktrace(&self) -> Result<StackFuture> {
        let (promise, future) = bounded(1);
        {
            let mut state = self.state.lock();
            if !state.alive {
                return Err(TraceError::AlreadyTerminated);
            }
            assert!(
                state.sample_pending.is_none(),
                "stacktrace request already in flight for {}",
                self.tid
            );
            state.sample_pending = Some(promise);
        }
        // Stop the tracee; its worker sees the SIGSTOP and services us.
        match tgkill(self.pid, self.tid, Signal::SIGSTOP) {
            Ok(()) => {}
            // already dead: the worker observes that and fails the promise
            Err(nix::Error::Sys(Errno::ESRCH)) => {}
            Err(err) => return Err(TraceError::fatal(err)),
        }
        Ok(future)
    }

    /// Tear the worker down (detaching the tracee if it is still alive) and
    /// surface whatever the worker died of.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_worker()
    }

    fn shutdown_worker(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.alive && !state.detach_requested {
                state.detach_requested = true;
                // wake the worker out of waitpid, and park the tracee at a
                // stop the worker can detach from
                unsafe { libc::pthread_kill(self.worker_thread, libc::SIGTERM) };
                let _ = tgkill(self.pid, self.tid, Signal::SIGSTOP);
            }
        }
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .unwrap_or_else(|_| Err(TraceError::Syscall(Errno::UnknownErrno))),
            None => Ok(()),
        }
    }
}

impl Drop for ThreadTracer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.shutdown_worker() {
                warn!("tracer for {} went down with: {}", self.tid, err);
            }
        }
    }
}

fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> nix::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            pid.as_raw() as libc::c_long,
            tid.as_raw() as libc::c_long,
            signal as libc::c_int as libc::c_long,
        )
    };
    if ret == -1 {
        Err(nix::Error::Sys(Errno::last()))
    } else {
        Ok(())
    }
}

/// How the worker's main loop ended.
enum Exit {
    /// we detached on request; the tracee runs free
    Detached,
    /// the tracee exited on its own
    TraceeExited,
    /// the tracee was terminated by a signal
    TraceeKilled(Signal),
}

struct Worker {
    pid: Pid,
    tid: Pid,
    state: Arc<Mutex<TracerState>>,
    profiler: Weak<ProfilerInner>,
}

enum StopAction {
    Detach,
    Sample(StackPromise),
    Swallow,
}

impl Worker {
    fn run(self, ready: Sender<Result<libc::pthread_t>>, good_to_go: Receiver<()>) -> Result<()> {
        // latch SIGTERM before anyone can aim it at this thread; SIGINT
        // belongs to the profiler thread alone
        if let Err(err) = signals::handle_signals(&[Signal::SIGTERM], &[Signal::SIGINT]) {
            self.state.lock().alive = false;
            let _ = ready.send(Err(err));
            return Ok(());
        }
        if let Err(err) = self.attach() {
            self.state.lock().alive = false;
            let _ = ready.send(Err(err));
            return Ok(()); // reported through `ready`, nothing further to say
        }
        let unwinder = match RemoteUnwinder::new(self.tid) {
            Ok(unwinder) => unwinder,
            Err(err) => {
                let _ = ptrace::detach(self.tid);
                self.state.lock().alive = false;
                let _ = ready.send(Err(err));
                return Ok(());
            }
        };
        let _ = ready.send(Ok(unsafe { libc::pthread_self() }));
        // the profiler publishes us into its map before releasing the latch,
        // so clone reports cannot race the insert
        let _ = good_to_go.recv();

        let result = self.serve(&unwinder);
        self.conclude(result)
    }

    fn attach(&self) -> Result<()> {
        ptrace::attach(self.tid).map_err(|err| self.attach_error(err))?;
        match waitpid(self.tid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                return Err(TraceError::ThreadGone);
            }
            Ok(status) => {
                warn!("attach to {} saw {:?} instead of SIGSTOP", self.tid, status);
                let _ = ptrace::detach(self.tid);
                return Err(TraceError::ThreadGone);
            }
            Err(err) => return Err(self.attach_error(err)),
        }
        ptrace::setoptions(self.tid, ptrace::Options::PTRACE_O_TRACECLONE)
            .map_err(|err| self.attach_error(err))?;
        debug!("attached to {}", self.tid);
        Ok(())
    }

    /// During attach, `EPERM` is how the kernel reports a zombie as well as a
    /// genuine permission problem; the task state tells the two apart.
    fn attach_error(&self, err: nix::Error) -> TraceError {
        match err {
            nix::Error::Sys(Errno::ESRCH) => TraceError::ThreadGone,
            nix::Error::Sys(Errno::EPERM) => match proc::task_state(self.tid) {
                Ok(state) if !state.is_defunct() => TraceError::Syscall(Errno::EPERM),
                _defunct_or_vanished => TraceError::ThreadGone,
            },
            other => TraceError::fatal(other),
        }
    }

    fn serve(&self, unwinder: &RemoteUnwinder) -> Result<Exit> {
        self.cont(None)?;

        loop {
            // a SIGTERM can land between waitpid calls; the latch keeps it
            if signals::last_signal() == Some(Signal::SIGTERM) {
                self.request_detach()?;
            }
            let status = match waitpid(self.tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(nix::Error::Sys(Errno::EINTR)) => match signals::last_signal() {
                    Some(Signal::SIGTERM) => {
                        self.request_detach()?;
                        continue;
                    }
                    other => {
                        warn!("worker for {} interrupted by {:?}", self.tid, other);
                        return Err(TraceError::Syscall(Errno::EINTR));
                    }
                },
                Err(nix::Error::Sys(Errno::ESRCH)) => return Ok(Exit::TraceeExited),
                Err(err) => return Err(TraceError::fatal(err)),
            };
            trace!("{} reported {:?}", self.tid, status);
            match status {
                WaitStatus::Exited(_, code) => {
                    debug!("tracee {} exited with {}", self.tid, code);
                    return Ok(Exit::TraceeExited);
                }
                WaitStatus::Signaled(_, signal, _) => {
                    debug!("tracee {} killed by {:?}", self.tid, signal);
                    return Ok(Exit::TraceeKilled(signal));
                }
                WaitStatus::Stopped(_, Signal::SIGSTOP) => match self.stop_action() {
                    StopAction::Detach => {
                        ptrace::detach(self.tid).map_err(TraceError::from_syscall)?;
                        debug!("detached from {}", self.tid);
                        return Ok(Exit::Detached);
                    }
                    StopAction::Sample(promise) => {
                        let _ = promise.send(unwinder.stacktrace());
                        self.cont(None)?;
                    }
                    // a group-stop that was not ours; swallow it, we inject
                    // our own SIGSTOPs
                    StopAction::Swallow => self.cont(None)?,
                },
                WaitStatus::Stopped(_, Signal::SIGTSTP)
                | WaitStatus::Stopped(_, Signal::SIGTTIN)
                | WaitStatus::Stopped(_, Signal::SIGTTOU) => {
                    // remaining group-stop family: do not forward, a stopped
                    // tracee would never produce another sample
                    self.cont(None)?;
                }
                WaitStatus::PtraceEvent(_, _, event)
                    if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 =>
                {
                    self.handoff_clone()?;
                    self.cont(None)?;
                }
                WaitStatus::PtraceEvent(_, _, event) => {
                    trace!("{} unexpected ptrace event {}", self.tid, event);
                    self.cont(None)?;
                }
                WaitStatus::Stopped(_, signal) => {
                    // an ordinary signal for the tracee; hand it over
                    self.cont(Some(signal))?;
                }
                _otherwise => {}
            }
        }
    }

    fn stop_action(&self) -> StopAction {
        let mut state = self.state.lock();
        if state.detach_requested {
            StopAction::Detach
        } else if let Some(promise) = state.sample_pending.take() {
            StopAction::Sample(promise)
        } else {
            StopAction::Swallow
        }
    }

    fn request_detach(&self) -> Result<()> {
        signals::reset_last_signal();
        {
            let mut state = self.state.lock();
            if state.detach_requested {
                return Ok(()); // a stop is already on its way
            }
            state.detach_requested = true;
        }
        // park the tracee at a stop we can detach from
        match tgkill(self.pid, self.tid, Signal::SIGSTOP) {
            Ok(()) | Err(nix::Error::Sys(Errno::ESRCH)) => Ok(()),
            Err(err) => Err(TraceError::fatal(err)),
        }
    }

    /// A fresh clone arrives attached to us and stopped. Release it and let
    /// the profiler adopt it with a worker of its own; re-entrant ptrace from
    /// this thread would deadlock.
    fn handoff_clone(&self) -> Result<()> {
        let new_tid = Pid::from_raw(
            ptrace::getevent(self.tid).map_err(TraceError::from_syscall)? as libc::pid_t,
        );
        debug!("thread {} cloned {}", self.tid, new_tid);
        loop {
            match waitpid(new_tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(..)) => {
                    let _ = ptrace::detach(new_tid);
                    break;
                }
                Ok(_gone_already) => break,
                Err(nix::Error::Sys(Errno::EINTR)) => {
                    if signals::last_signal() == Some(Signal::SIGTERM) {
                        self.request_detach()?;
                    }
                    continue;
                }
                Err(_) => break,
            }
        }
        if let Some(profiler) = self.profiler.upgrade() {
            profiler.new_thread(new_tid);
        }
        Ok(())
    }

    fn cont(&self, signal: Option<Signal>) -> Result<()> {
        match ptrace::cont(self.tid, signal) {
            Ok(()) => Ok(()),
            // killed while stopped; the next waitpid reports it
            Err(nix::Error::Sys(Errno::ESRCH)) => Ok(()),
            Err(err) => Err(TraceError::fatal(err)),
        }
    }

    /// Runs on every worker exit: marks the tracer gone, fails whatever
    /// sample is still pending and lets the profiler reap us (unless the
    /// profiler asked for the shutdown itself).
    fn conclude(&self, result: Result<Exit>) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.alive = false;
            if let Some(promise) = state.sample_pending.take() {
                let err = match &result {
                    Ok(Exit::TraceeKilled(signal)) => TraceError::DeadlySignal(*signal),
                    _otherwise => TraceError::AlreadyTerminated,
                };
                let _ = promise.send(Err(err));
            }
        }
        match result {
            Ok(Exit::Detached) => Ok(()),
            Ok(Exit::TraceeExited) | Ok(Exit::TraceeKilled(_)) => {
                self.notify_end();
                Ok(())
            }
            Err(err) => {
                self.notify_end();
                Err(err)
            }
        }
    }

    fn notify_end(&self) {
        if let Some(profiler) = self.profiler.upgrade() {
            profiler.end_thread(self.tid);
        }
    }
}
