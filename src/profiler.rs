//! Owns one ThreadTracer per live thread of the target process and drives
//! the sampling rounds.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};

use crate::errors::{Result, TraceError};
use crate::frame::Stacktrace;
use crate::heartbeat::Heartbeat;
use crate::signals;
use crate::sink::Sink;
use crate::thread_tracer::{StackFuture, ThreadTracer};

pub struct Profiler {
    inner: Arc<ProfilerInner>,
}

/// State reachable from the workers. Workers hold a weak reference and only
/// ever notify: ownership flows one way, profiler down to tracers.
pub(crate) struct ProfilerInner {
    pid: Pid,
    tracers: Mutex<HashMap<Pid, ThreadTracer>>,
    zombies: Mutex<Vec<Pid>>,
    // teardown write-locks these for the rest of the profiler's life;
    // notifications try_read and give up when the profiler stopped listening
    birth_gate: RwLock<()>,
    death_gate: RwLock<()>,
}

impl Profiler {
    /// Attach to every thread of `pid`. Threads spawn concurrently with us,
    /// so enumeration repeats until a pass discovers nothing new; a tid that
    /// vanishes mid-attach simply raced us to exit.
    pub fn new(pid: Pid) -> Result<Profiler> {
        let inner = Arc::new(ProfilerInner {
            pid,
            tracers: Mutex::new(HashMap::new()),
            zombies: Mutex::new(Vec::new()),
            birth_gate: RwLock::new(()),
            death_gate: RwLock::new(()),
        });
        // a tid that failed with ThreadGone may linger in procfs as a
        // zombie, so track attempts separately from successes
        let mut seen = std::collections::HashSet::new();
        let mut traced_something = true;
        while traced_something {
            traced_something = false;
            for tid in crate::proc::thread_ids(pid)? {
                if !seen.insert(tid) {
                    continue;
                }
                traced_something = true;
                match ThreadTracer::attach(pid, tid, Arc::downgrade(&inner)) {
                    Ok(attached) => {
                        let mut tracers = inner.tracers.lock();
                        tracers.insert(tid, attached.resume());
                    }
                    Err(TraceError::ThreadGone) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(Profiler { inner })
    }

    /// Take rounds of stacktraces and feed them to `sink`. Without a
    /// heartbeat: one round and return. With one: run at its pace until
    /// SIGINT arrives or every tracee has died.
    pub fn event_loop(
        &mut self,
        sink: &mut dyn Sink,
        heartbeat: Option<&mut Heartbeat>,
    ) -> Result<()> {
        self.sampling_round(sink);
        let heartbeat = match heartbeat {
            Some(heartbeat) => heartbeat,
            None => return Ok(()),
        };
        signals::handle_signals(&[Signal::SIGINT], &[])?;
        loop {
            self.reap_dead()?;
            if self.inner.tracers.lock().is_empty() {
                debug!("no tracees left");
                return Ok(());
            }
            heartbeat.beat()?;
            if heartbeat.skipped_beats() > 0 {
                sink.info_line(format!(
                    "Too slow, skipping {} beats...",
                    heartbeat.skipped_beats()
                ));
            }
            if signals::last_signal() == Some(Signal::SIGINT) {
                return Ok(());
            }
            loop {
                let wait = heartbeat.usec_until_next_beat();
                if wait == 0 {
                    break;
                }
                signals::reset_last_signal();
                unsafe { libc::usleep(wait as libc::c_uint) };
                if signals::last_signal() == Some(Signal::SIGINT) {
                    return Ok(());
                }
            }
            self.sampling_round(sink);
        }
    }

    /// One tick: fan the requests out under the map lock, gather the futures
    /// outside it. Per-thread failures become info lines; the rest of the
    /// round is unaffected.
    fn sampling_round(&mut self, sink: &mut dyn Sink) {
        let mut pending: Vec<(Pid, StackFuture)> = Vec::new();
        {
            let tracers = self.inner.tracers.lock();
            for (tid, tracer) in tracers.iter() {
                match tracer.request_stacktrace() {
                    Ok(future) => pending.push((*tid, future)),
                    Err(err) => sink.info_line(format!("Exception: {}", err)),
                }
            }
        }
        let mut stacktraces: Vec<(Pid, Stacktrace)> = Vec::new();
        for (tid, future) in pending {
            match future.recv() {
                Ok(Ok(stacktrace)) => stacktraces.push((tid, stacktrace)),
                Ok(Err(err)) => sink.info_line(format!("Exception: {}", err)),
                Err(_worker_went_away) => {
                    sink.info_line(format!("Exception: {}", TraceError::AlreadyTerminated))
                }
            }
        }
        stacktraces.sort_by_key(|(tid, _)| tid.as_raw());
        sink.tick(stacktraces);
    }

    /// Join the tracers whose tracees died since the last tick. A worker
    /// that went down with a real error takes the profiler with it.
    fn reap_dead(&mut self) -> Result<()> {
        let zombies: Vec<Pid> = mem::replace(&mut *self.inner.zombies.lock(), Vec::new());
        for tid in zombies {
            let tracer = self.inner.tracers.lock().remove(&tid);
            if let Some(tracer) = tracer {
                debug!("reaping tracer for {}", tid);
                tracer.shutdown()?;
            }
        }
        Ok(())
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        // seal both gates so in-flight notifications drain away, then unwind
        // every tracer; each detaches its tracee
        let _births = self.inner.birth_gate.write();
        let _deaths = self.inner.death_gate.write();
        let tracers = mem::replace(&mut *self.inner.tracers.lock(), HashMap::new());
        for (tid, tracer) in tracers {
            if let Err(err) = tracer.shutdown() {
                warn!("tracer for {} went down with: {}", tid, err);
            }
        }
    }
}

impl ProfilerInner {
    /// Called from a worker that saw its tracee clone. Adopt the newborn
    /// with a tracer of its own; dropped when teardown already began (the
    /// newborn keeps running untraced once the tracer chain detaches).
    pub(crate) fn new_thread(self: Arc<Self>, tid: Pid) {
        let _gate = match self.birth_gate.try_read() {
            Some(gate) => gate,
            None => return,
        };
        match ThreadTracer::attach(self.pid, tid, Arc::downgrade(&self)) {
            Ok(attached) => {
                let mut tracers = self.tracers.lock();
                tracers.insert(tid, attached.resume());
            }
            Err(TraceError::ThreadGone) => {}
            Err(err) => warn!("could not adopt new thread {}: {}", tid, err),
        }
    }

    /// Called from a worker whose tracee died; the main loop reaps between
    /// ticks.
    pub(crate) fn end_thread(&self, tid: Pid) {
        let _gate = match self.death_gate.try_read() {
            Some(gate) => gate,
            None => return,
        };
        self.zombies.lock().push(tid);
    }
}
