//! Single command worker
//!
//! Every store, load and GC operation runs on one dedicated thread so the
//! identity maps and deferred queues are only ever touched by one mutator.
//! Calls made from the worker thread itself run in place; calls from any
//! other thread are queued and block on a reply. Hooks connected by
//! registries run on the worker when the queue stays idle and when the
//! worker closes.

use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send>;
type IdleHook = Box<dyn FnMut() + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

enum Command {
    Run(Job),
    Connect(u64, Hook),
    Disconnect(u64),
    Close(Sender<()>),
}

struct Hook {
    on_idle: IdleHook,
    on_close: Option<CloseHook>,
}

/// Worker thread settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Quiet period after which idle hooks fire
    pub idle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "oidstore-worker".to_string(),
            idle_timeout: Duration::from_millis(1000),
        }
    }
}

struct Inner {
    tx: Sender<Command>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    next_hook: AtomicU64,
    closed: AtomicBool,
    name: String,
}

/// Handle on a command worker; clones share the same thread
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn spawn(config: WorkerConfig) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Command>();
        let idle_timeout = config.idle_timeout;
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || run_loop(rx, idle_timeout))?;

        tracing::debug!("Worker '{}' started", config.name);
        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
                next_hook: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                name: config.name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when the current thread is this worker's thread
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Run `f` on the worker and wait for its result
    ///
    /// A panic inside `f` comes back as [`Error::CommandPanicked`].
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        if self.is_current() {
            return f();
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let (reply_tx, reply_rx) = channel::bounded::<Result<R>>(1);
        let job: Job = Box::new(move || {
            let out = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(Error::CommandPanicked(panic_message(payload))));
            let _ = reply_tx.send(out);
        });
        self.inner
            .tx
            .send(Command::Run(job))
            .map_err(|_| Error::Closed)?;
        reply_rx.recv().map_err(|_| Error::Closed)?
    }

    /// Queue `f` without waiting; failures are logged and dropped
    pub fn send<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.is_current() {
            if let Err(e) = f() {
                tracing::warn!("Worker send failed: {}", e);
            }
            return Ok(());
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let job: Job = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Worker send failed: {}", e),
            Err(payload) => tracing::error!("Worker send panicked: {}", panic_message(payload)),
        });
        self.inner
            .tx
            .send(Command::Run(job))
            .map_err(|_| Error::Closed)
    }

    /// Attach idle and close hooks; returns a handle for [`Worker::disconnect`]
    pub fn connect<I, C>(&self, on_idle: I, on_close: C) -> Result<u64>
    where
        I: FnMut() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_hook.fetch_add(1, Ordering::SeqCst);
        let hook = Hook {
            on_idle: Box::new(on_idle),
            on_close: Some(Box::new(on_close)),
        };
        self.inner
            .tx
            .send(Command::Connect(id, hook))
            .map_err(|_| Error::Closed)?;
        Ok(id)
    }

    /// Remove hooks without running their close callback
    pub fn disconnect(&self, id: u64) {
        let _ = self.inner.tx.send(Command::Disconnect(id));
    }

    /// Drain the queue, run close hooks and stop the thread
    pub fn close(&self) -> Result<()> {
        if self.is_current() {
            return Err(Error::CloseFromWorker);
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (done_tx, done_rx) = channel::bounded::<()>(1);
        if self.inner.tx.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
        if let Some(handle) = self.inner.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Worker '{}' thread panicked", self.inner.name);
            }
        }
        tracing::debug!("Worker '{}' closed", self.inner.name);
        Ok(())
    }
}

fn run_loop(rx: Receiver<Command>, idle_timeout: Duration) {
    let mut hooks: Vec<(u64, Hook)> = Vec::new();

    loop {
        match rx.recv_timeout(idle_timeout) {
            Ok(Command::Close(done)) => {
                // Drain commands queued behind the close
                while let Ok(command) = rx.try_recv() {
                    if let Command::Close(other) = command {
                        let _ = other.send(());
                    } else {
                        handle(command, &mut hooks);
                    }
                }
                run_close_hooks(&mut hooks);
                let _ = done.send(());
                return;
            }
            Ok(command) => handle(command, &mut hooks),
            Err(RecvTimeoutError::Timeout) => {
                for (id, hook) in hooks.iter_mut() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (hook.on_idle)())) {
                        tracing::error!("Idle hook {} panicked: {}", id, panic_message(payload));
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                run_close_hooks(&mut hooks);
                return;
            }
        }
    }
}

fn handle(command: Command, hooks: &mut Vec<(u64, Hook)>) {
    match command {
        Command::Run(job) => job(),
        Command::Connect(id, hook) => hooks.push((id, hook)),
        Command::Disconnect(id) => hooks.retain(|(hook_id, _)| *hook_id != id),
        Command::Close(done) => {
            let _ = done.send(());
        }
    }
}

fn run_close_hooks(hooks: &mut Vec<(u64, Hook)>) {
    for (id, mut hook) in hooks.drain(..) {
        if let Some(on_close) = hook.on_close.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(on_close)) {
                tracing::error!("Close hook {} panicked: {}", id, panic_message(payload));
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn worker(idle_ms: u64) -> Worker {
        Worker::spawn(WorkerConfig {
            name: "test-worker".to_string(),
            idle_timeout: Duration::from_millis(idle_ms),
        })
        .unwrap()
    }

    fn wait_for(counter: &AtomicUsize, at_least: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_call_returns_result() {
        let w = worker(1000);
        assert_eq!(w.call(|| Ok(21 * 2)).unwrap(), 42);
        assert!(matches!(
            w.call::<(), _>(|| Err(Error::Closed)),
            Err(Error::Closed)
        ));
        w.close().unwrap();
    }

    #[test]
    fn test_nested_call_runs_inline() {
        let w = worker(1000);
        let inner = w.clone();
        let out = w
            .call(move || {
                assert!(inner.is_current());
                inner.call(|| Ok("nested"))
            })
            .unwrap();
        assert_eq!(out, "nested");
        w.close().unwrap();
    }

    #[test]
    fn test_panic_is_reported() {
        let w = worker(1000);
        let err = w.call::<(), _>(|| panic!("boom")).unwrap_err();
        assert!(matches!(err, Error::CommandPanicked(ref msg) if msg == "boom"));
        assert_eq!(w.call(|| Ok(1)).unwrap(), 1);
        w.close().unwrap();
    }

    #[test]
    fn test_send_runs_in_order() {
        let w = worker(1000);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            w.send(move || {
                seen.lock().push(i);
                Ok(())
            })
            .unwrap();
        }
        w.send(|| Err(Error::Closed)).unwrap();
        w.close().unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_close_from_worker_rejected() {
        let w = worker(1000);
        let inner = w.clone();
        let err = w.call(move || inner.close()).unwrap_err();
        assert!(matches!(err, Error::CloseFromWorker));
        w.close().unwrap();
        assert!(matches!(w.call(|| Ok(())), Err(Error::Closed)));
        w.close().unwrap();
    }

    #[test]
    fn test_idle_and_close_hooks() {
        let w = worker(10);
        let idles = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (i, c) = (idles.clone(), closes.clone());
        w.connect(
            move || {
                i.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        assert!(wait_for(&idles, 2));
        w.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_skips_close_hook() {
        let w = worker(1000);
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let id = w
            .connect(|| {}, move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        w.disconnect(id);
        w.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }
}
