//! Linux glue for `canopen-rs`: a `Bus` over a blocking SocketCAN socket
//! and a `Clock` backed by a background timer thread. Neither is
//! exercised by the core crate's own tests, which drive services with
//! an in-memory bus/clock instead; this crate exists to show the shape
//! a platform adapter takes, not to be a complete CAN stack.
#![cfg(target_os = "linux")]

use canopen_rs::{Bus, CanOpenError, Clock, Msg, Result, TimerHandle};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Sends and receives frames over a Linux SocketCAN interface (e.g.
/// `can0`) using a blocking socket.
pub struct SocketCanBus {
    socket: CanSocket,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|_| CanOpenError::InternalError)?;
        Ok(SocketCanBus { socket })
    }

    /// Blocks until the next frame arrives and converts it into a `Msg`.
    /// The caller is expected to loop this into `LocalNode::process_frame`.
    pub fn recv(&mut self) -> Result<Msg> {
        let frame = self.socket.read_frame().map_err(|_| CanOpenError::InternalError)?;
        Ok(match frame {
            CanFrame::Data(data) => Msg::new(data.raw_id(), data.data()),
            CanFrame::Remote(remote) => Msg::rtr(remote.raw_id()),
            CanFrame::Error(_) => Msg::new(0, &[]),
        })
    }
}

impl Bus for SocketCanBus {
    fn write(&mut self, msg: &Msg, _async_send: bool) -> Result<()> {
        let id = StandardId::new(msg.id as u16).ok_or(CanOpenError::InternalError)?;
        let frame = if msg.rtr {
            CanFrame::new_remote(id, 0).ok_or(CanOpenError::InternalError)?
        } else {
            CanFrame::new(id, &msg.data).ok_or(CanOpenError::InternalError)?
        };
        self.socket.write_frame(&frame).map_err(|_| CanOpenError::InternalError)
    }
}

struct ScheduledTimer {
    handle: TimerHandle,
    due: Instant,
    period: Option<Duration>,
    callback: Box<dyn FnMut() + Send>,
    cancelled: bool,
}

enum Command {
    Schedule(ScheduledTimer),
    Cancel(TimerHandle),
    Shutdown,
}

/// Backs `Clock` with a single background thread holding a list of
/// pending timers. Scheduling or cancelling sends a command over an
/// `mpsc` channel and the thread wakes from whatever sleep it is in to
/// pick it up.
pub struct ThreadClock {
    commands: mpsc::Sender<Command>,
    next_handle: Arc<Mutex<u64>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadClock {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let worker = thread::spawn(move || run_timer_thread(rx));
        ThreadClock {
            commands: tx,
            next_handle: Arc::new(Mutex::new(1)),
            worker: Some(worker),
        }
    }

    fn alloc_handle(&self) -> TimerHandle {
        let mut next = self.next_handle.lock().unwrap();
        let handle = TimerHandle(*next);
        *next += 1;
        handle
    }
}

impl Drop for ThreadClock {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Clock for ThreadClock {
    fn schedule_delayed(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>) -> TimerHandle {
        let handle = self.alloc_handle();
        let _ = self.commands.send(Command::Schedule(ScheduledTimer {
            handle,
            due: Instant::now() + Duration::from_millis(ms),
            period: None,
            callback: cb,
            cancelled: false,
        }));
        handle
    }

    fn schedule_periodic(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>, staggered_start: bool) -> TimerHandle {
        let handle = self.alloc_handle();
        // No RNG dependency here: stagger deterministically off the
        // handle counter, which is unique per timer and good enough to
        // spread producers that all call this at startup.
        let jitter_ms = if staggered_start { (handle.0.wrapping_mul(2654435761)) % (2 * ms).max(1) } else { 0 };
        let _ = self.commands.send(Command::Schedule(ScheduledTimer {
            handle,
            due: Instant::now() + Duration::from_millis(ms + jitter_ms),
            period: Some(Duration::from_millis(ms)),
            callback: cb,
            cancelled: false,
        }));
        handle
    }

    fn delete_timer(&mut self, handle: &TimerHandle) {
        let _ = self.commands.send(Command::Cancel(*handle));
    }
}

fn run_timer_thread(rx: mpsc::Receiver<Command>) {
    let mut timers: Vec<ScheduledTimer> = Vec::new();
    loop {
        let wait = timers
            .iter()
            .filter(|t| !t.cancelled)
            .map(|t| t.due)
            .min()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(200));

        match rx.recv_timeout(wait) {
            Ok(Command::Schedule(timer)) => timers.push(timer),
            Ok(Command::Cancel(handle)) => {
                if let Some(timer) = timers.iter_mut().find(|t| t.handle == handle) {
                    timer.cancelled = true;
                }
            }
            Ok(Command::Shutdown) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        let mut i = 0;
        while i < timers.len() {
            if timers[i].cancelled {
                timers.swap_remove(i);
                continue;
            }
            if timers[i].due <= now {
                let mut timer = timers.swap_remove(i);
                (timer.callback)();
                if let Some(period) = timer.period {
                    timer.due = now + period;
                    timers.push(timer);
                }
                continue;
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_clock_fires_delayed_callback() {
        let (tx, rx) = mpsc::channel();
        let mut clock = ThreadClock::spawn();
        clock.schedule_delayed(10, Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(2)).expect("timer did not fire");
    }

    #[test]
    fn thread_clock_cancel_prevents_firing() {
        let (tx, rx) = mpsc::channel::<()>();
        let mut clock = ThreadClock::spawn();
        let handle = clock.schedule_delayed(50, Box::new(move || {
            let _ = tx.send(());
        }));
        clock.delete_timer(&handle);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
