use std::{
    io,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info};

use crate::{
    flash::FlashTarget,
    http::HttpTransport,
    status::StatusHandle,
    updater::{CycleReport, DeviceControl, OtaUpdater},
};

pub const OTA_TASK_NAME: &str = "ota-task";

/// Blocks until the network link is usable.
pub trait ConnectivityGate {
    fn wait_until_connected(&self);
}

/// Link state published by the network code. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ConnectivitySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ConnectivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_connected(&self) {
        self.set(true);
    }

    pub fn notify_disconnected(&self) {
        self.set(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, connected: bool) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != connected {
            *state = connected;
            condvar.notify_all();
        }
    }
}

impl ConnectivityGate for ConnectivitySignal {
    fn wait_until_connected(&self) {
        let (lock, condvar) = &*self.inner;
        let state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !*state {
            info!("[ota] waiting for network connectivity");
        }
        let _connected = condvar
            .wait_while(state, |connected| !*connected)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[derive(Debug)]
enum SchedulerCommand {
    CheckNow,
}

/// Lets other contexts ask for an early check. The request is queued to the
/// update task, so it can only shorten the current wait.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Returns `false` once the update task is gone.
    pub fn check_now(&self) -> bool {
        self.commands.send(SchedulerCommand::CheckNow).is_ok()
    }
}

pub struct UpdateScheduler<T, F, D, G> {
    updater: OtaUpdater<T, F, D>,
    gate: G,
    interval: Duration,
    commands: Receiver<SchedulerCommand>,
    handle: SchedulerHandle,
}

impl<T, F, D, G> UpdateScheduler<T, F, D, G>
where
    T: HttpTransport,
    F: FlashTarget,
    D: DeviceControl,
    G: ConnectivityGate,
{
    pub fn new(updater: OtaUpdater<T, F, D>, gate: G) -> Self {
        let (tx, commands) = mpsc::channel();
        Self {
            interval: updater.config().check_interval,
            updater,
            gate,
            commands,
            handle: SchedulerHandle { commands: tx },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> StatusHandle {
        self.updater.status()
    }

    /// One gated cycle.
    pub fn tick(&mut self) -> CycleReport {
        self.gate.wait_until_connected();
        self.updater.run_cycle()
    }

    /// Sleep until the next cycle is due. Returns `true` if woken early by
    /// [`SchedulerHandle::check_now`]; queued duplicates are collapsed.
    pub fn wait_for_next(&self) -> bool {
        match self.commands.recv_timeout(self.interval) {
            Ok(SchedulerCommand::CheckNow) => {
                while self.commands.try_recv().is_ok() {}
                debug!("[ota] early check requested");
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run cycles forever. Only a successful update leaves this loop, by
    /// restarting the device.
    pub fn run(mut self) -> ! {
        info!(
            "[ota] update task started (interval {}s, current version {})",
            self.interval.as_secs(),
            self.updater.config().current_version
        );

        if !self.updater.config().check_on_start {
            self.wait_for_next();
        }

        loop {
            let report = self.tick();
            debug!("[ota] cycle finished: {}", report.outcome.as_str());
            self.wait_for_next();
        }
    }
}

impl<T, F, D, G> UpdateScheduler<T, F, D, G>
where
    T: HttpTransport + Send + 'static,
    F: FlashTarget + Send + 'static,
    D: DeviceControl + Send + 'static,
    G: ConnectivityGate + Send + 'static,
{
    /// Move the scheduler onto its own thread with the configured stack.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let stack_size = self.updater.config().task_stack_bytes;
        thread::Builder::new()
            .name(OTA_TASK_NAME.to_string())
            .stack_size(stack_size)
            .spawn(move || self.run())
    }
}
