//! USB worker thread
//!
//! Dedicated thread owning the libusb context. It drains commands from the
//! Tokio side, runs `libusb_handle_events()` with a short timeout so
//! hot-plug callbacks fire, and fans queued hot-plug notices out to the
//! watching subscriptions.

use common::{UsbCommand, UsbWorker};
use rusb::{Context, UsbContext};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::manager::{DeviceManager, ManagerSettings, StatusMap};

/// Upper bound on how long a queued command waits behind event handling
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// USB worker thread
pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        context: Context,
        settings: ManagerSettings,
        status: StatusMap,
    ) -> Self {
        let mut manager = DeviceManager::new(context, settings, status);
        manager.initialize();
        Self { manager, worker }
    }

    /// Run until a Shutdown command arrives or every bridge is dropped
    pub fn run(mut self) {
        info!("USB worker thread started");

        loop {
            match self.manager.context().handle_events(Some(EVENT_POLL_INTERVAL)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_POLL_INTERVAL);
                }
            }

            // watchers registered by now see every notice queued so far
            while let Some(cmd) = self.worker.try_recv_command() {
                if matches!(cmd, UsbCommand::Shutdown) {
                    info!("USB worker shutting down");
                    return;
                }
                self.handle_command(cmd);
            }

            if self.worker.is_orphaned() {
                info!("USB worker orphaned, stopping");
                break;
            }

            self.manager.process_hotplug();
        }

        info!("USB worker thread stopped");
    }

    /// Handle a command, keeping the thread alive across panics
    fn handle_command(&mut self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::Enumerate {
                pre_filter,
                response,
            } => {
                let result = self.manager.enumerate(&pre_filter);
                let _ = response.send(result);
            }

            UsbCommand::Device {
                handle,
                op,
                response,
            } => {
                let name = op.name();
                let result = self.manager.device_op(handle, op);
                if let Err(e) = &result {
                    debug!("{} on {} failed: {}", name, handle, e);
                }
                let _ = response.send(result);
            }

            UsbCommand::WatchHotplug { id, sink } => self.manager.watch(id, sink),

            UsbCommand::UnwatchHotplug { id } => self.manager.unwatch(id),

            UsbCommand::Shutdown => {
                // handled in the run loop
            }
        }
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    worker: UsbWorker,
    context: Context,
    settings: ManagerSettings,
    status: StatusMap,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(worker, context, settings, status).run())
}
