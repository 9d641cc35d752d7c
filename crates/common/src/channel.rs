//! Async channel bridge between Tokio runtime and USB thread
//!
//! libusb calls block, so a transport runs them on a dedicated thread. The
//! runtime side sends [`UsbCommand`]s carrying a oneshot responder; the
//! worker answers each one in order.

use async_channel::{Receiver, Sender, bounded};
use protocol::{
    ControlTransferParameters, DeviceFilter, DeviceHandle, Direction, EndpointType, HotplugEvent,
    RawDevice, TransportError,
};
use tokio::sync::oneshot;

/// Responder for a single command
pub type Responder<T> = oneshot::Sender<Result<T, TransportError>>;

/// Operation against one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOp {
    Open,
    Close,
    Reset,
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    SetAlternateSetting {
        interface_number: u8,
        alternate_setting: u8,
    },
    ClearHalt {
        direction: Direction,
        endpoint_number: u8,
    },
    ControlIn {
        setup: ControlTransferParameters,
        length: u16,
    },
    ControlOut {
        setup: ControlTransferParameters,
        data: Vec<u8>,
    },
    GetStringDescriptor(u8),
    TransferIn {
        endpoint_number: u8,
        endpoint_type: EndpointType,
        length: usize,
    },
    TransferOut {
        endpoint_number: u8,
        endpoint_type: EndpointType,
        data: Vec<u8>,
    },
}

impl DeviceOp {
    /// Short operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            DeviceOp::Open => "open",
            DeviceOp::Close => "close",
            DeviceOp::Reset => "reset",
            DeviceOp::SetConfiguration(_) => "set_configuration",
            DeviceOp::ClaimInterface(_) => "claim_interface",
            DeviceOp::ReleaseInterface(_) => "release_interface",
            DeviceOp::SetAlternateSetting { .. } => "set_alternate_setting",
            DeviceOp::ClearHalt { .. } => "clear_halt",
            DeviceOp::ControlIn { .. } => "control_transfer_in",
            DeviceOp::ControlOut { .. } => "control_transfer_out",
            DeviceOp::GetStringDescriptor(_) => "get_string_descriptor",
            DeviceOp::TransferIn { .. } => "transfer_in",
            DeviceOp::TransferOut { .. } => "transfer_out",
        }
    }
}

/// Result payload of a [`DeviceOp`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput {
    Unit,
    Bytes(Vec<u8>),
    Written(usize),
    Text(String),
}

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// Enumerate attached devices
    Enumerate {
        /// Devices whose IDs match none of these are skipped (empty = all)
        pre_filter: Vec<DeviceFilter>,
        /// Channel to send response back
        response: Responder<Vec<RawDevice>>,
    },

    /// Run an operation against a device
    Device {
        handle: DeviceHandle,
        op: DeviceOp,
        /// Channel to send response back
        response: Responder<OpOutput>,
    },

    /// Start forwarding hot-plug events to `sink`
    WatchHotplug {
        /// Subscription ID used to stop watching
        id: u64,
        sink: Sender<HotplugEvent>,
    },

    /// Stop forwarding hot-plug events to a subscription
    UnwatchHotplug { id: u64 },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command without waiting for channel capacity
    ///
    /// Usable from synchronous contexts such as `Drop`.
    pub fn try_send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .try_send(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a device operation and wait for its outcome
    ///
    /// A worker that went away is reported as [`TransportError::NoDevice`].
    pub async fn device_op(
        &self,
        handle: DeviceHandle,
        op: DeviceOp,
    ) -> Result<OpOutput, TransportError> {
        let (response, rx) = oneshot::channel();
        let name = op.name();
        self.send_command(UsbCommand::Device {
            handle,
            op,
            response,
        })
        .await
        .map_err(|e| worker_gone(name, e.to_string()))?;

        rx.await.map_err(|e| worker_gone(name, e.to_string()))?
    }

    /// Ask the worker to enumerate devices
    pub async fn enumerate(
        &self,
        pre_filter: Vec<DeviceFilter>,
    ) -> Result<Vec<RawDevice>, TransportError> {
        let (response, rx) = oneshot::channel();
        self.send_command(UsbCommand::Enumerate {
            pre_filter,
            response,
        })
        .await
        .map_err(|e| worker_gone("enumerate", e.to_string()))?;

        rx.await.map_err(|e| worker_gone("enumerate", e.to_string()))?
    }

    /// Whether the worker thread has dropped its end
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

fn worker_gone(op: &str, reason: String) -> TransportError {
    tracing::warn!("USB worker unavailable during {}: {}", op, reason);
    TransportError::NoDevice
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether every runtime-side handle has been dropped
    pub fn is_orphaned(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);

    (UsbBridge { cmd_tx }, UsbWorker { cmd_rx })
}
