//! Local-host transport
//!
//! Implements [`Transport`] by sending every call to the USB worker thread
//! over the common channel bridge and awaiting its oneshot reply.

use async_trait::async_trait;
use common::{DeviceOp, OpOutput, UsbBridge, UsbCommand, create_usb_bridge};
use protocol::{
    ControlTransferParameters, DeviceFilter, DeviceHandle, Direction, EndpointType, RawDevice,
    TransportError,
};
use rusb::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use webusb::config::TransportSettings;
use webusb::transport::{HotplugSubscription, Transport, TransportResult};

use crate::manager::{ManagerSettings, StatusMap};
use crate::transfers::map_rusb_error;
use crate::worker::spawn_usb_worker;

/// Transport backed by libusb on this machine
pub struct HostTransport {
    bridge: UsbBridge,
    status: StatusMap,
    next_watch_id: AtomicU64,
}

impl HostTransport {
    /// Create the libusb context and start the worker thread
    pub fn start(settings: &TransportSettings) -> TransportResult<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        let (bridge, worker) = create_usb_bridge();
        let status = StatusMap::default();

        let manager_settings = ManagerSettings {
            timeout: settings.timeout(),
            skip_root_hubs: settings.skip_root_hubs,
        };
        spawn_usb_worker(worker, context, manager_settings, status.clone()).map_err(|e| {
            TransportError::Other {
                message: format!("Failed to spawn USB worker thread: {}", e),
            }
        })?;

        info!("Host transport started (timeout {:?})", settings.timeout());
        Ok(Self {
            bridge,
            status,
            next_watch_id: AtomicU64::new(1),
        })
    }

    async fn unit(&self, handle: DeviceHandle, op: DeviceOp) -> TransportResult<()> {
        match self.bridge.device_op(handle, op).await? {
            OpOutput::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn bytes(&self, handle: DeviceHandle, op: DeviceOp) -> TransportResult<Vec<u8>> {
        match self.bridge.device_op(handle, op).await? {
            OpOutput::Bytes(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn written(&self, handle: DeviceHandle, op: DeviceOp) -> TransportResult<usize> {
        match self.bridge.device_op(handle, op).await? {
            OpOutput::Written(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(output: OpOutput) -> TransportError {
    TransportError::Other {
        message: format!("unexpected worker reply: {:?}", output),
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        let _ = self.bridge.try_send_command(UsbCommand::Shutdown);
    }
}

impl std::fmt::Debug for HostTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTransport")
            .field("worker_running", &!self.bridge.is_closed())
            .finish()
    }
}

#[async_trait]
impl Transport for HostTransport {
    async fn enumerate(&self, pre_filter: &[DeviceFilter]) -> TransportResult<Vec<RawDevice>> {
        self.bridge.enumerate(pre_filter.to_vec()).await
    }

    fn is_connected(&self, handle: DeviceHandle) -> bool {
        self.status.get(handle).is_some()
    }

    fn is_opened(&self, handle: DeviceHandle) -> bool {
        self.status.get(handle).is_some_and(|s| s.opened)
    }

    async fn open(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.unit(handle, DeviceOp::Open).await
    }

    async fn close(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.unit(handle, DeviceOp::Close).await
    }

    async fn reset(&self, handle: DeviceHandle) -> TransportResult<()> {
        self.unit(handle, DeviceOp::Reset).await
    }

    async fn set_configuration(&self, handle: DeviceHandle, value: u8) -> TransportResult<()> {
        self.unit(handle, DeviceOp::SetConfiguration(value)).await
    }

    async fn claim_interface(
        &self,
        handle: DeviceHandle,
        interface_number: u8,
    ) -> TransportResult<()> {
        self.unit(handle, DeviceOp::ClaimInterface(interface_number))
            .await
    }

    async fn release_interface(
        &self,
        handle: DeviceHandle,
        interface_number: u8,
    ) -> TransportResult<()> {
        self.unit(handle, DeviceOp::ReleaseInterface(interface_number))
            .await
    }

    async fn set_alternate_setting(
        &self,
        handle: DeviceHandle,
        interface_number: u8,
        alternate_setting: u8,
    ) -> TransportResult<()> {
        self.unit(
            handle,
            DeviceOp::SetAlternateSetting {
                interface_number,
                alternate_setting,
            },
        )
        .await
    }

    async fn clear_halt(
        &self,
        handle: DeviceHandle,
        direction: Direction,
        endpoint_number: u8,
    ) -> TransportResult<()> {
        self.unit(
            handle,
            DeviceOp::ClearHalt {
                direction,
                endpoint_number,
            },
        )
        .await
    }

    async fn control_transfer_in(
        &self,
        handle: DeviceHandle,
        setup: ControlTransferParameters,
        length: u16,
    ) -> TransportResult<Vec<u8>> {
        self.bytes(handle, DeviceOp::ControlIn { setup, length })
            .await
    }

    async fn control_transfer_out(
        &self,
        handle: DeviceHandle,
        setup: ControlTransferParameters,
        data: &[u8],
    ) -> TransportResult<usize> {
        self.written(
            handle,
            DeviceOp::ControlOut {
                setup,
                data: data.to_vec(),
            },
        )
        .await
    }

    async fn get_string_descriptor(
        &self,
        handle: DeviceHandle,
        index: u8,
    ) -> TransportResult<String> {
        match self
            .bridge
            .device_op(handle, DeviceOp::GetStringDescriptor(index))
            .await?
        {
            OpOutput::Text(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    async fn transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        endpoint_type: EndpointType,
        length: usize,
    ) -> TransportResult<Vec<u8>> {
        self.bytes(
            handle,
            DeviceOp::TransferIn {
                endpoint_number,
                endpoint_type,
                length,
            },
        )
        .await
    }

    async fn transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        endpoint_type: EndpointType,
        data: &[u8],
    ) -> TransportResult<usize> {
        self.written(
            handle,
            DeviceOp::TransferOut {
                endpoint_number,
                endpoint_type,
                data: data.to_vec(),
            },
        )
        .await
    }

    /// libusb's synchronous API has no isochronous transfers
    async fn isochronous_transfer_in(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        _packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<Vec<u8>>>> {
        debug!(
            "Isochronous IN on {} endpoint {} not supported",
            handle, endpoint_number
        );
        Err(TransportError::NotSupported)
    }

    async fn isochronous_transfer_out(
        &self,
        handle: DeviceHandle,
        endpoint_number: u8,
        _data: &[u8],
        _packet_lengths: &[usize],
    ) -> TransportResult<Vec<TransportResult<usize>>> {
        debug!(
            "Isochronous OUT on {} endpoint {} not supported",
            handle, endpoint_number
        );
        Err(TransportError::NotSupported)
    }

    /// The worker applies the registration before its next hot-plug fan-out
    fn watch_hotplug(&self) -> TransportResult<HotplugSubscription> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (sink, events) = async_channel::unbounded();

        self.bridge
            .try_send_command(UsbCommand::WatchHotplug { id, sink })
            .map_err(|e| TransportError::Other {
                message: e.to_string(),
            })?;

        let bridge = self.bridge.clone();
        Ok(HotplugSubscription::new(events, move || {
            let _ = bridge.try_send_command(UsbCommand::UnwatchHotplug { id });
        }))
    }
}
