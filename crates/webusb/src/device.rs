//! USB device handle exposed to callers
//!
//! `UsbDevice` pairs the immutable [`DeviceInfo`] snapshot with the mutable
//! protocol state (active configuration, claimed interfaces, alternate
//! settings). Every operation runs its sequencing check, calls the
//! transport, then records the new state. The state lock is never held
//! across a transport call.

use protocol::{
    ControlTransferParameters, DeviceHandle, Direction, InTransferResult, IsochronousInPacket,
    IsochronousInTransferResult, IsochronousOutPacket, IsochronousOutTransferResult,
    OutTransferResult, TransferStatus, TransportError,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Configuration, DeviceIdentity, DeviceInfo};
use crate::sequencing::{self, DeviceState, DeviceView, InterfaceState, Step, TransferKind};
use crate::transport::Transport;

/// A discovered USB device
pub struct UsbDevice {
    transport: Arc<dyn Transport>,
    handle: DeviceHandle,
    info: DeviceInfo,
    state: Mutex<DeviceState>,
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("handle", &self.handle)
            .field("vendor_id", &format_args!("{:04x}", self.info.vendor_id))
            .field("product_id", &format_args!("{:04x}", self.info.product_id))
            .field("state", &*self.lock())
            .finish()
    }
}

impl UsbDevice {
    pub fn new(
        transport: Arc<dyn Transport>,
        handle: DeviceHandle,
        info: DeviceInfo,
        active_configuration: Option<u8>,
    ) -> Self {
        Self {
            transport,
            handle,
            info,
            state: Mutex::new(DeviceState::new(active_configuration)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a sequencing check against a consistent snapshot of the state
    ///
    /// Claims recorded before the transport closed the handle are dropped
    /// first, so a closed device never carries a claimed interface.
    fn check<T>(&self, f: impl FnOnce(&DeviceView<'_>) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        let opened = self.opened();
        if !opened && !state.claimed_interfaces().is_empty() {
            debug!("Device {} closed underneath, dropping claims", self.handle);
            state.reset_interfaces();
        }
        let view = DeviceView {
            connected: self.connected(),
            opened,
            info: &self.info,
            state: &state,
        };
        f(&view)
    }

    /// Transport handle this device is bound to
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.info.identity()
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.info.product_id
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.info.serial_number.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.info.url.as_deref()
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.info.configurations
    }

    /// The active configuration, if one is selected
    pub fn configuration(&self) -> Option<&Configuration> {
        let value = self.lock().configuration_value?;
        self.info.configuration(value)
    }

    pub fn configuration_value(&self) -> Option<u8> {
        self.lock().configuration_value
    }

    pub fn connected(&self) -> bool {
        self.transport.is_connected(self.handle)
    }

    pub fn opened(&self) -> bool {
        self.transport.is_opened(self.handle)
    }

    /// Claim/alternate state of an interface of the active configuration
    ///
    /// Interfaces always read as unclaimed while the device is closed.
    pub fn interface_state(&self, interface_number: u8) -> InterfaceState {
        let mut state = self.lock().interface(interface_number);
        if !self.opened() {
            state.claimed = false;
        }
        state
    }

    pub async fn open(&self) -> Result<()> {
        if self.check(sequencing::check_open)? == Step::Skip {
            return Ok(());
        }
        self.transport
            .open(self.handle)
            .await
            .map_err(Error::transport(sequencing::OPEN))?;
        info!("Opened device {}", self.handle);
        Ok(())
    }

    /// Release every claimed interface (best-effort), then close
    pub async fn close(&self) -> Result<()> {
        if self.check(sequencing::check_close)? == Step::Skip {
            return Ok(());
        }

        let claimed = self.lock().claimed_interfaces();
        for interface_number in claimed {
            if let Err(e) = self
                .transport
                .release_interface(self.handle, interface_number)
                .await
            {
                debug!(
                    "Ignoring release failure for interface {} on {}: {}",
                    interface_number, self.handle, e
                );
            }
        }

        let result = self.transport.close(self.handle).await;
        self.lock().reset_interfaces();
        result.map_err(Error::transport(sequencing::CLOSE))?;
        info!("Closed device {}", self.handle);
        Ok(())
    }

    pub async fn select_configuration(&self, configuration_value: u8) -> Result<()> {
        let step =
            self.check(|view| sequencing::check_select_configuration(view, configuration_value))?;
        if step == Step::Skip {
            return Ok(());
        }

        self.transport
            .set_configuration(self.handle, configuration_value)
            .await
            .map_err(Error::transport(sequencing::SELECT_CONFIGURATION))?;

        let mut state = self.lock();
        state.configuration_value = Some(configuration_value);
        state.reset_interfaces();
        debug!(
            "Device {} configuration set to {}",
            self.handle, configuration_value
        );
        Ok(())
    }

    pub async fn claim_interface(&self, interface_number: u8) -> Result<()> {
        let step = self.check(|view| sequencing::check_claim_interface(view, interface_number))?;
        if step == Step::Skip {
            return Ok(());
        }

        self.transport
            .claim_interface(self.handle, interface_number)
            .await
            .map_err(Error::transport(sequencing::CLAIM_INTERFACE))?;

        self.lock().interface_mut(interface_number).claimed = true;
        debug!("Claimed interface {} on {}", interface_number, self.handle);
        Ok(())
    }

    pub async fn release_interface(&self, interface_number: u8) -> Result<()> {
        let step =
            self.check(|view| sequencing::check_release_interface(view, interface_number))?;
        if step == Step::Skip {
            return Ok(());
        }

        self.transport
            .release_interface(self.handle, interface_number)
            .await
            .map_err(Error::transport(sequencing::RELEASE_INTERFACE))?;

        self.lock().interface_mut(interface_number).claimed = false;
        debug!("Released interface {} on {}", interface_number, self.handle);
        Ok(())
    }

    pub async fn select_alternate_interface(
        &self,
        interface_number: u8,
        alternate_setting: u8,
    ) -> Result<()> {
        self.check(|view| {
            sequencing::check_select_alternate_interface(view, interface_number, alternate_setting)
        })?;

        self.transport
            .set_alternate_setting(self.handle, interface_number, alternate_setting)
            .await
            .map_err(Error::transport(sequencing::SELECT_ALTERNATE_INTERFACE))?;

        self.lock().interface_mut(interface_number).alternate_setting = alternate_setting;
        debug!(
            "Interface {} on {} switched to alternate {}",
            interface_number, self.handle, alternate_setting
        );
        Ok(())
    }

    pub async fn control_transfer_in(
        &self,
        setup: ControlTransferParameters,
        length: u16,
    ) -> Result<InTransferResult> {
        let op = sequencing::CONTROL_TRANSFER_IN;
        self.check(|view| sequencing::check_control_transfer(view, op, &setup))?;

        let result = self
            .transport
            .control_transfer_in(self.handle, setup, length)
            .await;
        in_result(op, result)
    }

    pub async fn control_transfer_out(
        &self,
        setup: ControlTransferParameters,
        data: &[u8],
    ) -> Result<OutTransferResult> {
        let op = sequencing::CONTROL_TRANSFER_OUT;
        self.check(|view| sequencing::check_control_transfer(view, op, &setup))?;

        let bytes_written = self
            .transport
            .control_transfer_out(self.handle, setup, data)
            .await
            .map_err(Error::transport(op))?;
        Ok(OutTransferResult {
            bytes_written,
            status: TransferStatus::Ok,
        })
    }

    pub async fn clear_halt(&self, direction: Direction, endpoint_number: u8) -> Result<()> {
        let op = sequencing::CLEAR_HALT;
        self.check(|view| {
            sequencing::check_endpoint_transfer(
                view,
                op,
                direction,
                endpoint_number,
                TransferKind::Data,
            )
        })?;

        self.transport
            .clear_halt(self.handle, direction, endpoint_number)
            .await
            .map_err(Error::transport(op))
    }

    /// Bulk or interrupt IN transfer
    pub async fn transfer_in(
        &self,
        endpoint_number: u8,
        length: usize,
    ) -> Result<InTransferResult> {
        let op = sequencing::TRANSFER_IN;
        let endpoint = self.check(|view| {
            sequencing::check_endpoint_transfer(
                view,
                op,
                Direction::In,
                endpoint_number,
                TransferKind::Data,
            )
        })?;

        let result = self
            .transport
            .transfer_in(self.handle, endpoint_number, endpoint.endpoint_type, length)
            .await;
        in_result(op, result)
    }

    /// Bulk or interrupt OUT transfer
    pub async fn transfer_out(
        &self,
        endpoint_number: u8,
        data: &[u8],
    ) -> Result<OutTransferResult> {
        let op = sequencing::TRANSFER_OUT;
        let endpoint = self.check(|view| {
            sequencing::check_endpoint_transfer(
                view,
                op,
                Direction::Out,
                endpoint_number,
                TransferKind::Data,
            )
        })?;

        let bytes_written = self
            .transport
            .transfer_out(self.handle, endpoint_number, endpoint.endpoint_type, data)
            .await
            .map_err(Error::transport(op))?;
        Ok(OutTransferResult {
            bytes_written,
            status: TransferStatus::Ok,
        })
    }

    pub async fn isochronous_transfer_in(
        &self,
        endpoint_number: u8,
        packet_lengths: &[usize],
    ) -> Result<IsochronousInTransferResult> {
        let op = sequencing::ISOCHRONOUS_TRANSFER_IN;
        self.check(|view| {
            sequencing::check_endpoint_transfer(
                view,
                op,
                Direction::In,
                endpoint_number,
                TransferKind::Isochronous,
            )
        })?;

        let outcomes = self
            .transport
            .isochronous_transfer_in(self.handle, endpoint_number, packet_lengths)
            .await
            .map_err(Error::transport(op))?;

        let mut data = Vec::new();
        let mut packets = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let packet = match outcome {
                Ok(bytes) => {
                    data.extend_from_slice(&bytes);
                    IsochronousInPacket {
                        data: bytes,
                        status: TransferStatus::Ok,
                    }
                }
                Err(e) => IsochronousInPacket {
                    data: Vec::new(),
                    status: packet_status(op, e)?,
                },
            };
            packets.push(packet);
        }
        Ok(IsochronousInTransferResult { data, packets })
    }

    pub async fn isochronous_transfer_out(
        &self,
        endpoint_number: u8,
        data: &[u8],
        packet_lengths: &[usize],
    ) -> Result<IsochronousOutTransferResult> {
        let op = sequencing::ISOCHRONOUS_TRANSFER_OUT;
        if packet_lengths.iter().sum::<usize>() != data.len() {
            return Err(Error::type_error(
                op,
                "packet lengths do not add up to the data length",
            ));
        }
        self.check(|view| {
            sequencing::check_endpoint_transfer(
                view,
                op,
                Direction::Out,
                endpoint_number,
                TransferKind::Isochronous,
            )
        })?;

        let outcomes = self
            .transport
            .isochronous_transfer_out(self.handle, endpoint_number, data, packet_lengths)
            .await
            .map_err(Error::transport(op))?;

        let packets = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(bytes_written) => Ok(IsochronousOutPacket {
                    bytes_written,
                    status: TransferStatus::Ok,
                }),
                Err(e) => Ok(IsochronousOutPacket {
                    bytes_written: 0,
                    status: packet_status(op, e)?,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IsochronousOutTransferResult { packets })
    }

    pub async fn reset(&self) -> Result<()> {
        self.check(sequencing::check_reset)?;
        self.transport
            .reset(self.handle)
            .await
            .map_err(Error::transport(sequencing::RESET))?;
        info!("Reset device {}", self.handle);
        Ok(())
    }
}

/// Stall and babble on an IN transfer are results, not failures
fn in_result(
    op: &'static str,
    result: std::result::Result<Vec<u8>, TransportError>,
) -> Result<InTransferResult> {
    match result {
        Ok(data) => Ok(InTransferResult {
            data,
            status: TransferStatus::Ok,
        }),
        Err(e) => match e.in_transfer_status() {
            Some(status) => {
                debug!("{} completed with status {:?}", op, status);
                Ok(InTransferResult {
                    data: Vec::new(),
                    status,
                })
            }
            None => {
                warn!("{} failed: {}", op, e);
                Err(Error::transport(op)(e))
            }
        },
    }
}

fn packet_status(op: &'static str, error: TransportError) -> Result<TransferStatus> {
    error
        .in_transfer_status()
        .ok_or_else(|| Error::transport(op)(error))
}
