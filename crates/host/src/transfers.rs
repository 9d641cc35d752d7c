//! USB transfer execution
//!
//! Synchronous control, bulk and interrupt transfers on an open libusb
//! handle. Every rusb error is mapped onto the closed transport vocabulary.

use protocol::{ControlTransferParameters, Direction, EndpointType, TransportError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Execute a control transfer with a device-to-host data stage
pub fn control_in(
    handle: &DeviceHandle<Context>,
    setup: ControlTransferParameters,
    length: u16,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let request_type = setup.request_type_byte(Direction::In);
    trace!(
        "Control IN: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        request_type, setup.request, setup.value, setup.index, length
    );

    let mut buffer = vec![0u8; length as usize];
    let len = handle
        .read_control(
            request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            timeout,
        )
        .map_err(map_rusb_error)?;
    buffer.truncate(len);
    Ok(buffer)
}

/// Execute a control transfer with a host-to-device data stage
pub fn control_out(
    handle: &DeviceHandle<Context>,
    setup: ControlTransferParameters,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    let request_type = setup.request_type_byte(Direction::Out);
    trace!(
        "Control OUT: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        request_type,
        setup.request,
        setup.value,
        setup.index,
        data.len()
    );

    handle
        .write_control(
            request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            timeout,
        )
        .map_err(map_rusb_error)
}

/// Read from a bulk or interrupt IN endpoint
pub fn transfer_in(
    handle: &DeviceHandle<Context>,
    endpoint_number: u8,
    endpoint_type: EndpointType,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let endpoint = Direction::In.endpoint_address(endpoint_number);
    let mut buffer = vec![0u8; length];

    let len = match endpoint_type {
        EndpointType::Bulk => handle.read_bulk(endpoint, &mut buffer, timeout),
        EndpointType::Interrupt => handle.read_interrupt(endpoint, &mut buffer, timeout),
        EndpointType::Isochronous => return Err(TransportError::NotSupported),
    }
    .map_err(map_rusb_error)?;

    debug!(
        "{} IN on endpoint {:#x}: {} of {} bytes",
        endpoint_type, endpoint, len, length
    );
    buffer.truncate(len);
    Ok(buffer)
}

/// Write to a bulk or interrupt OUT endpoint
pub fn transfer_out(
    handle: &DeviceHandle<Context>,
    endpoint_number: u8,
    endpoint_type: EndpointType,
    data: &[u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    let endpoint = Direction::Out.endpoint_address(endpoint_number);

    let written = match endpoint_type {
        EndpointType::Bulk => handle.write_bulk(endpoint, data, timeout),
        EndpointType::Interrupt => handle.write_interrupt(endpoint, data, timeout),
        EndpointType::Isochronous => return Err(TransportError::NotSupported),
    }
    .map_err(map_rusb_error)?;

    debug!(
        "{} OUT on endpoint {:#x}: {} of {} bytes",
        endpoint_type,
        endpoint,
        written,
        data.len()
    );
    Ok(written)
}

/// Read a string descriptor in the first language the device reports
pub fn read_string(
    handle: &DeviceHandle<Context>,
    index: u8,
    timeout: Duration,
) -> Result<String, TransportError> {
    if index == 0 {
        return Err(TransportError::InvalidParam);
    }

    let languages = handle.read_languages(timeout).map_err(map_rusb_error)?;
    let language = languages.first().copied().ok_or(TransportError::NotFound)?;

    handle
        .read_string_descriptor(language, index, timeout)
        .map_err(map_rusb_error)
}

/// Map rusb errors to transport errors
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::NoDevice => TransportError::NoDevice,
        rusb::Error::NotFound => TransportError::NotFound,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Io => TransportError::Io,
        rusb::Error::InvalidParam => TransportError::InvalidParam,
        rusb::Error::Access => TransportError::Access,
        rusb::Error::NotSupported => TransportError::NotSupported,
        _ => TransportError::Other {
            message: err.to_string(),
        },
    }
}
