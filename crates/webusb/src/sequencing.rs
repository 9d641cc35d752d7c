//! Call sequencing rules
//!
//! Pure precondition checks for every device operation. A check either
//! rejects the call with a typed error, tells the caller the call is
//! already satisfied ([`Step::Skip`]), or clears it to go to the transport
//! ([`Step::Proceed`]). Nothing in here touches the transport, so a
//! rejected call never has partial side effects.

use protocol::{ControlTransferParameters, Direction, EndpointType, Recipient};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::{Configuration, DeviceInfo, Endpoint, Interface};

pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";
pub const RESET: &str = "reset";
pub const SELECT_CONFIGURATION: &str = "select_configuration";
pub const CLAIM_INTERFACE: &str = "claim_interface";
pub const RELEASE_INTERFACE: &str = "release_interface";
pub const SELECT_ALTERNATE_INTERFACE: &str = "select_alternate_interface";
pub const CONTROL_TRANSFER_IN: &str = "control_transfer_in";
pub const CONTROL_TRANSFER_OUT: &str = "control_transfer_out";
pub const CLEAR_HALT: &str = "clear_halt";
pub const TRANSFER_IN: &str = "transfer_in";
pub const TRANSFER_OUT: &str = "transfer_out";
pub const ISOCHRONOUS_TRANSFER_IN: &str = "isochronous_transfer_in";
pub const ISOCHRONOUS_TRANSFER_OUT: &str = "isochronous_transfer_out";

/// Runtime state of one interface of the active configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub claimed: bool,
    pub alternate_setting: u8,
}

/// Mutable protocol state of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// bConfigurationValue of the active configuration
    pub configuration_value: Option<u8>,
    /// Interfaces with non-default state; absent means unclaimed, alternate 0
    pub interfaces: BTreeMap<u8, InterfaceState>,
}

impl DeviceState {
    pub fn new(configuration_value: Option<u8>) -> Self {
        Self {
            configuration_value,
            interfaces: BTreeMap::new(),
        }
    }

    pub fn interface(&self, interface_number: u8) -> InterfaceState {
        self.interfaces
            .get(&interface_number)
            .copied()
            .unwrap_or_default()
    }

    pub fn interface_mut(&mut self, interface_number: u8) -> &mut InterfaceState {
        self.interfaces.entry(interface_number).or_default()
    }

    /// Claimed interface numbers in ascending order
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.interfaces
            .iter()
            .filter(|(_, s)| s.claimed)
            .map(|(n, _)| *n)
            .collect()
    }

    /// Return every interface to unclaimed, alternate setting 0
    pub fn reset_interfaces(&mut self) {
        self.interfaces.clear();
    }
}

/// Outcome of a successful precondition check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Already in the requested state; no transport call needed
    Skip,
    /// Issue the transport call
    Proceed,
}

/// Which transfer family an endpoint is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Bulk or interrupt transfers (and clear_halt)
    Data,
    Isochronous,
}

/// Everything a check needs to know about a device at one instant
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    pub connected: bool,
    pub opened: bool,
    pub info: &'a DeviceInfo,
    pub state: &'a DeviceState,
}

impl<'a> DeviceView<'a> {
    pub fn active_configuration(&self) -> Option<&'a Configuration> {
        self.state
            .configuration_value
            .and_then(|value| self.info.configuration(value))
    }

    fn require_connected(&self, op: &'static str) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::not_found(op, "device not found"))
        }
    }

    fn require_opened(&self, op: &'static str) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::invalid_state(op, "device not opened"))
        }
    }

    fn find_interface(&self, op: &'static str, interface_number: u8) -> Result<&'a Interface> {
        self.active_configuration()
            .and_then(|config| config.interface(interface_number))
            .ok_or_else(|| Error::not_found(op, "interface not found"))
    }

    fn require_claimed(&self, op: &'static str, interface_number: u8) -> Result<()> {
        if self.state.interface(interface_number).claimed {
            Ok(())
        } else {
            Err(Error::invalid_state(op, "interface not claimed"))
        }
    }

    /// Endpoint on the current alternate setting of any interface of the
    /// active configuration, with the number of the interface owning it
    pub fn find_endpoint(
        &self,
        endpoint_number: u8,
        direction: Direction,
    ) -> Option<(u8, Endpoint)> {
        let config = self.active_configuration()?;
        config.interfaces.iter().find_map(|interface| {
            let current = self.state.interface(interface.interface_number).alternate_setting;
            interface
                .alternate(current)
                .and_then(|alt| alt.endpoint(endpoint_number, direction))
                .map(|endpoint| (interface.interface_number, *endpoint))
        })
    }
}

pub fn check_open(view: &DeviceView<'_>) -> Result<Step> {
    view.require_connected(OPEN)?;
    Ok(if view.opened { Step::Skip } else { Step::Proceed })
}

pub fn check_close(view: &DeviceView<'_>) -> Result<Step> {
    view.require_connected(CLOSE)?;
    Ok(if view.opened { Step::Proceed } else { Step::Skip })
}

pub fn check_reset(view: &DeviceView<'_>) -> Result<()> {
    view.require_connected(RESET)?;
    view.require_opened(RESET)
}

/// Selecting the already active configuration is a no-op, even before
/// the connection and open checks.
pub fn check_select_configuration(view: &DeviceView<'_>, value: u8) -> Result<Step> {
    if view.state.configuration_value == Some(value) {
        return Ok(Step::Skip);
    }
    view.require_connected(SELECT_CONFIGURATION)?;
    if view.info.configuration(value).is_none() {
        return Err(Error::not_found(
            SELECT_CONFIGURATION,
            "configuration not found",
        ));
    }
    view.require_opened(SELECT_CONFIGURATION)?;
    Ok(Step::Proceed)
}

pub fn check_claim_interface(view: &DeviceView<'_>, interface_number: u8) -> Result<Step> {
    view.require_connected(CLAIM_INTERFACE)?;
    view.find_interface(CLAIM_INTERFACE, interface_number)?;
    view.require_opened(CLAIM_INTERFACE)?;
    Ok(if view.state.interface(interface_number).claimed {
        Step::Skip
    } else {
        Step::Proceed
    })
}

pub fn check_release_interface(view: &DeviceView<'_>, interface_number: u8) -> Result<Step> {
    view.require_connected(RELEASE_INTERFACE)?;
    view.find_interface(RELEASE_INTERFACE, interface_number)?;
    view.require_opened(RELEASE_INTERFACE)?;
    Ok(if view.state.interface(interface_number).claimed {
        Step::Proceed
    } else {
        Step::Skip
    })
}

pub fn check_select_alternate_interface(
    view: &DeviceView<'_>,
    interface_number: u8,
    alternate_setting: u8,
) -> Result<()> {
    let op = SELECT_ALTERNATE_INTERFACE;
    view.require_connected(op)?;
    let interface = view.find_interface(op, interface_number)?;
    if interface.alternate(alternate_setting).is_none() {
        return Err(Error::not_found(op, "alternate setting not found"));
    }
    view.require_opened(op)?;
    view.require_claimed(op, interface_number)
}

/// Control transfers addressed to an interface or endpoint require that
/// interface (or the interface owning the endpoint) to be claimed.
pub fn check_control_transfer(
    view: &DeviceView<'_>,
    op: &'static str,
    setup: &ControlTransferParameters,
) -> Result<()> {
    view.require_connected(op)?;
    view.require_opened(op)?;

    match setup.recipient {
        Recipient::Interface => {
            let interface_number = (setup.index & 0xff) as u8;
            view.find_interface(op, interface_number)?;
            view.require_claimed(op, interface_number)
        }
        Recipient::Endpoint => {
            let endpoint_number = (setup.index & 0x0f) as u8;
            let direction = Direction::from_address((setup.index & 0x80) as u8);
            let (interface_number, _) = view
                .find_endpoint(endpoint_number, direction)
                .ok_or_else(|| Error::not_found(op, "endpoint not found"))?;
            view.require_claimed(op, interface_number)
        }
        Recipient::Device | Recipient::Other => Ok(()),
    }
}

/// Check a bulk, interrupt, isochronous or clear-halt call against an
/// endpoint and return the endpoint on success.
pub fn check_endpoint_transfer(
    view: &DeviceView<'_>,
    op: &'static str,
    direction: Direction,
    endpoint_number: u8,
    kind: TransferKind,
) -> Result<Endpoint> {
    view.require_connected(op)?;
    let (interface_number, endpoint) = view
        .find_endpoint(endpoint_number, direction)
        .ok_or_else(|| Error::not_found(op, "endpoint not found"))?;

    match (kind, endpoint.endpoint_type) {
        (TransferKind::Data, EndpointType::Bulk | EndpointType::Interrupt)
        | (TransferKind::Isochronous, EndpointType::Isochronous) => {}
        (TransferKind::Data, _) => {
            return Err(Error::invalid_access(
                op,
                "endpoint is not a bulk or interrupt endpoint",
            ));
        }
        (TransferKind::Isochronous, _) => {
            return Err(Error::invalid_access(
                op,
                "endpoint is not an isochronous endpoint",
            ));
        }
    }

    view.require_opened(op)?;
    view.require_claimed(op, interface_number)?;
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::{DeviceInfo, StringTable};
    use common::test_utils::{
        BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT, INTERRUPT_IN_ENDPOINT, ISO_IN_ENDPOINT,
        create_mock_raw_device,
    };
    use protocol::RequestType;

    fn info() -> DeviceInfo {
        DeviceInfo::new(
            &create_mock_raw_device(1, 1, 0x1234, 0x5678),
            &StringTable::new(),
            None,
        )
    }

    fn view<'a>(info: &'a DeviceInfo, state: &'a DeviceState, opened: bool) -> DeviceView<'a> {
        DeviceView {
            connected: true,
            opened,
            info,
            state,
        }
    }

    fn configured_and_claimed() -> DeviceState {
        let mut state = DeviceState::new(Some(1));
        state.interface_mut(0).claimed = true;
        state
    }

    #[test]
    fn test_open_close_steps() {
        let info = info();
        let state = DeviceState::default();

        assert_eq!(check_open(&view(&info, &state, false)), Ok(Step::Proceed));
        assert_eq!(check_open(&view(&info, &state, true)), Ok(Step::Skip));
        assert_eq!(check_close(&view(&info, &state, false)), Ok(Step::Skip));
        assert_eq!(check_close(&view(&info, &state, true)), Ok(Step::Proceed));

        let gone = DeviceView {
            connected: false,
            ..view(&info, &state, true)
        };
        assert_eq!(check_open(&gone).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(check_close(&gone).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(check_reset(&gone).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_select_configuration_rules() {
        let info = info();
        let state = DeviceState::new(Some(1));
        let gone = DeviceView {
            connected: false,
            ..view(&info, &state, false)
        };
        // same value wins over every other check
        assert_eq!(check_select_configuration(&gone, 1), Ok(Step::Skip));

        let state = DeviceState::default();
        let err = check_select_configuration(&view(&info, &state, true), 9).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = check_select_configuration(&view(&info, &state, false), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            check_select_configuration(&view(&info, &state, true), 1),
            Ok(Step::Proceed)
        );
    }

    #[test]
    fn test_claim_interface_rules() {
        let info = info();
        let unconfigured = DeviceState::default();
        let err = check_claim_interface(&view(&info, &unconfigured, true), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let state = DeviceState::new(Some(1));
        let err = check_claim_interface(&view(&info, &state, false), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "claim_interface error: device not opened");

        let err = check_claim_interface(&view(&info, &state, true), 7).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(
            check_claim_interface(&view(&info, &state, true), 0),
            Ok(Step::Proceed)
        );
        let claimed = configured_and_claimed();
        assert_eq!(
            check_claim_interface(&view(&info, &claimed, true), 0),
            Ok(Step::Skip)
        );
        assert_eq!(
            check_release_interface(&view(&info, &claimed, true), 0),
            Ok(Step::Proceed)
        );
        assert_eq!(
            check_release_interface(&view(&info, &state, true), 0),
            Ok(Step::Skip)
        );
    }

    #[test]
    fn test_select_alternate_rules() {
        let info = info();
        let state = DeviceState::new(Some(1));
        let err = check_select_alternate_interface(&view(&info, &state, true), 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let claimed = configured_and_claimed();
        let err =
            check_select_alternate_interface(&view(&info, &claimed, true), 0, 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(check_select_alternate_interface(&view(&info, &claimed, true), 0, 1).is_ok());
    }

    #[test]
    fn test_endpoint_lookup_follows_alternate_setting() {
        let info = info();
        let mut state = configured_and_claimed();

        let v = view(&info, &state, true);
        assert!(v.find_endpoint(BULK_IN_ENDPOINT, Direction::In).is_some());
        assert!(v.find_endpoint(ISO_IN_ENDPOINT, Direction::In).is_none());

        state.interface_mut(0).alternate_setting = 1;
        let v = view(&info, &state, true);
        assert!(v.find_endpoint(BULK_IN_ENDPOINT, Direction::In).is_none());
        assert_eq!(
            v.find_endpoint(ISO_IN_ENDPOINT, Direction::In).map(|(i, _)| i),
            Some(0)
        );
    }

    #[test]
    fn test_endpoint_transfer_rules() {
        let info = info();
        let state = configured_and_claimed();
        let v = view(&info, &state, true);

        let ep = check_endpoint_transfer(
            &v,
            TRANSFER_IN,
            Direction::In,
            BULK_IN_ENDPOINT,
            TransferKind::Data,
        )
        .unwrap();
        assert_eq!(ep.endpoint_type, EndpointType::Bulk);

        // direction is part of the lookup
        let err = check_endpoint_transfer(
            &v,
            TRANSFER_OUT,
            Direction::Out,
            BULK_IN_ENDPOINT,
            TransferKind::Data,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = check_endpoint_transfer(
            &v,
            ISOCHRONOUS_TRANSFER_OUT,
            Direction::Out,
            BULK_OUT_ENDPOINT,
            TransferKind::Isochronous,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAccess);

        // interface 1 is not claimed
        let err = check_endpoint_transfer(
            &v,
            TRANSFER_IN,
            Direction::In,
            INTERRUPT_IN_ENDPOINT,
            TransferKind::Data,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "transfer_in error: interface not claimed");
    }

    #[test]
    fn test_control_transfer_recipients() {
        let info = info();
        let state = configured_and_claimed();
        let v = view(&info, &state, true);

        let setup = |recipient, index| ControlTransferParameters {
            request_type: RequestType::Vendor,
            recipient,
            request: 1,
            value: 0,
            index,
        };

        assert!(
            check_control_transfer(&v, CONTROL_TRANSFER_IN, &setup(Recipient::Device, 0)).is_ok()
        );
        assert!(
            check_control_transfer(&v, CONTROL_TRANSFER_IN, &setup(Recipient::Interface, 0)).is_ok()
        );
        let err = check_control_transfer(&v, CONTROL_TRANSFER_IN, &setup(Recipient::Interface, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let err = check_control_transfer(&v, CONTROL_TRANSFER_IN, &setup(Recipient::Interface, 9))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(
            check_control_transfer(&v, CONTROL_TRANSFER_OUT, &setup(Recipient::Endpoint, 0x81))
                .is_ok()
        );
        let err =
            check_control_transfer(&v, CONTROL_TRANSFER_OUT, &setup(Recipient::Endpoint, 0x01))
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err =
            check_control_transfer(&v, CONTROL_TRANSFER_OUT, &setup(Recipient::Endpoint, 0x84))
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let closed = view(&info, &state, false);
        let err = check_control_transfer(&closed, CONTROL_TRANSFER_IN, &setup(Recipient::Device, 0))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
