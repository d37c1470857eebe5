//! Interface capability: resolving an `ifindex` to a MAC address, a
//! printable name, and an up/down flag. The ACD engine itself never
//! enumerates interfaces — that's the embedding application's job — but
//! it needs this much to validate `start()`'s preconditions before
//! handing a MAC address to the probe/announce loop.

use pnet::datalink;
use pnet::util::MacAddr;

use crate::error::AcdError;

pub trait InterfaceInfo {
    fn mac(&self, ifindex: i32) -> Result<MacAddr, AcdError>;
    fn name(&self, ifindex: i32) -> Result<String, AcdError>;
    fn is_up(&self, ifindex: i32) -> Result<bool, AcdError>;
}

/// Live lookup via `pnet::datalink::interfaces()`: reject loopback,
/// point-to-point, and down interfaces before a host is ever constructed.
#[derive(Default)]
pub struct PnetInterfaceInfo;

impl PnetInterfaceInfo {
    fn find(&self, ifindex: i32) -> Result<datalink::NetworkInterface, AcdError> {
        datalink::interfaces()
            .into_iter()
            .find(|i| i.index as i32 == ifindex)
            .ok_or_else(|| AcdError::Configuration(format!("no interface with index {}", ifindex)))
    }

    /// Validates the interface is fit to run ACD on, returning the
    /// resolved MAC address on success.
    pub fn validate_for_acd(&self, ifindex: i32) -> Result<MacAddr, AcdError> {
        let interface = self.find(ifindex)?;
        if interface.is_loopback() {
            return Err(AcdError::Configuration("cannot run acd on a loopback interface".into()));
        }
        if interface.is_point_to_point() {
            return Err(AcdError::Configuration("cannot run acd on a point-to-point interface".into()));
        }
        if !interface.is_up() {
            return Err(AcdError::Configuration("interface must be up".into()));
        }
        interface
            .mac
            .ok_or_else(|| AcdError::Configuration("interface has no mac address".into()))
    }
}

impl InterfaceInfo for PnetInterfaceInfo {
    fn mac(&self, ifindex: i32) -> Result<MacAddr, AcdError> {
        self.find(ifindex)?
            .mac
            .ok_or_else(|| AcdError::Configuration("interface has no mac address".into()))
    }

    fn name(&self, ifindex: i32) -> Result<String, AcdError> {
        Ok(self.find(ifindex)?.name)
    }

    fn is_up(&self, ifindex: i32) -> Result<bool, AcdError> {
        Ok(self.find(ifindex)?.is_up())
    }
}
