//! Serial port discovery.
//!
//! Wraps `serialport::available_ports()` into a serialisable list so a setup
//! screen (or `cash-acceptor --list-ports`) can show which COM port the
//! acceptor is plugged into. USB ports carry VID/PID so NV200 units on a
//! USB-serial bridge can be picked out.

use serde::Serialize;

use crate::error::{AcceptorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

impl From<&serialport::SerialPortInfo> for PortInfo {
    fn from(p: &serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            name: p.port_name.clone(),
            port_type: "unknown",
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        };
        match &p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.port_type = "usb";
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer.clone();
                info.product = usb.product.clone();
                info.serial_number = usb.serial_number.clone();
            }
            serialport::SerialPortType::BluetoothPort => info.port_type = "bluetooth",
            serialport::SerialPortType::PciPort => info.port_type = "pci",
            serialport::SerialPortType::Unknown => {}
        }
        info
    }
}

/// List available serial/COM ports on this system.
pub fn available_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| AcceptorError::Config(format!("Failed to list ports: {e}")))?;
    Ok(ports.iter().map(PortInfo::from).collect())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_port_conversion() {
        let raw = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".into(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x191C,
                pid: 0x4104,
                serial_number: Some("NV200-1".into()),
                manufacturer: Some("ITL".into()),
                product: Some("NV200".into()),
            }),
        };
        let info = PortInfo::from(&raw);
        assert_eq!(info.port_type, "usb");
        assert_eq!(info.vid, Some(0x191C));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "/dev/ttyACM0");
        assert_eq!(json["serialNumber"], "NV200-1");
    }

    #[test]
    fn test_pci_port_conversion_omits_usb_fields() {
        let raw = serialport::SerialPortInfo {
            port_name: "COM1".into(),
            port_type: serialport::SerialPortType::PciPort,
        };
        let json = serde_json::to_value(PortInfo::from(&raw)).unwrap();
        assert_eq!(json, serde_json::json!({"name": "COM1", "portType": "pci"}));
    }
}
