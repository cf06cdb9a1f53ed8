//! EuroBraille displays: Esys and Iris (1.71 and later) speak the Esys/Iris
//! protocol, Clio, NoteBraille, Scriba and older Iris models speak Clio.
//!
//! With `protocol=auto` the Esys/Iris identify request is tried first and
//! Clio second, on the same connection. USB and Bluetooth connections only
//! exist for Esys/Iris hardware, so they skip detection.

mod clio;
mod esysiris;

use tracing::info;

use crate::display::DisplayWriter;
use crate::driver::{Driver, DriverParameters};
use crate::error::{BrailleError, Result};
use crate::keys::{Decoded, KeyState};
use crate::link::Link;
use crate::model::Identity;
use crate::transport::{
    Parity, ResourceDescriptor, SerialParameters, TransportKind, UsbChannelDefinition,
};

pub use clio::ClioProtocol;
pub use esysiris::EsysIrisProtocol;

/// One of the two wire protocols.
pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    fn identify(&mut self, link: &mut Link) -> Result<Identity>;

    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>>;

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()>;

    /// Only Clio hardware has a text display.
    fn write_visual(&mut self, _link: &mut Link, _text: &[char]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolChoice {
    Auto,
    EsysIris,
    Clio,
}

impl ProtocolChoice {
    const NAMES: [&'static str; 3] = ["auto", "esysiris", "clio"];

    fn parse(parameters: &DriverParameters) -> Result<Self> {
        Ok(match parameters.choice("protocol", &Self::NAMES)? {
            "esysiris" => ProtocolChoice::EsysIris,
            "clio" => ProtocolChoice::Clio,
            _ => ProtocolChoice::Auto,
        })
    }

    /// Protocols to try, in order, over a connection of `kind`.
    fn candidates(self, kind: TransportKind) -> Vec<ProtocolChoice> {
        if matches!(kind, TransportKind::Usb | TransportKind::Bluetooth) {
            return vec![ProtocolChoice::EsysIris];
        }
        match self {
            ProtocolChoice::Auto => vec![ProtocolChoice::EsysIris, ProtocolChoice::Clio],
            choice => vec![choice],
        }
    }

    fn create(self) -> Box<dyn Protocol> {
        match self {
            ProtocolChoice::Clio => Box::new(ClioProtocol::new()),
            _ => Box::new(EsysIrisProtocol::new()),
        }
    }
}

const SERIAL: SerialParameters = SerialParameters::new(9600).with_parity(Parity::Even);

const fn esys_usb(product: u16) -> UsbChannelDefinition {
    UsbChannelDefinition {
        vendor: 0xC251,
        product,
        serial: None,
        report_size: 64,
        report_filler: 0x55,
    }
}

static USB_CHANNELS: [UsbChannelDefinition; 11] = [
    esys_usb(0x1122),
    esys_usb(0x1123),
    esys_usb(0x1124),
    esys_usb(0x1125),
    esys_usb(0x1126),
    esys_usb(0x1127),
    esys_usb(0x1128),
    esys_usb(0x1129),
    esys_usb(0x1130),
    esys_usb(0x1131),
    esys_usb(0x1132),
];

pub struct EuroBrailleDriver {
    choice: ProtocolChoice,
    protocol: Option<Box<dyn Protocol>>,
}

pub fn create(parameters: &DriverParameters) -> Result<Box<dyn Driver>> {
    Ok(Box::new(EuroBrailleDriver::new(ProtocolChoice::parse(
        parameters,
    )?)))
}

impl EuroBrailleDriver {
    pub fn new(choice: ProtocolChoice) -> Self {
        Self {
            choice,
            protocol: None,
        }
    }

    /// Name of the protocol found by identification.
    pub fn protocol_name(&self) -> Option<&'static str> {
        self.protocol.as_ref().map(|protocol| protocol.name())
    }

    fn protocol(&mut self) -> Result<&mut Box<dyn Protocol>> {
        self.protocol
            .as_mut()
            .ok_or_else(|| BrailleError::UnknownModel("display not identified".to_string()))
    }
}

impl Driver for EuroBrailleDriver {
    fn resource(&self) -> ResourceDescriptor {
        ResourceDescriptor::serial(SERIAL)
            .with_usb(&USB_CHANNELS)
            .with_bluetooth(1)
    }

    fn packet_capacity(&self) -> usize {
        1024
    }

    fn identify(&mut self, link: &mut Link) -> Result<Identity> {
        let candidates = self.choice.candidates(link.kind());
        let mut failure = None;

        for choice in candidates {
            let mut protocol = choice.create();
            info!("trying {} protocol", protocol.name());
            match protocol.identify(link) {
                Ok(identity) => {
                    info!(
                        "{} protocol: {} with {} cells",
                        protocol.name(),
                        identity.model,
                        identity.cells
                    );
                    self.protocol = Some(protocol);
                    return Ok(identity);
                }
                Err(error @ BrailleError::IdentifyTimeout { .. }) => {
                    info!("{} detection failed", protocol.name());
                    link.discard_input()?;
                    failure = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(failure.unwrap_or(BrailleError::IdentifyTimeout { attempts: 0 }))
    }

    fn read_input(&mut self, link: &mut Link, keys: &mut KeyState) -> Result<Option<Decoded>> {
        self.protocol()?.read_input(link, keys)
    }

    fn write_window(
        &mut self,
        link: &mut Link,
        display: &mut DisplayWriter,
        cells: &[u8],
    ) -> Result<()> {
        self.protocol()?.write_window(link, display, cells)
    }

    fn write_visual(&mut self, link: &mut Link, text: &[char]) -> Result<()> {
        self.protocol()?.write_visual(link, text)
    }

    fn reset(&mut self) {
        self.protocol = None;
    }
}
