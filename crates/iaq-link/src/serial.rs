//! ---
//! iaq_section: "05-instrument-link"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Modbus RTU instrument link over a serial port."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
use std::io;

use async_trait::async_trait;
use iaq_common::config::{Parity, RegisterLayout, TransportConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::rtu;
use crate::{InstrumentLink, LinkError, RawRegisterBlock};

/// Serial Modbus RTU link to the IAQ instrument.
///
/// The block described by `layout` is read in a single transaction per tick.
pub struct SerialRtuLink {
    layout: RegisterLayout,
    port: Option<SerialStream>,
    unit_id: u8,
    descriptor: Option<String>,
}

impl std::fmt::Debug for SerialRtuLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialRtuLink")
            .field("layout", &self.layout)
            .field("open", &self.port.is_some())
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl SerialRtuLink {
    /// Create a closed link reading the given register block.
    pub fn new(layout: RegisterLayout) -> Self {
        Self {
            layout,
            port: None,
            unit_id: 1,
            descriptor: None,
        }
    }

    async fn read_block(&mut self, start: u16, count: u16) -> Result<Vec<u16>, LinkError> {
        let unit = self.unit_id;
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        transact(port, unit, start, count).await
    }

    fn drop_port(&mut self) {
        if self.port.take().is_some() {
            warn!(descriptor = ?self.descriptor, "serial session dropped");
        }
    }
}

/// One read-holding-registers exchange on `port`.
async fn transact(
    port: &mut SerialStream,
    unit: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, LinkError> {
    if let Err(err) = port.clear(ClearBuffer::Input) {
        debug!(error = %err, "failed to flush serial input buffer");
    }

    let request = rtu::read_holding_request(unit, start, count);
    port.write_all(&request).await.map_err(map_io_error)?;
    port.flush().await.map_err(map_io_error)?;

    let mut frame = vec![0_u8; rtu::EXCEPTION_LEN];
    port.read_exact(&mut frame).await.map_err(map_io_error)?;
    if frame[1] & 0x80 == 0 {
        let total = rtu::response_len(count);
        if total > frame.len() {
            let mut rest = vec![0_u8; total - frame.len()];
            port.read_exact(&mut rest).await.map_err(map_io_error)?;
            frame.extend_from_slice(&rest);
        }
    }

    rtu::parse_read_holding_response(unit, count, &frame)
}

fn map_io_error(err: io::Error) -> LinkError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => LinkError::Timeout,
        _ => LinkError::ConnectionReset(err.to_string()),
    }
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn serial_data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn serial_stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

#[async_trait]
impl InstrumentLink for SerialRtuLink {
    async fn open(&mut self, settings: &TransportConfig) -> Result<(), LinkError> {
        if self.port.is_some() {
            return Ok(());
        }

        let mut port = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(serial_data_bits(settings.data_bits))
            .parity(serial_parity(settings.parity))
            .stop_bits(serial_stop_bits(settings.stop_bits))
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(settings.timeout)
            .open_native_async()
            .map_err(|err| LinkError::Unavailable(format!("{}: {err}", settings.port)))?;

        // Opening a tty succeeds without an instrument attached; probe one register.
        // Stored only after the instrument answered.
        if let Err(err) = transact(&mut port, settings.unit_id, self.layout.start, 1).await {
            return Err(LinkError::Unavailable(format!(
                "{} did not answer probe: {err}",
                settings.descriptor()
            )));
        }

        self.port = Some(port);
        self.unit_id = settings.unit_id;
        self.descriptor = Some(settings.descriptor());

        info!(descriptor = %settings.descriptor(), baud = settings.baud_rate, "serial link open");
        Ok(())
    }

    async fn read_channels(&mut self) -> Result<RawRegisterBlock, LinkError> {
        let (start, count) = (self.layout.start, self.layout.count());
        match self.read_block(start, count).await {
            Ok(registers) => RawRegisterBlock::new(self.layout.clone(), registers),
            Err(err) => {
                if err.is_connection_loss() {
                    self.drop_port();
                }
                Err(err)
            }
        }
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.port.take().is_some() {
            info!(descriptor = ?self.descriptor, "serial link closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn descriptor(&self) -> Option<String> {
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iaq_common::config::ChannelTable;

    fn link() -> SerialRtuLink {
        SerialRtuLink::new(ChannelTable::default().register_layout().unwrap().unwrap())
    }

    #[tokio::test]
    async fn missing_port_is_unavailable() {
        let mut link = link();
        let settings = TransportConfig {
            port: "/dev/iaq-does-not-exist".into(),
            ..TransportConfig::default()
        };
        let err = link.open(&settings).await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn reading_a_closed_link_is_not_open() {
        let mut link = link();
        assert_eq!(link.read_channels().await.unwrap_err(), LinkError::NotOpen);
        link.close().await.unwrap();
        link.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_instrument_never_leaves_a_half_open_session() {
        let (_master, slave) = SerialStream::pair().unwrap();
        let path = slave.name().unwrap();
        drop(slave);

        let mut link = link();
        let settings = TransportConfig {
            port: path,
            ..TransportConfig::default()
        };
        let budget = std::time::Duration::from_millis(300);
        for _ in 0..2 {
            let outcome = tokio::time::timeout(budget, link.open(&settings)).await;
            assert!(!matches!(outcome, Ok(Ok(()))), "silent port opened: {outcome:?}");
            assert!(!link.is_open());
        }
        assert_eq!(link.read_channels().await.unwrap_err(), LinkError::NotOpen);
    }

    #[test]
    fn io_errors_map_to_link_errors() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(map_io_error(timeout), LinkError::Timeout);
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "gone");
        assert!(map_io_error(eof).is_connection_loss());
    }
}
