//! ---
//! iaq_section: "05-instrument-link"
//! iaq_subsection: "module"
//! iaq_type: "source"
//! iaq_scope: "code"
//! iaq_description: "Modbus RTU framing for holding-register reads."
//! iaq_version: "v0.0.0-prealpha"
//! iaq_owner: "tbd"
//! ---
//! Minimal Modbus RTU codec: function `0x03` requests and their responses.

use crc::{Crc, CRC_16_MODBUS};

use crate::LinkError;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function code for "read holding registers".
pub const READ_HOLDING: u8 = 0x03;
/// Bytes preceding the payload in a response: unit, function, byte count.
pub const RESPONSE_HEADER_LEN: usize = 3;
/// Trailing CRC bytes on every frame.
pub const CRC_LEN: usize = 2;
/// Length of an exception response (unit, function | 0x80, code, CRC).
pub const EXCEPTION_LEN: usize = 5;

/// Total response length for a successful read of `count` registers.
pub fn response_len(count: u16) -> usize {
    RESPONSE_HEADER_LEN + usize::from(count) * 2 + CRC_LEN
}

/// Append the CRC to a frame body.
fn seal(body: &[u8]) -> Vec<u8> {
    let checksum = CRC.checksum(body);
    let mut frame = Vec::with_capacity(body.len() + CRC_LEN);
    frame.extend_from_slice(body);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Encode a read-holding-registers request.
pub fn read_holding_request(unit: u8, start: u16, count: u16) -> [u8; 8] {
    let [start_hi, start_lo] = start.to_be_bytes();
    let [count_hi, count_lo] = count.to_be_bytes();
    let body = [unit, READ_HOLDING, start_hi, start_lo, count_hi, count_lo];
    let [crc_lo, crc_hi] = CRC.checksum(&body).to_le_bytes();
    [
        body[0], body[1], body[2], body[3], body[4], body[5], crc_lo, crc_hi,
    ]
}

/// Encode a successful response. Used by loopback tooling and tests.
///
/// The byte count field is one octet, so at most 127 registers fit in a frame.
pub fn read_holding_response(unit: u8, registers: &[u16]) -> Result<Vec<u8>, LinkError> {
    let byte_count = u8::try_from(registers.len() * 2).map_err(|_| {
        LinkError::Protocol(format!(
            "{} registers do not fit in one response frame",
            registers.len()
        ))
    })?;
    let mut body = Vec::with_capacity(RESPONSE_HEADER_LEN + registers.len() * 2);
    body.push(unit);
    body.push(READ_HOLDING);
    body.push(byte_count);
    for register in registers {
        body.extend_from_slice(&register.to_be_bytes());
    }
    Ok(seal(&body))
}

/// Decode a response frame into register values.
pub fn parse_read_holding_response(
    unit: u8,
    count: u16,
    frame: &[u8],
) -> Result<Vec<u16>, LinkError> {
    if frame.len() < EXCEPTION_LEN {
        return Err(LinkError::Protocol(format!(
            "short frame ({} bytes)",
            frame.len()
        )));
    }

    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = CRC.checksum(body);
    if received != expected {
        return Err(LinkError::Protocol(format!(
            "crc mismatch (expected {expected:#06x}, received {received:#06x})"
        )));
    }

    if body[0] != unit {
        return Err(LinkError::Protocol(format!(
            "response from unit {} while polling unit {unit}",
            body[0]
        )));
    }

    match body[1] {
        READ_HOLDING => {}
        code if code == READ_HOLDING | 0x80 => {
            return Err(LinkError::Protocol(format!(
                "exception code {:#04x}",
                body[2]
            )));
        }
        other => {
            return Err(LinkError::Protocol(format!(
                "unexpected function code {other:#04x}"
            )));
        }
    }

    let byte_count = usize::from(body[2]);
    let payload = &body[RESPONSE_HEADER_LEN..];
    if byte_count != usize::from(count) * 2 || payload.len() != byte_count {
        return Err(LinkError::Protocol(format!(
            "expected {} data bytes, header declares {byte_count}, frame carries {}",
            usize::from(count) * 2,
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
