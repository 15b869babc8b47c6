//! SSP (Smiley Secure Protocol) framing and payload codec, plain mode.
//!
//! Frame layout: `STX | SEQ/ADDR | LEN | DATA… | CRCL | CRCH`.
//!   - STX is 0x7F; any 0x7F after the STX is sent twice (byte stuffing)
//!   - bit 7 of SEQ/ADDR is the sequence flag, bits 0-6 the slave address
//!   - CRC-16 (poly 0x8005, seed 0xFFFF) covers SEQ/ADDR, LEN and DATA
//!
//! Key exchange and eSSP encryption are not implemented; the NV200 accepts
//! every note-validator command in plain mode and answers payout commands
//! with `KEY_NOT_SET` when it insists on encryption.

use super::event::{DeviceEvent, EventName};
use super::transport::{Command, CommandResponse, NoteRoute, ResponseInfo, ResponseStatus};
use crate::error::{AcceptorError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const STX: u8 = 0x7F;
const SEQ_FLAG: u8 = 0x80;
const CRC_POLY: u16 = 0x8005;
const CRC_SEED: u16 = 0xFFFF;

/// Host protocol version negotiated on open. Payout event payloads below
/// follow the version 6 layout.
pub const PROTOCOL_VERSION: u8 = 6;

const CMD_SYNC: u8 = 0x11;
const CMD_HOST_PROTOCOL_VERSION: u8 = 0x06;
const CMD_POLL: u8 = 0x07;
const CMD_ENABLE: u8 = 0x0A;
const CMD_DISABLE: u8 = 0x09;
const CMD_GET_SERIAL_NUMBER: u8 = 0x0C;
const CMD_PAYOUT_AMOUNT: u8 = 0x33;
const CMD_SET_DENOMINATION_ROUTE: u8 = 0x3B;
const CMD_GET_DENOMINATION_ROUTE: u8 = 0x3C;
const CMD_FLOAT_AMOUNT: u8 = 0x3D;
const CMD_EMPTY_ALL: u8 = 0x3F;

/// Payout option byte: execute for real (0x19 would be a dry run).
const PAYOUT_OPTION_REAL: u8 = 0x58;

const ROUTE_PAYOUT: u8 = 0x00;
const ROUTE_CASHBOX: u8 = 0x01;

/// Bytes of one value/country pair in payout event payloads.
const VALUE_COUNTRY_LEN: usize = 7;

// ---------------------------------------------------------------------------
// CRC + framing
// ---------------------------------------------------------------------------

/// CRC-16, polynomial 0x8005, seed 0xFFFF, MSB first, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_SEED;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Wrap `data` in a stuffed SSP frame.
pub fn encode_frame(address: u8, seq: bool, data: &[u8]) -> Vec<u8> {
    let seq_addr = (address & 0x7F) | if seq { SEQ_FLAG } else { 0 };
    let mut body = Vec::with_capacity(data.len() + 4);
    body.push(seq_addr);
    body.push(data.len() as u8);
    body.extend_from_slice(data);
    let crc = crc16(&body);
    body.push((crc & 0xFF) as u8);
    body.push((crc >> 8) as u8);

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(STX);
    for b in body {
        frame.push(b);
        if b == STX {
            frame.push(STX);
        }
    }
    frame
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub seq: bool,
    pub data: Vec<u8>,
}

/// Incremental frame parser fed one byte at a time from the serial port.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    in_frame: bool,
    pending_stx: bool,
    body: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw byte. Returns a frame (or a CRC failure) once the last
    /// byte of a frame has been seen.
    pub fn push(&mut self, byte: u8) -> Option<std::result::Result<Frame, String>> {
        if !self.in_frame {
            if byte == STX {
                self.in_frame = true;
                self.pending_stx = false;
                self.body.clear();
            }
            return None;
        }

        if self.pending_stx {
            self.pending_stx = false;
            if byte != STX {
                // Lone STX inside a frame: the previous frame was cut short
                // and a new one starts here.
                self.body.clear();
            }
            self.body.push(byte);
        } else if byte == STX {
            self.pending_stx = true;
            return None;
        } else {
            self.body.push(byte);
        }

        self.try_complete()
    }

    fn try_complete(&mut self) -> Option<std::result::Result<Frame, String>> {
        if self.body.len() < 2 || self.body.len() < self.body[1] as usize + 4 {
            return None;
        }
        self.in_frame = false;
        let body = std::mem::take(&mut self.body);
        let split = body.len() - 2;
        let expected = crc16(&body[..split]);
        let actual = u16::from_le_bytes([body[split], body[split + 1]]);
        if expected != actual {
            return Some(Err(format!(
                "CRC mismatch: expected {expected:04X}, got {actual:04X}"
            )));
        }
        Some(Ok(Frame {
            address: body[0] & 0x7F,
            seq: body[0] & SEQ_FLAG != 0,
            data: body[2..split].to_vec(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn country_bytes(code: &str) -> [u8; 3] {
    let mut out = [b' '; 3];
    for (slot, b) in out.iter_mut().zip(code.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    out
}

/// Encode a command into the DATA portion of a frame.
pub fn encode_command(command: &Command) -> Vec<u8> {
    match command {
        Command::Sync => vec![CMD_SYNC],
        Command::HostProtocolVersion(version) => vec![CMD_HOST_PROTOCOL_VERSION, *version],
        Command::Poll => vec![CMD_POLL],
        Command::Enable => vec![CMD_ENABLE],
        Command::Disable => vec![CMD_DISABLE],
        Command::GetSerialNumber => vec![CMD_GET_SERIAL_NUMBER],
        Command::EmptyAll => vec![CMD_EMPTY_ALL],
        Command::PayoutAmount {
            amount,
            country_code,
        } => {
            let mut data = vec![CMD_PAYOUT_AMOUNT];
            data.extend_from_slice(&amount.to_le_bytes());
            data.extend_from_slice(&country_bytes(country_code));
            data.push(PAYOUT_OPTION_REAL);
            data
        }
        Command::GetDenominationRoute {
            value,
            country_code,
        } => {
            let mut data = vec![CMD_GET_DENOMINATION_ROUTE];
            data.extend_from_slice(&value.to_le_bytes());
            data.extend_from_slice(&country_bytes(country_code));
            data
        }
        Command::SetDenominationRoute {
            value,
            route,
            country_code,
        } => {
            let mut data = vec![CMD_SET_DENOMINATION_ROUTE, route_byte(*route)];
            data.extend_from_slice(&value.to_le_bytes());
            data.extend_from_slice(&country_bytes(country_code));
            data
        }
        Command::FloatAmount {
            min_payout,
            amount,
            country_code,
        } => {
            let mut data = vec![CMD_FLOAT_AMOUNT];
            data.extend_from_slice(&min_payout.to_le_bytes());
            data.extend_from_slice(&amount.to_le_bytes());
            data.extend_from_slice(&country_bytes(country_code));
            data.push(PAYOUT_OPTION_REAL);
            data
        }
    }
}

fn route_byte(route: NoteRoute) -> u8 {
    match route {
        NoteRoute::Payout => ROUTE_PAYOUT,
        NoteRoute::Cashbox => ROUTE_CASHBOX,
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn status_from_byte(b: u8) -> ResponseStatus {
    match b {
        0xF0 => ResponseStatus::Ok,
        0xF2 => ResponseStatus::CommandNotKnown,
        0xF3 => ResponseStatus::WrongParameterCount,
        0xF4 => ResponseStatus::ParameterOutOfRange,
        0xF5 => ResponseStatus::CannotProcess,
        0xF6 => ResponseStatus::SoftwareError,
        0xF8 => ResponseStatus::Fail,
        0xFA => ResponseStatus::KeyNotSet,
        other => ResponseStatus::Unknown(other),
    }
}

/// Decode the DATA portion of a reply to `command`.
pub fn decode_response(command: &Command, data: &[u8]) -> Result<CommandResponse> {
    let name = command.name();
    let (&status_byte, payload) = data
        .split_first()
        .ok_or_else(|| AcceptorError::protocol(name, "empty response"))?;
    let status = status_from_byte(status_byte);

    if status != ResponseStatus::Ok {
        return Ok(CommandResponse {
            status,
            info: ResponseInfo::None,
        });
    }

    let info = match command {
        Command::Poll => ResponseInfo::Events(decode_poll_events(payload)),
        Command::GetSerialNumber => {
            let bytes: [u8; 4] = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| {
                    AcceptorError::protocol(name, format!("serial number needs 4 bytes, got {}", payload.len()))
                })?;
            ResponseInfo::SerialNumber(u32::from_be_bytes(bytes))
        }
        Command::GetDenominationRoute { .. } => match payload.first() {
            Some(&ROUTE_PAYOUT) => ResponseInfo::Route(NoteRoute::Payout),
            Some(&ROUTE_CASHBOX) => ResponseInfo::Route(NoteRoute::Cashbox),
            Some(other) => {
                return Err(AcceptorError::protocol(name, format!("unknown route byte {other:#04X}")))
            }
            None => return Err(AcceptorError::protocol(name, "missing route byte")),
        },
        _ => ResponseInfo::None,
    };

    Ok(CommandResponse { status, info })
}

#[derive(Clone, Copy)]
enum Payload {
    None,
    Channel,
    ValueCountry,
    ValueList,
}

fn event_for_code(code: u8) -> Option<(EventName, Payload)> {
    use EventName::*;
    let entry = match code {
        0xF1 => (SlaveReset, Payload::None),
        0xEF => (ReadNote, Payload::Channel),
        0xEE => (CreditNote, Payload::Channel),
        0xED => (NoteRejecting, Payload::None),
        0xEC => (NoteRejected, Payload::None),
        0xCC => (NoteStacking, Payload::None),
        0xEB => (NoteStacked, Payload::None),
        0xEA => (SafeJam, Payload::None),
        0xE9 => (UnsafeJam, Payload::None),
        0xE8 => (Disabled, Payload::None),
        0xE7 => (StackerFull, Payload::None),
        0xE6 => (FraudAttempt, Payload::Channel),
        0xE5 => (BarcodeTicketValidated, Payload::None),
        0xE4 => (CashBoxReplaced, Payload::None),
        0xE3 => (CashBoxRemoved, Payload::None),
        0xE2 => (NoteClearedToCashbox, Payload::Channel),
        0xE1 => (NoteClearedFromFront, Payload::Channel),
        0xE0 => (NotePathOpen, Payload::None),
        0xDB => (NoteStoredInPayout, Payload::ValueCountry),
        0xDA => (NoteDispensing, Payload::ValueList),
        0xD6 => (Halted, Payload::ValueList),
        0xD5 => (Jammed, Payload::ValueList),
        0xD2 => (NoteDispensed, Payload::ValueList),
        0xD1 => (BarcodeTicketAcknowledge, Payload::None),
        0xC9 => (NoteTransferredToStacker, Payload::ValueCountry),
        0xC4 => (CoinMechJam, Payload::None),
        0xC3 => (Emptied, Payload::None),
        0xC2 => (Emptying, Payload::None),
        0xB7 => (CoinMechError, Payload::None),
        0xB6 => (Initialising, Payload::None),
        0xB5 => (ChannelDisable, Payload::None),
        0xB4 => (SmartEmptied, Payload::ValueList),
        0xB3 => (SmartEmptying, Payload::ValueList),
        _ => return None,
    };
    Some(entry)
}

fn describe_value_country(chunk: &[u8]) -> String {
    let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    let country = String::from_utf8_lossy(&chunk[4..7]).trim().to_string();
    format!("{value} {country}")
}

/// Decode the event list that follows the status byte of a POLL reply.
///
/// Decoding stops at the first unknown code (its payload length cannot be
/// known); that code and everything after it are returned as one `UNKNOWN`
/// event. A truncated payload yields an `ERROR` event the same way.
pub fn decode_poll_events(mut data: &[u8]) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    while let Some((&code, rest)) = data.split_first() {
        let Some((name, payload)) = event_for_code(code) else {
            events.push(
                DeviceEvent::new(EventName::Unknown)
                    .with_description(format!("unrecognised event code {code:#04X}"))
                    .with_raw_data(data.to_vec()),
            );
            break;
        };

        let needed = match payload {
            Payload::None => 0,
            Payload::Channel => 1,
            Payload::ValueCountry => VALUE_COUNTRY_LEN,
            Payload::ValueList => rest
                .first()
                .map(|&n| 1 + n as usize * VALUE_COUNTRY_LEN)
                .unwrap_or(1),
        };

        if rest.len() < needed {
            events.push(
                DeviceEvent::new(EventName::Error)
                    .with_description(format!("truncated {name} payload"))
                    .with_raw_data(data.to_vec()),
            );
            break;
        }

        let (args, tail) = rest.split_at(needed);
        let event = match payload {
            Payload::None => DeviceEvent::new(name),
            Payload::Channel => DeviceEvent::on_channel(name, args[0]),
            Payload::ValueCountry => DeviceEvent::new(name)
                .with_description(describe_value_country(args))
                .with_raw_data(args.to_vec()),
            Payload::ValueList => {
                let parts: Vec<String> = args[1..]
                    .chunks_exact(VALUE_COUNTRY_LEN)
                    .map(describe_value_country)
                    .collect();
                DeviceEvent::new(name)
                    .with_description(parts.join(", "))
                    .with_raw_data(args.to_vec())
            }
        };
        events.push(event);
        data = tail;
    }

    events
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<std::result::Result<Frame, String>> {
        let mut decoder = FrameDecoder::new();
        bytes.iter().filter_map(|&b| decoder.push(b)).collect()
    }

    #[test]
    fn test_sync_frame_matches_reference() {
        assert_eq!(encode_frame(0, true, &[CMD_SYNC]), vec![0x7F, 0x80, 0x01, 0x11, 0x65, 0x82]);
    }

    #[test]
    fn test_poll_frame_matches_reference() {
        assert_eq!(encode_frame(0, true, &[CMD_POLL]), vec![0x7F, 0x80, 0x01, 0x07, 0x12, 0x02]);
        assert_eq!(encode_frame(0, false, &[CMD_POLL]), vec![0x7F, 0x00, 0x01, 0x07, 0x11, 0x88]);
    }

    #[test]
    fn test_stuffing_in_data_and_crc() {
        let frame = encode_frame(0, false, &[0xF0, 0x00, 0x00, 0x7F, 0x12]);
        assert_eq!(
            frame,
            vec![0x7F, 0x00, 0x05, 0xF0, 0x00, 0x00, 0x7F, 0x7F, 0x12, 0xEF, 0xE8]
        );

        // CRC low byte is 0x7F here and must be stuffed as well
        let frame = encode_frame(0, false, &[0xF0, 0xEA]);
        assert_eq!(frame, vec![0x7F, 0x00, 0x02, 0xF0, 0xEA, 0x7F, 0x7F, 0xA2]);
        let decoded = decode_all(&frame);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap().data, vec![0xF0, 0xEA]);
    }

    #[test]
    fn test_decoder_reads_reply_with_leading_noise() {
        let mut bytes = vec![0x00, 0x13];
        bytes.extend(encode_frame(0, true, &[0xF0, 0xEF, 0x01, 0xEE, 0x01]));
        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        let frame = decoded[0].as_ref().unwrap();
        assert!(frame.seq);
        assert_eq!(frame.address, 0);
        assert_eq!(frame.data, vec![0xF0, 0xEF, 0x01, 0xEE, 0x01]);
    }

    #[test]
    fn test_decoder_rejects_bad_crc() {
        let mut frame = encode_frame(0, false, &[0xF0]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let decoded = decode_all(&frame);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].as_ref().unwrap_err().contains("CRC mismatch"));
    }

    #[test]
    fn test_decoder_restarts_on_lone_stx() {
        // truncated frame followed by a complete one
        let mut bytes = vec![0x7F, 0x00, 0x05, 0xF0];
        bytes.extend(encode_frame(0, false, &[0xF0, 0xE8]));
        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap().data, vec![0xF0, 0xE8]);
    }

    #[test]
    fn test_encode_payout_and_routes() {
        let data = encode_command(&Command::PayoutAmount {
            amount: 1_000,
            country_code: "EUR".into(),
        });
        assert_eq!(data, vec![0x33, 0xE8, 0x03, 0x00, 0x00, b'E', b'U', b'R', 0x58]);

        let data = encode_command(&Command::SetDenominationRoute {
            value: 500,
            route: NoteRoute::Cashbox,
            country_code: "eur".into(),
        });
        assert_eq!(data, vec![0x3B, 0x01, 0xF4, 0x01, 0x00, 0x00, b'E', b'U', b'R']);

        let data = encode_command(&Command::GetDenominationRoute {
            value: 2_000,
            country_code: "EUR".into(),
        });
        assert_eq!(data, vec![0x3C, 0xD0, 0x07, 0x00, 0x00, b'E', b'U', b'R']);

        let data = encode_command(&Command::FloatAmount {
            min_payout: 500,
            amount: 10_000,
            country_code: "EUR".into(),
        });
        assert_eq!(
            data,
            vec![0x3D, 0xF4, 0x01, 0x10, 0x27, 0x00, 0x00, b'E', b'U', b'R', 0x58]
        );
    }

    #[test]
    fn test_decode_poll_credit_sequence() {
        let events = decode_poll_events(&[0xEF, 0x02, 0xCC, 0xEB, 0xEE, 0x02]);
        let names: Vec<EventName> = events.iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec![
                EventName::ReadNote,
                EventName::NoteStacking,
                EventName::NoteStacked,
                EventName::CreditNote
            ]
        );
        assert_eq!(events[0].channel, Some(2));
        assert_eq!(events[3].channel, Some(2));
    }

    #[test]
    fn test_decode_poll_value_list() {
        // DISPENSED, 2 entries: 500 EUR, 1000 EUR; then DISABLED
        let mut data = vec![0xD2, 0x02];
        data.extend_from_slice(&500u32.to_le_bytes());
        data.extend_from_slice(b"EUR");
        data.extend_from_slice(&1_000u32.to_le_bytes());
        data.extend_from_slice(b"EUR");
        data.push(0xE8);
        let events = decode_poll_events(&data);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, EventName::NoteDispensed);
        assert_eq!(events[0].description.as_deref(), Some("500 EUR, 1000 EUR"));
        assert_eq!(events[1].name, EventName::Disabled);
    }

    #[test]
    fn test_decode_poll_unknown_code_stops() {
        let events = decode_poll_events(&[0xE8, 0x42, 0xEE, 0x01]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, EventName::Unknown);
        assert_eq!(events[1].raw_data.as_deref(), Some(&[0x42, 0xEE, 0x01][..]));
    }

    #[test]
    fn test_decode_poll_truncated_channel() {
        let events = decode_poll_events(&[0xF1, 0xEE]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, EventName::SlaveReset);
        assert_eq!(events[1].name, EventName::Error);
    }

    #[test]
    fn test_decode_responses() {
        let resp = decode_response(&Command::GetSerialNumber, &[0xF0, 0x00, 0x01, 0xE2, 0x40]).unwrap();
        assert_eq!(resp.info, ResponseInfo::SerialNumber(123_456));

        let route_cmd = Command::GetDenominationRoute {
            value: 500,
            country_code: "EUR".into(),
        };
        let resp = decode_response(&route_cmd, &[0xF0, 0x01]).unwrap();
        assert_eq!(resp.info, ResponseInfo::Route(NoteRoute::Cashbox));

        let resp = decode_response(&Command::PayoutAmount { amount: 1, country_code: "EUR".into() }, &[0xFA]).unwrap();
        assert_eq!(resp.status, ResponseStatus::KeyNotSet);

        assert!(decode_response(&Command::Poll, &[]).is_err());
        assert!(decode_response(&Command::GetSerialNumber, &[0xF0, 0x01]).is_err());
    }
}
