//! Streaming OPC framer: reassembles length-prefixed messages from
//! arbitrarily fragmented TCP reads, buffering partial frames across reads
//! the same way any chunk-reassembly reader has to.
use std::io;

use serde::Deserialize;

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = 65535;
pub const MAX_BUFFERED_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

pub const CMD_SET_PIXEL_COLORS: u8 = 0x00;
pub const CMD_SYSTEM_EXCLUSIVE: u8 = 0xFF;

pub const SYSID_FADECANDY: u16 = 0x0001;
pub const SYSEX_SET_COLOR_CORRECTION: u8 = 0x01;
pub const SYSEX_SET_FIRMWARE_CONFIG: u8 = 0x02;

pub const BROADCAST_CHANNEL: u8 = 0;

/// One fully reassembled OPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcMessage {
    pub channel: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

/// A decoded, dispatch-ready OPC command. `Ignored` covers both unknown
/// top-level commands and unknown sysex system IDs/sub-commands, which the
/// protocol tolerates silently by design.
#[derive(Clone, PartialEq, Debug)]
pub enum OpcCommand {
    SetPixelColors(Vec<[u8; 3]>),
    SetColorCorrection { gamma: f64, whitepoint: [f64; 3] },
    SetFirmwareConfig {
        dithering: bool,
        interpolation: bool,
        led_enable: bool,
    },
    Ignored,
}

#[derive(Deserialize)]
struct ColorCorrectionPayload {
    gamma: f64,
    whitepoint: [f64; 3],
}

/// Decode a message's command+payload into an actionable [`OpcCommand`].
/// Malformed payloads are treated the same as unrecognized commands:
/// ignored, never an error that could close the connection (only framing
/// violations — oversized messages — do that).
pub fn decode_command(msg: &OpcMessage) -> OpcCommand {
    match msg.command {
        CMD_SET_PIXEL_COLORS => {
            let pixels = msg
                .payload
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect();
            OpcCommand::SetPixelColors(pixels)
        }
        CMD_SYSTEM_EXCLUSIVE => decode_sysex(&msg.payload),
        _ => OpcCommand::Ignored,
    }
}

fn decode_sysex(payload: &[u8]) -> OpcCommand {
    if payload.len() < 2 {
        return OpcCommand::Ignored;
    }
    let system_id = u16::from_be_bytes([payload[0], payload[1]]);
    if system_id != SYSID_FADECANDY {
        return OpcCommand::Ignored;
    }
    let rest = &payload[2..];
    let Some((&sub, body)) = rest.split_first() else {
        return OpcCommand::Ignored;
    };
    match sub {
        SYSEX_SET_COLOR_CORRECTION => match serde_json::from_slice::<ColorCorrectionPayload>(body)
        {
            Ok(parsed) => OpcCommand::SetColorCorrection {
                gamma: parsed.gamma,
                whitepoint: parsed.whitepoint,
            },
            Err(_) => OpcCommand::Ignored,
        },
        SYSEX_SET_FIRMWARE_CONFIG => match body.first() {
            Some(&flags) => OpcCommand::SetFirmwareConfig {
                dithering: flags & 0x01 == 0,
                interpolation: flags & 0x02 == 0,
                led_enable: flags & 0x04 == 0,
            },
            None => OpcCommand::Ignored,
        },
        _ => OpcCommand::Ignored,
    }
}

/// Per-connection reassembly state. Holds only bytes already copied out of
/// the caller's read buffer, per the data-model invariant that a connection
/// never holds references into transient read buffers.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Framer { buf: Vec::new() }
    }

    /// Copy newly read bytes into the accumulator. Returns an error (which
    /// the caller must treat as "close this connection") if the unconsumed
    /// buffer would exceed the protocol's maximum message size.
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.buf.len() + bytes.len() > MAX_BUFFERED_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "OPC message exceeds {} byte cap",
                    MAX_BUFFERED_LEN
                ),
            ));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Drain every complete message currently buffered, in arrival order.
    pub fn drain_messages(&mut self) -> Vec<OpcMessage> {
        let mut out = Vec::new();
        while let Some(msg) = self.take_one() {
            out.push(msg);
        }
        out
    }

    fn take_one(&mut self) -> Option<OpcMessage> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        let total = HEADER_LEN + length;
        if self.buf.len() < total {
            return None;
        }
        let channel = self.buf[0];
        let command = self.buf[1];
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Some(OpcMessage {
            channel,
            command,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_message_split_across_many_pushes() {
        let mut framer = Framer::new();
        let full = [0x01u8, 0x00, 0x00, 0x03, 0xFF, 0x80, 0x00];
        for byte in full {
            framer.push(&[byte]).unwrap();
        }
        let msgs = framer.drain_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].channel, 1);
        assert_eq!(msgs[0].payload, vec![0xFF, 0x80, 0x00]);
    }

    #[test]
    fn emits_multiple_messages_from_one_read() {
        let mut framer = Framer::new();
        let mut bytes = vec![0x00u8, 0x00, 0x00, 0x00]; // zero-length message
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x03, 1, 2, 3]);
        framer.push(&bytes).unwrap();
        let msgs = framer.drain_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].payload.len(), 0);
        assert_eq!(msgs[1].payload, vec![1, 2, 3]);
    }

    #[test]
    fn accepts_maximum_length_message_exactly_once() {
        let mut framer = Framer::new();
        let mut bytes = vec![0x00u8, 0x00, 0xFF, 0xFF];
        bytes.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD_LEN));
        framer.push(&bytes).unwrap();
        let msgs = framer.drain_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test]
    fn rejects_buffer_growth_past_cap() {
        let mut framer = Framer::new();
        let oversized = vec![0u8; MAX_BUFFERED_LEN + 1];
        assert!(framer.push(&oversized).is_err());
    }

    #[test]
    fn unknown_command_decodes_to_ignored() {
        let msg = OpcMessage {
            channel: 0,
            command: 0x42,
            payload: vec![1, 2, 3, 4],
        };
        assert_eq!(decode_command(&msg), OpcCommand::Ignored);
    }

    #[test]
    fn unknown_sysex_system_id_is_ignored() {
        let msg = OpcMessage {
            channel: 0,
            command: CMD_SYSTEM_EXCLUSIVE,
            payload: vec![0x00, 0x02, 0x01],
        };
        assert_eq!(decode_command(&msg), OpcCommand::Ignored);
    }

    #[test]
    fn decodes_set_pixel_colors() {
        let msg = OpcMessage {
            channel: 1,
            command: CMD_SET_PIXEL_COLORS,
            payload: vec![0xFF, 0x80, 0x00],
        };
        assert_eq!(
            decode_command(&msg),
            OpcCommand::SetPixelColors(vec![[0xFF, 0x80, 0x00]])
        );
    }

    #[test]
    fn decodes_color_correction_sysex() {
        let mut payload = vec![0x00, 0x01, SYSEX_SET_COLOR_CORRECTION];
        payload.extend_from_slice(br#"{"gamma":2.5,"whitepoint":[1.0,0.8,0.6]}"#);
        let msg = OpcMessage {
            channel: 0,
            command: CMD_SYSTEM_EXCLUSIVE,
            payload,
        };
        match decode_command(&msg) {
            OpcCommand::SetColorCorrection { gamma, whitepoint } => {
                assert_eq!(gamma, 2.5);
                assert_eq!(whitepoint, [1.0, 0.8, 0.6]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_firmware_config_sysex() {
        let payload = vec![0x00, 0x01, SYSEX_SET_FIRMWARE_CONFIG, 0b011];
        let msg = OpcMessage {
            channel: 0,
            command: CMD_SYSTEM_EXCLUSIVE,
            payload,
        };
        assert_eq!(
            decode_command(&msg),
            OpcCommand::SetFirmwareConfig {
                dithering: false,
                interpolation: false,
                led_enable: true,
            }
        );
    }
}
