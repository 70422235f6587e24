//! Port-0 control messages, handled by the comms layer itself.
//!
//! The first byte after the header is the command: ACK (1), LISTENREQ (2),
//! LISTENRESP (3), PORTCLOSED (4), BARRIER (5).

use bytes::{Buf, BufMut};

use super::{ensure, get_bytes};
use crate::types::AckStatus;
use crate::wire::WireError;
use crate::MAX_BARRIER_NAME_LEN;

const CMD_ACK: u8 = 1;
const CMD_LISTENREQ: u8 = 2;
const CMD_LISTENRESP: u8 = 3;
const CMD_PORTCLOSED: u8 = 4;
const CMD_BARRIER: u8 = 5;

// ---------------------------------------------------------------------------
// Barrier sub-messages
// ---------------------------------------------------------------------------

/// Sub-command of a BARRIER control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierSubCmd {
    Register,
    Change,
    Wait,
    Complete,
}

impl BarrierSubCmd {
    pub fn to_wire(self) -> u8 {
        match self {
            BarrierSubCmd::Register => 1,
            BarrierSubCmd::Change => 2,
            BarrierSubCmd::Wait => 4,
            BarrierSubCmd::Complete => 5,
        }
    }

    pub fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(BarrierSubCmd::Register),
            2 => Ok(BarrierSubCmd::Change),
            4 => Ok(BarrierSubCmd::Wait),
            5 => Ok(BarrierSubCmd::Complete),
            other => Err(WireError::BadValue {
                field: "barrier subcommand",
                value: u32::from(other),
            }),
        }
    }
}

/// Body of a BARRIER control message.
///
/// The name travels in a fixed-width, NUL-padded field so that all barrier
/// messages are the same size on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierControl {
    pub subcmd: BarrierSubCmd,
    pub flags: u32,
    pub nodes: u32,
    pub name: String,
}

impl BarrierControl {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.subcmd.to_wire());
        buf.put_u16_le(0); // pad
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.nodes);
        let name = self.name.as_bytes();
        let copy = name.len().min(MAX_BARRIER_NAME_LEN - 1);
        buf.put_slice(&name[..copy]);
        buf.put_bytes(0, MAX_BARRIER_NAME_LEN - copy);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf, 11 + MAX_BARRIER_NAME_LEN, "barrier message")?;
        let subcmd = BarrierSubCmd::from_wire(buf.get_u8())?;
        let _pad = buf.get_u16_le();
        let flags = buf.get_u32_le();
        let nodes = buf.get_u32_le();
        let raw = get_bytes(buf, MAX_BARRIER_NAME_LEN, "barrier name")?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8(raw[..end].to_vec())
            .map_err(|_| WireError::BadString { field: "barrier name" })?;
        Ok(Self {
            subcmd,
            flags,
            nodes,
            name,
        })
    }
}

// ---------------------------------------------------------------------------
// Control message
// ---------------------------------------------------------------------------

/// A message on the reserved control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Explicit acknowledgement of a sequenced message.
    Ack {
        /// Port the acknowledged message was addressed to.
        remote_port: u8,
        status: AckStatus,
    },
    /// "Is anything listening on this port over there?"
    ListenReq { target_port: u8, tag: u16 },
    ListenResp {
        listening: bool,
        tag: u16,
    },
    /// A member closed a local port; wakes remote waiters on that port.
    PortClosed { port: u8 },
    Barrier(BarrierControl),
}

impl ControlMessage {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            ControlMessage::Ack {
                remote_port,
                status,
            } => {
                buf.put_u8(CMD_ACK);
                buf.put_u8(*remote_port);
                buf.put_u8(status.to_wire());
                buf.put_u8(0); // pad
            }
            ControlMessage::ListenReq { target_port, tag } => {
                buf.put_u8(CMD_LISTENREQ);
                buf.put_u8(*target_port);
                buf.put_u8(0); // listening, always 0 in a request
                buf.put_u8(0); // pad
                buf.put_u16_le(*tag);
            }
            ControlMessage::ListenResp { listening, tag } => {
                buf.put_u8(CMD_LISTENRESP);
                buf.put_u8(0); // target port, unused in a response
                buf.put_u8(u8::from(*listening));
                buf.put_u8(0); // pad
                buf.put_u16_le(*tag);
            }
            ControlMessage::PortClosed { port } => {
                buf.put_u8(CMD_PORTCLOSED);
                buf.put_u8(*port);
            }
            ControlMessage::Barrier(b) => {
                buf.put_u8(CMD_BARRIER);
                b.encode(buf);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf, 1, "control command")?;
        match buf.get_u8() {
            CMD_ACK => {
                ensure(buf, 3, "ack body")?;
                let remote_port = buf.get_u8();
                let status = AckStatus::from_wire(buf.get_u8())?;
                let _pad = buf.get_u8();
                Ok(ControlMessage::Ack {
                    remote_port,
                    status,
                })
            }
            CMD_LISTENREQ => {
                ensure(buf, 5, "listenreq body")?;
                let target_port = buf.get_u8();
                let _listening = buf.get_u8();
                let _pad = buf.get_u8();
                let tag = buf.get_u16_le();
                Ok(ControlMessage::ListenReq { target_port, tag })
            }
            CMD_LISTENRESP => {
                ensure(buf, 5, "listenresp body")?;
                let _target_port = buf.get_u8();
                let listening = buf.get_u8() != 0;
                let _pad = buf.get_u8();
                let tag = buf.get_u16_le();
                Ok(ControlMessage::ListenResp { listening, tag })
            }
            CMD_PORTCLOSED => {
                ensure(buf, 1, "portclosed body")?;
                Ok(ControlMessage::PortClosed {
                    port: buf.get_u8(),
                })
            }
            CMD_BARRIER => Ok(ControlMessage::Barrier(BarrierControl::decode(buf)?)),
            other => Err(WireError::BadCommand(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(msg: &ControlMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let decoded = ControlMessage::decode(&mut buf.freeze()).unwrap();
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn ack_round_trip() {
        round_trip(&ControlMessage::Ack {
            remote_port: 12,
            status: AckStatus::Ok,
        });
        round_trip(&ControlMessage::Ack {
            remote_port: 200,
            status: AckStatus::NoListener,
        });
    }

    #[test]
    fn listen_round_trip() {
        round_trip(&ControlMessage::ListenReq {
            target_port: 44,
            tag: 0xABCD,
        });
        round_trip(&ControlMessage::ListenResp {
            listening: true,
            tag: 0xABCD,
        });
        round_trip(&ControlMessage::ListenResp {
            listening: false,
            tag: 1,
        });
    }

    #[test]
    fn portclosed_round_trip() {
        round_trip(&ControlMessage::PortClosed { port: 99 });
    }

    #[test]
    fn barrier_round_trip_all_subcmds() {
        for subcmd in [
            BarrierSubCmd::Register,
            BarrierSubCmd::Change,
            BarrierSubCmd::Wait,
            BarrierSubCmd::Complete,
        ] {
            round_trip(&ControlMessage::Barrier(BarrierControl {
                subcmd,
                flags: 1,
                nodes: 3,
                name: "TRANSITION.7".to_string(),
            }));
        }
    }

    #[test]
    fn barrier_name_is_fixed_width() {
        let short = ControlMessage::Barrier(BarrierControl {
            subcmd: BarrierSubCmd::Wait,
            flags: 0,
            nodes: 0,
            name: "b".to_string(),
        });
        let long = ControlMessage::Barrier(BarrierControl {
            subcmd: BarrierSubCmd::Wait,
            flags: 0,
            nodes: 0,
            name: "a-much-longer-barrier-name".to_string(),
        });
        let mut b1 = BytesMut::new();
        let mut b2 = BytesMut::new();
        short.encode(&mut b1);
        long.encode(&mut b2);
        assert_eq!(b1.len(), b2.len());
    }

    #[test]
    fn barrier_overlong_name_is_clipped() {
        let name = "x".repeat(MAX_BARRIER_NAME_LEN * 2);
        let mut buf = BytesMut::new();
        ControlMessage::Barrier(BarrierControl {
            subcmd: BarrierSubCmd::Register,
            flags: 0,
            nodes: 0,
            name,
        })
        .encode(&mut buf);
        let decoded = ControlMessage::decode(&mut buf.freeze()).unwrap();
        let ControlMessage::Barrier(b) = decoded else {
            panic!("wrong variant");
        };
        assert_eq!(b.name.len(), MAX_BARRIER_NAME_LEN - 1);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut raw: &[u8] = &[0xEE, 0, 0, 0];
        assert_eq!(
            ControlMessage::decode(&mut raw).unwrap_err(),
            WireError::BadCommand(0xEE)
        );
    }

    #[test]
    fn truncated_ack_is_rejected() {
        let mut raw: &[u8] = &[CMD_ACK, 5];
        assert!(matches!(
            ControlMessage::decode(&mut raw).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }
}
