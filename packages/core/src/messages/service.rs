//! The service-group protocol message.
//!
//! Unlike the membership catalogue, every SG exchange shares one fixed
//! message shape; the payload is interpreted by the SG engine according to
//! the type byte (a member list for JSTOP_REQ/JSTART_CMD, the SG name for
//! JOIN_REQ, nothing for most replies).

use bytes::{Buf, BufMut};

use super::{ensure, get_bytes};
use crate::types::{SgMsgStatus, SgMsgType};
use crate::wire::WireError;

/// A message on the reserved service-group port.
///
/// Wire layout: `u8 type, u8 status, u16 sevent_id, u32 global_sgid,
/// u32 global_lastid, u16 sglevel, u16 length, length bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgMessage {
    pub ty: SgMsgType,
    /// Reply status; `None` on requests and commands.
    pub status: Option<SgMsgStatus>,
    /// Id of the sevent this message belongs to (initiator-local).
    pub sevent_id: u16,
    /// Cluster-wide SG id, or 0 when not yet allocated.
    pub global_sgid: u32,
    /// Highest global SG counter the sender has seen; lets the first
    /// member of a new SG pick a fresh id.
    pub global_lastid: u32,
    pub sglevel: u16,
    pub payload: Vec<u8>,
}

impl SgMessage {
    /// A bare message with an empty payload.
    #[must_use]
    pub fn new(ty: SgMsgType) -> Self {
        Self {
            ty,
            status: None,
            sevent_id: 0,
            global_sgid: 0,
            global_lastid: 0,
            sglevel: 0,
            payload: Vec::new(),
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ty.to_wire());
        buf.put_u8(self.status.map_or(0, SgMsgStatus::to_wire));
        buf.put_u16_le(self.sevent_id);
        buf.put_u32_le(self.global_sgid);
        buf.put_u32_le(self.global_lastid);
        buf.put_u16_le(self.sglevel);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf, 16, "sg message header")?;
        let ty = SgMsgType::from_wire(buf.get_u8())?;
        let status = match buf.get_u8() {
            0 => None,
            v => Some(SgMsgStatus::from_wire(v)?),
        };
        let sevent_id = buf.get_u16_le();
        let global_sgid = buf.get_u32_le();
        let global_lastid = buf.get_u32_le();
        let sglevel = buf.get_u16_le();
        let length = buf.get_u16_le() as usize;
        let payload = get_bytes(buf, length, "sg message payload")?;
        Ok(Self {
            ty,
            status,
            sevent_id,
            global_sgid,
            global_lastid,
            sglevel,
            payload,
        })
    }

    /// Encodes a node-id list payload (JSTOP_REQ / JSTART_CMD member sets).
    #[must_use]
    pub fn encode_node_ids(ids: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ids.len() * 4);
        for id in ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    /// Decodes a node-id list payload.
    pub fn decode_node_ids(payload: &[u8]) -> Result<Vec<u32>, WireError> {
        if payload.len() % 4 != 0 {
            return Err(WireError::Truncated {
                field: "sg node id list",
                needed: 4 - payload.len() % 4,
            });
        }
        Ok(payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn round_trip(msg: &SgMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let decoded = SgMessage::decode(&mut buf.freeze()).unwrap();
        assert_eq!(&decoded, msg);
    }

    #[test]
    fn every_type_round_trips() {
        for v in 1..=12 {
            let mut msg = SgMessage::new(SgMsgType::from_wire(v).unwrap());
            msg.sevent_id = 0x1234;
            msg.global_sgid = (1 << 24) | 5;
            msg.global_lastid = 5;
            msg.sglevel = 2;
            round_trip(&msg);
        }
    }

    #[test]
    fn reply_status_round_trips() {
        for status in [SgMsgStatus::Pos, SgMsgStatus::Neg, SgMsgStatus::Wait] {
            let msg = SgMessage {
                status: Some(status),
                ..SgMessage::new(SgMsgType::JoinRep)
            };
            round_trip(&msg);
        }
    }

    #[test]
    fn name_payload_round_trips() {
        let msg = SgMessage {
            payload: b"lockspace-default".to_vec(),
            ..SgMessage::new(SgMsgType::JoinReq)
        };
        round_trip(&msg);
    }

    #[test]
    fn node_id_payload_round_trips() {
        let ids = vec![1, 2, 7, 0xFFFF_0001];
        let payload = SgMessage::encode_node_ids(&ids);
        assert_eq!(SgMessage::decode_node_ids(&payload).unwrap(), ids);
    }

    #[test]
    fn ragged_node_id_payload_is_rejected() {
        assert!(SgMessage::decode_node_ids(&[1, 2, 3]).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let msg = SgMessage {
            payload: vec![0xAA; 32],
            ..SgMessage::new(SgMsgType::JstopReq)
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut cut = buf.freeze().slice(0..20);
        assert!(matches!(
            SgMessage::decode(&mut cut).unwrap_err(),
            WireError::Truncated { .. }
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_fields_round_trip(
            ty in 1u8..=12,
            status in 0u8..=3,
            sevent_id in any::<u16>(),
            global_sgid in any::<u32>(),
            global_lastid in any::<u32>(),
            sglevel in 0u16..4,
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let msg = SgMessage {
                ty: SgMsgType::from_wire(ty).unwrap(),
                status: if status == 0 { None } else { Some(SgMsgStatus::from_wire(status).unwrap()) },
                sevent_id,
                global_sgid,
                global_lastid,
                sglevel,
                payload,
            };
            let mut buf = BytesMut::new();
            msg.encode(&mut buf);
            let decoded = SgMessage::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
