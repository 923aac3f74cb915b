use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::message::{Message, Payload, ReliableMode};
use crate::sequence::{SenderId, SequenceId};

pub const PROTOCOL_VERSION: u8 = 1;

/// A request with this many ids still fits into a single UDP datagram
pub const MAX_REQUESTED_IDS_PER_MESSAGE: usize = 8000;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const FLAG_RESEND: u8 = 1;
const FLAG_RECEIVER_PRESENT: u8 = 2;

#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MessageKind {
    Application = 0,
    KeepAlive = 1,
    RequestSeqIds = 2,
    StackAck = 3,
    Stack = 4,
}

impl MessageKind {
    fn of(payload: &Payload) -> MessageKind {
        match payload {
            Payload::Application { .. } => MessageKind::Application,
            Payload::KeepAlive => MessageKind::KeepAlive,
            Payload::RequestSeqIds { .. } => MessageKind::RequestSeqIds,
            Payload::StackAck { .. } => MessageKind::StackAck,
            Payload::Stack { .. } => MessageKind::Stack,
        }
    }
}

/// Encodes a message as a single datagram, see the crate documentation for the format.
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(0); // placeholder for the checksum
    encode_body(message, &mut buf);

    let checksum = CHECKSUM.checksum(&buf[4..]);
    buf[..4].copy_from_slice(&checksum.to_be_bytes());
    buf.freeze()
}

fn encode_body(message: &Message, buf: &mut BytesMut) {
    let mut flags = 0;
    if message.is_resend {
        flags |= FLAG_RESEND;
    }
    if message.receiver_id.is_some() {
        flags |= FLAG_RECEIVER_PRESENT;
    }

    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(MessageKind::of(&message.payload).into());
    buf.put_u8(message.reliable_mode.into());
    buf.put_u8(flags);
    buf.put_u32(message.sender_id.0);
    if let Some(receiver_id) = message.receiver_id {
        buf.put_u32(receiver_id.0);
    }
    buf.put_u64(message.sequence_id.to_raw());

    match &message.payload {
        Payload::Application { kind, stackable, data } => {
            buf.put_u16(*kind);
            buf.put_u8(if *stackable { 1 } else { 0 });
            buf.put_usize_varint(data.len());
            buf.put_slice(data);
        }
        Payload::KeepAlive => {}
        Payload::RequestSeqIds { absent_ids } => {
            buf.put_usize_varint(absent_ids.len());
            for id in absent_ids {
                buf.put_u64(id.to_raw());
            }
        }
        Payload::StackAck { last_received_id } => {
            buf.put_u64(last_received_id.to_raw());
        }
        Payload::Stack { elements } => {
            buf.put_usize_varint(elements.len());
            let mut element_buf = BytesMut::new();
            for element in elements {
                element_buf.clear();
                encode_body(element, &mut element_buf);
                buf.put_usize_varint(element_buf.len());
                buf.put_slice(&element_buf);
            }
        }
    }
}

/// Decodes a datagram, verifying its checksum. Trailing data is rejected.
pub fn decode(datagram: &[u8]) -> anyhow::Result<Message> {
    let mut buf = datagram;
    let checksum = buf.try_get_u32()?;
    let actual = CHECKSUM.checksum(buf);
    if checksum != actual {
        bail!("checksum mismatch: expected {:08x}, was {:08x}", checksum, actual);
    }

    let message = decode_body(&mut buf, true)?;
    if buf.has_remaining() {
        bail!("{} bytes of trailing data", buf.remaining());
    }
    Ok(message)
}

fn decode_body(buf: &mut impl Buf, allow_stack: bool) -> anyhow::Result<Message> {
    let version = buf.try_get_u8()?;
    if version != PROTOCOL_VERSION {
        bail!("unsupported protocol version {}", version);
    }

    let kind = MessageKind::try_from(buf.try_get_u8()?)
        .map_err(|e| anyhow!("unknown message kind {}", e.number))?;
    let reliable_mode = ReliableMode::try_from(buf.try_get_u8()?)
        .map_err(|e| anyhow!("unknown reliable mode {}", e.number))?;
    let flags = buf.try_get_u8()?;
    let sender_id = SenderId(buf.try_get_u32()?);
    let receiver_id = if flags & FLAG_RECEIVER_PRESENT != 0 {
        Some(SenderId(buf.try_get_u32()?))
    }
    else {
        None
    };
    let sequence_id = SequenceId::from_raw(buf.try_get_u64()?);

    let payload = match kind {
        MessageKind::Application => {
            let kind = buf.try_get_u16()?;
            let stackable = buf.try_get_u8()? != 0;
            let len = buf.try_get_usize_varint()?;
            if buf.remaining() < len {
                bail!("application data of length {} exceeds the remaining {} bytes", len, buf.remaining());
            }
            Payload::Application { kind, stackable, data: buf.copy_to_bytes(len) }
        }
        MessageKind::KeepAlive => Payload::KeepAlive,
        MessageKind::RequestSeqIds => {
            let num_ids = buf.try_get_usize_varint()?;
            // every id takes 8 bytes, so this bounds the allocation by the datagram size
            if buf.remaining() / size_of::<u64>() < num_ids {
                bail!("{} requested ids exceed the remaining {} bytes", num_ids, buf.remaining());
            }
            let mut absent_ids = Vec::with_capacity(num_ids);
            for _ in 0..num_ids {
                absent_ids.push(SequenceId::from_raw(buf.try_get_u64()?));
            }
            Payload::RequestSeqIds { absent_ids }
        }
        MessageKind::StackAck => {
            Payload::StackAck { last_received_id: SequenceId::from_raw(buf.try_get_u64()?) }
        }
        MessageKind::Stack => {
            if !allow_stack {
                bail!("nested stacks are not supported");
            }
            let num_elements = buf.try_get_usize_varint()?;
            let mut elements = Vec::new();
            for _ in 0..num_elements {
                let len = buf.try_get_usize_varint()?;
                if buf.remaining() < len {
                    bail!("stack element of length {} exceeds the remaining {} bytes", len, buf.remaining());
                }
                let mut element_buf = buf.copy_to_bytes(len);
                let element = decode_body(&mut element_buf, false)?;
                if element_buf.has_remaining() {
                    bail!("{} bytes of trailing data in stack element", element_buf.remaining());
                }
                elements.push(element);
            }
            Payload::Stack { elements }
        }
    };

    Ok(Message {
        reliable_mode,
        sender_id,
        receiver_id,
        sequence_id,
        is_resend: flags & FLAG_RESEND != 0,
        payload,
    })
}
