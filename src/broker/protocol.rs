//! MQTT 3.1 / 3.1.1 control packet codec.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single packet's remaining length.
pub const MAX_PACKET_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_1,
    V3_1_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(anyhow!("unsupported QoS {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub protocol: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub message_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub topic_filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ControlPacket {
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    PingReq,
    Disconnect,
}

/// Outcome of a CONNECT, mapped onto the 3.1.1 CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn code(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0x00,
            ConnectReturnCode::UnacceptableProtocolVersion => 0x01,
            ConnectReturnCode::ServerUnavailable => 0x03,
            ConnectReturnCode::BadUsernameOrPassword => 0x04,
            ConnectReturnCode::NotAuthorized => 0x05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAckResult {
    Granted(Qos),
    Failure,
}

/// Result of reading the CONNECT header; level 5 is surfaced so the caller can refuse it politely.
#[derive(Debug)]
pub enum ConnectRead {
    Packet(ConnectPacket),
    UnsupportedLevel(u8),
}

/// Parse an MQTT CONNECT packet from the stream.
pub async fn read_connect<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<ConnectRead> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header).await?;
    let packet_type = header[0] >> 4;
    if packet_type != 1 {
        return Err(anyhow!("expected CONNECT (type 1), got {packet_type}"));
    }
    let remaining_len = decode_remaining_length_stream(stream).await?;
    let mut payload = vec![0u8; remaining_len];
    stream.read_exact(&mut payload).await?;
    parse_connect(&payload)
}

/// Read a control packet after CONNECT.
pub async fn read_packet<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<ControlPacket> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;
    let remaining_len = decode_remaining_length_stream(stream).await?;
    let mut buf = vec![0u8; remaining_len];
    stream.read_exact(&mut buf).await?;
    match packet_type {
        1 => Err(anyhow!("duplicate CONNECT on established connection")),
        3 => Ok(ControlPacket::Publish(parse_publish(flags, &buf)?)),
        4 => Ok(ControlPacket::PubAck(parse_packet_id(&buf)?)),
        5 => Ok(ControlPacket::PubRec(parse_packet_id(&buf)?)),
        6 => Ok(ControlPacket::PubRel(parse_packet_id(&buf)?)),
        7 => Ok(ControlPacket::PubComp(parse_packet_id(&buf)?)),
        8 => Ok(ControlPacket::Subscribe(parse_subscribe(&buf)?)),
        10 => Ok(ControlPacket::Unsubscribe(parse_unsubscribe(&buf)?)),
        12 => Ok(ControlPacket::PingReq),
        14 => Ok(ControlPacket::Disconnect),
        _ => Err(anyhow!("unsupported packet type {packet_type}")),
    }
}

pub async fn write_connack<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    session_present: bool,
    code: ConnectReturnCode,
) -> Result<()> {
    let flags = if session_present { 0x01 } else { 0x00 };
    stream.write_all(&[0x20, 0x02, flags, code.code()]).await?;
    Ok(())
}

pub async fn write_suback<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    packet_id: u16,
    grants: &[SubAckResult],
) -> Result<()> {
    let mut payload = Vec::with_capacity(2 + grants.len());
    payload.extend_from_slice(&packet_id.to_be_bytes());
    for grant in grants {
        let code = match grant {
            SubAckResult::Granted(Qos::AtMostOnce) => 0x00,
            SubAckResult::Granted(Qos::AtLeastOnce) => 0x01,
            SubAckResult::Granted(Qos::ExactlyOnce) => 0x02,
            SubAckResult::Failure => 0x80,
        };
        payload.push(code);
    }
    let mut frame = vec![0x90];
    frame.extend(encode_remaining_length(payload.len()));
    frame.extend(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

pub async fn write_unsuback<S: AsyncWriteExt + Unpin>(stream: &mut S, packet_id: u16) -> Result<()> {
    write_ack_variant(stream, 0xB0, packet_id).await
}

pub async fn write_puback<S: AsyncWriteExt + Unpin>(stream: &mut S, mid: u16) -> Result<()> {
    write_ack_variant(stream, 0x40, mid).await
}

pub async fn write_pubrec<S: AsyncWriteExt + Unpin>(stream: &mut S, mid: u16) -> Result<()> {
    write_ack_variant(stream, 0x50, mid).await
}

pub async fn write_pubcomp<S: AsyncWriteExt + Unpin>(stream: &mut S, mid: u16) -> Result<()> {
    write_ack_variant(stream, 0x70, mid).await
}

pub async fn write_pingresp<S: AsyncWriteExt + Unpin>(stream: &mut S) -> Result<()> {
    stream.write_all(&[0xD0, 0x00]).await?;
    Ok(())
}

/// Encode a QoS 0 PUBLISH frame without retain or dup flags.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    let mut frame = vec![0x30];
    frame.extend(encode_remaining_length(body.len()));
    frame.extend(body);
    frame
}

fn parse_connect(buf: &[u8]) -> Result<ConnectRead> {
    let mut cursor = 0usize;
    let proto_name = read_string(buf, &mut cursor)?;
    let proto_level = read_u8(buf, &mut cursor)?;
    let connect_flags = read_u8(buf, &mut cursor)?;
    let keep_alive = read_u16(buf, &mut cursor)?;

    let protocol = match (proto_name.as_str(), proto_level) {
        ("MQIsdp", 3) => ProtocolVersion::V3_1,
        ("MQTT", 4) => ProtocolVersion::V3_1_1,
        (_, other) => return Ok(ConnectRead::UnsupportedLevel(other)),
    };
    if connect_flags & 0x01 != 0 {
        anyhow::bail!("reserved CONNECT flag set");
    }

    let client_id = read_string(buf, &mut cursor)?;
    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    if will_flag {
        // Will messages are accepted on the wire but never delivered.
        let _ = Qos::from_bits((connect_flags >> 3) & 0x03)?;
        let _topic = read_string(buf, &mut cursor)?;
        let _payload = read_binary(buf, &mut cursor)?;
    }
    let username_flag = (connect_flags & 0x80) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username = if username_flag {
        Some(read_string(buf, &mut cursor)?)
    } else {
        None
    };
    let password = if password_flag {
        Some(read_binary(buf, &mut cursor)?)
    } else {
        None
    };

    Ok(ConnectRead::Packet(ConnectPacket {
        client_id,
        keep_alive,
        clean_session,
        protocol,
        username,
        password,
    }))
}

fn parse_publish(flags: u8, buf: &[u8]) -> Result<PublishPacket> {
    let dup = (flags & 0b0000_1000) != 0;
    let retain = (flags & 0b0000_0001) != 0;
    let qos = Qos::from_bits((flags & 0b0000_0110) >> 1)?;
    if matches!(qos, Qos::AtMostOnce) && dup {
        anyhow::bail!("dup flag set for qos0 publish");
    }
    let mut cursor = 0usize;
    let topic = read_string(buf, &mut cursor)?;
    let message_id = match qos {
        Qos::AtMostOnce => None,
        _ => Some(read_u16(buf, &mut cursor)?),
    };
    let payload = buf[cursor..].to_vec();
    Ok(PublishPacket {
        topic,
        payload,
        qos,
        message_id,
        dup,
        retain,
    })
}

pub fn parse_subscribe(buf: &[u8]) -> Result<SubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut filters = Vec::new();
    while cursor < buf.len() {
        let topic_filter = read_string(buf, &mut cursor)?;
        let options = read_u8(buf, &mut cursor)?;
        if options & 0xFC != 0 {
            anyhow::bail!("reserved subscription option bits set");
        }
        filters.push(SubscriptionRequest {
            topic_filter,
            qos: Qos::from_bits(options & 0x03)?,
        });
    }
    if filters.is_empty() {
        anyhow::bail!("SUBSCRIBE without topic filters");
    }
    Ok(SubscribePacket { packet_id, filters })
}

fn parse_unsubscribe(buf: &[u8]) -> Result<UnsubscribePacket> {
    let mut cursor = 0usize;
    let packet_id = read_u16(buf, &mut cursor)?;
    let mut topics = Vec::new();
    while cursor < buf.len() {
        topics.push(read_string(buf, &mut cursor)?);
    }
    if topics.is_empty() {
        anyhow::bail!("UNSUBSCRIBE without topic filters");
    }
    Ok(UnsubscribePacket { packet_id, topics })
}

fn parse_packet_id(buf: &[u8]) -> Result<u16> {
    let mut cursor = 0usize;
    read_u16(buf, &mut cursor)
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8> {
    if *cursor >= buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let v = buf[*cursor];
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    if *cursor + 1 >= buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let s = std::str::from_utf8(&buf[*cursor..*cursor + len])
        .context("invalid utf8 in mqtt string")?
        .to_string();
    *cursor += len;
    Ok(s)
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        anyhow::bail!("unexpected end of buffer");
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

async fn decode_remaining_length_stream<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<usize> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        let byte = buf[0];
        value += ((byte & 0x7F) as usize) * multiplier;
        if (byte & 0x80) == 0 {
            if value > MAX_PACKET_SIZE {
                anyhow::bail!("packet of {value} bytes exceeds limit {MAX_PACKET_SIZE}");
            }
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(anyhow!("remaining length overflow"))
}

pub fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

async fn write_ack_variant<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    packet_type: u8,
    mid: u16,
) -> Result<()> {
    let [hi, lo] = mid.to_be_bytes();
    stream.write_all(&[packet_type, 0x02, hi, lo]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_body(level: u8, name: &str, flags: u8, tail: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(level);
        body.push(flags);
        body.extend_from_slice(&30u16.to_be_bytes());
        body.extend_from_slice(tail);
        body
    }

    fn mqtt_str(s: &str) -> Vec<u8> {
        let mut out = (s.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn connect_carries_credentials() {
        let mut tail = mqtt_str("client-1");
        tail.extend(mqtt_str("alice"));
        tail.extend(mqtt_str("secret1"));
        let body = connect_body(4, "MQTT", 0xC2, &tail);
        let ConnectRead::Packet(pkt) = parse_connect(&body).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.client_id, "client-1");
        assert_eq!(pkt.protocol, ProtocolVersion::V3_1_1);
        assert!(pkt.clean_session);
        assert_eq!(pkt.username.as_deref(), Some("alice"));
        assert_eq!(pkt.password.as_deref(), Some(&b"secret1"[..]));
    }

    #[test]
    fn connect_without_credentials_leaves_them_absent() {
        let tail = mqtt_str("client-2");
        let body = connect_body(3, "MQIsdp", 0x02, &tail);
        let ConnectRead::Packet(pkt) = parse_connect(&body).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(pkt.protocol, ProtocolVersion::V3_1);
        assert!(pkt.username.is_none());
        assert!(pkt.password.is_none());
    }

    #[test]
    fn connect_level_five_is_reported_not_parsed() {
        let body = connect_body(5, "MQTT", 0x02, &mqtt_str("c"));
        assert!(matches!(
            parse_connect(&body).unwrap(),
            ConnectRead::UnsupportedLevel(5)
        ));
    }

    #[test]
    fn subscribe_parses_multiple_filters() {
        let mut buf = 10u16.to_be_bytes().to_vec();
        buf.extend(mqtt_str("sensors/temp"));
        buf.push(0x01);
        buf.extend(mqtt_str("alerts/#"));
        buf.push(0x00);
        let parsed = parse_subscribe(&buf).unwrap();
        assert_eq!(parsed.packet_id, 10);
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.filters[0].qos, Qos::AtLeastOnce);
        assert_eq!(parsed.filters[1].topic_filter, "alerts/#");
    }

    #[test]
    fn publish_qos1_reads_message_id() {
        let mut buf = mqtt_str("sensors/temp");
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(b"21.5");
        let pkt = parse_publish(0b0010, &buf).unwrap();
        assert_eq!(pkt.qos, Qos::AtLeastOnce);
        assert_eq!(pkt.message_id, Some(7));
        assert_eq!(pkt.payload, b"21.5");
    }

    #[test]
    fn remaining_length_encodes_multibyte() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16_383), vec![0xFF, 0x7F]);
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let mut frame = vec![0x30];
        frame.extend(encode_remaining_length(MAX_PACKET_SIZE + 1));
        let mut reader = &frame[..];
        let err = read_packet(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn suback_marks_failures() {
        let mut out = Vec::new();
        write_suback(
            &mut out,
            3,
            &[SubAckResult::Granted(Qos::AtLeastOnce), SubAckResult::Failure],
        )
        .await
        .unwrap();
        assert_eq!(out, vec![0x90, 0x04, 0x00, 0x03, 0x01, 0x80]);
    }
}
