//! Deterministic binary encoding for the wire format.
//!
//! Field order is fixed, variable-width fields are length
//! prefixed and multi-byte integers are network byte order, so a
//! payload always serializes to the same bytes. The wire format is
//! also the record format of the optional message log.
use async_trait::async_trait;
use binary_stream::{
    futures::{BinaryReader, BinaryWriter, Decodable, Encodable},
    Endian, Options,
};
use futures::io::{AsyncRead, AsyncSeek, AsyncWrite};
use std::io::Result;

use crate::{
    Agree, Enlist, EnlistSet, Envelope, Init, List, MessageKind,
    PeerId, Queued, Register, RoundId, SessionData, Start, Stop,
    VerifyList, DIGEST_LEN,
};

pub(crate) fn encoding_error(
    e: impl std::error::Error + Send + Sync + 'static,
) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

mod types {
    pub const INIT: u8 = 0;
    pub const ENLIST: u8 = 1;
    pub const ENLIST_SET: u8 = 2;
    pub const AGREE: u8 = 3;
    pub const QUEUED: u8 = 4;
    pub const REGISTER: u8 = 5;
    pub const LIST: u8 = 6;
    pub const VERIFY_LIST: u8 = 7;
    pub const START: u8 = 8;
    pub const STOP: u8 = 9;
    pub const SESSION_DATA: u8 = 127;
}

/// Default binary encoding options.
fn encoding_options() -> Options {
    Options {
        endian: Endian::Big,
        max_buffer_size: Some(1024 * 1024),
    }
}

/// Encode to a binary buffer.
pub async fn encode(
    encodable: &impl Encodable,
) -> crate::Result<Vec<u8>> {
    Ok(
        binary_stream::futures::encode(encodable, encoding_options())
            .await?,
    )
}

/// Decode from a binary buffer.
pub async fn decode<T: Decodable + Default>(
    buffer: impl AsRef<[u8]>,
) -> crate::Result<T> {
    Ok(binary_stream::futures::decode(
        buffer.as_ref(),
        encoding_options(),
    )
    .await?)
}

/// Canonical serialization of an ordered envelope list: a count
/// followed by length-prefixed envelope records.
///
/// Identical to the layout produced for envelope lists embedded
/// in payloads, so roster digests can be computed over it.
pub async fn encode_envelope_list(
    list: &[Envelope],
) -> crate::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&(list.len() as u32).to_be_bytes());
    for envelope in list {
        let bytes = binary_stream::futures::encode(
            envelope,
            encoding_options(),
        )
        .await?;
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Decode a sequence of concatenated envelope records.
///
/// Used to replay a message log, whose records are envelopes in
/// wire format appended back to back.
pub async fn decode_all(
    buffer: impl AsRef<[u8]>,
) -> crate::Result<Vec<Envelope>> {
    let buffer = buffer.as_ref();
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buffer.len() {
        let length = framed_len(&buffer[offset..])?;
        let record: Envelope =
            decode(&buffer[offset..offset + length]).await?;
        records.push(record);
        offset += length;
    }
    Ok(records)
}

/// Total width of the envelope record at the head of a buffer.
fn framed_len(buffer: &[u8]) -> crate::Result<usize> {
    fn read_u32(buffer: &[u8], at: usize) -> crate::Result<usize> {
        let bytes: [u8; 4] = buffer
            .get(at..at + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(crate::Error::TruncatedRecord)?;
        Ok(u32::from_be_bytes(bytes) as usize)
    }

    let payload = read_u32(buffer, 1)?;
    let signature = read_u32(buffer, 1 + 4 + payload)?;
    let total = 1 + 4 + payload + 4 + signature;
    if buffer.len() < total {
        return Err(crate::Error::TruncatedRecord);
    }
    Ok(total)
}

impl From<&MessageKind> for u8 {
    fn from(value: &MessageKind) -> Self {
        match value {
            MessageKind::Init => types::INIT,
            MessageKind::Enlist => types::ENLIST,
            MessageKind::EnlistSet => types::ENLIST_SET,
            MessageKind::Agree => types::AGREE,
            MessageKind::Queued => types::QUEUED,
            MessageKind::Register => types::REGISTER,
            MessageKind::List => types::LIST,
            MessageKind::VerifyList => types::VERIFY_LIST,
            MessageKind::Start => types::START,
            MessageKind::Stop => types::STOP,
            MessageKind::SessionData => types::SESSION_DATA,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = crate::Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        Ok(match value {
            types::INIT => MessageKind::Init,
            types::ENLIST => MessageKind::Enlist,
            types::ENLIST_SET => MessageKind::EnlistSet,
            types::AGREE => MessageKind::Agree,
            types::QUEUED => MessageKind::Queued,
            types::REGISTER => MessageKind::Register,
            types::LIST => MessageKind::List,
            types::VERIFY_LIST => MessageKind::VerifyList,
            types::START => MessageKind::Start,
            types::STOP => MessageKind::Stop,
            types::SESSION_DATA => MessageKind::SessionData,
            _ => return Err(crate::Error::MessageKind(value)),
        })
    }
}

async fn encode_buffer<W: AsyncWrite + AsyncSeek + Unpin + Send>(
    writer: &mut BinaryWriter<W>,
    buffer: &[u8],
) -> Result<()> {
    writer.write_u32(buffer.len() as u32).await?;
    writer.write_bytes(buffer).await?;
    Ok(())
}

async fn decode_buffer<R: AsyncRead + AsyncSeek + Unpin + Send>(
    reader: &mut BinaryReader<R>,
) -> Result<Vec<u8>> {
    let size = reader.read_u32().await?;
    let buf = reader.read_bytes(size as usize).await?;
    Ok(buf)
}

async fn encode_string<W: AsyncWrite + AsyncSeek + Unpin + Send>(
    writer: &mut BinaryWriter<W>,
    value: &str,
) -> Result<()> {
    encode_buffer(writer, value.as_bytes()).await
}

async fn decode_string<R: AsyncRead + AsyncSeek + Unpin + Send>(
    reader: &mut BinaryReader<R>,
) -> Result<String> {
    let buf = decode_buffer(reader).await?;
    String::from_utf8(buf).map_err(encoding_error)
}

async fn decode_id<R: AsyncRead + AsyncSeek + Unpin + Send>(
    reader: &mut BinaryReader<R>,
) -> Result<PeerId> {
    let bytes = reader.read_bytes(DIGEST_LEN).await?;
    bytes.as_slice().try_into().map_err(encoding_error)
}

async fn decode_digest<R: AsyncRead + AsyncSeek + Unpin + Send>(
    reader: &mut BinaryReader<R>,
) -> Result<[u8; DIGEST_LEN]> {
    let bytes = reader.read_bytes(DIGEST_LEN).await?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| encoding_error(crate::Error::BadIdLength))
}

async fn encode_envelopes<W: AsyncWrite + AsyncSeek + Unpin + Send>(
    writer: &mut BinaryWriter<W>,
    list: &[Envelope],
) -> Result<()> {
    writer.write_u32(list.len() as u32).await?;
    for envelope in list {
        let bytes = binary_stream::futures::encode(
            envelope,
            encoding_options(),
        )
        .await?;
        encode_buffer(writer, &bytes).await?;
    }
    Ok(())
}

async fn decode_envelopes<R: AsyncRead + AsyncSeek + Unpin + Send>(
    reader: &mut BinaryReader<R>,
) -> Result<Vec<Envelope>> {
    let count = reader.read_u32().await?;
    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bytes = decode_buffer(reader).await?;
        let envelope: Envelope = binary_stream::futures::decode(
            &bytes,
            encoding_options(),
        )
        .await?;
        list.push(envelope);
    }
    Ok(list)
}

#[async_trait]
impl Encodable for Envelope {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        let id: u8 = (&self.kind).into();
        writer.write_u8(id).await?;
        encode_buffer(writer, &self.payload).await?;
        encode_buffer(writer, &self.signature).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Envelope {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        let id = reader.read_u8().await?;
        self.kind = id.try_into().map_err(encoding_error)?;
        self.payload = decode_buffer(reader).await?;
        self.signature = decode_buffer(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Init {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(self.peer_id.as_ref()).await?;
        encode_buffer(writer, &self.nonce).await?;
        writer.write_u64(self.timestamp).await?;
        writer.write_bytes(&self.group_digest).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Init {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.peer_id = decode_id(reader).await?;
        self.nonce = decode_buffer(reader).await?;
        self.timestamp = reader.read_u64().await?;
        self.group_digest = decode_digest(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Enlist {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(self.peer_id.as_ref()).await?;
        let init = binary_stream::futures::encode(
            &self.init,
            encoding_options(),
        )
        .await?;
        encode_buffer(writer, &init).await?;
        encode_buffer(writer, &self.ephemeral_key).await?;
        encode_buffer(writer, &self.optional).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Enlist {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.peer_id = decode_id(reader).await?;
        let init = decode_buffer(reader).await?;
        self.init = binary_stream::futures::decode(
            &init,
            encoding_options(),
        )
        .await?;
        self.ephemeral_key = decode_buffer(reader).await?;
        self.optional = decode_buffer(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for EnlistSet {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        encode_envelopes(writer, &self.enlists).await
    }
}

#[async_trait]
impl Decodable for EnlistSet {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.enlists = decode_envelopes(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Agree {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(self.peer_id.as_ref()).await?;
        writer.write_bytes(self.round_id.as_ref()).await?;
        encode_buffer(writer, &self.ephemeral_key).await?;
        encode_buffer(writer, &self.optional).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Agree {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.peer_id = decode_id(reader).await?;
        self.round_id = RoundId::new(decode_digest(reader).await?);
        self.ephemeral_key = decode_buffer(reader).await?;
        self.optional = decode_buffer(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Queued {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        encode_envelopes(writer, &self.agrees).await?;
        encode_buffer(writer, &self.nonce).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Queued {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.agrees = decode_envelopes(reader).await?;
        self.nonce = decode_buffer(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Register {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(self.peer_id.as_ref()).await?;
        writer.write_bytes(self.round_id.as_ref()).await?;
        encode_buffer(writer, &self.ephemeral_key).await?;
        encode_buffer(writer, &self.optional).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Register {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.peer_id = decode_id(reader).await?;
        self.round_id = RoundId::new(decode_digest(reader).await?);
        self.ephemeral_key = decode_buffer(reader).await?;
        self.optional = decode_buffer(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for List {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        encode_envelopes(writer, &self.registers).await
    }
}

#[async_trait]
impl Decodable for List {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.registers = decode_envelopes(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for VerifyList {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(&self.roster_digest).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for VerifyList {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.roster_digest = decode_digest(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Start {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        encode_envelopes(writer, &self.registers).await?;
        writer.write_u32(self.signatures.len() as u32).await?;
        for signature in &self.signatures {
            encode_buffer(writer, signature).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Decodable for Start {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.registers = decode_envelopes(reader).await?;
        let count = reader.read_u32().await?;
        let mut signatures = Vec::with_capacity(count as usize);
        for _ in 0..count {
            signatures.push(decode_buffer(reader).await?);
        }
        self.signatures = signatures;
        Ok(())
    }
}

#[async_trait]
impl Encodable for Stop {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        writer.write_bytes(self.peer_id.as_ref()).await?;
        writer.write_bytes(self.round_id.as_ref()).await?;
        writer.write_bool(self.immediate).await?;
        encode_string(writer, &self.reason).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for Stop {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.peer_id = decode_id(reader).await?;
        self.round_id = RoundId::new(decode_digest(reader).await?);
        self.immediate = reader.read_bool().await?;
        self.reason = decode_string(reader).await?;
        Ok(())
    }
}

#[async_trait]
impl Encodable for SessionData {
    async fn encode<W: AsyncWrite + AsyncSeek + Unpin + Send>(
        &self,
        writer: &mut BinaryWriter<W>,
    ) -> Result<()> {
        encode_buffer(writer, &self.packet).await?;
        Ok(())
    }
}

#[async_trait]
impl Decodable for SessionData {
    async fn decode<R: AsyncRead + AsyncSeek + Unpin + Send>(
        &mut self,
        reader: &mut BinaryReader<R>,
    ) -> Result<()> {
        self.packet = decode_buffer(reader).await?;
        Ok(())
    }
}
