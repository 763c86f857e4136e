use std::io::Write;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::types::TS_PACKET_SIZE;
use crate::error::{MuxError, Result};

/// Receives finished transport packets from a [`Muxer`](super::muxer::Muxer).
///
/// `pcr` is the 27 MHz clock reference carried by the packet, if any.
/// Closures of the shape `FnMut(Bytes, Option<u64>) -> Result<()>` are sinks too.
pub trait PacketSink {
    /// Provides storage for the next packet. Returning `None` aborts the write.
    fn allocate_packet(&mut self) -> Option<BytesMut> {
        Some(BytesMut::zeroed(TS_PACKET_SIZE))
    }

    fn write_packet(&mut self, packet: Bytes, pcr: Option<u64>) -> Result<()>;
}

impl<F> PacketSink for F
where
    F: FnMut(Bytes, Option<u64>) -> Result<()>,
{
    fn write_packet(&mut self, packet: Bytes, pcr: Option<u64>) -> Result<()> {
        self(packet, pcr)
    }
}

/// Collects packets in memory.
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    pub packets: Vec<Bytes>,
    pub pcrs: Vec<Option<u64>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All packets concatenated.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.packets.iter().flat_map(|p| p.iter().copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl PacketSink for VecSink {
    fn write_packet(&mut self, packet: Bytes, pcr: Option<u64>) -> Result<()> {
        self.packets.push(packet);
        self.pcrs.push(pcr);
        Ok(())
    }
}

/// Writes packets back to back into any [`std::io::Write`].
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PacketSink for WriterSink<W> {
    fn write_packet(&mut self, packet: Bytes, _pcr: Option<u64>) -> Result<()> {
        self.writer.write_all(&packet)?;
        Ok(())
    }
}

/// A packet travelling through a [`ChannelSink`].
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub data: Bytes,
    pub pcr: Option<u64>,
}

/// Hands packets to an async consumer over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TsPacket>,
}

impl ChannelSink {
    /// Creates the sink and the receiving end the consumer polls.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TsPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn write_packet(&mut self, packet: Bytes, pcr: Option<u64>) -> Result<()> {
        self.tx
            .send(TsPacket { data: packet, pcr })
            .map_err(|_| MuxError::Output("packet receiver dropped".into()))
    }
}
