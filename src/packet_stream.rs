//! Provides [PacketStream] for parsing RPC packets from a byte stream.

use bytes::Buf as _;
use futures::prelude::*;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::decode::{Framer, Source};
use crate::message::{Packet, PacketParseError};

#[derive(Debug, thiserror::Error)]
/// Error receiving an RPC [Packet].
pub enum NextPacketError {
    #[error("Failed to read bytes")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Failed to parse packet")]
    PacketParse(
        #[source]
        #[from]
        PacketParseError,
    ),
    #[error("Unexpected end of stream while parsing packet")]
    UnexpectedEndOfStream,
}

#[pin_project::pin_project]
#[derive(Debug)]
/// [Stream] of [Packet]s parsed from underlying [Stream] of bytes.
///
/// Packets are self-delimiting so bytes are buffered until the buffer starts
/// with a complete packet. A packet is only parsed once it is complete.
///
/// A packet that decodes but is not a valid request or response is skipped
/// with an error item. Any other parse error discards the buffered input
/// because the stream cannot be resynchronized.
pub struct PacketStream<Stream> {
    #[pin]
    stream: Stream,
    buffer: bytes::BytesMut,
    framer: Framer,
}

impl<Stream> PacketStream<Stream> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buffer: bytes::BytesMut::new(),
            framer: Framer::default(),
        }
    }
}

impl<Stream_> Stream for PacketStream<Stream_>
where
    Stream_: TryStream<Ok = Vec<u8>>,
    Stream_::Error: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Packet, NextPacketError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(frame_len) = this.framer.frame_len(&this.buffer[..]) {
                *this.framer = Framer::default();
                let result = {
                    let mut source = Source::new(&this.buffer[..frame_len]);
                    Packet::parse(&mut source)
                };
                match result {
                    Ok(packet) => {
                        this.buffer.advance(frame_len);
                        return Poll::Ready(Some(Ok(packet)));
                    }
                    Err(error) => {
                        if error.is_invalid_packet() {
                            this.buffer.advance(frame_len);
                        } else {
                            this.buffer.clear();
                        }
                        return Poll::Ready(Some(Err(NextPacketError::PacketParse(error))));
                    }
                }
            }

            match futures::ready!(this.stream.as_mut().try_poll_next(cx)) {
                Some(Ok(data)) => this.buffer.extend_from_slice(&data),
                Some(Err(err)) => {
                    return Poll::Ready(Some(Err(NextPacketError::Source(Box::new(err)))))
                }
                None => {
                    if this.buffer.is_empty() {
                        return Poll::Ready(None);
                    } else {
                        this.buffer.clear();
                        *this.framer = Framer::default();
                        return Poll::Ready(Some(Err(NextPacketError::UnexpectedEndOfStream)));
                    }
                }
            }
        }
    }
}
