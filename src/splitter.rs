//! Reassembly of CA messages from arbitrary chunks of socket bytes.
//!
//! TCP reads can deliver half a header, several messages at once, or a message
//! spread over many reads. [`PacketSplitter`] holds whatever does not yet form a
//! complete message until the next read arrives. Held bytes are only appended
//! to, and each message is copied out exactly once when it completes.

use std::{io, net::SocketAddr};

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::frame::{EXTENDED_HEADER_SIZE, Frame};

/// The full size of the message at the start of `buffer`, once its header is complete
fn complete_message_size(buffer: &[u8]) -> Option<usize> {
    let header = Frame::from_bytes(&buffer[..buffer.len().min(EXTENDED_HEADER_SIZE)]);
    header.has_complete_header().then(|| header.message_size())
}

/// Cut the first message off `buffer`, if all of it has arrived
fn next_message(buffer: &mut BytesMut) -> Option<Frame> {
    let size = complete_message_size(buffer)?;
    if buffer.len() < size {
        trace!("Holding {} of {size} bytes for next read", buffer.len());
        return None;
    }
    Some(Frame::from_bytes(buffer.split_to(size).to_vec()))
}

/// Splits a byte stream into whole messages
#[derive(Debug, Default)]
pub struct PacketSplitter {
    /// Bytes of an incomplete message, waiting for the next read
    remainder: BytesMut,
    /// Where the pushed bytes came from, carried onto every message
    sender: Option<SocketAddr>,
}

impl PacketSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly arrived bytes and collect every message they complete
    pub fn push(&mut self, incoming: Frame) -> Vec<Frame> {
        if let Some(sender) = incoming.sender() {
            self.sender = Some(sender);
        }
        self.remainder.extend_from_slice(incoming.as_bytes());
        let mut messages = Vec::new();
        while let Some(message) = next_message(&mut self.remainder) {
            messages.push(match self.sender {
                Some(sender) => message.with_sender(sender),
                None => message,
            });
        }
        messages
    }

    /// Drop any held bytes, so that a broken stream cannot leak into the next one
    pub fn reset(&mut self) {
        if !self.remainder.is_empty() {
            debug!("Discarding {} held bytes on splitter reset", self.remainder.len());
        }
        self.remainder.clear();
        self.sender = None;
    }

    /// Is there an incomplete message waiting for more bytes?
    pub fn is_holding(&self) -> bool {
        !self.remainder.is_empty()
    }

    pub fn held_len(&self) -> usize {
        self.remainder.len()
    }

    /// Split a single UDP datagram, which never continues into the next one
    ///
    /// Every message keeps the sender tag of the datagram.
    pub fn split_datagram(datagram: Frame) -> Vec<Frame> {
        let mut splitter = PacketSplitter::new();
        let messages = splitter.push(datagram);
        if splitter.is_holding() {
            debug!(
                "Ignoring {} trailing bytes of truncated datagram",
                splitter.held_len()
            );
        }
        messages
    }
}

/// Stream decoding works straight on the read buffer, which holds the remainder
impl Decoder for PacketSplitter {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.remainder.is_empty() {
            // Bytes pushed by hand go in front of the stream
            let mut held = std::mem::take(&mut self.remainder);
            held.unsplit(src.split());
            *src = held;
        }
        Ok(next_message(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let message = self.decode(src)?;
        if message.is_none() && !src.is_empty() {
            debug!(
                "Stream closed with {} bytes of an incomplete message",
                src.len()
            );
            src.clear();
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Command;

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(Frame::new(Command::Version, 0, 13, 0, 0, &[]).into_bytes());
        stream.extend(Frame::new(Command::ClientName, 0, 0, 0, 0, b"someone").into_bytes());
        stream.extend(
            Frame::new_extended(Command::ReadNotify, 6, 3, 1, 2, &[7u8; 24]).into_bytes(),
        );
        stream.extend(Frame::new(Command::Echo, 0, 0, 0, 0, &[]).into_bytes());
        stream
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let mut stream = Frame::new(Command::Echo, 0, 0, 0, 0, &[]).into_bytes();
        stream.extend(Frame::new(Command::HostName, 0, 0, 0, 0, b"host").into_bytes());
        let mut splitter = PacketSplitter::new();
        let messages = splitter.push(Frame::from_bytes(stream));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].command(), Command::Echo as u16);
        assert_eq!(messages[1].command(), Command::HostName as u16);
        assert!(!splitter.is_holding());
    }

    #[test]
    fn truncated_header_waits() {
        let bytes = Frame::new(Command::Echo, 0, 0, 0, 0, &[]).into_bytes();
        let mut splitter = PacketSplitter::new();
        assert!(splitter.push(Frame::from_bytes(bytes[..10].to_vec())).is_empty());
        assert!(splitter.is_holding());
        let messages = splitter.push(Frame::from_bytes(bytes[10..].to_vec()));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_bytes(), bytes.as_slice());
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let stream = sample_stream();
        let whole = PacketSplitter::new().push(Frame::from_bytes(stream.clone()));
        assert_eq!(whole.len(), 4);

        let mut splitter = PacketSplitter::new();
        let mut trickled = Vec::new();
        for byte in &stream {
            trickled.extend(splitter.push(Frame::from_bytes(vec![*byte])));
        }
        assert_eq!(trickled, whole);
        assert!(!splitter.is_holding());
    }

    #[test]
    fn reset_discards_remainder() {
        let mut splitter = PacketSplitter::new();
        splitter.push(Frame::from_bytes(vec![0, 0x17, 0, 0]));
        assert_eq!(splitter.held_len(), 4);
        splitter.reset();
        assert!(!splitter.is_holding());
        let echo = Frame::new(Command::Echo, 0, 0, 0, 0, &[]);
        assert_eq!(splitter.push(echo.clone()), vec![echo]);
    }

    #[test]
    fn decoder_interface_drains_queue() {
        let mut splitter = PacketSplitter::new();
        let mut buffer = BytesMut::from(sample_stream().as_slice());
        let mut commands = Vec::new();
        while let Some(frame) = splitter.decode(&mut buffer).unwrap() {
            commands.push(frame.command());
        }
        assert_eq!(commands, vec![0x00, 0x14, 0x0F, 0x17]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn large_message_over_many_reads() {
        let payload: Vec<u8> = (0..1_048_576u32).map(|i| i as u8).collect();
        let message = Frame::new_extended(Command::ReadNotify, 4, 1_048_576, 1, 2, &payload);
        let bytes = message.as_bytes().to_vec();
        let mut splitter = PacketSplitter::new();
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(16384) {
            buffer.extend_from_slice(chunk);
            if let Some(frame) = splitter.decode(&mut buffer).unwrap() {
                decoded.push(frame);
            } else {
                // The partial message stays in the read buffer
                assert!(!splitter.is_holding());
            }
        }
        assert_eq!(decoded, vec![message]);
        assert!(buffer.is_empty());

        // The same, through push
        let mut pushed = Vec::new();
        for chunk in bytes.chunks(16384) {
            pushed.extend(splitter.push(Frame::from_bytes(chunk)));
        }
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].payload(), payload.as_slice());
        assert!(!splitter.is_holding());
    }

    #[test]
    fn pushed_bytes_lead_the_stream() {
        let bytes = Frame::new(Command::HostName, 0, 0, 0, 0, b"host").into_bytes();
        let mut splitter = PacketSplitter::new();
        assert!(splitter.push(Frame::from_bytes(&bytes[..5])).is_empty());
        let mut buffer = BytesMut::from(&bytes[5..]);
        let frame = splitter.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.as_bytes(), bytes.as_slice());
        assert!(!splitter.is_holding());
    }

    #[test]
    fn eof_discards_incomplete_message() {
        let mut splitter = PacketSplitter::new();
        let mut buffer = BytesMut::from(&[0u8, 0x17, 0, 0, 0][..]);
        assert!(splitter.decode_eof(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn datagram_messages_keep_their_sender() {
        let origin: SocketAddr = "10.0.0.5:5064".parse().unwrap();
        let mut bytes = Frame::new(Command::Version, 0, 13, 0, 0, &[]).into_bytes();
        bytes.extend(Frame::new(Command::Echo, 0, 0, 0, 0, &[]).into_bytes());
        let messages = PacketSplitter::split_datagram(Frame::from_bytes(bytes).with_sender(origin));
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.sender() == Some(origin)));
    }

    #[test]
    fn datagram_with_trailing_garbage() {
        let mut bytes = Frame::new(Command::Version, 0, 13, 0, 0, &[]).into_bytes();
        bytes.extend([0u8, 6, 0]);
        let messages = PacketSplitter::split_datagram(Frame::from_bytes(bytes));
        assert_eq!(messages.len(), 1);
    }
}
