//! Wire format of a sequence connection.
//!
//! A connection carries two independent byte directions:
//!
//! - **credit**, receiver to sender: one byte per requested element. The value is ignored, only
//!   its presence matters. End-of-input means the receiver has gone away.
//! - **data**, sender to receiver: a Version frame, then at most one Element or End frame per
//!   credit byte.
//!
//! Frames start with a tag byte:
//!
//! - Version (239): 7 magic bytes, the ASCII text `SEQDUCT`, then a var len byte array containing
//!   the ASCII protocol version.
//! - Element (1): a var len byte array containing the codec's encoding of one element.
//! - End (2): nothing else. Marks the end of the sequence.
//!
//! Var len ints are little-endian base-128 with a continuation bit, at most 9 bytes, the 9th
//! carrying a full 8 bits. End-of-input at a frame boundary is a clean end of the sequence,
//! end-of-input inside a frame is a protocol error.

use crate::error::{is_connection_lost, ProtocolError, RecvError};
use bytes::{Bytes, BytesMut, BufMut};
use std::io::{self, Read, Write};


/// Value written for each credit. Readers ignore it.
pub const CREDIT_BYTE: u8 = 1;

// constants for variable length integer coding.
pub(crate) const VARINT_MASK: u8 = 0b01111111;
pub(crate) const VARINT_MORE: u8 = 0b10000000;
pub(crate) const VARINT_FINAL_SHIFT: u8 = 56;

// constants for version frame coding.
pub(crate) const VERSION_FRAME_MAGIC_BYTES: [u8; 7] = [83, 113, 212, 7, 190, 41, 166];
pub(crate) const VERSION_FRAME_HUMAN_TEXT: [u8; 7] = *b"SEQDUCT";
pub(crate) const PROTOCOL_VERSION: &str = "1";

/// Frame tag byte
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameTag {
    Version = 239,
    Element = 1,
    End = 2,
}

impl FrameTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        use FrameTag::*;
        [Version, Element, End].into_iter().find(|&tag| tag as u8 == b)
    }
}


// ==== credit direction ====


// block until a credit byte arrives. false means the peer is gone.
pub(crate) fn read_credit<R: Read>(r: &mut R) -> io::Result<bool> {
    let mut buf = [0];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // a reset while waiting for credit is the peer going away with data unread
            Err(e) if is_connection_lost(&e) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

// grant one credit.
pub(crate) fn write_credit<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[CREDIT_BYTE])?;
    w.flush()
}


// ==== data direction, writing ====


// accumulates encoded frames until flushed onto a stream.
#[derive(Default)]
pub(crate) struct FrameWriter(BytesMut);

impl FrameWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // write a var len int.
    fn write_varint(&mut self, mut i: u64) {
        for _ in 0..8 {
            let mut b = i as u8 & VARINT_MASK;
            i >>= 7;
            b |= ((i != 0) as u8) << 7;
            self.0.put_u8(b);
            if i == 0 {
                return;
            }
        }
        debug_assert!(i != 0 && (i >> 8) == 0);
        self.0.put_u8(i as u8);
    }

    // write a var len byte array.
    fn write_varbytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.0.put_slice(bytes);
    }

    // write a Version frame.
    pub(crate) fn version(&mut self) {
        self.0.put_u8(FrameTag::Version as u8);
        self.0.put_slice(&VERSION_FRAME_MAGIC_BYTES);
        self.0.put_slice(&VERSION_FRAME_HUMAN_TEXT);
        self.write_varbytes(PROTOCOL_VERSION.as_bytes());
    }

    // write an Element frame.
    pub(crate) fn element(&mut self, payload: &[u8]) {
        self.0.put_u8(FrameTag::Element as u8);
        self.write_varbytes(payload);
    }

    // write an End frame.
    pub(crate) fn end(&mut self) {
        self.0.put_u8(FrameTag::End as u8);
    }

    // write everything accumulated so far onto w and flush it.
    pub(crate) fn flush_to<W: Write>(&mut self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.0)?;
        w.flush()?;
        self.0.clear();
        Ok(())
    }
}


// ==== data direction, reading ====


// a frame the receiver has to act on. Version frames are consumed by the reader itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Frame {
    Element(Bytes),
    End,
}

// reads and validates frames from the data direction.
pub(crate) struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
    saw_version: bool,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(inner: R, max_frame_len: usize) -> Self {
        FrameReader {
            inner,
            max_frame_len,
            saw_version: false,
        }
    }

    // read the next Element or End frame. None means a clean end-of-input between frames.
    pub(crate) fn read_frame(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            // a sender closing before its Version frame is also a clean close
            let Some(b) = self.read_tag_byte()? else { return Ok(None) };
            let tag = FrameTag::from_byte(b).ok_or(ProtocolError::InvalidTag(b))?;
            if !self.saw_version && tag != FrameTag::Version {
                return Err(ProtocolError::BadVersion("expected Version frame first".into()).into());
            }
            match tag {
                FrameTag::Version => {
                    if self.saw_version {
                        return Err(ProtocolError::UnexpectedFrame("Version").into());
                    }
                    self.read_version_body()?;
                    self.saw_version = true;
                }
                FrameTag::Element => {
                    let len = self.read_varint()?;
                    if len > self.max_frame_len as u64 {
                        return Err(ProtocolError::FrameTooLarge {
                            len,
                            max: self.max_frame_len,
                        }.into());
                    }
                    let mut payload = BytesMut::zeroed(len as usize);
                    self.inner.read_exact(&mut payload)?;
                    return Ok(Some(Frame::Element(payload.freeze())));
                }
                FrameTag::End => return Ok(Some(Frame::End)),
            }
        }
    }

    // read one byte, or None on end-of-input.
    fn read_tag_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    // read a var len int.
    fn read_varint(&mut self) -> Result<u64, RecvError> {
        let mut i: u64 = 0;
        for x in 0..8 {
            let b = self.read_byte()?;
            i |= ((b & VARINT_MASK) as u64) << (x * 7);
            if (b & VARINT_MORE) == 0 {
                return Ok(i);
            }
        }
        let b = self.read_byte()?;
        i |= (b as u64) << VARINT_FINAL_SHIFT;
        Ok(i)
    }

    // read and validate the rest of a Version frame.
    fn read_version_body(&mut self) -> Result<(), RecvError> {
        let mut magic = [0; 7];
        self.inner.read_exact(&mut magic)?;
        let mut text = [0; 7];
        self.inner.read_exact(&mut text)?;
        if magic != VERSION_FRAME_MAGIC_BYTES || text != VERSION_FRAME_HUMAN_TEXT {
            return Err(ProtocolError::BadVersion("wrong magic bytes".into()).into());
        }
        let len = self.read_varint()?;
        if len > 64 {
            return Err(ProtocolError::BadVersion("version string too long".into()).into());
        }
        let mut version = vec![0; len as usize];
        self.inner.read_exact(&mut version)?;
        if !version.is_ascii() {
            return Err(ProtocolError::BadVersion("version string not ASCII".into()).into());
        }
        if version != PROTOCOL_VERSION.as_bytes() {
            return Err(ProtocolError::BadVersion(format!(
                "unsupported protocol version {:?}",
                String::from_utf8_lossy(&version),
            )).into());
        }
        Ok(())
    }
}
