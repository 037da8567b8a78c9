//! Raw frame container for filter input and output.
//!
//! Frames travel between the host tools and the device model as flat planar
//! files: a fixed little-endian header followed by the sample payload, lines
//! stored plane-major. The layout is:
//!
//! ```text
//! offset  size  field
//! 0x00    8     magic "sippfrm\0"
//! 0x08    2     container version (currently 1)
//! 0x0a    2     sample format code (1 = u8, 2 = u16)
//! 0x0c    4     width in pixels
//! 0x10    4     height in lines
//! 0x14    4     plane count
//! 0x18    ..    samples, plane-major, lines top to bottom
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sipp_emu::frame::Frame;
//!
//! let frame = Frame::from_file("capture.frm")?;
//! println!("{}x{}, {} planes", frame.width, frame.height, frame.planes);
//! # Ok::<(), sipp_emu::frame::FrameError>(())
//! ```

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Magic bytes at the start of every frame file.
pub const FRAME_MAGIC: [u8; 8] = *b"sippfrm\0";

/// Current container version.
pub const FRAME_VERSION: u16 = 1;

/// Largest dimension accepted on load. Matches the 16-bit width and height
/// fields of the frame dimension registers.
pub const MAX_DIMENSION: u32 = 0xFFFF;

/// Largest plane count accepted on load.
pub const MAX_PLANES: u32 = 16;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic bytes, not a frame file")]
    Magic,

    #[error("unsupported container version {0}")]
    Version(u16),

    #[error("unknown sample format code {0}")]
    Format(u16),

    #[error("file truncated: need {need} payload bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("bad frame geometry {width}x{height} with {planes} planes")]
    Geometry { width: u32, height: u32, planes: u32 },
}

/// Sample storage width.
///
/// The device takes pixel width from the buffer CFG format field; this code
/// only records how samples are stored in the container. Half-float payloads
/// use [`SampleFormat::U16`] and carry fp16 bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    U16,
}

impl SampleFormat {
    /// Bytes per sample.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::U16 => 2,
        }
    }

    /// On-disk format code.
    pub fn code(self) -> u16 {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::U16 => 2,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(SampleFormat::U8),
            2 => Some(SampleFormat::U16),
            _ => None,
        }
    }
}

/// On-disk frame header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawFrameHeader {
    pub magic: [u8; 8],
    pub version: u16,
    pub format: u16,
    pub width: u32,
    pub height: u32,
    pub planes: u32,
}

/// A planar frame held in host memory.
///
/// Samples are widened to `u16` regardless of storage width so filter code
/// operates on one representation. Eight-bit frames keep the low byte when
/// serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub planes: u32,
    pub format: SampleFormat,
    /// Samples in plane-major order: `data[(plane * height + y) * width + x]`.
    pub data: Vec<u16>,
}

impl Frame {
    /// Create a zero-filled frame.
    pub fn new(width: u32, height: u32, planes: u32, format: SampleFormat) -> Self {
        let len = width as usize * height as usize * planes as usize;
        Self {
            width,
            height,
            planes,
            format,
            data: vec![0; len],
        }
    }

    /// Load a frame file through a read-only mapping.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FrameError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_bytes(&mmap)
    }

    /// Parse a frame from raw container bytes. Trailing bytes past the
    /// payload are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let (header, rest) =
            RawFrameHeader::read_from_prefix(bytes).map_err(|_| FrameError::Truncated {
                need: std::mem::size_of::<RawFrameHeader>(),
                have: bytes.len(),
            })?;

        if header.magic != FRAME_MAGIC {
            return Err(FrameError::Magic);
        }
        if header.version != FRAME_VERSION {
            return Err(FrameError::Version(header.version));
        }
        let format =
            SampleFormat::from_code(header.format).ok_or(FrameError::Format(header.format))?;

        let RawFrameHeader {
            width,
            height,
            planes,
            ..
        } = header;
        if width == 0
            || height == 0
            || planes == 0
            || width > MAX_DIMENSION
            || height > MAX_DIMENSION
            || planes > MAX_PLANES
        {
            return Err(FrameError::Geometry {
                width,
                height,
                planes,
            });
        }

        let count = width as usize * height as usize * planes as usize;
        let need = count * format.bytes();
        if rest.len() < need {
            return Err(FrameError::Truncated {
                need,
                have: rest.len(),
            });
        }

        let mut data = Vec::with_capacity(count);
        match format {
            SampleFormat::U8 => data.extend(rest[..need].iter().map(|&b| u16::from(b))),
            SampleFormat::U16 => {
                let mut cursor = Cursor::new(&rest[..need]);
                for _ in 0..count {
                    data.push(cursor.read_u16::<LittleEndian>()?);
                }
            }
        }

        Ok(Self {
            width,
            height,
            planes,
            format,
            data,
        })
    }

    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            std::mem::size_of::<RawFrameHeader>() + self.data.len() * self.format.bytes(),
        );
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        out.extend_from_slice(&self.format.code().to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.planes.to_le_bytes());
        match self.format {
            SampleFormat::U8 => out.extend(self.data.iter().map(|&s| s as u8)),
            SampleFormat::U16 => {
                for &s in &self.data {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
        }
        out
    }

    /// Write the frame to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FrameError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Bytes per line as streamed into a device buffer.
    #[inline]
    pub fn line_bytes(&self) -> usize {
        self.width as usize * self.format.bytes()
    }

    /// Borrow one line of one plane.
    pub fn line(&self, plane: u32, y: u32) -> &[u16] {
        let w = self.width as usize;
        let start = (plane * self.height + y) as usize * w;
        &self.data[start..start + w]
    }

    /// Mutably borrow one line of one plane.
    pub fn line_mut(&mut self, plane: u32, y: u32) -> &mut [u16] {
        let w = self.width as usize;
        let start = (plane * self.height + y) as usize * w;
        &mut self.data[start..start + w]
    }

    /// Read one sample.
    #[inline]
    pub fn sample(&self, plane: u32, y: u32, x: u32) -> u16 {
        self.data[((plane * self.height + y) * self.width + x) as usize]
    }

    /// Write one sample.
    #[inline]
    pub fn set_sample(&mut self, plane: u32, y: u32, x: u32, value: u16) {
        self.data[((plane * self.height + y) * self.width + x) as usize] = value;
    }

    /// Print a human-readable description to stdout.
    pub fn print_summary(&self) {
        println!(
            "frame: {}x{}, {} plane(s), {:?}",
            self.width, self.height, self.planes, self.format
        );
        let w = self.width as usize;
        let h = self.height as usize;
        for pl in 0..self.planes as usize {
            let plane = &self.data[pl * h * w..(pl + 1) * h * w];
            let lo = plane.iter().copied().min().unwrap_or(0);
            let hi = plane.iter().copied().max().unwrap_or(0);
            println!("  plane {}: samples in [{}, {}]", pl, lo, hi);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::new(4, 3, 2, SampleFormat::U16);
        for pl in 0..2 {
            for y in 0..3 {
                for x in 0..4 {
                    frame.set_sample(pl, y, x, (pl * 100 + y * 10 + x) as u16);
                }
            }
        }
        frame
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<RawFrameHeader>(), 24);
    }

    #[test]
    fn test_bytes_round_trip() {
        let frame = sample_frame();
        let back = Frame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_u8_payload_is_packed() {
        let mut frame = Frame::new(2, 1, 1, SampleFormat::U8);
        frame.set_sample(0, 0, 0, 0xAB);
        frame.set_sample(0, 0, 1, 0xCD);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 24 + 2);
        assert_eq!(&bytes[24..], &[0xAB, 0xCD]);
        let back = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(back.sample(0, 0, 1), 0xCD);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample_frame().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(Frame::from_bytes(&bytes), Err(FrameError::Magic)));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = sample_frame().to_bytes();
        bytes[8] = 9;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(FrameError::Version(9))
        ));
    }

    #[test]
    fn test_rejects_unknown_format_code() {
        let mut bytes = sample_frame().to_bytes();
        bytes[10] = 7;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(FrameError::Format(7))
        ));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut bytes = sample_frame().to_bytes();
        bytes.truncate(bytes.len() - 1);
        match Frame::from_bytes(&bytes) {
            Err(FrameError::Truncated { need, have }) => {
                assert_eq!(need, 4 * 3 * 2 * 2);
                assert_eq!(have, need - 1);
            }
            other => panic!("expected truncation error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_geometry() {
        let mut bytes = sample_frame().to_bytes();
        bytes[12..16].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(FrameError::Geometry { width: 0, .. })
        ));
    }

    #[test]
    fn test_line_indexing() {
        let frame = sample_frame();
        assert_eq!(frame.line(1, 2), &[120, 121, 122, 123]);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("sipp-frame-{}.frm", std::process::id()));
        let frame = sample_frame();
        frame.save(&path).unwrap();
        let back = Frame::from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(back, frame);
    }
}
