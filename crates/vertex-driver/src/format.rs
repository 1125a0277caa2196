// SPDX-License-Identifier: AGPL-3.0-only

//! Pixel format table and plane size computation
//!
//! Plane sizes come from bits per pixel of the full-resolution image, so a
//! 4:2:0 chroma plane is listed as 4 (interleaved) or 2 (separate) bits:
//! `size = bits * width * height / 8`.

use crate::error::{Result, VertexError};
use vertex_chip::limits::{MAX_IO_BUFFERS, MAX_PLANES};
use vertex_chip::message::Geometry;

/// Four-character format code
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Format codes
pub mod codes {
    use super::fourcc;

    /// YUV 4:2:0, Y plane + interleaved CbCr
    pub const NV12: u32 = fourcc(b"NV12");
    /// YUV 4:2:0, Y plane + interleaved CrCb
    pub const NV21: u32 = fourcc(b"NV21");
    /// YUV 4:2:0, Y / Cr / Cb planes
    pub const YV12: u32 = fourcc(b"YV12");
    /// YUV 4:2:0, Y / Cb / Cr planes
    pub const I420: u32 = fourcc(b"I420");
    /// YUV 4:2:2, Y / Cb / Cr planes
    pub const I422: u32 = fourcc(b"I422");
    /// YUV 4:2:2 packed YCbYCr
    pub const YUYV: u32 = fourcc(b"YUYV");
    /// Packed 24-bit RGB
    pub const RGB: u32 = fourcc(b"RGB3");
    /// Packed 32-bit RGB with padding byte
    pub const RGBX: u32 = fourcc(b"RGBX");
    /// Unsigned 8-bit plane
    pub const U8: u32 = fourcc(b"U008");
    /// Unsigned 16-bit plane
    pub const U16: u32 = fourcc(b"U016");
    /// Unsigned 32-bit plane
    pub const U32: u32 = fourcc(b"U032");
    /// Signed 8-bit plane
    pub const S8: u32 = fourcc(b"S008");
    /// Signed 16-bit plane
    pub const S16: u32 = fourcc(b"S016");
    /// Signed 32-bit plane
    pub const S32: u32 = fourcc(b"S032");
}

/// One row of the format table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Description
    pub name: &'static str,
    /// Format code
    pub code: u32,
    /// Plane count
    pub planes: u32,
    /// Bits per full-resolution pixel, per plane
    pub bits_per_pixel: [u32; MAX_PLANES],
}

/// Every format the engine accepts
pub const FORMATS: [FormatInfo; 14] = [
    FormatInfo { name: "YUV 4:2:0 Y/CbCr", code: codes::NV12, planes: 2, bits_per_pixel: [8, 4, 0] },
    FormatInfo { name: "YUV 4:2:0 Y/CrCb", code: codes::NV21, planes: 2, bits_per_pixel: [8, 4, 0] },
    FormatInfo { name: "YUV 4:2:0 Y/Cr/Cb", code: codes::YV12, planes: 3, bits_per_pixel: [8, 2, 2] },
    FormatInfo { name: "YUV 4:2:0 Y/Cb/Cr", code: codes::I420, planes: 3, bits_per_pixel: [8, 2, 2] },
    FormatInfo { name: "YUV 4:2:2 Y/Cb/Cr", code: codes::I422, planes: 3, bits_per_pixel: [8, 4, 4] },
    FormatInfo { name: "YUV 4:2:2 packed YCbYCr", code: codes::YUYV, planes: 1, bits_per_pixel: [16, 0, 0] },
    FormatInfo { name: "RGB 24", code: codes::RGB, planes: 1, bits_per_pixel: [24, 0, 0] },
    FormatInfo { name: "RGBX 32", code: codes::RGBX, planes: 1, bits_per_pixel: [32, 0, 0] },
    FormatInfo { name: "Unsigned 8", code: codes::U8, planes: 1, bits_per_pixel: [8, 0, 0] },
    FormatInfo { name: "Unsigned 16", code: codes::U16, planes: 1, bits_per_pixel: [16, 0, 0] },
    FormatInfo { name: "Unsigned 32", code: codes::U32, planes: 1, bits_per_pixel: [32, 0, 0] },
    FormatInfo { name: "Signed 8", code: codes::S8, planes: 1, bits_per_pixel: [8, 0, 0] },
    FormatInfo { name: "Signed 16", code: codes::S16, planes: 1, bits_per_pixel: [16, 0, 0] },
    FormatInfo { name: "Signed 32", code: codes::S32, planes: 1, bits_per_pixel: [32, 0, 0] },
];

/// Look up a format code
pub fn lookup(code: u32) -> Result<&'static FormatInfo> {
    FORMATS
        .iter()
        .find(|f| f.code == code)
        .ok_or(VertexError::UnsupportedFormat { format: code })
}

/// Client description of one input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    /// Client target id (graph port)
    pub target: u32,
    /// Format code
    pub format: u32,
    /// Plane count the client expects
    pub planes: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// A validated format with its plane sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Client description
    pub spec: FormatSpec,
    /// Table row
    pub info: &'static FormatInfo,
    /// Bytes per plane (unused planes are 0)
    pub plane_sizes: [usize; MAX_PLANES],
}

impl Format {
    /// Validate a client description against the table.
    ///
    /// # Errors
    ///
    /// Returns error for unknown codes, a plane count mismatch, empty
    /// geometry, or a plane that does not fit a 32-bit size.
    pub fn new(spec: FormatSpec) -> Result<Self> {
        let info = lookup(spec.format)?;
        if spec.planes != info.planes {
            return Err(VertexError::invalid_argument(format!(
                "target {}: {} has {} plane(s), got {}",
                spec.target, info.name, info.planes, spec.planes
            )));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(VertexError::invalid_argument(format!(
                "target {}: empty geometry {}x{}",
                spec.target, spec.width, spec.height
            )));
        }
        let pixels = u64::from(spec.width) * u64::from(spec.height);
        let mut plane_sizes = [0usize; MAX_PLANES];
        for (size, bits) in plane_sizes.iter_mut().zip(info.bits_per_pixel) {
            let bytes = u64::from(bits) * pixels / 8;
            // INVOKE carries plane sizes as u32
            let bytes = u32::try_from(bytes).map_err(|_| {
                VertexError::invalid_argument(format!(
                    "target {}: {}x{} plane of {bytes} bytes is too large",
                    spec.target, spec.width, spec.height
                ))
            })?;
            *size = bytes as usize;
        }
        Ok(Self {
            spec,
            info,
            plane_sizes,
        })
    }

    /// Bytes of one plane
    pub fn plane_size(&self, plane: usize) -> usize {
        self.plane_sizes.get(plane).copied().unwrap_or(0)
    }

    /// Bytes of all planes
    pub fn total_size(&self) -> usize {
        self.plane_sizes.iter().sum()
    }

    /// Wire geometry
    pub const fn geometry(&self) -> Geometry {
        Geometry {
            format: self.spec.format,
            planes: self.spec.planes,
            width: self.spec.width,
            height: self.spec.height,
        }
    }
}

/// Validated formats of one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatList {
    formats: Vec<Format>,
}

impl FormatList {
    /// Validate every entry; all or nothing.
    pub fn new(specs: &[FormatSpec]) -> Result<Self> {
        if specs.is_empty() {
            return Err(VertexError::invalid_argument("empty format list"));
        }
        if specs.len() > MAX_IO_BUFFERS {
            return Err(VertexError::invalid_argument(format!(
                "{} formats exceed the limit of {MAX_IO_BUFFERS}",
                specs.len()
            )));
        }
        let formats = specs.iter().copied().map(Format::new).collect::<Result<_>>()?;
        Ok(Self { formats })
    }

    /// Entries in client order
    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Entry count
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Never true for a constructed list
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Wire geometry padded to the payload array
    pub fn geometry(&self) -> [Geometry; MAX_IO_BUFFERS] {
        let mut out = [Geometry::default(); MAX_IO_BUFFERS];
        for (slot, f) in out.iter_mut().zip(&self.formats) {
            *slot = f.geometry();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(format: u32, planes: u32) -> FormatSpec {
        FormatSpec {
            target: 1,
            format,
            planes,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn nv12_plane_sizes() {
        let f = Format::new(spec(codes::NV12, 2)).unwrap();
        assert_eq!(f.plane_size(0), 640 * 480);
        assert_eq!(f.plane_size(1), 640 * 480 / 2);
        assert_eq!(f.plane_size(2), 0);
        assert_eq!(f.total_size(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn i420_planes_quartered() {
        let f = Format::new(spec(codes::I420, 3)).unwrap();
        assert_eq!(f.plane_sizes, [640 * 480, 640 * 480 / 4, 640 * 480 / 4]);
    }

    #[test]
    fn raw_integer_planes() {
        assert_eq!(Format::new(spec(codes::U8, 1)).unwrap().total_size(), 640 * 480);
        assert_eq!(Format::new(spec(codes::S16, 1)).unwrap().total_size(), 640 * 480 * 2);
        assert_eq!(Format::new(spec(codes::U32, 1)).unwrap().total_size(), 640 * 480 * 4);
    }

    #[test]
    fn unknown_format_rejected() {
        let err = Format::new(spec(fourcc(b"ZZZZ"), 1)).unwrap_err();
        assert!(matches!(err, VertexError::UnsupportedFormat { .. }));
    }

    #[test]
    fn planes_over_four_gib_rejected() {
        let huge = FormatSpec { width: 65_536, height: 65_536, ..spec(codes::U8, 1) };
        assert!(matches!(Format::new(huge), Err(VertexError::InvalidArgument { .. })));
        let largest = FormatSpec { height: 65_535, ..huge };
        assert_eq!(Format::new(largest).unwrap().plane_size(0), 65_536 * 65_535);
        let wide = FormatSpec { width: 40_000, height: 40_000, ..spec(codes::S32, 1) };
        assert!(Format::new(wide).is_err());
    }

    #[test]
    fn plane_count_mismatch_rejected() {
        assert!(Format::new(spec(codes::NV21, 3)).is_err());
    }

    #[test]
    fn list_is_all_or_nothing() {
        let ok = spec(codes::RGB, 1);
        let bad = spec(0, 1);
        assert!(FormatList::new(&[ok, bad]).is_err());
        let list = FormatList::new(&[ok, spec(codes::YUYV, 1)]).unwrap();
        assert_eq!(list.len(), 2);
        let geometry = list.geometry();
        assert_eq!(geometry[1].format, codes::YUYV);
        assert_eq!(geometry[2], Geometry::default());
    }

    #[test]
    fn table_codes_unique() {
        for (i, a) in FORMATS.iter().enumerate() {
            for b in &FORMATS[i + 1..] {
                assert_ne!(a.code, b.code, "{} / {}", a.name, b.name);
            }
        }
    }
}
