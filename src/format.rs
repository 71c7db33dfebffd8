use ash::vk;
use serde::{Deserialize, Serialize};

/// Logical pixel formats addressable through the frame pool.
///
/// Each variant names a software layout (plane split, bit depth, chroma
/// subsampling). The mapping to native [`vk::Format`]s lives in
/// [`FORMAT_TABLE`]; one logical format may resolve to a single combined
/// multiplanar image or to one image per plane depending on device support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PixelFormat {
    Gray8,
    Gray16,
    GrayF32,
    Xv36,
    Bgra,
    Rgba,
    Rgb24,
    Bgr24,
    Rgb48,
    Rgba64,
    Rgb565,
    Bgr565,
    Bgr0,
    Rgb0,
    X2Rgb10,
    Gbrap,
    Gbrap16,
    GbrpF32,
    GbrapF32,
    Nv12,
    P010,
    P012,
    P016,
    Nv16,
    P210,
    P212,
    P216,
    Nv24,
    P410,
    P412,
    P416,
    Yuv420p,
    Yuv420p10,
    Yuv420p12,
    Yuv420p16,
    Yuv422p,
    Yuv422p10,
    Yuv422p12,
    Yuv422p16,
    Yuv444p,
    Yuv444p10,
    Yuv444p12,
    Yuv444p16,
    Yuyv422,
    Uyvy422,
    Y210,
    Y212,
}

impl PixelFormat {
    /// Number of software planes a frame of this format carries.
    #[rustfmt::skip]
    pub const fn plane_count(self) -> u32 {
        use PixelFormat::*;
        match self {
            Gray8 | Gray16 | GrayF32 | Xv36
            | Bgra | Rgba | Rgb24 | Bgr24 | Rgb48 | Rgba64
            | Rgb565 | Bgr565 | Bgr0 | Rgb0 | X2Rgb10
            | Yuyv422 | Uyvy422 | Y210 | Y212 => 1,
            Nv12 | P010 | P012 | P016
            | Nv16 | P210 | P212 | P216
            | Nv24 | P410 | P412 | P416 => 2,
            GbrpF32
            | Yuv420p | Yuv420p10 | Yuv420p12 | Yuv420p16
            | Yuv422p | Yuv422p10 | Yuv422p12 | Yuv422p16
            | Yuv444p | Yuv444p10 | Yuv444p12 | Yuv444p16 => 3,
            Gbrap | Gbrap16 | GbrapF32 => 4,
        }
    }

    /// Log2 horizontal and vertical chroma subsampling shifts.
    #[rustfmt::skip]
    pub const fn log2_chroma(self) -> (u32, u32) {
        use PixelFormat::*;
        match self {
            Nv12 | P010 | P012 | P016
            | Yuv420p | Yuv420p10 | Yuv420p12 | Yuv420p16 => (1, 1),
            Nv16 | P210 | P212 | P216
            | Yuv422p | Yuv422p10 | Yuv422p12 | Yuv422p16
            | Yuyv422 | Uyvy422 | Y210 | Y212 => (1, 0),
            _ => (0, 0),
        }
    }

    #[rustfmt::skip]
    pub const fn is_rgb(self) -> bool {
        use PixelFormat::*;
        matches!(self,
            Bgra | Rgba | Rgb24 | Bgr24 | Rgb48 | Rgba64
            | Rgb565 | Bgr565 | Bgr0 | Rgb0 | X2Rgb10
            | Gbrap | Gbrap16 | GbrpF32 | GbrapF32)
    }

    #[rustfmt::skip]
    pub const fn is_planar(self) -> bool {
        use PixelFormat::*;
        matches!(self,
            Gbrap | Gbrap16 | GbrpF32 | GbrapF32
            | Nv12 | P010 | P012 | P016
            | Nv16 | P210 | P212 | P216
            | Nv24 | P410 | P412 | P416
            | Yuv420p | Yuv420p10 | Yuv420p12 | Yuv420p16
            | Yuv422p | Yuv422p10 | Yuv422p12 | Yuv422p16
            | Yuv444p | Yuv444p10 | Yuv444p12 | Yuv444p16)
    }

    /// Bytes advanced per horizontal step within one row of the given plane.
    ///
    /// For packed formats this is the packed pixel stride; for interleaved
    /// chroma planes it covers both components.
    #[rustfmt::skip]
    pub const fn plane_step(self, plane: usize) -> u32 {
        use PixelFormat::*;
        match self {
            Gray8 | Gbrap
            | Yuv420p | Yuv422p | Yuv444p => 1,
            Gray16 | Gbrap16 | Rgb565 | Bgr565
            | Yuv420p10 | Yuv420p12 | Yuv420p16
            | Yuv422p10 | Yuv422p12 | Yuv422p16
            | Yuv444p10 | Yuv444p12 | Yuv444p16
            | Yuyv422 | Uyvy422 => 2,
            Rgb24 | Bgr24 => 3,
            GrayF32 | GbrpF32 | GbrapF32
            | Bgra | Rgba | Bgr0 | Rgb0 | X2Rgb10
            | Y210 | Y212 => 4,
            Rgb48 => 6,
            Xv36 | Rgba64 => 8,
            Nv12 | Nv16 | Nv24 => if plane == 0 { 1 } else { 2 },
            P010 | P012 | P016
            | P210 | P212 | P216
            | P410 | P412 | P416 => if plane == 0 { 2 } else { 4 },
        }
    }

    /// Pixel dimensions of one plane of a `width`x`height` frame.
    ///
    /// Luma, alpha and RGB planes are full size; chroma planes shrink by the
    /// format's subsampling shifts, rounding up so odd frame sizes keep their
    /// last row/column.
    pub const fn plane_extent(self, width: u32, height: u32, plane: usize) -> vk::Extent2D {
        if plane == 0 || plane == 3 || self.is_rgb() || !self.is_planar() {
            return vk::Extent2D { width, height };
        }
        let (cw, ch) = self.log2_chroma();
        vk::Extent2D {
            width: ceil_rshift(width, cw),
            height: ceil_rshift(height, ch),
        }
    }

    /// Bytes in one tightly packed row of the given plane.
    pub const fn plane_row_bytes(self, width: u32, plane: usize) -> u32 {
        self.plane_extent(width, 0, plane).width * self.plane_step(plane)
    }
}

const fn ceil_rshift(value: u32, shift: u32) -> u32 {
    (value + (1 << shift) - 1) >> shift
}

/// Aspect masks for combined multiplanar representations.
pub const ASPECT_2PLANE: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::PLANE_0.as_raw() | vk::ImageAspectFlags::PLANE_1.as_raw(),
);
pub const ASPECT_3PLANE: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::PLANE_0.as_raw()
        | vk::ImageAspectFlags::PLANE_1.as_raw()
        | vk::ImageAspectFlags::PLANE_2.as_raw(),
);

/// One row of the format table: how a logical format maps onto native images.
///
/// `ideal` is the preferred native format. When it is a combined multiplanar
/// format the whole frame is one image; when the device rejects it (or
/// multiplane use is disabled) the frame falls back to `fallback_count`
/// separate images using the formats in `fallback`. Rows whose ideal
/// representation is already per-plane have `image_count > 1` and
/// `ideal == fallback[0]`.
#[derive(Debug)]
pub struct FormatEntry {
    pub format: PixelFormat,
    pub ideal: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    /// Native plane count of `ideal`, not the software plane count.
    pub plane_count: u32,
    pub image_count: u32,
    pub fallback_count: u32,
    pub fallback: &'static [vk::Format],
}

const COLOR: vk::ImageAspectFlags = vk::ImageAspectFlags::COLOR;

macro_rules! row {
    ($fmt:ident, $ideal:ident, $aspect:expr, $planes:expr, $images:expr, $nb_fb:expr, [$($fb:ident),+ $(,)?]) => {
        FormatEntry {
            format: PixelFormat::$fmt,
            ideal: vk::Format::$ideal,
            aspect: $aspect,
            plane_count: $planes,
            image_count: $images,
            fallback_count: $nb_fb,
            fallback: &[$(vk::Format::$fb),+],
        }
    };
}

#[rustfmt::skip]
pub static FORMAT_TABLE: &[FormatEntry] = &[
    // Gray
    row!(Gray8,   R8_UNORM,   COLOR, 1, 1, 1, [R8_UNORM]),
    row!(Gray16,  R16_UNORM,  COLOR, 1, 1, 1, [R16_UNORM]),
    row!(GrayF32, R32_SFLOAT, COLOR, 1, 1, 1, [R32_SFLOAT]),

    // Packed RGB and packed YUV with an RGB-shaped texel
    row!(Xv36,    R16G16B16A16_UNORM,       COLOR, 1, 1, 1, [R16G16B16A16_UNORM]),
    row!(Bgra,    B8G8R8A8_UNORM,           COLOR, 1, 1, 1, [B8G8R8A8_UNORM]),
    row!(Rgba,    R8G8B8A8_UNORM,           COLOR, 1, 1, 1, [R8G8B8A8_UNORM]),
    row!(Rgb24,   R8G8B8_UNORM,             COLOR, 1, 1, 1, [R8G8B8_UNORM]),
    row!(Bgr24,   B8G8R8_UNORM,             COLOR, 1, 1, 1, [B8G8R8_UNORM]),
    row!(Rgb48,   R16G16B16_UNORM,          COLOR, 1, 1, 1, [R16G16B16_UNORM]),
    row!(Rgba64,  R16G16B16A16_UNORM,       COLOR, 1, 1, 1, [R16G16B16A16_UNORM]),
    row!(Rgb565,  R5G6B5_UNORM_PACK16,      COLOR, 1, 1, 1, [R5G6B5_UNORM_PACK16]),
    row!(Bgr565,  B5G6R5_UNORM_PACK16,      COLOR, 1, 1, 1, [B5G6R5_UNORM_PACK16]),
    row!(Bgr0,    B8G8R8A8_UNORM,           COLOR, 1, 1, 1, [B8G8R8A8_UNORM]),
    row!(Rgb0,    R8G8B8A8_UNORM,           COLOR, 1, 1, 1, [R8G8B8A8_UNORM]),
    row!(X2Rgb10, A2R10G10B10_UNORM_PACK32, COLOR, 1, 1, 1, [A2R10G10B10_UNORM_PACK32]),

    // Planar RGB, one image per plane even in the ideal case
    row!(Gbrap,    R8_UNORM,   COLOR, 1, 4, 4, [R8_UNORM, R8_UNORM, R8_UNORM, R8_UNORM]),
    row!(Gbrap16,  R16_UNORM,  COLOR, 1, 4, 4, [R16_UNORM, R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(GbrpF32,  R32_SFLOAT, COLOR, 1, 3, 3, [R32_SFLOAT, R32_SFLOAT, R32_SFLOAT]),
    row!(GbrapF32, R32_SFLOAT, COLOR, 1, 4, 4, [R32_SFLOAT, R32_SFLOAT, R32_SFLOAT, R32_SFLOAT]),

    // Two-plane 420 at 8, 10, 12 and 16 bits
    row!(Nv12, G8_B8R8_2PLANE_420_UNORM,                  ASPECT_2PLANE, 2, 1, 2, [R8_UNORM,  R8G8_UNORM]),
    row!(P010, G10X6_B10X6R10X6_2PLANE_420_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P012, G12X4_B12X4R12X4_2PLANE_420_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P016, G16_B16R16_2PLANE_420_UNORM,               ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),

    // Two-plane 422
    row!(Nv16, G8_B8R8_2PLANE_422_UNORM,                  ASPECT_2PLANE, 2, 1, 2, [R8_UNORM,  R8G8_UNORM]),
    row!(P210, G10X6_B10X6R10X6_2PLANE_422_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P212, G12X4_B12X4R12X4_2PLANE_422_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P216, G16_B16R16_2PLANE_422_UNORM,               ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),

    // Two-plane 444
    row!(Nv24, G8_B8R8_2PLANE_444_UNORM,                  ASPECT_2PLANE, 2, 1, 2, [R8_UNORM,  R8G8_UNORM]),
    row!(P410, G10X6_B10X6R10X6_2PLANE_444_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P412, G12X4_B12X4R12X4_2PLANE_444_UNORM_3PACK16, ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),
    row!(P416, G16_B16R16_2PLANE_444_UNORM,               ASPECT_2PLANE, 2, 1, 2, [R16_UNORM, R16G16_UNORM]),

    // Three-plane 420, 422, 444 at 8, 10, 12 and 16 bits
    row!(Yuv420p,   G8_B8_R8_3PLANE_420_UNORM,    ASPECT_3PLANE, 3, 1, 3, [R8_UNORM,  R8_UNORM,  R8_UNORM]),
    row!(Yuv420p10, G16_B16_R16_3PLANE_420_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv420p12, G16_B16_R16_3PLANE_420_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv420p16, G16_B16_R16_3PLANE_420_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv422p,   G8_B8_R8_3PLANE_422_UNORM,    ASPECT_3PLANE, 3, 1, 3, [R8_UNORM,  R8_UNORM,  R8_UNORM]),
    row!(Yuv422p10, G16_B16_R16_3PLANE_422_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv422p12, G16_B16_R16_3PLANE_422_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv422p16, G16_B16_R16_3PLANE_422_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv444p,   G8_B8_R8_3PLANE_444_UNORM,    ASPECT_3PLANE, 3, 1, 3, [R8_UNORM,  R8_UNORM,  R8_UNORM]),
    row!(Yuv444p10, G16_B16_R16_3PLANE_444_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv444p12, G16_B16_R16_3PLANE_444_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),
    row!(Yuv444p16, G16_B16_R16_3PLANE_444_UNORM, ASPECT_3PLANE, 3, 1, 3, [R16_UNORM, R16_UNORM, R16_UNORM]),

    // Single-plane packed 422
    row!(Yuyv422, G8B8G8R8_422_UNORM,                     COLOR, 1, 1, 1, [R8G8B8A8_UNORM]),
    row!(Uyvy422, B8G8R8G8_422_UNORM,                     COLOR, 1, 1, 1, [R8G8B8A8_UNORM]),
    row!(Y210,    G10X6B10X6G10X6R10X6_422_UNORM_4PACK16, COLOR, 1, 1, 1, [R16G16B16A16_UNORM]),
    row!(Y212,    G12X4B12X4G12X4R12X4_422_UNORM_4PACK16, COLOR, 1, 1, 1, [R16G16B16A16_UNORM]),
];

pub fn lookup(format: PixelFormat) -> Option<&'static FormatEntry> {
    FORMAT_TABLE.iter().find(|e| e.format == format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_has_a_row() {
        // The metadata methods and the table must agree on the format set.
        for entry in FORMAT_TABLE {
            assert!(entry.format.plane_count() >= 1);
        }
        assert!(lookup(PixelFormat::Nv12).is_some());
        assert!(lookup(PixelFormat::Yuv444p16).is_some());
    }

    #[test]
    fn fallback_list_matches_declared_count() {
        for entry in FORMAT_TABLE {
            assert_eq!(
                entry.fallback_count as usize,
                entry.fallback.len(),
                "{:?}",
                entry.format
            );
        }
    }

    #[test]
    fn fallback_never_needs_more_planes_than_ideal() {
        for entry in FORMAT_TABLE {
            let ideal_planes = entry.plane_count.max(entry.image_count);
            assert!(
                ideal_planes >= entry.fallback_count,
                "{:?}: ideal {} planes < {} fallback images",
                entry.format,
                ideal_planes,
                entry.fallback_count
            );
        }
    }

    #[test]
    fn multi_image_rows_have_matching_fallback() {
        // Rows whose ideal representation is already split per plane reuse the
        // fallback list as the primary one, so the two counts must line up.
        for entry in FORMAT_TABLE.iter().filter(|e| e.image_count > 1) {
            assert_eq!(entry.image_count, entry.fallback_count);
            assert_eq!(entry.ideal, entry.fallback[0]);
            assert_eq!(entry.plane_count, 1);
        }
    }

    #[test]
    fn multiplane_aspect_covers_each_plane() {
        for entry in FORMAT_TABLE {
            match entry.plane_count {
                2 => assert_eq!(entry.aspect, ASPECT_2PLANE, "{:?}", entry.format),
                3 => assert_eq!(entry.aspect, ASPECT_3PLANE, "{:?}", entry.format),
                _ => assert_eq!(entry.aspect, vk::ImageAspectFlags::COLOR),
            }
        }
    }

    #[test]
    fn chroma_planes_round_up() {
        let f = PixelFormat::Yuv420p;
        assert_eq!(
            f.plane_extent(1920, 1080, 0),
            vk::Extent2D { width: 1920, height: 1080 }
        );
        assert_eq!(
            f.plane_extent(1920, 1080, 1),
            vk::Extent2D { width: 960, height: 540 }
        );
        // Odd dimensions keep the trailing column/row.
        assert_eq!(
            f.plane_extent(1919, 1079, 2),
            vk::Extent2D { width: 960, height: 540 }
        );

        // 4:2:2 only subsamples horizontally.
        assert_eq!(
            PixelFormat::Nv16.plane_extent(1280, 720, 1),
            vk::Extent2D { width: 640, height: 720 }
        );
    }

    #[test]
    fn planar_rgb_planes_are_full_size() {
        let f = PixelFormat::Gbrap;
        for plane in 0..4 {
            assert_eq!(
                f.plane_extent(640, 480, plane),
                vk::Extent2D { width: 640, height: 480 }
            );
        }
    }

    #[test]
    fn row_bytes_covers_interleaved_chroma() {
        // NV12 chroma rows interleave U and V, half width but two bytes per step.
        assert_eq!(PixelFormat::Nv12.plane_row_bytes(1920, 0), 1920);
        assert_eq!(PixelFormat::Nv12.plane_row_bytes(1920, 1), 1920);
        assert_eq!(PixelFormat::P010.plane_row_bytes(1920, 1), 3840);
        assert_eq!(PixelFormat::Yuyv422.plane_row_bytes(1920, 0), 3840);
        assert_eq!(PixelFormat::Rgb48.plane_row_bytes(16, 0), 96);
    }
}
