// Pixel format tables
//
// These map the fourcc codes clients hand us to the texture
// formats and shader variants used to sample them.
//
// Austin Shafer - 2021
use ash::vk;
use drm_fourcc::DrmFourcc;

use crate::caps::Capabilities;
use crate::gpu::ShaderVariant;

/// How one texture of a shm format is laid out and sampled
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneDescriptor {
    /// The texture format this plane is uploaded as
    pub format: vk::Format,
    /// Size of one texel of `format` in bytes
    pub texel_size: u32,
    /// Horizontal subsampling
    pub hsub: u32,
    /// Vertical subsampling
    pub vsub: u32,
    /// Which plane of the client memory the texels live in. Some
    /// formats (YUYV) sample the same memory twice.
    pub memory_plane: usize,
}

/// A shm pixel format the renderer knows how to texture from
#[derive(Debug, PartialEq, Eq)]
pub struct PixelFormatDescriptor {
    pub fourcc: DrmFourcc,
    /// Bytes per pixel of the first memory plane. The client stride
    /// divided by this is the pitch in pixels.
    pub bpp: u32,
    /// Device capabilities needed to texture from this format
    pub requires: Capabilities,
    pub variant: ShaderVariant,
    pub planes: &'static [PlaneDescriptor],
}

const fn plane(format: vk::Format, texel_size: u32) -> PlaneDescriptor {
    PlaneDescriptor {
        format: format,
        texel_size: texel_size,
        hsub: 1,
        vsub: 1,
        memory_plane: 0,
    }
}

const fn subsampled_plane(
    format: vk::Format,
    texel_size: u32,
    hsub: u32,
    vsub: u32,
    memory_plane: usize,
) -> PlaneDescriptor {
    PlaneDescriptor {
        format: format,
        texel_size: texel_size,
        hsub: hsub,
        vsub: vsub,
        memory_plane: memory_plane,
    }
}

const BGRA8: &[PlaneDescriptor] = &[plane(vk::Format::B8G8R8A8_UNORM, 4)];
const RGBA8: &[PlaneDescriptor] = &[plane(vk::Format::R8G8B8A8_UNORM, 4)];
const RGB565: &[PlaneDescriptor] = &[plane(vk::Format::R5G6B5_UNORM_PACK16, 2)];
const ARGB2101010: &[PlaneDescriptor] = &[plane(vk::Format::A2R10G10B10_UNORM_PACK32, 4)];
const ABGR2101010: &[PlaneDescriptor] = &[plane(vk::Format::A2B10G10R10_UNORM_PACK32, 4)];
const RGBA16F: &[PlaneDescriptor] = &[plane(vk::Format::R16G16B16A16_SFLOAT, 8)];
const Y_U_V_420: &[PlaneDescriptor] = &[
    subsampled_plane(vk::Format::R8_UNORM, 1, 1, 1, 0),
    subsampled_plane(vk::Format::R8_UNORM, 1, 2, 2, 1),
    subsampled_plane(vk::Format::R8_UNORM, 1, 2, 2, 2),
];
const Y_U_V_444: &[PlaneDescriptor] = &[
    subsampled_plane(vk::Format::R8_UNORM, 1, 1, 1, 0),
    subsampled_plane(vk::Format::R8_UNORM, 1, 1, 1, 1),
    subsampled_plane(vk::Format::R8_UNORM, 1, 1, 1, 2),
];
const Y_UV_420: &[PlaneDescriptor] = &[
    subsampled_plane(vk::Format::R8_UNORM, 1, 1, 1, 0),
    subsampled_plane(vk::Format::R8G8_UNORM, 2, 2, 2, 1),
];
const Y_XUXV_422: &[PlaneDescriptor] = &[
    subsampled_plane(vk::Format::R8G8_UNORM, 2, 1, 1, 0),
    subsampled_plane(vk::Format::B8G8R8A8_UNORM, 4, 2, 1, 0),
];

static SHM_FORMATS: &[PixelFormatDescriptor] = &[
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Argb8888,
        bpp: 4,
        requires: Capabilities::empty(),
        variant: ShaderVariant::Rgba,
        planes: BGRA8,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Xrgb8888,
        bpp: 4,
        requires: Capabilities::empty(),
        variant: ShaderVariant::Rgbx,
        planes: BGRA8,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Abgr8888,
        bpp: 4,
        requires: Capabilities::empty(),
        variant: ShaderVariant::Rgba,
        planes: RGBA8,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Xbgr8888,
        bpp: 4,
        requires: Capabilities::empty(),
        variant: ShaderVariant::Rgbx,
        planes: RGBA8,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Rgb565,
        bpp: 2,
        requires: Capabilities::empty(),
        variant: ShaderVariant::Rgbx,
        planes: RGB565,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Argb2101010,
        bpp: 4,
        requires: Capabilities::TEXTURE_2101010,
        variant: ShaderVariant::Rgba,
        planes: ARGB2101010,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Xrgb2101010,
        bpp: 4,
        requires: Capabilities::TEXTURE_2101010,
        variant: ShaderVariant::Rgbx,
        planes: ARGB2101010,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Abgr2101010,
        bpp: 4,
        requires: Capabilities::TEXTURE_2101010,
        variant: ShaderVariant::Rgba,
        planes: ABGR2101010,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Xbgr2101010,
        bpp: 4,
        requires: Capabilities::TEXTURE_2101010,
        variant: ShaderVariant::Rgbx,
        planes: ABGR2101010,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Abgr16161616f,
        bpp: 8,
        requires: Capabilities::TEXTURE_16BIT,
        variant: ShaderVariant::Rgba,
        planes: RGBA16F,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Xbgr16161616f,
        bpp: 8,
        requires: Capabilities::TEXTURE_16BIT,
        variant: ShaderVariant::Rgbx,
        planes: RGBA16F,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Yuv420,
        bpp: 1,
        requires: Capabilities::TEXTURE_RG,
        variant: ShaderVariant::YUV,
        planes: Y_U_V_420,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Yuv444,
        bpp: 1,
        requires: Capabilities::TEXTURE_RG,
        variant: ShaderVariant::YUV,
        planes: Y_U_V_444,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Nv12,
        bpp: 1,
        requires: Capabilities::TEXTURE_RG,
        variant: ShaderVariant::YUv,
        planes: Y_UV_420,
    },
    PixelFormatDescriptor {
        fourcc: DrmFourcc::Yuyv,
        bpp: 2,
        requires: Capabilities::TEXTURE_RG,
        variant: ShaderVariant::YXuxv,
        planes: Y_XUXV_422,
    },
];

impl PixelFormatDescriptor {
    /// Find the descriptor for a shm format
    pub fn lookup(fourcc: DrmFourcc) -> Option<&'static PixelFormatDescriptor> {
        SHM_FORMATS.iter().find(|f| f.fourcc == fourcc)
    }

    /// All shm formats this set of capabilities can texture from
    pub fn supported_formats(caps: Capabilities) -> Vec<DrmFourcc> {
        SHM_FORMATS
            .iter()
            .filter(|f| f.is_supported(caps))
            .map(|f| f.fourcc)
            .collect()
    }

    pub fn is_supported(&self, caps: Capabilities) -> bool {
        caps.contains(self.requires)
    }

    /// Formats which are split over more than one texture. These can't be
    /// partially uploaded, since damage is tracked in pixels of the first
    /// plane.
    pub fn is_multi_plane(&self) -> bool {
        self.planes.len() > 1
    }

    /// The stride converted to a pitch in pixels
    pub fn pitch(&self, stride: u32) -> u32 {
        stride / self.bpp
    }

    /// Row length in texels of plane `index`
    pub fn row_length(&self, index: usize, stride: u32) -> u32 {
        self.pitch(stride) / self.planes[index].hsub
    }

    /// Size in texels of the texture backing plane `index`
    pub fn plane_extent(&self, index: usize, width: u32, height: u32) -> (u32, u32) {
        let p = &self.planes[index];
        (width / p.hsub, height / p.vsub)
    }

    /// Byte offsets of every texture plane from the start of the buffer
    ///
    /// Memory planes are packed back to back after the first one.
    /// Texture planes sampling an already placed memory plane share its
    /// offset.
    pub fn plane_offsets(&self, base: usize, stride: u32, height: u32) -> Vec<usize> {
        let mut ret: Vec<usize> = Vec::with_capacity(self.planes.len());

        for (i, p) in self.planes.iter().enumerate() {
            if i == 0 {
                ret.push(base);
                continue;
            }

            let prev = &self.planes[i - 1];
            if p.memory_plane == prev.memory_plane {
                ret.push(ret[i - 1]);
            } else {
                let row_bytes = self.row_length(i - 1, stride) * prev.texel_size;
                let rows = height / prev.vsub;
                ret.push(ret[i - 1] + (row_bytes * rows) as usize);
            }
        }

        ret
    }
}

/// One output plane of a YUV dmabuf import
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct YuvPlaneDescriptor {
    /// The format this plane is imported as
    pub format: DrmFourcc,
    /// The dmabuf plane the memory is taken from
    pub plane_index: usize,
    pub width_divisor: u32,
    pub height_divisor: u32,
}

/// How to split a YUV dmabuf into separately imported planes
#[derive(Debug, PartialEq, Eq)]
pub struct YuvFormatDescriptor {
    pub fourcc: DrmFourcc,
    /// Number of planes the client must supply
    pub input_planes: usize,
    pub variant: ShaderVariant,
    pub planes: &'static [YuvPlaneDescriptor],
}

const fn yuv_plane(
    format: DrmFourcc,
    plane_index: usize,
    width_divisor: u32,
    height_divisor: u32,
) -> YuvPlaneDescriptor {
    YuvPlaneDescriptor {
        format: format,
        plane_index: plane_index,
        width_divisor: width_divisor,
        height_divisor: height_divisor,
    }
}

static YUV_FORMATS: &[YuvFormatDescriptor] = &[
    YuvFormatDescriptor {
        fourcc: DrmFourcc::Yuyv,
        input_planes: 1,
        variant: ShaderVariant::YXuxv,
        planes: &[
            yuv_plane(DrmFourcc::Gr88, 0, 1, 1),
            yuv_plane(DrmFourcc::Argb8888, 0, 2, 1),
        ],
    },
    YuvFormatDescriptor {
        fourcc: DrmFourcc::Nv12,
        input_planes: 2,
        variant: ShaderVariant::YUv,
        planes: &[
            yuv_plane(DrmFourcc::R8, 0, 1, 1),
            yuv_plane(DrmFourcc::Gr88, 1, 2, 2),
        ],
    },
    YuvFormatDescriptor {
        fourcc: DrmFourcc::Yuv420,
        input_planes: 3,
        variant: ShaderVariant::YUV,
        planes: &[
            yuv_plane(DrmFourcc::R8, 0, 1, 1),
            yuv_plane(DrmFourcc::R8, 1, 2, 2),
            yuv_plane(DrmFourcc::R8, 2, 2, 2),
        ],
    },
    YuvFormatDescriptor {
        fourcc: DrmFourcc::Yuv444,
        input_planes: 3,
        variant: ShaderVariant::YUV,
        planes: &[
            yuv_plane(DrmFourcc::R8, 0, 1, 1),
            yuv_plane(DrmFourcc::R8, 1, 1, 1),
            yuv_plane(DrmFourcc::R8, 2, 1, 1),
        ],
    },
];

impl YuvFormatDescriptor {
    pub fn lookup(fourcc: DrmFourcc) -> Option<&'static YuvFormatDescriptor> {
        YUV_FORMATS.iter().find(|f| f.fourcc == fourcc)
    }

    pub fn all() -> &'static [YuvFormatDescriptor] {
        YUV_FORMATS
    }
}

/// The texture format to render into for an output pixel format
///
/// Only RGB formats can be rendered to.
pub fn render_format(fourcc: DrmFourcc) -> Option<(vk::Format, Capabilities)> {
    let desc = PixelFormatDescriptor::lookup(fourcc)?;
    if desc.is_multi_plane() || desc.fourcc == DrmFourcc::Rgb565 {
        return None;
    }

    Some((desc.planes[0].format, desc.requires))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xrgb_is_opaque() {
        let desc = PixelFormatDescriptor::lookup(DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(desc.variant, ShaderVariant::Rgbx);
        assert_eq!(desc.planes[0].format, vk::Format::B8G8R8A8_UNORM);
        assert!(desc.is_supported(Capabilities::empty()));
    }

    #[test]
    fn deep_formats_need_caps() {
        let desc = PixelFormatDescriptor::lookup(DrmFourcc::Abgr16161616f).unwrap();
        assert!(!desc.is_supported(Capabilities::TEXTURE_RG));
        assert!(desc.is_supported(Capabilities::TEXTURE_16BIT));

        let fmts = PixelFormatDescriptor::supported_formats(Capabilities::empty());
        assert!(fmts.contains(&DrmFourcc::Argb8888));
        assert!(!fmts.contains(&DrmFourcc::Nv12));
        assert!(!fmts.contains(&DrmFourcc::Xrgb2101010));
    }

    #[test]
    fn yuv420_plane_layout() {
        let desc = PixelFormatDescriptor::lookup(DrmFourcc::Yuv420).unwrap();
        // 64x32 with a padded stride of 80
        let offsets = desc.plane_offsets(16, 80, 32);
        assert_eq!(offsets, vec![16, 16 + 80 * 32, 16 + 80 * 32 + 40 * 16]);
        assert_eq!(desc.row_length(1, 80), 40);
        assert_eq!(desc.plane_extent(2, 64, 32), (32, 16));
    }

    #[test]
    fn nv12_plane_layout() {
        let desc = PixelFormatDescriptor::lookup(DrmFourcc::Nv12).unwrap();
        let offsets = desc.plane_offsets(0, 64, 32);
        assert_eq!(offsets, vec![0, 64 * 32]);
        // The interleaved chroma plane has as many bytes per row as luma
        assert_eq!(desc.row_length(1, 64) * desc.planes[1].texel_size, 64);
    }

    #[test]
    fn yuyv_samples_one_memory_plane_twice() {
        let desc = PixelFormatDescriptor::lookup(DrmFourcc::Yuyv).unwrap();
        assert_eq!(desc.plane_offsets(8, 128, 10), vec![8, 8]);
        assert_eq!(desc.row_length(0, 128), 64);
        assert_eq!(desc.row_length(1, 128), 32);
    }

    #[test]
    fn yuv_import_tables_match_variants() {
        for f in YuvFormatDescriptor::all() {
            assert_eq!(f.planes.len(), f.variant.plane_count());
            assert!(f.planes.iter().all(|p| p.plane_index < f.input_planes));
        }
        assert!(YuvFormatDescriptor::lookup(DrmFourcc::Argb8888).is_none());
    }

    #[test]
    fn render_formats() {
        assert_eq!(
            render_format(DrmFourcc::Xrgb8888),
            Some((vk::Format::B8G8R8A8_UNORM, Capabilities::empty()))
        );
        assert!(render_format(DrmFourcc::Nv12).is_none());
    }
}
