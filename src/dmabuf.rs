// Dmabuf import
//
// Dmabufs are first imported as a single image. If the device can't
// do that and the format is YUV, every plane is imported separately
// and converted in the shader.
//
// Austin Shafer - 2021
use bitflags::bitflags;
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::caps::Capabilities;
use crate::format::{PixelFormatDescriptor, YuvFormatDescriptor};
use crate::gpu::{DmabufImportDesc, DmabufPlaneDesc, GpuDevice, GpuImage, ShaderVariant};
use crate::{Result, SquallError};
use utils::log;

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

pub type DmabufModifier = DrmModifier;

bitflags! {
    /// Flags clients may set on dmabufs
    pub struct DmabufFlags: u32 {
        /// The contents are stored bottom row first
        const Y_INVERT = 1 << 0;
        const INTERLACED = 1 << 1;
        const BOTTOM_FIRST = 1 << 2;
    }
}

/// Flags we know how to honor
const SUPPORTED_FLAGS: u32 = DmabufFlags::Y_INVERT.bits();

/// A single dmabuf plane
#[derive(Debug)]
pub struct DmabufPlane {
    pub db_fd: OwnedFd,
    pub db_plane_idx: u32,
    pub db_offset: u32,
    pub db_stride: u32,
    pub db_mods: u64,
}

impl DmabufPlane {
    pub fn new(fd: OwnedFd, plane: u32, offset: u32, stride: u32, mods: u64) -> Self {
        Self {
            db_fd: fd,
            db_plane_idx: plane,
            db_offset: offset,
            db_stride: stride,
            db_mods: mods,
        }
    }
}

/// The attributes of a client dmabuf
#[derive(Debug)]
pub struct Dmabuf {
    pub db_width: i32,
    pub db_height: i32,
    pub db_fourcc: DrmFourcc,
    /// Raw flags as sent by the client
    pub db_flags: u32,
    /// Content for a protected display path. These are never imported.
    pub db_direct_display: bool,

    /// The individual plane specifications
    pub db_planes: Vec<DmabufPlane>,
}

impl Dmabuf {
    pub fn new(width: i32, height: i32, fourcc: DrmFourcc) -> Self {
        Self {
            db_width: width,
            db_height: height,
            db_fourcc: fourcc,
            db_flags: 0,
            db_direct_display: false,
            db_planes: Vec::with_capacity(1),
        }
    }

    /// The format modifier shared by all planes
    pub fn modifier(&self) -> DmabufModifier {
        match self.db_planes.first() {
            Some(p) => DrmModifier::from(p.db_mods),
            None => DrmModifier::Invalid,
        }
    }

    pub fn flags(&self) -> DmabufFlags {
        DmabufFlags::from_bits_truncate(self.db_flags)
    }

    pub fn is_y_inverted(&self) -> bool {
        self.flags().contains(DmabufFlags::Y_INVERT)
    }
}

/// The images a dmabuf was imported as
///
/// This belongs to the client buffer, so that the import is shared by
/// every surface the buffer is attached to.
pub struct DmabufImage {
    di_fourcc: DrmFourcc,
    di_variant: ShaderVariant,
    di_images: Vec<GpuImage>,
}

impl DmabufImage {
    pub fn fourcc(&self) -> DrmFourcc {
        self.di_fourcc
    }

    pub fn variant(&self) -> ShaderVariant {
        self.di_variant
    }

    pub fn image_count(&self) -> usize {
        self.di_images.len()
    }

    pub fn images(&self) -> &[GpuImage] {
        self.di_images.as_slice()
    }
}

impl std::fmt::Debug for DmabufImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmabufImage")
            .field("fourcc", &self.di_fourcc)
            .field("variant", &self.di_variant)
            .field("images", &self.di_images)
            .finish()
    }
}

/// Check that the device can handle this modifier at all
fn check_modifier(caps: Capabilities, modifier: DrmModifier) -> Result<()> {
    if modifier != DrmModifier::Invalid && !caps.contains(Capabilities::DMABUF_MODIFIERS) {
        log::debug!(
            "Dmabuf modifier {:?} requested without modifier support",
            modifier
        );
        return Err(SquallError::DMABUF_IMPORT_FAILED);
    }
    Ok(())
}

/// Import every plane as one image
fn import_simple(
    dev: &Arc<dyn GpuDevice>,
    caps: Capabilities,
    dmabuf: &Dmabuf,
) -> Result<DmabufImage> {
    let modifier = dmabuf.modifier();
    check_modifier(caps, modifier)?;

    let desc = DmabufImportDesc {
        fourcc: dmabuf.db_fourcc,
        width: dmabuf.db_width as u32,
        height: dmabuf.db_height as u32,
        modifier: modifier,
        planes: dmabuf
            .db_planes
            .iter()
            .map(|p| DmabufPlaneDesc {
                fd: p.db_fd.as_fd(),
                offset: p.db_offset,
                stride: p.db_stride,
            })
            .collect(),
    };
    let image = GpuImage::import_dmabuf(dev, &desc)?;

    let opaque = PixelFormatDescriptor::lookup(dmabuf.db_fourcc)
        .map(|d| d.variant == ShaderVariant::Rgbx)
        .unwrap_or(false);
    let variant = match (image.is_external_only(), opaque) {
        (true, _) => ShaderVariant::External,
        (false, true) => ShaderVariant::Rgbx,
        (false, false) => ShaderVariant::Rgba,
    };

    Ok(DmabufImage {
        di_fourcc: dmabuf.db_fourcc,
        di_variant: variant,
        di_images: vec![image],
    })
}

/// Import each plane of a YUV dmabuf separately
///
/// If any plane fails the ones already imported are dropped with it.
fn import_yuv(
    dev: &Arc<dyn GpuDevice>,
    caps: Capabilities,
    dmabuf: &Dmabuf,
) -> Result<DmabufImage> {
    let yuv = YuvFormatDescriptor::lookup(dmabuf.db_fourcc).ok_or_else(|| {
        log::debug!("{:?} is not a YUV format we can split", dmabuf.db_fourcc);
        SquallError::DMABUF_IMPORT_FAILED
    })?;

    if dmabuf.db_planes.len() != yuv.input_planes {
        log::error!(
            "{:?} dmabuf has {} planes, expected {}",
            dmabuf.db_fourcc,
            dmabuf.db_planes.len(),
            yuv.input_planes
        );
        return Err(SquallError::DMABUF_IMPORT_FAILED);
    }

    let modifier = dmabuf.modifier();
    let mut images = Vec::with_capacity(yuv.planes.len());
    for plane in yuv.planes.iter() {
        check_modifier(caps, modifier)?;
        let src = &dmabuf.db_planes[plane.plane_index];

        let desc = DmabufImportDesc {
            fourcc: plane.format,
            width: dmabuf.db_width as u32 / plane.width_divisor,
            height: dmabuf.db_height as u32 / plane.height_divisor,
            modifier: modifier,
            planes: vec![DmabufPlaneDesc {
                fd: src.db_fd.as_fd(),
                offset: src.db_offset,
                stride: src.db_stride,
            }],
        };

        images.push(GpuImage::import_dmabuf(dev, &desc)?);
    }

    Ok(DmabufImage {
        di_fourcc: dmabuf.db_fourcc,
        di_variant: yuv.variant,
        di_images: images,
    })
}

/// Import a client dmabuf
pub(crate) fn import_dmabuf(
    dev: &Arc<dyn GpuDevice>,
    caps: Capabilities,
    dmabuf: &Dmabuf,
) -> Result<DmabufImage> {
    if !caps.contains(Capabilities::DMABUF_IMPORT) {
        return Err(SquallError::DMABUF_IMPORT_FAILED);
    }
    if dmabuf.db_flags & !SUPPORTED_FLAGS != 0 {
        log::error!("Unsupported dmabuf flags {:#x}", dmabuf.db_flags);
        return Err(SquallError::INVALID_DMABUF);
    }
    if dmabuf.db_planes.is_empty()
        || dmabuf.db_planes.len() > 4
        || dmabuf.db_width <= 0
        || dmabuf.db_height <= 0
    {
        return Err(SquallError::INVALID_DMABUF);
    }
    // All planes of a buffer share one layout
    let mods = dmabuf.db_planes[0].db_mods;
    if dmabuf.db_planes.iter().any(|p| p.db_mods != mods) {
        log::error!("Dmabuf planes have mismatching modifiers");
        return Err(SquallError::INVALID_DMABUF);
    }

    match import_simple(dev, caps, dmabuf) {
        Ok(image) => return Ok(image),
        Err(e) => log::debug!("Simple dmabuf import failed ({}), trying YUV", e),
    }

    let ret = import_yuv(dev, caps, dmabuf);
    if let Err(e) = ret.as_ref() {
        log::error!("Could not import {:?} dmabuf: {}", dmabuf.db_fourcc, e);
    }
    ret
}

/// Cache of the dmabuf formats and modifiers the device supports
#[derive(Debug, Default)]
pub(crate) struct DmabufFormatCache {
    dc_formats: Option<Vec<DrmFourcc>>,
    dc_modifiers: HashMap<DrmFourcc, Vec<DrmModifier>>,
}

impl DmabufFormatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn formats(&mut self, dev: &dyn GpuDevice, caps: Capabilities) -> Vec<DrmFourcc> {
        if let Some(formats) = self.dc_formats.as_ref() {
            return formats.clone();
        }

        let formats = match caps.contains(Capabilities::DMABUF_IMPORT) {
            false => Vec::new(),
            true => match dev.query_dmabuf_formats() {
                Some(f) => f,
                None => {
                    log::debug!("Could not query dmabuf formats, using the fallback list");
                    let mut ret = vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888];
                    if caps.contains(Capabilities::TEXTURE_RG) {
                        ret.extend_from_slice(&[
                            DrmFourcc::Yuv420,
                            DrmFourcc::Nv12,
                            DrmFourcc::Yuyv,
                            DrmFourcc::Yuv444,
                        ]);
                    }
                    ret
                }
            },
        };

        self.dc_formats = Some(formats.clone());
        formats
    }

    pub fn modifiers(
        &mut self,
        dev: &dyn GpuDevice,
        caps: Capabilities,
        fourcc: DrmFourcc,
    ) -> Vec<DrmModifier> {
        if !caps.contains(Capabilities::DMABUF_MODIFIERS) {
            return Vec::new();
        }

        self.dc_modifiers
            .entry(fourcc)
            .or_insert_with(|| dev.query_dmabuf_modifiers(fourcc))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn plane(idx: u32, mods: u64) -> DmabufPlane {
        let (rx, _tx) = nix::unistd::pipe().unwrap();
        DmabufPlane::new(rx, idx, 0, 256, mods)
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let hdev = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let dev: Arc<dyn GpuDevice> = hdev.clone();
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Argb8888);
        dmabuf.db_planes.push(plane(0, u64::from(DrmModifier::Invalid)));
        dmabuf.db_flags = (DmabufFlags::Y_INVERT | DmabufFlags::INTERLACED).bits();

        assert_eq!(
            import_dmabuf(&dev, Capabilities::all(), &dmabuf).err(),
            Some(SquallError::INVALID_DMABUF)
        );
        assert_eq!(hdev.live_object_count(), 0);
    }

    #[test]
    fn planes_must_share_a_modifier() {
        let hdev = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let dev: Arc<dyn GpuDevice> = hdev.clone();
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Nv12);
        dmabuf.db_planes.push(plane(0, u64::from(DrmModifier::Linear)));
        dmabuf.db_planes.push(plane(1, u64::from(DrmModifier::Invalid)));

        assert_eq!(
            import_dmabuf(&dev, Capabilities::all(), &dmabuf).err(),
            Some(SquallError::INVALID_DMABUF)
        );
        assert_eq!(hdev.live_object_count(), 0);
    }

    #[test]
    fn rgb_imports_as_one_image() {
        let dev: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Xrgb8888);
        dmabuf.db_planes.push(plane(0, u64::from(DrmModifier::Linear)));

        let image = import_dmabuf(&dev, Capabilities::all(), &dmabuf).unwrap();
        assert_eq!(image.image_count(), 1);
        assert_eq!(image.variant(), ShaderVariant::Rgbx);
    }

    #[test]
    fn nv12_falls_back_to_planes() {
        let dev: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Nv12);
        dmabuf.db_planes.push(plane(0, u64::from(DrmModifier::Invalid)));
        dmabuf.db_planes.push(plane(1, u64::from(DrmModifier::Invalid)));

        let image = import_dmabuf(&dev, Capabilities::all(), &dmabuf).unwrap();
        assert_eq!(image.variant(), ShaderVariant::YUv);
        assert_eq!(image.image_count(), 2);
    }

    #[test]
    fn yuv_plane_count_must_match() {
        let dev: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Yuv420);
        dmabuf.db_planes.push(plane(0, u64::from(DrmModifier::Invalid)));

        assert!(import_dmabuf(&dev, Capabilities::all(), &dmabuf).is_err());
    }

    #[test]
    fn partial_yuv_import_is_rolled_back() {
        let hdev = Arc::new(HeadlessDevice::new(Capabilities::all()));
        let dev: Arc<dyn GpuDevice> = hdev.clone();
        let mut dmabuf = Dmabuf::new(64, 64, DrmFourcc::Yuv420);
        for i in 0..3 {
            dmabuf.db_planes.push(plane(i, u64::from(DrmModifier::Invalid)));
        }

        // The second plane fails
        hdev.limit_dmabuf_imports(Some(1));
        assert!(import_dmabuf(&dev, Capabilities::all(), &dmabuf).is_err());
        assert_eq!(hdev.live_object_count(), 0);
    }

    #[test]
    fn format_query_fallback() {
        let hdev = HeadlessDevice::new(Capabilities::DMABUF_IMPORT);
        hdev.set_dmabuf_formats(None);
        let mut cache = DmabufFormatCache::new();

        let formats = cache.formats(&hdev, Capabilities::DMABUF_IMPORT);
        assert_eq!(formats, vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888]);

        let caps = Capabilities::DMABUF_IMPORT | Capabilities::TEXTURE_RG;
        let mut cache = DmabufFormatCache::new();
        assert!(cache.formats(&hdev, caps).contains(&DrmFourcc::Nv12));
        assert!(cache
            .modifiers(&hdev, caps, DrmFourcc::Nv12)
            .is_empty());
    }
}
