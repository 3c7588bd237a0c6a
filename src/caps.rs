// This module handles flagging the available behaviors
// supported by the device. Things like dmabuf import, fence
// export, partial presentation, etc
//
// Austin Shafer - 2021
use ash::vk;
use bitflags::bitflags;
use std::ffi::CStr;
use utils::log;

bitflags! {
    /// The available device capabilities.
    ///
    /// Backends fill these in once at device creation. Most of them come
    /// from extension probing (see `from_device_extensions`), the texture
    /// format ones come from format feature queries.
    #[derive(Default)]
    pub struct Capabilities: u32 {
        /// The presentation engine reports how old a back buffer is
        const BUFFER_AGE = 1 << 0;
        /// Damage can be passed along with presentation
        const PARTIAL_UPDATE = 1 << 1;
        /// Fences can be exported and imported as sync files
        const NATIVE_FENCE = 1 << 2;
        /// Dmabufs can be imported as images
        const DMABUF_IMPORT = 1 << 3;
        /// Dmabuf imports may carry explicit drm format modifiers
        const DMABUF_MODIFIERS = 1 << 4;
        /// GPU timestamps can be queried and correlated with the cpu clock
        const TIMER_QUERY = 1 << 5;
        /// One and two channel textures (R8, RG88)
        const TEXTURE_RG = 1 << 6;
        /// 10 bit per channel packed textures
        const TEXTURE_2101010 = 1 << 7;
        /// 16 bit float per channel textures and render targets
        const TEXTURE_16BIT = 1 << 8;
        /// Read back can return rows bottom to top
        const PACK_REVERSE_ROW_ORDER = 1 << 9;
    }
}

/// Device extensions that map to the capability flags above
///
/// A capability is only reported if every extension in its list is
/// available.
fn extension_requirements() -> [(Capabilities, Vec<&'static CStr>); 5] {
    [
        (
            Capabilities::PARTIAL_UPDATE,
            vec![vk::KhrIncrementalPresentFn::name()],
        ),
        (
            Capabilities::NATIVE_FENCE,
            vec![
                vk::KhrExternalFenceFdFn::name(),
                vk::KhrExternalSemaphoreFdFn::name(),
            ],
        ),
        (
            Capabilities::DMABUF_IMPORT,
            vec![
                vk::KhrExternalMemoryFdFn::name(),
                vk::ExtExternalMemoryDmaBufFn::name(),
            ],
        ),
        (
            Capabilities::DMABUF_MODIFIERS,
            vec![
                vk::ExtExternalMemoryDmaBufFn::name(),
                vk::ExtImageDrmFormatModifierFn::name(),
            ],
        ),
        (
            Capabilities::TIMER_QUERY,
            vec![vk::ExtCalibratedTimestampsFn::name()],
        ),
    ]
}

fn contains_extensions(exts: &[&CStr], req: &[&CStr]) -> bool {
    req.iter().all(|r| exts.iter().any(|e| e == r))
}

impl Capabilities {
    /// Build the extension-driven part of the capabilities from the list
    /// of extensions the device advertises.
    pub fn from_device_extensions(exts: &[&CStr]) -> Self {
        let mut ret = Capabilities::empty();

        for (cap, req) in extension_requirements().iter() {
            match contains_extensions(exts, req.as_slice()) {
                true => ret |= *cap,
                false => log::debug!("This device does not support {:?}", cap),
            }
        }

        // Modifiers are meaningless without the import itself
        if !ret.contains(Capabilities::DMABUF_IMPORT) {
            ret.remove(Capabilities::DMABUF_MODIFIERS);
        }

        ret
    }

    /// Get the list of device extensions to enable for these capabilities
    pub fn get_device_extensions(&self) -> Vec<&'static CStr> {
        let mut ret: Vec<&'static CStr> = Vec::new();

        for (cap, req) in extension_requirements().iter() {
            if self.contains(*cap) {
                for e in req.iter() {
                    if !ret.contains(e) {
                        ret.push(e);
                    }
                }
            }
        }

        ret
    }

    /// Log the capabilities the renderer will have to live without
    pub fn log_missing(&self) {
        if !self.contains(Capabilities::BUFFER_AGE) {
            log::info!("No buffer age support, every frame will be a full repaint");
        }
        if !self.contains(Capabilities::NATIVE_FENCE) {
            log::info!("No native fence support, falling back to implicit sync");
        }
        if !self.contains(Capabilities::DMABUF_IMPORT) {
            log::error!("This device does not support dmabuf import");
        }
        if !self.contains(Capabilities::TEXTURE_RG) {
            log::info!("No RG texture support, YUV formats will not be offered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_map_to_caps() {
        let exts = [
            vk::KhrIncrementalPresentFn::name(),
            vk::KhrExternalMemoryFdFn::name(),
            vk::ExtExternalMemoryDmaBufFn::name(),
        ];
        let caps = Capabilities::from_device_extensions(&exts);

        assert!(caps.contains(Capabilities::PARTIAL_UPDATE));
        assert!(caps.contains(Capabilities::DMABUF_IMPORT));
        assert!(!caps.contains(Capabilities::DMABUF_MODIFIERS));
        assert!(!caps.contains(Capabilities::NATIVE_FENCE));
    }

    #[test]
    fn extension_list_has_no_duplicates() {
        let caps = Capabilities::DMABUF_IMPORT | Capabilities::DMABUF_MODIFIERS;
        let exts = caps.get_device_extensions();

        assert_eq!(exts.len(), 3);
        assert_eq!(
            Capabilities::from_device_extensions(exts.as_slice()),
            Capabilities::DMABUF_IMPORT | Capabilities::DMABUF_MODIFIERS
        );
    }
}
