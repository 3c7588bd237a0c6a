//! # The Squall compositing renderer.
//!
//! Squall is the GPU backend of a wayland compositor. The compositor
//! core hands it client buffers as they are committed and an ordered
//! list of views per output, and squall turns those into pixels on the
//! output's presentation target.
//!
//! The renderer never talks to a graphics API directly. Everything goes
//! through the `GpuDevice` trait, which the display backend implements.
//! `HeadlessDevice` is the backend used for headless outputs and the
//! test-suite; it records the command stream and simulates a single
//! serialized GPU timeline.
//!
//! ## Drawing API
//!
//! The general flow of a squall client is as follows:
//! * Create a `Renderer` from a device (`Renderer::new`)
//! * Create an output (`output_create`) from an `OutputOptions`
//! * When a client commits:
//!   * Attach its buffer to the surface (`attach`)
//!   * Hand over the commit damage (`flush_damage`)
//! * Build the list of visible `View`s for the output, front to back
//! * Repaint the output with the damage the core collected (`repaint_output`)
//! * Hand the release fences back to clients (`take_release_fence`)
//!
//! ```
//! use squall as sq;
//! use std::sync::Arc;
//!
//! let dev = Arc::new(sq::HeadlessDevice::new(sq::Capabilities::all()));
//! let mut rend = sq::Renderer::new(dev, &sq::CreateInfo::builder().build()).unwrap();
//! let mut output = rend
//!     .output_create(&sq::OutputOptions::new(64, 64))
//!     .unwrap();
//!
//! // A solid red 64x64 window
//! let buffer = sq::ClientBuffer::new_solid(1, [1.0, 0.0, 0.0, 1.0], 64, 64);
//! let surf = sq::SurfaceId(1);
//! rend.attach(surf, Some(&buffer), None).unwrap();
//!
//! let views = [sq::View::new(surf, 64, 64)];
//! let damage = sq::Region::from_rect(sq::Rect::new(0, 0, 64, 64));
//! rend.repaint_output(&mut output, &views, &damage).unwrap();
//! ```
//!
//! ## Requirements
//!
//! The device backend is expected to provide the following, the
//! renderer degrades gracefully without the optional ones:
//! * texture upload and sampling of 8-bit RGBA formats (required)
//! * VK_KHR_incremental_present for partial presentation
//! * VK_EXT_external_memory_dma_buf and VK_EXT_image_drm_format_modifier
//! * VK_KHR_external_fence_fd for explicit synchronization
//! * VK_EXT_calibrated_timestamps for render timing

// Austin Shafer - 2020

mod buffer;
mod capture;
mod caps;
mod config;
mod dmabuf;
mod format;
mod geometry;
mod gpu;
mod headless;
mod output;
mod renderer;
mod repaint;
mod surface;
mod sync;
mod timeline;
mod virtual_output;


pub use buffer::{
    BufferKind, BufferState, ClientBuffer, ClientHandle, ExternalBuffer, ExternalPlaneFormat,
    ShmBuffer, ShmPool,
};
pub use capture::{CaptureQueue, CaptureResult, CaptureSource, CaptureTask, OutputCaptureQueue};
pub use caps::Capabilities;
pub use config::{ContextPriority, CreateInfo, CreateInfoBuilder};
pub use dmabuf::{Dmabuf, DmabufFlags, DmabufImage, DmabufModifier, DmabufPlane};
pub use format::{PixelFormatDescriptor, PlaneDescriptor, YuvFormatDescriptor, YuvPlaneDescriptor};
pub use geometry::{View, ViewTransform};
pub use gpu::{
    DmabufImportDesc, DmabufPlaneDesc, GpuDevice, GpuImage, GpuTexture, ImageId, QueryId,
    RenderTarget, ShaderConfig, ShaderVariant, TargetId, TargetKind, TextureDesc, TextureId,
    TextureUpload, Vertex,
};
pub use headless::{GpuCommand, HeadlessDevice};
pub use output::{BorderSide, BorderStatus, OutputOptions, OutputState, BUFFER_DAMAGE_COUNT};
pub use renderer::{Renderer, RendererInterface};
pub use surface::{AttachState, SurfaceId, SurfaceState};
pub use sync::SyncFile;
pub use timeline::{TimelinePoint, TimelineRecord, TimelineSink, TracingTimeline};
pub use virtual_output::{FrameStatus, SubmitFn, VirtualOutput};

// Re-export some things from utils so clients
// can use them
extern crate utils;
pub use crate::utils::region::{Rect, Region};

pub use drm_fourcc::{DrmFourcc, DrmModifier};

use thiserror::Error;

/// Squall errors
#[derive(Error, Eq, PartialEq, Debug, Clone)]
#[allow(non_camel_case_types)]
pub enum SquallError {
    #[error("The GPU device reported an error")]
    DEVICE_ERROR,
    #[error("The GPU device ran out of memory")]
    OUT_OF_MEMORY,
    #[error("Could not find a render format supported by the device")]
    NO_SUITABLE_FORMAT,
    #[error("Output color transforms need a shadow buffer the device cannot provide")]
    SHADOW_UNSUPPORTED,
    #[error("Could not create the output")]
    OUTPUT_CREATION_FAILED,
    #[error("Could not make the output's target current")]
    MAKE_CURRENT_FAILED,
    #[error("Unsupported buffer type")]
    UNSUPPORTED_BUFFER,
    #[error("Unsupported shm buffer format")]
    UNSUPPORTED_SHM_FORMAT,
    #[error("Invalid dmabuf attributes")]
    INVALID_DMABUF,
    #[error("Could not import dmabuf")]
    DMABUF_IMPORT_FAILED,
    #[error("Could not import external buffer")]
    EXTERNAL_IMPORT_FAILED,
    #[error("The file descriptor is invalid")]
    INVALID_FD,
    #[error("Shader compilation failed")]
    SHADER_COMPILATION_FAILED,
    #[error("No free buffer available for this frame")]
    NO_FREE_BUFFER,
    #[error("Could not read back pixels")]
    READ_PIXELS_FAILED,
    #[error("Frame submission failed")]
    SUBMIT_FAILED,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("The renderer has already been destroyed")]
    RENDERER_DESTROYED,
}

pub type Result<T> = std::result::Result<T, SquallError>;
