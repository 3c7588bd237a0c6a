// Renderer creation parameters
//
// Austin Shafer - 2020
use ash::vk;
use serde::{Deserialize, Serialize};

/// Scheduling priority hint for the GPU context
///
/// This is only a hint. The device may grant a lower priority than
/// the one requested, usually because the process lacks the
/// privileges for it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPriority {
    Low,
    Medium,
    High,
    Realtime,
}

impl ContextPriority {
    pub fn as_vk(&self) -> vk::QueueGlobalPriorityEXT {
        match self {
            ContextPriority::Low => vk::QueueGlobalPriorityEXT::LOW,
            ContextPriority::Medium => vk::QueueGlobalPriorityEXT::MEDIUM,
            ContextPriority::High => vk::QueueGlobalPriorityEXT::HIGH,
            ContextPriority::Realtime => vk::QueueGlobalPriorityEXT::REALTIME,
        }
    }
}

impl Default for ContextPriority {
    fn default() -> Self {
        ContextPriority::Medium
    }
}

/// Parameters for Renderer creation.
///
/// This can be embedded in the compositor's configuration file, every
/// field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateInfo {
    /// The context priority to ask the device for
    pub context_priority: ContextPriority,
    /// Start with triangle fan debugging turned on
    pub fan_debug: bool,
    /// Always repaint the whole shadow buffer instead of only the damage
    pub force_full_shadow_redraw: bool,
    /// Ignore the device's partial update support
    pub disable_partial_update: bool,
    /// Ignore the device's buffer age support. Every frame will be a
    /// full repaint.
    pub disable_buffer_age: bool,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo::default(),
        }
    }
}

/// Implements the builder pattern for easier renderer creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn context_priority(mut self, prio: ContextPriority) -> Self {
        self.ci.context_priority = prio;
        self
    }

    pub fn fan_debug(mut self, enable: bool) -> Self {
        self.ci.fan_debug = enable;
        self
    }

    pub fn force_full_shadow_redraw(mut self, enable: bool) -> Self {
        self.ci.force_full_shadow_redraw = enable;
        self
    }

    pub fn disable_partial_update(mut self) -> Self {
        self.ci.disable_partial_update = true;
        self
    }

    pub fn disable_buffer_age(mut self) -> Self {
        self.ci.disable_buffer_age = true;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}
