// swapframe - Vulkan presentation layer
//
// Swapchain lifecycle, render pass / framebuffer setup and device buffers
// on top of ash. See `backend::Presenter` for the renderer-facing side.

pub mod backend;
pub mod config;
pub mod events;
