// =============================================================================
// SWAPFRAME DEMO - Clears the window through the presentation layer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop                                               │
// │    └── EventQueue (resize / minimize / v-sync / close)          │
// │          └── Presenter (swapchain + render pass + framebuffers) │
// │                └── Command Buffers (one per frame in flight)    │
// │                      └── Synchronization (fences, semaphores)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Drain surface events, recreate if the surface changed
// 2. Wait for this slot's previous frame
// 3. Acquire swapchain image (Stale -> recreate and skip the frame)
// 4. Record a render pass that clears color and depth
// 5. Submit and present (Suboptimal / Stale -> recreate next frame)
//
// Keys: V toggles v-sync, F11 fullscreen, Escape quits.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ash::vk;
use swapframe::backend::sync::FrameSync;
use swapframe::backend::{AcquireStatus, GpuDevice, GpuError, PresentStatus, Presenter, VulkanDevice};
use swapframe::config::Config;
use swapframe::events::{EventQueue, SurfaceEvent};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting swapframe demo");
    log::info!(
        "Window: {}x{}, vsync {}, {}x MSAA",
        config.window.width,
        config.window.height,
        config.graphics.vsync,
        config.graphics.msaa_samples
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== swapframe log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Device loss anywhere in the error chain ends the demo. It may arrive as
/// our `GpuError` or as a raw `vk::Result` from submit / fence waits.
fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(cause.downcast_ref::<GpuError>(), Some(GpuError::DeviceLost))
            || cause.downcast_ref::<vk::Result>() == Some(&vk::Result::ERROR_DEVICE_LOST)
    })
}

fn drawable_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D { width: size.width, height: size.height }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct.
///
/// The presenter holds its own references to the device, so it is dropped
/// before the device in `Drop`.
struct App {
    config: Config,
    events: EventQueue,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    device: Option<Arc<VulkanDevice>>,
    presenter: Option<Presenter>,

    command_pool: Option<vk::CommandPool>,
    /// One command buffer per frame in flight, re-recorded every frame
    command_buffers: Vec<vk::CommandBuffer>,
    frame_sync: Vec<FrameSync>,
    current_frame: usize,
    wait_stages: [vk::PipelineStageFlags; 1],

    /// Acquire or present asked for a new swapchain
    needs_recreate: bool,
    /// Zero-sized window - skip rendering
    is_minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            events: EventQueue::new(),
            window: None,
            is_fullscreen: false,
            device: None,
            presenter: None,
            command_pool: None,
            command_buffers: Vec::new(),
            frame_sync: Vec::new(),
            current_frame: 0,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            needs_recreate: false,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, window)?;

        let presenter = Presenter::new(
            device.clone(),
            device.surface(),
            drawable_extent(window),
            self.config.presentation(),
        )
        .context("Failed to set up presentation")?;

        // Stored first so `Drop` releases whatever gets created below, even on error
        self.presenter = Some(presenter);
        self.device = Some(device.clone());

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;
        self.command_pool = Some(command_pool);

        let frames_in_flight = self.config.graphics.max_frames_in_flight.max(1);
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        self.command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }?;
        self.frame_sync = FrameSync::create_frames(&device, frames_in_flight)?;

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // SURFACE CHANGES
    // =========================================================================

    fn apply_surface_events(&mut self, event_loop: &ActiveEventLoop) {
        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };

        let changes = self.events.drain(presenter.config().vsync);
        if changes.close {
            log::info!("Close requested, shutting down...");
            event_loop.exit();
            return;
        }
        if let Some(vsync) = changes.vsync {
            presenter.set_vsync(vsync);
            log::info!("V-sync {}", if vsync { "on" } else { "off" });
        }
        if changes.resize.is_some() {
            self.is_minimized = false;
        }
        if changes.minimized {
            self.is_minimized = true;
        }
        if changes.needs_recreate() {
            self.needs_recreate = true;
        }
    }

    /// Caller-side recreation: wait for the GPU, then rebuild for the
    /// current drawable size.
    fn recreate(&mut self) -> Result<()> {
        let (Some(window), Some(device), Some(presenter)) =
            (self.window.as_ref(), self.device.as_ref(), self.presenter.as_mut())
        else {
            return Ok(());
        };

        let extent = drawable_extent(window);
        if extent.width == 0 || extent.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }

        device.wait_idle()?;
        match presenter.recreate(extent) {
            Ok(render_pass_rebuilt) => {
                if render_pass_rebuilt {
                    log::info!("Render pass rebuilt for {:?}", presenter.swapchain().format());
                }
                self.needs_recreate = false;
            }
            Err(GpuError::ZeroExtent) => self.is_minimized = true,
            Err(e) => return Err(e).context("Failed to recreate swapchain"),
        }
        Ok(())
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn record_commands(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        presenter: &Presenter,
        framebuffer: vk::Framebuffer,
    ) -> Result<()> {
        let clear_values = presenter.clear_values(self.config.graphics.clear_color);
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(presenter.render_pass().handle())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: presenter.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;

            // The render pass clears; resolving / the final layout transition
            // to PRESENT_SRC happen at its end
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(cmd);

            device.end_command_buffer(cmd)?;
        }
        Ok(())
    }

    /// Returns whether a frame was presented.
    fn render_frame(&mut self) -> Result<bool> {
        if self.needs_recreate && !self.is_minimized {
            self.recreate()?;
        }
        if self.is_minimized {
            return Ok(false);
        }

        let device = self.device.as_ref().context("Device not initialized")?;
        let presenter = self.presenter.as_ref().context("Presenter not initialized")?;
        let sync = &self.frame_sync[self.current_frame];

        // Wait for the previous frame that used this slot
        sync.wait(device)?;

        let frame = match presenter.acquire_next_image(self.config.acquire_timeout_ns(), sync.image_available)? {
            AcquireStatus::Ready(frame) => frame,
            AcquireStatus::Suboptimal(frame) => {
                self.needs_recreate = true;
                frame
            }
            AcquireStatus::Stale => {
                self.needs_recreate = true;
                return Ok(false);
            }
            AcquireStatus::Timeout => {
                log::warn!("Timed out waiting for a swapchain image");
                return Ok(false);
            }
        };

        let cmd = self.command_buffers[self.current_frame];
        self.record_commands(&device.device, cmd, presenter, presenter.framebuffer(frame)?)?;

        // Only reset once we know work will be submitted
        sync.reset(device)?;

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&self.wait_stages) // Which stage waits
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], sync.in_flight_fence)
        }
        .context("Failed to submit frame")?;

        match presenter.present(device.present_queue, frame, Some(sync.render_finished)) {
            Ok(PresentStatus::Presented) => {}
            Ok(PresentStatus::Suboptimal) => self.needs_recreate = true,
            Err(e) if e.is_recoverable() => self.needs_recreate = true,
            Err(e) => return Err(e).context("Failed to present"),
        }

        self.current_frame = (self.current_frame + 1) % self.frame_sync.len();
        Ok(true)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows triggers the recreate
        }
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let (Some(window), Some(presenter)) = (self.window.as_ref(), self.presenter.as_ref()) {
                window.set_title(&format!(
                    "{} - {:.0} FPS [{:?}, gen {}]",
                    self.config.window.title,
                    fps,
                    presenter.swapchain().present_mode(),
                    presenter.generation()
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if let Err(e) = device.wait_idle() {
            log::warn!("wait_idle failed during shutdown: {}", e);
        }

        for sync in self.frame_sync.drain(..) {
            sync.destroy(&device.device);
        }
        if let Some(pool) = self.command_pool.take() {
            unsafe { device.device.destroy_command_pool(pool, None) };
        }

        // Everything holding a device reference goes before the device
        self.presenter = None;
        drop(device);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => self.events.push(SurfaceEvent::CloseRequested),

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.events.push(SurfaceEvent::Resized(vk::Extent2D {
                    width: size.width,
                    height: size.height,
                }));
            }

            WindowEvent::RedrawRequested => {
                self.apply_surface_events(event_loop);
                match self.render_frame() {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("Render error: {:?}", e);
                        if is_fatal(&e) {
                            event_loop.exit();
                        }
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => self.events.push(SurfaceEvent::CloseRequested),
                            KeyCode::KeyV => self.events.push(SurfaceEvent::ToggleVsync),
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        // Close can arrive while minimized, when no redraws happen
        if self.is_minimized {
            self.apply_surface_events(event_loop);
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
