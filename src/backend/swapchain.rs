// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Every (re)creation bumps the generation; frames handed out by acquire carry
// it, and anything indexed by a retired generation is rejected.

use std::sync::Arc;

use ash::vk;
use super::error::{GpuError, Result};
use super::gpu::GpuDevice;
use super::resource_table::{FrameIndex, GenerationTable};
use super::surface::PresentationCapabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub vsync: bool,
    /// Used when the surface supports it, see `choose_surface_format`.
    pub preferred_format: Option<vk::Format>,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self { vsync: true, preferred_format: None }
    }
}

/// A presentable image and the view we created for it. The image itself is
/// owned by the swapchain, only the view is ours to destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready(FrameIndex),
    /// Usable, but the surface changed; recreate after presenting.
    Suboptimal(FrameIndex),
    /// The surface no longer matches; recreate before rendering.
    Stale,
    /// No image became available before the timeout. Retry.
    Timeout,
}

impl AcquireStatus {
    pub fn frame(&self) -> Option<FrameIndex> {
        match *self {
            AcquireStatus::Ready(frame) | AcquireStatus::Suboptimal(frame) => Some(frame),
            AcquireStatus::Stale | AcquireStatus::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
}

struct Chain {
    handle: vk::SwapchainKHR,
    images: GenerationTable<SwapchainImage>,
}

pub struct Swapchain {
    device: Arc<dyn GpuDevice>,
    surface: vk::SurfaceKHR,
    config: SwapchainConfig,
    chain: Option<Chain>,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    generation: u64,
}

impl Swapchain {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        surface: vk::SurfaceKHR,
        requested_extent: vk::Extent2D,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let capabilities = PresentationCapabilities::query(&*device, surface)?;
        Self::create(device, surface, &capabilities, requested_extent, config)
    }

    /// Create generation 0 from already-queried capabilities.
    pub fn create(
        device: Arc<dyn GpuDevice>,
        surface: vk::SurfaceKHR,
        capabilities: &PresentationCapabilities,
        requested_extent: vk::Extent2D,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let built = build_chain(
            &*device,
            surface,
            capabilities,
            requested_extent,
            &config,
            vk::SwapchainKHR::null(),
            0,
        )?;

        Ok(Self {
            device,
            surface,
            config,
            chain: Some(built.chain),
            surface_format: built.surface_format,
            present_mode: built.present_mode,
            extent: built.extent,
            generation: 0,
        })
    }

    /// Replace the chain with a new generation.
    ///
    /// The new swapchain is created with the current one as `old_swapchain`
    /// and only then are the old views and handle destroyed. If creation fails
    /// nothing of ours is destroyed and the generation stays put.
    ///
    /// The caller must make sure no GPU work still uses the old images.
    pub fn recreate(&mut self, requested_extent: vk::Extent2D) -> Result<()> {
        let capabilities = PresentationCapabilities::query(&*self.device, self.surface)?;
        self.recreate_with(&capabilities, requested_extent)
    }

    /// `recreate` from already-queried capabilities.
    pub fn recreate_with(
        &mut self,
        capabilities: &PresentationCapabilities,
        requested_extent: vk::Extent2D,
    ) -> Result<()> {
        let old_handle = self
            .chain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |chain| chain.handle);
        let next_generation = self.generation + 1;

        let built = build_chain(
            &*self.device,
            self.surface,
            capabilities,
            requested_extent,
            &self.config,
            old_handle,
            next_generation,
        )?;

        if let Some(old) = self.chain.take() {
            self.destroy_chain(old);
        }

        self.chain = Some(built.chain);
        self.surface_format = built.surface_format;
        self.present_mode = built.present_mode;
        self.extent = built.extent;
        self.generation = next_generation;

        log::info!(
            "Recreated swapchain: generation {}, {}x{}",
            self.generation,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Takes effect on the next `recreate`.
    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.vsync = vsync;
    }

    /// Acquire next image for rendering. Blocks up to `timeout` nanoseconds.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<AcquireStatus> {
        let Some(chain) = self.chain.as_ref() else {
            return Ok(AcquireStatus::Stale);
        };

        match self.device.acquire_next_image(chain.handle, timeout, semaphore) {
            Ok((index, suboptimal)) => {
                let frame = chain.images.frame(index)?;
                Ok(if suboptimal {
                    AcquireStatus::Suboptimal(frame)
                } else {
                    AcquireStatus::Ready(frame)
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::Stale),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireStatus::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Present rendered image to screen.
    ///
    /// Fails with `Stale` when the surface is out of date; recreate and retry
    /// the frame.
    pub fn present(
        &self,
        queue: vk::Queue,
        frame: FrameIndex,
        wait_semaphore: Option<vk::Semaphore>,
    ) -> Result<PresentStatus> {
        let chain = self.chain.as_ref().ok_or(GpuError::Stale)?;
        chain.images.get(frame)?;

        let wait_semaphores: &[vk::Semaphore] = match wait_semaphore.as_ref() {
            Some(semaphore) => std::slice::from_ref(semaphore),
            None => &[],
        };

        match self.device.queue_present(queue, chain.handle, frame.index, wait_semaphores) {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::Stale),
            Err(e) => Err(e.into()),
        }
    }

    /// Release image views, then the swapchain handle. Safe to call twice.
    pub fn destroy(&mut self) {
        if let Some(chain) = self.chain.take() {
            self.destroy_chain(chain);
            log::debug!("Destroyed swapchain generation {}", self.generation);
        }
    }

    fn destroy_chain(&self, mut chain: Chain) {
        for image in chain.images.drain() {
            self.device.destroy_image_view(image.view);
        }
        self.device.destroy_swapchain(chain.handle);
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.chain.as_ref().map_or(vk::SwapchainKHR::null(), |chain| chain.handle)
    }

    pub fn is_destroyed(&self) -> bool {
        self.chain.is_none()
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn config(&self) -> SwapchainConfig {
        self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.chain.as_ref().map_or(0, |chain| chain.images.len())
    }

    pub fn images(&self) -> Vec<SwapchainImage> {
        self.chain
            .as_ref()
            .map(|chain| chain.images.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn image_views(&self) -> Vec<vk::ImageView> {
        self.images().into_iter().map(|image| image.view).collect()
    }

    /// Frame handle for slot `index` of the current generation.
    pub fn frame(&self, index: u32) -> Result<FrameIndex> {
        self.chain.as_ref().ok_or(GpuError::Stale)?.images.frame(index)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct BuiltChain {
    chain: Chain,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

fn build_chain(
    device: &dyn GpuDevice,
    surface: vk::SurfaceKHR,
    capabilities: &PresentationCapabilities,
    requested_extent: vk::Extent2D,
    config: &SwapchainConfig,
    old_swapchain: vk::SwapchainKHR,
    generation: u64,
) -> Result<BuiltChain> {
    let extent = capabilities.extent(requested_extent);
    if extent.width == 0 || extent.height == 0 {
        return Err(GpuError::ZeroExtent);
    }

    let surface_format = capabilities.surface_format(config.preferred_format);
    let present_mode = capabilities.present_mode(config.vsync);
    let image_count = capabilities.image_count();
    let families = device.queue_families().unique();

    let mut create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(capabilities.composite_alpha())
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    // Images are touched by more than one queue family: share them
    create_info = if families.len() > 1 {
        create_info
            .image_sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(&families)
    } else {
        create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
    };

    let handle = device.create_swapchain(&create_info)?;

    let images = match device.swapchain_images(handle) {
        Ok(images) => images,
        Err(e) => {
            device.destroy_swapchain(handle);
            return Err(e);
        }
    };

    let views = match create_views(device, &images, surface_format.format) {
        Ok(views) => views,
        Err(e) => {
            device.destroy_swapchain(handle);
            return Err(e);
        }
    };

    let mut table = GenerationTable::new();
    table.install(
        generation,
        images
            .iter()
            .zip(views)
            .map(|(&image, view)| SwapchainImage { image, view })
            .collect(),
    )?;

    log::info!(
        "Created swapchain: {}x{}, {} images, {:?}, {:?}",
        extent.width,
        extent.height,
        table.len(),
        surface_format.format,
        present_mode
    );

    Ok(BuiltChain {
        chain: Chain { handle, images: table },
        surface_format,
        present_mode,
        extent,
    })
}

/// One view per image. On failure the views created so far are destroyed.
fn create_views(device: &dyn GpuDevice, images: &[vk::Image], format: vk::Format) -> Result<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match device.create_image_view(&create_info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    device.destroy_image_view(view);
                }
                return Err(e);
            }
        }
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::QueueFamilyIndices;
    use crate::backend::testing::{Call, FakeDevice, Kind};
    use ash::vk::Handle;

    const REQUESTED: vk::Extent2D = vk::Extent2D { width: 1280, height: 720 };

    fn swapchain(fake: &Arc<FakeDevice>) -> Swapchain {
        Swapchain::new(fake.clone(), FakeDevice::surface(), REQUESTED, SwapchainConfig::default()).unwrap()
    }

    #[test]
    fn create_uses_one_more_than_minimum() {
        let fake = Arc::new(FakeDevice::new());
        let chain = swapchain(&fake);

        let record = &fake.swapchains()[0];
        assert_eq!(record.min_image_count, 3);
        assert_eq!(record.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert_eq!(record.old_swapchain, 0);
        assert_eq!(record.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.images().len(), chain.image_views().len());
        assert_eq!(chain.extent(), vk::Extent2D { width: 800, height: 600 });
        assert_eq!(chain.generation(), 0);
    }

    #[test]
    fn distinct_families_share_concurrently() {
        let fake = Arc::new(FakeDevice::new());
        fake.set_queue_families(QueueFamilyIndices { graphics: 0, compute: 2, present: 1 });
        let _chain = swapchain(&fake);

        let record = &fake.swapchains()[0];
        assert_eq!(record.sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(record.queue_family_count, 3);
    }

    #[test]
    fn vsync_off_prefers_mailbox() {
        let fake = Arc::new(FakeDevice::new());
        let config = SwapchainConfig { vsync: false, preferred_format: None };
        let chain = Swapchain::new(fake.clone(), FakeDevice::surface(), REQUESTED, config).unwrap();
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn recreate_builds_new_chain_before_retiring_old() {
        let fake = Arc::new(FakeDevice::new());
        let mut chain = swapchain(&fake);
        let old_handle = chain.handle().as_raw();
        let old_views: Vec<u64> = chain.image_views().iter().map(|v| v.as_raw()).collect();

        chain.recreate(REQUESTED).unwrap();
        let new_handle = chain.handle().as_raw();

        let records = fake.swapchains();
        assert_eq!(records[1].old_swapchain, old_handle);

        let created = fake.position(Call::Create(Kind::Swapchain, new_handle));
        for view in &old_views {
            assert!(created < fake.position(Call::Destroy(Kind::ImageView, *view)));
        }
        let last_view = old_views
            .iter()
            .map(|v| fake.position(Call::Destroy(Kind::ImageView, *v)))
            .max()
            .unwrap();
        assert!(last_view < fake.position(Call::Destroy(Kind::Swapchain, old_handle)));

        assert_eq!(chain.generation(), 1);
        assert_eq!(fake.live_count(Kind::Swapchain), 1);
        assert_eq!(fake.live_count(Kind::ImageView), chain.image_count());
    }

    #[test]
    fn failed_recreate_keeps_old_generation() {
        let fake = Arc::new(FakeDevice::new());
        let mut chain = swapchain(&fake);
        let views = chain.image_views();

        fake.fail_next_swapchain(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(chain.recreate(REQUESTED), Err(GpuError::AllocationFailure(_))));

        assert_eq!(chain.generation(), 0);
        assert_eq!(chain.image_views(), views);
        assert_eq!(fake.destroy_count(Kind::ImageView), 0);
        assert_eq!(fake.destroy_count(Kind::Swapchain), 0);
    }

    #[test]
    fn zero_extent_is_refused() {
        let fake = Arc::new(FakeDevice::new());
        fake.edit_capabilities(|caps| caps.current_extent = vk::Extent2D { width: 0, height: 0 });
        let result = Swapchain::new(fake.clone(), FakeDevice::surface(), REQUESTED, SwapchainConfig::default());
        assert!(matches!(result, Err(GpuError::ZeroExtent)));
        fake.assert_nothing_live();
    }

    #[test]
    fn acquire_maps_driver_results_to_statuses() {
        let fake = Arc::new(FakeDevice::new());
        let chain = swapchain(&fake);
        let semaphore = vk::Semaphore::null();

        fake.push_acquire(Ok((1, false)));
        fake.push_acquire(Ok((2, true)));
        fake.push_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        fake.push_acquire(Err(vk::Result::TIMEOUT));
        fake.push_acquire(Err(vk::Result::ERROR_DEVICE_LOST));

        assert_eq!(
            chain.acquire_next_image(0, semaphore).unwrap(),
            AcquireStatus::Ready(FrameIndex { index: 1, generation: 0 })
        );
        assert_eq!(
            chain.acquire_next_image(0, semaphore).unwrap(),
            AcquireStatus::Suboptimal(FrameIndex { index: 2, generation: 0 })
        );
        assert_eq!(chain.acquire_next_image(0, semaphore).unwrap(), AcquireStatus::Stale);
        assert_eq!(chain.acquire_next_image(0, semaphore).unwrap(), AcquireStatus::Timeout);
        assert!(matches!(chain.acquire_next_image(0, semaphore), Err(GpuError::DeviceLost)));
    }

    #[test]
    fn present_reports_staleness() {
        let fake = Arc::new(FakeDevice::new());
        let mut chain = swapchain(&fake);
        let queue = vk::Queue::null();
        let frame = chain.frame(0).unwrap();

        assert_eq!(chain.present(queue, frame, None).unwrap(), PresentStatus::Presented);

        fake.push_present(Ok(true));
        assert_eq!(chain.present(queue, frame, None).unwrap(), PresentStatus::Suboptimal);

        fake.push_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert!(matches!(chain.present(queue, frame, None), Err(GpuError::Stale)));

        chain.recreate(REQUESTED).unwrap();
        assert!(matches!(
            chain.present(queue, frame, None),
            Err(GpuError::StaleGeneration { found: 0, current: 1 })
        ));
    }

    #[test]
    fn destroy_twice_releases_each_handle_once() {
        let fake = Arc::new(FakeDevice::new());
        let mut chain = swapchain(&fake);
        chain.destroy();
        chain.destroy();
        assert!(chain.is_destroyed());
        assert_eq!(chain.acquire_next_image(0, vk::Semaphore::null()).unwrap(), AcquireStatus::Stale);
        drop(chain);

        assert_eq!(fake.destroy_count(Kind::Swapchain), 1);
        assert_eq!(fake.destroy_count(Kind::ImageView), 3);
        fake.assert_nothing_live();
    }
}
