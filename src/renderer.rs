//! Frame orchestration: acquire, update, record, submit, present and
//! rebuild on surface invalidation.

use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use vulkanalia::prelude::v1_0::*;
use winit::window::Window;

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandPool, Usage};
use crate::config::Config;
use crate::descriptor::{DescriptorPool, DescriptorSetLayout};
use crate::device::VulkanDevice;
use crate::framebuffer::Framebuffer;
use crate::image::{Image, ImageDesc};
use crate::instance::VulkanInstance;
use crate::mesh::MeshBuffers;
use crate::pipeline::{GraphicsPipeline, ShaderModule};
use crate::render_pass::{find_depth_format, RenderPass};
use crate::sampler::TextureSampler;
use crate::scene::Scene;
use crate::swapchain::Swapchain;
use crate::uniform::UniformBufferObject;
use crate::MAX_FRAMES_IN_FLIGHT;

/// Everything whose shape depends on the swapchain. Fields drop in
/// declaration order, dependents first.
struct RenderTargets {
    command_buffers: Vec<CommandBuffer>,
    descriptor_pool: DescriptorPool,
    uniform_buffers: Vec<Buffer>,
    framebuffers: Vec<Framebuffer>,
    // Attachments referenced by the framebuffers.
    #[allow(dead_code)]
    depth: Image,
    /// Multisampled color target. Absent when rendering with one sample.
    #[allow(dead_code)]
    color: Option<Image>,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    swapchain: Swapchain,
}

/// Resolution-independent inputs for building [`RenderTargets`].
struct TargetInputs<'a> {
    device: &'a Arc<VulkanDevice>,
    command_pool: &'a Arc<CommandPool>,
    descriptor_set_layout: &'a DescriptorSetLayout,
    vertex_shader: &'a ShaderModule,
    fragment_shader: &'a ShaderModule,
    texture_view: vk::ImageView,
    sampler: vk::Sampler,
}

impl RenderTargets {
    unsafe fn new(inputs: &TargetInputs, framebuffer_size: vk::Extent2D) -> Result<Self> {
        let device = inputs.device;

        let mut swapchain = Swapchain::new(device.clone(), framebuffer_size, MAX_FRAMES_IN_FLIGHT)?;
        let format = swapchain.format();
        let extent = swapchain.extent();
        let image_count = swapchain.image_count();

        let samples = device.instance().msaa_samples();
        let depth_format = find_depth_format(device)?;

        let render_pass = RenderPass::new(device.clone(), format, depth_format, samples)?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            &render_pass,
            inputs.descriptor_set_layout,
            inputs.vertex_shader,
            inputs.fragment_shader,
            extent,
        )?;

        let mut color = if samples != vk::SampleCountFlags::_1 {
            Some(Image::new(
                device.clone(),
                ImageDesc {
                    width: extent.width,
                    height: extent.height,
                    mipmapped: false,
                    samples,
                    format,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                        | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                },
            )?)
        } else {
            None
        };

        let mut depth = Image::new(
            device.clone(),
            ImageDesc {
                width: extent.width,
                height: extent.height,
                mipmapped: false,
                samples,
                format: depth_format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            },
        )?;

        let depth_view = depth.get_view(depth_format, vk::ImageAspectFlags::DEPTH)?;
        let color_view = match color.as_mut() {
            Some(color) => Some(color.get_view(format, vk::ImageAspectFlags::COLOR)?),
            None => None,
        };

        let mut framebuffers = Vec::with_capacity(image_count);
        for index in 0..image_count {
            let swapchain_view = swapchain.image_view(index)?;
            let attachments = match color_view {
                Some(color_view) => vec![color_view, depth_view, swapchain_view],
                None => vec![swapchain_view, depth_view],
            };
            framebuffers.push(Framebuffer::new(
                device.clone(),
                &render_pass,
                &attachments,
                extent,
            )?);
        }

        let uniform_buffers = (0..image_count)
            .map(|_| {
                Buffer::new(
                    device.clone(),
                    size_of::<UniformBufferObject>() as vk::DeviceSize,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let descriptor_pool = DescriptorPool::new(
            device.clone(),
            inputs.descriptor_set_layout,
            image_count as u32,
        )?;
        for (index, uniform_buffer) in uniform_buffers.iter().enumerate() {
            descriptor_pool.write(index, uniform_buffer, inputs.texture_view, inputs.sampler);
        }

        let command_buffers = inputs.command_pool.allocate(image_count as u32)?;

        Ok(Self {
            command_buffers,
            descriptor_pool,
            uniform_buffers,
            framebuffers,
            depth,
            color,
            pipeline,
            render_pass,
            swapchain,
        })
    }
}

pub struct Renderer {
    targets: Option<RenderTargets>,
    sampler: TextureSampler,
    texture: Image,
    mesh: MeshBuffers,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    descriptor_set_layout: DescriptorSetLayout,
    command_pool: Arc<CommandPool>,
    device: Arc<VulkanDevice>,
    clear_color: [f32; 4],
    start: Instant,
    resized: bool,
}

impl Renderer {
    pub unsafe fn new(window: &Window, config: &Config, scene: Scene) -> Result<Self> {
        let instance = Arc::new(VulkanInstance::new(
            window,
            &config.debug,
            config.graphics.multisampling,
        )?);
        let device = VulkanDevice::new(instance)?;
        let command_pool = CommandPool::new(device.clone())?;

        let descriptor_set_layout = DescriptorSetLayout::new(device.clone())?;
        let vertex_shader = ShaderModule::load(device.clone(), &config.assets.vertex_shader)?;
        let fragment_shader = ShaderModule::load(device.clone(), &config.assets.fragment_shader)?;

        let mesh = scene.load_mesh(&config.assets)?;
        let mesh = MeshBuffers::upload(&command_pool, &mesh)?;

        let texture = Image::load_from(&command_pool, &config.assets.texture)?;
        let sampler = TextureSampler::new(device.clone(), texture.mip_levels())?;

        log::info!("Scene {:?} ready", scene);

        let size = window.inner_size();
        let mut renderer = Self {
            targets: None,
            sampler,
            texture,
            mesh,
            vertex_shader,
            fragment_shader,
            descriptor_set_layout,
            command_pool,
            device,
            clear_color: config.graphics.clear_color,
            start: Instant::now(),
            resized: false,
        };
        renderer.reconfigure(vk::Extent2D {
            width: size.width,
            height: size.height,
        })?;

        Ok(renderer)
    }

    /// Flags the swapchain for a rebuild before the next frame.
    pub fn mark_resized(&mut self) {
        self.resized = true;
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Renders one frame at `framebuffer_size`. A zero-sized framebuffer
    /// (minimized window) skips the frame.
    pub unsafe fn draw_frame(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        if framebuffer_size.width == 0 || framebuffer_size.height == 0 {
            return Ok(());
        }

        if self.resized {
            return self.reconfigure(framebuffer_size);
        }

        let Some(targets) = self.targets.as_mut() else {
            return self.reconfigure(framebuffer_size);
        };

        let Some(image) = targets.swapchain.acquire_next_image()? else {
            return self.reconfigure(framebuffer_size);
        };

        let extent = targets.swapchain.extent();
        let ubo = UniformBufferObject::at(
            self.start.elapsed().as_secs_f32(),
            extent.width as f32 / extent.height as f32,
        );
        targets.uniform_buffers[image].copy_from(bytemuck::bytes_of(&ubo))?;

        let command_buffer = &mut targets.command_buffers[image];
        command_buffer.reset()?;
        command_buffer.begin(Usage::Reusable)?;
        let cb = command_buffer.recording()?;

        targets
            .render_pass
            .begin(cb, &targets.framebuffers[image], extent, self.clear_color);
        self.device
            .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, targets.pipeline.handle());
        self.device.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::GRAPHICS,
            targets.pipeline.layout(),
            0,
            &[targets.descriptor_pool.set(image)],
            &[],
        );
        self.mesh.bind(&self.device, cb);
        self.mesh.draw(&self.device, cb);
        targets.render_pass.end(cb);

        command_buffer.end()?;

        targets.swapchain.submit(command_buffer)?;
        targets.swapchain.present()?;
        targets.swapchain.advance_frame();

        if targets.swapchain.is_invalid() {
            self.reconfigure(framebuffer_size)?;
        }

        Ok(())
    }

    /// Rebuilds the swapchain and everything sized by it. The mesh, texture,
    /// sampler, shaders and descriptor set layout are kept.
    pub unsafe fn reconfigure(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        self.device.wait_idle()?;
        self.targets = None;

        let texture_view = self
            .texture
            .get_view(self.texture.format(), vk::ImageAspectFlags::COLOR)?;
        let inputs = TargetInputs {
            device: &self.device,
            command_pool: &self.command_pool,
            descriptor_set_layout: &self.descriptor_set_layout,
            vertex_shader: &self.vertex_shader,
            fragment_shader: &self.fragment_shader,
            texture_view,
            sampler: self.sampler.handle(),
        };

        let targets = RenderTargets::new(&inputs, framebuffer_size)?;
        log::info!(
            "Render targets ready at {}x{}",
            targets.swapchain.extent().width,
            targets.swapchain.extent().height
        );
        self.targets = Some(targets);
        self.resized = false;

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device wait idle failed during shutdown: {}", e);
        }
        self.targets = None;
        log::debug!("Renderer released");
    }
}
