//! Instance, surface and physical device selection.
//!
//! [`VulkanInstance`] is shared behind an `Arc` by the device and every
//! object that needs to query the physical device, so it is destroyed last.

use std::collections::HashSet;
use std::ffi::{c_char, c_void};
use std::ops::Deref;

use anyhow::{anyhow, Result};
use thiserror::Error;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{EntryV1_1, ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;
use winit::window::Window;

use crate::config::DebugConfig;
use crate::validation::{debug_callback, ValidationClient};

const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_SWAPCHAIN_EXTENSION.name];

#[derive(Debug, Error)]
#[error("{0}")]
pub struct SuitabilityError(pub &'static str);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_queue_family_properties(physical_device);

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let mut present = None;
        for (index, _) in properties.iter().enumerate() {
            if instance.get_physical_device_surface_support_khr(
                physical_device,
                index as u32,
                surface,
            )? {
                present = Some(index as u32);
                break;
            }
        }

        if let (Some(graphics), Some(present)) = (graphics, present) {
            Ok(Self { graphics, present })
        } else {
            Err(anyhow!(SuitabilityError("Missing required queue families.")))
        }
    }

    /// Distinct families, for queue creation and swapchain sharing.
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: instance
                .get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance
                .get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

/// Highest sample count usable for both color and depth, capped at 8x.
pub fn max_usable_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::_8,
        vk::SampleCountFlags::_4,
        vk::SampleCountFlags::_2,
    ]
    .iter()
    .cloned()
    .find(|c| counts.contains(*c))
    .unwrap_or(vk::SampleCountFlags::_1)
}

pub struct VulkanInstance {
    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilyIndices,
    msaa_samples: vk::SampleCountFlags,
    max_anisotropy: Option<f32>,
    validation: bool,
    messenger: vk::DebugUtilsMessengerEXT,
    // Referenced by the messenger's user data; must outlive it.
    validation_client: Option<Box<ValidationClient>>,
}

impl VulkanInstance {
    pub unsafe fn new(window: &Window, debug: &DebugConfig, multisampling: bool) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;

        let loader_version = entry
            .enumerate_instance_version()
            .unwrap_or(vk::make_version(1, 0, 0));
        log::info!(
            "Vulkan loader version: {}.{}.{}",
            vk::version_major(loader_version),
            vk::version_minor(loader_version),
            vk::version_patch(loader_version)
        );

        let validation = debug.validation_layers;
        if validation {
            check_validation_layer_support(&entry)?;
        }

        let validation_client = if validation && cfg!(feature = "validation-channel") {
            match ValidationClient::connect(&debug.channel) {
                Ok(client) => {
                    log::info!("Forwarding validation messages to `{}`", debug.channel);
                    Some(Box::new(client))
                }
                Err(e) => {
                    log::warn!("Validation channel `{}` unavailable: {}", debug.channel, e);
                    None
                }
            }
        } else {
            None
        };

        let application_info = vk::ApplicationInfo::builder()
            .application_name(b"Room Viewer VK\0")
            .application_version(vk::make_version(1, 0, 0))
            .engine_name(b"No Engine\0")
            .engine_version(vk::make_version(1, 0, 0))
            .api_version(vk::make_version(1, 0, 0));

        let mut extensions = vk_window::get_required_instance_extensions(window)
            .iter()
            .map(|e| e.as_ptr())
            .collect::<Vec<_>>();
        if validation {
            extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
        }

        let layers = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let info = vk::InstanceCreateInfo::builder()
            .application_info(&application_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let instance = entry.create_instance(&info, None)?;

        let messenger = if validation {
            let user_data = validation_client
                .as_deref()
                .map_or(std::ptr::null_mut(), |c| {
                    c as *const ValidationClient as *mut c_void
                });
            let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .user_callback(Some(debug_callback));
            debug_info.user_data = user_data;
            instance.create_debug_utils_messenger_ext(&debug_info, None)?
        } else {
            vk::DebugUtilsMessengerEXT::null()
        };

        let surface = vk_window::create_surface(&instance, window, window)?;

        let (physical_device, queue_families) = pick_physical_device(&instance, surface)?;

        let properties = instance.get_physical_device_properties(physical_device);
        let msaa_samples = if multisampling {
            max_usable_sample_count(
                properties.limits.framebuffer_color_sample_counts
                    & properties.limits.framebuffer_depth_sample_counts,
            )
        } else {
            vk::SampleCountFlags::_1
        };
        log::info!("Using {:?} samples per pixel", msaa_samples);

        let features = instance.get_physical_device_features(physical_device);
        let max_anisotropy = (features.sampler_anisotropy == vk::TRUE)
            .then_some(properties.limits.max_sampler_anisotropy);

        Ok(Self {
            entry,
            instance,
            surface,
            physical_device,
            queue_families,
            msaa_samples,
            max_anisotropy,
            validation,
            messenger,
            validation_client,
        })
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.msaa_samples
    }

    /// `Some(limit)` when the device supports sampler anisotropy.
    pub fn max_anisotropy(&self) -> Option<f32> {
        self.max_anisotropy
    }

    pub fn validation_layers(&self) -> Vec<*const c_char> {
        if self.validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        }
    }

    pub unsafe fn swapchain_support(&self) -> Result<SwapchainSupport> {
        SwapchainSupport::get(&self.instance, self.surface, self.physical_device)
    }

    pub unsafe fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.instance
            .get_physical_device_memory_properties(self.physical_device)
    }

    pub unsafe fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        self.instance
            .get_physical_device_format_properties(self.physical_device, format)
    }
}

impl Deref for VulkanInstance {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        unsafe {
            self.instance.destroy_surface_khr(self.surface, None);
            if !self.messenger.is_null() {
                self.instance
                    .destroy_debug_utils_messenger_ext(self.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        self.validation_client = None;
    }
}

unsafe fn check_validation_layer_support(entry: &Entry) -> Result<()> {
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    if available_layers.contains(&VALIDATION_LAYER) {
        Ok(())
    } else {
        Err(anyhow!("Validation layer requested but not supported."))
    }
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
    for physical_device in instance.enumerate_physical_devices()? {
        let properties = instance.get_physical_device_properties(physical_device);

        match check_physical_device(instance, surface, physical_device) {
            Ok(indices) => {
                log::info!("Selected physical device (`{}`).", properties.device_name);
                return Ok((physical_device, indices));
            }
            Err(error) => {
                log::warn!(
                    "Skipping physical device (`{}`): {}",
                    properties.device_name, error
                );
            }
        }
    }

    Err(anyhow!("Failed to find suitable physical device."))
}

unsafe fn check_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let indices = QueueFamilyIndices::get(instance, surface, physical_device)?;
    check_physical_device_extensions(instance, physical_device)?;

    let support = SwapchainSupport::get(instance, surface, physical_device)?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return Err(anyhow!(SuitabilityError("Insufficient swapchain support.")));
    }

    Ok(indices)
}

unsafe fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = instance
        .enumerate_device_extension_properties(physical_device, None)?
        .iter()
        .map(|e| e.extension_name)
        .collect::<HashSet<_>>();
    if DEVICE_EXTENSIONS.iter().all(|e| extensions.contains(e)) {
        Ok(())
    } else {
        Err(anyhow!(SuitabilityError("Missing required device extensions.")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_is_highest_common_bit() {
        let counts = vk::SampleCountFlags::_1 | vk::SampleCountFlags::_2 | vk::SampleCountFlags::_4;
        assert_eq!(max_usable_sample_count(counts), vk::SampleCountFlags::_4);
    }

    #[test]
    fn sample_count_capped_at_eight() {
        let counts = vk::SampleCountFlags::_1
            | vk::SampleCountFlags::_8
            | vk::SampleCountFlags::_16
            | vk::SampleCountFlags::_64;
        assert_eq!(max_usable_sample_count(counts), vk::SampleCountFlags::_8);
    }

    #[test]
    fn single_sample_fallback() {
        assert_eq!(
            max_usable_sample_count(vk::SampleCountFlags::_1),
            vk::SampleCountFlags::_1
        );
    }

    #[test]
    fn unique_families_collapse_when_aliased() {
        let shared = QueueFamilyIndices { graphics: 0, present: 0 };
        assert_eq!(shared.unique(), vec![0]);
        let split = QueueFamilyIndices { graphics: 0, present: 2 };
        assert_eq!(split.unique(), vec![0, 2]);
    }
}
