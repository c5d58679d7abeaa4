//! Memory type selection.

use vulkanalia::prelude::v1_0::*;

use crate::error::RenderError;

/// Returns the first memory type allowed by `type_filter` whose property
/// flags contain every flag in `properties`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (type_filter & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_type_count = flags.len() as u32;
        for (i, property_flags) in flags.iter().enumerate() {
            memory.memory_types[i] = vk::MemoryType {
                property_flags: *property_flags,
                heap_index: 0,
            };
        }
        memory
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn picks_lowest_matching_index() {
        let memory = memory_table(&[
            DEVICE_LOCAL,
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
        ]);

        assert_eq!(
            find_memory_type(&memory, 0b111, HOST_VISIBLE | HOST_COHERENT).unwrap(),
            1
        );
        assert_eq!(find_memory_type(&memory, 0b111, DEVICE_LOCAL).unwrap(), 0);
    }

    #[test]
    fn respects_type_filter() {
        let memory = memory_table(&[DEVICE_LOCAL, DEVICE_LOCAL, DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&memory, 0b100, DEVICE_LOCAL).unwrap(), 2);
    }

    #[test]
    fn superset_of_request_matches() {
        let memory = memory_table(&[DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT]);
        assert_eq!(find_memory_type(&memory, 0b1, HOST_VISIBLE).unwrap(), 0);
    }

    #[test]
    fn repeated_queries_are_deterministic() {
        let memory = memory_table(&[HOST_VISIBLE, DEVICE_LOCAL, HOST_VISIBLE]);
        let first = find_memory_type(&memory, 0b101, HOST_VISIBLE).unwrap();
        for _ in 0..8 {
            assert_eq!(find_memory_type(&memory, 0b101, HOST_VISIBLE).unwrap(), first);
        }
        assert_eq!(first, 0);
    }

    #[test]
    fn no_match_is_an_error() {
        let memory = memory_table(&[DEVICE_LOCAL, HOST_VISIBLE]);
        let error = find_memory_type(&memory, 0b01, HOST_VISIBLE).unwrap_err();
        assert!(matches!(
            error,
            RenderError::NoSuitableMemoryType { type_filter: 0b01, .. }
        ));
        assert!(find_memory_type(&memory, 0, DEVICE_LOCAL).is_err());
    }
}
