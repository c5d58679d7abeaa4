//! Vertex layout, mesh deduplication and device-local mesh buffers.

use std::collections::HashMap;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytemuck::{Pod, Zeroable};
use vulkanalia::prelude::v1_0::*;

use crate::buffer::Buffer;
use crate::command::CommandPool;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(size_of::<[f32; 3]>() as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset((size_of::<[f32; 3]>() * 2) as u32)
                .build(),
        ]
    }

    /// Identity used for deduplication: exact bits of position and texture
    /// coordinate.
    fn key(&self) -> [u32; 5] {
        [
            self.pos[0].to_bits(),
            self.pos[1].to_bits(),
            self.pos[2].to_bits(),
            self.tex_coord[0].to_bits(),
            self.tex_coord[1].to_bits(),
        ]
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Builds an indexed mesh from a flat, face-ordered vertex stream. The
    /// first occurrence of each (position, texture coordinate) pair is kept
    /// and every later occurrence reuses its index.
    pub fn deduplicate(stream: impl IntoIterator<Item = Vertex>) -> Self {
        let mut mesh = Self::default();
        let mut unique = HashMap::new();

        for vertex in stream {
            let index = *unique.entry(vertex.key()).or_insert_with(|| {
                mesh.vertices.push(vertex);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }

        mesh
    }

    /// Loads every model in an OBJ file. Texture coordinates are flipped
    /// vertically to match the image's top-left origin. A file without any
    /// faces is rejected.
    pub fn from_obj<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (models, _) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                single_index: true,
                triangulate: true,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to load model {:?}", path))?;

        let stream = models.iter().flat_map(|model| {
            let mesh = &model.mesh;
            mesh.indices.iter().map(move |index| {
                let pos_offset = (3 * index) as usize;
                let tex_coord_offset = (2 * index) as usize;

                let tex_coord = match (
                    mesh.texcoords.get(tex_coord_offset),
                    mesh.texcoords.get(tex_coord_offset + 1),
                ) {
                    (Some(u), Some(v)) => [*u, 1.0 - *v],
                    _ => [0.0, 0.0],
                };

                Vertex::new(
                    [
                        mesh.positions[pos_offset],
                        mesh.positions[pos_offset + 1],
                        mesh.positions[pos_offset + 2],
                    ],
                    [1.0, 1.0, 1.0],
                    tex_coord,
                )
            })
        });

        let mesh = Self::deduplicate(stream);
        if mesh.indices.is_empty() {
            bail!("Model {:?} has no faces", path);
        }
        log::info!(
            "Loaded model {:?}: {} unique vertices, {} indices",
            path,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    /// Two stacked textured quads half a unit apart in depth.
    pub fn quads() -> Self {
        let quad = |z: f32| {
            [
                Vertex::new([-0.5, -0.5, z], [1.0, 0.0, 0.0], [1.0, 0.0]),
                Vertex::new([0.5, -0.5, z], [0.0, 1.0, 0.0], [0.0, 0.0]),
                Vertex::new([0.5, 0.5, z], [0.0, 0.0, 1.0], [0.0, 1.0]),
                Vertex::new([-0.5, 0.5, z], [1.0, 1.0, 1.0], [1.0, 1.0]),
            ]
        };

        let mut vertices = Vec::with_capacity(8);
        vertices.extend_from_slice(&quad(0.0));
        vertices.extend_from_slice(&quad(-0.5));

        Self {
            vertices,
            indices: vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4],
        }
    }
}

/// Vertex and index buffers in device-local memory.
pub struct MeshBuffers {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
}

impl MeshBuffers {
    pub unsafe fn upload(pool: &Arc<CommandPool>, mesh: &Mesh) -> Result<Self> {
        if mesh.indices.is_empty() {
            bail!("Cannot upload a mesh with no indices");
        }

        let vertex_buffer = Buffer::device_local(
            pool,
            bytemuck::cast_slice(&mesh.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = Buffer::device_local(
            pool,
            bytemuck::cast_slice(&mesh.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
        })
    }

    pub unsafe fn bind(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.handle()], &[0]);
        device.cmd_bind_index_buffer(
            command_buffer,
            self.index_buffer.handle(),
            0,
            vk::IndexType::UINT32,
        );
    }

    pub unsafe fn draw(&self, device: &Device, command_buffer: vk::CommandBuffer) {
        device.cmd_draw_indexed(command_buffer, self.index_count, 1, 0, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn v(pos: [f32; 3], tex_coord: [f32; 2]) -> Vertex {
        Vertex::new(pos, [1.0, 1.0, 1.0], tex_coord)
    }

    #[test]
    fn shared_corners_are_merged() {
        let a = v([0.0, 0.0, 0.0], [0.0, 0.0]);
        let b = v([1.0, 0.0, 0.0], [1.0, 0.0]);
        let c = v([1.0, 1.0, 0.0], [1.0, 1.0]);
        let d = v([0.0, 1.0, 0.0], [0.0, 1.0]);

        let mesh = Mesh::deduplicate([a, b, c, c, d, a]);
        assert_eq!(mesh.vertices, vec![a, b, c, d]);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn same_position_different_tex_coord_stays_distinct() {
        let seam_left = v([0.0, 0.0, 0.0], [0.0, 0.5]);
        let seam_right = v([0.0, 0.0, 0.0], [1.0, 0.5]);
        let mesh = Mesh::deduplicate([seam_left, seam_right, seam_left]);
        assert_eq!(mesh.vertices.len(), 2);
        assert_eq!(mesh.indices, vec![0, 1, 0]);
    }

    #[test]
    fn reindexing_reproduces_the_face_stream() {
        let corners = [
            v([0.0, 0.0, 0.0], [0.0, 0.0]),
            v([1.0, 0.0, 0.0], [1.0, 0.0]),
            v([1.0, 1.0, 0.0], [1.0, 1.0]),
            v([0.0, 1.0, 0.0], [0.0, 1.0]),
            v([0.0, 0.0, 1.0], [0.5, 0.5]),
        ];
        let faces = [0usize, 1, 2, 2, 3, 0, 0, 4, 1, 1, 4, 2, 2, 4, 3, 3, 4, 0];
        let stream: Vec<Vertex> = faces.iter().map(|i| corners[*i]).collect();

        let mesh = Mesh::deduplicate(stream.clone());

        let rebuilt: Vec<Vertex> = mesh
            .indices
            .iter()
            .map(|i| mesh.vertices[*i as usize])
            .collect();
        assert_eq!(rebuilt, stream);

        let keys: HashSet<[u32; 5]> = mesh.vertices.iter().map(Vertex::key).collect();
        assert_eq!(keys.len(), mesh.vertices.len());
        assert_eq!(mesh.vertices.len(), corners.len());
    }

    #[test]
    fn empty_stream_gives_empty_mesh() {
        let mesh = Mesh::deduplicate(std::iter::empty());
        assert!(mesh.vertices.is_empty());
        assert!(mesh.indices.is_empty());
    }

    #[test]
    fn quads_are_stacked_in_depth() {
        let mesh = Mesh::quads();
        assert_eq!(mesh.vertices.len(), 8);
        assert_eq!(mesh.indices.len(), 12);
        assert!(mesh.vertices[..4].iter().all(|v| v.pos[2] == 0.0));
        assert!(mesh.vertices[4..].iter().all(|v| v.pos[2] == -0.5));
        assert!(mesh.indices.iter().all(|i| (*i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::binding_description().stride, 32);
    }
}
