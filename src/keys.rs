// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Structural descriptions of GPU objects.

These are plain data describing the *shape* of a resource, shader view or pipeline.  They double as
cache keys: two descriptions that compare equal describe interchangeable objects, so an object
created for one can be handed out for the other.  Equality and hashing are purely structural.
*/

use crate::handles::ResourceHandle;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R32Float,
    R32Uint,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl Format {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::R32Float
            | Format::R32Uint
            | Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Depth32Float
            | Format::Depth24PlusStencil8 => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Format::Depth32Float | Format::Depth24PlusStencil8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescription {
    pub format: Format,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array size otherwise.
    pub depth_or_array_size: u32,
    pub mip_levels: u32,
    pub allow_uav: bool,
}

impl TextureDescription {
    pub fn new_2d(format: Format, width: u32, height: u32) -> Self {
        TextureDescription {
            format,
            dimension: TextureDimension::D2,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            allow_uav: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    pub size: u64,
    pub stride: u32,
    pub allow_uav: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetDescription {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub array_size: u32,
}

impl RenderTargetDescription {
    pub fn new(format: Format, width: u32, height: u32) -> Self {
        RenderTargetDescription {
            format,
            width,
            height,
            samples: 1,
            array_size: 1,
        }
    }
}

/// Cache key for anything the backend creates as a [ResourceHandle].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Texture(TextureDescription),
    Buffer(BufferDescription),
    RenderTarget(RenderTargetDescription),
}

impl From<TextureDescription> for ResourceKey {
    fn from(value: TextureDescription) -> Self {
        ResourceKey::Texture(value)
    }
}
impl From<BufferDescription> for ResourceKey {
    fn from(value: BufferDescription) -> Self {
        ResourceKey::Buffer(value)
    }
}
impl From<RenderTargetDescription> for ResourceKey {
    fn from(value: RenderTargetDescription) -> Self {
        ResourceKey::RenderTarget(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceView {
    pub resource: ResourceHandle,
    pub first_mip: u32,
    pub mip_count: u32,
}

impl ResourceView {
    pub fn whole(resource: ResourceHandle) -> Self {
        ResourceView {
            resource,
            first_mip: 0,
            mip_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
    Anisotropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Clamp,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDescription {
    pub filter: Filter,
    pub address: AddressMode,
}

/// Contents of a shader view: which resources and samplers it binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ShaderViewDescription {
    pub srvs: Vec<ResourceView>,
    pub uavs: Vec<ResourceView>,
    pub samplers: Vec<SamplerDescription>,
}

impl ShaderViewDescription {
    /// Descriptor slots this view occupies.
    pub fn num_descriptors(&self) -> u32 {
        (self.srvs.len() + self.uavs.len() + self.samplers.len()) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
}

/// Compiled shader bytecode.  Hashes by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    Triangles,
    Lines,
    Points,
    Patches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Back,
    Front,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDescription {
    pub shaders: Vec<ShaderBinary>,
    pub vertex_stride: u32,
    pub render_targets: Vec<Format>,
    pub depth_target: Option<Format>,
    pub topology: PrimitiveTopology,
    pub cull: CullMode,
    pub num_shader_arguments: u32,
    pub has_root_constants: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineDescription {
    pub shader: Arc<[u8]>,
    pub num_shader_arguments: u32,
    pub has_root_constants: bool,
}

/// Cache key for pipeline state objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineKey {
    Graphics(GraphicsPipelineDescription),
    Compute(ComputePipelineDescription),
}

impl From<GraphicsPipelineDescription> for PipelineKey {
    fn from(value: GraphicsPipelineDescription) -> Self {
        PipelineKey::Graphics(value)
    }
}
impl From<ComputePipelineDescription> for PipelineKey {
    fn from(value: ComputePipelineDescription) -> Self {
        PipelineKey::Compute(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut h = DefaultHasher::new();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equal_shapes_are_equal_keys() {
        let a = ResourceKey::from(TextureDescription::new_2d(Format::Rgba8Unorm, 64, 64));
        let b = ResourceKey::from(TextureDescription::new_2d(Format::Rgba8Unorm, 64, 64));
        let c = ResourceKey::from(TextureDescription::new_2d(Format::Rgba8Srgb, 64, 64));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn shader_bytes_hash_by_content() {
        let a = ComputePipelineDescription {
            shader: Arc::from(&b"main"[..]),
            num_shader_arguments: 1,
            has_root_constants: false,
        };
        let b = ComputePipelineDescription {
            shader: Arc::from(b"main".to_vec()),
            ..a.clone()
        };
        assert_eq!(PipelineKey::from(a.clone()), PipelineKey::from(b.clone()));
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn descriptor_count() {
        let r = ResourceHandle::from_index(1);
        let d = ShaderViewDescription {
            srvs: vec![ResourceView::whole(r), ResourceView::whole(r)],
            uavs: vec![ResourceView::whole(r)],
            samplers: vec![SamplerDescription {
                filter: Filter::Linear,
                address: AddressMode::Clamp,
            }],
        };
        assert_eq!(d.num_descriptors(), 4);
    }
}
