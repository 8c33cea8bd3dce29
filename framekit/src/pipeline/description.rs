// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Description of the state of a pipeline object.
//!
//! A [`PipelineStateDescription`] is meant to be used as a builder: a renderer keeps one per
//! thread and mutates it field by field between draws. When a pipeline is needed, the description
//! is resolved against the [`PipelineCache`](super::PipelineCache), which turns it into an
//! immutable [`HashedPipelineKey`] only if it has never been seen before.
//!
//! All fields are plain integers and enums, so two descriptions are equal exactly when every field
//! is equal. Floating-point state such as the depth bias is stored as its bit pattern.

use crate::backend::BackendHandle;
use foldhash::fast::FixedState;
use smallvec::SmallVec;
use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

// Changing this changes every pipeline hash, which is harmless since hashes are never persisted.
const HASH_SEED: u64 = 0x6672_616d_656b_6974;

/// The compiled shader stages of a pipeline, identified by the effect that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderRef {
    /// The bytecode object, as created by the backend.
    pub bytecode: BackendHandle,

    /// The root signature or pipeline layout the shader stages are bound with.
    pub layout: BackendHandle,
}

/// The format of a render target or vertex attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Undefined,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Float,
    R32Float,
    R32G32Float,
    R32G32B32Float,
    R32G32B32A32Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// How the output of the fragment shader is blended into one color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentBlend {
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
}

impl AttachmentBlend {
    /// Standard alpha blending: `src * src_alpha + dst * (1 - src_alpha)`.
    #[inline]
    pub const fn alpha() -> Self {
        AttachmentBlend {
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::OneMinusSrcAlpha,
            alpha_blend_op: BlendOp::Add,
        }
    }

    /// Premultiplied alpha blending: `src + dst * (1 - src_alpha)`.
    #[inline]
    pub const fn premultiplied_alpha() -> Self {
        AttachmentBlend {
            src_color_blend_factor: BlendFactor::One,
            ..Self::alpha()
        }
    }

    /// Additive blending: `src + dst`.
    #[inline]
    pub const fn additive() -> Self {
        AttachmentBlend {
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::One,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::One,
            alpha_blend_op: BlendOp::Add,
        }
    }
}

/// Blend state of one color attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachmentState {
    /// `None` disables blending: the output overwrites the attachment.
    pub blend: Option<AttachmentBlend>,

    /// Bit `i` enables writes to component `i` (R, G, B, A).
    pub color_write_mask: u8,
}

impl Default for ColorBlendAttachmentState {
    #[inline]
    fn default() -> Self {
        ColorBlendAttachmentState {
            blend: None,
            color_write_mask: 0b1111,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ColorBlendState {
    /// Whether alpha is used as coverage when multisampling.
    pub alpha_to_coverage: bool,

    /// Whether each attachment has its own blend state. Otherwise the first one applies to all.
    pub independent_blend: bool,

    pub attachments: SmallVec<[ColorBlendAttachmentState; 4]>,

    /// The constant color of [`BlendFactor::ConstantColor`], as raw `f32` bits.
    pub blend_constants: [u32; 4],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthBiasState {
    pub constant_factor: i32,
    /// Raw `f32` bits.
    pub clamp: u32,
    /// Raw `f32` bits.
    pub slope_factor: u32,
}

impl DepthBiasState {
    #[inline]
    pub fn new(constant_factor: i32, clamp: f32, slope_factor: f32) -> Self {
        DepthBiasState {
            constant_factor,
            clamp: clamp.to_bits(),
            slope_factor: slope_factor.to_bits(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizationState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias: Option<DepthBiasState>,
    pub depth_clip: bool,
    pub scissor: bool,
    pub multisample: bool,
    pub antialiased_lines: bool,
}

impl Default for RasterizationState {
    #[inline]
    fn default() -> Self {
        RasterizationState {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias: None,
            depth_clip: true,
            scissor: false,
            multisample: true,
            antialiased_lines: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub front: StencilOpState,
    pub back: StencilOpState,
    pub read_mask: u8,
    pub write_mask: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: CompareOp,
    pub stencil: Option<StencilState>,
}

impl Default for DepthStencilState {
    #[inline]
    fn default() -> Self {
        DepthStencilState {
            depth_test: true,
            depth_write: true,
            depth_compare_op: CompareOp::LessOrEqual,
            stencil: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance {
        divisor: u32,
    },
}

/// One attribute of the vertex input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInputElement {
    pub semantic_index: u32,
    pub format: Format,
    pub binding: u32,
    pub offset: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    PatchList {
        control_points: u8,
    },
}

/// The attachments a pipeline renders into.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderOutputDescription {
    pub color_formats: SmallVec<[Format; 4]>,
    pub depth_stencil_format: Format,
    pub sample_count: u8,
}

impl Default for RenderOutputDescription {
    #[inline]
    fn default() -> Self {
        RenderOutputDescription {
            color_formats: SmallVec::new(),
            depth_stencil_format: Format::Undefined,
            sample_count: 1,
        }
    }
}

/// The complete state of a pipeline object.
///
/// See [the documentation of the module](self) for how this is meant to be used.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineStateDescription {
    /// The shader stages. A description without shader can't be resolved.
    ///
    /// The default value is `None`.
    pub shader: Option<ShaderRef>,

    /// The default value is `ColorBlendState::default()`, with a single attachment that doesn't
    /// blend.
    pub color_blend: ColorBlendState,

    /// The default value is `0xffff_ffff`.
    pub sample_mask: u32,

    /// The default value is `RasterizationState::default()`.
    pub rasterization: RasterizationState,

    /// The default value is `DepthStencilState::default()`.
    pub depth_stencil: DepthStencilState,

    /// The default value is empty.
    pub vertex_input: SmallVec<[VertexInputElement; 8]>,

    /// The default value is [`PrimitiveTopology::TriangleList`].
    pub topology: PrimitiveTopology,

    /// The default value is `RenderOutputDescription::default()`.
    pub output: RenderOutputDescription,
}

impl Default for PipelineStateDescription {
    #[inline]
    fn default() -> Self {
        let mut description = PipelineStateDescription {
            shader: None,
            color_blend: ColorBlendState::default(),
            sample_mask: 0,
            rasterization: RasterizationState::default(),
            depth_stencil: DepthStencilState::default(),
            vertex_input: SmallVec::new(),
            topology: PrimitiveTopology::default(),
            output: RenderOutputDescription::default(),
        };
        description.set_defaults();

        description
    }
}

impl PipelineStateDescription {
    /// Puts every field back to its default value, keeping the storage of the lists.
    pub fn set_defaults(&mut self) {
        self.shader = None;
        self.color_blend.alpha_to_coverage = false;
        self.color_blend.independent_blend = false;
        self.color_blend.attachments.clear();
        self.color_blend
            .attachments
            .push(ColorBlendAttachmentState::default());
        self.color_blend.blend_constants = [0; 4];
        self.sample_mask = u32::MAX;
        self.rasterization = RasterizationState::default();
        self.depth_stencil = DepthStencilState::default();
        self.vertex_input.clear();
        self.topology = PrimitiveTopology::default();
        self.output.color_formats.clear();
        self.output.depth_stencil_format = Format::Undefined;
        self.output.sample_count = 1;
    }

    #[inline]
    pub fn shader(&mut self, shader: ShaderRef) -> &mut Self {
        self.shader = Some(shader);
        self
    }

    /// Sets the same blend state on every color attachment.
    #[inline]
    pub fn blend(&mut self, blend: Option<AttachmentBlend>) -> &mut Self {
        for attachment in &mut self.color_blend.attachments {
            attachment.blend = blend;
        }
        self
    }

    #[inline]
    pub fn rasterization(&mut self, rasterization: RasterizationState) -> &mut Self {
        self.rasterization = rasterization;
        self
    }

    #[inline]
    pub fn depth_stencil(&mut self, depth_stencil: DepthStencilState) -> &mut Self {
        self.depth_stencil = depth_stencil;
        self
    }

    #[inline]
    pub fn vertex_input(
        &mut self,
        elements: impl IntoIterator<Item = VertexInputElement>,
    ) -> &mut Self {
        self.vertex_input.clear();
        self.vertex_input.extend(elements);
        self
    }

    #[inline]
    pub fn topology(&mut self, topology: PrimitiveTopology) -> &mut Self {
        self.topology = topology;
        self
    }

    /// Sets the render targets, resizing the blend attachments to match.
    pub fn output(
        &mut self,
        color_formats: impl IntoIterator<Item = Format>,
        depth_stencil_format: Format,
        sample_count: u8,
    ) -> &mut Self {
        self.output.color_formats.clear();
        self.output.color_formats.extend(color_formats);
        self.output.depth_stencil_format = depth_stencil_format;
        self.output.sample_count = sample_count;

        let attachment = self
            .color_blend
            .attachments
            .first()
            .copied()
            .unwrap_or_default();
        self.color_blend
            .attachments
            .resize(self.output.color_formats.len().max(1), attachment);

        self
    }

    /// Returns the structural hash of the description.
    ///
    /// The hash is stable for the lifetime of the process, but may change between versions.
    #[inline]
    pub fn structural_hash(&self) -> u64 {
        FixedState::with_seed(HASH_SEED).hash_one(self)
    }

    /// Clones the description into an immutable key.
    #[inline]
    pub fn to_key(&self) -> HashedPipelineKey {
        HashedPipelineKey::with_hash(self.structural_hash(), self.clone())
    }
}

/// An immutable [`PipelineStateDescription`] together with its structural hash.
///
/// Comparing two keys first compares the hashes, and only compares the descriptions if the hashes
/// are equal. Hashing a key only feeds the precomputed hash.
#[derive(Clone, Debug)]
pub struct HashedPipelineKey {
    hash: u64,
    description: Arc<PipelineStateDescription>,
}

impl HashedPipelineKey {
    #[inline]
    pub(crate) fn with_hash(hash: u64, description: PipelineStateDescription) -> Self {
        debug_assert_eq!(hash, description.structural_hash());

        HashedPipelineKey {
            hash,
            description: Arc::new(description),
        }
    }

    /// Returns the precomputed structural hash.
    #[inline]
    pub fn structural_hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    pub fn description(&self) -> &PipelineStateDescription {
        &self.description
    }
}

impl PartialEq for HashedPipelineKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && (Arc::ptr_eq(&self.description, &other.description)
                || self.description == other.description)
    }
}

impl Eq for HashedPipelineKey {}

impl Hash for HashedPipelineKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl std::borrow::Borrow<PipelineStateDescription> for HashedPipelineKey {
    #[inline]
    fn borrow(&self) -> &PipelineStateDescription {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(raw: u64) -> ShaderRef {
        ShaderRef {
            bytecode: BackendHandle::new(raw).unwrap(),
            layout: BackendHandle::new(raw + 1000).unwrap(),
        }
    }

    #[test]
    fn equal_descriptions_hash_equal() {
        let mut a = PipelineStateDescription::default();
        a.shader(shader(1))
            .blend(Some(AttachmentBlend::alpha()))
            .output([Format::R8G8B8A8Srgb], Format::D32Float, 1);

        let mut b = PipelineStateDescription::default();
        b.output([Format::R8G8B8A8Srgb], Format::D32Float, 1)
            .shader(shader(1))
            .blend(Some(AttachmentBlend::alpha()));

        assert_eq!(a, b);
        assert_eq!(a.structural_hash(), b.structural_hash());
        assert_eq!(a.to_key(), b.to_key());
    }

    #[test]
    fn any_field_changes_the_key() {
        let mut base = PipelineStateDescription::default();
        base.shader(shader(1));
        let key = base.to_key();

        let mut other = base.clone();
        other.rasterization.cull_mode = CullMode::None;
        assert_ne!(other.to_key(), key);

        let mut other = base.clone();
        other.rasterization.depth_bias = Some(DepthBiasState::new(1, 0.0, 1.5));
        assert_ne!(other.to_key(), key);

        let mut other = base.clone();
        other.topology(PrimitiveTopology::LineList);
        assert_ne!(other.to_key(), key);
    }

    #[test]
    fn blend_modes_are_distinct() {
        let modes = [
            None,
            Some(AttachmentBlend::alpha()),
            Some(AttachmentBlend::premultiplied_alpha()),
            Some(AttachmentBlend::additive()),
        ];
        let keys: Vec<_> = modes
            .into_iter()
            .map(|blend| {
                let mut description = PipelineStateDescription::default();
                description.shader(shader(1)).blend(blend);
                description.to_key()
            })
            .collect();

        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }

        let premultiplied = AttachmentBlend::premultiplied_alpha();
        assert_eq!(premultiplied.src_color_blend_factor, BlendFactor::One);
        assert_eq!(premultiplied.dst_color_blend_factor, BlendFactor::OneMinusSrcAlpha);
    }

    #[test]
    fn key_does_not_alias_builder() {
        let mut builder = PipelineStateDescription::default();
        builder.shader(shader(1));
        let key = builder.to_key();

        builder.shader(shader(2)).topology(PrimitiveTopology::PointList);

        assert_eq!(key.description().shader, Some(shader(1)));
        assert_eq!(key.description().topology, PrimitiveTopology::TriangleList);
        assert_eq!(key.structural_hash(), key.description().structural_hash());
    }

    #[test]
    fn colliding_hashes_compare_descriptions() {
        let mut a = PipelineStateDescription::default();
        a.shader(shader(1));
        let mut b = PipelineStateDescription::default();
        b.shader(shader(2));

        // Forge a collision: keys with the same hash must still tell the descriptions apart.
        let forged_a = HashedPipelineKey {
            hash: 42,
            description: Arc::new(a.clone()),
        };
        let forged_b = HashedPipelineKey {
            hash: 42,
            description: Arc::new(b),
        };
        let forged_a2 = HashedPipelineKey {
            hash: 42,
            description: Arc::new(a),
        };

        assert_ne!(forged_a, forged_b);
        assert_eq!(forged_a, forged_a2);
    }

    #[test]
    fn set_defaults_resets_builder() {
        let mut description = PipelineStateDescription::default();
        let pristine = description.clone();

        description
            .shader(shader(3))
            .output([Format::B8G8R8A8Unorm, Format::R16G16B16A16Float], Format::D24UnormS8Uint, 4)
            .vertex_input([VertexInputElement {
                semantic_index: 0,
                format: Format::R32G32B32Float,
                binding: 0,
                offset: 0,
                input_rate: VertexInputRate::Vertex,
            }]);
        assert_eq!(description.color_blend.attachments.len(), 2);

        description.set_defaults();
        assert_eq!(description, pristine);
    }
}
