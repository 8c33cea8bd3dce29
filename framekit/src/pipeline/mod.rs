// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Describing pipeline state and resolving it to pipeline objects.
//!
//! A pipeline object binds compiled shader stages together with the fixed-function state of the
//! GPU (blending, rasterization, depth and stencil tests, vertex input, render target formats).
//! Creating one is expensive and may involve the driver compiling code, binding one is cheap.
//!
//! Renderers describe the state they need with a [`PipelineStateDescription`] and resolve it
//! against the device's [`PipelineCache`], which guarantees that each distinct description is
//! constructed only once.

pub use self::{
    cache::{
        ConcurrentConstruction, ConstructionMode, ConstructionPolicy, PipelineCache,
        PipelineCacheCreateInfo, PipelineCacheError, PipelineCacheStats, PipelineState,
        SerializedConstruction,
    },
    description::{
        AttachmentBlend, BlendFactor, BlendOp, ColorBlendAttachmentState, ColorBlendState,
        CompareOp, CullMode, DepthBiasState, DepthStencilState, Format, FrontFace,
        HashedPipelineKey, PipelineStateDescription, PolygonMode, PrimitiveTopology,
        RasterizationState, RenderOutputDescription, ShaderRef, StencilOp, StencilOpState,
        StencilState, VertexInputElement, VertexInputRate,
    },
};

pub mod cache;
pub mod description;
