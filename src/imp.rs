// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Concrete [crate::backend::Backend] pieces.

pub mod headless;

#[cfg(all(feature = "backend_wgpu", not(target_arch = "wasm32")))]
pub mod wgpu;
