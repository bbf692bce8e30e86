//! Purpose: Shared library crate used by the `portload` CLI, gateway, and tests.
//! Exports: `api` (stable surface), `core` (pipeline stages, port storage, errors).
//! Role: Library backing the binary; `api` is the supported entry point.
//! Invariants: Pipeline stages communicate only through owned values and channels.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
mod json;
