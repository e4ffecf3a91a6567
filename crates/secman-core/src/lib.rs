//! Core library for `secman`.
//!
//! Contains the encryption barrier, Shamir unseal, prefix-scoped logical
//! storage, per-engine routing, the auth and IAM subsystems, root tokens,
//! and the built-in secret and auth engines. This crate depends on
//! `secman-storage` for the physical backend trait and knows nothing about
//! HTTP.

pub mod auth;
pub mod backend;
pub mod backend_router;
pub mod barrier;
pub mod core;
pub mod core_repository;
pub mod crypto;
pub mod engines;
pub mod error;
pub mod iam;
pub mod logical_router;
pub mod logical_storage;
pub mod radix;
pub mod root_token;

pub use crate::core::{Core, CoreStatus, InitResult, TOKEN_HEADER, UnsealStatus};
