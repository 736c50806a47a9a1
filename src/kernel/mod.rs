// src/kernel/mod.rs
//! Architecture-neutral kernel services around the transition core.

pub mod driver;
pub mod logger;
pub mod trap;
