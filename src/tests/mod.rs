//! tests/mod.rs
//! Pruebas del motor de difusión (solo se compilan con `cfg(test)`).

pub mod support;

mod sender_tests;
