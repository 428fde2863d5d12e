//! tests/integration/mod.rs

mod experiments;
