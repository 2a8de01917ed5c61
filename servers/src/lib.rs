// Declare the modules to re-export
pub mod fake_sis;

// Re-export everything
pub use fake_sis::*;
