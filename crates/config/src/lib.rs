// Configuration loading

pub mod sandbox;

pub use sandbox::SandboxSettings;
