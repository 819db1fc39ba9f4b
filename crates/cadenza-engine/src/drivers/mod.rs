//! Backend driver implementations registered with the driver registry.

#[cfg(feature = "cpal-driver")]
pub mod cpal_pcm;

#[cfg(feature = "midir-driver")]
pub mod midir_input;
