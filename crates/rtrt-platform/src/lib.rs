//! Platform layer for the rtrt renderer.
//!
//! Owns the native window and hands it to the GPU context as a
//! [`PresentationTarget`]. Also installs the process-wide log subscriber.

use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use rtrt_gpu::PresentationTarget;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowAttributes};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Platform configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            title: "rtrt".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl PlatformConfig {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Window attributes for this configuration.
    pub fn window_attributes(&self) -> WindowAttributes {
        Window::default_attributes()
            .with_title(&self.title)
            .with_inner_size(PhysicalSize::new(self.width, self.height))
            .with_resizable(self.resizable)
    }
}

/// A winit window usable as a presentation target.
#[derive(Clone)]
pub struct PlatformWindow {
    window: Arc<Window>,
}

impl PlatformWindow {
    /// Open a window on a running event loop.
    pub fn create(event_loop: &ActiveEventLoop, config: &PlatformConfig) -> Result<Self> {
        let window = event_loop
            .create_window(config.window_attributes())
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;
        let size = window.inner_size();
        tracing::info!(
            "Window '{}' created ({}x{})",
            config.title,
            size.width,
            size.height
        );
        Ok(Self {
            window: Arc::new(window),
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl PresentationTarget for PlatformWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| PlatformError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::Size;

    #[test]
    fn attributes_follow_config() {
        let config = PlatformConfig {
            title: "probe".to_string(),
            resizable: false,
            ..PlatformConfig::default()
        }
        .with_size(640, 480);
        let attrs = config.window_attributes();
        assert_eq!(attrs.title, "probe");
        assert!(!attrs.resizable);
        assert_eq!(
            attrs.inner_size,
            Some(Size::Physical(PhysicalSize::new(640, 480)))
        );
    }

    #[test]
    fn second_logging_init_reports_error() {
        let _ = init_logging("info");
        assert!(matches!(init_logging("info"), Err(PlatformError::Logging(_))));
    }
}
