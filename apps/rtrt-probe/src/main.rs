//! rtrt GPU context probe.
//!
//! Builds the full presentation context against a real window, logs every
//! enumeration and selection, then idles until the window is closed.

use anyhow::{bail, Context as _};
use ash::vk;
use rtrt_gpu::{ContextConfig, GpuContext, GpuContextBuilder, ImageCountPolicy, PresentationTarget};
use rtrt_platform::{init_logging, PlatformConfig, PlatformError, PlatformWindow};
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
/// Guide data per pixel: packed normal and depth as one vec4.
const GUIDE_BYTES_PER_PIXEL: u64 = 16;

/// Parsed command line.
#[derive(Debug, Clone)]
struct ProbeArgs {
    gpu: ContextConfig,
    window: PlatformConfig,
    overlay: bool,
    denoise_shader: Option<PathBuf>,
    help: bool,
}

fn parse_args<I>(args: I) -> anyhow::Result<ProbeArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut gpu = ContextConfig::new("rtrt-probe");
    let mut window = PlatformConfig {
        title: "rtrt probe".to_string(),
        ..PlatformConfig::default()
    }
    .with_size(WIDTH, HEIGHT);
    let mut overlay = false;
    let mut denoise_shader = None;
    let mut help = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--api-dump" => gpu = gpu.with_api_dump(true),
            "--validation" => gpu = gpu.with_validation(true),
            "--no-validation" => gpu = gpu.with_validation(false),
            "--strict-image-count" => gpu = gpu.with_image_count_policy(ImageCountPolicy::Strict),
            "--fifo" => gpu = gpu.with_mailbox(false),
            "--integrated" => gpu = gpu.with_device_type(vk::PhysicalDeviceType::INTEGRATED_GPU),
            "--no-ray-tracing" => {
                gpu = gpu.with_device_extensions(vec![ash::khr::swapchain::NAME]);
            }
            "--overlay" => overlay = true,
            "--denoise-shader" => {
                let path = args.next().with_context(|| format!("{arg} needs a path"))?;
                denoise_shader = Some(PathBuf::from(path));
            }
            "--width" => window.width = parse_value(&arg, args.next())?,
            "--height" => window.height = parse_value(&arg, args.next())?,
            "-h" | "--help" => help = true,
            other => bail!("Unknown argument '{other}' (see --help)"),
        }
    }

    if window.width == 0 || window.height == 0 {
        bail!("Window size must be non-zero");
    }

    Ok(ProbeArgs {
        gpu,
        window,
        overlay,
        denoise_shader,
        help,
    })
}

fn parse_value(flag: &str, value: Option<String>) -> anyhow::Result<u32> {
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .with_context(|| format!("Invalid value '{value}' for {flag}"))
}

fn print_help() {
    eprintln!(
        "rtrt GPU context probe

USAGE:
    cargo run -p rtrt-probe -- [OPTIONS]

GPU OPTIONS:
    --validation            Enable the Khronos validation layer (default in debug builds)
    --no-validation         Disable the validation layer
    --api-dump              Prepend the LunarG API dump layer
    --strict-image-count    Fail if the swapchain does not resolve 3 images
    --fifo                  Use FIFO presentation even if MAILBOX is available
    --integrated            Require an integrated GPU instead of a discrete one
    --no-ray-tracing        Only require the swapchain device extension

OPTIONAL RESOURCES:
    --overlay               Reserve the UI overlay descriptor pool
    --denoise-shader <SPV>  Build the denoise compute pass from a SPIR-V file

WINDOW OPTIONS:
    --width <N>             Window width (default: {WIDTH})
    --height <N>            Window height (default: {HEIGHT})

OTHER:
    -h, --help              Print this help message

Set RUST_LOG=debug to see every enumerated layer, extension and format."
    );
}

/// Event loop state. `gpu` is declared first so it drops before the window.
struct Probe {
    gpu: Option<GpuContext>,
    window: Option<PlatformWindow>,
    args: ProbeArgs,
    failure: Option<anyhow::Error>,
}

impl Probe {
    fn new(args: ProbeArgs) -> Self {
        Self {
            gpu: None,
            window: None,
            args,
            failure: None,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let window = PlatformWindow::create(event_loop, &self.args.window)?;
        let mut gpu = GpuContextBuilder::new(self.args.gpu.clone()).build(&window)?;

        if let Some(path) = &self.args.denoise_shader {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let code = ash::util::read_spv(&mut Cursor::new(bytes))
                .with_context(|| format!("{} is not valid SPIR-V", path.display()))?;
            let (width, height) = window.framebuffer_size();
            let guide_size = u64::from(width) * u64::from(height) * GUIDE_BYTES_PER_PIXEL;
            gpu.attach_denoise(&code, guide_size)?;
        }
        if self.args.overlay {
            gpu.attach_overlay()?;
        }

        report(&gpu)?;
        self.window = Some(window);
        self.gpu = Some(gpu);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.gpu = None;
        self.failure = Some(e);
        event_loop.exit();
    }
}

fn report(gpu: &GpuContext) -> anyhow::Result<()> {
    let swapchain = gpu.swapchain()?;
    let extent = swapchain.extent();
    info!(
        "Context ready: {}x{}, {} image(s), {:?}, {:?}, state {:?}",
        extent.width,
        extent.height,
        swapchain.image_count(),
        swapchain.format().format,
        swapchain.present_mode(),
        gpu.swapchain_state()
    );
    info!("Device features: {}", gpu.device()?.features().summary());
    let guide_bytes = gpu
        .denoise()
        .and_then(|pass| pass.guide_buffer())
        .map_or(0, |buffer| buffer.size());
    info!(
        "Overlay: {}, denoise pass: {} ({guide_bytes} byte guide), {} live resource(s)",
        gpu.overlay().is_some(),
        gpu.denoise().is_some(),
        gpu.ledger().live_count()
    );
    Ok(())
}

impl ApplicationHandler for Probe {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.gpu.is_some() || self.failure.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e.context("GPU context setup failed"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.gpu = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                let Some(gpu) = &mut self.gpu else {
                    return;
                };
                // Platforms report the initial size as a resize too.
                let unchanged = gpu.swapchain().is_ok_and(|s| {
                    let extent = s.extent();
                    extent.width == size.width && extent.height == size.height
                });
                if unchanged {
                    return;
                }
                if let Err(e) = gpu.recreate_sized_resources(size.width, size.height) {
                    self.fail(event_loop, anyhow::Error::new(e).context("Window resize"));
                }
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    init_logging("info")?;
    info!("rtrt probe starting");

    let event_loop = EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut probe = Probe::new(args);
    event_loop
        .run_app(&mut probe)
        .map_err(|e| PlatformError::EventLoop(e.to_string()))?;

    match probe.failure.take() {
        Some(e) => Err(e),
        None => {
            info!("Shut down cleanly");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<ProbeArgs> {
        parse_args(list.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn defaults() {
        let parsed = args(&[]).unwrap();
        assert!(!parsed.help);
        assert_eq!(parsed.gpu.app_name, "rtrt-probe");
        assert_eq!(parsed.gpu.device_type, vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(parsed.gpu.image_count_policy, ImageCountPolicy::Warn);
        assert_eq!((parsed.window.width, parsed.window.height), (WIDTH, HEIGHT));
    }

    #[test]
    fn gpu_flags_map_onto_config() {
        let parsed = args(&[
            "--api-dump",
            "--no-validation",
            "--strict-image-count",
            "--fifo",
            "--integrated",
            "--no-ray-tracing",
        ])
        .unwrap();
        assert!(parsed.gpu.api_dump);
        assert!(!parsed.gpu.validation);
        assert_eq!(parsed.gpu.image_count_policy, ImageCountPolicy::Strict);
        assert!(!parsed.gpu.prefer_mailbox);
        assert_eq!(parsed.gpu.device_type, vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(parsed.gpu.required_device_extensions, vec![ash::khr::swapchain::NAME]);
    }

    #[test]
    fn later_validation_flag_wins() {
        assert!(args(&["--no-validation", "--validation"]).unwrap().gpu.validation);
    }

    #[test]
    fn window_size() {
        let parsed = args(&["--width", "800", "--height", "600"]).unwrap();
        assert_eq!((parsed.window.width, parsed.window.height), (800, 600));
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(args(&["--width"]).is_err());
        assert!(args(&["--width", "wide"]).is_err());
        assert!(args(&["--height", "0"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }

    #[test]
    fn optional_resources() {
        let parsed = args(&["--overlay", "--denoise-shader", "denoise.spv"]).unwrap();
        assert!(parsed.overlay);
        assert_eq!(parsed.denoise_shader, Some(PathBuf::from("denoise.spv")));
        assert!(args(&["--denoise-shader"]).is_err());
        assert!(!args(&[]).unwrap().overlay);
    }

    #[test]
    fn help() {
        assert!(args(&["-h"]).unwrap().help);
        assert!(args(&["--help"]).unwrap().help);
    }
}
