use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{error, info, warn, LevelFilter};
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyboardInput, StartCause, VirtualKeyCode, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::{Window, WindowBuilder},
};

use n3dscap::render::compose::Layout;
use n3dscap::{
    AudioSink, CaptureSession, ConfigHandle, DeviceProfile, PipelineConfig, PipelineStats,
    PresentState, RenderCoordinator, ScaleFactor, SyncBuffer, UsbTransport,
};
use n3dscap_render::{CpalSink, State};

const TICK: Duration = Duration::from_micros(8_333);
const TITLE_INTERVAL: Duration = Duration::from_secs(1);
const VOLUME_STEP: i16 = 5;

const KEYS: &str = "\
Keyboard shortcuts:
  1 / 2 / 3      scale 1x / 1.5x / 2x
  C              toggle DS crop
  M              toggle mute
  Up / + , Down / -   volume up / down by 5
  R              reconnect after the device was unplugged
  Esc            quit";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scale {
    #[value(name = "1")]
    One,
    #[value(name = "1.5")]
    OneAndHalf,
    #[value(name = "2")]
    Two,
}

impl From<Scale> for ScaleFactor {
    fn from(scale: Scale) -> Self {
        match scale {
            Scale::One => ScaleFactor::One,
            Scale::OneAndHalf => ScaleFactor::OneAndHalf,
            Scale::Two => ScaleFactor::Two,
        }
    }
}

/// Live viewer for the N3DS USB capture board
#[derive(Parser, Debug)]
#[command(name = "n3dscap", version, about)]
struct Args {
    /// Log verbosity, RUST_LOG overrides it
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Print information about the attached capture board and exit
    #[arg(long)]
    device_info: bool,

    /// Print the keyboard shortcuts and exit
    #[arg(long)]
    keys: bool,

    /// Initial window scale
    #[arg(long, value_enum, default_value = "1")]
    scale: Scale,

    /// Start with the DS crop enabled
    #[arg(long)]
    crop: bool,

    /// Initial volume, 0 to 100
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: u8,
}

/// Either the real output device or nothing, when there is no audio device.
enum Speaker {
    Device(CpalSink),
    Silent,
}

impl AudioSink for Speaker {
    fn write(&mut self, samples: &[i16], sample_count: usize) {
        if let Speaker::Device(sink) = self {
            sink.write(samples, sample_count);
        }
    }

    fn flush(&mut self) {
        if let Speaker::Device(sink) = self {
            sink.flush();
        }
    }
}

/// One connection to the board.
struct Capture {
    session: CaptureSession,
    sync: Arc<SyncBuffer>,
}

impl Capture {
    fn connect(profile: &DeviceProfile) -> n3dscap::Result<Self> {
        let transport = UsbTransport::open(profile)?;
        info!("connected:\n{}", transport.info());

        let sync = Arc::new(SyncBuffer::new());
        let session = CaptureSession::start(
            Box::new(transport),
            profile.clone(),
            Arc::clone(&sync),
            Arc::new(PipelineStats::default()),
        )?;
        Ok(Self { session, sync })
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level.into())
        .parse_default_env()
        .init();

    if args.keys {
        println!("{}", KEYS);
        return;
    }

    let profile = DeviceProfile::n3ds();

    if args.device_info {
        match UsbTransport::open(&profile) {
            Ok(transport) => println!("{}", transport.info()),
            Err(err) => {
                error!("{}", err);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(err) = run(args, profile) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run(args: Args, profile: DeviceProfile) -> Result<(), Box<dyn Error>> {
    let config = ConfigHandle::new(PipelineConfig {
        scale: args.scale.into(),
        crop: args.crop,
        volume: args.volume,
        muted: false,
    });

    let first = Capture::connect(&profile)?;
    let sync = Arc::clone(&first.sync);
    let mut capture = Some(first);

    let initial = config.snapshot();
    let (width, height) = Layout::stacked(&profile.screens, initial.crop).scaled_size(initial.scale);

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("n3dscap")
        .with_inner_size(PhysicalSize::new(width, height))
        .build(&event_loop)?;

    // SAFETY: the state is dropped on LoopDestroyed, before the window
    let state = unsafe { State::new_blocking(&window, width, height)? };

    let speaker = match CpalSink::new(profile.audio.sample_rate, profile.audio.channels) {
        Ok(sink) => Speaker::Device(sink),
        Err(err) => {
            warn!("continuing without audio: {}", err);
            Speaker::Silent
        }
    };

    let mut coordinator = Some(RenderCoordinator::new(
        state,
        speaker,
        config.clone(),
        profile.screens.clone(),
        sync,
    ));

    let mut next_tick = Instant::now();
    let mut next_title = Instant::now() + TITLE_INTERVAL;
    let mut window_size = (width, height);

    event_loop.run(move |event, _, control_flow| {
        let coord = match coordinator.as_mut() {
            Some(coord) => coord,
            None => {
                *control_flow = ControlFlow::Exit;
                return;
            }
        };

        match event {
            Event::NewEvents(StartCause::Init) => {
                next_tick = Instant::now();
                *control_flow = ControlFlow::WaitUntil(next_tick);
            }
            Event::WindowEvent { event, window_id } if window_id == window.id() => match event {
                WindowEvent::CloseRequested => *control_flow = ControlFlow::Exit,
                WindowEvent::Resized(size) => {
                    let state = coord.renderer_mut();
                    state.resize(size.width, size.height);
                    state.redraw();
                }
                WindowEvent::ScaleFactorChanged { new_inner_size, .. } => {
                    let state = coord.renderer_mut();
                    state.resize(new_inner_size.width, new_inner_size.height);
                    state.redraw();
                }
                WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            state: ElementState::Pressed,
                            virtual_keycode: Some(key),
                            ..
                        },
                    ..
                } => {
                    if key == VirtualKeyCode::Escape {
                        *control_flow = ControlFlow::Exit;
                    } else if key == VirtualKeyCode::R {
                        if coord.state() == PresentState::Disconnected {
                            capture = None;
                            match Capture::connect(&profile) {
                                Ok(fresh) => {
                                    coord.attach(Arc::clone(&fresh.sync));
                                    capture = Some(fresh);
                                }
                                Err(err) => warn!("reconnect failed: {}", err),
                            }
                        }
                    } else {
                        handle_key(&config, key);
                    }
                }
                _ => {}
            },
            // the coordinator only presents changed images
            Event::RedrawRequested(window_id) if window_id == window.id() => {
                coord.renderer_mut().redraw();
            }
            Event::MainEventsCleared => {
                let now = Instant::now();
                if now >= next_tick {
                    coord.tick();
                    next_tick += TICK;
                    // fell far behind, e.g. while the window was being dragged
                    if next_tick < now {
                        next_tick = now + TICK;
                    }

                    let size = coord.output_size();
                    if size != window_size && size != (0, 0) {
                        window_size = size;
                        window.set_inner_size(PhysicalSize::new(size.0, size.1));
                    }
                }

                if now >= next_title {
                    next_title = now + TITLE_INTERVAL;
                    update_title(&window, coord);
                }

                if *control_flow != ControlFlow::Exit {
                    *control_flow = ControlFlow::WaitUntil(next_tick);
                }
            }
            Event::LoopDestroyed => {
                if let Some(mut capture) = capture.take() {
                    capture.session.stop();
                }
                coordinator = None;
                info!("bye");
            }
            _ => {}
        }
    })
}

fn handle_key(config: &ConfigHandle, key: VirtualKeyCode) {
    let updated = match key {
        VirtualKeyCode::Key1 | VirtualKeyCode::Numpad1 => config.set_scale(ScaleFactor::One),
        VirtualKeyCode::Key2 | VirtualKeyCode::Numpad2 => {
            config.set_scale(ScaleFactor::OneAndHalf)
        }
        VirtualKeyCode::Key3 | VirtualKeyCode::Numpad3 => config.set_scale(ScaleFactor::Two),
        VirtualKeyCode::C => config.toggle_crop(),
        VirtualKeyCode::M => config.toggle_mute(),
        VirtualKeyCode::Up
        | VirtualKeyCode::Plus
        | VirtualKeyCode::Equals
        | VirtualKeyCode::NumpadAdd => config.adjust_volume(VOLUME_STEP),
        VirtualKeyCode::Down | VirtualKeyCode::Minus | VirtualKeyCode::NumpadSubtract => {
            config.adjust_volume(-VOLUME_STEP)
        }
        _ => return,
    };
    info!(
        "scale {:?}, crop {}, volume {}{}",
        updated.scale,
        updated.crop,
        updated.volume,
        if updated.muted { " (muted)" } else { "" }
    );
}

fn update_title<R, A>(window: &Window, coord: &RenderCoordinator<R, A>)
where
    R: n3dscap::Renderer,
    A: AudioSink,
{
    let config = coord.config().snapshot();
    let title = match coord.state() {
        PresentState::Disconnected => "n3dscap - disconnected, press R to reconnect".to_string(),
        PresentState::Live => {
            let volume = if config.muted {
                "muted".to_string()
            } else {
                format!("vol {}", config.volume)
            };
            format!("n3dscap - {:.1} fps - {}", coord.fps(), volume)
        }
    };
    window.set_title(&title);
}
