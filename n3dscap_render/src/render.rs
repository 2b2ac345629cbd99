use futures::executor;
use log::{error, info, warn};
use n3dscap::Renderer;
use simple_error::SimpleError;

use crate::screen::FrameQuad;

const BACKGROUND: wgpu::Color = wgpu::Color::BLACK;
const DISCONNECTED: wgpu::Color = wgpu::Color {
    r: 0.25,
    g: 0.05,
    b: 0.05,
    a: 1.0,
};

/// Draws the composed capture image into a window surface.
pub struct State {
    surface: wgpu::Surface,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    quad: FrameQuad,
    disconnected: bool,
}

impl State {
    /// Creating some of the wgpu types requires async code; see
    /// [`State::new_blocking`] for callers without an executor.
    ///
    /// # Safety
    ///
    /// The surface borrows the window's native handles: `window` must outlive
    /// the returned `State`.
    pub async unsafe fn new<
        W: raw_window_handle::HasRawWindowHandle + raw_window_handle::HasRawDisplayHandle,
    >(
        window: &W,
        width: u32,
        height: u32,
    ) -> Result<Self, SimpleError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| SimpleError::new(format!("could not create surface: {}", e)))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| SimpleError::new("no graphics adapter available"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    features: wgpu::Features::empty(),
                    limits: wgpu::Limits::default(),
                    label: None,
                },
                None,
            )
            .await
            .map_err(|e| SimpleError::new(format!("could not open graphics device: {}", e)))?;

        let surface_caps = surface.get_capabilities(&adapter);
        // the texture is sRGB, so is the surface when possible
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| SimpleError::new("surface supports no formats"))?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        info!(
            "renderer using {} ({:?})",
            adapter.get_info().name,
            adapter.get_info().backend
        );

        let quad = FrameQuad::new(&device, surface_format);

        Ok(Self {
            surface,
            device,
            queue,
            config,
            quad,
            disconnected: false,
        })
    }

    /// # Safety
    ///
    /// Same contract as [`State::new`].
    pub unsafe fn new_blocking<
        W: raw_window_handle::HasRawWindowHandle + raw_window_handle::HasRawDisplayHandle,
    >(
        window: &W,
        width: u32,
        height: u32,
    ) -> Result<Self, SimpleError> {
        executor::block_on(Self::new(window, width, height))
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        self.quad
            .set_viewport(&self.queue, self.config.width, self.config.height);
    }

    pub fn size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    pub fn render(&self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;

        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });

        {
            let clear = if self.disconnected {
                DISCONNECTED
            } else {
                BACKGROUND
            };
            let _render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(clear),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
        }

        self.quad.render(&mut encoder, &view);

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }

    /// Renders, reconfiguring the surface once if it went stale.
    pub fn redraw(&mut self) {
        match self.render() {
            Ok(()) => {}
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                let (width, height) = self.size();
                self.resize(width, height);
                if let Err(e) = self.render() {
                    warn!("render after reconfigure failed: {:?}", e);
                }
            }
            Err(wgpu::SurfaceError::Timeout) => warn!("surface timed out"),
            Err(e) => error!("render failed: {:?}", e),
        }
    }
}

impl Renderer for State {
    fn present(&mut self, pixels: &[u8], width: u32, height: u32) {
        self.disconnected = false;
        self.quad
            .write_texture(&self.device, &self.queue, pixels, width, height);
        self.quad
            .set_viewport(&self.queue, self.config.width, self.config.height);
        self.redraw();
    }

    fn disconnected(&mut self) {
        self.disconnected = true;
        self.quad.clear();
        self.redraw();
    }
}
