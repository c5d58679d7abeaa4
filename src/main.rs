//! Window and event loop driving the renderer.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use vulkanalia::vk;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use room_viewer_vk::config::Config;
use room_viewer_vk::renderer::Renderer;
use room_viewer_vk::scene::Scene;

fn main() {
    pretty_env_logger::init();

    if let Err(e) = run() {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let scene = Scene::from_args(std::env::args().skip(1))?;
    let config = Config::load();

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(config.window.title.as_str())
        .with_inner_size(LogicalSize::new(config.window.width, config.window.height))
        .build(&event_loop)?;

    let mut renderer = Some(unsafe { Renderer::new(&window, &config, scene)? });

    let failure = Rc::new(RefCell::new(None));
    let loop_failure = failure.clone();

    event_loop.run(move |event, target| match event {
        Event::AboutToWait => {
            window.request_redraw();
        }
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::RedrawRequested => {
                let Some(active) = renderer.as_mut() else {
                    return;
                };
                let PhysicalSize { width, height } = window.inner_size();
                if let Err(e) = unsafe { active.draw_frame(vk::Extent2D { width, height }) } {
                    renderer = None;
                    *loop_failure.borrow_mut() = Some(e);
                    target.exit();
                }
            }
            WindowEvent::Resized(_) => {
                if let Some(active) = renderer.as_mut() {
                    active.mark_resized();
                }
            }
            WindowEvent::CloseRequested => {
                if let Some(active) = renderer.take() {
                    if let Err(e) = active.wait_idle() {
                        log::warn!("Device wait idle failed on close: {}", e);
                    }
                }
                log::info!("Window closed");
                target.exit();
            }
            _ => {}
        },
        _ => {}
    })?;

    match failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
