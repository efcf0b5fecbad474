use std::sync::Arc;

use frame_bus::PixelFormat;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod media;

use config::{AppConfig, InputSettings};
use media::{
    pipe::Pipe,
    types::{InputConfig, PipeConfig},
};

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .filter_module("frame_bus", level)
        .init();
}

fn pipe_config(config: &AppConfig) -> anyhow::Result<PipeConfig> {
    let input = match &config.input {
        InputSettings::File {
            path,
            width,
            height,
            format,
        } => InputConfig::File {
            path: path.clone(),
            width: *width,
            height: *height,
            format: format.parse::<PixelFormat>()?,
        },
        InputSettings::TestPattern {
            width,
            height,
            frames,
        } => InputConfig::TestPattern {
            width: *width,
            height: *height,
            format: PixelFormat::Nv12,
            frames: *frames,
        },
    };

    let mut builder = PipeConfig::builder()
        .input(input)
        .pipeline(config.pipeline_config())
        .fps_overlay(config.fps_overlay)
        .realtime(config.realtime);
    if let Some(path) = &config.output_path {
        builder = builder.add_file_output(path.clone());
    }
    builder.build()
}

#[tokio::main]
async fn main() -> ! {
    let config = config::config();
    init_logging(config.log_level());

    let pipe = match pipe_config(config) {
        Ok(pipe_config) => Arc::new(Pipe::new(pipe_config)),
        Err(e) => {
            eprintln!("Error in pipe config: {:#}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    api::start_api_server(cancel_clone, config.api_addr.clone(), pipe.clone());

    let mut pipe_task = {
        let pipe = pipe.clone();
        tokio::spawn(async move { pipe.start().await })
    };
    let mut pipe_running = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                pipe.cancel();
                cancel.cancel();
            },
            finished = &mut pipe_task, if pipe_running => {
                pipe_running = false;
                if let Err(e) = finished {
                    log::error!("pipe task failed: {}", e);
                }
            },
        }
    }

    if pipe_running {
        // let the pipeline drain into its outputs before exiting
        if let Err(e) = pipe_task.await {
            log::error!("pipe task failed: {}", e);
        }
    }

    std::process::exit(0);
}
