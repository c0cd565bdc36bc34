//! Render driver binary: load a scene, run the configured integrator to its
//! sample target segment by segment, checkpointing between segments, and
//! write the outputs.
//!
//! Exit codes: 0 on success, 1 on scene load failure, 2 when the render was
//! aborted.

// std
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
// others
use anyhow::Context;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;
// lumen
use rs_lumen::core::error::RenderError;
use rs_lumen::core::film::Film;
use rs_lumen::integrators::Integrator;
use rs_lumen::renderer::thread_pool::{ideal_thread_count, ThreadPool};
use rs_lumen::scene::{SceneDescription, TraceableScene};

#[derive(Debug, StructOpt)]
#[structopt(name = "lumen", about = "Offline physically based renderer")]
struct Args {
    /// Scene description file (JSON)
    #[structopt(long, parse(from_os_str))]
    scene: PathBuf,
    /// Override the scene's target samples per pixel
    #[structopt(long)]
    spp: Option<u32>,
    /// Worker thread count (defaults to the hardware concurrency)
    #[structopt(long)]
    threads: Option<u32>,
    /// Resume from the scene's checkpoint file
    #[structopt(long)]
    resume: bool,
    /// Override the output file stem
    #[structopt(long, parse(from_os_str))]
    output: Option<PathBuf>,
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut description = match SceneDescription::from_file(&args.scene) {
        Ok(description) => description,
        Err(e) => {
            tracing::error!(error = %e, "scene load failed");
            process::exit(1);
        }
    };
    if let Some(spp) = args.spp {
        description.renderer.spp = spp;
    }
    if let Some(output) = &args.output {
        description.renderer.output_file = output.to_string_lossy().into_owned();
    }

    let base_dir = args
        .scene
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let scene = match TraceableScene::prepare_for_render(&description, &base_dir) {
        Ok(scene) => Arc::new(scene),
        Err(e) => {
            tracing::error!(error = %e, "scene preparation failed");
            process::exit(1);
        }
    };

    let threads = args.threads.unwrap_or_else(ideal_thread_count);
    let pool = Arc::new(ThreadPool::new(threads));
    let (w, h) = scene.cam().resolution();
    let film = Arc::new(Film::new(w, h));
    let renderer_settings = scene.renderer_settings().clone();
    let output_base = PathBuf::from(&renderer_settings.output_file);
    let checkpoint_path = output_base.with_extension("state");

    let mut integrator = Integrator::from_settings(&description.integrator);
    integrator.prepare_for_render(scene.clone(), film.clone(), pool.clone(), 0xBA5E);

    if args.resume {
        if !integrator.supports_resume() {
            tracing::error!("the configured integrator does not support resuming");
            process::exit(1);
        }
        let file = File::open(&checkpoint_path)
            .with_context(|| format!("opening checkpoint {:?}", checkpoint_path))?;
        match integrator.load_state(&mut BufReader::new(file)) {
            Ok(()) => tracing::info!(spp = integrator.current_spp(), "resumed from checkpoint"),
            Err(e @ RenderError::CheckpointMismatch(_)) => {
                tracing::error!(error = %e, "refusing to resume");
                process::exit(1);
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        threads,
        width = w,
        height = h,
        target_spp = renderer_settings.spp,
        "starting render"
    );

    while !integrator.done() {
        integrator.start_render();
        integrator.wait_for_completion();
        tracing::info!(spp = integrator.current_spp(), "segment finished");

        if renderer_settings.checkpoint && integrator.supports_resume() {
            let file = File::create(&checkpoint_path)
                .with_context(|| format!("creating checkpoint {:?}", checkpoint_path))?;
            integrator.save_state(&mut BufWriter::new(file))?;
        }
        film.save_outputs(
            &output_base,
            renderer_settings.tonemap,
            renderer_settings.hdr_output,
        )?;
    }

    if renderer_settings.save_variance {
        if let Integrator::PathTracer(i) = &integrator {
            i.save_variance(&output_base.with_extension("variance.png"))?;
        }
    }
    if renderer_settings.aux_outputs {
        let (albedo, normal) = film.aux_rasters();
        let (w, h) = film.resolution();
        rs_lumen::core::film::write_ldr(
            &output_base.with_extension("albedo.png"),
            w,
            h,
            &albedo,
            rs_lumen::core::film::Tonemap::Linear,
        )?;
        rs_lumen::core::film::write_ldr(
            &output_base.with_extension("normal.png"),
            w,
            h,
            &normal,
            rs_lumen::core::film::Tonemap::Linear,
        )?;
    }
    save_auxiliary_outputs(&integrator, &output_base, integrator.current_spp())?;
    integrator.teardown_after_render();
    pool.stop();

    tracing::info!("render complete");
    Ok(())
}

fn save_auxiliary_outputs(
    integrator: &Integrator,
    output_base: &std::path::Path,
    spp: u32,
) -> std::io::Result<()> {
    let pyramid = match integrator {
        Integrator::Bdpt(i) => i.pyramid(),
        Integrator::MultiplexedMlt(i) => i.pyramid(),
        Integrator::ReversibleJumpMlt(i) => i.pyramid(),
        _ => None,
    };
    if let Some(pyramid) = pyramid {
        pyramid.save_buffers(output_base, spp)?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::from_args();
    match run(args) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "render aborted");
            process::exit(2);
        }
    }
}
