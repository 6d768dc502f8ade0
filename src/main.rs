use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use anyhow::Context;
use mpp_bus::device::loopback::LoopbackBackend;
use mpp_bus::filter::iep::{IepWorker, SoftField};
use mpp_bus::io::{FileWriter, QueuedAudio, RawFileReader, Reader, TimecodeFile, shared_writer};
use mpp_bus::{Pipeline, RunStats};
use tokio_util::sync::CancellationToken;

mod config;

use config::{InputLayout, RunConfig};

/// Jobs the deinterlacer thread may hold.
const IEP_DEPTH: usize = 2;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn open_reader(run: &RunConfig) -> anyhow::Result<Box<dyn Reader>> {
    let file = File::open(&run.input)
        .with_context(|| format!("open input {}", run.input.display()))?;
    let file = BufReader::new(file);
    let reader: Box<dyn Reader> = match run.layout {
        InputLayout::Frames => Box::new(RawFileReader::frames(
            file,
            run.frame_info(),
            run.frame_rate,
        )),
        InputLayout::Packets => Box::new(RawFileReader::packets(
            file,
            run.frame_info(),
            run.frame_rate,
            run.time_base(),
        )),
    };
    Ok(reader)
}

fn create(path: &std::path::Path, what: &str) -> anyhow::Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("create {} {}", what, path.display()))?;
    Ok(BufWriter::new(file))
}

fn build_pipeline(run: &RunConfig) -> anyhow::Result<Pipeline> {
    let mut writer = FileWriter::new(create(&run.output, "output")?);
    let mut builder = Pipeline::builder(run.pipeline.clone())
        .backend(Arc::new(LoopbackBackend::new()))
        .reader(open_reader(run)?);

    if let Some(audio) = &run.audio {
        let pcm = std::fs::read(&audio.input)
            .with_context(|| format!("read audio {}", audio.input.display()))?;
        builder = builder.audio(Box::new(QueuedAudio::from_pcm(
            pcm.into(),
            audio.sample_rate,
            audio.bytes_per_sample_frame,
            audio.samples_per_packet,
        )));
        writer = writer.with_audio(create(&audio.output, "audio output")?);
    }
    builder = builder.writer(shared_writer(writer));

    if let Some(path) = &run.timecode {
        builder = builder.timecode(Box::new(TimecodeFile::new(create(path, "timecode file")?)));
    }
    if let Some(format) = run.decode {
        builder = builder.decode(format);
    }
    if let Some(mode) = run.deinterlace {
        let iep = IepWorker::spawn(SoftField::new(mode), IEP_DEPTH)?;
        builder = builder.filter(Box::new(iep));
    }
    if let Some(format) = run.encode {
        builder = builder.encode(format);
    }
    Ok(builder.build()?)
}

async fn run_until_done(mut pipeline: Pipeline) -> anyhow::Result<RunStats> {
    let cancel: CancellationToken = pipeline.cancel_token();
    let mut task = tokio::task::spawn_blocking(move || pipeline.run());

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, winding the pipeline down");
            cancel.cancel();
            task.await
        },
    };
    let stats = joined.context("pipeline thread panicked")??;
    Ok(stats)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let path = std::env::args()
        .nth(1)
        .context("usage: mpp-transcode <run.json>")?;
    let run = RunConfig::from_json_file(&path)?;
    log::info!(
        "transcoding {} -> {}",
        run.input.display(),
        run.output.display()
    );

    let pipeline = build_pipeline(&run).context("assemble pipeline")?;
    let stats = run_until_done(pipeline).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
