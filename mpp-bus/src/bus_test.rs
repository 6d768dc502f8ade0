use std::io::Cursor;
use std::sync::Mutex;

use super::*;
use crate::device::loopback::LoopbackBackend;
use crate::filter::DomainCopy;
use crate::frame::{FrameInfo, MemoryDomain, PixelFormat};
use crate::io::{FileWriter, QueuedAudio, RawFileReader};
use crate::timestamp::Rational;

fn info() -> FrameInfo {
    FrameInfo::new(4, 2, PixelFormat::Nv12)
}

fn reader(frames: u8) -> Box<dyn Reader> {
    let bytes: Vec<u8> = (0..frames)
        .flat_map(|i| vec![i; info().frame_size()])
        .collect();
    Box::new(RawFileReader::frames(
        Cursor::new(bytes),
        info(),
        Rational::new(25, 1),
    ))
}

fn writer() -> SharedWriter {
    Arc::new(Mutex::new(FileWriter::new(Vec::<u8>::new())))
}

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .output_depth(0)
        .poll_interval_us(0)
        .add_trim(0, 100)
        .build()
}

#[test]
fn test_builds_stages_in_order() -> anyhow::Result<()> {
    let pipeline = Pipeline::builder(config())
        .backend(Arc::new(LoopbackBackend::new()))
        .reader(reader(2))
        .writer(writer())
        .decode(CodingFormat::RawVideo)
        .filter(Box::new(DomainCopy::new(MemoryDomain::Native, MemoryDomain::Native)))
        .audio(Box::new(QueuedAudio::new(Rational::MILLISECONDS, Vec::new())))
        .encode(CodingFormat::RawVideo)
        .build()?;

    let names: Vec<_> = pipeline
        .driver()
        .stages()
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(
        names,
        vec!["input", "decode", "trim", "copy Native->Native", "check-pts", "audio", "encode"]
    );

    let plans = pipeline.plans();
    assert_eq!(plans.len(), 2);
    assert_eq!((plans[0].producer, plans[0].consumer), (1, Some(3)));
    assert_eq!((plans[1].producer, plans[1].consumer), (3, Some(6)));
    Ok(())
}

#[test]
fn test_raw_input_without_codecs() -> anyhow::Result<()> {
    let pipeline = Pipeline::builder(PipelineConfig::default())
        .reader(reader(1))
        .writer(writer())
        .build()?;
    let stages = pipeline.driver().stages();
    assert_eq!(stages.len(), 2);
    assert_eq!(pipeline.plans()[0].consumer, None);
    assert_eq!(stages[0].pools().len(), 1);
    Ok(())
}

#[test]
fn test_rejects_incomplete_setups() {
    let err = Pipeline::builder(config())
        .writer(writer())
        .build()
        .err()
        .expect("no reader");
    assert!(matches!(err, PipelineError::Config(_)));

    let err = Pipeline::builder(config())
        .reader(reader(1))
        .writer(writer())
        .encode(CodingFormat::H264)
        .build()
        .err()
        .expect("no backend");
    assert!(matches!(err, PipelineError::Config(_)));

    let err = Pipeline::builder(config())
        .backend(Arc::new(LoopbackBackend::new()))
        .reader(reader(1))
        .writer(writer())
        .encode(CodingFormat::H264)
        .build()
        .err()
        .expect("loopback cannot encode h264");
    assert!(matches!(err, PipelineError::Unsupported(_)));

    let bad = PipelineConfig::builder().frame_rate(Rational::new(0, 1)).build();
    let err = Pipeline::builder(bad)
        .reader(reader(1))
        .writer(writer())
        .build()
        .err()
        .expect("zero frame rate");
    assert!(matches!(err, PipelineError::Config(_)));
}
