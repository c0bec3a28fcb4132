use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grid_sampler::engine::{Engine, PositionInfo};
use grid_sampler::resample::ResampleQuality;
use grid_sampler::sample_buffer::SampleBuffer;

fn test_sample() -> SampleBuffer {
    let data: Vec<f32> = (0..96_000)
        .map(|i| (std::f32::consts::TAU * 220.0 * i as f32 / 48_000.0).sin() * 0.5)
        .collect();
    SampleBuffer::from_channels(vec![data], 48_000.0).unwrap()
}

pub fn sinc_read_bm(c: &mut Criterion) {
    let sample = test_sample();
    c.bench_function("sinc-16 fractional read", |b| {
        let mut position = 0.0_f64;
        b.iter(|| {
            position = (position + 1.003) % 96_000.0;
            ResampleQuality::Sinc16.read(black_box(&sample), 0, position)
        })
    });
}

pub fn block_render_bm(c: &mut Criterion) {
    let mut engine = Engine::new();
    engine.prepare_to_play(48_000.0, 512);
    for i in 0..4 {
        engine.strip(i).set_sample(test_sample());
    }
    for i in 0..4 {
        engine.trigger_strip_with_quantization(i, 0, false);
    }

    c.bench_function("engine 512-sample block, 4 strips", |b| {
        let mut ppq = 0.0;
        let mut left = vec![0.0_f32; 512];
        let mut right = vec![0.0_f32; 512];
        b.iter(|| {
            let position = PositionInfo {
                is_playing: true,
                ppq: Some(ppq),
                tempo: Some(120.0),
                time_signature: Some((4, 4)),
            };
            engine.process(&[], &[], &mut left, &mut right, &position);
            ppq += 512.0 * 2.0 / 48_000.0;
            black_box(left[0])
        })
    });
}

criterion_group!(benches, sinc_read_bm, block_render_bm);
criterion_main!(benches);
