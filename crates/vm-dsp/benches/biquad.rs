use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vm_dsp::biquad::{BiquadCoeffs, Cascade6, CASCADE_SECTIONS};
use vm_dsp::morph::{MorphParams, SpectralMorphFilter};
use vm_dsp::pole::Pole;
use vm_dsp::MonoProcessor;

fn bench_cascade(c: &mut Criterion) {
    let mut cascade = Cascade6::new();
    let coeffs = [BiquadCoeffs::from_pole(Pole::new(0.98, 0.6)); CASCADE_SECTIONS];
    cascade.set_coeffs(&coeffs);

    let input: Vec<f64> = (0..512).map(|i| (i as f64 * 0.01).sin()).collect();

    c.bench_function("cascade6_block_512", |b| {
        b.iter(|| {
            let mut buf = input.clone();
            cascade.process_block(black_box(&mut buf));
            buf
        })
    });
}

fn bench_morph_block(c: &mut Criterion) {
    let mut filter = SpectralMorphFilter::new(48000.0);
    filter.set_params(&MorphParams {
        intensity: 0.7,
        drive_db: 3.0,
        saturation: 0.2,
        ..MorphParams::default()
    });
    filter.snap_params();

    let input: Vec<f64> = (0..512).map(|i| (i as f64 * 0.01).sin()).collect();

    c.bench_function("morph_linear_nonlinear_512", |b| {
        b.iter(|| {
            let mut left = input.clone();
            let mut right = input.clone();
            filter.process_linear(black_box(&mut left), black_box(&mut right));
            filter.process_nonlinear(black_box(&mut left), black_box(&mut right));
            (left, right)
        })
    });
}

criterion_group!(benches, bench_cascade, bench_morph_block);
criterion_main!(benches);
