use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use vnctest::{
    classify::{Classifier, Histogram},
    frame::Screenshot,
};

fn noisy_frame(width: u32, height: u32) -> Screenshot {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let pixels = (0..width * height)
        .map(|_| [rng.gen_range(0..8) * 32, rng.gen(), 0x40, 0xff])
        .collect::<Vec<_>>();
    Screenshot::from_pixels(width, height, &pixels)
}

pub fn bench_histogram(c: &mut Criterion) {
    let frame = noisy_frame(1024, 768);
    let flat = Screenshot::filled(1024, 768, [0, 0, 0xaa, 0xff]);
    let classifier = Classifier::default();
    c.bench_function("Histogram 1024x768", |b| b.iter(|| Histogram::of(&frame)));
    c.bench_function("Classify flat 1024x768", |b| {
        b.iter(|| classifier.classify(&Histogram::of(&flat)))
    });
}

criterion_group!(benches, bench_histogram);
criterion_main!(benches);
