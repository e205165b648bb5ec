use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use realvoice_rs::archive;
use realvoice_rs::pattern::Pattern;
use realvoice_rs::{CachedClassifier, Classifier, ClassifyError, SentimentLabel, SentimentResult};
use tokio_util::sync::CancellationToken;

const OPINIONS: &[&str] = &[
    "I love this school",
    "I hate everything about this",
    "The library could stay open later on weekdays so we have somewhere quiet to study",
];

struct ConstantClassifier;

impl Classifier for ConstantClassifier {
    fn classify(
        &self,
        _opinion: &str,
        _cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError> {
        Ok(SentimentResult::new(SentimentLabel::Neutral, 0.5)?)
    }
}

fn bench_pattern_generation(c: &mut Criterion) {
    for &opinion in OPINIONS {
        c.bench_with_input(
            BenchmarkId::new("pattern_svg", opinion.len()),
            &opinion,
            |b, &opinion| {
                b.iter(|| black_box(Pattern::generate(opinion).to_svg()));
            },
        );
    }
}

fn bench_pattern_render(c: &mut Criterion) {
    let pattern = Pattern::generate(OPINIONS[0]);
    c.bench_function("pattern_render::card", |b| {
        b.iter(|| {
            black_box(archive::render(
                &pattern,
                archive::DEFAULT_WIDTH,
                archive::DEFAULT_HEIGHT,
            ))
        });
    });
}

fn bench_cache_hits(c: &mut Criterion) {
    let classifier = CachedClassifier::new(ConstantClassifier, 100);
    let token = CancellationToken::new();
    for &opinion in OPINIONS {
        let _ = classifier.classify(opinion, &token);
    }
    c.bench_function("classifier_cache::hit", |b| {
        b.iter(|| {
            for &opinion in OPINIONS {
                black_box(classifier.classify(opinion, &token).ok());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_pattern_generation,
    bench_pattern_render,
    bench_cache_hits
);
criterion_main!(benches);
