//! Decode and translation throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use graft::elf::GuestImage;
use graft::riscv::{decode, encode};
use graft::{Engine, EngineConfig};

const BASE: u64 = 0x4_0000;

fn straightline_words(n: usize) -> Vec<u32> {
    let mut words: Vec<u32> = (0..n as i32)
        .map(|i| encode::addi(5 + (i % 8) as u8, 5, i % 2048))
        .collect();
    words.push(encode::jal(0, 0));
    words
}

fn text_of(words: &[u32]) -> Vec<u8> {
    let mut text = Vec::with_capacity(words.len() * 4);
    for w in words {
        text.extend_from_slice(&w.to_le_bytes());
    }
    text
}

fn bench_decode(c: &mut Criterion) {
    let words = straightline_words(1024);
    c.bench_function("decode_1k_words", |b| {
        b.iter(|| {
            let mut n = 0usize;
            for &w in &words {
                n += decode::decode(black_box(w)).len as usize;
            }
            black_box(n)
        })
    });
}

fn bench_translate(c: &mut Criterion) {
    let words = straightline_words(1024);
    c.bench_function("translate_1k_insns", |b| {
        b.iter_batched(
            || {
                let image = GuestImage::from_parts(BASE, BASE, text_of(&words));
                Engine::from_image(image, EngineConfig::default()).unwrap()
            },
            |mut engine| {
                // Materialize the whole stream as a run of capped blocks.
                let mut addr = BASE;
                let end = BASE + (words.len() as u64) * 4;
                while addr < end {
                    let id = engine.materialize_block(addr).unwrap();
                    let desc = engine.block(id);
                    addr = desc.last_addr + 4;
                }
                engine
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_decode, bench_translate);
criterion_main!(benches);
