//! In-process integration tests that drive the public engine API without
//! executing guest code, so they run on any host.

use graft::elf::GuestImage;
use graft::riscv::{encode, Mnemonic};
use graft::{Engine, EngineConfig, Mode, Phase};
use std::cell::Cell;
use std::rc::Rc;

const BASE: u64 = 0x2_0000;

fn text_of(words: &[u32]) -> Vec<u8> {
    let mut text = Vec::with_capacity(words.len() * 4);
    for w in words {
        text.extend_from_slice(&w.to_le_bytes());
    }
    text
}

fn engine_with(words: &[u32], config: EngineConfig) -> Engine {
    let image = GuestImage::from_parts(BASE, BASE, text_of(words));
    Engine::from_image(image, config).expect("engine construction")
}

#[test]
fn test_materialize_and_descriptor() {
    let mut engine = engine_with(
        &[
            encode::addi(5, 0, 1),
            encode::beq(5, 0, 8),
            encode::jal(0, 0),
        ],
        EngineConfig::default(),
    );
    let id = engine.materialize_block(BASE).unwrap();
    let desc = engine.block(id);
    assert_eq!(desc.first_addr, BASE);
    assert_eq!(desc.last_addr, BASE + 4);
    assert_eq!(desc.insn_count, 2);
    assert_eq!(desc.taken_target, Some(BASE + 12));
    assert_eq!(desc.fall_through, Some(BASE + 8));
    assert_eq!(engine.lookup_block(BASE), Some(id));
    assert_eq!(engine.lookup_block(BASE + 4), None);
}

#[test]
fn test_materialization_idempotent_via_api() {
    let mut engine = engine_with(&[encode::jal(0, 0)], EngineConfig::default());
    let a = engine.materialize_block(BASE).unwrap();
    let b = engine.materialize_block(BASE).unwrap();
    assert_eq!(a, b);
    assert_eq!(engine.stats().blocks_materialized, 1);
}

#[test]
fn test_trace_allocation_follows_successors() {
    // With trace linking on, materializing the head of a chain pulls the
    // direct successors in and links them.
    let config = EngineConfig {
        trace_linking: true,
        ..EngineConfig::default()
    };
    let mut engine = engine_with(
        &[
            encode::jal(0, 4), // A -> B
            encode::jal(0, 4), // B -> C
            encode::jal(0, -8), // C -> A
        ],
        config,
    );
    engine.materialize_block(BASE).unwrap();
    assert!(engine.lookup_block(BASE + 4).is_some(), "successor materialized");
    assert!(engine.lookup_block(BASE + 8).is_some());
    assert!(engine.stats().links_installed >= 2, "chain linked");
}

#[test]
fn test_runtime_callback_disables_linking() {
    let config = EngineConfig {
        trace_linking: true,
        ..EngineConfig::default()
    };
    let mut engine = engine_with(&[encode::addi(5, 5, 1), encode::jal(0, -4)], config);
    engine.register_block_fn(Phase::Post, Mode::Runtime, |_, _| {});
    engine.materialize_block(BASE).unwrap();
    assert_eq!(engine.stats().links_installed, 0);
}

#[test]
fn test_group_segmentation() {
    // Tag the multiply family and hook it at RUNTIME POST: blocks must be
    // cut so every tagged instruction ends one.
    let mul = encode::r_type(0x33, 6, 0, 5, 5, 0x01);
    let mut engine = engine_with(
        &[encode::addi(5, 0, 3), mul, encode::addi(7, 0, 1), encode::jal(0, 0)],
        EngineConfig::default(),
    );
    engine.assign_group(&[Mnemonic::Mul, Mnemonic::Mulw], 4);
    engine.register_insn_group_fn(4, Phase::Post, Mode::Runtime, |_, _| {});
    let id = engine.materialize_block(BASE).unwrap();
    let desc = engine.block(id);
    assert_eq!(desc.insn_count, 2, "cut after the mul");
    assert_eq!(desc.last_addr, BASE + 4);
}

#[test]
fn test_allocator_block_callback_once_per_address() {
    let hits = Rc::new(Cell::new(0u32));
    let h = hits.clone();
    let mut engine = engine_with(
        &[encode::addi(5, 0, 1), encode::jal(0, 0)],
        EngineConfig::default(),
    );
    engine.register_block_fn(Phase::Post, Mode::Allocator, move |_, desc| {
        assert!(desc.insn_count > 0);
        h.set(h.get() + 1);
    });
    engine.materialize_block(BASE).unwrap();
    engine.materialize_block(BASE).unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_allocator_insn_type_callback_sees_each_site() {
    let addis = Rc::new(Cell::new(0u32));
    let h = addis.clone();
    let mut engine = engine_with(
        &[
            encode::addi(5, 0, 1),
            encode::addi(6, 0, 2),
            encode::jal(0, 0),
        ],
        EngineConfig::default(),
    );
    engine.register_insn_type_fn(Mnemonic::Addi, Phase::Post, Mode::Allocator, move |_, info| {
        assert_eq!(info.mnemonic, Mnemonic::Addi);
        h.set(h.get() + 1);
    });
    engine.materialize_block(BASE).unwrap();
    assert_eq!(addis.get(), 2);
}

#[test]
fn test_inline_injection_api() {
    let mut engine = engine_with(
        &[encode::addi(5, 0, 1), encode::jal(0, 0)],
        EngineConfig::default(),
    );
    engine.inline_block(Phase::Post).append(encode::nop());
    engine
        .inline_block(Phase::Post)
        .append_load_imm64(31, 0xdead_beef_0000);
    let id = engine.materialize_block(BASE).unwrap();
    let desc = engine.block(id);
    // The woven words made the block strictly larger than its two
    // instructions plus exit.
    assert!(desc.cache_end - desc.cache_start > 6 * 4);
}

#[test]
fn test_flush_and_retranslate() {
    let config = EngineConfig {
        cache_size: 4096,
        max_block_insns: 8,
        ..EngineConfig::default()
    };
    let mut words: Vec<u32> = (0..200).map(|_| encode::addi(5, 5, 1)).collect();
    words.push(encode::jal(0, 0));
    let mut engine = engine_with(&words, config);

    for i in 0..100 {
        engine.materialize_block(BASE + i * 4).unwrap();
    }
    assert!(engine.stats().flushes >= 1, "small cache must have flushed");
    // Pre-flush blocks are gone; rematerialization works on the fresh cache.
    assert!(engine.lookup_block(BASE).is_none());
    engine.materialize_block(BASE).unwrap();
    assert!(engine.lookup_block(BASE).is_some());
}

#[cfg(not(target_arch = "riscv64"))]
#[test]
fn test_run_requires_riscv_host() {
    let mut engine = engine_with(&[encode::jal(0, 0)], EngineConfig::default());
    assert!(matches!(
        engine.run(),
        Err(graft::EngineError::UnsupportedHost)
    ));
}
