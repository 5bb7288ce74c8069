//! End-to-end scenarios: build a network, freeze it, and decode synthetic
//! feature streams through the online protocol.

use warbler_search::acoustic::{boundary, AcousticContext, ContextTable};
use warbler_search::builder::{MinimizedBuilderOptions, MinimizedTreeBuilder, TreeBuilder};
use warbler_search::graph::CompactNetwork;
use warbler_search::lexicon::MemoryLexicon;
use warbler_search::search::timesync::{
    EmissionScorer, NullLanguageModel, TimesyncOptions, TimesyncSearch,
};
use warbler_search::search::SearchAlgorithm;
use warbler_search::types::{EmissionId, PhonemeId, PronunciationId, Score, TERM};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct IndexScorer;

impl EmissionScorer for IndexScorer {
    fn score(&self, feature: &[Score], emission: EmissionId) -> Score {
        feature.get(emission as usize).copied().unwrap_or(1e9)
    }
}

/// Phones: k=1, ae=2, t=3, b=4 (context dependent), sil=5 (independent).
fn cat_cab_model() -> ContextTable {
    ContextTable::new(5).context_independent(5).with_silence(5)
}

fn cat_cab_lexicon() -> (MemoryLexicon, PronunciationId, PronunciationId, PronunciationId) {
    let mut lexicon = MemoryLexicon::new();
    let cat = lexicon.add(&[1, 2, 3]);
    let cab = lexicon.add(&[1, 2, 4]);
    let sil = lexicon.add_special("silence", &[5]);
    (lexicon, cat, cab, sil)
}

fn build_network(opts: MinimizedBuilderOptions) -> (CompactNetwork, ContextTable, PronunciationId, PronunciationId) {
    let acoustic = cat_cab_model();
    let (lexicon, cat, cab, _) = cat_cab_lexicon();
    let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, opts);
    builder.build().unwrap();
    let network = CompactNetwork::from_network(builder.network());
    (network, acoustic, cat, cab)
}

/// One-hot frames over synthesized emission ids, one frame per emission.
fn frames_for(emissions: &[EmissionId]) -> Vec<Vec<Score>> {
    let dim = 256.max(emissions.iter().map(|e| *e as usize + 1).max().unwrap_or(0));
    emissions
        .iter()
        .map(|e| {
            let mut frame = vec![1e6; dim];
            frame[*e as usize] = 0.0;
            frame
        })
        .collect()
}

/// Emission sequence realizing a word followed by silence.
fn word_then_silence(acoustic: &ContextTable, phones: &[PhonemeId]) -> Vec<EmissionId> {
    let sil: PhonemeId = 5;
    let mut emissions = Vec::new();
    for (i, &phone) in phones.iter().enumerate() {
        let left = if i == 0 { TERM } else { phones[i - 1] };
        let right = if i + 1 < phones.len() { phones[i + 1] } else { sil };
        let mut flags = boundary::NONE;
        if i == 0 {
            flags |= boundary::INITIAL_PHONE;
        }
        if i + 1 == phones.len() {
            flags |= boundary::FINAL_PHONE;
        }
        for desc in acoustic.hmm_from_allophone(left, phone, right, flags).iter() {
            emissions.push(desc.emission);
        }
    }
    let sil_hmm = acoustic.hmm_from_allophone(
        TERM,
        sil,
        TERM,
        boundary::INITIAL_PHONE | boundary::FINAL_PHONE,
    );
    for desc in sil_hmm.iter() {
        emissions.push(desc.emission);
    }
    emissions
}

fn decode(
    network: &CompactNetwork,
    acoustic: &ContextTable,
    emissions: &[EmissionId],
) -> Vec<PronunciationId> {
    let scorer = IndexScorer;
    let lm = NullLanguageModel;
    let mut search =
        TimesyncSearch::new(network, acoustic, &scorer, &lm, TimesyncOptions::default());

    search.enter_segment(None).unwrap();
    for frame in frames_for(emissions) {
        search.add_feature(&frame).unwrap();
    }
    search.finish_segment().unwrap();
    search.current_best_traceback().pronunciations()
}

#[test]
fn static_fan_out_decodes_both_words() {
    init_tracing();
    // A large min-phones forces static fan-out expansion for every word.
    let opts = MinimizedBuilderOptions {
        min_phones: 10,
        ..MinimizedBuilderOptions::default()
    };
    let (network, acoustic, cat, cab) = build_network(opts);

    let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 3]));
    assert_eq!(decoded, vec![cat]);

    let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 4]));
    assert_eq!(decoded, vec![cab]);
}

#[test]
fn pushed_word_ends_decode_the_same_frames() {
    init_tracing();
    // Default min-phones pushes the last phoneme into the fan-out; the
    // observable frame language must not change.
    let (network, acoustic, cat, cab) = build_network(MinimizedBuilderOptions::default());

    let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 3]));
    assert_eq!(decoded, vec![cat]);

    let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 4]));
    assert_eq!(decoded, vec![cab]);
}

#[test]
fn minimization_preserves_the_decoded_language() {
    init_tracing();
    for iterations in [0, 1, 2] {
        let opts = MinimizedBuilderOptions {
            minimization_iterations: iterations,
            ..MinimizedBuilderOptions::default()
        };
        let (network, acoustic, cat, cab) = build_network(opts);

        let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 3]));
        assert_eq!(decoded, vec![cat], "iterations={iterations}");

        let decoded = decode(&network, &acoustic, &word_then_silence(&acoustic, &[1, 2, 4]));
        assert_eq!(decoded, vec![cab], "iterations={iterations}");
    }
}

#[test]
fn minimization_shrinks_the_frozen_network() {
    init_tracing();
    let (unminimized, _, _, _) = build_network(MinimizedBuilderOptions {
        minimization_iterations: 0,
        ..MinimizedBuilderOptions::default()
    });
    let (minimized, _, _, _) = build_network(MinimizedBuilderOptions::default());

    assert!(minimized.stats().states <= unminimized.stats().states);
    assert!(minimized.stats().exits <= unminimized.stats().exits);
}

#[test]
fn repeat_silence_needs_two_frames() {
    init_tracing();
    let (network, acoustic, cat, _) = build_network(MinimizedBuilderOptions {
        repeat_silence: true,
        ..MinimizedBuilderOptions::default()
    });

    // Doubling silence adds one more state per silence occurrence; with a
    // repeated silence frame the word still decodes.
    let mut emissions = word_then_silence(&acoustic, &[1, 2, 3]);
    let last = *emissions.last().unwrap();
    emissions.push(last);
    let decoded = decode(&network, &acoustic, &emissions);
    assert_eq!(decoded, vec![cat]);
}

#[test]
fn cross_word_skips_add_skip_roots() {
    init_tracing();
    let acoustic = cat_cab_model();
    let (lexicon, _, _, _) = cat_cab_lexicon();
    let opts = MinimizedBuilderOptions {
        allow_cross_word_skips: true,
        ..MinimizedBuilderOptions::default()
    };
    let mut builder = MinimizedTreeBuilder::new(&lexicon, &acoustic, opts);
    builder.build().unwrap();
    let network = builder.network();

    use warbler_search::acoustic::ENTRY_SKIP;
    let skip_roots = (1..network.state_count())
        .filter(|s| network.structure.descriptor(*s).transition_model == ENTRY_SKIP)
        .count();
    assert!(skip_roots > 0);
}

#[test]
fn segment_protocol_supports_reset_and_reuse() {
    init_tracing();
    let (network, acoustic, cat, _) = build_network(MinimizedBuilderOptions::default());
    let scorer = IndexScorer;
    let lm = NullLanguageModel;
    let mut search =
        TimesyncSearch::new(&network, &acoustic, &scorer, &lm, TimesyncOptions::default());

    let emissions = word_then_silence(&acoustic, &[1, 2, 3]);

    search.enter_segment(None).unwrap();
    for frame in frames_for(&emissions) {
        search.add_feature(&frame).unwrap();
        search.decode_more();
    }
    search.finish_segment().unwrap();
    assert_eq!(search.current_best_traceback().pronunciations(), vec![cat]);

    // Reset drops everything; a new segment starts clean.
    search.reset();
    assert!(search.current_best_traceback().items.is_empty());
    search.enter_segment(None).unwrap();
    for frame in frames_for(&emissions) {
        search.add_feature(&frame).unwrap();
    }
    search.finish_segment().unwrap();
    assert_eq!(search.current_best_traceback().pronunciations(), vec![cat]);
}

#[test]
fn builds_are_reproducible() {
    init_tracing();
    let (first, _, _, _) = build_network(MinimizedBuilderOptions::default());
    let (second, _, _, _) = build_network(MinimizedBuilderOptions::default());

    assert_eq!(first.root_state(), second.root_state());
    assert_eq!(first.stats().states, second.stats().states);
    assert_eq!(first.stats().exits, second.stats().exits);
    for state in 0..=first.stats().states {
        assert_eq!(first.descriptor(state), second.descriptor(state));
        assert_eq!(first.successors(state), second.successors(state));
    }
    for exit in 0..first.stats().exits {
        assert_eq!(first.exit(exit), second.exit(exit));
    }
}

#[test]
fn builder_options_deserialize_from_kebab_case() {
    let opts: MinimizedBuilderOptions = serde_json::from_str(
        r#"{"min-phones": 3, "force-exact-word-ends": true, "minimization-iterations": 1}"#,
    )
    .unwrap();
    assert_eq!(opts.min_phones, 3);
    assert!(opts.force_exact_word_ends);
    assert_eq!(opts.minimization_iterations, 1);
    // Unmentioned fields keep their defaults.
    assert!(opts.use_root_for_ci_exits);
    assert!(!opts.keep_roots);
}
