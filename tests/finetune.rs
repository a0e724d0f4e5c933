//! End-to-end tests: the full model against numeric gradients, shard-count
//! invariance of the data-parallel trainer, optimizer behavior, and
//! checkpoint round trips.

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use viola::{
    array_format, AdamWeightDecay, Config, DeviceParallelTrainer, LanguageModelClassifier,
    PretrainedSource, Tensor, TextEncoder, TransformerClassifier,
};

/// Deterministic byte-level encoder for tests: a start token, the text's
/// bytes folded into the vocabulary, and a trailing classification token.
struct MockEncoder {
    vocab: usize,
}

impl MockEncoder {
    fn new(vocab: usize) -> Self {
        MockEncoder { vocab }
    }

    fn start_token(&self) -> usize {
        self.vocab - 2
    }
}

impl TextEncoder for MockEncoder {
    fn encode_for_classification(&self, texts: &[String], max_length: usize) -> Vec<Vec<usize>> {
        let body = self.vocab - 3; // leave out pad (0) and the two specials
        texts
            .iter()
            .map(|t| {
                let mut ids = vec![self.start_token()];
                ids.extend(
                    t.bytes()
                        .take(max_length - 2)
                        .map(|b| (b as usize % body) + 1),
                );
                ids.push(self.classify_token());
                ids
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn special_tokens(&self) -> usize {
        2
    }

    fn classify_token(&self) -> usize {
        self.vocab - 1
    }
}

fn tiny_model(seed: u64) -> TransformerClassifier {
    let mut rng = StdRng::seed_from_u64(seed);
    TransformerClassifier::new(Config::tiny(), 20, 19, &mut rng).unwrap()
}

fn tiny_batch(n_vocab: usize) -> (viola::InputBatch, Tensor, Vec<usize>) {
    let sequences = vec![
        vec![18, 3, 7, 2, 19],
        vec![18, 4, 9, 19],
        vec![18, 1, 2, 3, 4, 19],
        vec![18, 6, 19],
    ];
    let (x, m) = array_format(&sequences, 8, n_vocab);
    (x, m, vec![0, 1, 1, 0])
}

fn scalar_loss(
    model: &TransformerClassifier,
    x: &viola::InputBatch,
    m: &Tensor,
    y: &[usize],
) -> f32 {
    let mut rng = StdRng::seed_from_u64(0);
    let (out, _) = model.forward(x, m, y, 0..x.n, false, &mut rng);
    let n = out.clf_losses.len() as f32;
    let clf: f32 = out.clf_losses.iter().sum::<f32>() / n;
    let lm: f32 = out.lm_losses.iter().sum::<f32>() / n;
    clf + model.config().lm_coef * lm
}

#[test]
fn analytic_gradients_match_finite_differences() {
    let mut model = tiny_model(1);
    let (x, m, y) = tiny_batch(20);

    let mut rng = StdRng::seed_from_u64(0);
    let (_, cache) = model.forward(&x, &m, &y, 0..4, false, &mut rng);
    let grads = model.backward(&cache);

    // Spot-check entries across the embedding table, a block, and the head.
    // (tensor index, element index): we, qkv_w, ln1_gamma, fc_w, clf_w, clf_b.
    let probes = [(0, 37), (1, 5), (5, 2), (7, 11), (25, 3), (26, 1)];
    let eps = 1e-2;

    for &(ti, ei) in &probes {
        let analytic = grads.tensors()[ti].data[ei];

        model.params.tensors_mut()[ti].data[ei] += eps;
        let plus = scalar_loss(&model, &x, &m, &y);
        model.params.tensors_mut()[ti].data[ei] -= 2.0 * eps;
        let minus = scalar_loss(&model, &x, &m, &y);
        model.params.tensors_mut()[ti].data[ei] += eps;

        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            (analytic - numeric).abs() <= 1e-3 + 0.1 * numeric.abs(),
            "tensor {} entry {}: analytic {} vs numeric {}",
            ti,
            ei,
            analytic,
            numeric
        );
    }
}

#[test]
fn gradients_are_independent_of_shard_count() {
    let model = tiny_model(2);
    let (x, m, y) = tiny_batch(20);

    // Dropout is disabled in the tiny config, so sharding is pure
    // bookkeeping and every device count must agree.
    let two = DeviceParallelTrainer::new(2)
        .run(&model, &x, &m, &y, 0..4, 77)
        .unwrap();
    let four = DeviceParallelTrainer::new(4)
        .run(&model, &x, &m, &y, 0..4, 77)
        .unwrap();

    for (a, b) in two.grads.tensors().iter().zip(four.grads.tensors()) {
        for (av, bv) in a.data.iter().zip(&b.data) {
            assert_relative_eq!(*av, *bv, epsilon = 1e-5, max_relative = 1e-3);
        }
    }
    for i in 0..4 {
        assert_relative_eq!(two.clf_losses[i], four.clf_losses[i], epsilon = 1e-5);
        assert_relative_eq!(two.lm_losses[i], four.lm_losses[i], epsilon = 1e-5);
    }
}

#[test]
fn zero_gradients_only_decay_matrices() {
    let config = Config::tiny();
    let mut model = tiny_model(3);
    let zero = viola::Gradients::zeros(&model.params);

    let before: Vec<Tensor> = model.params.tensors().into_iter().cloned().collect();
    let mut optimizer = AdamWeightDecay::new(&model.params, &config);
    let norm = optimizer.step(&mut model.params, &zero);
    assert_eq!(norm, 0.0);

    for (old, new) in before.iter().zip(model.params.tensors()) {
        if old.shape.len() > 1 {
            // Matrices shrink toward zero under decoupled weight decay.
            for (o, n) in old.data.iter().zip(&new.data) {
                if *o != 0.0 {
                    assert!(n.abs() < o.abs());
                }
            }
        } else {
            assert_eq!(old.data, new.data);
        }
    }
}

#[test]
fn training_reduces_the_classifier_loss() {
    let mut clf = LanguageModelClassifier::new(Config::tiny(), MockEncoder::new(30)).unwrap();
    let texts: Vec<String> = vec![
        "aaaa".into(),
        "zzzz".into(),
        "aaab".into(),
        "zzzy".into(),
    ];
    let labels = vec![0, 1, 0, 1];
    let data = clf.finetune(&texts, &labels).unwrap();
    let batches = clf.batches(&data);
    assert_eq!(batches.len(), 1);

    let first = clf.train_step(&data, batches[0].clone()).unwrap();
    assert_eq!(first.step, 1);
    assert!(first.clf_loss.is_finite());
    assert!(first.lm_loss.is_finite());
    assert!(first.grad_norm.is_finite());

    let mut last = first;
    for _ in 0..20 {
        last = clf.train_step(&data, batches[0].clone()).unwrap();
    }
    assert!(last.clf_loss < first.clf_loss);
}

#[test]
fn checkpoint_round_trip_preserves_predictions() {
    let mut clf = LanguageModelClassifier::new(Config::tiny(), MockEncoder::new(30)).unwrap();
    let texts: Vec<String> = vec!["fine wine".into(), "flat tire".into()];
    let labels = vec![1, 0];
    let data = clf.finetune(&texts, &labels).unwrap();
    for range in clf.batches(&data) {
        clf.train_step(&data, range).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.ckpt");
    clf.save(&path).unwrap();

    let restored = LanguageModelClassifier::load(&path, MockEncoder::new(30)).unwrap();
    let before = clf.predict(&texts);
    let after = restored.predict(&texts);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.label, b.label);
        assert_relative_eq!(a.probs[0], b.probs[0], epsilon = 1e-6);
        assert_relative_eq!(a.probs[1], b.probs[1], epsilon = 1e-6);
    }
}

#[test]
fn pretrained_weights_flow_into_predictions() {
    // Build a fake pretrained archive matching the tiny architecture and
    // check that fine-tuning starts from it rather than random init.
    let config = Config::tiny();
    let d = config.n_embd;
    let n_vocab = 30; // encoder vocabulary, specials included
    let pretrained_vocab = n_vocab - 2;

    let dir = tempfile::tempdir().unwrap();
    let mut shapes = vec![vec![config.max_length, d], vec![pretrained_vocab, d]];
    let mut flat: Vec<f32> = Vec::new();
    flat.extend((0..config.max_length * d).map(|i| (i % 11) as f32 * 0.01));
    flat.extend((0..pretrained_vocab * d).map(|i| (i % 13) as f32 * 0.01));
    for _ in 0..config.n_layer {
        for shape in [
            vec![d, 3 * d],
            vec![3 * d],
            vec![d, d],
            vec![d],
            vec![d],
            vec![d],
            vec![d, 4 * d],
            vec![4 * d],
            vec![4 * d, d],
            vec![d],
            vec![d],
            vec![d],
        ] {
            let len: usize = shape.iter().product();
            flat.extend((0..len).map(|i| (i % 7) as f32 * 0.005));
            shapes.push(shape);
        }
    }
    let manifest = std::fs::File::create(dir.path().join("params_shapes.json")).unwrap();
    serde_json::to_writer(manifest, &shapes).unwrap();
    use std::io::Write;
    let mut f = std::fs::File::create(dir.path().join("params_0.bin")).unwrap();
    for v in &flat {
        f.write_all(&v.to_le_bytes()).unwrap();
    }

    let source = PretrainedSource::new(dir.path()).with_shards(1);
    let mut clf = LanguageModelClassifier::new(config, MockEncoder::new(n_vocab))
        .unwrap()
        .with_pretrained(source);

    let texts: Vec<String> = vec!["hello".into()];
    let labels = vec![1];
    clf.finetune(&texts, &labels).unwrap();

    // Token row 0 comes straight from the archive.
    let we = &clf.model().params.we;
    assert_eq!(we.row(0)[0], 0.0);
    assert_eq!(we.row(0)[1], 0.01);
}
