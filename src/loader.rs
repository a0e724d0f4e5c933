//! Pretrained Weight Loading
//!
//! Reads a pretrained transformer checkpoint from a directory holding a
//! `params_shapes.json` manifest (a JSON array of tensor shapes, in the
//! order the tensors were created) plus `params_0.bin` .. `params_{N-1}.bin`
//! shard files of raw little-endian `f32` values. The shards are
//! concatenated, split according to the manifest, and bound by position to
//! the trunk tensors; the classifier head keeps its fresh random weights.
//!
//! The first manifest entry is the positional embedding (truncated to the
//! configured context length), the second the token embedding. Both are
//! folded into the combined table, with freshly drawn rows for any special
//! tokens the encoder adds on top of the pretrained vocabulary:
//!
//! ```text
//! we = [token rows | special rows ~ N(0, stddev²) | position rows]
//! ```

use crate::config::Config;
use crate::error::{FinetuneError, Result};
use crate::layers::randn_init;
use crate::model::Parameters;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Tensors per transformer block in the checkpoint ordering.
const TENSORS_PER_BLOCK: usize = 12;

/// Location and layout of a pretrained checkpoint.
#[derive(Debug, Clone)]
pub struct PretrainedSource {
    pub dir: PathBuf,
    /// Number of `params_{i}.bin` shard files.
    pub n_shards: usize,
}

impl PretrainedSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        PretrainedSource {
            dir: dir.as_ref().to_path_buf(),
            n_shards: 10,
        }
    }

    pub fn with_shards(mut self, n_shards: usize) -> Self {
        self.n_shards = n_shards;
        self
    }
}

fn read_f32_file(path: &Path) -> Result<Vec<f32>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Overwrite the trunk of `params` with pretrained weights.
///
/// `n_special` is the count of special tokens the encoder appends after the
/// pretrained vocabulary; their embedding rows are drawn fresh from `rng`.
pub fn load_pretrained(
    params: &mut Parameters,
    config: &Config,
    source: &PretrainedSource,
    n_special: usize,
    rng: &mut StdRng,
) -> Result<()> {
    let manifest_path = source.dir.join("params_shapes.json");
    let shapes: Vec<Vec<usize>> = serde_json::from_reader(File::open(manifest_path)?)?;

    let mut flat = Vec::new();
    for i in 0..source.n_shards {
        let shard = read_f32_file(&source.dir.join(format!("params_{}.bin", i)))?;
        flat.extend(shard);
    }

    let total: usize = shapes.iter().map(|s| s.iter().product::<usize>()).sum();
    if flat.len() != total {
        return Err(FinetuneError::ManifestMismatch {
            expected: total,
            found: flat.len(),
        });
    }

    let mut entries = Vec::with_capacity(shapes.len());
    let mut offset = 0;
    for shape in &shapes {
        let len: usize = shape.iter().product();
        entries.push(Tensor::new(flat[offset..offset + len].to_vec(), shape.clone()));
        offset += len;
    }

    if entries.len() != 2 + TENSORS_PER_BLOCK * config.n_layer {
        return Err(FinetuneError::VariableCount {
            expected: 2 + TENSORS_PER_BLOCK * config.n_layer,
            found: entries.len(),
        });
    }

    // Entry 0: positional embeddings, truncated to the configured context.
    let positions = &entries[0];
    if positions.shape[0] < config.max_length {
        return Err(FinetuneError::ContextTooLong {
            max_length: config.max_length,
            available: positions.shape[0],
        });
    }
    let positions = positions.slice_rows(0, config.max_length);

    // Entry 1: token embeddings, extended with fresh special-token rows.
    let token_table = &entries[1];
    let d = config.n_embd;
    let mut we_data = token_table.data.clone();
    we_data.extend(randn_init(n_special * d, config.weight_stddev, rng));
    we_data.extend_from_slice(&positions.data);
    let we_rows = token_table.shape[0] + n_special + config.max_length;
    let we = Tensor::new(we_data, vec![we_rows, d]);

    let names = params.names();
    let mut targets = params.tensors_mut();
    if we.shape != targets[0].shape {
        return Err(FinetuneError::ShapeMismatch {
            index: 0,
            name: names[0].clone(),
            expected: targets[0].shape.clone(),
            found: we.shape.clone(),
        });
    }
    *targets[0] = we;

    // The remaining entries bind in order to the block tensors; the
    // classifier projection at the tail stays untouched.
    for (i, entry) in entries.into_iter().skip(2).enumerate() {
        let target = &mut targets[1 + i];
        if entry.shape != target.shape {
            return Err(FinetuneError::ShapeMismatch {
                index: 1 + i,
                name: names[1 + i].clone(),
                expected: target.shape.clone(),
                found: entry.shape.clone(),
            });
        }
        **target = entry;
    }

    log::info!(
        "loaded pretrained weights from {} ({} shards, {} special rows)",
        source.dir.display(),
        source.n_shards,
        n_special
    );
    Ok(())
}

/// Write one tensor: shape rank, dims, element count, then raw LE `f32`s.
pub(crate) fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> std::io::Result<()> {
    w.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
    for &dim in &tensor.shape {
        w.write_all(&(dim as u32).to_le_bytes())?;
    }
    w.write_all(&(tensor.data.len() as u32).to_le_bytes())?;
    for &v in &tensor.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Inverse of [`write_tensor`].
pub(crate) fn read_tensor<R: Read>(r: &mut R) -> std::io::Result<Tensor> {
    let mut u32_buf = [0u8; 4];

    r.read_exact(&mut u32_buf)?;
    let rank = u32::from_le_bytes(u32_buf) as usize;

    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        r.read_exact(&mut u32_buf)?;
        shape.push(u32::from_le_bytes(u32_buf) as usize);
    }

    r.read_exact(&mut u32_buf)?;
    let len = u32::from_le_bytes(u32_buf) as usize;

    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        r.read_exact(&mut u32_buf)?;
        data.push(f32::from_le_bytes(u32_buf));
    }

    Ok(Tensor::new(data, shape))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::io::Cursor;

    #[test]
    fn tensor_round_trips_through_the_wire_format() {
        let t = Tensor::new(vec![1.0, -2.5, 3.25, 0.0, 7.5, -0.125], vec![2, 3]);
        let mut buf = Vec::new();
        write_tensor(&mut buf, &t).unwrap();
        let back = read_tensor(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.shape, t.shape);
        assert_eq!(back.data, t.data);
    }

    #[test]
    fn loader_assembles_the_combined_table() {
        let mut config = Config::tiny();
        config.max_length = 4;
        let n_special = 3;
        let pretrained_vocab = 10;
        let n_vocab = pretrained_vocab + n_special;
        let d = config.n_embd;

        let dir = tempfile::tempdir().unwrap();

        // Positional table longer than max_length to exercise truncation.
        let n_ctx = 6;
        let mut shapes = vec![vec![n_ctx, d], vec![pretrained_vocab, d]];
        let mut flat: Vec<f32> = Vec::new();
        flat.extend((0..n_ctx * d).map(|i| 1000.0 + i as f32));
        flat.extend((0..pretrained_vocab * d).map(|i| i as f32));
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
                flat.extend((0..len).map(|i| (i % 7) as f32 * 0.01));
                shapes.push(shape);
            }
        }

        let manifest = std::fs::File::create(dir.path().join("params_shapes.json")).unwrap();
        serde_json::to_writer(manifest, &shapes).unwrap();

        // Split the flat buffer into two uneven shards.
        let split = flat.len() / 3;
        for (i, chunk) in [&flat[..split], &flat[split..]].iter().enumerate() {
            let mut f = std::fs::File::create(dir.path().join(format!("params_{}.bin", i))).unwrap();
            for v in chunk.iter() {
                f.write_all(&v.to_le_bytes()).unwrap();
            }
        }

        let mut rng = StdRng::seed_from_u64(9);
        let mut params = Parameters::new(&config, n_vocab, &mut rng);
        let clf_before = params.clf_w.data.clone();

        let source = PretrainedSource::new(dir.path()).with_shards(2);
        load_pretrained(&mut params, &config, &source, n_special, &mut rng).unwrap();

        // Token rows come straight from entry 1.
        assert_eq!(params.we.row(0)[0], 0.0);
        assert_eq!(params.we.row(1)[0], d as f32);
        // Position rows land after vocab + specials, truncated to max_length.
        assert_eq!(params.we.shape[0], n_vocab + config.max_length);
        assert_eq!(params.we.row(n_vocab)[0], 1000.0);
        // Classifier head untouched.
        assert_eq!(params.clf_w.data, clf_before);
    }

    #[test]
    fn loader_rejects_short_positional_tables() {
        let mut config = Config::tiny();
        config.max_length = 16;
        let d = config.n_embd;
        let dir = tempfile::tempdir().unwrap();

        let mut shapes = vec![vec![4, d], vec![10, d]];
        let mut flat = vec![0.0f32; 4 * d + 10 * d];
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
                flat.extend(vec![0.0f32; len]);
                shapes.push(shape);
            }
        }
        let manifest = std::fs::File::create(dir.path().join("params_shapes.json")).unwrap();
        serde_json::to_writer(manifest, &shapes).unwrap();
        let mut f = std::fs::File::create(dir.path().join("params_0.bin")).unwrap();
        for v in &flat {
            f.write_all(&v.to_le_bytes()).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(10);
        let mut params = Parameters::new(&config, 13, &mut rng);
        let source = PretrainedSource::new(dir.path()).with_shards(1);
        let err = load_pretrained(&mut params, &config, &source, 3, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            FinetuneError::ContextTooLong {
                max_length: 16,
                available: 4
            }
        ));
    }
}
