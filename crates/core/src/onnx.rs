use crate::embeddings::Embedder;
use crate::error::ModelError;
use async_trait::async_trait;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use reqwest::Client;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenizers::{Tokenizer, TruncationParams, TruncationStrategy};
use tracing::{debug, info};

const BACKEND: &str = "onnx";
pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Remote file -> local file name for a Hugging Face sentence-embedding repo.
const MODEL_FILES: [(&str, &str); 2] = [
    ("onnx/model.onnx", MODEL_FILE),
    ("tokenizer.json", TOKENIZER_FILE),
];
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// How token states collapse into one sentence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pooling {
    /// First token (`[CLS]`), used by the BGE family.
    Cls,
    /// Attention-masked mean, used by sentence-transformers models.
    Mean,
}

impl Pooling {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().contains("bge") {
            Self::Cls
        } else {
            Self::Mean
        }
    }
}

struct OnnxRuntime {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    wants_token_types: bool,
    pooling: Pooling,
    dimensions: usize,
}

/// Sentence embeddings from a local ONNX export and its `tokenizer.json`.
pub struct OnnxEmbedder {
    runtime: Arc<OnnxRuntime>,
    model: String,
}

impl OnnxEmbedder {
    pub fn load(
        model: impl Into<String>,
        model_dir: &Path,
        dimensions: usize,
        max_tokens: usize,
    ) -> Result<Self, ModelError> {
        let model = model.into();
        let model_path = model_dir.join(MODEL_FILE);
        let tokenizer_path = model_dir.join(TOKENIZER_FILE);
        for path in [&model_path, &tokenizer_path] {
            if !path.is_file() {
                return Err(ModelError::FilesMissing(path.display().to_string()));
            }
        }

        let session = Session::builder()
            .map_err(runtime_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime_error)?
            .with_intra_threads(intra_threads())
            .map_err(runtime_error)?
            .commit_from_file(&model_path)
            .map_err(runtime_error)?;
        let wants_token_types = session
            .inputs
            .iter()
            .any(|input| input.name == "token_type_ids");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(runtime_error)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                strategy: TruncationStrategy::LongestFirst,
                ..Default::default()
            }))
            .map_err(runtime_error)?;

        info!(model = %model, path = %model_dir.display(), "loaded onnx embedding model");
        Ok(Self {
            runtime: Arc::new(OnnxRuntime {
                session: Mutex::new(session),
                tokenizer,
                wants_token_types,
                pooling: Pooling::for_model(&model),
                dimensions,
            }),
            model,
        })
    }
}

impl OnnxRuntime {
    // One text per run: padding never leaks into another text's vector.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let encoding = self.tokenizer.encode(text, true).map_err(runtime_error)?;
        let len = encoding.get_ids().len();
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&value| value as i64)
            .collect();
        let types: Vec<i64> = encoding.get_type_ids().iter().map(|&id| id as i64).collect();

        let ids = Tensor::from_array(([1, len], ids)).map_err(runtime_error)?;
        let mask_tensor = Tensor::from_array(([1, len], mask.clone())).map_err(runtime_error)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| runtime_message("session lock poisoned"))?;
        let outputs = if self.wants_token_types {
            let types = Tensor::from_array(([1, len], types)).map_err(runtime_error)?;
            session.run(ort::inputs![ids, mask_tensor, types])
        } else {
            session.run(ort::inputs![ids, mask_tensor])
        }
        .map_err(runtime_error)?;

        let (shape, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(runtime_error)?;
        let shape: Vec<usize> = shape.iter().map(|&dim| dim.max(0) as usize).collect();
        pool(values, &shape, &mask, self.pooling, self.dimensions)
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn dimensions(&self) -> usize {
        self.runtime.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let runtime = self.runtime.clone();
        let texts = texts.to_vec();
        debug!(count = texts.len(), model = %self.model, "embedding locally");
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| runtime.embed_one(text))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|error| runtime_message(&error.to_string()))?
    }
}

/// Collapses a `[1, tokens, hidden]` or `[1, hidden]` output to one unit vector.
pub fn pool(
    values: &[f32],
    shape: &[usize],
    mask: &[i64],
    pooling: Pooling,
    dimensions: usize,
) -> Result<Vec<f32>, ModelError> {
    let hidden = shape.last().copied().unwrap_or(0);
    if hidden != dimensions {
        return Err(ModelError::InvalidResponse {
            backend: BACKEND.to_string(),
            details: format!("model produces {hidden} dimensions, expected {dimensions}"),
        });
    }
    if values.len() < hidden {
        return Err(runtime_message("empty model output"));
    }

    let mut vector = match (shape.len(), pooling) {
        (2, _) | (3, Pooling::Cls) => values[..hidden].to_vec(),
        (3, Pooling::Mean) => {
            let tokens = shape[1].min(mask.len()).min(values.len() / hidden);
            let mut sum = vec![0f32; hidden];
            let mut counted = 0f32;
            for token in (0..tokens).filter(|&token| mask[token] > 0) {
                let row = &values[token * hidden..(token + 1) * hidden];
                for (total, value) in sum.iter_mut().zip(row) {
                    *total += value;
                }
                counted += 1.0;
            }
            if counted > 0.0 {
                sum.iter_mut().for_each(|value| *value /= counted);
            }
            sum
        }
        _ => return Err(runtime_message(&format!("unexpected output shape {shape:?}"))),
    };

    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|value| *value /= norm);
    }
    Ok(vector)
}

/// Fetches `model.onnx` and `tokenizer.json` of `repo` into `target_dir`.
/// Files already present are kept. Returns the paths written.
pub async fn download_model(
    base_url: &str,
    repo: &str,
    target_dir: &Path,
) -> Result<Vec<PathBuf>, ModelError> {
    std::fs::create_dir_all(target_dir)?;
    let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
    let mut written = Vec::new();

    for (remote, local) in MODEL_FILES {
        let target = target_dir.join(local);
        if target.is_file() {
            debug!(path = %target.display(), "model file already present");
            continue;
        }

        let url = resolve_url(base_url, repo, remote);
        info!(url = %url, "downloading model file");
        let mut response = client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                backend: "huggingface".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let partial = target.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        while let Some(bytes) = response.chunk().await? {
            file.write_all(&bytes)?;
        }
        file.sync_all()?;
        std::fs::rename(&partial, &target)?;
        written.push(target);
    }

    Ok(written)
}

fn resolve_url(base_url: &str, repo: &str, file: &str) -> String {
    format!("{}/{repo}/resolve/main/{file}", base_url.trim_end_matches('/'))
}

fn intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

fn runtime_error(error: impl std::fmt::Display) -> ModelError {
    runtime_message(&error.to_string())
}

fn runtime_message(details: &str) -> ModelError {
    ModelError::Runtime {
        backend: BACKEND.to_string(),
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn bge_models_pool_on_the_first_token() {
        assert_eq!(Pooling::for_model("BAAI/bge-small-en-v1.5"), Pooling::Cls);
        assert_eq!(
            Pooling::for_model("sentence-transformers/all-MiniLM-L6-v2"),
            Pooling::Mean
        );
    }

    #[test]
    fn cls_pooling_takes_the_first_row() {
        let values = [3.0, 4.0, 100.0, 100.0];
        let vector = pool(&values, &[1, 2, 2], &[1, 1], Pooling::Cls, 2).expect("pool");
        assert_eq!(vector, vec![0.6, 0.8]);
    }

    #[test]
    fn mean_pooling_skips_masked_tokens() {
        let values = [1.0, 0.0, 0.0, 1.0, 50.0, 50.0];
        let vector = pool(&values, &[1, 3, 2], &[1, 1, 0], Pooling::Mean, 2).expect("pool");
        let expected = 1.0 / 2f32.sqrt();
        assert!((vector[0] - expected).abs() < 1e-6);
        assert!((vector[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn pooled_output_is_used_as_is() {
        let vector = pool(&[0.0, 2.0], &[1, 2], &[1], Pooling::Mean, 2).expect("pool");
        assert_eq!(vector, vec![0.0, 1.0]);
    }

    #[test]
    fn hidden_size_must_match_configured_dimension() {
        let result = pool(&[1.0; 6], &[1, 2, 3], &[1, 1], Pooling::Cls, 384);
        assert!(matches!(result, Err(ModelError::InvalidResponse { .. })));
    }

    #[test]
    fn missing_model_files_point_at_setup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = OnnxEmbedder::load("BAAI/bge-small-en-v1.5", dir.path(), 384, 512);
        let Err(error) = result else {
            panic!("load should fail without model files");
        };
        assert!(matches!(error, ModelError::FilesMissing(ref path) if path.ends_with(MODEL_FILE)));
        assert!(error.to_string().contains("docchat setup"));
    }

    #[tokio::test]
    async fn download_fetches_missing_files_only() {
        let server = MockServer::start();
        let model = server.mock(|when, then| {
            when.method(GET)
                .path("/BAAI/bge-small-en-v1.5/resolve/main/onnx/model.onnx");
            then.status(200).body("onnx-bytes");
        });
        let tokenizer = server.mock(|when, then| {
            when.method(GET)
                .path("/BAAI/bge-small-en-v1.5/resolve/main/tokenizer.json");
            then.status(200).body("{}");
        });

        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(TOKENIZER_FILE), "kept").expect("write");

        let written = download_model(&server.base_url(), "BAAI/bge-small-en-v1.5", dir.path())
            .await
            .expect("download");

        model.assert();
        tokenizer.assert_hits(0);
        assert_eq!(written, vec![dir.path().join(MODEL_FILE)]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(MODEL_FILE)).expect("read"),
            "onnx-bytes"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(TOKENIZER_FILE)).expect("read"),
            "kept"
        );
    }

    #[tokio::test]
    async fn download_reports_missing_repositories() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET);
            then.status(404).body("Repository not found");
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let result = download_model(&server.base_url(), "nobody/nothing", dir.path()).await;
        assert!(matches!(result, Err(ModelError::Status { status: 404, .. })));
        assert!(!dir.path().join(MODEL_FILE).exists());
    }
}
