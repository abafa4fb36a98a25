//! Execution providers for the segmentation network: CPU, CUDA and TensorRT.
//!
//! The orchestrator owns an [`ExecutionContext`] and hands it to
//! [`build_session`]. TensorRT falls back to CUDA, and CUDA falls back to
//! CPU with a warning, so an unavailable accelerator never aborts a run.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
}

impl InferenceBackend {
    pub const NAMES: [&'static str; 3] = ["cpu", "cuda", "tensorrt"];
}

impl FromStr for InferenceBackend {
    type Err = PipelineError;

    /// Case-insensitive; `trt` is accepted for TensorRT.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            other => Err(PipelineError::config(format!(
                "unknown inference backend '{other}' (expected one of: {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

/// Where and how a model runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub backend: InferenceBackend,
    pub device_id: i32,
    pub trt_cache_dir: Option<PathBuf>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            backend: InferenceBackend::default(),
            device_id: 0,
            trt_cache_dir: None,
        }
    }
}

impl ExecutionContext {
    pub fn cpu() -> Self {
        Self {
            backend: InferenceBackend::Cpu,
            ..Self::default()
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub context: &'a ExecutionContext,
    /// Spatial extent of the tiles the session will see, used to key engine caches.
    pub input_extent: Option<(usize, usize)>,
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.total_bytes += meta.len();
                }
            }
        }
    }

    stats
}

fn session_builder() -> Result<SessionBuilder> {
    Ok(Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?)
}

fn commit(builder: SessionBuilder, model_path: &Path) -> Result<Session> {
    builder.commit_from_file(model_path).map_err(|e| {
        PipelineError::io(
            model_path,
            anyhow::anyhow!("failed to load ONNX model: {e}"),
        )
        .into()
    })
}

fn build_cpu_session(model_path: &Path) -> Result<Session> {
    debug!(backend = "cpu", "Building session with CPU EP");
    commit(session_builder()?, model_path)
}

fn report_unavailable(requested: InferenceBackend, device_id: i32) {
    let err = PipelineError::Device(format!("{requested} device {device_id}"));
    warn!("{err}; falling back to CPU");
}

fn build_cuda_session(model_path: &Path, device_id: i32) -> Result<Session> {
    let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
    if !cuda.is_available().unwrap_or(false) {
        report_unavailable(InferenceBackend::Cuda, device_id);
        return build_cpu_session(model_path);
    }

    debug!(backend = "cuda", device_id, "Building session with CUDA EP");
    let builder = session_builder()?
        .with_execution_providers([cuda.build().error_on_failure()])?;
    match commit(builder, model_path) {
        Ok(session) => Ok(session),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "CUDA session failed");
            report_unavailable(InferenceBackend::Cuda, device_id);
            build_cpu_session(model_path)
        }
    }
}

fn build_tensorrt_session(config: &SessionConfig<'_>) -> Result<Session> {
    let context = config.context;
    let base_dir = context
        .trt_cache_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("trt_cache"));

    let cache_key = match sha256_file(config.model_path) {
        Ok(hash) => {
            let (h, w) = config.input_extent.unwrap_or((0, 0));
            Some(trt_cache_key(context.device_id, &hash, h, w))
        }
        Err(e) => {
            warn!(error = %e, "Failed to hash model; using shared TRT cache directory");
            None
        }
    };
    let cache_dir = resolve_trt_cache_dir(&base_dir, cache_key.as_deref());

    if let Err(e) = fs::create_dir_all(&cache_dir) {
        warn!(
            dir = %cache_dir.display(),
            error = %e,
            "Failed to create TRT cache directory"
        );
    }

    let before = cache_stats(&cache_dir);
    let started = Instant::now();
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        cache_bytes = before.total_bytes,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let (stop_tx, stop_rx) = channel::<()>();
    let progress_thread = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 15_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(elapsed_secs = elapsed, "TensorRT session initialization still in progress");
                    elapsed += 15;
                }
            }
        }
    });

    let cache_path = cache_dir.to_string_lossy().to_string();
    let session_result = session_builder().and_then(|builder| {
        let builder = builder.with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(&cache_path)
                .with_fp16(true)
                .with_device_id(context.device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(context.device_id)
                .build(),
        ])?;
        commit(builder, config.model_path)
    });

    let _ = stop_tx.send(());
    let _ = progress_thread.join();

    let elapsed = started.elapsed().as_secs_f64();
    match session_result {
        Ok(session) => {
            let after = cache_stats(&cache_dir);
            info!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                cache_files = after.file_count,
                cache_updated = after.total_bytes != before.total_bytes,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(e) => {
            error!(
                elapsed_secs = elapsed,
                error = %format!("{e:#}"),
                "TensorRT session initialization failed; retrying with CUDA"
            );
            build_cuda_session(config.model_path, context.device_id)
        }
    }
}

/// Build an `ort::Session` for the requested backend, walking the
/// TensorRT → CUDA → CPU fallback chain.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    if !config.model_path.is_file() {
        return Err(PipelineError::io(
            config.model_path,
            anyhow::anyhow!("model file not found"),
        )
        .into());
    }

    match config.context.backend {
        InferenceBackend::Cpu => build_cpu_session(config.model_path),
        InferenceBackend::Cuda => build_cuda_session(config.model_path, config.context.device_id),
        InferenceBackend::Tensorrt => build_tensorrt_session(config),
    }
}

/// Format: `dev{device_id}_{model_hash[..16]}_{input_h}x{input_w}`
pub fn trt_cache_key(device_id: i32, model_hash: &str, input_h: usize, input_w: usize) -> String {
    let short = &model_hash[..model_hash.len().min(16)];
    format!("dev{device_id}_{short}_{input_h}x{input_w}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}
