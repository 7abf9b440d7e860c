//! Transducer backend via the `ort` crate.
//!
//! Targets the streaming cache-aware export, three graphs per artifact
//! directory:
//!
//! | File | Inputs | Outputs |
//! |------|--------|---------|
//! | `streaming_encoder.onnx` | `audio_signal [1,128,T]`, `audio_length [1]`, `pre_cache`, `cache_last_channel`, `cache_last_time`, `cache_last_channel_len` | `encoded_output [1,F,frames]`, `new_pre_cache`, `new_cache_last_channel`, `new_cache_last_time`, `new_cache_last_channel_len` |
//! | `decoder.onnx` | `targets [1,1]`, `target_length [1]`, `states.1 [2,1,640]`, `states.2 [2,1,640]` | `[0]` output `[1,640,1]`, `[1]` new states.1, `[2]` new states.2 |
//! | `joint_decision.onnx` | `encoder_outputs [1,F,1]`, `decoder_outputs [1,640,1]` | `[0]` logits `[.., V+2]` |
//!
//! The joint's trailing two logit slots are the blank and end-of-utterance
//! classes. `vocab.json` sits next to the graphs.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array3, Array4};
use ort::session::{Session, SessionOutputs};
use ort::value::Value;
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use tracing::{debug, info};

use crate::error::{LoquiError, Result};
use crate::inference::{
    DecoderForward, EncoderCaches, EncoderForward, StreamingModels, DECODER_STATE_DIM,
    DECODER_STATE_LAYERS,
};

// ── Model config ─────────────────────────────────────────────────────────────

pub struct OnnxModelConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub joint_path: PathBuf,
    pub vocab_path: PathBuf,
}

impl OnnxModelConfig {
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            encoder_path: dir.join("streaming_encoder.onnx"),
            decoder_path: dir.join("decoder.onnx"),
            joint_path: dir.join("joint_decision.onnx"),
            vocab_path: dir.join("vocab.json"),
        }
    }
}

impl Default for OnnxModelConfig {
    fn default() -> Self {
        Self::from_dir(&default_models_dir())
    }
}

pub fn default_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("LOQUI_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("loqui")
        .join("models")
}

fn create_session(model_path: &Path) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("LOQUI_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or_else(|| logical_cores.clamp(2, 12))
        .clamp(1, 32);
    let inter_threads = std::env::var("LOQUI_ORT_INTER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 8);

    let builder = SessionBuilder::new()
        .map_err(|e| LoquiError::Inference(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| LoquiError::Inference(e.to_string()))?
        .with_inter_threads(inter_threads)
        .map_err(|e| LoquiError::Inference(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| LoquiError::Inference(e.to_string()))?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(|e| LoquiError::Inference(e.to_string()))?;
    debug!(intra_threads, inter_threads, logical_cores, "ONNX session threading configured");

    builder
        .commit_from_file(model_path)
        .map_err(|e| LoquiError::Inference(e.to_string()))
}

// ── OnnxModels ───────────────────────────────────────────────────────────────

pub struct OnnxModels {
    config: OnnxModelConfig,
    encoder: Option<Session>,
    decoder: Option<Session>,
    joint: Option<Session>,
}

impl OnnxModels {
    pub fn new(config: OnnxModelConfig) -> Self {
        Self {
            config,
            encoder: None,
            decoder: None,
            joint: None,
        }
    }

    fn log_session_io(name: &str, session: &Session) {
        info!("  {name} inputs:");
        for input in session.inputs().iter() {
            info!("    {}", input.name());
        }
        info!("  {name} outputs:");
        for output in session.outputs().iter() {
            info!("    {}", output.name());
        }
    }
}

impl StreamingModels for OnnxModels {
    fn warm_up(&mut self) -> Result<()> {
        info!("=== loqui ONNX model startup report ===");

        for path in [
            &self.config.encoder_path,
            &self.config.decoder_path,
            &self.config.joint_path,
        ] {
            if !path.exists() {
                info!("  {:?}: NOT FOUND", path);
                return Err(LoquiError::ModelNotFound { path: path.clone() });
            }
            let size_mb = std::fs::metadata(path)
                .map(|m| m.len() as f64 / 1_048_576.0)
                .unwrap_or(0.0);
            info!("  {:?}: {:.2} MB", path, size_mb);
        }

        info!("loading streaming encoder from {:?}", self.config.encoder_path);
        self.encoder = Some(create_session(&self.config.encoder_path)?);
        Self::log_session_io("encoder", self.encoder.as_ref().unwrap());

        info!("loading decoder from {:?}", self.config.decoder_path);
        self.decoder = Some(create_session(&self.config.decoder_path)?);
        Self::log_session_io("decoder", self.decoder.as_ref().unwrap());

        info!("loading joint from {:?}", self.config.joint_path);
        self.joint = Some(create_session(&self.config.joint_path)?);
        Self::log_session_io("joint", self.joint.as_ref().unwrap());

        // Dummy prediction-network step to populate runtime caches. The
        // encoder is skipped here: its pre-cache width depends on the chunk
        // profile the first real session will use.
        let zeros = Array3::<f32>::zeros((DECODER_STATE_LAYERS, 1, DECODER_STATE_DIM));
        self.decoder(0, &zeros, &zeros)?;

        info!("=== ONNX model warm-up complete ===");
        Ok(())
    }

    fn streaming_encoder(
        &mut self,
        audio_signal: &Array3<f32>,
        audio_length: i32,
        caches: &EncoderCaches,
    ) -> Result<EncoderForward> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(LoquiError::NotInitialized);
        };

        let signal = Value::from_array(audio_signal.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let length = Value::from_array(Array1::from_vec(vec![audio_length]))
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let pre_cache = Value::from_array(caches.pre_cache.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let last_channel = Value::from_array(caches.last_channel.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let last_time = Value::from_array(caches.last_time.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let last_channel_len = Value::from_array(caches.last_channel_len.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;

        let outputs = encoder
            .run(ort::inputs![
                "audio_signal"           => signal,
                "audio_length"           => length,
                "pre_cache"              => pre_cache,
                "cache_last_channel"     => last_channel,
                "cache_last_time"        => last_time,
                "cache_last_channel_len" => last_channel_len,
            ])
            .map_err(|e| LoquiError::Inference(e.to_string()))?;

        // The replacement record is assembled in full before returning, so
        // the caller can install it atomically.
        let encoded = extract3(&outputs, "encoded_output")?;
        let caches = EncoderCaches {
            pre_cache: extract3(&outputs, "new_pre_cache")?,
            last_channel: extract4(&outputs, "new_cache_last_channel")?,
            last_time: extract4(&outputs, "new_cache_last_time")?,
            last_channel_len: extract1_i32(&outputs, "new_cache_last_channel_len")?,
        };

        Ok(EncoderForward { encoded, caches })
    }

    fn decoder(
        &mut self,
        last_token: i32,
        hidden: &Array3<f32>,
        cell: &Array3<f32>,
    ) -> Result<DecoderForward> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(LoquiError::NotInitialized);
        };

        let targets = Value::from_array(ndarray::Array2::from_elem((1, 1), last_token))
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let target_length = Value::from_array(Array1::from_vec(vec![1i32]))
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let states_1 = Value::from_array(hidden.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let states_2 = Value::from_array(cell.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;

        let outputs = decoder
            .run(ort::inputs![
                "targets"       => targets,
                "target_length" => target_length,
                "states.1"      => states_1,
                "states.2"      => states_2,
            ])
            .map_err(|e| LoquiError::Inference(e.to_string()))?;

        Ok(DecoderForward {
            output: extract3_at(&outputs, 0)?,
            hidden: extract3_at(&outputs, 1)?,
            cell: extract3_at(&outputs, 2)?,
        })
    }

    fn joint(&mut self, encoder_frame: &Array3<f32>, decoder_out: &Array3<f32>) -> Result<Vec<f32>> {
        let Some(joint) = self.joint.as_mut() else {
            return Err(LoquiError::NotInitialized);
        };

        let encoder_outputs = Value::from_array(encoder_frame.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;
        let decoder_outputs = Value::from_array(decoder_out.clone())
            .map_err(|e: ort::Error| LoquiError::Inference(e.to_string()))?;

        let outputs = joint
            .run(ort::inputs![
                "encoder_outputs" => encoder_outputs,
                "decoder_outputs" => decoder_outputs,
            ])
            .map_err(|e| LoquiError::Inference(e.to_string()))?;

        // Logits come back as [1, 1, 1, V+2]; the flat data is the vector.
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LoquiError::Inference(e.to_string()))?;
        Ok(data.to_vec())
    }
}

// ── Tensor extraction helpers ────────────────────────────────────────────────

fn extract3(outputs: &SessionOutputs<'_>, name: &str) -> Result<Array3<f32>> {
    let (shape, data) = outputs[name]
        .try_extract_tensor::<f32>()
        .map_err(|e| LoquiError::Inference(format!("{name}: {e}")))?;
    if shape.len() != 3 {
        return Err(LoquiError::Inference(format!(
            "{name}: expected rank 3, got {shape:?}"
        )));
    }
    Array3::from_shape_vec(
        (shape[0] as usize, shape[1] as usize, shape[2] as usize),
        data.to_vec(),
    )
    .map_err(|e| LoquiError::Inference(format!("{name}: {e}")))
}

fn extract3_at(outputs: &SessionOutputs<'_>, index: usize) -> Result<Array3<f32>> {
    let (shape, data) = outputs[index]
        .try_extract_tensor::<f32>()
        .map_err(|e| LoquiError::Inference(format!("output {index}: {e}")))?;
    if shape.len() != 3 {
        return Err(LoquiError::Inference(format!(
            "output {index}: expected rank 3, got {shape:?}"
        )));
    }
    Array3::from_shape_vec(
        (shape[0] as usize, shape[1] as usize, shape[2] as usize),
        data.to_vec(),
    )
    .map_err(|e| LoquiError::Inference(format!("output {index}: {e}")))
}

fn extract4(outputs: &SessionOutputs<'_>, name: &str) -> Result<Array4<f32>> {
    let (shape, data) = outputs[name]
        .try_extract_tensor::<f32>()
        .map_err(|e| LoquiError::Inference(format!("{name}: {e}")))?;
    if shape.len() != 4 {
        return Err(LoquiError::Inference(format!(
            "{name}: expected rank 4, got {shape:?}"
        )));
    }
    Array4::from_shape_vec(
        (
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
        ),
        data.to_vec(),
    )
    .map_err(|e| LoquiError::Inference(format!("{name}: {e}")))
}

fn extract1_i32(outputs: &SessionOutputs<'_>, name: &str) -> Result<Array1<i32>> {
    let (_, data) = outputs[name]
        .try_extract_tensor::<i32>()
        .map_err(|e| LoquiError::Inference(format!("{name}: {e}")))?;
    Ok(Array1::from_vec(data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_resolves_artifact_names_from_dir() {
        let config = OnnxModelConfig::from_dir(Path::new("/models/eou"));
        assert_eq!(
            config.encoder_path,
            Path::new("/models/eou/streaming_encoder.onnx")
        );
        assert_eq!(config.decoder_path, Path::new("/models/eou/decoder.onnx"));
        assert_eq!(
            config.joint_path,
            Path::new("/models/eou/joint_decision.onnx")
        );
        assert_eq!(config.vocab_path, Path::new("/models/eou/vocab.json"));
    }

    #[test]
    fn calls_before_warm_up_are_not_initialized() {
        let mut models = OnnxModels::new(OnnxModelConfig::from_dir(Path::new("/nonexistent")));
        let zeros = Array3::<f32>::zeros((2, 1, DECODER_STATE_DIM));
        let err = models.decoder(0, &zeros.clone(), &zeros).unwrap_err();
        assert!(matches!(err, LoquiError::NotInitialized));
    }

    #[test]
    fn missing_artifacts_surface_as_model_not_found() {
        let mut models = OnnxModels::new(OnnxModelConfig::from_dir(Path::new("/nonexistent")));
        let err = models.warm_up().unwrap_err();
        assert!(matches!(err, LoquiError::ModelNotFound { .. }));
    }
}
