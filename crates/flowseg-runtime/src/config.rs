use std::path::Path;

use flowseg_core::{FrameSize, GeneratorError};
use flowseg_vision::preprocess::ResizeBackend;
use flowseg_vision::{FlowAlgorithm, FlowParams};
use serde::{Deserialize, Serialize};

/// Per-sample horizontal flip decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipPolicy {
    #[default]
    Disabled,
    /// Independent fair coin per sample.
    Random,
    /// Every sample is served twice in a row, unflipped then flipped.
    Alternate,
}

impl FlipPolicy {
    pub fn from_name(name: &str) -> Result<Self, GeneratorError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "none" | "disabled" => Ok(FlipPolicy::Disabled),
            "random" => Ok(FlipPolicy::Random),
            "alternate" => Ok(FlipPolicy::Alternate),
            other => Err(GeneratorError::invalid_config(format!(
                "unsupported flip policy {other:?} (expected: disabled|random|alternate)"
            ))),
        }
    }

    /// Stream positions consumed per sample in one pass over a split.
    pub fn positions_per_sample(&self) -> usize {
        match self {
            FlipPolicy::Alternate => 2,
            FlipPolicy::Disabled | FlipPolicy::Random => 1,
        }
    }
}

/// Where per-sample work runs inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeBackend {
    /// Samples are built one after another on the calling thread.
    #[default]
    Sequential,
    /// Samples are built in parallel on a dedicated rayon pool (`threads = 0` lets rayon pick).
    Rayon { threads: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub flip_policy: FlipPolicy,
    /// Seeds the flip coin; unseeded generators draw from the thread RNG.
    pub seed: Option<u64>,
    pub flow_algorithm: String,
    pub flow_params: FlowParams,
    /// Label downscale factors; one target is produced per entry, in order.
    pub label_scales: Vec<u32>,
    /// Adds `new - old` (normalized) to the batch inputs.
    pub with_diff: bool,
    pub resize_backend: ResizeBackend,
    pub compute: ComputeBackend,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            flip_policy: FlipPolicy::Disabled,
            seed: None,
            flow_algorithm: FlowAlgorithm::DenseInverseSearch.as_str().to_string(),
            flow_params: FlowParams::default(),
            label_scales: vec![1],
            with_diff: false,
            resize_backend: ResizeBackend::FastImageResize,
            compute: ComputeBackend::Sequential,
        }
    }
}

impl GeneratorConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, GeneratorError> {
        let cfg: GeneratorConfig = serde_json::from_slice(bytes)
            .map_err(|e| GeneratorError::invalid_config(format!("generator config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeneratorError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            GeneratorError::invalid_config(format!("read {}: {e}", path.display()))
        })?;
        Self::from_json(&bytes)
    }

    pub fn validate(&self) -> Result<(), GeneratorError> {
        FlowAlgorithm::from_name(&self.flow_algorithm)?;
        self.flow_params.validate()?;
        if self.label_scales.is_empty() {
            return Err(GeneratorError::invalid_config(
                "label_scales must contain at least one factor",
            ));
        }
        if self.label_scales.contains(&0) {
            return Err(GeneratorError::invalid_config("label_scales must be > 0"));
        }
        Ok(())
    }

    /// Applies flow-algorithm and flip-policy names given on a command line; `None` keeps the
    /// current value.
    pub fn with_overrides(
        mut self,
        flow_algorithm: Option<&str>,
        flip_policy: Option<&str>,
    ) -> Result<Self, GeneratorError> {
        if let Some(name) = flow_algorithm {
            FlowAlgorithm::from_name(name)?;
            self.flow_algorithm = name.to_string();
        }
        if let Some(name) = flip_policy {
            self.flip_policy = FlipPolicy::from_name(name)?;
        }
        Ok(self)
    }

    /// Every label scale must divide `target` exactly.
    pub fn check_target(&self, target: FrameSize) -> Result<(), GeneratorError> {
        target.validate()?;
        for &factor in &self.label_scales {
            target.scaled_down(factor)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCaps {
    /// Capacity of the channel between producer and consumers.
    pub max_queue_batches: usize,
    /// Batches built concurrently ahead of the consumer.
    pub prefetch_batches: usize,
    /// Upper bound on tensor bytes held by built-but-undropped batches.
    pub max_inflight_bytes: u64,
}

impl Default for StreamCaps {
    fn default() -> Self {
        Self {
            max_queue_batches: 4,
            prefetch_batches: 2,
            max_inflight_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl StreamCaps {
    pub fn validate(&self) -> Result<(), GeneratorError> {
        if self.max_queue_batches == 0 {
            return Err(GeneratorError::invalid_config("max_queue_batches must be > 0"));
        }
        if self.max_inflight_bytes == 0 {
            return Err(GeneratorError::invalid_config("max_inflight_bytes must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = GeneratorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.flip_policy, FlipPolicy::Disabled);
    }

    #[test]
    fn unknown_flow_algorithm_is_rejected() {
        let cfg = GeneratorConfig {
            flow_algorithm: "deepflow".into(),
            ..GeneratorConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(GeneratorError::UnsupportedFlowAlgorithm(_))
        ));
    }

    #[test]
    fn target_must_divide_by_every_scale() {
        let cfg = GeneratorConfig {
            label_scales: vec![4, 8, 16],
            ..GeneratorConfig::default()
        };
        cfg.check_target(FrameSize::new(256, 512)).unwrap();
        assert!(matches!(
            cfg.check_target(FrameSize::new(256, 500)),
            Err(GeneratorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = GeneratorConfig::from_json(
            br#"{"flip_policy":"alternate","label_scales":[2],"compute":{"rayon":{"threads":2}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.flip_policy, FlipPolicy::Alternate);
        assert_eq!(cfg.label_scales, vec![2]);
        assert_eq!(cfg.compute, ComputeBackend::Rayon { threads: 2 });
        assert_eq!(cfg.flow_algorithm, "dis");
    }

    #[test]
    fn partial_flow_params_fall_back_to_defaults() {
        let cfg = GeneratorConfig::from_json(br#"{"flow_params":{"iterations":4}}"#).unwrap();
        assert_eq!(cfg.flow_params.iterations, 4);
        assert_eq!(cfg.flow_params.max_levels, FlowParams::default().max_levels);
        assert!(GeneratorConfig::from_json(br#"{"flow_params":{"min_level_size":0}}"#).is_err());
    }

    #[test]
    fn unset_overrides_keep_file_settings() {
        let file = GeneratorConfig::from_json(br#"{"flow_algorithm":"lk","flip_policy":"random"}"#)
            .unwrap();
        let kept = file.clone().with_overrides(None, None).unwrap();
        assert_eq!(kept, file);

        let flags = file.with_overrides(Some("dis"), Some("alternate")).unwrap();
        assert_eq!(flags.flow_algorithm, "dis");
        assert_eq!(flags.flip_policy, FlipPolicy::Alternate);
        assert!(GeneratorConfig::default()
            .with_overrides(Some("farneback"), None)
            .is_err());
    }

    #[test]
    fn flip_policy_names() {
        assert_eq!(FlipPolicy::from_name("random").unwrap(), FlipPolicy::Random);
        assert_eq!(FlipPolicy::from_name("").unwrap(), FlipPolicy::Disabled);
        assert!(FlipPolicy::from_name("vertical").is_err());
    }
}
