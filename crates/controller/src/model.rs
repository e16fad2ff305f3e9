//! Decision model seam and the linear model shipped with the controller.
//!
//! The model file is produced off-device (training is done in the cloud) and
//! re-read whenever the cloud announces a new version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{ControlError, ControlResult};

/// One model input: a number or a categorical label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Feature {
    Number(f64),
    Category(String),
}

pub type Features = BTreeMap<String, Feature>;

/// Raw model output; the arbiter clamps both fields at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub fertilizer_percent: f64,
    /// Litres for the whole day.
    pub water_amount: f64,
}

pub trait DecisionModel: Send + Sync {
    fn predict(&self, features: &Features) -> ControlResult<Prediction>;

    /// Pick up a newer model version, if the implementation has one.
    fn reload(&self) -> ControlResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Linear model
// ---------------------------------------------------------------------------

/// One regression output.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LinearHead {
    pub intercept: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Per categorical feature, the offset added for each label.
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<String, f64>>,
}

impl LinearHead {
    fn eval(&self, features: &Features) -> ControlResult<f64> {
        let mut y = self.intercept;
        for (name, w) in &self.weights {
            match features.get(name) {
                Some(Feature::Number(x)) => y += w * x,
                Some(Feature::Category(_)) => {
                    return Err(ControlError::BadShape(format!("feature '{name}' is not numeric")))
                }
                None => return Err(ControlError::BadShape(format!("missing feature '{name}'"))),
            }
        }
        for (name, offsets) in &self.categories {
            match features.get(name) {
                Some(Feature::Category(label)) => y += offsets.get(label).copied().unwrap_or(0.0),
                Some(Feature::Number(_)) => {
                    return Err(ControlError::BadShape(format!(
                        "feature '{name}' is not categorical"
                    )))
                }
                None => return Err(ControlError::BadShape(format!("missing feature '{name}'"))),
            }
        }
        if !y.is_finite() {
            return Err(ControlError::BadShape("model produced a non-finite output".into()));
        }
        Ok(y)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearParams {
    #[serde(default)]
    pub version: String,
    pub fertilizer: LinearHead,
    pub water: LinearHead,
}

/// Linear model read from a JSON file.  Until a file has been loaded
/// successfully, `predict` fails with `ModelUnavailable`.
pub struct LinearModel {
    path: PathBuf,
    params: RwLock<Option<LinearParams>>,
}

impl LinearModel {
    /// Tries to load `path`; a missing or bad file is logged, not fatal.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let model = Self {
            path: path.as_ref().to_path_buf(),
            params: RwLock::new(None),
        };
        if let Err(e) = model.reload() {
            warn!(path = %model.path.display(), "decision model not loaded: {e}");
        }
        model
    }

    pub fn from_params(params: LinearParams) -> Self {
        Self {
            path: PathBuf::new(),
            params: RwLock::new(Some(params)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.params.read().map(|p| p.is_some()).unwrap_or(false)
    }

    fn read_file(&self) -> ControlResult<LinearParams> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            ControlError::ModelUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ControlError::ModelUnavailable(format!("{}: {e}", self.path.display()))
        })
    }
}

impl DecisionModel for LinearModel {
    fn predict(&self, features: &Features) -> ControlResult<Prediction> {
        let guard = self
            .params
            .read()
            .map_err(|_| ControlError::ModelUnavailable("model lock poisoned".into()))?;
        let params = guard
            .as_ref()
            .ok_or_else(|| ControlError::ModelUnavailable("no model loaded".into()))?;

        Ok(Prediction {
            fertilizer_percent: params.fertilizer.eval(features)?,
            water_amount: params.water.eval(features)?,
        })
    }

    /// Keeps the previous parameters if the new file cannot be read.
    fn reload(&self) -> ControlResult<()> {
        let params = self.read_file()?;
        info!(path = %self.path.display(), version = %params.version, "decision model loaded");
        let mut slot = self
            .params
            .write()
            .map_err(|_| ControlError::ModelUnavailable("model lock poisoned".into()))?;
        *slot = Some(params);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
