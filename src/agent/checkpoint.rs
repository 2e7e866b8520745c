//! Agent snapshots: one JSON document holding each trainable component's
//! epoch, parameters and optimizer state.
//!
//! Parameters are restored by overlaying the saved tree onto the current one,
//! so a snapshot from a slightly different model still loads: keys present on
//! one side only are reported and left alone.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, Record};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{AgentError, Result};

pub const STATE_ENCODER: &str = "state-encoder";
pub const CRITIC: &str = "critic";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub epoch: usize,
    pub parameters: Value,
    pub optimizer: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(flatten)]
    pub components: BTreeMap<String, ComponentSnapshot>,
}

impl Checkpoint {
    pub fn component(&self, name: &str) -> Result<&ComponentSnapshot> {
        self.components
            .get(name)
            .ok_or_else(|| AgentError::Checkpoint(format!("missing component {}", name)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Keys that differed between the current and the saved parameter trees.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OverlayReport {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
}

impl OverlayReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
    )
}

/// Copies `source` into `target` wherever the structure agrees.
pub fn overlay(target: &mut Value, source: &Value, path: &str, report: &mut OverlayReport) {
    match (target, source) {
        (Value::Object(current), Value::Object(saved)) => {
            // Tensor data only replaces tensor data of the same shape
            if let (Some(current_shape), Some(saved_shape)) = (current.get("shape"), saved.get("shape")) {
                if current_shape != saved_shape {
                    report.mismatched.push(path.to_string());
                    return;
                }
            }
            for (key, value) in current.iter_mut() {
                match saved.get(key) {
                    Some(saved_value) => overlay(value, saved_value, &child_path(path, key), report),
                    None => report.missing.push(child_path(path, key)),
                }
            }
            for key in saved.keys().filter(|key| !current.contains_key(*key)) {
                report.unexpected.push(child_path(path, key));
            }
        }
        (target, source) if same_kind(target, source) => *target = source.clone(),
        _ => report.mismatched.push(path.to_string()),
    }
}

pub fn snapshot<B, M, O>(epoch: usize, module: &M, optimizer: &O) -> Result<ComponentSnapshot>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let parameters = serde_json::to_value(
        module
            .clone()
            .into_record()
            .into_item::<FullPrecisionSettings>(),
    )?;
    let optimizer = serde_json::to_value(optimizer.to_record().into_item::<FullPrecisionSettings>())?;
    Ok(ComponentSnapshot {
        epoch,
        parameters,
        optimizer,
    })
}

/// Loads matching parameters from `saved` into `module`.
pub fn restore_module<B, M>(module: M, name: &str, saved: &Value, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    let mut merged = serde_json::to_value(
        module
            .clone()
            .into_record()
            .into_item::<FullPrecisionSettings>(),
    )?;
    let mut report = OverlayReport::default();
    overlay(&mut merged, saved, "", &mut report);
    if !report.is_clean() {
        warn!(
            "Partial load of {}: missing {:?}, unexpected {:?}, shape mismatch {:?}",
            name, report.missing, report.unexpected, report.mismatched
        );
    }

    let item: <M::Record as Record<B>>::Item<FullPrecisionSettings> = serde_json::from_value(merged)?;
    let record = <M::Record as Record<B>>::from_item::<FullPrecisionSettings>(item, device);
    Ok(module.load_record(record))
}

pub fn restore_optimizer<B, M, O>(optimizer: O, saved: &Value, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let item: <O::Record as Record<B>>::Item<FullPrecisionSettings> =
        serde_json::from_value(saved.clone())?;
    let record = <O::Record as Record<B>>::from_item::<FullPrecisionSettings>(item, device);
    Ok(optimizer.load_record(record))
}
