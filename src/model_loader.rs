use crate::{config::ModelConfig, model_service::ModelService, ort_service::OrtModelService};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
    sync::Arc,
};

/// Loads the model artifact once at startup. A failure is logged and leaves
/// the service without a model; later classifications report it explicitly.
pub fn load_model(model_config: &ModelConfig) -> Option<Arc<dyn ModelService>> {
    if let Err(e) = model_config.validate() {
        tracing::error!("Model configuration validation failed: {}", e);
        return None;
    }

    match OrtModelService::new(model_config) {
        Ok(service) => {
            tracing::info!("Model loaded from {:?}", model_config.get_path());
            Some(Arc::new(service))
        }
        Err(e) => {
            tracing::error!("Error loading model: {}", e);
            None
        }
    }
}

/// Loads the optional class labels file. Missing configuration yields an
/// empty list; a broken file is logged and ignored.
pub fn load_configured_labels(model_config: &ModelConfig) -> Vec<String> {
    let Some(path) = model_config.get_labels_path() else {
        return Vec::new();
    };

    match load_labels(&path) {
        Ok(labels) => {
            tracing::info!("Loaded {} class labels from {:?}", labels.len(), path);
            labels
        }
        Err(e) => {
            tracing::warn!("Failed to load labels from {:?}: {}", path, e);
            Vec::new()
        }
    }
}

pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for (line_number, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let label = line.trim();

        if label.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Empty label on line {}", line_number + 1),
            ));
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}
