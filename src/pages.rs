use crate::inference_service::Classification;
use minijinja::{context, Environment, Value};
use serde::Deserialize;
use thiserror::Error;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");
const RESULT_TEMPLATE: &str = include_str!("../templates/result.html");

#[derive(Error, Debug)]
#[error("Failed to render page: {0}")]
pub struct RenderError(#[from] minijinja::Error);

/// Message shown above the upload form after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    Processing,
    ModelUnavailable,
}

impl Notice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Notice::Processing => "processing",
            Notice::ModelUnavailable => "model_unavailable",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Notice::Processing => "The image could not be processed. Please try another file.",
            Notice::ModelUnavailable => "The model is not loaded. Classification is unavailable.",
        }
    }
}

/// The landing and result pages. Templates ending in `.html` are
/// auto-escaped.
pub struct Pages {
    env: Environment<'static>,
}

impl Pages {
    pub fn new() -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.add_template("index.html", INDEX_TEMPLATE)?;
        env.add_template("result.html", RESULT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn index(&self, notice: Option<Notice>) -> Result<String, RenderError> {
        let page = self.env.get_template("index.html")?.render(context! {
            notice => notice.map(|notice| notice.message()),
        })?;
        Ok(page)
    }

    pub fn result(&self, classification: &Classification) -> Result<String, RenderError> {
        let page = self.env.get_template("result.html")?.render(context! {
            image => Value::from_safe_string(classification.encoded_image.clone()),
            predicted_class => classification.class_index,
            label => &classification.label,
            confidence => format!("{:.3}", classification.confidence),
        })?;
        Ok(page)
    }
}
