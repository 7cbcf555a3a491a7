use serde::Serialize;

use crate::config::Settings;
use crate::error::GateError;

/// Backend families the executor knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    AzureOpenAi,
    GoogleGenAi,
}

/// Supported model names. Each maps to exactly one family and the
/// provider-side model or deployment it runs on.
const MODEL_TABLE: &[(&str, ModelFamily, &str)] = &[
    ("gpt-4.1-mini", ModelFamily::AzureOpenAi, "gpt-4.1-mini"),
    ("gpt-4.1", ModelFamily::AzureOpenAi, "gpt-4.1"),
    ("gemini-flash", ModelFamily::GoogleGenAi, "gemini-2.0-flash"),
    ("gemini-2.5-pro", ModelFamily::GoogleGenAi, "gemini-2.5-pro"),
];

pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// Non-secret description of the backend a turn runs on. Credentials stay
/// with the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelBackend {
    AzureOpenAi {
        endpoint: String,
        api_version: String,
        deployment: String,
        temperature: f32,
    },
    GoogleGenAi {
        model: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHandle {
    /// Name the user selected.
    pub name: String,
    pub backend: ModelBackend,
}

impl ModelHandle {
    pub fn family(&self) -> ModelFamily {
        match self.backend {
            ModelBackend::AzureOpenAi { .. } => ModelFamily::AzureOpenAi,
            ModelBackend::GoogleGenAi { .. } => ModelFamily::GoogleGenAi,
        }
    }

    pub fn azure_openai(name: &str, deployment: &str, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            backend: ModelBackend::AzureOpenAi {
                endpoint: settings.azure_inference_endpoint.clone(),
                api_version: settings.azure_api_version.clone(),
                deployment: deployment.to_string(),
                temperature: 0.1,
            },
        }
    }

    pub fn google_genai(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: ModelBackend::GoogleGenAi {
                model: model.to_string(),
            },
        }
    }
}

pub fn supported_models() -> impl Iterator<Item = &'static str> {
    MODEL_TABLE.iter().map(|(name, _, _)| *name)
}

/// Map a model name to its backend. Unknown names are a configuration
/// error, never a silent default.
pub fn resolve_model(name: &str, settings: &Settings) -> Result<ModelHandle, GateError> {
    let (_, family, target) = MODEL_TABLE
        .iter()
        .find(|(n, _, _)| *n == name)
        .ok_or_else(|| GateError::Configuration(format!("This model is not supported: {name}")))?;

    Ok(match family {
        ModelFamily::AzureOpenAi => ModelHandle::azure_openai(name, target, settings),
        ModelFamily::GoogleGenAi => ModelHandle::google_genai(name, target),
    })
}
