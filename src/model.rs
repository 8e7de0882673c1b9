//! Supported models and their per-model defaults.

use crate::error::FreeseekError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Static defaults for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    /// Identifier sent on the wire.
    pub id: &'static str,
    /// Path, relative to the base URL, that serves inference.
    pub endpoint: &'static str,
    /// `max_tokens` used when neither request nor config sets one.
    pub default_max_tokens: u32,
    /// Largest `max_tokens` the model accepts.
    pub max_output_tokens: u32,
}

const LIGHT: ModelSpec = ModelSpec {
    id: "freeseek-light",
    endpoint: "infer",
    default_max_tokens: 512,
    max_output_tokens: 2_048,
};

const V3: ModelSpec = ModelSpec {
    id: "freeseek-v3",
    endpoint: "infer",
    default_max_tokens: 1_024,
    max_output_tokens: 8_192,
};

const PRO: ModelSpec = ModelSpec {
    id: "freeseek-pro",
    endpoint: "infer",
    default_max_tokens: 2_048,
    max_output_tokens: 32_768,
};

/// A model served by the inference API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Model {
    /// Small, fast, cheap.
    Light,
    /// General-purpose default.
    #[default]
    V3,
    /// Highest quality, for long or complex prompts.
    Pro,
}

impl Model {
    /// Every supported model.
    pub const ALL: [Model; 3] = [Model::Light, Model::V3, Model::Pro];

    /// Defaults for this model.
    pub fn spec(self) -> &'static ModelSpec {
        match self {
            Model::Light => &LIGHT,
            Model::V3 => &V3,
            Model::Pro => &PRO,
        }
    }

    /// Wire identifier.
    pub fn id(self) -> &'static str {
        self.spec().id
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Model {
    type Err = FreeseekError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Model::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FreeseekError::validation("model", format!("unknown model '{s}'")))
    }
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl<'de> Deserialize<'de> for Model {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = String::deserialize(deserializer)?;
        id.parse().map_err(serde::de::Error::custom)
    }
}
