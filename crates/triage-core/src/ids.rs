//! Branded identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an externally supplied identifier without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Opaque session identifier. Usually supplied by the caller that starts
    /// the diagnostic encounter.
    SessionId,
    "sess"
);
branded_id!(
    /// Identifier of one physical client connection.
    ChannelId,
    "chan"
);
branded_id!(
    /// Identifier of one workflow instance within a session.
    WorkflowId,
    "wf"
);

/// Identifier of a pipeline stage (e.g. `llm_diagnosis`).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Language-model symptom diagnosis.
    pub const LLM_DIAGNOSIS: &'static str = "llm_diagnosis";
    /// Follow-up questions for low-confidence diagnoses.
    pub const FOLLOW_UP_INTERACTION: &'static str = "follow_up_interaction";
    /// Skin-lesion image classification.
    pub const IMAGE_CLASSIFICATION: &'static str = "image_classification";
    /// Aggregate analysis across all prior stages.
    pub const OVERALL_ANALYSIS: &'static str = "overall_analysis";
    /// Treatment and care recommendation.
    pub const TREATMENT_RECOMMENDATION: &'static str = "treatment_recommendation";
    /// Final report generation.
    pub const REPORT_GENERATION: &'static str = "report_generation";

    /// Create a stage identifier.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for StageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
