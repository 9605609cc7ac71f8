//! Wire format shared by the HTTP and queue intakes
//!
//! Source, stdin and captured output are arbitrary bytes, so they travel as
//! base64 (standard alphabet) strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RunnerError, RunnerResult};
use crate::pipeline::{ExecutionRequest, ExecutionResult, LimitOverrides};

/// Serde adapter: `Vec<u8>` <-> base64 string
pub mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` <-> optional base64 string
pub mod base64_bytes_opt {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

/// A job as submitted over HTTP or pushed onto the queue
///
/// The program is given either as base64 `source` or as plain-text `code`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunJob {
    /// Generated when absent
    #[serde(default)]
    pub request_id: Option<Uuid>,
    pub language: String,
    #[serde(default, with = "base64_bytes_opt")]
    pub source: Option<Vec<u8>>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, with = "base64_bytes_opt")]
    pub stdin: Option<Vec<u8>>,
    #[serde(default)]
    pub time_limit_ms: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
}

impl RunJob {
    /// The job's request id, assigning a fresh one if the submitter gave none
    pub fn request_id(&mut self) -> Uuid {
        *self.request_id.get_or_insert_with(Uuid::new_v4)
    }

    pub fn into_request(mut self) -> RunnerResult<ExecutionRequest> {
        let request_id = self.request_id();
        let source = match (self.source, self.code) {
            (Some(source), None) => source,
            (None, Some(code)) => code.into_bytes(),
            (Some(_), Some(_)) => {
                return Err(RunnerError::InvalidRequest(
                    "give either source or code, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(RunnerError::InvalidRequest(
                    "missing source".to_string(),
                ))
            }
        };

        Ok(ExecutionRequest {
            request_id,
            language: self.language,
            source,
            stdin: self.stdin,
            limits: LimitOverrides {
                time_limit_ms: self.time_limit_ms,
                memory_limit_mb: self.memory_limit_mb,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyError {
    pub kind: &'static str,
    pub message: String,
}

/// Answer to one job
#[derive(Debug, Clone, Serialize)]
pub struct RunReply {
    pub request_id: Uuid,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl RunReply {
    pub fn new(request_id: Uuid, outcome: RunnerResult<ExecutionResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                request_id,
                status: ReplyStatus::Completed,
                result: Some(result),
                error: None,
            },
            Err(e) => Self::failed(request_id, &e),
        }
    }

    pub fn failed(request_id: Uuid, error: &RunnerError) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Failed,
            result: None,
            error: Some(ReplyError {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }
}
