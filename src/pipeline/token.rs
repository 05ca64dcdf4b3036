//! Resume tokens
//!
//! A token is compact JSON encoded as unpadded base64url. It carries
//! everything needed to continue a paused run: the pipeline source, the
//! index of the gate stage, and the output of the last completed stage.
//!
//! Tokens are neither encrypted nor signed. Anyone holding one can read the
//! carried value and can forge a token for any stage, so treat them like the
//! data they carry. Gate approval is still checked on resume.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::validate_id;
use crate::{Error, Result};

const TOKEN_VERSION: u32 = 1;

/// Decoded resume token
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeToken {
    /// Pipeline source string, verbatim
    pub pipeline: String,
    /// Stage to continue from
    pub stage_index: usize,
    /// Output of the stage before `stage_index` (`None` if there was none)
    pub carried: Option<Vec<Value>>,
    /// Workflow whose gates the resumed run checks
    pub workflow_id: Option<String>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    p: &'a str,
    i: usize,
    c: &'a Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    w: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    v: u32,
    p: String,
    i: usize,
    c: Option<Vec<Value>>,
    #[serde(default)]
    w: Option<String>,
}

impl ResumeToken {
    pub fn new(pipeline: impl Into<String>, stage_index: usize, carried: Option<Vec<Value>>) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage_index,
            carried,
            workflow_id: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Encode into an opaque URL-safe string
    pub fn encode(&self) -> Result<String> {
        let envelope = EnvelopeRef {
            v: TOKEN_VERSION,
            p: &self.pipeline,
            i: self.stage_index,
            c: &self.carried,
            w: self.workflow_id.as_deref(),
        };
        let json = serde_json::to_vec(&envelope)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a string produced by [`ResumeToken::encode`]
    pub fn decode(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidToken("token is empty".to_string()));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| Error::InvalidToken(format!("not base64url: {}", e)))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidToken(format!("malformed payload: {}", e)))?;

        if envelope.v != TOKEN_VERSION {
            return Err(Error::InvalidToken(format!(
                "unsupported token version {}",
                envelope.v
            )));
        }
        if let Some(workflow_id) = &envelope.w {
            validate_id("workflow id", workflow_id)
                .map_err(|_| Error::InvalidToken(format!("bad workflow id '{}'", workflow_id)))?;
        }

        Ok(Self {
            pipeline: envelope.p,
            stage_index: envelope.i,
            carried: envelope.c,
            workflow_id: envelope.w,
        })
    }
}

/// Encode a (pipeline, stage index, carried value) triple
pub fn encode(pipeline: &str, stage_index: usize, carried: Option<Vec<Value>>) -> Result<String> {
    ResumeToken::new(pipeline, stage_index, carried).encode()
}

/// Decode a token back into its (pipeline, stage index, carried value) triple
pub fn decode(token: &str) -> Result<(String, usize, Option<Vec<Value>>)> {
    let decoded = ResumeToken::decode(token)?;
    Ok((decoded.pipeline, decoded.stage_index, decoded.carried))
}
