//! Wire format of the browser-automation backend.
//!
//! Outbound frames are JSON objects tagged by `action`. The backend echoes the
//! `action` (and the `id` when it supports one) and adds a `status` field.
//! Frames carrying an `event` field are unsolicited pushes, not responses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::detector::Detection;
use crate::error::TransportError;

/// How a frame switch locates its target element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Css,
    Xpath,
}

/// One step inside `performSequentialActions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SequentialStep {
    Click { selector: String },
    Xpath { xpath: String },
}

/// Closed action vocabulary understood by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    /// Presence check: does any element under `selector` carry one of the names
    CheckUsername {
        selector: String,
        #[serde(rename = "expectedText")]
        expected_text: Vec<String>,
    },
    /// Find the first listed rival and click it
    SearchAndClick { rivals: Vec<String> },
    FindAndClickByPartialText { text: String },
    Click { selector: String },
    Xpath { xpath: String },
    WaitForClickable { selector: String },
    #[serde(rename = "waitForXPath")]
    WaitForXPath { xpath: String },
    PressShiftC { selector: String },
    SwitchToFrame {
        #[serde(rename = "frameIndex")]
        frame_index: u32,
        #[serde(rename = "selectorType")]
        selector_type: SelectorType,
        selector: String,
    },
    SwitchToFramePlanet {
        #[serde(rename = "frameIndex")]
        frame_index: u32,
        #[serde(rename = "selectorType")]
        selector_type: SelectorType,
        selector: String,
    },
    SwitchToDefaultFrame { selector: String },
    EnterRecoveryCode { code: String },
    /// Remote-side pause
    Sleep { ms: u64 },
    ReloadPage,
    PerformSequentialActions { actions: Vec<SequentialStep> },
    Screenshot { path: String },
}

impl Request {
    /// Wire name of the action (used for correlation and logging)
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::CheckUsername { .. } => "checkUsername",
            Self::SearchAndClick { .. } => "searchAndClick",
            Self::FindAndClickByPartialText { .. } => "findAndClickByPartialText",
            Self::Click { .. } => "click",
            Self::Xpath { .. } => "xpath",
            Self::WaitForClickable { .. } => "waitForClickable",
            Self::WaitForXPath { .. } => "waitForXPath",
            Self::PressShiftC { .. } => "pressShiftC",
            Self::SwitchToFrame { .. } => "switchToFrame",
            Self::SwitchToFramePlanet { .. } => "switchToFramePlanet",
            Self::SwitchToDefaultFrame { .. } => "switchToDefaultFrame",
            Self::EnterRecoveryCode { .. } => "enterRecoveryCode",
            Self::Sleep { .. } => "sleep",
            Self::ReloadPage => "reloadPage",
            Self::PerformSequentialActions { .. } => "performSequentialActions",
            Self::Screenshot { .. } => "screenshot",
        }
    }

    /// Extra time the backend needs on top of the fixed deadline
    pub fn remote_duration_ms(&self) -> u64 {
        match self {
            Self::Sleep { ms } => *ms,
            _ => 0,
        }
    }

    /// Serialise with the correlation id attached
    pub fn to_frame(&self, id: u64) -> Result<String, TransportError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| TransportError::Malformed(e.to_string()))?;
        if let Value::Object(obj) = &mut value {
            obj.insert("id".to_string(), Value::from(id));
        }
        Ok(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Decoded response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub action: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Action-specific result fields (`matches`, `flag`, `matchedRival`, ...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    pub fn success(action: &str) -> Self {
        Self {
            action: action.to_string(),
            status: ResponseStatus::Success,
            message: None,
            id: None,
            fields: Map::new(),
        }
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Required boolean result field
    pub fn require_bool(&self, key: &str) -> Result<bool, TransportError> {
        self.bool_field(key).ok_or_else(|| {
            TransportError::Malformed(format!("'{}' response lacks '{}'", self.action, key))
        })
    }

    /// Turn an `error` status into `TransportError::Remote`
    pub fn into_result(self) -> Result<Response, TransportError> {
        match self.status {
            ResponseStatus::Success => Ok(self),
            ResponseStatus::Error => Err(TransportError::Remote {
                action: self.action,
                message: self.message.unwrap_or_else(|| "unspecified error".to_string()),
            }),
        }
    }
}

/// Event name of pushed opponent detections
pub const OPPONENT_DETECTED_EVENT: &str = "opponentDetected";

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Detection(Detection),
    /// Unknown event or unparseable frame
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionFrame {
    identifier: String,
    #[serde(default)]
    timestamp_ms: Option<f64>,
}

/// Classify one text frame. `now_epoch_ms` stamps detections without a timestamp.
pub fn parse_inbound(text: &str, now_epoch_ms: f64) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Ignored,
    };

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        if event != OPPONENT_DETECTED_EVENT {
            return Inbound::Ignored;
        }
        return match serde_json::from_value::<DetectionFrame>(value) {
            Ok(frame) => Inbound::Detection(Detection {
                identifier: frame.identifier,
                timestamp_ms: frame
                    .timestamp_ms
                    .filter(|t| t.is_finite())
                    .unwrap_or(now_epoch_ms),
            }),
            Err(_) => Inbound::Ignored,
        };
    }

    match serde_json::from_value::<Response>(value) {
        Ok(resp) => Inbound::Response(resp),
        Err(_) => Inbound::Ignored,
    }
}
