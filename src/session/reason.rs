use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProctorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    TabSwitch,
    TimeUp,
    NoFace,
    MultipleFaces,
}

impl TerminationReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            TerminationReason::TabSwitch => "TAB_SWITCH",
            TerminationReason::TimeUp => "TIME_UP",
            TerminationReason::NoFace => "NO_FACE",
            TerminationReason::MultipleFaces => "MULTIPLE_FACES",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for TerminationReason {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TAB_SWITCH" => Ok(TerminationReason::TabSwitch),
            "TIME_UP" => Ok(TerminationReason::TimeUp),
            "NO_FACE" => Ok(TerminationReason::NoFace),
            "MULTIPLE_FACES" => Ok(TerminationReason::MultipleFaces),
            other => Err(ProctorError::InvalidRequest(format!("unknown termination reason {other}"))),
        }
    }
}

/// Human-readable cause for a stored reason tag. Unknown or missing tags
/// read as suspicious activity.
pub fn describe_reason(tag: Option<&str>) -> &'static str {
    match tag {
        Some("TAB_SWITCH") => "multiple tab switching attempts",
        Some("NO_FACE") => "face not being detected in frame",
        Some("MULTIPLE_FACES") => "multiple faces being detected",
        _ => "suspicious activity",
    }
}

/// What the "session ended" screen shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalView {
    pub reason: Option<String>,
    pub cause: &'static str,
}

impl TerminalView {
    pub fn for_tag(tag: Option<&str>) -> Self {
        Self {
            reason: tag.map(str::to_string),
            cause: describe_reason(tag),
        }
    }

    pub fn for_reason(reason: TerminationReason) -> Self {
        Self::for_tag(Some(reason.as_tag()))
    }

    pub fn message(&self) -> String {
        format!(
            "Your session has been terminated due to {}. Please contact your administrator for further assistance.",
            self.cause
        )
    }
}
