//! Popup URL contract between a main window and the mirror it opens.
//!
//! Query parameters: `mode`, `sessionId`, `meetingId`, `timestamp`. The
//! opened context binds its directory filter to `sessionId`.

use shared::{ContextMode, PopupParams};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PopupError {
    #[error("invalid popup url: {0}")]
    InvalidUrl(String),
    #[error("popup url is missing '{0}'")]
    MissingParam(&'static str),
    #[error("popup url has invalid '{name}': {value}")]
    InvalidParam { name: &'static str, value: String },
}

pub fn build_popup_url(base: &str, params: &PopupParams) -> Result<String, PopupError> {
    let mut url = Url::parse(base).map_err(|error| PopupError::InvalidUrl(error.to_string()))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("mode", params.mode.as_str())
        .append_pair("sessionId", &params.session_id)
        .append_pair("meetingId", &params.meeting_id)
        .append_pair("timestamp", &params.timestamp.to_string());
    Ok(url.into())
}

/// Read the parameters back. `mode` defaults to mirror and `timestamp` to 0;
/// a popup without a session can't scope its sync and is rejected.
pub fn parse_popup_params(href: &str) -> Result<PopupParams, PopupError> {
    let url = Url::parse(href).map_err(|error| PopupError::InvalidUrl(error.to_string()))?;

    let mut mode = None;
    let mut session_id = None;
    let mut meeting_id = None;
    let mut timestamp = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "mode" => mode = Some(value.into_owned()),
            "sessionId" => session_id = Some(value.into_owned()),
            "meetingId" => meeting_id = Some(value.into_owned()),
            "timestamp" => timestamp = Some(value.into_owned()),
            _ => {}
        }
    }

    let mode = match mode {
        None => ContextMode::Mirror,
        Some(value) => ContextMode::parse(&value)
            .ok_or(PopupError::InvalidParam { name: "mode", value })?,
    };
    let session_id = session_id
        .filter(|id| !id.is_empty())
        .ok_or(PopupError::MissingParam("sessionId"))?;
    let timestamp = match timestamp {
        None => 0,
        Some(value) => value
            .parse()
            .map_err(|_| PopupError::InvalidParam {
                name: "timestamp",
                value,
            })?,
    };

    Ok(PopupParams {
        mode,
        session_id,
        meeting_id: meeting_id.unwrap_or_default(),
        timestamp,
    })
}
