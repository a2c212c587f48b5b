//! Newline-delimited JSON messages exchanged with socket peers

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::{CallDirection, CallEvent, StateTag, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    CallEvent,
    MakeCall,
    DropCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireCallState {
    Offered,
    Dialing,
    Ringback,
    Accepted,
    Connected,
    Ended,
}

impl From<WireCallState> for StateTag {
    fn from(state: WireCallState) -> Self {
        match state {
            WireCallState::Offered => StateTag::Offered,
            WireCallState::Dialing => StateTag::Dialing,
            WireCallState::Ringback => StateTag::Ringback,
            WireCallState::Accepted => StateTag::Accepted,
            WireCallState::Connected => StateTag::Connected,
            WireCallState::Ended => StateTag::Ended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireDirection {
    In,
    Out,
}

impl From<WireDirection> for CallDirection {
    fn from(direction: WireDirection) -> Self {
        match direction {
            WireDirection::In => CallDirection::Inbound,
            WireDirection::Out => CallDirection::Outbound,
        }
    }
}

/// One JSON line; which fields are present depends on `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<WireCallState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<WireDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

impl SocketMessage {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            version: None,
            extension_number: None,
            call_id: None,
            state: None,
            direction: None,
            remote_number: None,
            remote_name: None,
            request_id: None,
            number: None,
        }
    }

    pub fn hello(version: u32, extension: impl Into<String>) -> Self {
        Self {
            version: Some(version),
            extension_number: Some(extension.into()),
            ..Self::empty(MessageType::Hello)
        }
    }

    pub fn make_call(request_id: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            number: Some(number.into()),
            ..Self::empty(MessageType::MakeCall)
        }
    }

    pub fn drop_call(call_id: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::empty(MessageType::DropCall)
        }
    }

    pub fn call_event(
        call_id: impl Into<String>,
        state: WireCallState,
        direction: WireDirection,
        remote_number: impl Into<String>,
    ) -> Self {
        Self {
            call_id: Some(call_id.into()),
            state: Some(state),
            direction: Some(direction),
            remote_number: Some(remote_number.into()),
            ..Self::empty(MessageType::CallEvent)
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Protocol(format!("malformed socket message: {}", e)))
    }

    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Convert a `CALL_EVENT` from the peer registered as `extension`
    ///
    /// The transport call id is qualified with the extension because two
    /// phones may number their calls independently.
    pub fn to_call_event(&self, extension: &str) -> Result<CallEvent> {
        if self.message_type != MessageType::CallEvent {
            return Err(Error::Protocol(format!("expected CALL_EVENT, got {:?}", self.message_type)));
        }
        let call_id = self
            .call_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Protocol("CALL_EVENT without callId".into()))?;
        let state = self
            .state
            .ok_or_else(|| Error::Protocol("CALL_EVENT without state".into()))?;
        let direction = self
            .direction
            .ok_or_else(|| Error::Protocol("CALL_EVENT without direction".into()))?;

        let mut event = CallEvent::new(
            TransportKind::Socket,
            format!("{}/{}", extension, call_id),
            direction.into(),
            state.into(),
        )
        .with_remote_number(self.remote_number.clone().unwrap_or_default())
        .with_extension(extension);
        if let Some(name) = &self.remote_name {
            event = event.with_remote_name(name.clone());
        }
        Ok(event)
    }
}
