//! Wire envelope and payload translation.
//!
//! Decoding happens here and nowhere else: the dispatch core only sees
//! [`Message`] values with typed [`Payload`]s.

use crate::error::ProtocolError;
use crate::messages::{
    CollectionProposal, CorrelationId, EnactmentId, MessageType, Payload, Response, WorkflowDone,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport-level shape of every call and reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    /// Session token; mandatory on inbound calls.
    #[serde(default)]
    pub enactment_id: Option<String>,
    /// Exchange token; echoed on replies.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Message or reply type.
    pub type_tag: String,
    /// Type-specific content.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Session the message belongs to.
    pub enactment_id: EnactmentId,
    /// Exchange the message belongs to.
    pub correlation_id: Option<CorrelationId>,
    /// Decoded content.
    pub payload: Payload,
}

impl Message {
    /// Tag of the payload.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

impl WireEnvelope {
    /// Parses one JSON-encoded envelope.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }

    /// Single-line JSON encoding.
    pub fn to_json(&self) -> String {
        // Serializing a struct of strings and a `Value` cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Builds the reply envelope for `response`.
    pub fn reply(
        enactment_id: Option<&EnactmentId>,
        correlation_id: Option<&CorrelationId>,
        response: &Response,
    ) -> Self {
        Self {
            enactment_id: enactment_id.map(ToString::to_string),
            correlation_id: correlation_id.map(ToString::to_string),
            type_tag: response.response_type().tag().to_string(),
            payload: Some(serde_json::to_value(response).unwrap_or(Value::Null)),
        }
    }

    /// Reply telling the engine the beamline has abandoned the session.
    pub fn beamline_abort(
        enactment_id: Option<&EnactmentId>,
        correlation_id: Option<&CorrelationId>,
    ) -> Self {
        Self::reply(enactment_id, correlation_id, &Response::beamline_abort())
    }

    /// Validates the envelope and decodes its payload.
    ///
    /// Checks run in the order: enactment id present, type tag known, payload
    /// present, payload decodable.
    pub fn decode(&self) -> Result<Message, ProtocolError> {
        let enactment_id = self
            .enactment_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| EnactmentId(id.to_string()))
            .ok_or(ProtocolError::MissingEnactmentId)?;

        let message_type = MessageType::from_tag(&self.type_tag)
            .ok_or_else(|| ProtocolError::UnknownMessageType(self.type_tag.clone()))?;

        let raw = match &self.payload {
            Some(value) if !value.is_null() => value.clone(),
            _ => return Err(ProtocolError::MissingPayload(self.type_tag.clone())),
        };

        Ok(Message {
            enactment_id,
            correlation_id: self
                .correlation_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(|id| CorrelationId(id.to_string())),
            payload: decode_payload(message_type, raw)?,
        })
    }
}

fn typed<T: DeserializeOwned>(message_type: MessageType, raw: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(raw).map_err(|e| ProtocolError::PayloadDecode {
        tag: message_type.tag().to_string(),
        reason: e.to_string(),
    })
}

fn decode_payload(message_type: MessageType, raw: Value) -> Result<Payload, ProtocolError> {
    let payload = match message_type {
        MessageType::String => Payload::Text(typed(message_type, raw)?),
        MessageType::SubprocessStarted => Payload::SubprocessStarted(typed(message_type, raw)?),
        MessageType::SubprocessStopped => Payload::SubprocessStopped,
        MessageType::RequestConfiguration => Payload::RequestConfiguration,
        MessageType::GeometricStrategy => Payload::GeometricStrategy(typed(message_type, raw)?),
        MessageType::CollectionProposal => {
            let proposal: CollectionProposal = typed(message_type, raw)?;
            if let Some(scan) = proposal.dangling_scan() {
                return Err(ProtocolError::PayloadDecode {
                    tag: message_type.tag().to_string(),
                    reason: format!("scan {scan} refers to a sweep outside the strategy"),
                });
            }
            Payload::CollectionProposal(proposal)
        }
        MessageType::ChooseLattice => Payload::ChooseLattice(typed(message_type, raw)?),
        MessageType::RequestCentring => Payload::RequestCentring(typed(message_type, raw)?),
        MessageType::ObtainPriorInformation => Payload::ObtainPriorInformation,
        MessageType::PrepareForCentring => Payload::PrepareForCentring,
        MessageType::WorkflowAborted => Payload::WorkflowAborted(done(message_type, raw)?),
        MessageType::WorkflowCompleted => Payload::WorkflowCompleted(done(message_type, raw)?),
        MessageType::WorkflowFailed => Payload::WorkflowFailed(done(message_type, raw)?),
    };
    Ok(payload)
}

fn done(message_type: MessageType, raw: Value) -> Result<WorkflowDone, ProtocolError> {
    typed(message_type, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(enactment: Option<&str>, tag: &str, payload: Option<Value>) -> WireEnvelope {
        WireEnvelope {
            enactment_id: enactment.map(String::from),
            correlation_id: Some("c1".into()),
            type_tag: tag.into(),
            payload,
        }
    }

    #[test]
    fn test_decode_text_message() {
        let msg = envelope(Some("e1"), "String", Some(json!({"text": "indexing"})))
            .decode()
            .unwrap();
        assert_eq!(msg.enactment_id, EnactmentId("e1".into()));
        assert_eq!(msg.correlation_id, Some(CorrelationId("c1".into())));
        assert_eq!(msg.message_type(), MessageType::String);
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            envelope(None, "String", Some(json!({"text": "x"}))).decode(),
            Err(ProtocolError::MissingEnactmentId)
        );
        assert_eq!(
            envelope(Some(""), "String", Some(json!({"text": "x"}))).decode(),
            Err(ProtocolError::MissingEnactmentId)
        );
        assert_eq!(
            envelope(Some("e1"), "Teleport", Some(json!({}))).decode(),
            Err(ProtocolError::UnknownMessageType("Teleport".into()))
        );
        assert_eq!(
            envelope(Some("e1"), "RequestConfiguration", None).decode(),
            Err(ProtocolError::MissingPayload("RequestConfiguration".into()))
        );
        assert!(matches!(
            envelope(Some("e1"), "RequestCentring", Some(json!({"totalRotations": "many"}))).decode(),
            Err(ProtocolError::PayloadDecode { .. })
        ));
    }

    #[test]
    fn test_decode_collection_proposal_with_unknown_sweep() {
        let strategy = json!({
            "id": "9a4b1c3e-5d6f-4a7b-8c9d-0e1f2a3b4c5d",
            "isInterleaved": false,
            "isUserModifiable": false,
            "sweeps": [{"id": "11111111-1111-4111-8111-111111111111", "start": 0.0, "width": 90.0}]
        });
        let scan = |sweep: &str| {
            json!({
                "id": "22222222-2222-4222-8222-222222222222",
                "width": {"id": "33333333-3333-4333-8333-333333333333", "imageWidth": 0.1, "numImages": 900},
                "exposure": {"id": "44444444-4444-4444-8444-444444444444", "time": 0.02, "transmission": 20.0},
                "imageStartNum": 1,
                "start": 0.0,
                "sweepId": sweep
            })
        };
        let ok = envelope(
            Some("e1"),
            "CollectionProposal",
            Some(json!({
                "id": "55555555-5555-4555-8555-555555555555",
                "relativeImageDir": "sweep_1",
                "strategy": strategy,
                "scans": [scan("11111111-1111-4111-8111-111111111111")]
            })),
        );
        assert!(matches!(ok.decode().unwrap().payload, Payload::CollectionProposal(_)));

        let mut bad = ok.clone();
        bad.payload.as_mut().unwrap()["scans"] = json!([scan("66666666-6666-4666-8666-666666666666")]);
        assert!(matches!(bad.decode(), Err(ProtocolError::PayloadDecode { .. })));
    }

    #[test]
    fn test_json_line_round_trip() {
        let text = r#"{"enactmentId":"e1","correlationId":null,"typeTag":"WorkflowCompletedImpl","payload":{"issues":[]}}"#;
        let env = WireEnvelope::from_json(text).unwrap();
        let msg = env.decode().unwrap();
        assert_eq!(msg.payload, Payload::WorkflowCompleted(WorkflowDone::default()));
        assert!(WireEnvelope::from_json("{not json").is_err());
    }

    #[test]
    fn test_beamline_abort_reply() {
        let reply = WireEnvelope::beamline_abort(
            Some(&EnactmentId("e1".into())),
            Some(&CorrelationId("c9".into())),
        );
        assert_eq!(reply.type_tag, "BeamlineAbort");
        assert_eq!(reply.enactment_id.as_deref(), Some("e1"));
        assert_eq!(reply.correlation_id.as_deref(), Some("c9"));
        assert_eq!(reply.payload, Some(json!({})));
    }
}
