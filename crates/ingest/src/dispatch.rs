use appstore_core::messages::{Envelope, MessageType};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::handler::{Disposition, HandleError, MessageHandler};

/// Result of handling one message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Type tag as sent, when it could be read.
    pub kind: Option<String>,
    pub id: Option<String>,
    pub result: Result<(), HandleError>,
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match &self.result {
            Ok(()) => Disposition::Ack,
            Err(e) => e.disposition(),
        }
    }
}

#[derive(Deserialize)]
struct Tag {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
}

fn payload<P: DeserializeOwned>(env: &Envelope) -> Result<P, HandleError> {
    env.payload_as().map_err(|e| HandleError::Malformed(format!("{} payload: {}", env.kind, e)))
}

/// Decode `body` and route it to `handler`.
pub async fn dispatch(handler: &dyn MessageHandler, body: &[u8]) -> Outcome {
    let tag: Option<Tag> = serde_json::from_slice(body).ok();
    let (kind, id) = tag.map(|t| (t.kind, t.id)).unwrap_or((None, None));
    let result = route(handler, body, kind.as_deref()).await;
    let type_label = kind.clone().unwrap_or_else(|| "unparseable".to_string());
    let result_label = match &result {
        Ok(()) => "ok",
        Err(e) => e.label(),
    };
    counter!("ingest_messages_total", 1u64, "type" => type_label, "result" => result_label);
    Outcome { kind, id, result }
}

async fn route(handler: &dyn MessageHandler, body: &[u8], raw_kind: Option<&str>) -> Result<(), HandleError> {
    let env: Envelope = serde_json::from_slice(body).map_err(|e| HandleError::Malformed(e.to_string()))?;
    match env.kind {
        MessageType::DeploymentRequest => handler.on_request(&env, payload(&env)?).await,
        MessageType::DeploymentUpdate => handler.on_update(&env, payload(&env)?).await,
        MessageType::DeploymentDelete => handler.on_delete(&env, payload(&env)?).await,
        // status updates flow the other way; never consumed here
        MessageType::StatusUpdate | MessageType::Unknown => {
            Err(HandleError::UnknownType(raw_kind.unwrap_or("?").to_string()))
        }
    }
}
