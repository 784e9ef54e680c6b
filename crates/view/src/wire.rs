//! JSON wire codec: object and list bodies, `Status` error bodies and
//! newline-delimited watch events (`{"type":"ADDED","object":{...}}`).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use advisor_core::{Object, ObjectKind, ObjectList, StoreError, StoreResult, WatchEvent, WatchEventType};

fn encode_err(e: serde_json::Error) -> StoreError {
    StoreError::Internal(format!("wire encode: {}", e))
}

fn decode_err(e: serde_json::Error) -> StoreError {
    StoreError::Validation(format!("wire decode: {}", e))
}

pub fn encode_object(obj: &Object) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(&obj.to_value()?).map_err(encode_err)
}

pub fn decode_object(kind: ObjectKind, body: &[u8]) -> StoreResult<Object> {
    let raw: Json = serde_json::from_slice(body).map_err(decode_err)?;
    Object::from_value(kind, raw)
}

pub fn encode_list(list: &ObjectList) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(&list.to_value()?).map_err(encode_err)
}

pub fn decode_list(kind: ObjectKind, body: &[u8]) -> StoreResult<ObjectList> {
    let raw: Json = serde_json::from_slice(body).map_err(decode_err)?;
    ObjectList::from_value(kind, raw)
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: WatchEventType,
    object: Json,
}

/// One watch event as a single JSON line, newline included.
pub fn encode_event(ev: &WatchEvent) -> StoreResult<Vec<u8>> {
    let wire = WireEvent { event_type: ev.event_type, object: ev.object.to_value()? };
    let mut line = serde_json::to_vec(&wire).map_err(encode_err)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_event(kind: ObjectKind, line: &[u8]) -> StoreResult<WatchEvent> {
    let wire: WireEvent = serde_json::from_slice(line).map_err(decode_err)?;
    Ok(WatchEvent { event_type: wire.event_type, object: Object::from_value(kind, wire.object)? })
}

/// Splits a byte stream into complete lines regardless of chunk boundaries.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if !line.iter().all(u8::is_ascii_whitespace) {
                lines.push(line);
            }
        }
        lines
    }

    /// Trailing bytes without a final newline.
    pub fn finish(self) -> Option<Vec<u8>> {
        Some(self.buf).filter(|b| !b.iter().all(u8::is_ascii_whitespace))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    api_version: String,
    kind: String,
    status: String,
    message: String,
    reason: String,
    code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<StoreError>,
}

/// HTTP status code and `Status.reason` an error maps to.
pub fn status_of(err: &StoreError) -> (u16, &'static str) {
    match err {
        StoreError::Validation(_) | StoreError::Unprocessable(_) => (422, "Invalid"),
        StoreError::NotFound { .. } => (404, "NotFound"),
        StoreError::AlreadyExists { .. } => (409, "AlreadyExists"),
        StoreError::Conflict(_) => (409, "Conflict"),
        StoreError::TypeMismatch { .. } | StoreError::BadPatch(_) => (400, "BadRequest"),
        StoreError::WatchClosed(_) => (410, "Gone"),
        StoreError::Internal(_) => (500, "InternalError"),
    }
}

pub fn encode_status(err: &StoreError) -> Vec<u8> {
    let (code, reason) = status_of(err);
    let status = Status {
        api_version: "v1".into(),
        kind: "Status".into(),
        status: "Failure".into(),
        message: err.to_string(),
        reason: reason.into(),
        code,
        details: Some(err.clone()),
    };
    serde_json::to_vec(&status).unwrap_or_else(|_| err.to_string().into_bytes())
}

pub fn decode_status(body: &[u8]) -> StoreError {
    match serde_json::from_slice::<Status>(body) {
        Ok(Status { details: Some(err), .. }) => err,
        Ok(status) => StoreError::Internal(format!("{} ({})", status.message, status.code)),
        Err(_) => StoreError::Internal(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor_core::ObjectKey;
    use serde_json::json;

    #[test]
    fn event_lines_survive_arbitrary_chunking() {
        let obj = Object::from_value(ObjectKind::Node, json!({ "metadata": { "name": "n1", "resourceVersion": "4" } })).unwrap();
        let ev = WatchEvent { event_type: WatchEventType::Modified, object: obj };
        let mut bytes = encode_event(&ev).unwrap();
        bytes.extend(encode_event(&ev).unwrap());
        assert!(std::str::from_utf8(&bytes).unwrap().starts_with("{\"type\":\"MODIFIED\""));

        let mut dec = LineDecoder::default();
        let mut lines = Vec::new();
        for chunk in bytes.chunks(7) {
            lines.extend(dec.push(chunk));
        }
        assert!(dec.finish().is_none());
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert_eq!(decode_event(ObjectKind::Node, &line).unwrap(), ev);
        }
    }

    #[test]
    fn status_body_carries_the_error() {
        let err = StoreError::not_found(ObjectKind::Pod, &ObjectKey::new("ns", "p"));
        let body = encode_status(&err);
        let raw: Json = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw["kind"], "Status");
        assert_eq!(raw["code"], 404);
        assert_eq!(decode_status(&body), err);
        assert!(matches!(decode_status(b"garbage"), StoreError::Internal(_)));
    }
}
