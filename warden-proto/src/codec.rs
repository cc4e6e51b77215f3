//! Newline-delimited JSON framing

use serde_json::Value;

use crate::error::{Error, Result};
use crate::request::{Request, RequestHeader};
use crate::response::Response;

/// Longest accepted frame, in bytes
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Decode one request line into its header and body.
///
/// The header is decoded on its own first so that the caller always learns
/// the `Idx` to answer with, even when the body is malformed.
pub fn decode_request(line: &str) -> Result<(RequestHeader, Request)> {
    let value = parse_frame(line)?;
    let header: RequestHeader = serde_json::from_value(value.clone())?;
    if header.command.is_empty() {
        return Err(Error::InvalidMessage("missing Command".into()));
    }
    if !Request::COMMANDS.contains(&header.command.as_str()) {
        return Err(Error::UnknownCommand(header.command));
    }
    let request = serde_json::from_value(value)
        .map_err(|e| Error::InvalidMessage(format!("{}: {}", header.command, e)))?;
    Ok((header, request))
}

/// Decode just the header; used to answer frames whose body failed to parse
pub fn decode_header(line: &str) -> Result<RequestHeader> {
    let value = parse_frame(line)?;
    Ok(serde_json::from_value(value)?)
}

/// Encode a response as one line, including the trailing newline
pub fn encode_response(response: &Response, idx: i64) -> Result<String> {
    let mut value = serde_json::to_value(response)?;
    insert_field(&mut value, "Idx", Value::from(idx))?;
    frame(&value)
}

/// Encode a request as one line (client side)
pub fn encode_request(request: &Request, idx: i64, secret: &str) -> Result<String> {
    let mut value = serde_json::to_value(request)?;
    insert_field(&mut value, "Idx", Value::from(idx))?;
    if !secret.is_empty() {
        insert_field(&mut value, "ProtocolSecret", Value::from(secret))?;
    }
    frame(&value)
}

/// Decode a response line (client side), returning its `Idx`
pub fn decode_response(line: &str) -> Result<(i64, Response)> {
    let value = parse_frame(line)?;
    let idx = value.get("Idx").and_then(Value::as_i64).unwrap_or(0);
    let response = serde_json::from_value(value)?;
    Ok((idx, response))
}

fn parse_frame(line: &str) -> Result<Value> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::InvalidMessage("empty frame".into()));
    }
    if line.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidMessage(format!(
            "frame too large: {} bytes",
            line.len()
        )));
    }
    let value: Value = serde_json::from_str(line)?;
    if !value.is_object() {
        return Err(Error::InvalidMessage("frame is not a JSON object".into()));
    }
    Ok(value)
}

fn insert_field(value: &mut Value, key: &str, field: Value) -> Result<()> {
    match value.as_object_mut() {
        Some(map) => {
            map.insert(key.to_string(), field);
            Ok(())
        }
        None => Err(Error::InvalidMessage("message is not a JSON object".into())),
    }
}

fn frame(value: &Value) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::KillSwitchSetEnabled;

    #[test]
    fn test_unknown_command() {
        let err = decode_request(r#"{"Command":"Reboot","Idx":2}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(c) if c == "Reboot"));
    }

    #[test]
    fn test_bad_body_keeps_header() {
        let line = r#"{"Command":"KillSwitchSetEnabled","Idx":5,"IsEnabled":"yes"}"#;
        assert!(matches!(
            decode_request(line),
            Err(Error::InvalidMessage(_))
        ));
        assert_eq!(decode_header(line).unwrap().idx, 5);
    }

    #[test]
    fn test_not_an_object() {
        assert!(decode_request("[1,2]").is_err());
        assert!(decode_request("   ").is_err());
    }

    #[test]
    fn test_request_line_carries_secret() {
        let req = Request::KillSwitchSetEnabled(KillSwitchSetEnabled { is_enabled: true });
        let line = encode_request(&req, 9, "s3cret").unwrap();
        assert!(line.ends_with('\n'));
        let (header, decoded) = decode_request(&line).unwrap();
        assert_eq!(header.idx, 9);
        assert_eq!(header.protocol_secret, "s3cret");
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_broadcast_idx() {
        let line = encode_response(&Response::ServiceExitingResp, 0).unwrap();
        let (idx, resp) = decode_response(&line).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(resp, Response::ServiceExitingResp);
    }
}
