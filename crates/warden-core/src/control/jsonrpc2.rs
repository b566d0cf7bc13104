//! JSON-RPC 2.0 envelope for the control surface (spec §4.9), grounded in
//! the teacher's `systemctl`/PID1 wire format (`libsystemd::control::jsonrpc2`,
//! used by `systemctl` and the control-socket listener but not present in
//! this retrieval; reconstructed here to the spec it names).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST_ERROR: i64 = -32600;
pub const METHOD_NOT_FOUND_ERROR: i64 = -32601;
pub const INVALID_PARAMS_ERROR: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Call {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub fn make_error(code: i64, message: impl Into<String>, data: Option<Value>) -> ErrorObject {
    ErrorObject { code, message: message.into(), data }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<Value>,
}

pub fn make_result_response(id: Option<Value>, result: Value) -> Response {
    Response { jsonrpc: "2.0", result: Some(result), error: None, id }
}

pub fn make_error_response(id: Option<Value>, error: ErrorObject) -> Response {
    Response { jsonrpc: "2.0", result: None, error: Some(error), id }
}

/// Reads one line-delimited JSON-RPC call from `source` (spec §4.9: "local
/// socket ... line-oriented requests"). Returns `Ok(None)` at a clean EOF,
/// `Ok(Some(Err(..)))` for a call that parsed as JSON but not as a valid
/// envelope, `Err` for bytes that aren't JSON at all.
pub fn get_next_call(source: &mut impl BufRead) -> std::io::Result<Option<Result<Call, String>>> {
    let mut line = String::new();
    let n = source.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    match serde_json::from_str::<Call>(line.trim_end()) {
        Ok(call) if call.method.is_empty() => Ok(Some(Err("method must not be empty".to_owned()))),
        Ok(call) => Ok(Some(Ok(call))),
        Err(e) => Ok(Some(Err(format!("invalid request: {e}")))),
    }
}

/// Writes a response as one line, terminated by the sentinel byte the
/// client's reader blocks for (spec §4.9: "each response is a discrete
/// textual block terminated by a sentinel").
pub fn write_response(sink: &mut impl Write, response: &Response) -> std::io::Result<()> {
    let body = serde_json::to_string(response).unwrap_or_else(|_| "{}".to_owned());
    sink.write_all(body.as_bytes())?;
    sink.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_one_call_per_line_and_stops_at_eof() {
        let mut cursor = Cursor::new(b"{\"method\":\"status\",\"id\":1}\n".to_vec());
        let call = get_next_call(&mut cursor).unwrap().unwrap().unwrap();
        assert_eq!(call.method, "status");
        assert_eq!(get_next_call(&mut cursor).unwrap(), None);
    }

    #[test]
    fn malformed_json_is_reported_without_erroring_the_reader() {
        let mut cursor = Cursor::new(b"not json\n".to_vec());
        let result = get_next_call(&mut cursor).unwrap().unwrap();
        assert!(result.is_err());
    }
}
