//! Wire codec: encode/decode the tagged text messages
//! exchanged with the central server. The tagged object-tree format is
//! realized directly as `serde_json` structs — lookup-by-name and
//! sub-object opening are just field access, and failure paths become
//! `parse_*` functions returning a [`CoreError::Protocol`] with a
//! structured reason on failure.
//!
//! Integers may arrive as JSON numbers or as quoted strings (the server is
//! tolerant of both); [`FlexInt`] accepts either.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::buffer::BufferEntry;
use crate::error::{CoreError, CoreResult};

/// An integer that deserializes from either a JSON number or a quoted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlexInt(pub i64);

impl<'de> Deserialize<'de> for FlexInt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Str(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Ok(FlexInt(n)),
            Repr::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(FlexInt)
                .map_err(|e| D::Error::custom(format!("not an integer: {s:?} ({e})"))),
        }
    }
}

impl Serialize for FlexInt {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl From<i64> for FlexInt {
    fn from(v: i64) -> Self {
        FlexInt(v)
    }
}

// ---- requests ----------------------------------------------------------

#[derive(Debug, Serialize)]
struct GetActiveChecksRequest<'a> {
    request: &'static str,
    host: &'a str,
}

pub fn encode_get_active_checks(host: &str) -> CoreResult<Vec<u8>> {
    let req = GetActiveChecksRequest {
        request: "active checks",
        host,
    };
    Ok(serde_json::to_vec(&req)?)
}

#[derive(Debug, Serialize)]
struct WireBufferEntry<'a> {
    host: &'a str,
    key: &'a str,
    value: &'a str,
    clock: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    lastlogsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logeventid: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AgentDataRequest<'a> {
    request: &'static str,
    data: Vec<WireBufferEntry<'a>>,
    clock: i64,
}

pub fn encode_agent_data(entries: &[BufferEntry], clock: i64) -> CoreResult<Vec<u8>> {
    let data = entries
        .iter()
        .map(|e| WireBufferEntry {
            host: &e.host,
            key: &e.key,
            value: &e.value,
            clock: e.clock,
            lastlogsize: e.last_log_size,
            mtime: e.mtime,
            timestamp: e.timestamp,
            source: e.source.as_deref(),
            severity: e.severity,
            logeventid: e.log_event_id,
        })
        .collect();

    let req = AgentDataRequest {
        request: "agent data",
        data,
        clock,
    };
    Ok(serde_json::to_vec(&req)?)
}

// ---- replies ------------------------------------------------------------

/// A row under `data`. Fields are optional at the wire layer even though
/// most are mandatory semantically — a row missing a mandatory field is
/// logged and skipped by the registry rather than failing the whole reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckRow {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_orig: Option<String>,
    #[serde(default)]
    pub delay: Option<FlexInt>,
    #[serde(default)]
    pub lastlogsize: Option<FlexInt>,
    #[serde(default)]
    pub mtime: Option<FlexInt>,
}

/// A row under `regexp`; same "optional at the wire layer" rationale as
/// [`CheckRow`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegexpRow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub expression_type: Option<FlexInt>,
    #[serde(default)]
    pub exp_delimiter: Option<String>,
    #[serde(default)]
    pub case_sensitive: Option<FlexInt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveChecksReply {
    pub response: String,
    #[serde(default)]
    pub data: Vec<CheckRow>,
    #[serde(default)]
    pub regexp: Vec<RegexpRow>,
    #[serde(default)]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentDataReply {
    pub response: String,
    #[serde(default)]
    pub info: Option<String>,
}

pub fn parse_active_checks_reply(bytes: &[u8]) -> CoreResult<ActiveChecksReply> {
    serde_json::from_slice(bytes)
        .map_err(|e| CoreError::Protocol(format!("active checks reply: {e}")))
}

pub fn parse_agent_data_reply(bytes: &[u8]) -> CoreResult<AgentDataReply> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::Protocol(format!("agent data reply: {e}")))
}

pub fn is_success(response: &str) -> bool {
    response == "success"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get_active_checks() {
        let bytes = encode_get_active_checks("host1").unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["request"], "active checks");
        assert_eq!(v["host"], "host1");
    }

    #[test]
    fn test_encode_agent_data_omits_absent_optionals() {
        let entry = BufferEntry::transient("h1", "system.cpu.num", "4", 100);
        let bytes = encode_agent_data(&[entry], 100).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["request"], "agent data");
        assert_eq!(v["data"][0]["key"], "system.cpu.num");
        assert!(v["data"][0].get("lastlogsize").is_none());
    }

    #[test]
    fn test_parse_active_checks_reply_accepts_string_or_int_integers() {
        let json = r#"{
            "response":"success",
            "data":[{"key":"system.cpu.num","delay":"30","lastlogsize":0,"mtime":"0"}],
            "regexp":[]
        }"#;
        let reply = parse_active_checks_reply(json.as_bytes()).unwrap();
        assert_eq!(reply.data.len(), 1);
        assert_eq!(reply.data[0].delay.unwrap().0, 30);
    }

    #[test]
    fn test_parse_failed_reply() {
        let json = r#"{"response":"failed","info":"no host registered"}"#;
        let reply = parse_active_checks_reply(json.as_bytes()).unwrap();
        assert!(!is_success(&reply.response));
        assert_eq!(reply.info.as_deref(), Some("no host registered"));
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let err = parse_active_checks_reply(b"not json").unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
