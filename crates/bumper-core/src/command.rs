//! Commands sent to devices through the pub/sub bridge, and the envelopes
//! returned to HTTP callers.

use crate::error::{BumperError, BumperResult};
use crate::topic::{Endpoint, PAYLOAD_JSON};
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};

/// Request shapes accepted from the HTTP side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVersion {
    /// `iot/devmanager.do`: `cmdName`, `toId`, `toType`, `toRes`, `payloadType`, `payload`.
    V1,
    /// `iot/endpoint/control`: `apn`, `eid`, `et`, `er`, `fmt`, `payload`.
    V2,
    /// `appsvr/app.do` robot control: `cmd`, `did`, `mid`, `res`, `data`.
    P2p,
}

/// A command ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub version: CommandVersion,
    pub request_id: String,
    pub cmd_name: String,
    /// Name as the caller spelled it, before any p2p normalization.
    pub original_name: String,
    pub to_id: String,
    pub to_type: String,
    pub to_res: String,
    pub payload_type: String,
    /// Wire payload: JSON text for `j`, raw text otherwise.
    pub payload: String,
}

const REQUEST_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Four distinct random ASCII letters.
pub fn random_request_id() -> String {
    let mut rng = rand::thread_rng();
    REQUEST_ID_ALPHABET
        .choose_multiple(&mut rng, 4)
        .map(|b| *b as char)
        .collect()
}

fn render_payload(payload_type: &str, payload: &Value) -> String {
    match payload {
        Value::String(s) if payload_type != PAYLOAD_JSON => s.clone(),
        other => other.to_string(),
    }
}

fn str_field(obj: &Value, key: &str) -> BumperResult<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BumperError::Other(format!("command is missing '{key}'")))
}

impl Command {
    /// Build a command; `request_id` defaults to a fresh random id.
    pub fn new(
        cmd_name: impl Into<String>,
        to_id: impl Into<String>,
        to_type: impl Into<String>,
        to_res: impl Into<String>,
        payload_type: impl Into<String>,
        payload: &Value,
        request_id: Option<String>,
    ) -> Self {
        let cmd_name = cmd_name.into();
        let payload_type = payload_type.into();
        Self {
            version: CommandVersion::V1,
            request_id: request_id.unwrap_or_else(random_request_id),
            original_name: cmd_name.clone(),
            cmd_name,
            to_id: to_id.into(),
            to_type: to_type.into(),
            to_res: to_res.into(),
            payload: render_payload(&payload_type, payload),
            payload_type,
        }
    }

    pub fn parse(version: CommandVersion, body: &Value) -> BumperResult<Self> {
        match version {
            CommandVersion::V1 => Self::from_v1(body),
            CommandVersion::V2 => Self::from_v2(body),
            CommandVersion::P2p => Self::from_p2p(body),
        }
    }

    fn from_v1(body: &Value) -> BumperResult<Self> {
        let payload_type = body.get("payloadType").and_then(Value::as_str).unwrap_or(PAYLOAD_JSON);
        let mut cmd = Self::new(
            str_field(body, "cmdName")?,
            str_field(body, "toId")?,
            str_field(body, "toType")?,
            str_field(body, "toRes")?,
            payload_type,
            body.get("payload").unwrap_or(&Value::Null),
            None,
        );
        cmd.version = CommandVersion::V1;
        Ok(cmd)
    }

    fn from_v2(body: &Value) -> BumperResult<Self> {
        let payload_type = body.get("fmt").and_then(Value::as_str).unwrap_or(PAYLOAD_JSON);
        let mut cmd = Self::new(
            str_field(body, "apn")?,
            str_field(body, "eid")?,
            str_field(body, "et")?,
            str_field(body, "er")?,
            payload_type,
            body.get("payload").unwrap_or(&Value::Null),
            None,
        );
        cmd.version = CommandVersion::V2;
        Ok(cmd)
    }

    fn from_p2p(body: &Value) -> BumperResult<Self> {
        let original = str_field(body, "cmd")?;
        let mut chars = original.chars();
        let mut name: String = match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => return Err(BumperError::Other("command name is empty".into())),
        };
        if name == "getBatteryInfo" {
            name = "getBattery".into();
        }

        let payload = match body.get("data").and_then(Value::as_object) {
            Some(data) if !data.is_empty() => {
                let mut data = data.clone();
                if name == "clean" {
                    translate_clean_act(&mut data);
                }
                json!({ "body": { "data": Value::Object(data) } })
            }
            _ => Value::Null,
        };

        let mut cmd = Self::new(
            name,
            str_field(body, "did")?,
            str_field(body, "mid")?,
            str_field(body, "res")?,
            PAYLOAD_JSON,
            &payload,
            None,
        );
        cmd.version = CommandVersion::P2p;
        cmd.original_name = original;
        Ok(cmd)
    }

    /// Topic this command is published on, sent from `bridge`.
    pub fn topic(&self, bridge: &Endpoint) -> String {
        format!(
            "iot/p2p/{}/{}/{}/{}/{}/{}/{}/q/{}/{}",
            self.cmd_name,
            bridge.id,
            bridge.class,
            bridge.resource,
            self.to_id,
            self.to_type,
            self.to_res,
            self.request_id,
            self.payload_type
        )
    }
}

fn translate_clean_act(data: &mut Map<String, Value>) {
    let translated = match data.get("act").and_then(Value::as_str) {
        Some("s") => "start",
        Some("p") => "pause",
        Some("r") => "resume",
        Some("t") => "stop",
        _ => return,
    };
    data.insert("act".into(), Value::String(translated.into()));
}

/// Response body as the HTTP side sees it: decoded JSON for `j`, the raw
/// text otherwise.
pub fn decode_response(payload_type: &str, raw: &str) -> Value {
    if payload_type == PAYLOAD_JSON {
        match serde_json::from_str(raw) {
            Ok(value @ Value::Object(_)) => return value,
            Ok(_) | Err(_) => {}
        }
    }
    Value::String(raw.to_string())
}

/// Envelope for a command that got its response.
pub fn success_envelope(request_id: &str, payload_type: &str, raw: &str) -> Value {
    json!({ "id": request_id, "ret": "ok", "resp": decode_response(payload_type, raw) })
}

/// Envelope for a command that failed or timed out.
pub fn failure_envelope(request_id: &str, debug: &str) -> Value {
    json!({ "id": request_id, "errno": 500, "ret": "fail", "debug": debug })
}

/// What goes back to the HTTP caller once a command is answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// JSON body.
    Json(Value),
    /// Compact JSON bytes, served as `application/octet-stream` with the
    /// `x-ngiot-fmt: b` and `x-ngiot-ret: ok` headers.
    Binary(Vec<u8>),
}

impl Reply {
    pub fn failure(request_id: &str, debug: &str) -> Self {
        Reply::Json(failure_envelope(request_id, debug))
    }

    /// The JSON body, if this reply has one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Reply::Json(value) => Some(value),
            Reply::Binary(_) => None,
        }
    }
}

fn data_field<'a>(resp: &'a Value, key: &str) -> &'a Value {
    resp.pointer(&format!("/body/data/{key}")).unwrap_or(&Value::Null)
}

impl Command {
    /// Shape a decoded device response for the endpoint this command came
    /// in through.
    pub fn reply(&self, resp: Value) -> Reply {
        match self.version {
            CommandVersion::V1 => Reply::Json(json!({ "id": self.request_id, "ret": "ok", "resp": resp })),
            CommandVersion::V2 => match serde_json::to_vec(&resp) {
                Ok(body) => Reply::Binary(body),
                Err(e) => Reply::failure(&self.request_id, &e.to_string()),
            },
            CommandVersion::P2p => self.robot_control_reply(&resp),
        }
    }

    fn robot_control_reply(&self, resp: &Value) -> Reply {
        if !resp.is_object() {
            return Reply::failure(&self.request_id, &format!("unexpected response: {resp}"));
        }
        let mut entry = json!({ "ret": "ok", "did": self.to_id });
        match self.cmd_name.as_str() {
            "getBattery" => {
                entry["power"] = data_field(resp, "value").clone();
            }
            "getChargeState" => {
                let charging = data_field(resp, "isCharging").as_i64() == Some(1);
                entry["type"] = json!(if charging { "SlotCharging" } else { "SlotIdle" });
            }
            "charge" | "clean" => {
                let msg = resp.pointer("/body/msg").and_then(Value::as_str).unwrap_or("error");
                entry = json!({ "did": self.to_id, "ret": msg });
            }
            _ => {}
        }
        let mut data = Map::new();
        data.insert(self.original_name.clone(), entry);
        Reply::Json(json!({ "todo": "result", "ret": "ok", "data": data, "code": 0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> Endpoint {
        Endpoint::new("bridge", "bumper", "bridge")
    }

    #[test]
    fn request_ids_are_four_letters() {
        let id = random_request_id();
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn topic_layout() {
        let cmd = Command::new("GetBattery", "X", "ls1ok3", "wC3g", "j", &json!({}), Some("abcd".into()));
        assert_eq!(cmd.topic(&bridge()), "iot/p2p/GetBattery/bridge/bumper/bridge/X/ls1ok3/wC3g/q/abcd/j");
        assert_eq!(cmd.payload, "{}");
    }

    #[test]
    fn non_json_payload_is_raw_text() {
        let cmd = Command::new("GetCleanState", "X", "ls1ok3", "wC3g", "x", &json!("<ctl td='GetCleanState'/>"), None);
        assert_eq!(cmd.payload, "<ctl td='GetCleanState'/>");
    }

    #[test]
    fn v1_and_v2_shapes() {
        let v1 = Command::parse(
            CommandVersion::V1,
            &json!({"cmdName": "getStats", "toId": "X", "toType": "ls1ok3", "toRes": "wC3g", "payload": {"header": {}}}),
        )
        .unwrap();
        assert_eq!(v1.payload_type, "j");
        assert_eq!(v1.payload, r#"{"header":{}}"#);

        let v2 = Command::parse(
            CommandVersion::V2,
            &json!({"apn": "getPos", "eid": "X", "et": "ls1ok3", "er": "wC3g", "fmt": "j", "payload": {}}),
        )
        .unwrap();
        assert_eq!(v2.cmd_name, "getPos");
        assert_eq!(v2.version, CommandVersion::V2);

        assert!(Command::parse(CommandVersion::V1, &json!({"cmdName": "x"})).is_err());
    }

    #[test]
    fn p2p_normalizes_names_and_clean_actions() {
        let battery = Command::parse(
            CommandVersion::P2p,
            &json!({"cmd": "GetBatteryInfo", "did": "X", "mid": "ls1ok3", "res": "wC3g"}),
        )
        .unwrap();
        assert_eq!(battery.cmd_name, "getBattery");
        assert_eq!(battery.original_name, "GetBatteryInfo");
        assert_eq!(battery.payload, "null");

        let clean = Command::parse(
            CommandVersion::P2p,
            &json!({"cmd": "Clean", "did": "X", "mid": "ls1ok3", "res": "wC3g", "data": {"act": "s", "type": "auto"}}),
        )
        .unwrap();
        let payload: Value = serde_json::from_str(&clean.payload).unwrap();
        assert_eq!(payload["body"]["data"]["act"], "start");
        assert_eq!(payload["body"]["data"]["type"], "auto");
    }

    #[test]
    fn envelopes() {
        assert_eq!(
            success_envelope("abcd", "j", r#"{"ret":"ok","ver":"0.13.5"}"#),
            json!({"id": "abcd", "ret": "ok", "resp": {"ret": "ok", "ver": "0.13.5"}})
        );
        assert_eq!(
            success_envelope("abcd", "x", "<ctl ret='ok'/>"),
            json!({"id": "abcd", "ret": "ok", "resp": "<ctl ret='ok'/>"})
        );
        assert_eq!(
            failure_envelope("abcd", "wait for response timed out"),
            json!({"id": "abcd", "errno": 500, "ret": "fail", "debug": "wait for response timed out"})
        );
    }

    fn p2p(cmd: &str) -> Command {
        Command::parse(CommandVersion::P2p, &json!({"cmd": cmd, "did": "E0001", "mid": "ls1ok3", "res": "wC3g"})).unwrap()
    }

    #[test]
    fn v1_reply_wraps_the_response() {
        let cmd = Command::new("getStats", "E0001", "ls1ok3", "wC3g", "j", &json!({}), Some("abcd".into()));
        assert_eq!(
            cmd.reply(json!({"ret": "ok"})),
            Reply::Json(json!({"id": "abcd", "ret": "ok", "resp": {"ret": "ok"}}))
        );
    }

    #[test]
    fn v2_reply_is_compact_bytes() {
        let cmd = Command::parse(
            CommandVersion::V2,
            &json!({"apn": "getPos", "eid": "E0001", "et": "ls1ok3", "er": "wC3g", "payload": {}}),
        )
        .unwrap();
        let reply = cmd.reply(json!({"body": {"data": {"x": 1}}}));
        assert_eq!(reply, Reply::Binary(br#"{"body":{"data":{"x":1}}}"#.to_vec()));
        assert!(reply.as_json().is_none());
    }

    #[test]
    fn robot_control_battery_and_charge_state() {
        let battery = p2p("GetBatteryInfo").reply(json!({"body": {"data": {"value": 87}}}));
        assert_eq!(
            battery,
            Reply::Json(json!({
                "todo": "result", "ret": "ok", "code": 0,
                "data": {"GetBatteryInfo": {"ret": "ok", "did": "E0001", "power": 87}}
            }))
        );

        let charging = p2p("GetChargeState").reply(json!({"body": {"data": {"isCharging": 1}}}));
        assert_eq!(charging.as_json().unwrap()["data"]["GetChargeState"]["type"], "SlotCharging");
        let idle = p2p("GetChargeState").reply(json!({"body": {"data": {"isCharging": 0}}}));
        assert_eq!(idle.as_json().unwrap()["data"]["GetChargeState"]["type"], "SlotIdle");
    }

    #[test]
    fn robot_control_actions_report_device_message() {
        let clean = p2p("Clean").reply(json!({"body": {"msg": "ok"}}));
        assert_eq!(clean.as_json().unwrap()["data"], json!({"Clean": {"did": "E0001", "ret": "ok"}}));
        let charge = p2p("Charge").reply(json!({"body": {}}));
        assert_eq!(charge.as_json().unwrap()["data"]["Charge"]["ret"], "error");
        let other = p2p("PlaySound").reply(json!({"body": {}}));
        assert_eq!(other.as_json().unwrap()["data"], json!({"PlaySound": {"ret": "ok", "did": "E0001"}}));
    }

    #[test]
    fn robot_control_rejects_text_responses() {
        let reply = p2p("GetBatteryInfo").reply(json!("garbled"));
        assert_eq!(reply.as_json().unwrap()["ret"], "fail");
    }

    #[test]
    fn only_objects_decode_as_json() {
        assert_eq!(decode_response("j", r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_response("j", "[1,2]"), json!("[1,2]"));
        assert_eq!(decode_response("x", r#"{"a":1}"#), json!(r#"{"a":1}"#));
    }
}
