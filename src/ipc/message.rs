//! Control-plane message: a typed header plus a JSON parameter tree.
//!
//! Parameters are addressed by `/`-separated paths (`"file/path"`,
//! `"hdf/datasets/data/type"`).  A trailing `[]` on the final component
//! appends to an array instead of overwriting, which is how repeated status
//! items (`"plugins/names[]"`) accumulate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{FwError, FwResult};

/// Message kind: command, positive reply, negative reply, or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Cmd,
    Ack,
    Nack,
    Notify,
}

/// Message subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgVal {
    Configure,
    Status,
    FrameReady,
    FrameRelease,
}

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    msg_type: MsgType,
    msg_val: MsgVal,
    #[serde(default)]
    params: Value,
}

impl IpcMessage {
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        IpcMessage {
            msg_type,
            msg_val,
            params: Value::Object(Map::new()),
        }
    }

    /// Parse an encoded message; malformed text is a transport error.
    pub fn parse(encoded: &str) -> FwResult<Self> {
        serde_json::from_str(encoded)
            .map_err(|e| FwError::Transport(format!("bad message: {e}")))
    }

    /// Encode to one line of JSON.
    pub fn encode(&self) -> String {
        // Serialization of a Value tree cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn msg_val(&self) -> MsgVal {
        self.msg_val
    }

    pub fn set_nack(&mut self) {
        self.msg_type = MsgType::Nack;
    }

    /// The whole parameter tree.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// True when a parameter exists at `path`.
    pub fn has_param(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Fetch and decode the parameter at `path`.
    ///
    /// Absent or undecodable parameters both surface as [`FwError::MissingField`];
    /// callers treat the two identically.
    pub fn get_param<T: DeserializeOwned>(&self, path: &str) -> FwResult<T> {
        let value = self
            .lookup(path)
            .ok_or_else(|| FwError::MissingField(path.to_owned()))?;
        serde_json::from_value(value.clone())
            .map_err(|_| FwError::MissingField(path.to_owned()))
    }

    /// Borrow the raw sub-tree at `path`, if present.
    pub fn get_subtree(&self, path: &str) -> Option<&Value> {
        self.lookup(path)
    }

    /// Store `value` at `path`, creating intermediate objects as needed.
    /// A trailing `[]` appends to an array at the final component.
    pub fn set_param<T: Serialize>(&mut self, path: &str, value: T) {
        let value = json!(value);
        let mut node = &mut self.params;
        let components: Vec<&str> = path.split('/').collect();
        let Some((last, parents)) = components.split_last() else {
            return;
        };
        for comp in parents {
            let obj = as_object(node);
            node = obj
                .entry(comp.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let obj = as_object(node);
        if let Some(key) = last.strip_suffix("[]") {
            let slot = obj
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = slot {
                items.push(value);
            } else {
                *slot = Value::Array(vec![value]);
            }
        } else {
            obj.insert(last.to_string(), value);
        }
    }

    /// Wrap a raw sub-tree as a configure command, for forwarding a nested
    /// block to a plugin.
    pub fn from_subtree(msg_val: MsgVal, subtree: &Value) -> Self {
        IpcMessage {
            msg_type: MsgType::Cmd,
            msg_val,
            params: subtree.clone(),
        }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.params;
        for comp in path.split('/') {
            node = node.as_object()?.get(comp)?;
        }
        Some(node)
    }
}

// Force a node to be an object so path descent can continue.
fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut().expect("just made an object")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_set_and_get() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("file/path", "/tmp/");
        msg.set_param("file/name", "run.fwf");
        msg.set_param("frames", 100u64);
        assert!(msg.has_param("file/path"));
        assert_eq!(msg.get_param::<String>("file/name").unwrap(), "run.fwf");
        assert_eq!(msg.get_param::<u64>("frames").unwrap(), 100);
    }

    #[test]
    fn missing_field_error_names_the_path() {
        let msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        match msg.get_param::<u64>("frames") {
            Err(FwError::MissingField(p)) => assert_eq!(p, "frames"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn array_suffix_appends() {
        let mut msg = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        msg.set_param("plugins/names[]", "hdf");
        msg.set_param("plugins/names[]", "dummy");
        assert_eq!(
            msg.get_param::<Vec<String>>("plugins/names").unwrap(),
            vec!["hdf", "dummy"]
        );
    }

    #[test]
    fn encode_parse_round_trip() {
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        msg.set_param("hdf/dataset/dims", vec![4u64, 4]);
        let back = IpcMessage::parse(&msg.encode()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.msg_type(), MsgType::Cmd);
    }

    #[test]
    fn malformed_text_is_a_transport_error() {
        assert!(matches!(
            IpcMessage::parse("not json"),
            Err(FwError::Transport(_))
        ));
    }
}
