//! Test support for OpenHVX agent development
//!
//! Small builders and assertions shared by the agent's tests:
//! - wire-shaped task and action-script payloads
//! - scratch directories for managed-tree tests
//! - structural JSON assertions

use serde_json::{json, Value};

/// A task body the control plane would route to `agent_id`.
pub fn task_json(task_id: &str, agent_id: &str, action: &str) -> Value {
    json!({
        "taskId": task_id,
        "agentId": agent_id,
        "action": action,
        "data": {},
    })
}

/// Same, with action parameters.
pub fn task_json_with_data(task_id: &str, agent_id: &str, action: &str, data: Value) -> Value {
    json!({
        "taskId": task_id,
        "agentId": agent_id,
        "action": action,
        "data": data,
    })
}

/// Stdout of a well-behaved action script that succeeded.
pub fn success_stdout(result: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "ok": true, "result": result, "error": "" }))
        .expect("serialize success stdout")
}

/// Stdout of a well-behaved action script that failed.
pub fn failure_stdout(error: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({ "ok": false, "error": error })).expect("serialize failure stdout")
}

/// A scratch base directory for managed-tree tests. Keep the handle alive;
/// dropping it removes the directory.
pub fn scratch_base() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("create scratch dir");
    let base = dir.path().to_string_lossy().into_owned();
    (dir, base)
}

/// Assert that every key/value in `expected` appears in `actual`
/// (recursively for objects). Extra keys in `actual` are fine.
pub fn assert_json_subset(expected: &Value, actual: &Value) {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, value) in exp {
                let got = act
                    .get(key)
                    .unwrap_or_else(|| panic!("missing key '{key}' in {actual}"));
                assert_json_subset(value, got);
            }
        }
        (exp, act) => assert_eq!(exp, act, "value mismatch"),
    }
}
