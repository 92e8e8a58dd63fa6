//! Maps the worker's tool names onto the local sandbox tool names so both
//! execution paths produce the same iteration log.

use serde_json::{json, Map, Value};

use crate::agent::truncate;

/// Local name and reshaped input for a worker tool call. Unknown tools
/// pass through unchanged.
pub(crate) fn map_worker_tool(name: &str, input: &Map<String, Value>) -> (String, Map<String, Value>) {
    let field = |key: &str| str_field(input, key);
    let (mapped, reshaped) = match name {
        "Write" => (
            "write_file",
            json!({ "path": field("file_path"), "content": field("content") }),
        ),
        "Edit" => (
            "write_file",
            json!({
                "path": field("file_path"),
                "content": format!(
                    "Edit: {} → {}",
                    truncate(field("old_string"), 50),
                    truncate(field("new_string"), 50)
                ),
            }),
        ),
        "Read" => ("read_file", json!({ "path": field("file_path") })),
        "Bash" => ("run_command", json!({ "command": field("command") })),
        "Glob" | "Grep" => ("read_file", Value::Object(input.clone())),
        _ => return (name.to_string(), input.clone()),
    };
    let reshaped = match reshaped {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    (mapped.to_string(), reshaped)
}

fn str_field<'a>(input: &'a Map<String, Value>, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let (name, args) = map_worker_tool(
            "Write",
            &input(json!({"file_path": "/w/app.py", "content": "x"})),
        );
        assert_eq!(name, "write_file");
        assert_eq!(Value::Object(args), json!({"path": "/w/app.py", "content": "x"}));

        let (name, args) = map_worker_tool("Read", &input(json!({"file_path": "/w/app.py"})));
        assert_eq!(name, "read_file");
        assert_eq!(args["path"], "/w/app.py");
    }

    #[test]
    fn test_edit_is_summarized() {
        let (name, args) = map_worker_tool(
            "Edit",
            &input(json!({"file_path": "/w/a", "old_string": "a".repeat(80), "new_string": "b"})),
        );
        assert_eq!(name, "write_file");
        assert_eq!(args["content"], format!("Edit: {} → b", "a".repeat(50)));
    }

    #[test]
    fn test_bash_glob_and_passthrough() {
        let (name, args) = map_worker_tool("Bash", &input(json!({"command": "ls", "timeout": 5})));
        assert_eq!(name, "run_command");
        assert_eq!(Value::Object(args), json!({"command": "ls"}));

        let (name, args) = map_worker_tool("Grep", &input(json!({"pattern": "TODO"})));
        assert_eq!(name, "read_file");
        assert_eq!(args["pattern"], "TODO");

        let (name, args) = map_worker_tool("kubectl_apply", &input(json!({"manifest": "m"})));
        assert_eq!(name, "kubectl_apply");
        assert_eq!(args["manifest"], "m");
    }
}
