use serde::Serialize;
use serde_json::{json, Map, Value};

/// One entry of the catalog returned by `list_actions`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Value,
}

impl ActionDescriptor {
    fn new(name: &'static str, description: &'static str, params: Value) -> Self {
        Self {
            name,
            description,
            params,
        }
    }
}

fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_prop_with_default_int(type_str: &str, description: &str, default_val: u32) -> Value {
    json!({
        "type": type_str,
        "description": description,
        "default": default_val
    })
}

fn create_enum_prop(enum_values: &[&str], description: &str) -> Value {
    json!({
        "type": "string",
        "enum": enum_values,
        "description": description
    })
}

fn object_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, prop)| (name.to_string(), prop))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn no_params() -> Value {
    object_schema(&[], vec![])
}

fn container_name_schema(description: &str) -> Value {
    object_schema(&["name"], vec![("name", create_prop("string", description))])
}

/// Every action the dispatcher understands, in the order the panel shows them.
pub fn action_catalog(initial_follow_tail: u32, default_shell: &str) -> Vec<ActionDescriptor> {
    vec![
        // Meta
        ActionDescriptor::new("list_actions", "List the actions this server understands.", no_params()),
        ActionDescriptor::new("get_config", "Get the effective configuration.", no_params()),
        ActionDescriptor::new(
            "read_events",
            "Read buffered lifecycle events after a sequence number.",
            object_schema(
                &[],
                vec![("since", create_prop_with_default_int("integer", "Last sequence number already seen.", 0))],
            ),
        ),
        // Containers
        ActionDescriptor::new("check_engine", "Check whether the container engine responds.", no_params()),
        ActionDescriptor::new(
            "list_containers",
            "List all containers with status, published ports and live stats.",
            object_schema(
                &[],
                vec![
                    ("sort", create_enum_prop(&["name", "uptime"], "Sort order. Defaults to DEFAULT_SORT.")),
                    ("search", create_prop("string", "Case-insensitive substring of the container name.")),
                ],
            ),
        ),
        ActionDescriptor::new(
            "container_action",
            "Start, stop or restart a container.",
            object_schema(
                &["name", "action"],
                vec![
                    ("name", create_prop("string", "Container name.")),
                    ("action", create_enum_prop(&["start", "stop", "restart"], "Lifecycle action to run.")),
                ],
            ),
        ),
        ActionDescriptor::new(
            "delete_container",
            "Force-remove a container. Closes its manage modal if open.",
            container_name_schema("Container name."),
        ),
        ActionDescriptor::new(
            "inspect_container",
            "Image, state, mounts, networks, ports and environment of a container.",
            container_name_schema("Container name."),
        ),
        // Images
        ActionDescriptor::new("list_images", "List images no container uses.", no_params()),
        ActionDescriptor::new(
            "delete_image",
            "Remove an image by ID or reference.",
            object_schema(&["id"], vec![("id", create_prop("string", "Image ID (full or short) or repo:tag."))]),
        ),
        ActionDescriptor::new("prune_images", "Remove all unused images.", no_params()),
        // Manage modal
        ActionDescriptor::new(
            "open_manage",
            "Open the manage modal for a container: load recent logs and start following.",
            container_name_schema("Container to manage."),
        ),
        ActionDescriptor::new(
            "switch_tab",
            "Switch the manage modal tab. Leaving logs stops the log follow.",
            object_schema(
                &["tab"],
                vec![("tab", create_enum_prop(&["logs", "terminal", "details"], "Tab to show."))],
            ),
        ),
        ActionDescriptor::new(
            "follow_logs",
            "(Re)start following logs of the managed container.",
            object_schema(
                &[],
                vec![(
                    "tail",
                    create_prop_with_default_int("integer", "Lines of history to replay first.", initial_follow_tail),
                )],
            ),
        ),
        ActionDescriptor::new("stop_logs", "Stop following logs.", no_params()),
        ActionDescriptor::new(
            "open_terminal",
            "Open a command terminal in the managed container.",
            object_schema(
                &[],
                vec![(
                    "shell",
                    json!({
                        "type": "string",
                        "description": "Absolute path of the shell inside the container.",
                        "default": default_shell
                    }),
                )],
            ),
        ),
        ActionDescriptor::new(
            "run_command",
            "Run one command in the open terminal, replacing any command still running.",
            object_schema(&["command"], vec![("command", create_prop("string", "Shell command line."))]),
        ),
        ActionDescriptor::new("close_terminal", "Close the terminal.", no_params()),
        ActionDescriptor::new("close_manage", "Close the manage modal and all of its streams.", no_params()),
        ActionDescriptor::new("manage_status", "Current modal tab and live sessions.", no_params()),
    ]
}
