use serde::{Deserialize, Serialize};

fn default_timeout_s() -> u32 {
    300
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

fn default_list_path() -> String {
    "/workspace".to_string()
}

/// A guest agent request, tagged by `action` on the wire.
///
/// Unknown `action` values fail to deserialize into this type; callers that
/// need to answer `{success:false, error:"unknown action"}` for a genuinely
/// unrecognized action (rather than malformed JSON) should inspect the raw
/// `action` field themselves before attempting this deserialization — see
/// `guest-agent`'s dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Exec {
        command: String,
        #[serde(default = "default_timeout_s")]
        timeout: u32,
        #[serde(default = "default_working_dir")]
        working_dir: String,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
        is_base64: bool,
    },
    ListFiles {
        #[serde(default = "default_list_path")]
        path: String,
    },
    Mkdir {
        path: String,
        #[serde(default)]
        parents: bool,
    },
    Stat {
        path: String,
    },
    DeleteFile {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
}
