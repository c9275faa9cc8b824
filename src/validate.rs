//! Pure validation of user-supplied MCP server specs. Nothing here performs
//! I/O; identical input always yields an identical verdict. A spec must pass
//! this gate before it is persisted, and must be persisted before any
//! subprocess is spawned.

use std::collections::HashMap;

use crate::mcp::ServerSpec;

const MAX_SERVER_ID_LEN: usize = 64;
const MAX_ARG_LEN: usize = 1024;
const MAX_ARGS: usize = 50;
const MAX_ENV_KEY_LEN: usize = 128;
const MAX_ENV_VALUE_LEN: usize = 1024;
const MAX_ENV_ENTRIES: usize = 50;

/// Commands a user may launch. Closed set; anything else is rejected.
const ALLOWED_COMMANDS: &[&str] = &["npx", "uvx", "uv", "node", "python", "docker"];

/// Environment keys that can hijack process execution. Matching (case
/// insensitive, `DYLD_` as a prefix) rejects the whole spec.
const BLOCKED_ENV_KEYS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "NODE_PATH",
    "NODE_OPTIONS",
    "SSL_CERT_FILE",
    "LC_ALL",
];

/// Absolute-path prefixes an argument may reference.
const ALLOWED_PATH_ROOTS: &[&str] = &["/tmp/", "/var/tmp/", "/workspace/"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("command '{0}' is not on the whitelist")]
    UnknownCommand(String),

    #[error("server id must be 1-64 characters of [A-Za-z0-9_-]")]
    BadServerId,

    #[error("argument {index}: {reason}")]
    BadArg { index: usize, reason: String },

    #[error("environment key '{0}' is not allowed")]
    BadEnvKey(String),

    #[error("environment value for '{0}' contains forbidden characters")]
    BadEnvValue(String),

    #[error("argument {0} references a path outside the allowed roots")]
    PathTraversal(usize),

    #[error("{0}")]
    TooMany(String),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::UnknownCommand(_) => "validation:unknown-command",
            ValidationError::BadServerId => "validation:bad-server-id",
            ValidationError::BadArg { .. } => "validation:bad-arg",
            ValidationError::BadEnvKey(_) => "validation:bad-env-key",
            ValidationError::BadEnvValue(_) => "validation:bad-env-value",
            ValidationError::PathTraversal(_) => "validation:path-traversal",
            ValidationError::TooMany(_) => "validation:too-many",
        }
    }
}

/// Full validation of a server spec: id, command, args, env.
pub fn validate_spec(spec: &ServerSpec) -> Result<(), ValidationError> {
    validate_server_id(&spec.server_id)?;
    validate_command(&spec.command)?;
    validate_args_for_command(&spec.command, &spec.args)?;
    validate_env(&spec.env)?;
    Ok(())
}

pub fn validate_server_id(server_id: &str) -> Result<(), ValidationError> {
    if server_id.is_empty() || server_id.len() > MAX_SERVER_ID_LEN {
        return Err(ValidationError::BadServerId);
    }
    if !server_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::BadServerId);
    }
    Ok(())
}

pub fn validate_command(command: &str) -> Result<(), ValidationError> {
    if ALLOWED_COMMANDS.contains(&command) {
        Ok(())
    } else {
        Err(ValidationError::UnknownCommand(command.to_string()))
    }
}

/// Shell metacharacters and control bytes that are never allowed, in any
/// argument or environment value.
fn dangerous_pattern(value: &str) -> Option<&'static str> {
    for (needle, label) in [
        (";", "command separator"),
        ("|", "pipe"),
        ("&", "background/and"),
        ("$(", "command substitution"),
        ("`", "command substitution"),
        ("${", "variable expansion"),
        (">", "redirect"),
        ("<", "redirect"),
        ("\\", "escape"),
        ("'", "quote"),
        ("\"", "quote"),
        ("\n", "newline"),
        ("\r", "carriage return"),
        ("\0", "null byte"),
    ] {
        if value.contains(needle) {
            return Some(label);
        }
    }
    None
}

fn is_traversal(value: &str) -> bool {
    if value.contains("../") || value.starts_with("~/") || value == ".." || value == "~" {
        return true;
    }
    if value.starts_with('/') {
        return !ALLOWED_PATH_ROOTS
            .iter()
            .any(|root| value.starts_with(root));
    }
    false
}

/// First-argument character class per command. The first argument names the
/// package, script, or image to run and is held to a tighter alphabet than
/// later flags.
fn first_arg_ok(command: &str, arg: &str) -> bool {
    let extra: &[char] = match command {
        "npx" | "uvx" | "uv" => &['@', '/', '_', '-', '.'],
        "node" | "python" => &['@', '.', '/', '_', '-'],
        "docker" => &[':', '@', '.', '/', '_', '-'],
        _ => &[],
    };
    !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || extra.contains(&c))
}

fn later_arg_ok(arg: &str) -> bool {
    !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '@' | '.' | '/' | '_' | '=' | ':' | ',' | '-' | '+')
        })
}

pub fn validate_args_for_command(command: &str, args: &[String]) -> Result<(), ValidationError> {
    if args.len() > MAX_ARGS {
        return Err(ValidationError::TooMany(format!(
            "too many arguments (max {MAX_ARGS})"
        )));
    }
    if args.is_empty() {
        return Err(ValidationError::BadArg {
            index: 0,
            reason: "argument list cannot be empty".into(),
        });
    }

    for (i, arg) in args.iter().enumerate() {
        if arg.len() > MAX_ARG_LEN {
            return Err(ValidationError::BadArg {
                index: i,
                reason: format!("too long (max {MAX_ARG_LEN} characters)"),
            });
        }
        if let Some(label) = dangerous_pattern(arg) {
            return Err(ValidationError::BadArg {
                index: i,
                reason: format!("contains {label}"),
            });
        }
        if is_traversal(arg) {
            return Err(ValidationError::PathTraversal(i));
        }
        let ok = if i == 0 {
            first_arg_ok(command, arg)
        } else {
            later_arg_ok(arg)
        };
        if !ok {
            return Err(ValidationError::BadArg {
                index: i,
                reason: "contains invalid characters".into(),
            });
        }
    }
    Ok(())
}

pub fn validate_env(env: &HashMap<String, String>) -> Result<(), ValidationError> {
    if env.len() > MAX_ENV_ENTRIES {
        return Err(ValidationError::TooMany(format!(
            "too many environment variables (max {MAX_ENV_ENTRIES})"
        )));
    }

    for (key, value) in env {
        let upper = key.to_ascii_uppercase();
        if BLOCKED_ENV_KEYS.contains(&upper.as_str()) || upper.starts_with("DYLD_") {
            return Err(ValidationError::BadEnvKey(key.clone()));
        }
        if key.len() > MAX_ENV_KEY_LEN || !env_key_format_ok(key) {
            return Err(ValidationError::BadEnvKey(key.clone()));
        }
        if value.len() > MAX_ENV_VALUE_LEN || dangerous_pattern(value).is_some() {
            return Err(ValidationError::BadEnvValue(key.clone()));
        }
    }
    Ok(())
}

fn env_key_format_ok(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
