use std::path::PathBuf;

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
            "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
            _ => None,
        }
    })
}

fn parse_env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn library_root_override() -> Option<PathBuf> {
    parse_env_path("MODEL_SHELF_ROOT")
}

pub fn info_file_override() -> Option<PathBuf> {
    parse_env_path("MODEL_SHELF_INFO_FILE")
}

pub fn offline_mode() -> bool {
    parse_env_bool("MODEL_SHELF_OFFLINE").unwrap_or(false)
}

pub fn keep_metadata_backup() -> bool {
    parse_env_bool("MODEL_SHELF_KEEP_BACKUP").unwrap_or(false)
}
