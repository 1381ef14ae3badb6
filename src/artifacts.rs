use crate::{library::LibraryError, model::ModelMetadataRecord};
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use serde_json::{json, ser::PrettyFormatter, Map, Serializer, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DESCRIBE_FILE: &str = "Describe.txt";
pub const TRIGGER_WORDS_FILE: &str = "Trigger_Words.txt";
pub const COMFYUI_CONFIG_FILE: &str = "extra_model_paths.yaml";
pub const WEBUI_USER_BAT: &str = "webui-user.bat";

const COMMANDLINE_PREFIX: &str = "set COMMANDLINE_ARGS=";

const COMFYUI_FOLDERS: &[(&str, &[&str])] = &[
    ("checkpoints", &["checkpoints"]),
    ("clip", &["clip"]),
    ("clip_vision", &["clip_vision"]),
    ("configs", &["configs"]),
    ("controlnet", &["controlnet"]),
    ("diffusion_models", &["diffusion_models", "unet"]),
    ("embeddings", &["embeddings"]),
    ("loras", &["loras"]),
    ("upscale_models", &["upscale_models"]),
    ("vae", &["vae"]),
    ("animatediff_models", &["animatediff_models"]),
    ("animatediff_motion_lora", &["animatediff_motion_lora"]),
    ("ipadapter", &["ipadapter"]),
];

pub fn config_folder(model_path: &Path) -> PathBuf {
    model_path.with_extension("")
}

pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("json")
}

/// Writes `Describe.txt` and `Trigger_Words.txt` for the non-empty fields.
pub fn write_describe_files(model_path: &Path, record: &ModelMetadataRecord) -> Result<Vec<PathBuf>> {
    let folder = config_folder(model_path);
    fs::create_dir_all(&folder).with_context(|| format!("failed to create {:?}", folder))?;

    let mut written = Vec::new();
    for (name, text) in [
        (DESCRIBE_FILE, record.description.as_str()),
        (TRIGGER_WORDS_FILE, record.trigger_words.as_str()),
    ] {
        if text.trim().is_empty() {
            continue;
        }
        let path = folder.join(name);
        fs::write(&path, text).with_context(|| format!("failed to write {:?}", path))?;
        written.push(path);
    }
    Ok(written)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SidecarMode {
    #[default]
    Merge,
    Overwrite,
}

#[derive(Debug, Serialize)]
struct WebuiSidecar<'a> {
    description: &'a str,
    #[serde(rename = "sd version")]
    sd_version: &'a str,
    #[serde(rename = "activation text")]
    activation_text: &'a str,
    #[serde(rename = "preferred weight")]
    preferred_weight: u32,
    #[serde(rename = "negative text")]
    negative_text: &'a str,
    notes: &'a str,
}

pub fn write_webui_sidecar(
    model_path: &Path,
    record: &ModelMetadataRecord,
    mode: SidecarMode,
) -> Result<PathBuf> {
    let path = sidecar_path(model_path);
    let fresh = serde_json::to_value(WebuiSidecar {
        description: &record.description,
        sd_version: "",
        activation_text: &record.trigger_words,
        preferred_weight: 0,
        negative_text: "",
        notes: "",
    })?;

    let value = match mode {
        SidecarMode::Overwrite => fresh,
        SidecarMode::Merge => match fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
        {
            Some(mut existing) => {
                existing.insert("description".into(), Value::String(record.description.clone()));
                existing.insert(
                    "activation text".into(),
                    Value::String(record.trigger_words.clone()),
                );
                Value::Object(existing)
            }
            None => fresh,
        },
    };

    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    fs::write(&path, out).with_context(|| format!("failed to write {:?}", path))?;
    Ok(path)
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub fn comfyui_extra_paths(library_root: &Path) -> String {
    let root = absolute(library_root);
    let base = root.parent().map(slash_path).unwrap_or_default();
    let folder = root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut yaml = format!("comfyui:\n    base_path: {base}\n");
    for (alias, dirs) in COMFYUI_FOLDERS {
        match dirs {
            [single] => yaml.push_str(&format!("    {alias}: {folder}/{single}/\n")),
            many => {
                yaml.push_str(&format!("    {alias}: |\n"));
                for dir in many.iter() {
                    yaml.push_str(&format!("        {folder}/{dir}\n"));
                }
            }
        }
    }
    yaml
}

fn require_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(LibraryError::EmptyField("directory").into());
    }
    if !path.is_dir() {
        return Err(LibraryError::InvalidDirectory(path.to_path_buf()).into());
    }
    Ok(())
}

/// Writes the ComfyUI mapping into `comfy_root`. An existing file is only
/// replaced when `overwrite` is set.
pub fn write_comfyui_extra_paths(comfy_root: &Path, library_root: &Path, overwrite: bool) -> Result<PathBuf> {
    require_dir(comfy_root)?;
    let path = comfy_root.join(COMFYUI_CONFIG_FILE);
    if path.exists() && !overwrite {
        return Err(LibraryError::AlreadyExists(path).into());
    }
    fs::write(&path, comfyui_extra_paths(library_root))
        .with_context(|| format!("failed to write {:?}", path))?;
    info!("Wrote ComfyUI model paths to {:?}", path);
    Ok(path)
}

pub fn webui_commandline_args(library_root: &Path) -> String {
    let root = slash_path(&absolute(library_root));
    format!(
        "{COMMANDLINE_PREFIX}--ckpt-dir {root}/checkpoints --lora-dir {root}/loras \
         --vae-dir {root}/vae --embeddings-dir {root}/embeddings \
         --gfpgan-models-path {root}/upscale_models --esrgan-models-path {root}/upscale_models \
         --controlnet-dir {root}/controlnet"
    )
}

/// Creates `webui-user.bat` or rewrites its COMMANDLINE_ARGS line. An existing
/// line is only replaced when `overwrite` is set.
pub fn patch_webui_user_bat(webui_root: &Path, library_root: &Path, overwrite: bool) -> Result<PathBuf> {
    require_dir(webui_root)?;
    let path = webui_root.join(WEBUI_USER_BAT);
    let args = webui_commandline_args(library_root);

    let contents = match fs::read_to_string(&path) {
        Ok(existing) => {
            let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
            match lines.iter().position(|line| line.starts_with(COMMANDLINE_PREFIX)) {
                Some(_) if !overwrite => return Err(LibraryError::AlreadyExists(path).into()),
                Some(index) => lines[index] = args,
                None => lines.insert(1.min(lines.len()), args),
            }
            let mut joined = lines.join("\n");
            joined.push('\n');
            joined
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            format!("@echo off\n{args}\ncall webui.bat\n")
        }
        Err(err) => return Err(err).with_context(|| format!("failed to read {:?}", path)),
    };

    fs::write(&path, contents).with_context(|| format!("failed to write {:?}", path))?;
    info!("Updated {:?}", path);
    Ok(path)
}

/// ComfyUI loader node for a model, keyed the way ComfyUI's clipboard paste
/// expects. `None` for categories without a matching loader.
pub fn comfy_node_snippet(category: &str, file_name: &str) -> Option<Value> {
    let (class_type, inputs) = match category.to_ascii_lowercase().as_str() {
        "checkpoints" => ("CheckpointLoaderSimple", json!({ "ckpt_name": file_name })),
        "loras" => (
            "LoraLoader",
            json!({ "lora_name": file_name, "strength_model": 1.0, "strength_clip": 1.0 }),
        ),
        "embeddings" => ("CLIPTextEncode", json!({ "embedding_name": file_name })),
        "controlnet" => ("ControlNetLoader", json!({ "control_net_name": file_name })),
        "upscaler" | "upscale_models" => ("UpscaleModelLoader", json!({ "model_name": file_name })),
        _ => return None,
    };
    Some(json!({ "3": { "inputs": inputs, "class_type": class_type } }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(description: &str, trigger_words: &str) -> ModelMetadataRecord {
        ModelMetadataRecord {
            description: description.into(),
            trigger_words: trigger_words.into(),
            ..Default::default()
        }
    }

    #[test]
    fn describe_files_skip_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("style.safetensors");

        let written = write_describe_files(&model, &record("", "blue, red")).unwrap();
        assert_eq!(written, vec![dir.path().join("style").join(TRIGGER_WORDS_FILE)]);
        assert!(!dir.path().join("style").join(DESCRIBE_FILE).exists());
        assert_eq!(
            fs::read_to_string(&written[0]).unwrap(),
            "blue, red"
        );
    }

    #[test]
    fn sidecar_merge_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.safetensors");
        fs::write(
            dir.path().join("m.json"),
            r#"{"description": "old", "preferred weight": 0.7, "sd version": "SDXL"}"#,
        )
        .unwrap();

        let path = write_webui_sidecar(&model, &record("new", "tw"), SidecarMode::Merge).unwrap();
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["description"], "new");
        assert_eq!(value["activation text"], "tw");
        assert_eq!(value["preferred weight"], 0.7);
        assert_eq!(value["sd version"], "SDXL");
    }

    #[test]
    fn sidecar_overwrite_and_unreadable_merge_use_fixed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.safetensors");
        fs::write(dir.path().join("m.json"), "{broken").unwrap();

        let path = write_webui_sidecar(&model, &record("d", ""), SidecarMode::Merge).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"description\": \"d\""));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["preferred weight"], 0);
        assert_eq!(value["negative text"], "");
        assert_eq!(value.as_object().unwrap().len(), 6);
    }

    #[test]
    fn comfyui_yaml_maps_library_folders() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("models");
        fs::create_dir_all(&library).unwrap();

        let yaml = comfyui_extra_paths(&library);
        assert!(yaml.starts_with("comfyui:\n    base_path: "));
        assert!(yaml.contains("    loras: models/loras/\n"));
        assert!(yaml.contains("    diffusion_models: |\n        models/diffusion_models\n        models/unet\n"));
    }

    #[test]
    fn comfyui_config_requires_confirmation_to_replace() {
        let comfy = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();

        write_comfyui_extra_paths(comfy.path(), library.path(), false).unwrap();
        let err = write_comfyui_extra_paths(comfy.path(), library.path(), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LibraryError>(),
            Some(LibraryError::AlreadyExists(_))
        ));
        write_comfyui_extra_paths(comfy.path(), library.path(), true).unwrap();

        let missing = comfy.path().join("missing");
        let err = write_comfyui_extra_paths(&missing, library.path(), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LibraryError>(),
            Some(LibraryError::InvalidDirectory(_))
        ));
    }

    #[test]
    fn webui_bat_is_created_then_patched() {
        let webui = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();

        let path = patch_webui_user_bat(webui.path(), library.path(), false).unwrap();
        let created = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = created.lines().collect();
        assert_eq!(lines[0], "@echo off");
        assert!(lines[1].starts_with("set COMMANDLINE_ARGS=--ckpt-dir "));
        assert_eq!(lines[2], "call webui.bat");

        assert!(patch_webui_user_bat(webui.path(), library.path(), false).is_err());

        fs::write(&path, "@echo off\nset PYTHON=\ncall webui.bat\n").unwrap();
        patch_webui_user_bat(webui.path(), library.path(), false).unwrap();
        let patched = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with(COMMANDLINE_PREFIX));
        assert_eq!(lines[2], "set PYTHON=");
    }

    #[test]
    fn node_snippets_per_category() {
        let node = comfy_node_snippet("loras", "x.safetensors").unwrap();
        assert_eq!(node["3"]["class_type"], "LoraLoader");
        assert_eq!(node["3"]["inputs"]["lora_name"], "x.safetensors");
        assert_eq!(node["3"]["inputs"]["strength_clip"], 1.0);

        let node = comfy_node_snippet("Checkpoints", "c.ckpt").unwrap();
        assert_eq!(node["3"]["inputs"]["ckpt_name"], "c.ckpt");

        assert!(comfy_node_snippet("vae", "v.pt").is_none());
    }
}
