use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::debug;
use zip::ZipArchive;

use crate::classfile::decode_class;
use crate::ir::Class;

/// Decoded classes and the SARIF artifacts they were read from.
pub(crate) struct ScanOutput {
    pub(crate) artifacts: Vec<Artifact>,
    /// Classes to analyse.
    pub(crate) classes: Vec<Class>,
    /// Classes used only to answer hierarchy queries.
    pub(crate) classpath_classes: Vec<Class>,
}

pub(crate) fn scan_inputs(input: &Path, classpath: &[PathBuf]) -> Result<ScanOutput> {
    let mut artifacts = Vec::new();
    let mut classes = Vec::new();
    let mut classpath_classes = Vec::new();

    scan_path(input, true, true, &mut artifacts, &mut classes)?;

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by_key(|entry| path_key(entry));

    for entry in classpath_entries {
        scan_path(&entry, false, true, &mut artifacts, &mut classpath_classes)?;
    }

    debug!(
        classes = classes.len(),
        classpath_classes = classpath_classes.len(),
        artifacts = artifacts.len(),
        "scan finished"
    );
    Ok(ScanOutput {
        artifacts,
        classes,
        classpath_classes,
    })
}

fn scan_path(
    path: &Path,
    is_input: bool,
    strict: bool,
    artifacts: &mut Vec<Artifact>,
    classes: &mut Vec<Class>,
) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, is_input, artifacts, classes);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let roles = if is_input {
        Some(vec![
            serde_json::to_value(ArtifactRoles::AnalysisTarget)
                .context("failed to serialize artifact role")?,
        ])
    } else {
        None
    };

    match extension {
        "class" => scan_class_file(path, roles, artifacts, classes),
        "jar" => scan_jar_file(path, roles, artifacts, classes),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(
    path: &Path,
    is_input: bool,
    artifacts: &mut Vec<Artifact>,
    classes: &mut Vec<Class>,
) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by_key(|entry| path_key(entry));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, is_input, artifacts, classes)?;
        } else {
            scan_path(&entry, is_input, false, artifacts, classes)?;
        }
    }

    Ok(())
}

fn scan_class_file(
    path: &Path,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
    classes: &mut Vec<Class>,
) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let index = push_artifact(path_to_uri(path), data.len() as u64, None, roles, artifacts);
    let class =
        parse_class(&data, index).with_context(|| format!("failed to parse {}", path.display()))?;
    classes.push(class);
    Ok(())
}

fn scan_jar_file(
    path: &Path,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
    classes: &mut Vec<Class>,
) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

    let jar_len = fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .len();
    let jar_index = push_artifact(path_to_uri(path), jar_len, None, roles, artifacts);

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;

        let entry_uri = jar_entry_uri(path, &name);
        let index = push_artifact(entry_uri, entry.size(), Some(jar_index), None, artifacts);
        let class = parse_class(&data, index)
            .with_context(|| format!("failed to parse {}:{}", path.display(), name))?;
        classes.push(class);
    }

    Ok(())
}

fn parse_class(data: &[u8], artifact_index: i64) -> Result<Class> {
    let class = decode_class(data, artifact_index)?;
    debug!(class = %class.name, methods = class.methods.len(), "class decoded");
    Ok(class)
}

fn push_artifact(
    uri: String,
    len: u64,
    parent_index: Option<i64>,
    roles: Option<Vec<Value>>,
    artifacts: &mut Vec<Artifact>,
) -> i64 {
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = match (parent_index, roles) {
        (Some(parent_index), Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .roles(roles)
            .build(),
        (Some(parent_index), None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .parent_index(parent_index)
            .build(),
        (None, Some(roles)) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        (None, None) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .build(),
    };
    let index = artifacts.len() as i64;
    artifacts.push(artifact);
    index
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use crate::classfile::tests::class_bytes;
    use crate::opcodes;

    fn artifact_uri(artifact: &Artifact) -> String {
        artifact
            .location
            .as_ref()
            .and_then(|location| location.uri.clone())
            .expect("artifact uri")
    }

    fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = fs::File::create(path).expect("create jar");
        let mut writer = ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish jar");
    }

    #[test]
    fn scan_inputs_rejects_invalid_class_file() {
        let temp_dir = tempdir().expect("create temp dir");
        let class_path = temp_dir.path().join("bad.class");
        fs::write(&class_path, b"nope").expect("write test class");

        let result = scan_inputs(&class_path, &[]);

        assert!(result.is_err());
    }

    #[test]
    fn scan_inputs_decodes_class_file() {
        let temp_dir = tempdir().expect("create temp dir");
        let class_path = temp_dir.path().join("Sample.class");
        fs::write(
            &class_path,
            class_bytes("com/example/Sample", "run", &[opcodes::RETURN]),
        )
        .expect("write class file");

        let result = scan_inputs(&class_path, &[]).expect("scan class");

        assert_eq!(1, result.classes.len());
        assert!(result.classpath_classes.is_empty());
        assert_eq!("com/example/Sample", result.classes[0].name);
        assert_eq!(0, result.classes[0].artifact_index);
        assert_eq!(1, result.artifacts.len());
        assert!(result.artifacts[0].roles.is_some());
    }

    #[test]
    fn jar_entries_are_sorted_and_linked_to_the_jar() {
        let temp_dir = tempdir().expect("create temp dir");
        let jar_path = temp_dir.path().join("app.jar");
        write_jar(
            &jar_path,
            &[
                ("b/Second.class", class_bytes("b/Second", "run", &[opcodes::RETURN])),
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
                ("a/First.class", class_bytes("a/First", "run", &[opcodes::RETURN])),
            ],
        );

        let result = scan_inputs(&jar_path, &[]).expect("scan jar");

        let names: Vec<&str> = result.classes.iter().map(|class| class.name.as_str()).collect();
        assert_eq!(vec!["a/First", "b/Second"], names);
        assert_eq!(3, result.artifacts.len());
        assert!(artifact_uri(&result.artifacts[0]).ends_with("app.jar"));
        assert!(artifact_uri(&result.artifacts[1]).ends_with("app.jar!/a/First.class"));
        assert_eq!(Some(0), result.artifacts[1].parent_index);
        assert_eq!(1, result.classes[0].artifact_index);
        assert_eq!(2, result.classes[1].artifact_index);
    }

    #[test]
    fn classpath_classes_are_kept_apart_from_inputs() {
        let temp_dir = tempdir().expect("create temp dir");
        let input = temp_dir.path().join("Input.class");
        fs::write(&input, class_bytes("app/Input", "run", &[opcodes::RETURN]))
            .expect("write input");
        let lib_dir = temp_dir.path().join("lib");
        fs::create_dir_all(lib_dir.join("nested")).expect("create lib dir");
        fs::write(
            lib_dir.join("nested").join("Lib.class"),
            class_bytes("lib/Lib", "run", &[opcodes::RETURN]),
        )
        .expect("write lib class");
        fs::write(lib_dir.join("notes.txt"), b"ignored").expect("write notes");

        let result = scan_inputs(&input, &[lib_dir]).expect("scan");

        assert_eq!(1, result.classes.len());
        assert_eq!(1, result.classpath_classes.len());
        assert_eq!("lib/Lib", result.classpath_classes[0].name);
        assert!(result.artifacts[1].roles.is_none());
    }
}
