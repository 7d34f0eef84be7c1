//! Per-user on-disk layout and rootfs staging
//!
//! Data lives under the XDG data home (`rootfs/`, `storage/`, `metadata/`),
//! container configs under the XDG config home. The base image ships inside
//! the executable as a gzip'd tarball and is extracted once per machine.

use eyre::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

const APP_DIR: &str = "otala-runc";

/// Resolved filesystem locations for one container
#[derive(Debug, Clone)]
pub struct ContainerPaths {
    /// Shared read-only lower layer
    pub rootfs: PathBuf,
    /// Per-container overlay storage (`storage/<id>`)
    pub storage: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    /// Per-container config directory (`<config-root>/<id>`)
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
}

/// Base directories for the runtime, XDG-style
fn runtime_dirs() -> Result<(PathBuf, PathBuf)> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| eyre::eyre!("HOME is not set"))?;

    let data = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(".local").join("share"))
        .join(APP_DIR);

    let config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join(".config"))
        .join(APP_DIR);

    Ok((data, config))
}

/// Compute the paths for `container_id` without touching the filesystem.
pub fn container_paths(container_id: &str) -> Result<ContainerPaths> {
    let (data, config) = runtime_dirs()?;

    let storage = data.join("storage").join(container_id);
    let config_dir = config.join(container_id);

    Ok(ContainerPaths {
        rootfs: data.join("rootfs").join("alpine"),
        upper: storage.join("upper"),
        work: storage.join("work"),
        merged: storage.join("merged"),
        storage,
        config_file: config_dir.join("config.json"),
        config_dir,
    })
}

/// Prepare the on-disk layout for a run and return the resolved lockdown
/// document bytes.
///
/// Warm start: when this container's `config.json` already exists it is read
/// back verbatim and the rootfs is left alone. Otherwise the embedded base
/// image is extracted (if missing) and the embedded template is synthesized
/// into a config carrying the absolute overlay paths.
pub fn prepare(container_id: &str, template: &[u8], rootfs_tar: &[u8]) -> Result<(ContainerPaths, Vec<u8>)> {
    let (data, config) = runtime_dirs()?;

    for dir in [
        data.join("rootfs"),
        data.join("storage"),
        data.join("metadata"),
        config.join("containers"),
    ] {
        fs::create_dir_all(&dir).wrap_err_with(|| format!("creating {}", dir.display()))?;
    }

    let paths = container_paths(container_id)?;

    if paths.config_file.exists() {
        log::info!("Warm start: reusing {}", paths.config_file.display());
        let document = fs::read(&paths.config_file)
            .wrap_err_with(|| format!("reading {}", paths.config_file.display()))?;
        return Ok((paths, document));
    }

    if !paths.rootfs.exists() {
        log::info!("Extracting base rootfs into {}", paths.rootfs.display());
        extract_rootfs(&paths.rootfs, rootfs_tar)?;
    }

    let document = synthesize_config(template, &paths)?;

    fs::create_dir_all(&paths.config_dir)
        .wrap_err_with(|| format!("creating {}", paths.config_dir.display()))?;
    fs::write(&paths.config_file, &document)
        .wrap_err_with(|| format!("writing {}", paths.config_file.display()))?;

    Ok((paths, document))
}

/// Inject the resolved overlay paths into the embedded template document.
fn synthesize_config(template: &[u8], paths: &ContainerPaths) -> Result<Vec<u8>> {
    let mut document: serde_json::Value =
        serde_json::from_slice(template).wrap_err("parsing embedded config template")?;

    let object = document
        .as_object_mut()
        .ok_or_else(|| eyre::eyre!("config template is not a JSON object"))?;

    object.insert("rootfs".into(), path_value(&paths.rootfs)?);
    object.insert("merged".into(), path_value(&paths.merged)?);
    object.insert("upper".into(), path_value(&paths.upper)?);
    object.insert("work".into(), path_value(&paths.work)?);

    Ok(serde_json::to_vec_pretty(&document)?)
}

fn path_value(path: &Path) -> Result<serde_json::Value> {
    match path.to_str() {
        Some(s) => Ok(serde_json::Value::String(s.to_string())),
        None => bail!("path {} is not valid UTF-8", path.display()),
    }
}

/// Unpack the embedded gzip'd rootfs tarball into `target`.
fn extract_rootfs(target: &Path, tar_gz: &[u8]) -> Result<()> {
    fs::create_dir_all(target).wrap_err_with(|| format!("creating {}", target.display()))?;

    let decoder = GzDecoder::new(tar_gz);
    let mut archive = Archive::new(decoder);
    archive.set_preserve_permissions(true);

    for entry in archive.entries().wrap_err("reading rootfs archive")? {
        let mut entry = entry.wrap_err("reading rootfs archive entry")?;
        let kind = entry.header().entry_type();

        // Device nodes cannot be created without privileges; the base image
        // keeps /dev empty, so anything else of that kind is skipped.
        if kind.is_block_special() || kind.is_character_special() {
            log::warn!(
                "Skipping device node {} in rootfs archive",
                entry.path()?.display()
            );
            continue;
        }

        entry
            .unpack_in(target)
            .wrap_err_with(|| format!("unpacking into {}", target.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_path("etc/").unwrap();
        dir_header.set_mode(0o755);
        dir_header.set_size(0);
        dir_header.set_cksum();
        builder.append(&dir_header, std::io::empty()).unwrap();

        let contents = b"alpine\n";
        let mut file_header = tar::Header::new_gnu();
        file_header.set_path("etc/os-release").unwrap();
        file_header.set_mode(0o644);
        file_header.set_size(contents.len() as u64);
        file_header.set_cksum();
        builder.append(&file_header, &contents[..]).unwrap();

        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_rootfs_unpacks_files() -> Result<()> {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("alpine");

        extract_rootfs(&target, &sample_tarball())?;

        let extracted = fs::read_to_string(target.join("etc/os-release"))?;
        assert_eq!(extracted, "alpine\n");
        Ok(())
    }

    #[test]
    fn test_synthesize_config_injects_paths() -> Result<()> {
        let template = br#"{"capabilities": {}, "seccomp": {}}"#;
        let paths = ContainerPaths {
            rootfs: PathBuf::from("/data/rootfs/alpine"),
            storage: PathBuf::from("/data/storage/abc"),
            upper: PathBuf::from("/data/storage/abc/upper"),
            work: PathBuf::from("/data/storage/abc/work"),
            merged: PathBuf::from("/data/storage/abc/merged"),
            config_dir: PathBuf::from("/cfg/abc"),
            config_file: PathBuf::from("/cfg/abc/config.json"),
        };

        let document = synthesize_config(template, &paths)?;
        let value: serde_json::Value = serde_json::from_slice(&document)?;

        assert_eq!(value["rootfs"], "/data/rootfs/alpine");
        assert_eq!(value["merged"], "/data/storage/abc/merged");
        assert_eq!(value["upper"], "/data/storage/abc/upper");
        assert_eq!(value["work"], "/data/storage/abc/work");
        // The template's own keys survive injection.
        assert!(value.get("capabilities").is_some());
        Ok(())
    }

    #[test]
    fn test_embedded_template_is_valid_json() -> Result<()> {
        let value: serde_json::Value = serde_json::from_slice(crate::CONFIG_TEMPLATE)?;
        assert!(value["capabilities"]["bounding"].is_array());
        assert!(value["seccomp"]["syscalls"].is_array());
        Ok(())
    }
}
