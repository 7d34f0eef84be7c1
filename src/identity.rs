//! Stable per-directory container identity
//!
//! Every source directory gets one random identifier, persisted as a dotfile
//! inside the directory itself. Re-running against the same directory reuses
//! the identifier and therefore the previously staged overlay layers.

use eyre::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

/// File name holding the identifier inside the source directory
pub const IDENTITY_FILE: &str = ".otalarunc-config";

const ID_LENGTH: usize = 12;

/// Resolve the identity for `source`, creating and persisting a new one on
/// first use. Returns the identifier and whether it already existed.
pub fn resolve(source: &Path) -> Result<(String, bool)> {
    let path = identity_path(source);

    if path.exists() {
        let raw = fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading identity file {}", path.display()))?;
        let id = raw.trim().to_string();
        validate(&id)?;
        log::debug!("Reusing container identity {} from {}", id, path.display());
        return Ok((id, true));
    }

    let id = generate();
    persist(&path, &id)?;
    log::debug!("Created container identity {} at {}", id, path.display());
    Ok((id, false))
}

/// Replace the persisted identity with a freshly generated one.
///
/// Used when the scope manager reports a unit collision: the on-disk id was
/// left behind by a crashed run whose scope still exists.
pub fn regenerate(source: &Path) -> Result<String> {
    let path = identity_path(source);
    let id = generate();
    persist(&path, &id)?;
    log::info!("Regenerated container identity: {}", id);
    Ok(id)
}

fn identity_path(source: &Path) -> PathBuf {
    source.join(IDENTITY_FILE)
}

fn generate() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn validate(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("identity file is empty");
    }
    if !id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        bail!("identity {:?} is not lowercase alphanumeric", id);
    }
    Ok(())
}

/// Write the identifier atomically: temp file in the same directory, then
/// rename over the final name.
fn persist(path: &Path, id: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, id).wrap_err_with(|| format!("writing {}", tmp.display()))?;
    fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644))?;
    fs::rename(&tmp, path)
        .wrap_err_with(|| format!("renaming identity file into {}", path.display()))?;
    Ok(())
}

use std::os::unix::fs::PermissionsExt;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_is_stable() -> Result<()> {
        let tmp = TempDir::new()?;

        let (first, existed_first) = resolve(tmp.path())?;
        let (second, existed_second) = resolve(tmp.path())?;

        assert!(!existed_first);
        assert!(existed_second);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_generated_id_charset() -> Result<()> {
        let tmp = TempDir::new()?;
        let (id, _) = resolve(tmp.path())?;

        assert_eq!(id.len(), ID_LENGTH);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        Ok(())
    }

    #[test]
    fn test_identity_file_contents_are_trimmed() -> Result<()> {
        let tmp = TempDir::new()?;
        fs::write(tmp.path().join(IDENTITY_FILE), "  abc123\n")?;

        let (id, existed) = resolve(tmp.path())?;
        assert!(existed);
        assert_eq!(id, "abc123");
        Ok(())
    }

    #[test]
    fn test_rejects_corrupt_identity() -> Result<()> {
        let tmp = TempDir::new()?;
        fs::write(tmp.path().join(IDENTITY_FILE), "Not Valid!")?;

        assert!(resolve(tmp.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_regenerate_changes_id() -> Result<()> {
        let tmp = TempDir::new()?;
        let (first, _) = resolve(tmp.path())?;
        let second = regenerate(tmp.path())?;

        assert_ne!(first, second);

        // The new id is what subsequent runs will see.
        let (third, existed) = resolve(tmp.path())?;
        assert!(existed);
        assert_eq!(second, third);
        Ok(())
    }
}
