//! Stable per-device identifier sent with every backend request.
//!
//! Uses the platform hardware id from `[device] id` when configured,
//! otherwise a random UUID persisted at `~/.safewalk/device_id`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use safewalk_types::DeviceId;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config_dir;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("could not determine home directory for device id")]
    NoHomeDir,
    #[error("failed to access device id at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("device id file {} is empty", path.display())]
    Empty { path: PathBuf },
}

#[must_use]
pub fn device_id_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("device_id"))
}

/// Pick the configured hardware id, or fall back to the persisted one.
pub fn resolve_device_id(configured: Option<&str>) -> Result<DeviceId, DeviceIdError> {
    if let Some(id) = configured.and_then(|id| DeviceId::new(id).ok()) {
        return Ok(id);
    }
    let path = device_id_path().ok_or(DeviceIdError::NoHomeDir)?;
    load_or_create_device_id(&path)
}

/// Read the id at `path`, generating and persisting a fresh one if absent.
pub fn load_or_create_device_id(path: &Path) -> Result<DeviceId, DeviceIdError> {
    let io_err = |source| DeviceIdError::Io {
        path: path.to_path_buf(),
        source,
    };

    match fs::read_to_string(path) {
        Ok(content) => {
            return DeviceId::new(content).map_err(|_| DeviceIdError::Empty {
                path: path.to_path_buf(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(err)),
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_private_dir(parent).map_err(io_err)?;

    let fresh = uuid::Uuid::new_v4().to_string();
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(fresh.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    if let Err(err) = tmp.persist_noclobber(path) {
        // Lost a race with another process; its id wins.
        if err.error.kind() == io::ErrorKind::AlreadyExists {
            let content = fs::read_to_string(path).map_err(io_err)?;
            return DeviceId::new(content).map_err(|_| DeviceIdError::Empty {
                path: path.to_path_buf(),
            });
        }
        return Err(io_err(err.error));
    }

    tracing::info!(path = %path.display(), "Generated new device id");
    DeviceId::new(fresh).map_err(|_| DeviceIdError::Empty {
        path: path.to_path_buf(),
    })
}

fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let metadata = fs::metadata(dir)?;
        // Only tighten directories we own.
        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() == our_uid {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DeviceIdError, load_or_create_device_id, resolve_device_id};
    use std::fs;

    #[test]
    fn generated_id_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device_id");

        let first = load_or_create_device_id(&path).unwrap();
        assert!(path.exists());
        assert!(uuid::Uuid::parse_str(first.as_str()).is_ok());

        let second = load_or_create_device_id(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn existing_id_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "abc-123\n").unwrap();
        assert_eq!(load_or_create_device_id(&path).unwrap().as_str(), "abc-123");
    }

    #[test]
    fn blank_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "   \n").unwrap();
        assert!(matches!(
            load_or_create_device_id(&path),
            Err(DeviceIdError::Empty { .. })
        ));
    }

    #[test]
    fn configured_hardware_id_wins() {
        let id = resolve_device_id(Some("hw-42")).unwrap();
        assert_eq!(id.as_str(), "hw-42");
    }

    #[cfg(unix)]
    #[test]
    fn parent_directory_is_made_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("home");
        fs::create_dir(&parent).unwrap();
        fs::set_permissions(&parent, fs::Permissions::from_mode(0o755)).unwrap();

        load_or_create_device_id(&parent.join("device_id")).unwrap();

        let mode = fs::metadata(&parent).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
