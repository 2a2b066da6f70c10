// src/files/path.rs - Virtual to physical path resolution
use crate::config::FilesConfig;
use crate::model::Volume;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Invalid path '{0}'")]
    Invalid(String),
    #[error("Path '{0}' leaves its volume")]
    Escapes(String),
    #[error("Unknown volume {0}")]
    UnknownVolume(usize),
    #[error("Volume {0} is not mounted")]
    NotMounted(usize),
}

/// Directory that relative paths are looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDirectory {
    GCodes,
    Macros,
    System,
}

/// Maps `N:/dir/file` style paths onto the local file system. Drive 0 is the
/// configured base directory, other drives are the paths of mounted volumes.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base_directory: PathBuf,
    gcodes_directory: String,
    macros_directory: String,
    system_directory: String,
}

impl PathResolver {
    pub fn new(config: &FilesConfig) -> Self {
        Self {
            base_directory: config.base_directory.clone(),
            gcodes_directory: config.gcodes_directory.clone(),
            macros_directory: config.macros_directory.clone(),
            system_directory: config.system_directory.clone(),
        }
    }

    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    fn directory(&self, directory: FileDirectory) -> &str {
        match directory {
            FileDirectory::GCodes => &self.gcodes_directory,
            FileDirectory::Macros => &self.macros_directory,
            FileDirectory::System => &self.system_directory,
        }
    }

    pub fn resolve(&self, path: &str, directory: FileDirectory, volumes: &[Volume]) -> Result<PathBuf, PathError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(PathError::Invalid(path.to_string()));
        }

        let (drive, rest) = split_drive(path);
        let (root, relative) = match drive {
            Some(0) | None => (self.base_directory.clone(), rest),
            Some(n) => {
                let volume = volumes.get(n).ok_or(PathError::UnknownVolume(n))?;
                match (&volume.path, volume.mounted) {
                    (Some(volume_path), true) => (PathBuf::from(volume_path), rest),
                    _ => return Err(PathError::NotMounted(n)),
                }
            }
        };

        let absolute = drive.is_some() || relative.starts_with('/');
        let mut resolved = root;
        if !absolute {
            push_checked(&mut resolved, self.directory(directory), path)?;
        }
        push_checked(&mut resolved, relative.trim_start_matches('/'), path)?;
        Ok(resolved)
    }
}

/// Split an optional `N:` drive prefix off a path.
fn split_drive(path: &str) -> (Option<usize>, &str) {
    let digits = path.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 && path.as_bytes().get(digits) == Some(&b':') {
        if let Ok(drive) = path[..digits].parse() {
            return (Some(drive), &path[digits + 1..]);
        }
    }
    (None, path)
}

fn push_checked(target: &mut PathBuf, relative: &str, original: &str) -> Result<(), PathError> {
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return Err(PathError::Escapes(original.to_string())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new(&FilesConfig {
            base_directory: PathBuf::from("/opt/sd"),
            gcodes_directory: "gcodes".to_string(),
            macros_directory: "macros".to_string(),
            system_directory: "sys".to_string(),
        })
    }

    fn volumes() -> Vec<Volume> {
        vec![
            Volume { name: "SD".to_string(), mounted: true, ..Volume::default() },
            Volume { name: "USB".to_string(), path: Some("/media/usb".to_string()), mounted: true, ..Volume::default() },
            Volume { name: "Spare".to_string(), path: Some("/media/spare".to_string()), mounted: false, ..Volume::default() },
        ]
    }

    #[test]
    fn test_drive_zero_and_defaults() {
        let r = resolver();
        assert_eq!(r.resolve("0:/gcodes/part.g", FileDirectory::Macros, &[]).unwrap(), PathBuf::from("/opt/sd/gcodes/part.g"));
        assert_eq!(r.resolve("part.g", FileDirectory::GCodes, &[]).unwrap(), PathBuf::from("/opt/sd/gcodes/part.g"));
        assert_eq!(r.resolve("homeall.g", FileDirectory::System, &[]).unwrap(), PathBuf::from("/opt/sd/sys/homeall.g"));
        assert_eq!(r.resolve("/macros/x.g", FileDirectory::System, &[]).unwrap(), PathBuf::from("/opt/sd/macros/x.g"));
    }

    #[test]
    fn test_other_volumes() {
        let r = resolver();
        assert_eq!(r.resolve("1:/job.g", FileDirectory::GCodes, &volumes()).unwrap(), PathBuf::from("/media/usb/job.g"));
        assert_eq!(r.resolve("2:/job.g", FileDirectory::GCodes, &volumes()), Err(PathError::NotMounted(2)));
        assert_eq!(r.resolve("7:/job.g", FileDirectory::GCodes, &volumes()), Err(PathError::UnknownVolume(7)));
    }

    #[test]
    fn test_rejects_escapes_and_requires_colon() {
        let r = resolver();
        assert!(matches!(r.resolve("0:/../etc/passwd", FileDirectory::GCodes, &[]), Err(PathError::Escapes(_))));
        assert!(matches!(r.resolve("", FileDirectory::GCodes, &[]), Err(PathError::Invalid(_))));
        // no colon, so "1" is part of the file name
        assert_eq!(r.resolve("1/job.g", FileDirectory::GCodes, &volumes()).unwrap(), PathBuf::from("/opt/sd/gcodes/1/job.g"));
    }
}
