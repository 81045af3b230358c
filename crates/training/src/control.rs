//! Leader-written key/value store shared with followers through the filesystem.
//!
//! Each key lives in its own file next to the checkpoint path
//! (`<model_path>.<key>`). Only the leader may write; followers read after a
//! barrier has ordered them behind the leader's write.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

const QUIT_FLAG_KEY: &str = "quitflag";

#[derive(Debug, Clone)]
pub struct ControlPlane {
    base: PathBuf,
    is_leader: bool,
}

impl ControlPlane {
    pub fn new(model_path: impl Into<PathBuf>, is_leader: bool) -> Self {
        Self {
            base: model_path.into(),
            is_leader,
        }
    }

    pub fn key_path(&self, key: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_os_string();
        name.push(".");
        name.push(key);
        PathBuf::from(name)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), TrainingError> {
        if !self.is_leader {
            return Err(TrainingError::coordination(format!(
                "only the leader may write control key '{key}'"
            )));
        }
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = tmp_sibling(&path);
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Returns `None` when the key has never been written.
    pub fn get(&self, key: &str) -> Result<Option<String>, TrainingError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn quit_flag(&self) -> QuitFlag<'_> {
        QuitFlag { plane: self }
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Global stop signal: `"0"` while training, `"1"` once the run must end.
#[derive(Debug, Clone, Copy)]
pub struct QuitFlag<'a> {
    plane: &'a ControlPlane,
}

impl QuitFlag<'_> {
    /// Clears the flag. Only valid before the first barrier of a run.
    pub fn reset(&self) -> Result<(), TrainingError> {
        self.plane.set(QUIT_FLAG_KEY, "0")
    }

    pub fn raise(&self) -> Result<(), TrainingError> {
        self.plane.set(QUIT_FLAG_KEY, "1")
    }

    pub fn is_raised(&self) -> Result<bool, TrainingError> {
        match self.plane.get(QUIT_FLAG_KEY)? {
            None => Ok(false),
            Some(value) => match value.trim() {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(TrainingError::coordination(format!(
                    "quit flag holds unexpected value '{other}'"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn followers_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let follower = ControlPlane::new(dir.path().join("model"), false);
        assert!(follower.quit_flag().raise().is_err());
        assert!(!follower.quit_flag().is_raised().unwrap());
    }

    #[test]
    fn raised_flag_is_visible_to_followers() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model");
        let leader = ControlPlane::new(&model_path, true);
        let follower = ControlPlane::new(&model_path, false);

        leader.quit_flag().reset().unwrap();
        assert!(!follower.quit_flag().is_raised().unwrap());
        assert_eq!(fs::read_to_string(dir.path().join("model.quitflag")).unwrap(), "0");

        leader.quit_flag().raise().unwrap();
        leader.quit_flag().raise().unwrap();
        assert!(follower.quit_flag().is_raised().unwrap());
    }

    #[test]
    fn garbage_flag_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let leader = ControlPlane::new(dir.path().join("model"), true);
        leader.set("quitflag", "maybe").unwrap();
        assert!(leader.quit_flag().is_raised().is_err());
    }
}
