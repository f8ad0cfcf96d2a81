//! On-disk layout under the data root.
//!
//! Operator-visible files live at the root (`BOSS.md`, per-agent directories,
//! `media/`); everything the daemon owns sits in the hidden `.internal/`
//! subdirectory.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data root.
pub const DATA_DIR_ENV: &str = "HIBOSS_HOME";

const INTERNAL_DIR: &str = ".internal";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: PathBuf) -> Self {
        DataDir { root }
    }

    /// Resolve the data root: explicit override, `HIBOSS_HOME`, else
    /// `~/hiboss`.
    pub fn resolve(override_path: Option<PathBuf>) -> Self {
        let root = override_path
            .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("hiboss")
            });
        DataDir { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn internal(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.internal().join("hiboss.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.internal().join("daemon.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.internal().join("daemon.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.internal().join("logs")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join("media")
    }

    pub fn boss_file(&self) -> PathBuf {
        self.root.join("BOSS.md")
    }

    pub fn agent_dir(&self, name: &str) -> PathBuf {
        self.root.join("agents").join(name)
    }

    /// Default workspace for an agent without an explicit one.
    pub fn agent_workspace(&self, name: &str) -> PathBuf {
        self.agent_dir(name)
    }

    pub fn agent_soul_file(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("SOUL.md")
    }

    pub fn agent_memory_dir(&self, name: &str) -> PathBuf {
        self.agent_dir(name).join("internal_space")
    }

    pub fn agent_memory_file(&self, name: &str) -> PathBuf {
        self.agent_memory_dir(name).join("MEMORY.md")
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.internal())?;
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.media_dir())?;
        let boss = self.boss_file();
        if !boss.exists() {
            std::fs::write(&boss, "# BOSS\n")?;
        }
        Ok(())
    }

    /// Create an agent's directory skeleton (workspace + memory).
    pub fn ensure_agent_layout(&self, name: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.agent_memory_dir(name))?;
        let soul = self.agent_soul_file(name);
        if !soul.exists() {
            std::fs::write(&soul, format!("# {name}\n"))?;
        }
        let memory = self.agent_memory_file(name);
        if !memory.exists() {
            std::fs::write(&memory, "# Memory\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_internal() {
        let d = DataDir::new(PathBuf::from("/data/hiboss"));
        assert_eq!(d.db_path(), PathBuf::from("/data/hiboss/.internal/hiboss.db"));
        assert_eq!(d.socket_path(), PathBuf::from("/data/hiboss/.internal/daemon.sock"));
        assert_eq!(d.pid_path(), PathBuf::from("/data/hiboss/.internal/daemon.pid"));
        assert_eq!(d.agent_soul_file("nex"), PathBuf::from("/data/hiboss/agents/nex/SOUL.md"));
    }

    #[test]
    fn ensure_creates_skeleton() {
        let tmp = tempfile::tempdir().unwrap();
        let d = DataDir::new(tmp.path().join("hiboss"));
        d.ensure_layout().unwrap();
        assert!(d.internal().is_dir());
        assert!(d.log_dir().is_dir());
        assert!(d.boss_file().is_file());
        d.ensure_agent_layout("nex").unwrap();
        assert!(d.agent_soul_file("nex").is_file());
        assert!(d.agent_memory_file("nex").is_file());
    }
}
