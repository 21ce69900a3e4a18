//! Artifact staging and deployment.
//!
//! Rendered artifacts are first written to a private staging directory and
//! then moved to their system destinations. Deployment is not transactional:
//! if a later artifact fails, earlier ones stay in place.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Result, ServError};

/// Where one template ends up on the managed system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactTarget {
    /// Template identifier, `<kind>_<version><suffix>`.
    pub template: String,
    pub destination: PathBuf,
    /// Permission bits applied after deployment (Unix only).
    pub mode: Option<u32>,
    /// Whether a missing parent directory may be created. Directories the
    /// init system itself owns are never created.
    pub create_parent: bool,
}

impl ArtifactTarget {
    pub fn new(template: impl Into<String>, destination: PathBuf) -> Self {
        Self {
            template: template.into(),
            destination,
            mode: None,
            create_parent: false,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn creatable(mut self) -> Self {
        self.create_parent = true;
        self
    }
}

/// A rendered artifact waiting in the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub template: String,
    pub staged: PathBuf,
    pub destination: PathBuf,
    pub mode: Option<u32>,
    pub create_parent: bool,
}

/// Output of generation for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedService {
    pub name: String,
    pub artifacts: Vec<Artifact>,
}

impl GeneratedService {
    /// Staged file paths, in generation order.
    pub fn paths(&self) -> Vec<&Path> {
        self.artifacts.iter().map(|a| a.staged.as_path()).collect()
    }

    pub fn destinations(&self) -> Vec<&Path> {
        self.artifacts.iter().map(|a| a.destination.as_path()).collect()
    }
}

/// Per-service staging directory, `<staging_root>/<kind>-<name>`.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new(staging_root: &Path, kind: &str, name: &str) -> Self {
        Self {
            dir: staging_root.join(format!("{}-{}", kind, name)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `contents` for `target` into the staging directory.
    ///
    /// Fails with [`ServError::ArtifactExists`] if either the staged file or
    /// the final destination already exists and `overwrite` is false.
    pub fn write(&self, target: &ArtifactTarget, contents: &str, overwrite: bool) -> Result<Artifact> {
        let file_name = target.destination.file_name().ok_or_else(|| {
            ServError::invalid(
                "destination",
                format!("{} has no file name", target.destination.display()),
            )
        })?;
        // Artifacts of one service may share a file name (init.d/svc and
        // default/svc), so staging mirrors the destination's parent directory
        let parent_name = target
            .destination
            .parent()
            .and_then(Path::file_name)
            .unwrap_or_default();
        let staged_dir = self.dir.join(parent_name);
        let staged = staged_dir.join(file_name);

        if !overwrite {
            for path in [&staged, &target.destination] {
                if path.exists() {
                    return Err(ServError::ArtifactExists { path: path.clone() });
                }
            }
        }

        if let Some(staging_root) = self.dir.parent() {
            private_dir(staging_root)?;
        }
        private_dir(&self.dir)?;
        private_dir(&staged_dir)?;

        let mut tmp =
            NamedTempFile::new_in(&staged_dir).map_err(|e| ServError::io(&staged_dir, e))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| ServError::io(tmp.path(), e))?;
        tmp.persist(&staged)
            .map_err(|e| ServError::io(&staged, e.error))?;

        debug!(
            template = %target.template,
            staged = %staged.display(),
            bytes = contents.len(),
            "Staged artifact"
        );

        Ok(Artifact {
            template: target.template.clone(),
            staged,
            destination: target.destination.clone(),
            mode: target.mode,
            create_parent: target.create_parent,
        })
    }
}

/// Create `dir` owner-only if missing and refuse one that someone else could
/// write to.
#[cfg(unix)]
fn private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, MetadataExt};

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| ServError::io(dir, e))?;

    let meta = fs::symlink_metadata(dir).map_err(|e| ServError::io(dir, e))?;
    let euid = nix::unistd::Uid::effective().as_raw();
    if !meta.is_dir() || meta.uid() != euid || meta.mode() & 0o022 != 0 {
        return Err(ServError::io(
            dir,
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "staging directory must be a directory owned by uid {} and writable by it alone (owner {}, mode {:o})",
                    euid,
                    meta.uid(),
                    meta.mode() & 0o7777
                ),
            ),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| ServError::io(dir, e))
}

/// Move every staged artifact to its destination.
///
/// Returns the deployed destinations. Stops at the first failure.
pub fn deploy(generated: &GeneratedService, overwrite: bool) -> Result<Vec<PathBuf>> {
    let mut deployed = Vec::with_capacity(generated.artifacts.len());

    for artifact in &generated.artifacts {
        deploy_one(artifact, overwrite)?;
        deployed.push(artifact.destination.clone());
    }

    // Best effort: the staging directories are private and empty by now
    for artifact in &generated.artifacts {
        if let Some(dir) = artifact.staged.parent() {
            let _ = fs::remove_dir(dir);
            if let Some(service_dir) = dir.parent() {
                let _ = fs::remove_dir(service_dir);
            }
        }
    }

    info!(service = %generated.name, count = deployed.len(), "Deployed artifacts");
    Ok(deployed)
}

fn deploy_one(artifact: &Artifact, overwrite: bool) -> Result<()> {
    let destination = &artifact.destination;

    if !overwrite && destination.exists() {
        return Err(ServError::ArtifactExists {
            path: destination.clone(),
        });
    }

    if let Some(parent) = destination.parent() {
        if !parent.is_dir() {
            if !artifact.create_parent {
                return Err(ServError::MissingSystemDirectory {
                    dir: parent.to_path_buf(),
                    path: destination.clone(),
                });
            }
            fs::create_dir_all(parent).map_err(|e| ServError::io(parent, e))?;
            debug!(dir = %parent.display(), "Created directory");
        }
    }

    move_file(&artifact.staged, destination)?;

    if let Some(mode) = artifact.mode {
        set_mode(destination, mode)?;
    }

    info!(
        from = %artifact.staged.display(),
        to = %destination.display(),
        "Deployed"
    );
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| ServError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Rename, falling back to copy and remove across filesystems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| ServError::io(to, e))?;
    fs::remove_file(from).map_err(|e| ServError::io(from, e))?;
    Ok(())
}

/// Create a symlink at `link` pointing to `target`, unless something is already there.
#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| ServError::io(link, e))?;
    debug!(link = %link.display(), target = %target.display(), "Linked");
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(ServError::io(
        link,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks need a Unix host"),
    ))
}

/// Remove `path` if it exists. Returns whether something was removed.
pub(crate) fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| ServError::io(path, e))?;
        }
        Ok(_) => {
            fs::remove_file(path).map_err(|e| ServError::io(path, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(ServError::io(path, e)),
    }
    info!(path = %path.display(), "Removed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(root: &Path, rel: &str) -> ArtifactTarget {
        ArtifactTarget::new("systemd_default.service", root.join(rel))
    }

    #[test]
    fn staging_dir_is_deterministic() {
        let staging = Staging::new(Path::new("/tmp/serv"), "systemd", "svc1");
        assert_eq!(staging.dir(), Path::new("/tmp/serv/systemd-svc1"));
    }

    #[test]
    fn write_refuses_existing_staged_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = Staging::new(&tmp.path().join("staging"), "systemd", "svc1");
        let t = target(tmp.path(), "lib/systemd/system/svc1.service");

        let first = staging.write(&t, "one", false).unwrap();
        assert_eq!(fs::read_to_string(&first.staged).unwrap(), "one");

        match staging.write(&t, "two", false) {
            Err(ServError::ArtifactExists { path }) => assert_eq!(path, first.staged),
            other => panic!("unexpected: {:?}", other),
        }

        let again = staging.write(&t, "two", true).unwrap();
        assert_eq!(fs::read_to_string(&again.staged).unwrap(), "two");
    }

    #[test]
    fn write_refuses_existing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let dest_dir = tmp.path().join("etc/init");
        fs::create_dir_all(&dest_dir).unwrap();
        fs::write(dest_dir.join("svc.conf"), "old").unwrap();

        let staging = Staging::new(&tmp.path().join("staging"), "upstart", "svc");
        let t = target(tmp.path(), "etc/init/svc.conf");
        assert!(matches!(
            staging.write(&t, "new", false),
            Err(ServError::ArtifactExists { .. })
        ));
    }

    #[test]
    fn deploy_creates_only_creatable_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = Staging::new(&tmp.path().join("staging"), "sysv", "svc");

        let script = staging
            .write(&target(tmp.path(), "etc/init.d/svc"), "#!/bin/sh\n", false)
            .unwrap();
        let generated = GeneratedService {
            name: "svc".into(),
            artifacts: vec![script],
        };
        match deploy(&generated, false) {
            Err(ServError::MissingSystemDirectory { dir, .. }) => {
                assert_eq!(dir, tmp.path().join("etc/init.d"))
            }
            other => panic!("unexpected: {:?}", other),
        }

        let defaults = staging
            .write(
                &target(tmp.path(), "etc/default/svc").creatable().mode(0o644),
                "X=1\n",
                false,
            )
            .unwrap();
        let generated = GeneratedService {
            name: "svc".into(),
            artifacts: vec![defaults],
        };
        let deployed = deploy(&generated, false).unwrap();
        assert_eq!(deployed, vec![tmp.path().join("etc/default/svc")]);
        assert_eq!(fs::read_to_string(&deployed[0]).unwrap(), "X=1\n");
    }

    #[cfg(unix)]
    #[test]
    fn deploy_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("etc/init.d")).unwrap();
        let staging = Staging::new(&tmp.path().join("staging"), "sysv", "svc");
        let script = staging
            .write(&target(tmp.path(), "etc/init.d/svc").mode(0o755), "#!/bin/sh\n", false)
            .unwrap();
        let generated = GeneratedService {
            name: "svc".into(),
            artifacts: vec![script],
        };
        deploy(&generated, false).unwrap();

        let mode = fs::metadata(tmp.path().join("etc/init.d/svc"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!staging.dir().exists());
    }

    #[cfg(unix)]
    #[test]
    fn staging_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("staging");
        let staging = Staging::new(&root, "systemd", "svc1");
        staging
            .write(&target(tmp.path(), "lib/systemd/system/svc1.service"), "x", false)
            .unwrap();

        for dir in [root.clone(), staging.dir().to_path_buf()] {
            let mode = fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0, "{} is not private", dir.display());
        }
    }

    #[cfg(unix)]
    #[test]
    fn shared_staging_dir_is_refused() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("staging");
        let service_dir = root.join("sysv-svc");
        fs::create_dir_all(&service_dir).unwrap();
        fs::set_permissions(&service_dir, fs::Permissions::from_mode(0o777)).unwrap();

        let staging = Staging::new(&root, "sysv", "svc");
        match staging.write(&target(tmp.path(), "etc/init.d/svc"), "#!/bin/sh\n", false) {
            Err(ServError::Io { path, source }) => {
                assert_eq!(path, service_dir);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!service_dir.join("init.d").exists());
    }

    #[test]
    fn remove_if_present_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("svc.conf");
        fs::write(&path, "x").unwrap();
        assert!(remove_if_present(&path).unwrap());
        assert!(!remove_if_present(&path).unwrap());
    }
}
