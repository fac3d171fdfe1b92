use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::graph::{Graph, GraphLock};
use crate::id::{ContainerId, ImageId};
use crate::ops::diff::diff_filesystem;
use crate::ops::filesystem::{
    create_filesystem_from_layer, discard_filesystem, filesystem, lock_filesystem, mount_filesystem,
    remove_filesystem, save_filesystem, unmount_filesystem,
};
use crate::ops::image::image;
use crate::record::{delete_record, list_records, read_record, write_record};
use crate::types::{now, Changeset, Container, ContainerState};

/// lifecycle callbacks into the external runtime that executes processes
pub trait RuntimeHooks {
    /// the container's filesystem is mounted at `rootfs`
    fn on_start(&self, container: &Container, rootfs: &Path) -> Result<()>;

    fn on_stop(&self, container: &Container) -> Result<()>;
}

/// hooks that do nothing, for storage-only use
pub struct NoopHooks;

impl RuntimeHooks for NoopHooks {
    fn on_start(&self, _container: &Container, _rootfs: &Path) -> Result<()> {
        Ok(())
    }

    fn on_stop(&self, _container: &Container) -> Result<()> {
        Ok(())
    }
}

/// runs `<program> start <id> <rootfs>` and `<program> stop <id>`
pub struct CommandHooks {
    program: PathBuf,
}

impl CommandHooks {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// hooks for the configured runtime program, if there is one
    pub fn from_config(config: &RuntimeConfig) -> Option<Self> {
        config.program.as_ref().map(|p| Self::new(p.clone()))
    }

    fn run(&self, container: &Container, args: &[&OsStr]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| Error::Runtime {
                container: container.id.to_string(),
                message: format!("failed to run {}: {}", self.program.display(), e),
            })?;
        if !output.status.success() {
            return Err(Error::Runtime {
                container: container.id.to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl RuntimeHooks for CommandHooks {
    fn on_start(&self, container: &Container, rootfs: &Path) -> Result<()> {
        self.run(
            container,
            &[
                OsStr::new("start"),
                OsStr::new(container.id.as_str()),
                rootfs.as_os_str(),
            ],
        )
    }

    fn on_stop(&self, container: &Container) -> Result<()> {
        self.run(container, &[OsStr::new("stop"), OsStr::new(container.id.as_str())])
    }
}

fn lock_container(graph: &Graph, id: &ContainerId) -> Result<GraphLock> {
    graph.lock("container", id.as_str())
}

fn save_container(graph: &Graph, container: &Container) -> Result<()> {
    write_record(graph, &graph.containers_path(), container.id.as_str(), container)
}

/// read a container record
pub fn container(graph: &Graph, id: &ContainerId) -> Result<Container> {
    read_record(&graph.containers_path(), id.as_str(), "container")
}

pub fn list_containers(graph: &Graph) -> Result<Vec<Container>> {
    let mut containers = Vec::new();
    for name in list_records(&graph.containers_path())? {
        containers.push(container(graph, &ContainerId::parse(&name)?)?);
    }
    Ok(containers)
}

/// resolve a full container id or a unique prefix of one
pub fn resolve_container(graph: &Graph, name: &str) -> Result<ContainerId> {
    let ids = list_records(&graph.containers_path())?;
    if ids.iter().any(|id| id == name) {
        return ContainerId::parse(name);
    }
    if name.len() >= 4 {
        let mut matches = ids.iter().filter(|id| id.starts_with(name));
        match (matches.next(), matches.next()) {
            (Some(id), None) => return ContainerId::parse(id),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidId(format!("ambiguous container id prefix {}", name)))
            }
            _ => {}
        }
    }
    Err(Error::not_found("container", name))
}

pub fn containers_using_image(graph: &Graph, image: &ImageId) -> Result<Vec<Container>> {
    Ok(list_containers(graph)?
        .into_iter()
        .filter(|c| c.image == *image)
        .collect())
}

/// create a container with a writable filesystem cloned from the image's
/// top layer
pub fn create_container(graph: &Graph, image_id: &ImageId) -> Result<Container> {
    // keeps the image from being removed until the container is recorded
    let _store_lock = graph.lock_store()?;
    let image = image(graph, image_id)?;
    let top = image
        .top_layer()
        .ok_or_else(|| Error::InvalidState(format!("image {} has no layers", image_id.short())))?;

    let id = ContainerId::generate();
    let _lock = lock_container(graph, &id)?;
    let fs = create_filesystem_from_layer(graph, top)?;
    let container = Container {
        id,
        image: *image_id,
        filesystem: fs.id,
        state: ContainerState::Created,
        created: now(),
    };
    if let Err(e) = claim_filesystem(graph, &container) {
        discard_filesystem(graph, &container.filesystem);
        return Err(e);
    }
    info!(
        container = %container.id.short(),
        image = %image_id,
        fs = %container.filesystem,
        "created container"
    );
    Ok(container)
}

/// mark the filesystem as owned by `container`, then record the container
fn claim_filesystem(graph: &Graph, container: &Container) -> Result<()> {
    {
        let _fs_lock = lock_filesystem(graph, &container.filesystem)?;
        let mut owned = filesystem(graph, &container.filesystem)?;
        owned.container = Some(container.id.clone());
        save_filesystem(graph, &owned)?;
    }
    save_container(graph, container)
}

/// mount the container's filesystem and hand it to the runtime
pub fn start_container(
    graph: &Graph,
    hooks: &dyn RuntimeHooks,
    id: &ContainerId,
) -> Result<Container> {
    let _lock = lock_container(graph, id)?;
    let mut container = container(graph, id)?;
    if container.state == ContainerState::Running {
        return Err(Error::InvalidState(format!(
            "container {} is already running",
            id.short()
        )));
    }

    let rootfs = mount_filesystem(graph, &container.filesystem)?;
    hooks.on_start(&container, &rootfs)?;
    container.state = ContainerState::Running;
    save_container(graph, &container)?;
    debug!(container = %id.short(), rootfs = %rootfs.display(), "started container");
    Ok(container)
}

/// tell the runtime to stop and unmount the container's filesystem
pub fn stop_container(
    graph: &Graph,
    hooks: &dyn RuntimeHooks,
    id: &ContainerId,
) -> Result<Container> {
    let _lock = lock_container(graph, id)?;
    let mut container = container(graph, id)?;
    if container.state != ContainerState::Running {
        return Err(Error::InvalidState(format!(
            "container {} is {}, not running",
            id.short(),
            container.state
        )));
    }

    hooks.on_stop(&container)?;
    unmount_filesystem(graph, &container.filesystem)?;
    container.state = ContainerState::Stopped;
    save_container(graph, &container)?;
    debug!(container = %id.short(), "stopped container");
    Ok(container)
}

/// remove a created or stopped container and its filesystem
pub fn remove_container(graph: &Graph, id: &ContainerId) -> Result<Container> {
    let _lock = lock_container(graph, id)?;
    let mut container = container(graph, id)?;
    if container.state == ContainerState::Running {
        return Err(Error::InUse(format!("container {} is running", id.short())));
    }

    unmount_filesystem(graph, &container.filesystem)?;
    // the filesystem is only released once no record claims it
    delete_record(&graph.containers_path(), id.as_str())?;
    match remove_filesystem(graph, &container.filesystem) {
        Ok(_) | Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    info!(container = %id.short(), "removed container");
    container.state = ContainerState::Removed;
    Ok(container)
}

/// changes a container made on top of its image
pub fn container_diff(graph: &Graph, id: &ContainerId) -> Result<Changeset> {
    let container = container(graph, id)?;
    diff_filesystem(graph, &container.filesystem)
}
