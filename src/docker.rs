//! Container runtime adapter built on bollard.
//!
//! The adapter owns no state of its own: every status question is answered
//! by the live Docker daemon. Image builds shell out to `docker build`
//! because they need a directory context and build arguments; everything
//! else goes through the API.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use bollard::Docker;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, InspectContainerOptions,
    InspectContainerOptionsBuilder, ListContainersOptions, ListContainersOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, RemoveImageOptions,
    RemoveImageOptionsBuilder, StartContainerOptions, StartContainerOptionsBuilder,
    StopContainerOptions, StopContainerOptionsBuilder, WaitContainerOptions,
    WaitContainerOptionsBuilder,
};
use futures_util::StreamExt;
use rand::Rng;

use crate::error::{Error, Result};

/// Host ports are drawn from this range when a service is started.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 3000..=63000;

/// Seconds a container gets to shut down before it is removed.
const STOP_TIMEOUT: i32 = 2;

/// A live view of one running container, normalized from the daemon's
/// inspect output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunningContainerStatus {
    pub id: String,
    pub name: String,
    pub image: String,
    /// `(host_port, container_port)` pairs.
    pub ports: Vec<(u16, u16)>,
    pub volumes: Vec<VolumeSpec>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VolumeSpec {
    pub host: String,
    pub container: String,
    /// Empty for read-write, `ro` for read-only.
    pub flags: String,
}

pub struct RunOptions {
    pub image_name: String,
    pub container_name: String,
    pub env: HashMap<String, String>,
    /// `(host_port, container_port)` pairs, each bound to loopback only.
    pub ports: Vec<(u16, u16)>,
    pub volumes: Vec<VolumeSpec>,
    /// Per-service override of the default memory ceiling.
    pub memory: Option<String>,
}

pub struct DockerRuntime {
    docker: Docker,
    images_dir: PathBuf,
    max_memory: String,
}

impl DockerRuntime {
    pub fn connect(images_dir: PathBuf, max_memory: String) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(DockerRuntime {
            docker,
            images_dir,
            max_memory,
        })
    }

    /// Builds `image_name` from the template directory of a service type.
    /// The clone URL and branch arrive as build arguments; a cache-busting
    /// token makes every build fetch fresh sources.
    pub async fn build(
        &self,
        template_dir: &Path,
        image_name: &str,
        build_args: &[(&str, String)],
    ) -> Result<()> {
        let mut command = tokio::process::Command::new("docker");
        command.arg("build").arg("-t").arg(image_name);
        for (key, value) in build_args {
            command.arg("--build-arg").arg(format!("{key}={value}"));
        }
        command
            .arg("--build-arg")
            .arg(format!("CACHEBUSTER={}", chrono::Utc::now().timestamp_millis()));
        command.arg(template_dir);

        log::info!("Building image {image_name} from {template_dir:?}");
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            log::error!("Build of {image_name} failed: {stderr}");
            return Err(Error::BuildFailed { stderr });
        }

        log::info!("Image {image_name} built successfully");
        Ok(())
    }

    /// Starts a detached container, replacing any existing container with
    /// the same name. Ports bind to 127.0.0.1 only; the memory ceiling and
    /// a one-CPU quota are always applied.
    pub async fn run_detached(&self, options: RunOptions) -> Result<()> {
        self.stop(&options.container_name).await?;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: Vec<String> = Vec::new();
        for (host_port, container_port) in &options.ports {
            let container_port = format!("{container_port}/tcp");
            exposed_ports.push(container_port.clone());
            port_bindings.insert(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = options
            .volumes
            .iter()
            .map(|v| {
                if v.flags.is_empty() {
                    format!("{}:{}", v.host, v.container)
                } else {
                    format!("{}:{}:{}", v.host, v.container, v.flags)
                }
            })
            .collect();

        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let memory = options.memory.as_deref().unwrap_or(&self.max_memory);
        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: Some(parse_memory_limit(memory)),
            nano_cpus: Some(1_000_000_000),
            auto_remove: Some(true),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(options.image_name.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let create: CreateContainerOptions = CreateContainerOptionsBuilder::new()
            .name(&options.container_name)
            .build();
        self.docker.create_container(Some(create), body).await?;

        let start: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        self.docker
            .start_container(&options.container_name, Some(start))
            .await
            .inspect_err(|e| {
                log::error!("Failed to start container {}: {}", options.container_name, e);
            })?;

        log::info!("Container {} started successfully", options.container_name);
        Ok(())
    }

    /// Starts a container and hands back a handle for waiting on it or
    /// terminating it early. Used for one-shot runs.
    pub async fn run_foreground(
        &self,
        image_name: &str,
        env: HashMap<String, String>,
    ) -> Result<ForegroundContainer> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let body = ContainerCreateBody {
            image: Some(image_name.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(HostConfig {
                memory: Some(parse_memory_limit(&self.max_memory)),
                nano_cpus: Some(1_000_000_000),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create: CreateContainerOptions = CreateContainerOptionsBuilder::new()
            .name(image_name)
            .build();
        self.docker.create_container(Some(create), body).await?;

        let start: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        self.docker.start_container(image_name, Some(start)).await?;

        Ok(ForegroundContainer {
            docker: self.docker.clone(),
            name: image_name.to_string(),
        })
    }

    /// Graceful stop with a short timeout, then forced removal. A container
    /// that does not exist is not an error.
    pub async fn stop(&self, container_name: &str) -> Result<()> {
        let options: StopContainerOptions =
            StopContainerOptionsBuilder::new().t(STOP_TIMEOUT).build();

        match self.docker.stop_container(container_name, Some(options)).await {
            Ok(_) => log::info!("Container {container_name} stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::debug!("Container {container_name} not found, skipping stop");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::debug!("Container {container_name} already stopped");
            }
            Err(e) => {
                log::warn!("Failed to stop container {container_name}: {e}");
                return Err(e.into());
            }
        }

        let remove: RemoveContainerOptions = RemoveContainerOptionsBuilder::new().force(true).build();
        match self.docker.remove_container(container_name, Some(remove)).await {
            Ok(_) => {}
            // 404: already gone; 409: auto-removal already in progress.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {}
            Err(e) => {
                log::warn!("Failed to remove container {container_name}: {e}");
                return Err(e.into());
            }
        }

        Ok(())
    }

    pub async fn list_running_names(&self) -> Result<Vec<String>> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().build();
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    /// Live status of the named containers, or of everything currently
    /// running when no names are given. Containers that disappear between
    /// the listing and the inspect are skipped.
    pub async fn inspect(&self, names: Option<Vec<String>>) -> Result<Vec<RunningContainerStatus>> {
        let names = match names {
            Some(names) => names,
            None => self.list_running_names().await?,
        };

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
            match self.docker.inspect_container(&name, Some(options)).await {
                Ok(info) => statuses.push(normalize_status(info)),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(statuses)
    }

    /// Host ports currently bound by running containers.
    pub async fn used_host_ports(&self) -> Result<HashSet<u16>> {
        let statuses = self.inspect(None).await?;
        Ok(statuses
            .iter()
            .flat_map(|s| s.ports.iter().map(|(host, _)| *host))
            .collect())
    }

    pub fn has_image_template(&self, service_type: &str) -> bool {
        self.image_template_dir(service_type).is_some()
    }

    pub fn image_template_dir(&self, service_type: &str) -> Option<PathBuf> {
        image_template_dir(&self.images_dir, service_type)
    }

    pub async fn delete_image(&self, image_name: &str) -> Result<()> {
        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().build();
        match self
            .docker
            .remove_image(image_name, Some(options), None)
            .await
        {
            Ok(_) => {
                log::info!("Image {image_name} removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::debug!("Image {image_name} not found, skipping removal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A started one-shot container. Dropping the handle leaves the container
/// running; callers either wait for it or terminate it.
pub struct ForegroundContainer {
    docker: Docker,
    pub name: String,
}

impl ForegroundContainer {
    /// Blocks until the container exits, returning its status code.
    pub async fn wait(&self) -> Result<i64> {
        let options: WaitContainerOptions = WaitContainerOptionsBuilder::new().build();
        let mut stream = self.docker.wait_container(&self.name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(e.into()),
            None => Ok(0),
        }
    }

    /// Asks the daemon to stop the container; errors are logged, not
    /// surfaced, because termination races container exit.
    pub async fn terminate(&self) {
        let options: StopContainerOptions =
            StopContainerOptionsBuilder::new().t(STOP_TIMEOUT).build();
        if let Err(e) = self.docker.stop_container(&self.name, Some(options)).await {
            log::debug!("Failed to terminate container {}: {}", self.name, e);
        }
    }
}

/// A service type names a subdirectory of the image templates directory.
/// Path separators and dots are rejected so a type can never escape it.
pub fn image_template_dir(images_dir: &Path, service_type: &str) -> Option<PathBuf> {
    if service_type.is_empty() || service_type.contains(['/', '\\', '.']) {
        return None;
    }
    let dir = images_dir.join(service_type);
    dir.is_dir().then_some(dir)
}

/// Pick a host port inside [`PORT_RANGE`] that is not already bound.
/// Usage of the range is sparse, so redrawing on collision terminates
/// quickly in practice.
pub fn allocate_host_port(used: &HashSet<u16>) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let port = rng.gen_range(PORT_RANGE);
        if !used.contains(&port) {
            return port;
        }
    }
}

fn normalize_status(info: ContainerInspectResponse) -> RunningContainerStatus {
    let name = info
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let mut ports = Vec::new();
    if let Some(port_map) = info.network_settings.and_then(|n| n.ports) {
        for (key, bindings) in port_map {
            let container_port: u16 = key
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            for binding in bindings.into_iter().flatten() {
                if let Some(host_port) = binding.host_port.and_then(|p| p.parse().ok()) {
                    ports.push((host_port, container_port));
                }
            }
        }
    }
    ports.sort_unstable();

    let volumes = info
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|mount| VolumeSpec {
            host: mount.source.unwrap_or_default(),
            container: mount.destination.unwrap_or_default(),
            flags: if mount.rw.unwrap_or(true) { String::new() } else { "ro".to_string() },
        })
        .collect();

    let env = info
        .config
        .and_then(|c| c.env)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    RunningContainerStatus {
        id: info.id.unwrap_or_default(),
        name,
        image: info.image.unwrap_or_default(),
        ports,
        volumes,
        env,
    }
}

/// Parse a memory limit string (e.g. "512m", "32mb", "2g") to bytes.
fn parse_memory_limit(limit: &str) -> i64 {
    let limit = limit.trim().to_lowercase();
    let limit = limit.strip_suffix('b').unwrap_or(&limit);
    let (num_str, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit, 1)
    };

    num_str.trim().parse::<i64>().unwrap_or(0) * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, MountPoint, NetworkSettings};

    #[test]
    fn memory_limits_parse_to_bytes() {
        assert_eq!(parse_memory_limit("32mb"), 32 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("2g"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k"), 64 * 1024);
        assert_eq!(parse_memory_limit("100b"), 100);
        assert_eq!(parse_memory_limit("100"), 100);
        assert_eq!(parse_memory_limit(" 1G "), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("garbage"), 0);
    }

    #[test]
    fn allocator_avoids_bound_ports() {
        let used: HashSet<u16> = [3001, 3002].into_iter().collect();
        for _ in 0..200 {
            let port = allocate_host_port(&used);
            assert!(!used.contains(&port));
            assert!(PORT_RANGE.contains(&port));
        }
    }

    #[test]
    fn allocator_stays_in_range_with_no_ports_bound() {
        let used = HashSet::new();
        for _ in 0..200 {
            assert!(PORT_RANGE.contains(&allocate_host_port(&used)));
        }
    }

    #[test]
    fn inspect_output_is_normalized() {
        let info = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/acme-app_master".to_string()),
            image: Some("sha256:feed".to_string()),
            config: Some(ContainerConfig {
                env: Some(vec![
                    "PORT=3210".to_string(),
                    "DATA_DIR=/opt/data".to_string(),
                    "NOEQUALS".to_string(),
                ]),
                ..Default::default()
            }),
            mounts: Some(vec![MountPoint {
                source: Some("/home/cloudy/data/abc".to_string()),
                destination: Some("/opt/data".to_string()),
                rw: Some(true),
                ..Default::default()
            }]),
            network_settings: Some(NetworkSettings {
                ports: Some(
                    [(
                        "3210/tcp".to_string(),
                        Some(vec![PortBinding {
                            host_ip: Some("127.0.0.1".to_string()),
                            host_port: Some("4567".to_string()),
                        }]),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };

        let status = normalize_status(info);
        assert_eq!(status.id, "abc123");
        assert_eq!(status.name, "acme-app_master");
        assert_eq!(status.ports, vec![(4567, 3210)]);
        assert_eq!(
            status.volumes,
            vec![VolumeSpec {
                host: "/home/cloudy/data/abc".to_string(),
                container: "/opt/data".to_string(),
                flags: String::new(),
            }]
        );
        assert_eq!(status.env.get("PORT").map(String::as_str), Some("3210"));
        assert!(!status.env.contains_key("NOEQUALS"));
    }

    #[test]
    fn template_lookup_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node")).unwrap();

        assert!(image_template_dir(dir.path(), "node").is_some());
        assert!(image_template_dir(dir.path(), "deno").is_none());
        assert!(image_template_dir(dir.path(), "../node").is_none());
        assert!(image_template_dir(dir.path(), "").is_none());
    }
}
