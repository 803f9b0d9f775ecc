//! Deployment coordinator.
//!
//! Owns service identity and drives create → build → run → stop → destroy,
//! keeping the registry, the container runtime and the reverse proxy
//! consistent with each other. Collaborators are constructed once and
//! passed in; nothing here is a global.

use std::path::Path;

use rand::Rng;
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};

use crate::config::Config;
use crate::docker::{self, DockerRuntime, RunOptions, RunningContainerStatus, VolumeSpec};
use crate::error::{Error, Result};
use crate::github::GitHubClient;
use crate::keys::KeyManager;
use crate::models::{
    PublicConfiguration, Service, ServiceConfiguration, container_name, service_id,
};
use crate::nginx::NginxConfigurator;
use crate::registry::ServiceRegistry;

/// Fixed mount point for the per-service data volume.
const CONTAINER_DATA_DIR: &str = "/opt/data";

/// One registry record cross-referenced with the live runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub repository: String,
    pub branch: String,
    pub online: bool,
}

pub struct Orchestrator {
    pub config: Config,
    pub registry: ServiceRegistry,
    pub keys: KeyManager,
    pub docker: DockerRuntime,
    pub nginx: NginxConfigurator,
    pub github: GitHubClient,
}

impl Orchestrator {
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = ServiceRegistry::open(&config.storage_dir());
        let keys = KeyManager::open(&config.storage_dir());
        let docker = DockerRuntime::connect(config.images_dir(), config.max_memory.clone())?;
        let nginx = NginxConfigurator::new(config.nginx_dir());
        let github = GitHubClient::new(config.github_http_auth.clone());

        Ok(Orchestrator {
            config,
            registry,
            keys,
            docker,
            nginx,
            github,
        })
    }

    /// Registers a service. Already-registered identities are left alone.
    pub async fn create(
        &self,
        service: &Service,
        configuration: Option<PublicConfiguration>,
    ) -> Result<()> {
        log::debug!("create {service:?}");
        if self.registry.get(&service_id(service)).is_some() {
            return Ok(());
        }

        let public = self.resolve_configuration(service, configuration).await;
        let service_type = public
            .service_type
            .unwrap_or_else(|| self.config.default_image.clone());
        self.registry.create(service, &service_type)
    }

    /// Builds the service image from its type's template, cloning the
    /// repository branch inside the build.
    pub async fn build(
        &self,
        service: &Service,
        configuration: Option<PublicConfiguration>,
    ) -> Result<()> {
        log::debug!("build {service:?}");
        let public = self.resolve_configuration(service, configuration).await;
        let service_type = self.resolve_service_type(public.service_type.as_deref());
        let template = self.template_for_type(&service_type)?;

        self.docker
            .build(
                &template,
                &self.image_name(service),
                &clone_build_args(service),
            )
            .await
    }

    /// Starts (or replaces) the service container and points the proxy at
    /// it. The old container is stopped before the new one starts; a brief
    /// gap is accepted.
    pub async fn run_in_background(
        &self,
        service: &Service,
        configuration: Option<PublicConfiguration>,
    ) -> Result<()> {
        log::debug!("run in background {service:?}");
        let public = self.resolve_configuration(service, configuration).await;
        let config = self.service_configuration(service, &public).await?;
        self.template_for_type(&config.service_type)?;

        let data_dir = self.config.data_dir().join(&config.id);
        std::fs::create_dir_all(&data_dir)?;

        let mut env = config.env.clone();
        env.insert("DATA_DIR".to_string(), CONTAINER_DATA_DIR.to_string());

        let mut ports = vec![(config.ports.host_port, config.ports.port)];
        if let Some(ws_port) = config.ports.web_socket_port {
            ports.push((ws_port, ws_port));
        }

        self.stop(service).await?;
        self.docker
            .run_detached(RunOptions {
                image_name: self.image_name(service),
                container_name: config.name.clone(),
                env,
                ports,
                volumes: vec![VolumeSpec {
                    host: data_dir.to_string_lossy().into_owned(),
                    container: CONTAINER_DATA_DIR.to_string(),
                    flags: String::new(),
                }],
                memory: config.memory.clone(),
            })
            .await?;

        self.nginx.register_service(&config);
        self.nginx.reload().await;
        Ok(())
    }

    /// Builds a throwaway image, runs it in the foreground and cleans the
    /// image up afterwards, whatever the outcome. Termination signals are
    /// forwarded to the container, so an operator interrupt never leaves
    /// one behind. Registry and proxy are untouched.
    pub async fn run_and_exit(
        &self,
        service: &Service,
        configuration: Option<PublicConfiguration>,
    ) -> Result<()> {
        log::debug!("run and exit {service:?}");
        let public = self.resolve_configuration(service, configuration).await;
        let service_type = self.resolve_service_type(public.service_type.as_deref());
        let template = self.template_for_type(&service_type)?;
        let config = self.service_configuration(service, &public).await?;

        let image_name = format!("run-{}", rand::thread_rng().gen_range(0..10_000));
        let result = self
            .build_and_run_foreground(&template, &image_name, service, config)
            .await;

        if let Err(err) = self.docker.delete_image(&image_name).await {
            log::warn!("Failed to remove one-shot image {image_name}: {err}");
        }
        result
    }

    async fn build_and_run_foreground(
        &self,
        template: &Path,
        image_name: &str,
        service: &Service,
        config: ServiceConfiguration,
    ) -> Result<()> {
        self.docker
            .build(template, image_name, &clone_build_args(service))
            .await?;

        let container = self.docker.run_foreground(image_name, config.env).await?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::select! {
            status = container.wait() => {
                let code = status?;
                if code != 0 {
                    return Err(Error::RunFailed(format!(
                        "container exited with status {code}"
                    )));
                }
                Ok(())
            }
            _ = interrupt.recv() => {
                log::info!("Interrupted, stopping container {}", container.name);
                container.terminate().await;
                Ok(())
            }
            _ = terminate.recv() => {
                log::info!("Terminated, stopping container {}", container.name);
                container.terminate().await;
                Ok(())
            }
        }
    }

    /// Stops the service container. Registry and proxy entries stay.
    pub async fn stop(&self, service: &Service) -> Result<()> {
        log::debug!("stop {service:?}");
        self.docker.stop(&container_name(service)).await
    }

    /// Tears the service down. Every step is best-effort, but the registry
    /// record is always deleted.
    pub async fn destroy(&self, service: &Service) -> Result<()> {
        log::debug!("destroy {service:?}");
        let id = service_id(service);

        if let Err(err) = self.docker.stop(&container_name(service)).await {
            log::warn!("Failed to stop container for {}: {err}", service.repository);
        }
        if let Err(err) = self.docker.delete_image(&self.image_name(service)).await {
            log::warn!("Failed to delete image for {}: {err}", service.repository);
        }
        if let Err(err) = self.nginx.unregister_id(&id) {
            log::warn!("Failed to remove proxy entry for {}: {err}", service.repository);
        }
        self.nginx.reload().await;

        self.registry.delete(&id)
    }

    /// Every registered service, flagged online when its container name
    /// shows up in the live runtime listing.
    pub async fn get_status(&self) -> Result<Vec<ServiceStatus>> {
        let running = self.docker.list_running_names().await?;

        Ok(self
            .registry
            .get_all()
            .into_iter()
            .map(|stored| {
                let service = stored.service();
                let name = container_name(&service);
                ServiceStatus {
                    id: service_id(&service),
                    online: running.contains(&name),
                    name,
                    service_type: stored.service_type,
                    repository: stored.repository,
                    branch: stored.branch,
                }
            })
            .collect())
    }

    pub async fn get_status_of(&self, service: &Service) -> Result<Vec<RunningContainerStatus>> {
        self.docker.inspect(Some(vec![container_name(service)])).await
    }

    async fn resolve_configuration(
        &self,
        service: &Service,
        configuration: Option<PublicConfiguration>,
    ) -> PublicConfiguration {
        match configuration {
            Some(config) => config,
            None => self.github.fetch_configuration(service).await,
        }
    }

    /// Computes the full runtime configuration, drawing a fresh host port
    /// (and a websocket port when one is declared) against the runtime's
    /// current state.
    async fn service_configuration(
        &self,
        service: &Service,
        public: &PublicConfiguration,
    ) -> Result<ServiceConfiguration> {
        let service_type = self.resolve_service_type(public.service_type.as_deref());

        let mut used = self.docker.used_host_ports().await?;
        let host_port = docker::allocate_host_port(&used);
        used.insert(host_port);

        let wants_web_socket = public
            .web_socket
            .as_ref()
            .is_some_and(|ws| !ws.path.is_empty());
        let web_socket_port = wants_web_socket.then(|| docker::allocate_host_port(&used));

        Ok(ServiceConfiguration::resolve(
            service,
            public,
            &service_type,
            &self.config.domain,
            host_port,
            web_socket_port,
        ))
    }

    /// A requested type only counts when a template for it exists;
    /// everything else resolves to the configured default.
    fn resolve_service_type(&self, requested: Option<&str>) -> String {
        match requested {
            Some(requested) if self.docker.has_image_template(requested) => requested.to_string(),
            _ => self.config.default_image.clone(),
        }
    }

    fn template_for_type(&self, service_type: &str) -> Result<std::path::PathBuf> {
        self.docker
            .image_template_dir(service_type)
            .ok_or_else(|| Error::InvalidServiceType(service_type.to_string()))
    }

    fn image_name(&self, service: &Service) -> String {
        format!("{}/{}", self.config.docker_registry, container_name(service))
    }
}

fn clone_build_args(service: &Service) -> [(&'static str, String); 2] {
    [
        ("GIT_URL", GitHubClient::clone_url(&service.repository)),
        ("GIT_BRANCH", service.branch.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PublicConfiguration;

    fn orchestrator_at(home: &Path) -> Orchestrator {
        let config = Config {
            port: 9999,
            max_memory: "32mb".to_string(),
            docker_registry: "cloudy".to_string(),
            domain: "local".to_string(),
            github_http_auth: None,
            default_image: "node".to_string(),
            home: home.to_path_buf(),
        };
        Orchestrator::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_at(dir.path());
        let service = Service {
            repository: "acme/app".to_string(),
            branch: "master".to_string(),
        };

        let override_config = PublicConfiguration::default();
        orchestrator
            .create(&service, Some(override_config.clone()))
            .await
            .unwrap();
        orchestrator
            .create(&service, Some(override_config))
            .await
            .unwrap();

        assert_eq!(orchestrator.registry.get_all().len(), 1);
    }

    #[tokio::test]
    async fn destroy_removes_proxy_entry_and_registry_record() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_at(dir.path());
        let service = Service {
            repository: "acme/app".to_string(),
            branch: "master".to_string(),
        };
        let id = service_id(&service);

        orchestrator
            .create(&service, Some(PublicConfiguration::default()))
            .await
            .unwrap();
        std::fs::create_dir_all(orchestrator.config.nginx_dir()).unwrap();
        std::fs::write(
            orchestrator.config.nginx_dir().join(format!("{id}.conf")),
            "server {}",
        )
        .unwrap();

        // Runtime steps are best-effort; registry and proxy cleanup must
        // complete even when no container or image exists.
        orchestrator.destroy(&service).await.unwrap();

        assert!(!orchestrator.nginx.has_site(&id));
        assert!(orchestrator.registry.get(&id).is_none());
        assert!(orchestrator.registry.get_all().is_empty());
    }

    #[test]
    fn missing_descriptor_falls_back_to_the_default_type() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_at(dir.path());
        std::fs::create_dir_all(orchestrator.config.images_dir().join("node")).unwrap();

        // No declared type (no override, no descriptor): the default wins.
        assert_eq!(orchestrator.resolve_service_type(None), "node");
    }

    #[test]
    fn unknown_requested_type_falls_back_to_the_default_type() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_at(dir.path());
        std::fs::create_dir_all(orchestrator.config.images_dir().join("deno")).unwrap();

        assert_eq!(orchestrator.resolve_service_type(Some("deno")), "deno");
        assert_eq!(orchestrator.resolve_service_type(Some("missing")), "node");
    }
}
