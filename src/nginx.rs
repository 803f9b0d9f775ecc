//! Reverse proxy configurator.
//!
//! The proxy itself is external: this module only owns the per-service
//! configuration files and asks nginx to validate and reload. A failed
//! write or reload never rolls a deployment back; serving continues on
//! the previous configuration.

use std::path::PathBuf;

use minijinja::{Environment, context};

use crate::error::Result;
use crate::models::ServiceConfiguration;

const SERVICE_TEMPLATE: &str = include_str!("../templates/service.conf");

pub struct NginxConfigurator {
    sites_dir: PathBuf,
}

impl NginxConfigurator {
    pub fn new(sites_dir: PathBuf) -> Self {
        NginxConfigurator { sites_dir }
    }

    fn site_file(&self, service_id: &str) -> PathBuf {
        self.sites_dir.join(format!("{service_id}.conf"))
    }

    /// Writes the configuration file for one service. Failures are logged
    /// and swallowed; the previous file, if any, stays in place.
    pub fn register_service(&self, config: &ServiceConfiguration) {
        let contents = match render_site(config) {
            Ok(contents) => contents,
            Err(err) => {
                log::error!("Failed to render nginx configuration for {}: {err}", config.name);
                return;
            }
        };

        let path = self.site_file(&config.id);
        // Write through a temp file so a failure leaves any prior
        // configuration in place.
        let tmp = path.with_extension("conf.tmp");
        let written = std::fs::create_dir_all(&self.sites_dir)
            .and_then(|_| std::fs::write(&tmp, contents))
            .and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(err) = written {
            log::error!("Failed to write nginx configuration {path:?}: {err}");
        }
    }

    /// Removes the configuration file of a service identity; absent files
    /// are a no-op.
    pub fn unregister_id(&self, service_id: &str) -> Result<()> {
        let path = self.site_file(service_id);
        match std::fs::remove_file(&path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn has_site(&self, service_id: &str) -> bool {
        self.site_file(service_id).exists()
    }

    /// Validates the full configuration, then reloads. A validation or
    /// reload failure is logged and otherwise ignored: the proxy keeps
    /// serving whatever it had.
    pub async fn reload(&self) {
        match run_nginx(&["-t"]).await {
            Ok(_) => {}
            Err(err) => {
                log::error!("Nginx configuration is invalid, not reloading: {err}");
                return;
            }
        }
        if let Err(err) = run_nginx(&["-s", "reload"]).await {
            log::error!("Failed to reload nginx: {err}");
        }
    }
}

async fn run_nginx(args: &[&str]) -> std::result::Result<(), String> {
    let output = tokio::process::Command::new("nginx")
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

fn render_site(config: &ServiceConfiguration) -> std::result::Result<String, minijinja::Error> {
    let env = Environment::new();
    let template = env.template_from_str(SERVICE_TEMPLATE)?;
    template.render(context! {
        id => config.name,
        port => config.ports.host_port,
        domains => config.domains.join(" "),
        web_socket_path => config.web_socket.as_ref().map(|ws| ws.path.clone()),
        web_socket_port => config.ports.web_socket_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PublicConfiguration, Service, ServiceConfiguration, WebSocket};

    fn config(web_socket: Option<WebSocket>) -> ServiceConfiguration {
        let service = Service {
            repository: "acme/app".to_string(),
            branch: "master".to_string(),
        };
        let public = PublicConfiguration {
            web_socket,
            ..Default::default()
        };
        ServiceConfiguration::resolve(&service, &public, "node", "local", 4567, Some(5678))
    }

    #[test]
    fn renders_upstream_and_domains() {
        let rendered = render_site(&config(None)).unwrap();
        assert!(rendered.contains("server 127.0.0.1:4567;"));
        assert!(rendered.contains("server_name acme-app_master.local;"));
        assert!(rendered.contains("proxy_pass http://acme-app_master;"));
        assert!(!rendered.contains("Upgrade"));
    }

    #[test]
    fn renders_websocket_location_when_declared() {
        let ws = Some(WebSocket {
            path: "ws".to_string(),
        });
        let rendered = render_site(&config(ws)).unwrap();
        assert!(rendered.contains("location /ws {"));
        assert!(rendered.contains("proxy_pass http://127.0.0.1:5678;"));
    }

    #[test]
    fn register_and_unregister_manage_one_file_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let nginx = NginxConfigurator::new(dir.path().to_path_buf());
        let config = config(None);

        nginx.register_service(&config);
        assert!(nginx.has_site(&config.id));

        nginx.unregister_id(&config.id).unwrap();
        assert!(!nginx.has_site(&config.id));

        // Unregistering again is a no-op.
        nginx.unregister_id(&config.id).unwrap();
    }
}
