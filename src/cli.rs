use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use crate::api;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Service;
use crate::orchestrator::Orchestrator;
use crate::server;

/// Single-host deployment orchestrator: build a repository into a
/// container, run it behind the reverse proxy, redeploy on webhooks.
#[derive(Parser, Debug)]
#[command(name = "cy", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a new cloudy environment in the current directory
    Init,
    /// Start the HTTP control plane (default port is 9999)
    Serve,
    /// List registered services, or print a single field per service
    Ls { field: Option<LsField> },
    /// Show the live container status of a service
    Status {
        repository: String,
        branch: Option<String>,
    },
    /// Register a service
    Create {
        repository: String,
        branch: Option<String>,
    },
    /// Register, build and deploy a service
    Build {
        repository: String,
        branch: Option<String>,
    },
    /// Build, run and discard a project
    Run {
        repository: String,
        branch: Option<String>,
    },
    /// Stop the container, delete the image and remove the service
    Destroy {
        repository: String,
        branch: Option<String>,
    },
    /// Create a webhook key for auto-deploy
    CreateKey {
        repository: String,
        branch: Option<String>,
    },
    /// Retrieve a service key, if one exists
    GetKey {
        repository: String,
        branch: Option<String>,
    },
    /// Delete a deploy key
    DeleteKey {
        repository: String,
        branch: Option<String>,
    },
    /// Start a container from a previously built image
    Start {
        repository: String,
        branch: Option<String>,
    },
    /// Stop the container of a running service
    Stop {
        repository: String,
        branch: Option<String>,
    },
    /// Stop and start a service container again
    Restart {
        repository: String,
        branch: Option<String>,
    },
    /// Redeploy every registered service
    RestartAll,
    /// Rebuild and re-run every registered service
    BuildAll,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum LsField {
    Id,
    Name,
    Type,
    Online,
    Origin,
    Key,
}

pub async fn execute(command: Command) -> Result<()> {
    let config = Config::from_env();

    if let Command::Init = command {
        return server::init_project(&config);
    }

    let orchestrator = Arc::new(Orchestrator::from_config(config.clone())?);

    match command {
        Command::Init => unreachable!("handled above"),

        Command::Serve => {
            server::write_pid_file(&config)?;
            server::handle_reload_signals(Arc::clone(&orchestrator));
            let result = api::serve(orchestrator).await;
            server::remove_pid_file(&config);
            result
        }

        Command::Ls { field } => {
            println!("{}", list_services(&orchestrator, field).await?);
            Ok(())
        }

        Command::Status { repository, branch } => {
            let service = Service::new(repository, branch);
            let statuses = orchestrator.get_status_of(&service).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }

        Command::Create { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.create(&service, None).await?;
            server::nudge_server(&config);
            Ok(())
        }

        Command::Build { repository, branch } => {
            let service = Service::new(repository, branch);
            let configuration = orchestrator.github.fetch_configuration(&service).await;
            orchestrator
                .create(&service, Some(configuration.clone()))
                .await?;
            orchestrator
                .build(&service, Some(configuration.clone()))
                .await?;
            orchestrator
                .run_in_background(&service, Some(configuration))
                .await?;
            server::nudge_server(&config);
            Ok(())
        }

        Command::Run { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.run_and_exit(&service, None).await
        }

        Command::Destroy { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.destroy(&service).await?;
            server::nudge_server(&config);
            Ok(())
        }

        Command::CreateKey { repository, branch } => {
            let service = Service::new(repository, branch);
            if !orchestrator.github.exists(&service.repository).await {
                return Err(Error::NotFound(format!(
                    "repository {}",
                    service.repository
                )));
            }
            let key = orchestrator.keys.create_key(&service)?;
            println!("{key}");
            server::nudge_server(&config);
            Ok(())
        }

        Command::GetKey { repository, branch } => {
            let service = Service::new(repository, branch);
            match orchestrator.keys.get_key(&service) {
                Some(key) => {
                    println!("{key}");
                    Ok(())
                }
                None => Err(Error::NotFound(format!(
                    "key for {}",
                    service.repository
                ))),
            }
        }

        Command::DeleteKey { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.keys.delete_key(&service)
        }

        Command::Start { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.run_in_background(&service, None).await
        }

        Command::Stop { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.stop(&service).await
        }

        Command::Restart { repository, branch } => {
            let service = Service::new(repository, branch);
            orchestrator.stop(&service).await?;
            orchestrator.run_in_background(&service, None).await
        }

        Command::RestartAll => {
            for status in orchestrator.get_status().await? {
                let service = Service::new(status.repository, Some(status.branch));
                orchestrator.stop(&service).await?;
                orchestrator.run_in_background(&service, None).await?;
            }
            server::nudge_server(&config);
            Ok(())
        }

        Command::BuildAll => {
            for status in orchestrator.get_status().await? {
                let service = Service::new(status.repository, Some(status.branch));
                orchestrator.build(&service, None).await?;
                orchestrator.run_in_background(&service, None).await?;
            }
            server::nudge_server(&config);
            Ok(())
        }
    }
}

async fn list_services(orchestrator: &Orchestrator, field: Option<LsField>) -> Result<String> {
    let statuses = orchestrator.get_status().await?;

    let rows: Vec<Vec<String>> = statuses
        .into_iter()
        .map(|status| {
            let service = Service::new(status.repository.clone(), Some(status.branch.clone()));
            let origin = if status.branch == "master" {
                status.repository.clone()
            } else {
                format!("{} {}", status.repository, status.branch)
            };
            vec![
                if status.online { "  -  " } else { "[ ! ]" }.to_string(),
                status.id,
                status.name,
                status.service_type,
                origin,
                orchestrator.keys.get_key(&service).unwrap_or_default(),
            ]
        })
        .collect();

    if let Some(field) = field {
        let index = match field {
            LsField::Online => 0,
            LsField::Id => 1,
            LsField::Name => 2,
            LsField::Type => 3,
            LsField::Origin => 4,
            LsField::Key => 5,
        };
        return Ok(rows
            .iter()
            .map(|row| row[index].as_str())
            .collect::<Vec<_>>()
            .join("\n"));
    }

    let headers = ["---", "Id", "Container", "Type", "Origin", "Key"];
    let mut table = vec![
        headers.iter().map(|h| h.to_string()).collect(),
        vec![String::new(); headers.len()],
    ];
    table.extend(rows);
    Ok(format_list(&table))
}

/// Pads every column to its widest cell and joins rows for the terminal.
fn format_list(rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (index, column) in row.iter().enumerate() {
            if widths.len() <= index {
                widths.push(0);
            }
            widths[index] = widths[index].max(column.len());
        }
    }

    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(index, column)| format!("{:<width$}", column, width = widths[index]))
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_to_the_widest_cell() {
        let rows = vec![
            vec!["Id".to_string(), "Container".to_string()],
            vec!["1".to_string(), "acme-app_master".to_string()],
            vec!["22".to_string(), "x".to_string()],
        ];

        let formatted = format_list(&rows);
        let lines: Vec<&str> = formatted.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Id | Container      ");
        assert_eq!(lines[1], "1  | acme-app_master");
        assert_eq!(lines[2], "22 | x              ");
    }
}
