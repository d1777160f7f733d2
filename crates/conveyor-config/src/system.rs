//! System configuration parsing.

use std::collections::HashSet;
use std::path::Path;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub projects: Vec<ProjectConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Scheduler settings: admission queue size and concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs waiting for dispatch.
    pub max_queued: usize,
    /// Maximum number of jobs running at once.
    pub max_running: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued: 16,
            max_running: 1,
        }
    }
}

/// One configured project and the jobs its builds run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub jobs: Vec<String>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse a configuration from KDL text.
    pub fn parse(kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;

        let mut server = ServerConfig::default();
        let mut queue = QueueConfig::default();
        let mut projects = Vec::new();

        for node in doc.nodes() {
            match node.name().value() {
                "server" => server = parse_server(node)?,
                "queue" => queue = parse_queue(node)?,
                "project" => projects.push(parse_project(node)?),
                _ => {} // Ignore unknown nodes
            }
        }

        let mut seen = HashSet::new();
        for project in &projects {
            if !seen.insert(project.name.as_str()) {
                return Err(ConfigError::Duplicate(format!("project '{}'", project.name)));
            }
        }

        Ok(Config {
            server,
            queue,
            projects,
        })
    }

    /// Look up a configured project by name.
    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }
}

fn parse_server(node: &KdlNode) -> ConfigResult<ServerConfig> {
    let mut server = ServerConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "address" => {
                    server.address = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("server address".to_string()))?;
                }
                "port" => {
                    let port = get_first_int_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("server port".to_string()))?;
                    server.port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
                        field: "server port".to_string(),
                        message: format!("{port} is out of range"),
                    })?;
                }
                _ => {}
            }
        }
    }

    Ok(server)
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueConfig> {
    let mut queue = QueueConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "max-queued" => {
                    queue.max_queued = get_positive_int(child, "queue max-queued")?;
                }
                "max-running" => {
                    queue.max_running = get_positive_int(child, "queue max-running")?;
                }
                _ => {}
            }
        }
    }

    Ok(queue)
}

fn parse_project(node: &KdlNode) -> ConfigResult<ProjectConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut jobs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "job" {
                if let Some(job) = get_first_string_arg(child) {
                    jobs.push(job);
                }
            }
        }
    }

    Ok(ProjectConfig { name, jobs })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_positive_int(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value = get_first_int_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    let value = usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{value} is out of range"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
