//! Environments: per-project ingestion targets with an API key and notification settings.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{LazyLock, RwLock};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{EnvironmentSettings, NotificationSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
  pub id: i64,
  pub project_id: i64,
  pub name: String,
  pub description: Option<String>,
  /// Ingestion secret; rotatable.
  pub api_key: String,
  pub settings: EnvironmentSettings,
  pub is_active: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl Environment {
  pub fn notifications(&self) -> &NotificationSettings {
    &self.settings.notifications
  }
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentUpdate {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub is_active: Option<bool>,
  #[serde(default)]
  pub settings: Option<EnvironmentSettings>,
}

static NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,50}$").unwrap());

fn validate_name(name: &str) -> Result<(), EngineError> {
  if NAME.is_match(name) {
    Ok(())
  } else {
    Err(EngineError::validation(
      "name",
      "lowercase alphanumeric and hyphens only, max 50 chars",
    ))
  }
}

fn generate_api_key() -> String {
  format!("ve_{}", Uuid::new_v4().simple())
}

#[derive(Debug)]
pub struct EnvironmentRegistry {
  environments: RwLock<HashMap<i64, Environment>>,
  next_id: AtomicI64,
}

impl Default for EnvironmentRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl EnvironmentRegistry {
  pub fn new() -> Self {
    Self {
      environments: RwLock::new(HashMap::new()),
      next_id: AtomicI64::new(1),
    }
  }

  pub fn create(
    &self,
    project_id: i64,
    name: &str,
    description: Option<String>,
  ) -> Result<Environment, EngineError> {
    let name = name.trim();
    validate_name(name)?;

    let mut environments = self.environments.write()?;
    if environments
      .values()
      .any(|e| e.project_id == project_id && e.name == name)
    {
      return Err(EngineError::conflict(format!("environment {} already exists", name)));
    }

    let env = Environment {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      project_id,
      name: name.to_string(),
      description,
      api_key: generate_api_key(),
      settings: EnvironmentSettings::default(),
      is_active: true,
      created_at: Utc::now(),
      updated_at: None,
    };
    environments.insert(env.id, env.clone());
    tracing::info!(project_id, environment_id = env.id, name = %env.name, "environment created");
    Ok(env)
  }

  pub fn get(&self, project_id: i64, env_id: i64) -> Result<Environment, EngineError> {
    self
      .environments
      .read()?
      .get(&env_id)
      .filter(|e| e.project_id == project_id)
      .cloned()
      .ok_or_else(|| EngineError::not_found("environment", env_id))
  }

  pub fn list(&self, project_id: i64) -> Result<Vec<Environment>, EngineError> {
    let mut envs: Vec<Environment> = self
      .environments
      .read()?
      .values()
      .filter(|e| e.project_id == project_id)
      .cloned()
      .collect();
    envs.sort_by_key(|e| e.id);
    Ok(envs)
  }

  /// Apply a partial update through `f` on the stored environment.
  ///
  /// `f` also sees the names of the other environments in the project, read
  /// under the same write lock.
  fn modify(
    &self,
    project_id: i64,
    env_id: i64,
    f: impl FnOnce(&mut Environment, &[String]) -> Result<(), EngineError>,
  ) -> Result<Environment, EngineError> {
    let mut environments = self.environments.write()?;
    let siblings: Vec<String> = environments
      .values()
      .filter(|e| e.project_id == project_id && e.id != env_id)
      .map(|e| e.name.clone())
      .collect();
    let env = environments
      .get_mut(&env_id)
      .filter(|e| e.project_id == project_id)
      .ok_or_else(|| EngineError::not_found("environment", env_id))?;

    // Work on a copy so a rejected update leaves the stored one intact.
    let mut next = env.clone();
    f(&mut next, &siblings)?;
    next.updated_at = Some(Utc::now());
    *env = next.clone();
    Ok(next)
  }

  pub fn update(
    &self,
    project_id: i64,
    env_id: i64,
    update: EnvironmentUpdate,
  ) -> Result<Environment, EngineError> {
    let name = update.name.as_deref().map(str::trim);
    if let Some(name) = name {
      validate_name(name)?;
    }

    let env = self.modify(project_id, env_id, |env, siblings| {
      if let Some(name) = name {
        if siblings.iter().any(|taken| taken == name) {
          return Err(EngineError::conflict(format!("environment {} already exists", name)));
        }
        env.name = name.to_string();
      }
      if let Some(description) = update.description {
        env.description = Some(description);
      }
      if let Some(is_active) = update.is_active {
        env.is_active = is_active;
      }
      if let Some(settings) = update.settings {
        env.settings = settings;
      }
      Ok(())
    })?;
    tracing::info!(project_id, environment_id = env_id, "environment updated");
    Ok(env)
  }

  pub fn rotate_key(&self, project_id: i64, env_id: i64) -> Result<Environment, EngineError> {
    let env = self.modify(project_id, env_id, |env, _| {
      env.api_key = generate_api_key();
      Ok(())
    })?;
    tracing::info!(project_id, environment_id = env_id, "environment api key rotated");
    Ok(env)
  }

  /// Remove an environment. A project always keeps at least one.
  pub fn delete(&self, project_id: i64, env_id: i64) -> Result<(), EngineError> {
    let mut environments = self.environments.write()?;
    if !environments
      .get(&env_id)
      .is_some_and(|e| e.project_id == project_id)
    {
      return Err(EngineError::not_found("environment", env_id));
    }
    let siblings = environments.values().filter(|e| e.project_id == project_id).count();
    if siblings <= 1 {
      return Err(EngineError::conflict("cannot delete the only environment"));
    }
    environments.remove(&env_id);
    tracing::info!(project_id, environment_id = env_id, "environment deleted");
    Ok(())
  }

  /// Active environment owning `api_key`, if any.
  pub fn authenticate(&self, api_key: &str) -> Result<Option<Environment>, EngineError> {
    if api_key.is_empty() {
      return Ok(None);
    }
    Ok(
      self
        .environments
        .read()?
        .values()
        .find(|e| e.is_active && e.api_key == api_key)
        .cloned(),
    )
  }
}
