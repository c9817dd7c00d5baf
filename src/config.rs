//! Configuração do motor carregada a partir de `batchflow.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `MAX_RETRY`, `RETRY_INTERVAL` e
//! `BATCHFLOW_WEBHOOK_URL` têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::barrier::PartialPolicy;
use crate::dispatcher::DispatcherSettings;
use crate::error::EngineError;
use crate::state_machine::{RetryConfig, StageOptions};

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "batchflow.toml";

/// Configuração de nível superior carregada de `batchflow.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Máximo de retentativas antes de uma falha transitória virar terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Intervalo fixo, em segundos, antes de reenfileirar uma requisição.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Tempo de vida, em segundos, de um contexto de job no armazenamento efêmero.
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,

    /// O que fazer com a transação quando um lote falha.
    #[serde(default)]
    pub partial_policy: PartialPolicy,

    /// URL que recebe as notificações terminais via POST, se houver.
    #[serde(default)]
    pub notification_webhook: Option<String>,

    /// Opções de estágio usadas quando a ingestão não traz as suas.
    #[serde(default)]
    pub stages: StageOptions,
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o intervalo entre retentativas: 30s.
fn default_retry_interval_secs() -> u64 {
    30
}

// Contextos expiram depois de 24h.
fn default_context_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval_secs(),
            context_ttl_secs: default_context_ttl_secs(),
            partial_policy: PartialPolicy::default(),
            notification_webhook: None,
            stages: StageOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `batchflow.toml` no diretório atual e aplica
    /// as variáveis de ambiente. Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, EngineError> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Carrega um arquivo específico, sem olhar o ambiente.
    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str::<EngineConfig>(&contents)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Aplica sobrescritas vindas do ambiente. `lookup` devolve o valor de uma
    /// variável, ou `None` quando ausente; valores vazios são ignorados.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = present("MAX_RETRY") {
            self.max_retries = raw
                .trim()
                .parse()
                .map_err(|_| EngineError::Config(format!("MAX_RETRY is not a number: {raw}")))?;
        }
        if let Some(raw) = present("RETRY_INTERVAL") {
            self.retry_interval_secs = raw
                .trim()
                .parse()
                .map_err(|_| EngineError::Config(format!("RETRY_INTERVAL is not a number of seconds: {raw}")))?;
        }
        if let Some(url) = present("BATCHFLOW_WEBHOOK_URL") {
            self.notification_webhook = Some(url);
        }
        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_interval: Duration::from_secs(self.retry_interval_secs),
        }
    }

    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    /// Parâmetros do despachante derivados desta configuração.
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            retry: self.retry(),
            partial_policy: self.partial_policy,
            default_options: self.stages,
        }
    }
}
