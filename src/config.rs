use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{KmeError, Result};

/// Command-line arguments recognized by the KME server binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "kme-server")]
#[command(about = "Key Management Entity for a QKD trusted-node network")]
pub struct Cli {
    /// Port to bind on
    #[arg(short, long, default_value = "8000")]
    pub port: u16,

    /// Reload the server when the settings file changes
    #[arg(short, long, default_value = "false")]
    pub reload: bool,

    /// Path to the JSON settings file
    #[arg(short, long, default_value = "settings.json")]
    pub settings: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedKme {
    pub url: String,
    pub kme_id: String,
    pub kme_cert: String,
    pub sae_cert: String,
    pub sae_key: String,
    pub linked_to: String,
    pub distance: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedSae {
    pub sae_id: String,
    pub sae_cert: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedTrustedNode {
    pub url: String,
    pub id: String,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqSettings {
    pub mq_host: String,
    pub mq_port: u16,
    pub mq_username: String,
    pub mq_password: String,
    pub mq_shared_queue: String,
}

/// The process-wide immutable configuration snapshot.
///
/// Constructed once at startup via [`Settings::load`], validated eagerly,
/// then shared read-only (via `Arc`) by every other component. Nothing
/// after startup mutates or re-reads the settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub id: String,

    pub server_cert_file: String,
    pub server_key_file: String,
    pub ca_file: String,

    pub min_key_size: u32,
    pub max_key_size: u32,
    pub default_key_size: u32,
    pub max_key_count: usize,
    pub max_keys_per_request: usize,
    pub key_generation_timeout_in_seconds: u64,

    pub is_master: bool,

    #[serde(flatten)]
    pub mq: MqSettings,

    #[serde(default)]
    pub attached_kmes: Vec<AttachedKme>,
    #[serde(default)]
    pub attached_saes: Vec<AttachedSae>,
    #[serde(default)]
    pub attached_trusted_nodes: Vec<AttachedTrustedNode>,
}

impl Settings {
    /// Load settings from the file named by `cli.settings`, then validate.
    ///
    /// A validation failure is `Fatal` by construction: the caller is
    /// expected to log it and exit non-zero before the gateway binds its
    /// listener.
    pub fn load(cli: &Cli) -> Result<Settings> {
        let raw = fs::read_to_string(&cli.settings).map_err(|e| {
            KmeError::Fatal(format!("could not read settings file {:?}: {}", cli.settings, e))
        })?;

        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| KmeError::Fatal(format!("could not parse settings file: {}", e)))?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.min_key_size > self.max_key_size {
            return Err(KmeError::Fatal(
                "please define a correct range of min, max key sizes".to_string(),
            ));
        }

        for (name, value) in [
            ("min_key_size", self.min_key_size),
            ("max_key_size", self.max_key_size),
            ("default_key_size", self.default_key_size),
        ] {
            if value % 8 != 0 {
                return Err(KmeError::Fatal(format!("{} must be a multiple of 8", name)));
            }
        }

        if self.default_key_size < self.min_key_size || self.default_key_size > self.max_key_size {
            return Err(KmeError::Fatal(
                "default key size must be in the range of min/max key sizes".to_string(),
            ));
        }

        if self.min_key_size == 0
            || self.max_key_size == 0
            || self.default_key_size == 0
            || self.max_key_count == 0
            || self.max_keys_per_request == 0
            || self.key_generation_timeout_in_seconds == 0
        {
            return Err(KmeError::Fatal(
                "all numeric config values must be above 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Size requested on activation/enc_keys must fall in range and be byte-aligned.
    pub fn check_key_size(&self, size_bits: u32) -> Result<()> {
        if size_bits % 8 != 0 {
            return Err(KmeError::Admission(format!(
                "requested size {} is not a multiple of 8",
                size_bits
            )));
        }

        if size_bits < self.min_key_size || size_bits > self.max_key_size {
            return Err(KmeError::Admission(format!(
                "requested size {} is outside of the configured range [{}, {}]",
                size_bits, self.min_key_size, self.max_key_size
            )));
        }

        Ok(())
    }

    pub fn check_number(&self, number: usize, available: usize) -> Result<()> {
        if number == 0 || number > self.max_keys_per_request {
            return Err(KmeError::Admission(format!(
                "requested number {} is outside of the configured range [1, {}]",
                number, self.max_keys_per_request
            )));
        }

        // The source checks `available - number <= 0`, which rejects a
        // request for exactly the whole pool, not only for more than it.
        if available as i64 - number as i64 <= 0 {
            return Err(KmeError::Admission(format!(
                "more keys requested ({}) than are available ({})",
                number, available
            )));
        }

        Ok(())
    }

    pub fn find_attached_kme(&self, kme_id: &str) -> Option<&AttachedKme> {
        self.attached_kmes.iter().find(|k| k.kme_id == kme_id)
    }

    pub fn find_attached_trusted_node(&self, tn_id: &str) -> Option<&AttachedTrustedNode> {
        self.attached_trusted_nodes.iter().find(|t| t.id == tn_id)
    }

    pub fn find_attached_sae(&self, sae_id: &str) -> Option<&AttachedSae> {
        self.attached_saes.iter().find(|s| s.sae_id == sae_id)
    }
}
