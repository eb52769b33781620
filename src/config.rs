//! Node and consensus configuration
//!
//! Node settings are layered with the `config` crate: embedded defaults, an
//! optional `sqlchain.toml`, then `SQLCHAIN_*` environment variables. Consensus
//! rules live in a separate JSON file shared by every node of a deployment.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::{AddressError, PubKeyHash};
use crate::validation::StatementKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Layered(#[from] config::ConfigError),
    #[error("Can not read consensus file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Consensus file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported consensus kind {0}")]
    UnsupportedKind(String),
    #[error("Invalid consensus settings: {0}")]
    Invalid(&'static str),
    #[error("Paid transactions wallet is not valid: {0}")]
    Address(#[from] AddressError),
}

/// The only consensus kind supported
pub const KIND_PROOF_OF_WORK: &str = "proofofwork";

mod defaults {
    pub fn kind() -> String {
        super::KIND_PROOF_OF_WORK.to_string()
    }
    pub fn coins_for_block_made() -> u64 {
        10
    }
    pub fn allow() -> bool {
        true
    }
    pub fn complexity_bits() -> u32 {
        16
    }
    pub fn complexity_bits_step2() -> u32 {
        24
    }
    pub fn complexity_step_height() -> u64 {
        1000
    }
    pub fn min_tx_per_block() -> u64 {
        1000
    }
    pub fn max_tx_per_block() -> u64 {
        10000
    }
    pub fn minimum_block_building_time_secs() -> u64 {
        3
    }
    pub fn max_nonce() -> u64 {
        u64::MAX
    }
    pub fn mint_queue_depth() -> usize {
        100
    }
    pub fn mint_interval_secs() -> u64 {
        10
    }
}

/// Proof-of-work parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PowSettings {
    #[serde(default = "defaults::complexity_bits", alias = "complexity_bits")]
    pub complexity_bits: u32,
    /// Difficulty once the chain reaches `complexity_step_height`
    #[serde(default = "defaults::complexity_bits_step2", alias = "complexity_bits_step2")]
    pub complexity_bits_step2: u32,
    #[serde(default = "defaults::complexity_step_height", alias = "complexity_step_height")]
    pub complexity_step_height: u64,
    #[serde(default = "defaults::min_tx_per_block", alias = "min_tx_per_block")]
    pub min_tx_per_block: u64,
    #[serde(default = "defaults::max_tx_per_block", alias = "max_tx_per_block")]
    pub max_tx_per_block: u64,
    /// Floor on the wall time spent completing a block
    #[serde(
        default = "defaults::minimum_block_building_time_secs",
        alias = "minimum_block_building_time_secs"
    )]
    pub minimum_block_building_time_secs: u64,
    /// Nonce search ceiling
    #[serde(default = "defaults::max_nonce", alias = "max_nonce")]
    pub max_nonce: u64,
}

impl Default for PowSettings {
    fn default() -> Self {
        Self {
            complexity_bits: defaults::complexity_bits(),
            complexity_bits_step2: defaults::complexity_bits_step2(),
            complexity_step_height: defaults::complexity_step_height(),
            min_tx_per_block: defaults::min_tx_per_block(),
            max_tx_per_block: defaults::max_tx_per_block(),
            minimum_block_building_time_secs: defaults::minimum_block_building_time_secs(),
            max_nonce: defaults::max_nonce(),
        }
    }
}

impl PowSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        let bits_ok = |b: u32| (1..=255).contains(&b);
        if !bits_ok(self.complexity_bits) || !bits_ok(self.complexity_bits_step2) {
            return Err(ConfigError::Invalid("complexity bits must be in 1..=255"));
        }
        if self.min_tx_per_block == 0 || self.max_tx_per_block < self.min_tx_per_block {
            return Err(ConfigError::Invalid("transaction limits per block are inconsistent"));
        }
        Ok(())
    }
}

/// A rule set with `after` = N covers blocks above N; zero covers every block
fn applies_at(after: u64, height: u64) -> bool {
    after == 0 || height > after
}

/// Price of SQL statements, paid to the paid transactions wallet.
///
/// A kind-specific price wins over `default`; zero means free.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransactionCost {
    #[serde(alias = "default")]
    pub default: u64,
    #[serde(alias = "row_delete")]
    pub row_delete: u64,
    #[serde(alias = "row_update")]
    pub row_update: u64,
    #[serde(alias = "row_insert")]
    pub row_insert: u64,
    #[serde(alias = "table_create")]
    pub table_create: u64,
    /// Prices apply to blocks above this height, zero for all blocks
    #[serde(alias = "apply_after_block")]
    pub apply_after_block: u64,
}

impl TransactionCost {
    /// Price of one statement of `kind` in a block at `height`
    pub fn price(&self, kind: StatementKind, height: u64) -> u64 {
        if !applies_at(self.apply_after_block, height) {
            return 0;
        }
        let specific = match kind {
            StatementKind::Delete => self.row_delete,
            StatementKind::Insert => self.row_insert,
            StatementKind::Update => self.row_update,
            StatementKind::CreateTable => self.table_create,
            _ => 0,
        };
        if specific > 0 {
            specific
        } else {
            self.default
        }
    }
}

/// Per-table override of the global permissions and prices.
///
/// Flags missing from the file are `false`: a listed table only permits what
/// its rule enables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TableRule {
    #[serde(alias = "table")]
    pub table: String,
    #[serde(alias = "allow_row_delete")]
    pub allow_row_delete: bool,
    #[serde(alias = "allow_row_update")]
    pub allow_row_update: bool,
    #[serde(alias = "allow_row_insert")]
    pub allow_row_insert: bool,
    #[serde(alias = "allow_table_create")]
    pub allow_table_create: bool,
    #[serde(alias = "transaction_cost")]
    pub transaction_cost: TransactionCost,
    /// The rule applies to blocks above this height
    #[serde(alias = "apply_after_block")]
    pub apply_after_block: u64,
}

impl TableRule {
    fn allows(&self, kind: StatementKind) -> bool {
        match kind {
            StatementKind::Delete => self.allow_row_delete,
            StatementKind::Insert => self.allow_row_insert,
            StatementKind::Update => self.allow_row_update,
            StatementKind::CreateTable => self.allow_table_create,
            _ => true,
        }
    }
}

/// Consensus rules of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsensusConfig {
    #[serde(default = "defaults::kind", alias = "kind")]
    pub kind: String,
    #[serde(default = "defaults::coins_for_block_made", alias = "coins_for_block_made")]
    pub coins_for_block_made: u64,
    #[serde(default = "defaults::allow", alias = "allow_table_create")]
    pub allow_table_create: bool,
    #[serde(default = "defaults::allow", alias = "allow_table_drop")]
    pub allow_table_drop: bool,
    #[serde(default = "defaults::allow", alias = "allow_row_delete")]
    pub allow_row_delete: bool,
    #[serde(default, alias = "settings")]
    pub settings: PowSettings,
    /// Permissions and table rules apply to blocks above this height, zero
    /// for all blocks
    #[serde(default, alias = "apply_rules_after_block")]
    pub apply_rules_after_block: u64,
    #[serde(default, alias = "transaction_cost")]
    pub transaction_cost: TransactionCost,
    /// Tables whose statements are executed without a transaction
    #[serde(default, alias = "unmanaged_tables")]
    pub unmanaged_tables: Vec<String>,
    #[serde(default, alias = "table_rules")]
    pub table_rules: Vec<TableRule>,
    /// Address receiving payments for SQL statements, empty when SQL is free
    #[serde(default, alias = "paid_transactions_wallet")]
    pub paid_transactions_wallet: String,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            kind: defaults::kind(),
            coins_for_block_made: defaults::coins_for_block_made(),
            allow_table_create: true,
            allow_table_drop: true,
            allow_row_delete: true,
            settings: PowSettings::default(),
            apply_rules_after_block: 0,
            transaction_cost: TransactionCost::default(),
            unmanaged_tables: Vec::new(),
            table_rules: Vec::new(),
            paid_transactions_wallet: String::new(),
        }
    }
}

impl ConsensusConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let mut parsed: ConsensusConfig = serde_json::from_str(json)?;
        if parsed.kind.is_empty() {
            parsed.kind = defaults::kind();
        }
        if parsed.coins_for_block_made == 0 {
            parsed.coins_for_block_made = defaults::coins_for_block_made();
        }
        if parsed.kind != KIND_PROOF_OF_WORK {
            return Err(ConfigError::UnsupportedKind(parsed.kind));
        }
        parsed.settings.validate()?;
        parsed.paid_wallet()?;
        Ok(parsed)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    fn table_rule(&self, table: &str, height: u64) -> Option<&TableRule> {
        self.table_rules
            .iter()
            .find(|r| r.table == table)
            .filter(|r| applies_at(r.apply_after_block, height))
    }

    /// Whether a statement of `kind` on `table` may go into a block at `height`
    pub fn allows(&self, kind: StatementKind, table: &str, height: u64) -> bool {
        if !applies_at(self.apply_rules_after_block, height) {
            return true;
        }
        if let Some(rule) = self.table_rule(table, height) {
            return rule.allows(kind);
        }
        match kind {
            StatementKind::CreateTable => self.allow_table_create,
            StatementKind::DropTable => self.allow_table_drop,
            StatementKind::Delete => self.allow_row_delete,
            _ => true,
        }
    }

    /// Price of a statement of `kind` on `table` in a block at `height`
    pub fn statement_price(&self, kind: StatementKind, table: &str, height: u64) -> u64 {
        match self.table_rule(table, height) {
            Some(rule) => rule.transaction_cost.price(kind, height),
            None => self.transaction_cost.price(kind, height),
        }
    }

    /// Receiver of SQL payments, `None` when SQL is free
    pub fn paid_wallet(&self) -> Result<Option<PubKeyHash>, ConfigError> {
        if self.paid_transactions_wallet.is_empty() {
            return Ok(None);
        }
        Ok(Some(PubKeyHash::from_address(&self.paid_transactions_wallet)?))
    }

    pub fn is_unmanaged(&self, table: &str) -> bool {
        self.unmanaged_tables.iter().any(|t| t == table)
    }
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub consensus_file: String,
    #[serde(default)]
    pub minter_address: String,
    /// Hex encoded private key, empty when the node signs nothing
    #[serde(default)]
    pub signing_key: String,
    #[serde(default = "defaults::mint_queue_depth")]
    pub mint_queue_depth: usize,
    #[serde(default = "defaults::mint_interval_secs")]
    pub mint_interval_secs: u64,
}

impl NodeConfig {
    /// Defaults, then the optional file, then the environment
    pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
        let full = Config::builder()
            .add_source(File::from_str(
                include_str!("../config.default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(file.unwrap_or("sqlchain")).required(false))
            .add_source(Environment::with_prefix("SQLCHAIN").separator("__"))
            .build()?;
        Ok(full.try_deserialize()?)
    }

    /// Consensus rules named by `consensus-file`, or the built-in defaults
    pub fn consensus(&self) -> Result<ConsensusConfig, ConfigError> {
        if self.consensus_file.is_empty() {
            return Ok(ConsensusConfig::default());
        }
        ConsensusConfig::load_file(Path::new(&self.consensus_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let parsed = ConsensusConfig::from_json("{}").unwrap();
        assert_eq!(parsed, ConsensusConfig::default());
        assert_eq!(parsed.settings.complexity_bits, 16);
        assert_eq!(parsed.settings.complexity_bits_step2, 24);
    }

    #[test]
    fn test_partial_settings_are_completed() {
        let parsed = ConsensusConfig::from_json(
            r#"{"CoinsForBlockMade": 0, "AllowTableDrop": false,
                "Settings": {"MinTxPerBlock": 1, "MaxTxPerBlock": 5}}"#,
        )
        .unwrap();
        assert_eq!(parsed.coins_for_block_made, 10);
        assert_eq!(parsed.settings.min_tx_per_block, 1);
        assert_eq!(parsed.settings.max_nonce, u64::MAX);
        assert!(!parsed.allows(StatementKind::DropTable, "t", 1));
        assert!(parsed.allows(StatementKind::CreateTable, "t", 1));
        assert!(parsed.allows(StatementKind::Update, "t", 1));
    }

    #[test]
    fn test_snake_case_keys_still_accepted() {
        let parsed = ConsensusConfig::from_json(
            r#"{"coins_for_block_made": 7, "allow_table_create": false,
                "settings": {"complexity_bits": 3, "min_tx_per_block": 2}}"#,
        )
        .unwrap();
        assert_eq!(parsed.coins_for_block_made, 7);
        assert!(!parsed.allow_table_create);
        assert_eq!(parsed.settings.complexity_bits, 3);
        assert_eq!(parsed.settings.min_tx_per_block, 2);
    }

    #[test]
    fn test_serialized_keys_are_pascal_case() {
        let json = serde_json::to_value(ConsensusConfig::default()).unwrap();
        assert!(json.get("CoinsForBlockMade").is_some());
        assert!(json.get("AllowTableCreate").is_some());
        assert!(json["Settings"].get("ComplexityBits").is_some());
        assert!(json.get("coins_for_block_made").is_none());
    }

    #[test]
    fn test_table_rules_override_globals() {
        let parsed = ConsensusConfig::from_json(
            r#"{"AllowRowDelete": true, "ApplyRulesAfterBlock": 2,
                "TableRules": [{"Table": "locked", "AllowRowInsert": true,
                                "TransactionCost": {"Default": 3, "RowInsert": 5}}],
                "TransactionCost": {"Default": 1, "TableCreate": 4}}"#,
        )
        .unwrap();
        assert!(parsed.allows(StatementKind::Delete, "locked", 2));
        assert!(!parsed.allows(StatementKind::Delete, "locked", 3));
        assert!(parsed.allows(StatementKind::Insert, "locked", 3));
        assert!(!parsed.allows(StatementKind::Update, "locked", 3));
        assert!(parsed.allows(StatementKind::Delete, "open", 3));

        assert_eq!(parsed.statement_price(StatementKind::Insert, "locked", 3), 5);
        assert_eq!(parsed.statement_price(StatementKind::Update, "locked", 3), 3);
        assert_eq!(parsed.statement_price(StatementKind::CreateTable, "open", 3), 4);
        assert_eq!(parsed.statement_price(StatementKind::Delete, "open", 3), 1);
    }

    #[test]
    fn test_paid_wallet_and_unmanaged_tables() {
        let pkh = crate::crypto::PrivateKey::generate().public_key().pubkey_hash();
        let json = format!(
            r#"{{"PaidTransactionsWallet": "{}", "UnmanagedTables": ["scratch"]}}"#,
            pkh.to_address()
        );
        let parsed = ConsensusConfig::from_json(&json).unwrap();
        assert_eq!(parsed.paid_wallet().unwrap(), Some(pkh));
        assert!(parsed.is_unmanaged("scratch"));
        assert!(!parsed.is_unmanaged("t"));
        assert_eq!(ConsensusConfig::default().paid_wallet().unwrap(), None);

        assert!(matches!(
            ConsensusConfig::from_json(r#"{"PaidTransactionsWallet": "nope"}"#),
            Err(ConfigError::Address(_))
        ));
    }

    #[test]
    fn test_bad_consensus_rejected() {
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"Kind": "proofofstake"}"#),
            Err(ConfigError::UnsupportedKind(_))
        ));
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"Settings": {"MinTxPerBlock": 5, "MaxTxPerBlock": 2}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(ConsensusConfig::from_json("not json"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_node_config_defaults() {
        let cfg = NodeConfig::load(Some("does-not-exist")).unwrap();
        assert_eq!(cfg.mint_queue_depth, 100);
        assert!(cfg.signing_key.is_empty());
        assert!(cfg.consensus_file.is_empty());
        assert_eq!(cfg.consensus().unwrap(), ConsensusConfig::default());
    }

    #[test]
    fn test_consensus_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consensus.json");
        let mut rules = ConsensusConfig::default();
        rules.allow_row_delete = false;
        std::fs::write(&path, serde_json::to_string(&rules).unwrap()).unwrap();
        assert_eq!(ConsensusConfig::load_file(&path).unwrap(), rules);
    }
}
