//! # APN Catalog
//!
//! Candidate access-point configurations for the current carrier.
//!
//! Rows come from an external carrier table (see
//! [`ApnTable`](crate::collab::ApnTable)) as loose column maps and are
//! validated into immutable [`ApnSetting`]s. A whole generation is replaced
//! on every rebuild. One entry may be marked *preferred*; it is persisted
//! by id outside the catalog and re-validated against the operator on
//! every rebuild.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ConfigError;

// ─── Capability Tags ────────────────────────────────────────────────────────

/// Traffic class an APN can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApnType {
    Default,
    Mms,
    Supl,
    Dun,
    Hipri,
    /// Wildcard `*`: serves every type.
    All,
}

impl ApnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApnType::Default => "default",
            ApnType::Mms => "mms",
            ApnType::Supl => "supl",
            ApnType::Dun => "dun",
            ApnType::Hipri => "hipri",
            ApnType::All => "*",
        }
    }
}

impl FromStr for ApnType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ApnType::Default),
            "mms" => Ok(ApnType::Mms),
            "supl" => Ok(ApnType::Supl),
            "dun" => Ok(ApnType::Dun),
            "hipri" => Ok(ApnType::Hipri),
            "*" => Ok(ApnType::All),
            other => Err(ConfigError::UnknownCapability(other.to_string())),
        }
    }
}

impl fmt::Display for ApnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Table Rows ─────────────────────────────────────────────────────────────

/// Column names of the carrier table.
pub mod columns {
    pub const ID: &str = "_id";
    pub const NUMERIC: &str = "numeric";
    pub const NAME: &str = "name";
    pub const APN: &str = "apn";
    pub const PROXY: &str = "proxy";
    pub const PORT: &str = "port";
    pub const MMSC: &str = "mmsc";
    pub const MMS_PROXY: &str = "mmsproxy";
    pub const MMS_PORT: &str = "mmsport";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    pub const AUTH_TYPE: &str = "authtype";
    pub const TYPE: &str = "type";
}

/// One untyped row of the carrier table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApnRow {
    values: BTreeMap<String, String>,
}

impl ApnRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: &str, value: impl Into<String>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        self.values.insert(column.to_string(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    fn required(&self, column: &'static str) -> Result<&str, ConfigError> {
        match self.get(column).map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ConfigError::MissingColumn(column)),
        }
    }

    fn optional(&self, column: &str) -> Option<String> {
        self.get(column)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

// ─── APN Setting ────────────────────────────────────────────────────────────

/// A validated carrier access-point record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApnSetting {
    pub id: i64,
    pub numeric: String,
    pub carrier: String,
    pub apn: String,
    pub proxy: Option<String>,
    pub port: Option<String>,
    pub mmsc: Option<String>,
    pub mms_proxy: Option<String>,
    pub mms_port: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// 0 none, 1 PAP, 2 CHAP, 3 PAP or CHAP.
    pub auth_type: u8,
    pub types: Vec<ApnType>,
}

impl ApnSetting {
    /// Validate a table row. `_id`, `numeric` and `apn` are required; an
    /// empty `type` column means the wildcard.
    pub fn from_row(row: &ApnRow) -> Result<Self, ConfigError> {
        let id_raw = row.required(columns::ID)?;
        let id = id_raw
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidColumn {
                column: columns::ID,
                value: id_raw.to_string(),
            })?;
        let numeric = row.required(columns::NUMERIC)?.to_string();
        let apn = row.required(columns::APN)?.to_string();

        let auth_type = match row.optional(columns::AUTH_TYPE) {
            None => 0,
            Some(v) => match v.parse::<u8>() {
                Ok(n) if n <= 3 => n,
                _ => {
                    return Err(ConfigError::InvalidColumn {
                        column: columns::AUTH_TYPE,
                        value: v,
                    })
                }
            },
        };

        let types = match row.optional(columns::TYPE) {
            None => vec![ApnType::All],
            Some(v) => v
                .split(',')
                .map(ApnType::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(ApnSetting {
            id,
            carrier: row.optional(columns::NAME).unwrap_or_default(),
            numeric,
            apn,
            proxy: row.optional(columns::PROXY),
            port: row.optional(columns::PORT),
            mmsc: row.optional(columns::MMSC),
            mms_proxy: row.optional(columns::MMS_PROXY),
            mms_port: row.optional(columns::MMS_PORT),
            user: row.optional(columns::USER),
            password: row.optional(columns::PASSWORD),
            auth_type,
            types,
        })
    }

    pub fn can_handle(&self, capability: ApnType) -> bool {
        self.types
            .iter()
            .any(|t| *t == capability || *t == ApnType::All)
    }

    /// Same deployed configuration: every connection parameter and
    /// credential matches. Id and carrier name are cosmetic.
    pub fn same_deployment(&self, other: &ApnSetting) -> bool {
        self.apn == other.apn
            && self.proxy == other.proxy
            && self.port == other.port
            && self.mmsc == other.mmsc
            && self.mms_proxy == other.mms_proxy
            && self.mms_port == other.mms_port
            && self.user == other.user
            && self.password == other.password
            && self.auth_type == other.auth_type
            && self.types == other.types
    }
}

impl fmt::Display for ApnSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<&str> = self.types.iter().map(ApnType::as_str).collect();
        write!(
            f,
            "{}#{} {} ({}) [{}]",
            self.numeric,
            self.id,
            self.carrier,
            self.apn,
            types.join(",")
        )
    }
}

// ─── Catalog ────────────────────────────────────────────────────────────────

/// Result of replacing the catalog contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildOutcome {
    pub loaded: usize,
    pub skipped: usize,
    /// A preferred entry existed and was dropped by this rebuild.
    pub preferred_cleared: bool,
}

/// All APNs for the current operator plus the sticky preferred entry.
#[derive(Debug, Clone, Default)]
pub struct ApnCatalog {
    operator: Option<String>,
    all: Vec<ApnSetting>,
    preferred: Option<ApnSetting>,
}

impl ApnCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalog with `rows` for `operator`. Malformed rows are
    /// logged and skipped. A preferred entry of another operator is dropped;
    /// otherwise it follows its id into the new generation.
    pub fn rebuild(&mut self, operator: &str, rows: &[ApnRow]) -> RebuildOutcome {
        let mut outcome = RebuildOutcome::default();
        let mut all = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            match ApnSetting::from_row(row) {
                Ok(setting) => all.push(setting),
                Err(e) => {
                    warn!(operator, row = idx, error = %e, "skipping malformed APN row");
                    outcome.skipped += 1;
                }
            }
        }
        outcome.loaded = all.len();
        self.all = all;
        self.operator = Some(operator.to_string());

        if self.validate_preferred(operator) {
            outcome.preferred_cleared = true;
        }
        if let Some(prev) = self.preferred.take() {
            match self.all.iter().find(|a| a.id == prev.id) {
                Some(current) => self.preferred = Some(current.clone()),
                None => {
                    debug!(id = prev.id, "preferred APN no longer in table");
                    outcome.preferred_cleared = true;
                }
            }
        }

        if self.all.is_empty() {
            info!(operator, "no APN found for carrier");
        } else {
            debug!(operator, loaded = outcome.loaded, skipped = outcome.skipped, "APN catalog rebuilt");
        }
        outcome
    }

    /// Drop every entry, e.g. when the SIM goes away.
    pub fn clear(&mut self) {
        self.all.clear();
        self.operator = None;
        self.preferred = None;
    }

    /// Clear `preferred` if it belongs to another operator. Returns true
    /// when something was cleared.
    pub fn validate_preferred(&mut self, operator: &str) -> bool {
        match &self.preferred {
            Some(p) if p.numeric != operator => {
                info!(
                    preferred = %p,
                    operator,
                    "preferred APN belongs to another operator, discarding"
                );
                self.preferred = None;
                true
            }
            _ => false,
        }
    }

    /// Resolve a persisted preferred id against the current generation.
    /// Returns false (and leaves no preference) if it does not resolve to an
    /// entry of the current operator.
    pub fn restore_preferred(&mut self, id: i64) -> bool {
        let found = self
            .all
            .iter()
            .find(|a| a.id == id && Some(a.numeric.as_str()) == self.operator.as_deref())
            .cloned();
        let restored = found.is_some();
        self.preferred = found;
        restored
    }

    pub fn set_preferred(&mut self, apn: ApnSetting) {
        self.preferred = Some(apn);
    }

    pub fn clear_preferred(&mut self) {
        self.preferred = None;
    }

    /// Ordered candidates for `capability`. For the default capability a
    /// preferred entry of the current operator short-circuits the list.
    pub fn build_waiting(&self, capability: ApnType) -> Vec<ApnSetting> {
        if capability == ApnType::Default {
            if let Some(p) = &self.preferred {
                if Some(p.numeric.as_str()) == self.operator.as_deref()
                    && p.can_handle(capability)
                {
                    debug!(preferred = %p, "waiting APN set to preferred APN");
                    return vec![p.clone()];
                }
            }
        }
        self.all
            .iter()
            .filter(|a| a.can_handle(capability))
            .cloned()
            .collect()
    }

    pub fn is_type_available(&self, capability: ApnType) -> bool {
        self.all.iter().any(|a| a.can_handle(capability))
    }

    /// No usable APN at all for the current operator.
    pub fn is_exhausted(&self) -> bool {
        self.all.is_empty()
    }

    pub fn operator(&self) -> Option<&str> {
        self.operator.as_deref()
    }

    pub fn preferred(&self) -> Option<&ApnSetting> {
        self.preferred.as_ref()
    }

    pub fn all(&self) -> &[ApnSetting] {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
