// src/models/swap_rules.rs

use serde::{Deserialize, Serialize};

// O documento de regras de troca guardado (em JSONB) no pool.
// A validação estrutural acontece na escrita da configuração; aqui só lemos.

/// Sentinela que libera qualquer dispositivo/navegador.
pub const ALL_SENTINEL: &str = "ALL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapRuleDocument {
    // Números exibidos na página que devem ser trocados
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub device_types: Vec<String>,
    #[serde(default)]
    pub browser_types: Vec<String>,
    // OU de grupos; cada grupo é um E de regras
    #[serde(default)]
    pub inclusion_rules: Vec<RuleGroup>,
    #[serde(default)]
    pub exclusion_rules: Vec<RuleGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "type")]
    pub kind: RuleType,
    // Só usado por LANDING_PARAM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<RuleOperator>,
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[cfg(test)]
impl Rule {
    pub fn of(kind: RuleType) -> Self {
        Self { kind, field: None, operator: None, inputs: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    All,
    Direct,
    Organic,
    Paid,
    Search,
    PaidSearch,
    Referral,
    Referrer,
    LandingPath,
    LandingParam,
    // Qualquer valor que esta versão não conhece; sempre reprova.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Like,
    NotLike,
    In,
    NotIn,
    Empty,
    NotEmpty,
    #[serde(other)]
    Unknown,
}
