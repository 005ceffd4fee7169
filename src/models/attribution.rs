// src/models/attribution.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---
// 1. CompanyAttributionSettings (linha do banco)
// ---
// As listas de parâmetros ficam em CSV, na ordem de prioridade definida pela empresa.
#[derive(Debug, Clone, FromRow)]
pub struct CompanyAttributionSettings {
    pub source_param: String,
    pub medium_param: String,
    pub content_param: String,
    pub campaign_param: String,
    pub keyword_param: String,
    pub source_referrer_when_empty: bool,
}

// ---
// 2. AttributionFields (a forma usada pelo classificador)
// ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionFields {
    pub source: Vec<String>,
    pub medium: Vec<String>,
    pub content: Vec<String>,
    pub campaign: Vec<String>,
    pub keyword: Vec<String>,
    // Sem parâmetro de origem, usa o próprio referrer como "source"
    pub source_referrer_when_empty: bool,
}

impl AttributionFields {
    /// Divide uma lista CSV ("utm_source, src") numa lista ordenada de nomes minúsculos.
    pub fn split_csv(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(|field| field.trim().to_lowercase())
            .filter(|field| !field.is_empty())
            .collect()
    }
}

impl Default for AttributionFields {
    fn default() -> Self {
        Self {
            source: vec!["utm_source".to_string()],
            medium: vec!["utm_medium".to_string()],
            content: vec!["utm_content".to_string()],
            campaign: vec!["utm_campaign".to_string()],
            keyword: vec!["utm_term".to_string()],
            source_referrer_when_empty: true,
        }
    }
}

impl From<CompanyAttributionSettings> for AttributionFields {
    fn from(settings: CompanyAttributionSettings) -> Self {
        Self {
            source: Self::split_csv(&settings.source_param),
            medium: Self::split_csv(&settings.medium_param),
            content: Self::split_csv(&settings.content_param),
            campaign: Self::split_csv(&settings.campaign_param),
            keyword: Self::split_csv(&settings.keyword_param),
            source_referrer_when_empty: settings.source_referrer_when_empty,
        }
    }
}

// ---
// 3. TrafficAttribution (o resultado da classificação)
// ---
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAttribution {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub content: Option<String>,
    pub campaign: Option<String>,
    pub keyword: Option<String>,
    pub is_direct: bool,
    pub is_organic: bool,
    pub is_paid: bool,
    pub is_referral: bool,
    pub is_search: bool,
}

// ---
// 4. VisitContext (o que o avaliador de regras enxerga de uma visita)
// ---
#[derive(Debug, Clone, Default)]
pub struct VisitContext {
    pub device_type: String,
    pub browser_type: String,
    // Vazio significa tráfego direto
    pub http_referrer: String,
    pub landing_url: String,
    pub medium_fields: Vec<String>,
}
