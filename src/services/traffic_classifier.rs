// src/services/traffic_classifier.rs

// Funções puras de atribuição: de onde veio a visita (direto, orgânico, pago, referência, busca).
// Comparações de host/domínio são sempre em minúsculas e sem barra final.

use std::collections::HashMap;

use url::Url;

use crate::models::attribution::{AttributionFields, TrafficAttribution};

/// Hosts aceites como motores de busca (comparação exata).
pub const SEARCH_ENGINE_HOSTS: &[&str] = &[
    "google.com",
    "www.google.com",
    "yahoo.com",
    "www.yahoo.com",
    "search.yahoo.com",
    "bing.com",
    "www.bing.com",
    "duckduckgo.com",
    "www.duckduckgo.com",
    "yandex.com",
    "www.yandex.com",
];

/// Valores de "medium" que indicam mídia paga.
pub const PAID_MEDIUMS: &[&str] = &["cpc", "ppc", "cpa", "cpm", "cpv", "cpp"];

const MAX_SOURCE_LEN: usize = 512;

/// Faz o parse tolerante: URLs sem esquema ("google.com/search") ganham "http://".
pub fn parse_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Url::parse(raw)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("http://{}", raw)).ok())
}

/// Host normalizado (minúsculo, sem barra final). `None` se não houver host.
pub fn normalize_host(raw: &str) -> Option<String> {
    let url = parse_url(raw)?;
    let host = url.host_str()?.trim().trim_end_matches('/').to_lowercase();
    (!host.is_empty()).then_some(host)
}

/// Caminho da URL sem a barra final ("/" vira "").
pub fn landing_path(raw: &str) -> Option<String> {
    let url = parse_url(raw)?;
    Some(url.path().trim_end_matches('/').to_string())
}

/// Devolve o valor do primeiro parâmetro presente, na ordem da lista da empresa.
/// Presente e vazio (`?utm_source=`) conta como presente: devolve `Some("")`.
/// Os nomes dos parâmetros da query são comparados em minúsculas.
pub fn get_param(url: &str, fields: &[String]) -> Option<String> {
    let url = parse_url(url)?;

    let mut params: HashMap<String, String> = HashMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(key.to_lowercase())
            .or_insert_with(|| value.into_owned());
    }

    fields.iter().find_map(|field| {
        params.get(&field.trim().to_lowercase()).cloned()
    })
}

pub fn is_direct(http_referrer: &str) -> bool {
    http_referrer.trim().is_empty()
}

pub fn is_search(http_referrer: &str) -> bool {
    normalize_host(http_referrer)
        .map(|host| SEARCH_ENGINE_HOSTS.contains(&host.as_str()))
        .unwrap_or(false)
}

pub fn is_paid(landing_url: &str, medium_fields: &[String]) -> bool {
    get_param(landing_url, medium_fields)
        .map(|medium| PAID_MEDIUMS.contains(&medium.trim().to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_organic(http_referrer: &str, landing_url: &str, medium_fields: &[String]) -> bool {
    is_search(http_referrer) && !is_paid(landing_url, medium_fields)
}

pub fn is_referral(http_referrer: &str) -> bool {
    !is_direct(http_referrer) && !is_search(http_referrer)
}

// Para a atribuição, parâmetro vazio é o mesmo que ausente.
fn attribution_param(landing_url: &str, fields: &[String]) -> Option<String> {
    get_param(landing_url, fields).filter(|value| !value.trim().is_empty())
}

/// Classificação completa de uma visita.
pub fn classify(
    landing_url: &str,
    http_referrer: &str,
    fields: &AttributionFields,
) -> TrafficAttribution {
    let source = attribution_param(landing_url, &fields.source).or_else(|| {
        (fields.source_referrer_when_empty && !is_direct(http_referrer))
            .then(|| http_referrer.trim().chars().take(MAX_SOURCE_LEN).collect())
    });

    let search = is_search(http_referrer);
    let paid = is_paid(landing_url, &fields.medium);
    let direct = is_direct(http_referrer);

    TrafficAttribution {
        source,
        medium: attribution_param(landing_url, &fields.medium),
        content: attribution_param(landing_url, &fields.content),
        campaign: attribution_param(landing_url, &fields.campaign),
        keyword: attribution_param(landing_url, &fields.keyword),
        is_direct: direct,
        is_organic: search && !paid,
        is_paid: paid,
        is_referral: !direct && !search,
        is_search: search,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_param_follows_company_order_and_ignores_case() {
        let url = "https://example.com/?SRC=newsletter&utm_source=google";
        assert_eq!(
            get_param(url, &fields(&["utm_source", "src"])).as_deref(),
            Some("google")
        );
        assert_eq!(
            get_param(url, &fields(&["src", "utm_source"])).as_deref(),
            Some("newsletter")
        );
        assert_eq!(get_param(url, &fields(&["gclid"])), None);
    }

    #[test]
    fn get_param_returns_first_present_key_even_when_blank() {
        let url = "https://example.com/?utm_source=&src=fb";
        assert_eq!(
            get_param(url, &fields(&["utm_source", "src"])).as_deref(),
            Some("")
        );
        assert_eq!(get_param(url, &fields(&["src", "utm_source"])).as_deref(), Some("fb"));
    }

    #[test]
    fn blank_source_param_falls_back_to_referrer() {
        let attribution = classify(
            "https://example.com/?utm_source=&utm_medium=",
            "https://news.example.org/",
            &AttributionFields::default(),
        );
        assert_eq!(attribution.source.as_deref(), Some("https://news.example.org/"));
        assert_eq!(attribution.medium, None);
        assert!(!attribution.is_paid);
    }

    #[test]
    fn bing_without_medium_is_organic_search() {
        let medium = fields(&["utm_medium"]);
        let referrer = "https://www.bing.com";
        let landing = "https://example.com/pricing";

        assert!(is_search(referrer));
        assert!(!is_paid(landing, &medium));
        assert!(is_organic(referrer, landing, &medium));
        assert!(!is_referral(referrer));
    }

    #[test]
    fn paid_medium_is_never_organic() {
        let medium = fields(&["utm_medium"]);
        let referrer = "https://www.google.com/";
        let landing = "https://example.com/?utm_medium=CPC";

        assert!(is_paid(landing, &medium));
        assert!(!is_organic(referrer, landing, &medium));
    }

    #[test]
    fn empty_referrer_is_direct_and_nothing_else() {
        let attribution = classify("https://example.com/", "", &AttributionFields::default());
        assert!(attribution.is_direct);
        assert!(!attribution.is_search);
        assert!(!attribution.is_referral);
        assert!(!attribution.is_organic);
        assert_eq!(attribution.source, None);
    }

    #[test]
    fn search_host_match_is_exact() {
        assert!(is_search("https://WWW.Google.com/"));
        assert!(is_search("google.com"));
        assert!(!is_search("https://mail.google.com/"));
        assert!(is_referral("https://news.example.org/a/b"));
    }

    #[test]
    fn source_falls_back_to_truncated_referrer() {
        let long_referrer = format!("https://blog.example.org/{}", "a".repeat(600));
        let attribution = classify(
            "https://example.com/",
            &long_referrer,
            &AttributionFields::default(),
        );
        assert_eq!(attribution.source.map(|s| s.chars().count()), Some(512));

        let no_fallback = AttributionFields {
            source_referrer_when_empty: false,
            ..AttributionFields::default()
        };
        let attribution = classify("https://example.com/", &long_referrer, &no_fallback);
        assert_eq!(attribution.source, None);
    }

    #[test]
    fn classify_reads_every_utm_list() {
        let attribution = classify(
            "https://example.com/?utm_source=google&utm_medium=cpc&utm_campaign=spring&utm_term=plumber&utm_content=ad1",
            "https://www.google.com/",
            &AttributionFields::default(),
        );
        assert_eq!(attribution.source.as_deref(), Some("google"));
        assert_eq!(attribution.medium.as_deref(), Some("cpc"));
        assert_eq!(attribution.campaign.as_deref(), Some("spring"));
        assert_eq!(attribution.keyword.as_deref(), Some("plumber"));
        assert_eq!(attribution.content.as_deref(), Some("ad1"));
        assert!(attribution.is_paid && attribution.is_search);
        assert!(!attribution.is_organic);
    }

    #[test]
    fn path_and_host_helpers_strip_trailing_slash() {
        assert_eq!(landing_path("https://example.com/plans/").as_deref(), Some("/plans"));
        assert_eq!(landing_path("https://example.com/").as_deref(), Some(""));
        assert_eq!(normalize_host("HTTPS://Example.COM/").as_deref(), Some("example.com"));
        assert_eq!(normalize_host(""), None);
    }
}
