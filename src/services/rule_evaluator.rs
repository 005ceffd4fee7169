// src/services/rule_evaluator.rs

// Interpretador do documento de regras de troca:
//   dispositivo/navegador -> algum grupo de inclusão -> nenhum grupo de exclusão.
// Tudo que for inesperado reprova (fail closed) e vira um warn no log; nunca um erro.

use crate::{
    models::{
        attribution::VisitContext,
        swap_rules::{Rule, RuleGroup, RuleOperator, RuleType, SwapRuleDocument, ALL_SENTINEL},
    },
    services::traffic_classifier::{
        get_param, is_direct, is_organic, is_paid, is_referral, is_search, landing_path,
        normalize_host,
    },
};

/// `true` quando o documento libera a troca para esta visita.
pub fn evaluate(document: &SwapRuleDocument, context: &VisitContext) -> bool {
    if !type_allowed(&document.device_types, &context.device_type) {
        return false;
    }
    if !type_allowed(&document.browser_types, &context.browser_type) {
        return false;
    }

    let included = document
        .inclusion_rules
        .iter()
        .any(|group| group_passes(group, context));
    if !included {
        return false;
    }

    !document
        .exclusion_rules
        .iter()
        .any(|group| group_passes(group, context))
}

/// Os alvos a trocar, quando o documento passa.
pub fn swap_targets<'d>(document: &'d SwapRuleDocument, context: &VisitContext) -> Option<&'d [String]> {
    evaluate(document, context).then_some(document.targets.as_slice())
}

// Lista vazia ou com "ALL" libera tudo.
fn type_allowed(allowed: &[String], actual: &str) -> bool {
    allowed.is_empty()
        || allowed.iter().any(|t| {
            t.eq_ignore_ascii_case(ALL_SENTINEL) || t.trim().eq_ignore_ascii_case(actual.trim())
        })
}

// Um grupo sem regras não diz nada sobre a visita: reprova.
fn group_passes(group: &RuleGroup, context: &VisitContext) -> bool {
    !group.rules.is_empty() && group.rules.iter().all(|rule| rule_passes(rule, context))
}

pub fn rule_passes(rule: &Rule, context: &VisitContext) -> bool {
    let referrer = context.http_referrer.as_str();
    let landing = context.landing_url.as_str();
    let medium = context.medium_fields.as_slice();

    match rule.kind {
        RuleType::All => true,
        RuleType::Direct => is_direct(referrer),
        RuleType::Organic => is_organic(referrer, landing, medium),
        RuleType::Paid => is_paid(landing, medium),
        RuleType::Search => is_search(referrer),
        RuleType::PaidSearch => is_paid(landing, medium) && is_search(referrer),
        RuleType::Referral => is_referral(referrer),
        RuleType::Referrer => compare(rule, normalize_host(referrer), normalize_host),
        RuleType::LandingPath => compare(rule, landing_path(landing), normalize_path),
        RuleType::LandingParam => match rule.field.as_deref().map(str::trim) {
            // Parâmetro ausente reprova qualquer operador, inclusive EMPTY.
            Some(field) if !field.is_empty() => match get_param(landing, &[field.to_string()]) {
                Some(value) => compare(rule, Some(value), |input| Some(input.to_string())),
                None => false,
            },
            _ => {
                tracing::warn!("Regra LANDING_PARAM sem campo; reprovada.");
                false
            }
        },
        RuleType::Unknown => {
            tracing::warn!("Tipo de regra desconhecido; reprovada.");
            false
        }
    }
}

fn normalize_path(input: &str) -> Option<String> {
    let path = input.trim_end_matches('/');
    if path.is_empty() || path.starts_with('/') {
        Some(path.to_string())
    } else {
        Some(format!("/{}", path))
    }
}

// Aplica o operador ao valor extraído da visita.
// EMPTY/NOT_EMPTY olham só se o valor é vazio; os demais exigem valor.
fn compare<F>(rule: &Rule, value: Option<String>, normalize_input: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let Some(operator) = rule.operator else {
        tracing::warn!(rule = ?rule.kind, "Regra sem operador; reprovada.");
        return false;
    };

    let value = value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty());

    match operator {
        RuleOperator::Empty => return value.is_none(),
        RuleOperator::NotEmpty => return value.is_some(),
        RuleOperator::Unknown => {
            tracing::warn!(rule = ?rule.kind, "Operador desconhecido; reprovada.");
            return false;
        }
        _ => {}
    }

    let Some(value) = value else {
        return false;
    };

    let inputs: Vec<String> = rule
        .inputs
        .iter()
        .filter_map(|input| normalize_input(&input.trim().to_lowercase()))
        .collect();
    let first = inputs.first();

    match operator {
        RuleOperator::Equals => first.is_some_and(|input| *input == value),
        RuleOperator::NotEquals => first.is_some_and(|input| *input != value),
        // NOT_LIKE testa a mesma contenção que LIKE (comportamento herdado, mantido de propósito)
        RuleOperator::Like | RuleOperator::NotLike => {
            first.is_some_and(|input| value.contains(input.as_str()))
        }
        RuleOperator::In => inputs.iter().any(|input| *input == value),
        RuleOperator::NotIn => !inputs.iter().any(|input| *input == value),
        RuleOperator::Empty | RuleOperator::NotEmpty | RuleOperator::Unknown => false,
    }
}
