//! Core domain model for EMS: record cleaning, fingerprints, and the
//! classification rule tables shared by the dimension reconciler.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "ems-core";

/// Flat record as delivered by the open-data endpoint, prior to any checks.
pub type RawRecord = Map<String, Value>;

/// Field names used by the upstream dataset.
pub mod source_fields {
    pub const PERIOD: &str = "periodo";
    pub const YEAR: &str = "a_o";
    pub const SEX: &str = "sexo";
    pub const AGE: &str = "edad";
    pub const PLACE: &str = "procedencia";
    pub const REGION: &str = "departamento";
    pub const ATTENDED_AT: &str = "fecha_atencion";
    pub const DIAGNOSIS_CODE: &str = "diagnostico";
    pub const DIAGNOSIS_NAME: &str = "nombre_diagnostico";
    pub const HEALTH_PLAN: &str = "regimen";
    pub const COVERAGE_ENTITY: &str = "eapb";
}

pub const MIN_YEAR: i32 = 2020;
pub const MAX_YEAR: i32 = 2025;
pub const MAX_AGE: u8 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    M,
    F,
}

impl Sex {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "M" => Some(Sex::M),
            "F" => Some(Sex::F),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::M => "M",
            Sex::F => "F",
        }
    }
}

/// A record that passed every field-level check. Produced once by [`clean`],
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub period: String,
    pub year: i32,
    pub sex: Sex,
    pub age: u8,
    pub age_group: String,
    pub place: String,
    pub region: String,
    pub attended_at: NaiveDate,
    pub diagnosis_code: String,
    pub diagnosis_name: String,
    pub health_plan: String,
    pub coverage_entity: String,
}

/// Age band used for the derived age-group attribute.
pub fn age_group(age: u8) -> &'static str {
    match age {
        0 => "under 1",
        1..=4 => "1-4",
        5..=14 => "5-14",
        15..=24 => "15-24",
        25..=44 => "25-44",
        45..=64 => "45-64",
        _ => "65 and over",
    }
}

#[derive(Debug, Default)]
pub struct CleanOutcome {
    pub records: Vec<ValidatedRecord>,
    pub dropped: usize,
}

/// Normalize raw records into validated form. A record failing any rule is
/// excluded entirely; only the aggregate dropped count is reported.
pub fn clean(raw: impl IntoIterator<Item = RawRecord>) -> CleanOutcome {
    let mut outcome = CleanOutcome::default();
    for record in raw {
        match clean_one(&record) {
            Some(valid) => outcome.records.push(valid),
            None => outcome.dropped += 1,
        }
    }
    outcome
}

fn clean_one(raw: &RawRecord) -> Option<ValidatedRecord> {
    let age: u8 = text_field(raw, source_fields::AGE)?.parse().ok()?;
    if age > MAX_AGE {
        return None;
    }

    let sex = Sex::parse(&text_field(raw, source_fields::SEX)?)?;
    let attended_at = parse_date(&text_field(raw, source_fields::ATTENDED_AT)?)?;

    let year: i32 = text_field(raw, source_fields::YEAR)?.parse().ok()?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return None;
    }

    let diagnosis_name =
        normalize_diagnosis_name(&text_field(raw, source_fields::DIAGNOSIS_NAME)?);

    let period = text_field(raw, source_fields::PERIOD)?;
    let place = text_field(raw, source_fields::PLACE)?;
    let region = text_field(raw, source_fields::REGION)?;
    let diagnosis_code = text_field(raw, source_fields::DIAGNOSIS_CODE)?;
    let health_plan = text_field(raw, source_fields::HEALTH_PLAN)?;
    let coverage_entity = text_field(raw, source_fields::COVERAGE_ENTITY)?;

    // Critical fields must be non-empty after trimming.
    for critical in [
        &place,
        &region,
        &diagnosis_code,
        &diagnosis_name,
        &health_plan,
        &coverage_entity,
    ] {
        if critical.is_empty() {
            return None;
        }
    }

    Some(ValidatedRecord {
        period,
        year,
        age_group: age_group(age).to_string(),
        sex,
        age,
        place,
        region,
        attended_at,
        diagnosis_code,
        diagnosis_name,
        health_plan,
        coverage_entity,
    })
}

/// Read a field as trimmed text, accepting both string and numeric values.
fn text_field(raw: &RawRecord, name: &str) -> Option<String> {
    match raw.get(name)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if let Ok(stamp) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(stamp.date());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
}

/// Keep letters, digits, whitespace, hyphen and period; collapse whitespace
/// runs to a single space.
pub fn normalize_diagnosis_name(name: &str) -> String {
    let filtered: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                ' '
            }
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content-derived identity for a validated record: lowercase hex SHA-256
/// over a fixed ordered field concatenation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(hex_digest: String) -> Self {
        Self(hex_digest)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the deduplication fingerprint for a validated record.
///
/// The field order below is frozen. Reordering, adding or removing a field
/// changes every digest and therefore invalidates all previously stored
/// fingerprints, which would make the next pass re-insert the entire
/// dataset. Diagnosis name and age group are deliberately excluded.
pub fn fingerprint(record: &ValidatedRecord) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in [
        record.period.as_str(),
        &record.year.to_string(),
        record.sex.as_str(),
        &record.age.to_string(),
        record.place.as_str(),
        record.region.as_str(),
        &record.attended_at.to_string(),
        record.diagnosis_code.as_str(),
        record.health_plan.as_str(),
        record.coverage_entity.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

/// One matcher kind per classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    Prefix(&'static str),
    Exact(&'static str),
    Contains(&'static str),
}

impl Matcher {
    fn matches(&self, input: &str) -> bool {
        match self {
            Matcher::Prefix(prefix) => input.starts_with(prefix),
            Matcher::Exact(value) => input == *value,
            Matcher::Contains(needle) => input.contains(needle),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub matcher: Matcher,
    pub label: &'static str,
}

/// Ordered rule table evaluated first-match-wins against the uppercased
/// input.
#[derive(Debug, Clone, Copy)]
pub struct RuleTable {
    pub rules: &'static [Rule],
    pub default: &'static str,
}

impl RuleTable {
    pub fn classify(&self, input: &str) -> &'static str {
        let input = input.to_uppercase();
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(&input))
            .map(|rule| rule.label)
            .unwrap_or(self.default)
    }
}

/// Diagnosis category by code prefix.
pub const DIAGNOSIS_CATEGORIES: RuleTable = RuleTable {
    rules: &[
        Rule { matcher: Matcher::Prefix("R"), label: "signs and symptoms" },
        Rule { matcher: Matcher::Prefix("S"), label: "injuries" },
        Rule { matcher: Matcher::Prefix("T"), label: "injuries" },
        Rule { matcher: Matcher::Prefix("V"), label: "external causes" },
        Rule { matcher: Matcher::Prefix("W"), label: "external causes" },
        Rule { matcher: Matcher::Prefix("M"), label: "musculoskeletal" },
    ],
    default: "emergency/other",
};

/// Health-plan kind by exact plan name.
pub const HEALTH_PLAN_KINDS: RuleTable = RuleTable {
    rules: &[
        Rule { matcher: Matcher::Exact("CONTRIBUTIVO"), label: "private" },
        Rule { matcher: Matcher::Exact("PARTICULAR"), label: "private" },
        Rule { matcher: Matcher::Exact("VINCULADO"), label: "special" },
        Rule { matcher: Matcher::Exact("OTRO"), label: "special" },
    ],
    default: "public",
};

/// Coverage-entity kind by substring of the entity name.
pub const COVERAGE_ENTITY_KINDS: RuleTable = RuleTable {
    rules: &[
        Rule { matcher: Matcher::Contains("EPS"), label: "EPS" },
        Rule { matcher: Matcher::Contains("ARS"), label: "ARS" },
        Rule { matcher: Matcher::Contains("VINCULADOS"), label: "linked" },
    ],
    default: "generic-EAPB",
};

pub fn diagnosis_category(code: &str) -> &'static str {
    DIAGNOSIS_CATEGORIES.classify(code)
}

pub fn health_plan_kind(name: &str) -> &'static str {
    HEALTH_PLAN_KINDS.classify(name)
}

pub fn coverage_entity_kind(name: &str) -> &'static str {
    COVERAGE_ENTITY_KINDS.classify(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(age: &str, sex: &str, year: &str) -> RawRecord {
        json!({
            "periodo": "2024-03",
            "a_o": year,
            "sexo": sex,
            "edad": age,
            "procedencia": " MEDELLIN ",
            "departamento": "ANTIOQUIA",
            "fecha_atencion": "2024-03-15T00:00:00.000",
            "diagnostico": "R10",
            "nombre_diagnostico": "DOLOR ABDOMINAL Y PELVICO",
            "regimen": "SUBSIDIADO",
            "eapb": "SAVIA SALUD EPS",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn accepts_age_bounds_and_rejects_outside() {
        assert_eq!(clean(vec![raw("0", "F", "2024")]).records.len(), 1);
        assert_eq!(clean(vec![raw("120", "F", "2024")]).records.len(), 1);
        assert_eq!(clean(vec![raw("-1", "F", "2024")]).dropped, 1);
        assert_eq!(clean(vec![raw("121", "F", "2024")]).dropped, 1);
        assert_eq!(clean(vec![raw("abc", "F", "2024")]).dropped, 1);
    }

    #[test]
    fn rejects_unknown_sex() {
        assert_eq!(clean(vec![raw("30", "X", "2024")]).dropped, 1);
        assert_eq!(clean(vec![raw("30", "M", "2024")]).records.len(), 1);
    }

    #[test]
    fn enforces_year_window() {
        assert_eq!(clean(vec![raw("30", "F", "2019")]).dropped, 1);
        assert_eq!(clean(vec![raw("30", "F", "2026")]).dropped, 1);
        assert_eq!(clean(vec![raw("30", "F", "2020")]).records.len(), 1);
        assert_eq!(clean(vec![raw("30", "F", "2025")]).records.len(), 1);
    }

    #[test]
    fn rejects_unparseable_date_and_accepts_plain_date() {
        let mut record = raw("30", "F", "2024");
        record.insert("fecha_atencion".into(), json!("not-a-date"));
        assert_eq!(clean(vec![record]).dropped, 1);

        let mut record = raw("30", "F", "2024");
        record.insert("fecha_atencion".into(), json!("2024-03-15"));
        let outcome = clean(vec![record]);
        assert_eq!(
            outcome.records[0].attended_at,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );
    }

    #[test]
    fn drops_record_missing_critical_field() {
        let mut record = raw("30", "F", "2024");
        record.insert("eapb".into(), json!("   "));
        assert_eq!(clean(vec![record]).dropped, 1);

        let mut record = raw("30", "F", "2024");
        record.remove("departamento");
        assert_eq!(clean(vec![record]).dropped, 1);
    }

    #[test]
    fn trims_and_normalizes_text_fields() {
        let mut record = raw("30", "F", "2024");
        record.insert(
            "nombre_diagnostico".into(),
            json!("DOLOR   ABDOMINAL, (AGUDO)!!"),
        );
        let outcome = clean(vec![record]);
        let valid = &outcome.records[0];
        assert_eq!(valid.place, "MEDELLIN");
        assert_eq!(valid.diagnosis_name, "DOLOR ABDOMINAL AGUDO");
    }

    #[test]
    fn derives_age_group_bands() {
        assert_eq!(age_group(0), "under 1");
        assert_eq!(age_group(4), "1-4");
        assert_eq!(age_group(14), "5-14");
        assert_eq!(age_group(24), "15-24");
        assert_eq!(age_group(44), "25-44");
        assert_eq!(age_group(64), "45-64");
        assert_eq!(age_group(65), "65 and over");
    }

    #[test]
    fn fingerprint_is_stable_across_non_key_fields() {
        let outcome = clean(vec![raw("30", "F", "2024")]);
        let base = &outcome.records[0];

        let mut same_key = base.clone();
        same_key.diagnosis_name = "OTHER NAME".to_string();
        same_key.age_group = "other".to_string();
        assert_eq!(fingerprint(base), fingerprint(&same_key));

        let mut different = base.clone();
        different.age = 31;
        assert_ne!(fingerprint(base), fingerprint(&different));
    }

    #[test]
    fn fingerprint_separates_adjacent_fields() {
        let outcome = clean(vec![raw("30", "F", "2024")]);
        let base = &outcome.records[0];

        // "MEDELLIN" + "ANTIOQUIA" must not collide with a shifted split.
        let mut shifted = base.clone();
        shifted.place = format!("{}A", base.place);
        shifted.region = base.region[1..].to_string();
        assert_ne!(fingerprint(base), fingerprint(&shifted));
    }

    #[test]
    fn classifies_diagnosis_codes_by_prefix() {
        assert_eq!(diagnosis_category("R10"), "signs and symptoms");
        assert_eq!(diagnosis_category("S72"), "injuries");
        assert_eq!(diagnosis_category("T14"), "injuries");
        assert_eq!(diagnosis_category("V89"), "external causes");
        assert_eq!(diagnosis_category("W19"), "external causes");
        assert_eq!(diagnosis_category("M79"), "musculoskeletal");
        assert_eq!(diagnosis_category("J18"), "emergency/other");
    }

    #[test]
    fn classifies_health_plans_by_exact_name() {
        assert_eq!(health_plan_kind("CONTRIBUTIVO"), "private");
        assert_eq!(health_plan_kind("PARTICULAR"), "private");
        assert_eq!(health_plan_kind("VINCULADO"), "special");
        assert_eq!(health_plan_kind("OTRO"), "special");
        assert_eq!(health_plan_kind("SUBSIDIADO"), "public");
    }

    #[test]
    fn classifies_coverage_entities_by_substring() {
        assert_eq!(coverage_entity_kind("Nueva EPS"), "EPS");
        assert_eq!(coverage_entity_kind("CAPRECOM ARS"), "ARS");
        assert_eq!(coverage_entity_kind("POBLACION VINCULADOS"), "linked");
        assert_eq!(coverage_entity_kind("MAGISTERIO"), "generic-EAPB");
    }
}
