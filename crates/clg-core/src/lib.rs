//! Core domain model for CLG: campaign field records, lookup-table entries,
//! the field normalizer and the campaign-type classifier.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "clg-core";

/// Validated campaign fields, ready for link assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignFields {
    pub brand: String,
    pub region: String,
    pub platform: String,
    pub campaign: String,
    pub budget_code: String,
    pub agency: String,
    pub buying_platform: String,
    pub publisher: String,
    pub publisher_subsite: String,
    pub targeting: String,
    pub vertical: String,
    pub offer: String,
    pub subtargeting: String,
    pub x_field: String,
    /// Landing-page URL. May be empty: the click tag is then empty and no
    /// deep-link parameters are attached.
    pub lp_url: String,
    /// Requested creative formats, in request order. Never empty after
    /// validation.
    pub formats: Vec<String>,
}

impl CampaignFields {
    /// Named placeholder values available for template substitution, keyed
    /// by field name. `ams_id` and `format` are added by the assembler.
    pub fn placeholder_values(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("brand", self.brand.as_str()),
            ("region", self.region.as_str()),
            ("platform", self.platform.as_str()),
            ("campaign", self.campaign.as_str()),
            ("budget_code", self.budget_code.as_str()),
            ("agency", self.agency.as_str()),
            ("buying_platform", self.buying_platform.as_str()),
            ("publisher", self.publisher.as_str()),
            ("publisher_subsite", self.publisher_subsite.as_str()),
            ("targeting", self.targeting.as_str()),
            ("vertical", self.vertical.as_str()),
            ("offer", self.offer.as_str()),
            ("subtargeting", self.subtargeting.as_str()),
            ("x_field", self.x_field.as_str()),
            ("lp_url", self.lp_url.as_str()),
        ]
    }

    /// Key into the network table: `upper(agency + publisher)`.
    pub fn network_key(&self) -> String {
        format!("{}{}", self.agency, self.publisher).to_uppercase()
    }

    /// Key into the app table: `brand-region-platform`.
    pub fn app_key(&self) -> String {
        format!("{}-{}-{}", self.brand, self.region, self.platform)
    }
}

/// Untrusted record shape returned by the extraction collaborator. Every
/// field is optional; validation turns this into [`CampaignFields`] or a
/// [`RowError`] naming what is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCampaignFields {
    pub brand: Option<String>,
    pub region: Option<String>,
    pub platform: Option<String>,
    pub campaign: Option<String>,
    pub budget_code: Option<String>,
    pub agency: Option<String>,
    pub buying_platform: Option<String>,
    pub publisher: Option<String>,
    pub publisher_subsite: Option<String>,
    pub targeting: Option<String>,
    pub vertical: Option<String>,
    pub offer: Option<String>,
    pub subtargeting: Option<String>,
    pub x_field: Option<String>,
    pub lp_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<String>,
}

impl RawCampaignFields {
    /// Validate and promote into [`CampaignFields`]. Fails fast with every
    /// absent or blank required field listed by name; never silently
    /// substitutes blanks.
    pub fn into_fields(self) -> Result<CampaignFields, RowError> {
        let mut missing = Vec::new();
        let mut take = |name: &'static str, value: Option<String>| -> String {
            match value {
                Some(v) if !v.trim().is_empty() => v,
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let fields = CampaignFields {
            brand: take("brand", self.brand),
            region: take("region", self.region),
            platform: take("platform", self.platform),
            campaign: take("campaign", self.campaign),
            budget_code: take("budget_code", self.budget_code),
            agency: take("agency", self.agency),
            buying_platform: take("buying_platform", self.buying_platform),
            publisher: take("publisher", self.publisher),
            publisher_subsite: take("publisher_subsite", self.publisher_subsite),
            targeting: take("targeting", self.targeting),
            vertical: take("vertical", self.vertical),
            offer: take("offer", self.offer),
            subtargeting: take("subtargeting", self.subtargeting),
            x_field: take("x_field", self.x_field),
            lp_url: self.lp_url.unwrap_or_default(),
            formats: self.formats,
        };

        if !missing.is_empty() {
            return Err(RowError::MissingFields {
                fields: missing.iter().map(|s| s.to_string()).collect(),
            });
        }
        if fields.formats.is_empty() {
            return Err(RowError::NoFormats);
        }
        Ok(fields)
    }
}

/// Per-platform URL templates keyed by `{platform}click` / `{platform}imp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEntry {
    #[serde(flatten)]
    pub templates: HashMap<String, String>,
}

impl NetworkEntry {
    pub fn template(&self, key: &str) -> Option<&str> {
        self.templates.get(key).map(String::as_str)
    }
}

/// Base click/impression URLs keyed by `brand-region-platform`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    pub click: String,
    pub imp: String,
}

/// One identifier in the partitioned AMS-ID pool. `used` flips false→true
/// at most once; the pool file on disk is the source of truth between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmsIdRecord {
    pub id: String,
    pub used: bool,
}

/// Assembled output for one (line, format) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResult {
    pub placement_code: String,
    pub click_tag: String,
    pub appsflyer_click: String,
    /// Empty when the platform override suppresses the impression pixel or
    /// when no impression URL could be resolved.
    pub appsflyer_imp: String,
    /// Soft-fail notices accumulated while resolving lookup entries.
    pub warnings: Vec<String>,
}

/// Row-level failure: the row is reported errored, the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("missing required fields: {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },
    #[error("no creative formats requested")]
    NoFormats,
}

// ─── Field Normalizer ──────────────────────────────────────────────────────

const BRAND_CODES: [(&str, &str); 11] = [
    ("Pokerstars", "PS"),
    ("Full Tilt", "FT"),
    ("Pokerstars Play", "PPLAY"),
    ("Pokerstars Casino", "PC"),
    ("FoxBet", "FXB"),
    ("SkyBet", "SB"),
    ("Sport", "SPORT"),
    ("Pokerstars Sports", "PSS"),
    ("Masterbrand", "MB"),
    ("Pokerstars Dojo", "PSDJ"),
    ("Pokerstars News", "PSN"),
];

const REGION_CODES: [(&str, &str); 13] = [
    ("Canada", "CA"),
    ("France", "FR"),
    ("Germany", "DE"),
    ("Spain", "ES"),
    ("United Kingdom", "UK"),
    ("European Union", "EU"),
    ("Brazil", "BR"),
    ("Denmark", "DK"),
    ("Romania", "RO"),
    ("Ontario", "CAON"),
    ("Pennsylvania", "USPA"),
    ("New Jersey", "USNJ"),
    ("Michigan", "USMI"),
];

const PLATFORM_CODES: [(&str, &str); 5] = [
    ("iOS", "iOS"),
    ("Android", "AND"),
    ("Desktop", "DESK"),
    ("Mobile Web", "MOB"),
    ("All Devices", "DIS"),
];

/// Semantic kind of a field for normalization purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Brand,
    Region,
    Platform,
    FreeText,
}

/// Map a human-friendly value to its canonical short code. Total: unknown
/// brands/regions pass through upper-cased, unknown platforms pass through
/// unchanged, free text is always upper-cased.
pub fn normalize_field(kind: FieldKind, value: &str) -> String {
    let lookup = |table: &[(&str, &str)]| {
        table
            .iter()
            .find(|(name, _)| *name == value)
            .map(|(_, code)| (*code).to_string())
    };
    match kind {
        FieldKind::Brand => lookup(&BRAND_CODES).unwrap_or_else(|| value.to_uppercase()),
        FieldKind::Region => lookup(&REGION_CODES).unwrap_or_else(|| value.to_uppercase()),
        FieldKind::Platform => lookup(&PLATFORM_CODES).unwrap_or_else(|| value.to_string()),
        FieldKind::FreeText => value.to_uppercase(),
    }
}

/// Normalize every lookup-sensitive field of a validated record in place.
pub fn normalize_fields(fields: &mut CampaignFields) {
    fields.brand = normalize_field(FieldKind::Brand, &fields.brand);
    fields.region = normalize_field(FieldKind::Region, &fields.region);
    fields.platform = normalize_field(FieldKind::Platform, &fields.platform);
    fields.publisher = normalize_field(FieldKind::FreeText, &fields.publisher);
    fields.buying_platform = normalize_field(FieldKind::FreeText, &fields.buying_platform);
    fields.vertical = normalize_field(FieldKind::FreeText, &fields.vertical);
}

// ─── Campaign-Type Classifier ──────────────────────────────────────────────

/// Pool partition a campaign draws its AMS IDs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignType {
    Affiliate,
    PaidSocial,
    Display,
}

impl CampaignType {
    /// Partition key inside the pool document.
    pub fn partition(&self) -> &'static str {
        match self {
            CampaignType::Affiliate => "affiliate",
            CampaignType::PaidSocial => "paidsocial",
            CampaignType::Display => "display",
        }
    }
}

/// Keyword inference over the free-text description. "affiliate" is checked
/// before "social": a description containing both draws from the affiliate
/// partition. Display is the default.
pub fn classify_campaign(text: &str) -> CampaignType {
    let lower = text.to_lowercase();
    if lower.contains("affiliate") {
        CampaignType::Affiliate
    } else if lower.contains("social") {
        CampaignType::PaidSocial
    } else {
        CampaignType::Display
    }
}
