//! Link assembly and batch orchestration for CLG.
//!
//! The assembler is a deterministic mapping from validated campaign fields
//! plus an allocated AMS ID to final placement/click/impression output. The
//! pipeline wraps it with per-row error isolation: one bad description never
//! sinks the batch, while allocation-level failures stop further work.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clg_core::{
    classify_campaign, normalize_fields, CampaignFields, LinkResult, RowError,
};
use clg_extract::{FieldExtractor, FixtureExtractor, OpenAiConfig, OpenAiExtractor};
use clg_store::{AmsIdStore, LookupTables, StoreError};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clg-engine";

/// Fallback base URLs used when the app table has no entry for
/// `brand-region-platform`.
pub const DEFAULT_CLICK_BASE: &str = "https://amaya.onelink.me/197923601";
pub const DEFAULT_IMP_BASE: &str = "https://impression.amaya.com";

const PLACEMENT_SEPARATOR: char = '-';
const ROW_ERROR_MARKER: &str = "ERROR";

// ─── Platform click-key overrides ──────────────────────────────────────────

/// A platform-specific template-key quirk. Matched against the resolved
/// click key, not the platform code, so the rule stays anchored to the
/// template vocabulary the network table actually uses.
#[derive(Debug, Clone, Copy)]
struct ClickKeyOverride {
    trigger: &'static str,
    replacement: &'static str,
    suppress_impression: bool,
}

/// Display-platform clicks are served through the Android click template and
/// never carry an impression pixel. A one-off rule, not a general mechanism:
/// add further entries here rather than new conditionals.
const CLICK_KEY_OVERRIDES: &[ClickKeyOverride] = &[ClickKeyOverride {
    trigger: "disclick",
    replacement: "andclick",
    suppress_impression: true,
}];

// ─── Assembly ──────────────────────────────────────────────────────────────

/// Literal `{fieldname}` substitution. Case-sensitive, single pass, no
/// recursion; unmatched placeholders remain in the output untouched.
pub fn substitute_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

/// Dash-joined placement code in the fixed field order. No escaping: a field
/// value containing the separator corrupts the code (caller-input
/// constraint, accepted as-is).
pub fn placement_code(fields: &CampaignFields, ams_id: &str, format: &str) -> String {
    [
        fields.brand.as_str(),
        fields.region.as_str(),
        fields.platform.as_str(),
        fields.campaign.as_str(),
        fields.budget_code.as_str(),
        fields.agency.as_str(),
        fields.buying_platform.as_str(),
        fields.publisher.as_str(),
        fields.publisher_subsite.as_str(),
        fields.targeting.as_str(),
        fields.vertical.as_str(),
        fields.offer.as_str(),
        ams_id,
        format,
        fields.subtargeting.as_str(),
        fields.x_field.as_str(),
    ]
    .join(&PLACEMENT_SEPARATOR.to_string())
}

/// Landing-page URL enriched with the fixed, ordered UTM parameter set.
/// Empty when no landing page was provided.
pub fn click_tag(fields: &CampaignFields, ams_id: &str) -> String {
    if fields.lp_url.is_empty() {
        return String::new();
    }
    format!(
        "{}?source={}&utm_medium=display&utm_source={}&utm_campaign={}&review=true",
        fields.lp_url,
        ams_id,
        fields.publisher.to_lowercase(),
        fields.campaign.to_lowercase()
    )
}

/// Assemble one output row from validated fields, an allocated AMS ID and a
/// creative format. Deterministic: identical inputs produce byte-identical
/// URLs. Lookup misses are warnings on the result, never failures.
pub fn assemble(
    fields: &CampaignFields,
    ams_id: &str,
    format: &str,
    tables: &LookupTables,
) -> LinkResult {
    let mut warnings = Vec::new();

    let network_key = fields.network_key();
    let network_entry = tables.network_entry(&network_key);
    if network_entry.is_none() {
        warnings.push(format!(
            "no network entry for key '{network_key}'; emitting base URLs without templates"
        ));
    }

    let app_key = fields.app_key();
    let app_entry = tables.app_entry(&app_key);
    if app_entry.is_none() {
        warnings.push(format!(
            "no app entry for key '{app_key}'; using default base URLs"
        ));
    }
    let (click_base, imp_base) = app_entry
        .map(|e| (e.click.as_str(), e.imp.as_str()))
        .unwrap_or((DEFAULT_CLICK_BASE, DEFAULT_IMP_BASE));

    let platform_lower = fields.platform.to_lowercase();
    let mut click_key = format!("{platform_lower}click");
    let imp_key = format!("{platform_lower}imp");
    let mut suppress_impression = false;
    for rule in CLICK_KEY_OVERRIDES {
        if click_key == rule.trigger {
            click_key = rule.replacement.to_string();
            suppress_impression = rule.suppress_impression;
            break;
        }
    }

    let code = placement_code(fields, ams_id, format);
    let tag = click_tag(fields, ams_id);

    let mut values = fields.placeholder_values();
    values.push(("ams_id", ams_id));
    values.push(("format", format));

    let click_template = network_entry
        .and_then(|e| e.template(&click_key))
        .map(|t| substitute_placeholders(t, &values))
        .unwrap_or_default();
    let imp_template = network_entry
        .and_then(|e| e.template(&imp_key))
        .map(|t| substitute_placeholders(t, &values))
        .unwrap_or_default();

    let tracking_params = format!("&c={code}&af_sub4={ams_id}");

    let appsflyer_click = if click_template.is_empty() {
        click_base.to_string()
    } else {
        let mut url = format!("{click_base}{click_template}{tracking_params}");
        if !tag.is_empty() {
            let encoded = utf8_percent_encode(&tag, NON_ALPHANUMERIC).to_string();
            url.push_str(&format!(
                "&af_dp={encoded}&af_ios_url={encoded}&af_web_dp={encoded}"
            ));
        }
        url
    };

    let appsflyer_imp = if suppress_impression {
        String::new()
    } else if imp_template.is_empty() {
        imp_base.to_string()
    } else {
        format!("{imp_base}{imp_template}{tracking_params}")
    };

    LinkResult {
        placement_code: code,
        click_tag: tag,
        appsflyer_click,
        appsflyer_imp,
        warnings,
    }
}

// ─── Batch pipeline ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub input: String,
    pub placement_code: String,
    pub click_tag: String,
    pub appsflyer_click: String,
    pub appsflyer_imp: String,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl ReportRow {
    fn link(input: &str, result: LinkResult) -> Self {
        Self {
            input: input.to_string(),
            placement_code: result.placement_code,
            click_tag: result.click_tag,
            appsflyer_click: result.appsflyer_click,
            appsflyer_imp: result.appsflyer_imp,
            warnings: result.warnings,
            error: None,
        }
    }

    fn errored(input: &str, error: String) -> Self {
        Self {
            input: input.to_string(),
            placement_code: ROW_ERROR_MARKER.to_string(),
            click_tag: error.clone(),
            appsflyer_click: String::new(),
            appsflyer_imp: String::new(),
            warnings: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: Vec<ReportRow>,
    /// Set when allocation or pool persistence failed; rows emitted before
    /// the failure are kept.
    pub batch_error: Option<String>,
}

enum LineFailure {
    Row(String),
    Batch(String),
}

pub struct LinkPipeline {
    tables: LookupTables,
    store: AmsIdStore,
    extractor: Box<dyn FieldExtractor>,
}

impl LinkPipeline {
    pub fn new(tables: LookupTables, store: AmsIdStore, extractor: Box<dyn FieldExtractor>) -> Self {
        Self {
            tables,
            store,
            extractor,
        }
    }

    /// Process descriptions sequentially, one to completion before the next.
    /// Blank lines are skipped. Row failures are isolated; an allocation or
    /// persistence failure aborts the remaining lines.
    pub async fn run_batch(&self, lines: &[String]) -> BatchReport {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut rows = Vec::new();
        let mut batch_error = None;

        for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            match self.process_line(line).await {
                Ok(line_rows) => rows.extend(line_rows),
                Err(LineFailure::Row(message)) => {
                    warn!(input = line, %message, "row failed");
                    rows.push(ReportRow::errored(line, message));
                }
                Err(LineFailure::Batch(message)) => {
                    warn!(input = line, %message, "batch aborted");
                    rows.push(ReportRow::errored(line, message.clone()));
                    batch_error = Some(message);
                    break;
                }
            }
        }

        let finished_at = Utc::now();
        info!(
            %run_id,
            rows = rows.len(),
            errored = rows.iter().filter(|r| r.error.is_some()).count(),
            extractor = self.extractor.extractor_id(),
            "batch complete"
        );
        BatchReport {
            run_id,
            started_at,
            finished_at,
            rows,
            batch_error,
        }
    }

    async fn process_line(&self, line: &str) -> Result<Vec<ReportRow>, LineFailure> {
        let raw = self
            .extractor
            .extract(line)
            .await
            .map_err(|e| LineFailure::Row(RowError::Extraction(e.to_string()).to_string()))?;

        let mut fields = raw
            .into_fields()
            .map_err(|e| LineFailure::Row(e.to_string()))?;
        normalize_fields(&mut fields);

        let campaign_type = classify_campaign(line);
        let ams_ids = self
            .store
            .allocate(campaign_type.partition(), fields.formats.len())
            .await
            .map_err(|e| match e {
                StoreError::InsufficientIds { .. } => LineFailure::Batch(e.to_string()),
                // Pool unreadable or unwritable: consumption state unknown,
                // stop the batch rather than guessing.
                StoreError::Read { .. } | StoreError::Parse { .. } | StoreError::Persist { .. } => {
                    LineFailure::Batch(e.to_string())
                }
            })?;

        let rows = fields
            .formats
            .iter()
            .zip(ams_ids.iter())
            .map(|(format, ams_id)| {
                let result = assemble(&fields, ams_id, format, &self.tables);
                for warning in &result.warnings {
                    warn!(input = line, %warning, "lookup soft-fail");
                }
                ReportRow::link(line, result)
            })
            .collect();
        Ok(rows)
    }
}

// ─── Reports ───────────────────────────────────────────────────────────────

pub const CSV_HEADER: [&str; 5] = [
    "Input",
    "Placement Code",
    "Click Tag",
    "Appsflyer Click",
    "Appsflyer IMP",
];

pub fn render_csv(report: &BatchReport) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER).context("writing csv header")?;
    for row in &report.rows {
        writer
            .write_record([
                row.input.as_str(),
                row.placement_code.as_str(),
                row.click_tag.as_str(),
                row.appsflyer_click.as_str(),
                row.appsflyer_imp.as_str(),
            ])
            .context("writing csv row")?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing csv writer: {e}"))?;
    String::from_utf8(bytes).context("csv output was not utf-8")
}

/// Write `links.csv` + `report.json` under `<reports_dir>/<run_id>/`.
pub async fn write_reports(report: &BatchReport, reports_dir: &PathBuf) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let csv_text = render_csv(report)?;
    fs::write(run_dir.join("links.csv"), csv_text)
        .await
        .context("writing links.csv")?;

    let json_bytes = serde_json::to_vec_pretty(report).context("serializing report")?;
    fs::write(run_dir.join("report.json"), json_bytes)
        .await
        .context("writing report.json")?;

    Ok(run_dir)
}

// ─── Configuration ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorKind {
    OpenAi,
    Fixture,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network_index: PathBuf,
    pub app_index: PathBuf,
    pub pool_path: PathBuf,
    pub reports_dir: PathBuf,
    pub extractor: ExtractorKind,
    pub fixture_path: PathBuf,
    pub openai_endpoint: String,
    pub openai_model: String,
    pub openai_api_key: String,
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            network_index: std::env::var("CLG_NETWORK_INDEX")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("networkindex.json")),
            app_index: std::env::var("CLG_APP_INDEX")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("appindex.json")),
            pool_path: std::env::var("CLG_POOL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("amsids.json")),
            reports_dir: std::env::var("CLG_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            extractor: match std::env::var("CLG_EXTRACTOR").as_deref() {
                Ok("fixture") => ExtractorKind::Fixture,
                _ => ExtractorKind::OpenAi,
            },
            fixture_path: std::env::var("CLG_EXTRACTIONS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("extractions.json")),
            openai_endpoint: std::env::var("CLG_OPENAI_ENDPOINT")
                .unwrap_or_else(|_| clg_extract::DEFAULT_ENDPOINT.to_string()),
            openai_model: std::env::var("CLG_MODEL")
                .unwrap_or_else(|_| clg_extract::DEFAULT_MODEL.to_string()),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            http_timeout_secs: std::env::var("CLG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn build_extractor(&self) -> Result<Box<dyn FieldExtractor>> {
        match self.extractor {
            ExtractorKind::Fixture => Ok(Box::new(
                FixtureExtractor::from_path(&self.fixture_path)
                    .context("loading fixture extractions")?,
            )),
            ExtractorKind::OpenAi => {
                let mut config = OpenAiConfig::new(self.openai_api_key.clone());
                config.endpoint = self.openai_endpoint.clone();
                config.model = self.openai_model.clone();
                config.timeout = std::time::Duration::from_secs(self.http_timeout_secs);
                Ok(Box::new(
                    OpenAiExtractor::new(config).context("building extraction client")?,
                ))
            }
        }
    }

    pub fn build_pipeline(&self) -> Result<LinkPipeline> {
        let tables = LookupTables::load(&self.network_index, &self.app_index)
            .context("loading lookup tables")?;
        let store = AmsIdStore::new(&self.pool_path);
        Ok(LinkPipeline::new(tables, store, self.build_extractor()?))
    }
}
