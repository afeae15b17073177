//! End-to-end batch runs against the workspace fixtures. The pool file is
//! copied into a tempdir before each run so allocations never mutate the
//! committed fixture.

use std::path::{Path, PathBuf};

use clg_engine::{write_reports, LinkPipeline};
use clg_extract::FixtureExtractor;
use clg_store::{AmsIdStore, LookupTables};
use tempfile::tempdir;

const DISPLAY_LINE: &str = "Display campaign in UK for PS on Reddit, format VOD6";
const PAIDSOCIAL_LINE: &str = "Paid social burst for PS in UK on Reddit, formats VOD6 and 320x50";
const AFFILIATE_LINE: &str = "Affiliate social push for PS in Canada on Spotify, three video formats";
const BAD_LINE: &str = "Mystery campaign with no agency";

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixtures_dir() -> PathBuf {
    workspace_root().join("fixtures")
}

fn pipeline_with_pool(dir: &Path) -> (LinkPipeline, PathBuf) {
    let pool_path = dir.join("amsids.json");
    std::fs::copy(fixtures_dir().join("amsids.json"), &pool_path).expect("copying pool fixture");
    let tables = LookupTables::load(
        fixtures_dir().join("networkindex.json"),
        fixtures_dir().join("appindex.json"),
    )
    .expect("loading lookup tables");
    let extractor =
        FixtureExtractor::from_path(fixtures_dir().join("extractions.json")).expect("extractions");
    let pipeline = LinkPipeline::new(tables, AmsIdStore::new(&pool_path), Box::new(extractor));
    (pipeline, pool_path)
}

fn unused_ids(pool_path: &Path, partition: &str) -> Vec<String> {
    let pool: clg_store::AmsIdPool =
        serde_json::from_str(&std::fs::read_to_string(pool_path).unwrap()).unwrap();
    pool[partition]
        .iter()
        .filter(|r| !r.used)
        .map(|r| r.id.clone())
        .collect()
}

#[tokio::test]
async fn display_line_matches_documented_example() {
    let dir = tempdir().unwrap();
    let (pipeline, pool_path) = pipeline_with_pool(dir.path());

    let report = pipeline.run_batch(&[DISPLAY_LINE.to_string()]).await;
    assert!(report.batch_error.is_none());
    assert_eq!(report.rows.len(), 1);

    let row = &report.rows[0];
    assert_eq!(row.error, None);
    assert_eq!(
        row.placement_code,
        "PS-UK-DIS-STARSSEASON-G-TSG-DIRECT-REDDIT-RON-ALL-POKER-GENERIC-19975101-VOD6-P-X"
    );
    // DIS rides the Android click template with no impression pixel.
    assert!(row.appsflyer_click.contains("pid=reddit_int"));
    assert!(row.appsflyer_imp.is_empty());
    assert!(row.click_tag.starts_with("https://www.pokerstars.uk/"));
    assert!(row.click_tag.contains("source=19975101"));

    assert_eq!(
        unused_ids(&pool_path, "display"),
        vec!["19975102".to_string(), "19975103".to_string()]
    );
}

#[tokio::test]
async fn one_row_and_one_id_per_requested_format() {
    let dir = tempdir().unwrap();
    let (pipeline, pool_path) = pipeline_with_pool(dir.path());

    let report = pipeline.run_batch(&[PAIDSOCIAL_LINE.to_string()]).await;
    assert!(report.batch_error.is_none());
    assert_eq!(report.rows.len(), 2);
    assert!(report.rows[0].placement_code.contains("-30001-VOD6-"));
    assert!(report.rows[1].placement_code.contains("-30002-320x50-"));
    // No app entry for PS-UK-AND: warned, defaults used, row still emitted.
    assert!(report.rows[0]
        .warnings
        .iter()
        .any(|w| w.contains("PS-UK-AND")));
    // Empty landing page: no click tag, no deep-link params.
    assert!(report.rows[0].click_tag.is_empty());
    assert!(!report.rows[0].appsflyer_click.contains("af_dp="));

    assert!(unused_ids(&pool_path, "paidsocial").is_empty());
}

#[tokio::test]
async fn row_failures_are_isolated() {
    let dir = tempdir().unwrap();
    let (pipeline, _pool) = pipeline_with_pool(dir.path());

    let report = pipeline
        .run_batch(&[
            BAD_LINE.to_string(),
            "line the extractor has never seen".to_string(),
            DISPLAY_LINE.to_string(),
        ])
        .await;

    assert!(report.batch_error.is_none());
    assert_eq!(report.rows.len(), 3);
    assert_eq!(report.rows[0].placement_code, "ERROR");
    assert!(report.rows[0]
        .error
        .as_deref()
        .unwrap()
        .contains("missing required fields: agency"));
    assert_eq!(report.rows[1].placement_code, "ERROR");
    assert!(report.rows[1]
        .error
        .as_deref()
        .unwrap()
        .contains("extraction failed"));
    assert_eq!(report.rows[2].error, None);
}

#[tokio::test]
async fn insufficient_ids_abort_batch_and_leave_pool_untouched() {
    let dir = tempdir().unwrap();
    let (pipeline, pool_path) = pipeline_with_pool(dir.path());

    // Affiliate wins the affiliate-before-social tie-break, and the
    // affiliate partition only holds two ids for three requested formats.
    let report = pipeline
        .run_batch(&[AFFILIATE_LINE.to_string(), DISPLAY_LINE.to_string()])
        .await;

    let batch_error = report.batch_error.expect("batch error");
    assert!(batch_error.contains("insufficient identifiers"));
    assert!(batch_error.contains("affiliate"));
    // The failed line is reported; the remaining line was never processed.
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].placement_code, "ERROR");

    assert_eq!(
        unused_ids(&pool_path, "affiliate"),
        vec!["40001".to_string(), "40002".to_string()]
    );
    assert_eq!(unused_ids(&pool_path, "display").len(), 3);
}

#[tokio::test]
async fn sequential_batches_never_reissue_ids() {
    let dir = tempdir().unwrap();
    let (pipeline, pool_path) = pipeline_with_pool(dir.path());

    let first = pipeline.run_batch(&[DISPLAY_LINE.to_string()]).await;
    let second = pipeline.run_batch(&[DISPLAY_LINE.to_string()]).await;

    assert!(first.rows[0].placement_code.contains("-19975101-"));
    assert!(second.rows[0].placement_code.contains("-19975102-"));
    assert_eq!(unused_ids(&pool_path, "display"), vec!["19975103".to_string()]);
}

#[tokio::test]
async fn reports_are_written_under_the_run_directory() {
    let dir = tempdir().unwrap();
    let (pipeline, _pool) = pipeline_with_pool(dir.path());

    let report = pipeline.run_batch(&[DISPLAY_LINE.to_string()]).await;
    let reports_dir = dir.path().join("reports");
    let run_dir = write_reports(&report, &reports_dir).await.expect("reports");

    assert_eq!(run_dir, reports_dir.join(report.run_id.to_string()));
    let csv_text = std::fs::read_to_string(run_dir.join("links.csv")).unwrap();
    assert!(csv_text
        .starts_with("Input,Placement Code,Click Tag,Appsflyer Click,Appsflyer IMP"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("report.json")).unwrap())
            .unwrap();
    assert_eq!(json["rows"].as_array().unwrap().len(), 1);
    assert!(json["batch_error"].is_null());
}
