use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use contact_geocoder::{AppConfig, AppError, AppState, REQUIRED_COLUMNS};

fn csv_with_rows(rows: &[&str]) -> String {
    let mut text = REQUIRED_COLUMNS.join(",");
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

fn config_for(server: &Server, diagnostics_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        geocoder_endpoint: server.url("/search").to_string(),
        retry_delay_ms: 1,
        batch_size: 2,
        worker_pool_size: 2,
        diagnostics_dir: diagnostics_dir.to_string_lossy().into_owned(),
        ..AppConfig::default()
    }
}

fn expect_query(query: &'static str, times: usize) -> httptest::ExpectationBuilder {
    Expectation::matching(all_of![
        request::method("GET"),
        request::path("/search"),
        request::query(url_decoded(contains(("q", query)))),
    ])
    .times(times..=times)
}

#[tokio::test]
async fn enriches_rows_against_http_geocoder() {
    let server = Server::run();
    server.expect(
        expect_query("Sydney, NSW, 2000", 3)
            .respond_with(json_encoded(json!([{ "lat": "-33.8688", "lon": "151.2093" }]))),
    );
    server.expect(
        expect_query("Ambleside, TAS, 7310", 1)
            .respond_with(json_encoded(json!([{ "lat": "-37.939795", "lon": "146.404623" }]))),
    );
    server.expect(expect_query("Nowhere, WA, 6999", 1).respond_with(json_encoded(json!([]))));
    server.expect(expect_query("Outage, QLD, 4000", 3).respond_with(status_code(503)));

    let dir = tempdir().unwrap();
    let input = dir.path().join("contacts.csv");
    let output = dir.path().join("out").join("clean.csv");
    std::fs::write(
        &input,
        csv_with_rows(&[
            "colton_tromp@gmail.com,Darcy,Waters,1 George St,Sydney,NSW,2000.0,PO Box 7,Ambleside,TAS,7310",
            "nova@example.com,Nova,Reyes,2 George St,Sydney,NSW,2000,PO Box 9,Nowhere,WA,6999",
            "not-an-email,Bad,Row,3 George St,Sydney,NSW,2000,PO Box 1,Sydney,NSW,2000",
            "ops@example.com,Ops,Team,4 Main Rd,Outage,QLD,4000,PO Box 3,Sydney,NSW,2000",
        ]),
    )
    .unwrap();

    let diagnostics_dir = dir.path().join("diagnostics");
    let state = AppState::initialize(config_for(&server, &diagnostics_dir)).unwrap();
    let report = state.run(&input, &output).await.unwrap();

    let cleaning = report.cleaning.as_ref().unwrap();
    assert_eq!(cleaning.read, 4);
    assert_eq!(cleaning.kept, 3);
    assert_eq!(report.survivors, 1);
    assert_eq!(report.excluded, 2);
    assert_eq!(report.residential.tally.failed, 1);
    assert_eq!(report.postal.tally.not_found, 1);
    assert!(!report.degraded);

    let written = std::fs::read_to_string(&output).unwrap();
    let lines = written.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("colton_tromp@gmail.com,Darcy,Waters"));
    assert!(lines[1].contains("\"(-37.939795, 146.404623)\",\"(-33.8688, 151.2093)\""));

    let logs = std::fs::read_dir(&diagnostics_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(logs.len(), 1);
    let diagnostics = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(diagnostics.contains("lookup_not_found"));
    assert!(diagnostics.contains("lookup_exhausted"));
    assert!(diagnostics.contains("run_start"));
    assert!(diagnostics.contains("run_summary"));
    assert!(!diagnostics.contains("Outage"));
}

#[tokio::test]
async fn unreachable_service_still_writes_empty_output() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/search"))
            .times(..)
            .respond_with(status_code(500)),
    );

    let dir = tempdir().unwrap();
    let input = dir.path().join("contacts.csv");
    let output = dir.path().join("clean.csv");
    std::fs::write(
        &input,
        csv_with_rows(&[
            "a@example.com,Ann,Lee,1 High St,Perth,WA,6000,1 High St,Perth,WA,6000",
            "b@example.com,Bo,Kim,2 High St,Hobart,TAS,7000,2 High St,Hobart,TAS,7000",
        ]),
    )
    .unwrap();

    let state = AppState::initialize(config_for(&server, &dir.path().join("diag"))).unwrap();
    let report = state.run(&input, &output).await.unwrap();

    assert_eq!(report.survivors, 0);
    assert!(report.degraded);
    assert!(report.service_unavailable);
    assert_eq!(report.residential.tally.failed, 2);
    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written.lines().count(), 1);
}

#[tokio::test]
async fn rejects_file_without_required_columns() {
    let server = Server::run();
    let dir = tempdir().unwrap();
    let input = dir.path().join("contacts.csv");
    std::fs::write(&input, "Email,First Name\na@example.com,Ann\n").unwrap();

    let state = AppState::initialize(config_for(&server, &dir.path().join("diag"))).unwrap();
    let result = state.run(&input, &dir.path().join("clean.csv")).await;

    assert!(matches!(result, Err(AppError::Input(_))));
    assert!(!dir.path().join("clean.csv").exists());
}
