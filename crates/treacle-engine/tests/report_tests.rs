use std::fs;
use std::path::PathBuf;

use treacle_common::{AttackMode, ProxyMode, TestConfig};
use treacle_engine::report::{
    build_dumpers, default_prefix, test_info_table, CsvDumper, HtmlDumper, StatsDumper,
    StatusSample,
};

fn temp_path(tag: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("treacle_{}_{}.{}", tag, std::process::id(), ext))
}

fn sample(seconds: u64, closed: usize, pending: usize, connected: usize, available: bool) -> StatusSample {
    StatusSample {
        seconds,
        closed,
        pending,
        connected,
        service_available: available,
    }
}

#[test]
fn test_csv_dumper_renders_one_row_per_second() {
    let path = temp_path("csv", "csv");
    let mut dumper = CsvDumper::new(path.clone(), 30);
    dumper.open().unwrap();
    dumper.write_sample(&sample(0, 0, 2, 0, true)).unwrap();
    dumper.write_sample(&sample(1, 1, 3, 24, false)).unwrap();
    dumper.close().unwrap();

    let text = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).ok();

    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("Seconds,Closed,Pending,Connected,Service Available")
    );
    // availability renders as the pool size, or 0 when the service is DoSed
    assert_eq!(lines.next(), Some("0,0,2,0,30"));
    assert_eq!(lines.next(), Some("1,1,3,24,0"));
    assert_eq!(lines.next(), None);
}

#[test]
fn test_csv_dumper_path_accessor() {
    let path = temp_path("csv_path", "csv");
    let dumper = CsvDumper::new(path.clone(), 10);
    assert_eq!(dumper.path(), path.as_path());
}

#[test]
fn test_html_dumper_builds_a_selfcontained_page() {
    let path = temp_path("html", "html");
    let mut dumper = HtmlDumper::new(
        path.clone(),
        "http://victim.example/".to_string(),
        "<table>params</table>".to_string(),
        50,
    );
    dumper.open().unwrap();
    dumper.write_sample(&sample(0, 0, 1, 0, true)).unwrap();
    dumper.write_sample(&sample(5, 2, 0, 48, false)).unwrap();
    dumper.close().unwrap();

    let text = fs::read_to_string(&path).unwrap();
    fs::remove_file(&path).ok();

    assert!(text.starts_with("<!DOCTYPE html>"));
    assert!(text.contains("gstatic.com/charts/loader.js"));
    assert!(text.contains("data.addColumn('string', 'Seconds');"));
    assert!(text.contains("['0', 0, 1, 0, 50],"));
    assert!(text.contains("['5', 2, 0, 48, 0],"));
    assert!(text.contains("Test results against http://victim.example/"));
    assert!(text.contains("<table>params</table>"));
    assert!(text.trim_end().ends_with("</html>"));
}

#[test]
fn test_default_prefix_is_timestamped() {
    let prefix = default_prefix();
    assert!(prefix.starts_with("slow_"));
    // slow_YYYY-mm-dd_HH-MM-SS
    assert_eq!(prefix.len(), "slow_2026-01-01_00-00-00".len());
}

#[test]
fn test_info_table_for_header_mode() {
    let config = TestConfig::default();
    let table = test_info_table(&config, 50);
    assert!(table.contains("SLOW HEADERS"));
    assert!(table.contains("<b>Verb</b></td><td>GET</td>"));
    assert!(table.contains("Interval between follow up data"));
    assert!(table.contains("no proxy"));
    assert!(!table.contains("Pipeline factor"));
}

#[test]
fn test_info_table_for_slow_read_mode() {
    let mut config = TestConfig::default();
    config.mode = AttackMode::SlowRead;
    let table = test_info_table(&config, 50);
    assert!(table.contains("SLOW READ"));
    assert!(table.contains("Receive window range"));
    assert!(table.contains("Pipeline factor"));
    assert!(table.contains("Read rate from receive buffer"));
    assert!(!table.contains("<b>Verb</b>"));
}

#[test]
fn test_info_table_names_the_proxy() {
    let mut config = TestConfig::default();
    config.proxy.mode = ProxyMode::Http;
    config.proxy.address = Some("127.0.0.1:3128".to_string());
    let table = test_info_table(&config, 50);
    assert!(table.contains("HTTP proxy at 127.0.0.1:3128"));

    let mut config = TestConfig::default();
    config.proxy.mode = ProxyMode::Probe;
    config.proxy.probe_address = Some("10.0.0.1:8080".to_string());
    let table = test_info_table(&config, 50);
    assert!(table.contains("probe proxy at 10.0.0.1:8080"));
}

#[test]
fn test_build_dumpers_disabled_by_default() {
    let config = TestConfig::default();
    let dumpers = build_dumpers(&config, "http://victim.example/", 50).unwrap();
    assert!(dumpers.is_empty());
}

#[test]
fn test_build_dumpers_creates_html_then_csv() {
    let prefix = std::env::temp_dir().join(format!("treacle_report_{}", std::process::id()));
    let mut config = TestConfig::default();
    config.report.enabled = true;
    config.report.prefix = Some(prefix.to_string_lossy().into_owned());

    let mut dumpers = build_dumpers(&config, "http://victim.example/", 50).unwrap();
    assert_eq!(dumpers.len(), 2);
    assert_eq!(dumpers[0].path().extension().unwrap(), "html");
    assert_eq!(dumpers[1].path().extension().unwrap(), "csv");

    // open() already ran; both files exist on disk
    for dumper in dumpers.iter_mut() {
        assert!(dumper.path().exists());
        dumper.close().unwrap();
    }
    for dumper in dumpers.iter() {
        fs::remove_file(dumper.path()).ok();
    }
}

#[test]
fn test_build_dumpers_honors_csv_only_format() {
    let prefix = std::env::temp_dir().join(format!("treacle_csvonly_{}", std::process::id()));
    let mut config = TestConfig::default();
    config.report.enabled = true;
    config.report.format = treacle_common::ReportFormat::Csv;
    config.report.prefix = Some(prefix.to_string_lossy().into_owned());

    let dumpers = build_dumpers(&config, "http://victim.example/", 50).unwrap();
    assert_eq!(dumpers.len(), 1);
    assert_eq!(dumpers[0].path().extension().unwrap(), "csv");
    fs::remove_file(dumpers[0].path()).ok();
}
