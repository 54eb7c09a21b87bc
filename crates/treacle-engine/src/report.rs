//! Statistics sinks.
//!
//! The scheduler emits one [`StatusSample`] per elapsed second; every
//! configured dumper renders the same series its own way. CSV is a flat
//! table, HTML is a self-contained page that draws the series with the
//! Google Charts loader. The availability column is rendered as the pool
//! size when the probe says the service answered and as 0 when it looks
//! DoSed, so the area chart reads at a glance.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use treacle_common::{AttackMode, ProxyMode, TestConfig};

use crate::error::SetupError;

/// Connection-state census taken once per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusSample {
    pub seconds: u64,
    pub closed: usize,
    pub pending: usize,
    pub connected: usize,
    pub service_available: bool,
}

pub trait StatsDumper {
    fn open(&mut self) -> io::Result<()>;
    fn write_sample(&mut self, sample: &StatusSample) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    fn path(&self) -> &Path;
}

const CSV_HEADER: &str = "Seconds,Closed,Pending,Connected,Service Available\n";

pub struct CsvDumper {
    path: PathBuf,
    pool_size: usize,
    file: Option<File>,
}

impl CsvDumper {
    pub fn new(path: PathBuf, pool_size: usize) -> Self {
        CsvDumper { path, pool_size, file: None }
    }
}

impl StatsDumper for CsvDumper {
    fn open(&mut self) -> io::Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(CSV_HEADER.as_bytes())?;
        self.file = Some(file);
        Ok(())
    }

    fn write_sample(&mut self, sample: &StatusSample) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let available = if sample.service_available { self.pool_size } else { 0 };
        writeln!(
            file,
            "{},{},{},{},{}",
            sample.seconds, sample.closed, sample.pending, sample.connected, available
        )
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

const HTML_HEADER: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <style>
      body { font: 12px/18px "Lucida Grande", Helvetica, Arial, Verdana, sans-serif; color: #333; }
      .slow_results { font-size: 12px; }
    </style>
    <script type="text/javascript" src="https://www.gstatic.com/charts/loader.js"></script>
    <script type="text/javascript">
      google.charts.load('current', {packages: ['corechart']});
      google.charts.setOnLoadCallback(drawChart);
      function drawChart() {
        var data = new google.visualization.DataTable();
        data.addColumn('string', 'Seconds');
        data.addColumn('number', 'Closed');
        data.addColumn('number', 'Pending');
        data.addColumn('number', 'Connected');
        data.addColumn('number', 'Service available');
        data.addRows([
"#;

pub struct HtmlDumper {
    path: PathBuf,
    url: String,
    test_info: String,
    pool_size: usize,
    file: Option<File>,
}

impl HtmlDumper {
    pub fn new(path: PathBuf, url: String, test_info: String, pool_size: usize) -> Self {
        HtmlDumper {
            path,
            url,
            test_info,
            pool_size,
            file: None,
        }
    }

    fn footer(&self) -> String {
        format!(
            r#"        ]);
        var chart = new google.visualization.AreaChart(document.getElementById('chart_div'));
        chart.draw(data, {{
          width: 600, height: 360,
          title: 'Test results against {url}',
          hAxis: {{title: 'Seconds', titleTextStyle: {{color: '#FF0000'}}}},
          vAxis: {{title: 'Connections', titleTextStyle: {{color: '#FF0000'}}, viewWindowMode: 'maximized'}}
        }});
      }}
    </script>
    <title>treacle connection results</title>
  </head>
  <body>
    <p>{info}</p>
    <div id="chart_div"></div>
  </body>
</html>
"#,
            url = self.url,
            info = self.test_info
        )
    }
}

impl StatsDumper for HtmlDumper {
    fn open(&mut self) -> io::Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(HTML_HEADER.as_bytes())?;
        self.file = Some(file);
        Ok(())
    }

    fn write_sample(&mut self, sample: &StatusSample) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        // The seconds column is a string so the axis labels stay discrete.
        let available = if sample.service_available { self.pool_size } else { 0 };
        writeln!(
            file,
            "          ['{}', {}, {}, {}, {}],",
            sample.seconds, sample.closed, sample.pending, sample.connected, available
        )
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(self.footer().as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// `slow_<local timestamp>`, the prefix used when `-g` is given without `-o`.
pub fn default_prefix() -> String {
    chrono::Local::now().format("slow_%Y-%m-%d_%H-%M-%S").to_string()
}

/// Parameters table embedded in the HTML report.
pub fn test_info_table(config: &TestConfig, pool_size: usize) -> String {
    let proxy = match config.proxy.mode {
        ProxyMode::None => "no proxy".to_string(),
        mode => {
            let addr = match mode {
                ProxyMode::Probe => config.proxy.probe_address.as_deref(),
                _ => config.proxy.address.as_deref(),
            };
            format!("{} at {}", mode, addr.unwrap_or("?"))
        }
    };
    if config.mode == AttackMode::SlowRead {
        format!(
            "<table class='slow_results' border='0'>\
             <tr><th>Test parameters</th></tr>\
             <tr><td><b>Test type</b></td><td>{}</td></tr>\
             <tr><td><b>Number of connections</b></td><td>{}</td></tr>\
             <tr><td><b>Receive window range</b></td><td>{} - {}</td></tr>\
             <tr><td><b>Pipeline factor</b></td><td>{}</td></tr>\
             <tr><td><b>Read rate from receive buffer</b></td><td>{} bytes / {} sec</td></tr>\
             <tr><td><b>Connections per second</b></td><td>{}</td></tr>\
             <tr><td><b>Timeout for probe connection</b></td><td>{}</td></tr>\
             <tr><td><b>Target test duration</b></td><td>{} seconds</td></tr>\
             <tr><td><b>Using proxy</b></td><td>{}</td></tr>\
             </table>",
            config.mode,
            pool_size,
            config.slow_read.window_lower,
            config.slow_read.window_upper,
            config.slow_read.pipeline_factor,
            config.slow_read.read_len,
            config.slow_read.read_interval,
            config.rate,
            config.probe.timeout,
            config.duration,
            proxy
        )
    } else {
        format!(
            "<table class='slow_results' border='0'>\
             <tr><th>Test parameters</th></tr>\
             <tr><td><b>Test type</b></td><td>{}</td></tr>\
             <tr><td><b>Number of connections</b></td><td>{}</td></tr>\
             <tr><td><b>Verb</b></td><td>{}</td></tr>\
             <tr><td><b>Content-Length header value</b></td><td>{}</td></tr>\
             <tr><td><b>Random token max length</b></td><td>{}</td></tr>\
             <tr><td><b>Interval between follow up data</b></td><td>{} seconds</td></tr>\
             <tr><td><b>Connections per second</b></td><td>{}</td></tr>\
             <tr><td><b>Timeout for probe connection</b></td><td>{}</td></tr>\
             <tr><td><b>Target test duration</b></td><td>{} seconds</td></tr>\
             <tr><td><b>Using proxy</b></td><td>{}</td></tr>\
             </table>",
            config.mode,
            pool_size,
            config.effective_verb(),
            config.body.content_length,
            config.max_random_len,
            config.follow_up_interval,
            config.rate,
            config.probe.timeout,
            config.duration,
            proxy
        )
    }
}

/// Builds and opens every dumper the configuration asks for. Returns an
/// empty set when reporting is disabled.
pub fn build_dumpers(
    config: &TestConfig,
    target_url: &str,
    pool_size: usize,
) -> Result<Vec<Box<dyn StatsDumper>>, SetupError> {
    let mut dumpers: Vec<Box<dyn StatsDumper>> = Vec::new();
    if !config.report.enabled {
        return Ok(dumpers);
    }
    let prefix = config
        .report
        .prefix
        .clone()
        .unwrap_or_else(default_prefix);
    if config.report.format.wants_html() {
        dumpers.push(Box::new(HtmlDumper::new(
            PathBuf::from(format!("{prefix}.html")),
            target_url.to_string(),
            test_info_table(config, pool_size),
            pool_size,
        )));
    }
    if config.report.format.wants_csv() {
        dumpers.push(Box::new(CsvDumper::new(
            PathBuf::from(format!("{prefix}.csv")),
            pool_size,
        )));
    }
    for dumper in dumpers.iter_mut() {
        dumper.open().map_err(|source| SetupError::Report {
            path: dumper.path().display().to_string(),
            source,
        })?;
    }
    Ok(dumpers)
}
