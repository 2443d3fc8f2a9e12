//! Streaming output: text on stdout, CSV or a JSON array.

use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::SecondsFormat;
use serde::Serialize;

use crate::config::OutputTarget;
use crate::serp::{Link, Serp};
use crate::{Result, ScrapeError};

/// CSV columns, in order.
pub const CSV_HEADER: [&str; 11] = [
    "link",
    "title",
    "snippet",
    "visible_link",
    "num_results",
    "query",
    "search_engine_name",
    "requested_by",
    "scrapemethod",
    "page_number",
    "requested_at",
];

type Sink = Box<dyn Write + Send>;

/// Writes SERPs as they arrive.
pub enum OutputWriter {
    Text(Sink),
    Csv(csv::Writer<Sink>),
    Json { out: Sink, written: usize },
}

#[derive(Serialize)]
struct JsonSerp<'a> {
    query: &'a str,
    search_engine_name: &'a str,
    scrapemethod: &'a str,
    page_number: u32,
    requested_at: String,
    requested_by: &'a str,
    num_results: u32,
    num_results_for_query: &'a str,
    effective_query: &'a str,
    no_results: bool,
    status: &'a str,
    results: &'a [Link],
}

fn csv_error(e: csv::Error) -> ScrapeError {
    ScrapeError::Sink(format!("CSV write failed: {}", e))
}

impl OutputWriter {
    /// Opens the configured target, writing the CSV header or JSON opener.
    pub fn open(target: &OutputTarget) -> Result<Self> {
        match target {
            OutputTarget::Stdout => Ok(Self::text(Box::new(std::io::stdout()))),
            OutputTarget::Csv(path) => Self::csv(Box::new(BufWriter::new(File::create(path)?))),
            OutputTarget::Json(path) => Self::json(Box::new(BufWriter::new(File::create(path)?))),
        }
    }

    pub fn text(out: Sink) -> Self {
        OutputWriter::Text(out)
    }

    pub fn csv(out: Sink) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(CSV_HEADER).map_err(csv_error)?;
        Ok(OutputWriter::Csv(writer))
    }

    pub fn json(mut out: Sink) -> Result<Self> {
        out.write_all(b"[")?;
        Ok(OutputWriter::Json { out, written: 0 })
    }

    pub fn write_serp(&mut self, serp: &Serp) -> Result<()> {
        match self {
            OutputWriter::Text(out) => write_text(out, serp),
            OutputWriter::Csv(writer) => {
                let requested_at = serp.requested_at.to_rfc3339_opts(SecondsFormat::Secs, true);
                let num_results = serp.num_results.to_string();
                let page_number = serp.page.to_string();
                for link in &serp.links {
                    writer
                        .write_record([
                            link.link.as_str(),
                            link.title.as_str(),
                            link.snippet.as_str(),
                            link.visible_link.as_str(),
                            num_results.as_str(),
                            serp.query.as_str(),
                            serp.engine.name(),
                            serp.requested_by.as_str(),
                            serp.method.tag(),
                            page_number.as_str(),
                            requested_at.as_str(),
                        ])
                        .map_err(csv_error)?;
                }
                Ok(())
            }
            OutputWriter::Json { out, written } => {
                if *written > 0 {
                    out.write_all(b",")?;
                }
                out.write_all(b"\n")?;
                let doc = JsonSerp {
                    query: &serp.query,
                    search_engine_name: serp.engine.name(),
                    scrapemethod: serp.method.tag(),
                    page_number: serp.page,
                    requested_at: serp.requested_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    requested_by: &serp.requested_by,
                    num_results: serp.num_results,
                    num_results_for_query: &serp.num_results_for_query,
                    effective_query: &serp.effective_query,
                    no_results: serp.no_results,
                    status: serp.status.as_str(),
                    results: &serp.links,
                };
                serde_json::to_writer_pretty(&mut *out, &doc)
                    .map_err(|e| ScrapeError::Sink(format!("JSON write failed: {}", e)))?;
                *written += 1;
                Ok(())
            }
        }
    }

    /// Closes the JSON array and flushes.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            OutputWriter::Text(out) => out.flush()?,
            OutputWriter::Csv(writer) => writer.flush()?,
            OutputWriter::Json { out, .. } => {
                out.write_all(b"\n]\n")?;
                out.flush()?;
            }
        }
        Ok(())
    }
}

fn write_text(out: &mut Sink, serp: &Serp) -> Result<()> {
    writeln!(
        out,
        "=== {} page {} for \"{}\" ({}, {} results{})",
        serp.engine,
        serp.page,
        serp.query,
        serp.requested_by,
        serp.num_results,
        if serp.num_results_for_query.is_empty() {
            String::new()
        } else {
            format!(", {}", serp.num_results_for_query)
        }
    )?;
    if serp.no_results {
        writeln!(out, "    no results")?;
    }
    if !serp.effective_query.is_empty() {
        writeln!(out, "    searched for: {}", serp.effective_query)?;
    }
    for link in &serp.links {
        writeln!(out, "{:>4}. [{}] {}", link.rank, link.link_type, link.title)?;
        writeln!(out, "      {}", link.link)?;
        if !link.snippet.is_empty() {
            writeln!(out, "      {}", link.snippet)?;
        }
    }
    Ok(())
}
