use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::*;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::probe::adapters::AdapterInfo;
use crate::probe::ProbeResult;

const MAX_FIELD_WIDTH: usize = 120;

pub struct OutputWriter {
    format: OutputFormat,
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, file: Option<PathBuf>) -> Self {
        Self { format, file }
    }

    pub fn write(&self, results: &[ProbeResult]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human => format_human(results),
            OutputFormat::Json => format_json(results)?,
            OutputFormat::Csv => format_csv(results),
        };
        self.emit(&output)
    }

    pub fn write_adapters(&self, adapters: &[AdapterInfo]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Human => format_adapters_human(adapters),
            OutputFormat::Json => serde_json::to_string_pretty(adapters)? + "\n",
            OutputFormat::Csv => format_adapters_csv(adapters),
        };
        self.emit(&output)
    }

    fn emit(&self, output: &str) -> Result<()> {
        match &self.file {
            Some(path) => {
                let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
                let mut writer = BufWriter::new(file);
                writer.write_all(output.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", output);
                io::stdout().flush()?;
            }
        }
        Ok(())
    }
}

/// Strings print bare, everything else as compact JSON.
fn render_value(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_FIELD_WIDTH {
        let cut: String = text.chars().take(MAX_FIELD_WIDTH).collect();
        format!("{}…", cut)
    } else {
        text
    }
}

pub fn format_human(results: &[ProbeResult]) -> String {
    let mut output = String::new();
    let succeeded = results.iter().filter(|r| r.success).count();

    for result in results {
        let target = format!("{}:{}/{}", result.host, result.port, result.transport);
        let timing = format!("{:.1}ms", result.elapsed_ms);

        match &result.error {
            None => {
                output.push_str(&format!(
                    "{} {} {} {}\n",
                    "●".truecolor(0, 255, 65).bold(),
                    result.protocol.truecolor(255, 255, 255).bold(),
                    target.truecolor(0, 212, 255),
                    timing.truecolor(128, 128, 128)
                ));
                if let Some(rtt) = result.rtt_ms {
                    output.push_str(&format!("    {} {:.1}ms\n", "rtt".truecolor(128, 128, 128), rtt));
                }
                for (key, value) in result.fields.iter() {
                    output.push_str(&format!(
                        "    {} {}\n",
                        format!("{}:", key).truecolor(191, 64, 191),
                        render_value(value)
                    ));
                }
            }
            Some(failure) => {
                output.push_str(&format!(
                    "{} {} {} {} {}\n",
                    "✖".truecolor(255, 64, 64).bold(),
                    result.protocol.truecolor(255, 255, 255).bold(),
                    target.truecolor(0, 212, 255),
                    failure.kind.to_string().truecolor(255, 140, 0).bold(),
                    format!("at {}", failure.stage).truecolor(128, 128, 128)
                ));
                output.push_str(&format!("    {}\n", failure.message));
                if let Some(interception) = result.interception {
                    output.push_str(&format!(
                        "    {} {}\n",
                        "⚠ interception:".truecolor(255, 140, 0),
                        interception
                    ));
                }
                if let Some(raw) = &failure.raw_hex {
                    output.push_str(&format!("    {} {}\n", "raw:".truecolor(128, 128, 128), raw));
                }
            }
        }
    }

    if results.len() > 1 {
        output.push_str(&format!(
            "\n{} {} {} {} {} {}\n",
            "⚡".truecolor(0, 255, 65).bold(),
            format!("{} probes", results.len()).truecolor(255, 255, 255).bold(),
            "•".truecolor(64, 64, 64),
            format!("{} succeeded", succeeded).truecolor(0, 255, 65).bold(),
            "•".truecolor(64, 64, 64),
            format!("{} failed", results.len() - succeeded).truecolor(255, 140, 0).bold()
        ));
    }
    output
}

pub fn format_json(results: &[ProbeResult]) -> Result<String> {
    Ok(serde_json::to_string_pretty(results)? + "\n")
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

pub fn format_csv(results: &[ProbeResult]) -> String {
    let mut csv = String::from(
        "protocol,host,port,transport,success,state,elapsed_ms,connect_ms,rtt_ms,bytes_sent,bytes_received,error_kind,error_stage,message,interception,fields\n",
    );
    for r in results {
        let fields = serde_json::to_string(&r.fields).unwrap_or_default();
        let row = [
            r.protocol.clone(),
            r.host.clone(),
            r.port.to_string(),
            r.transport.to_string(),
            r.success.to_string(),
            r.state.to_string(),
            format!("{:.3}", r.elapsed_ms),
            opt(r.connect_ms.map(|v| format!("{:.3}", v))),
            opt(r.rtt_ms.map(|v| format!("{:.3}", v))),
            r.bytes_sent.to_string(),
            r.bytes_received.to_string(),
            opt(r.error.as_ref().map(|e| e.kind)),
            opt(r.error.as_ref().map(|e| e.stage)),
            opt(r.error.as_ref().map(|e| e.message.clone())),
            opt(r.interception),
            fields,
        ];
        let escaped: Vec<String> = row.iter().map(|f| csv_escape(f)).collect();
        csv.push_str(&escaped.join(","));
        csv.push('\n');
    }
    csv
}

fn pattern_name(info: &AdapterInfo) -> String {
    match serde_json::to_value(info.pattern) {
        Ok(Value::String(s)) => s,
        _ => format!("{:?}", info.pattern),
    }
}

fn format_adapters_human(adapters: &[AdapterInfo]) -> String {
    let mut output = String::new();
    for info in adapters {
        let aliases = if info.aliases.is_empty() {
            String::new()
        } else {
            format!("({})", info.aliases.join(", "))
        };
        output.push_str(&format!(
            "{:<12} {:>9} {:<18} {} {}\n",
            info.id.truecolor(255, 255, 255).bold(),
            format!("{}/{}", info.default_port, info.transport).truecolor(0, 212, 255),
            pattern_name(info).truecolor(191, 64, 191),
            info.name,
            aliases.truecolor(128, 128, 128)
        ));
    }
    output.push_str(&format!("\n{} protocols\n", adapters.len()));
    output
}

fn format_adapters_csv(adapters: &[AdapterInfo]) -> String {
    let mut csv = String::from("id,name,default_port,transport,pattern,aliases\n");
    for info in adapters {
        let row = [
            info.id.to_string(),
            info.name.to_string(),
            info.default_port.to_string(),
            info.transport.to_string(),
            pattern_name(info),
            info.aliases.join(" "),
        ];
        let escaped: Vec<String> = row.iter().map(|f| csv_escape(f)).collect();
        csv.push_str(&escaped.join(","));
        csv.push('\n');
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::normalizer::{normalize, ProbeContext};
    use crate::probe::trace::ProbeTrace;
    use crate::probe::{Payload, ProbeError, TransportKind};
    use chrono::Utc;
    use std::time::Duration;

    fn result(outcome: Result<Payload, ProbeError>) -> ProbeResult {
        let ctx = ProbeContext {
            protocol: "smtp".to_string(),
            host: "mail.example".to_string(),
            port: 25,
            transport: TransportKind::Tcp,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(40),
            raw_diagnostics: false,
        };
        normalize(ctx, outcome, ProbeTrace::new(64).snapshot())
    }

    #[test]
    fn test_csv_escapes_messages_and_fields() {
        let ok = result(Ok(Payload::new().with("banner", "ESMTP, ready")));
        let failed = result(Err(ProbeError::ServiceError("421 \"busy\"".to_string())));
        let csv = format_csv(&[ok, failed]);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("smtp,mail.example,25,tcp,true,completed,"));
        assert!(lines[1].ends_with(r#""{""banner"":""ESMTP, ready""}""#));
        assert!(lines[2].contains("ServiceError"));
        assert!(lines[2].contains(r#"421 ""busy""""#));
    }

    #[test]
    fn test_json_is_an_array_of_envelopes() {
        let json = format_json(&[result(Err(ProbeError::Timeout))]).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["success"], Value::Bool(false));
        assert_eq!(parsed[0]["error"]["kind"], "Timeout");
    }

    #[test]
    fn test_human_output_shows_kind_and_fields() {
        colored::control::set_override(false);
        let text = format_human(&[
            result(Ok(Payload::new().with("software", "Postfix"))),
            result(Err(ProbeError::AuthRequired("AUTH required".to_string()))),
        ]);
        assert!(text.contains("software: Postfix"));
        assert!(text.contains("AuthRequired"));
        assert!(text.contains("2 probes"));
    }

    #[test]
    fn test_render_value_truncates() {
        let long = Value::String("x".repeat(300));
        assert_eq!(render_value(&long).chars().count(), MAX_FIELD_WIDTH + 1);
        assert_eq!(render_value(&serde_json::json!([1, 2])), "[1,2]");
    }
}
