use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use log::{Level, Record};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;

pub const SYSLOG_PATH: &str = "/dev/log";

const SYSLOG_TAG: &str = "ev-logger";
const SYSLOG_FACILITY_USER: u8 = 1;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Serialize)]
struct JsonRecord<'a> {
    time: String,
    level: &'a str,
    message: Value,
}

/// Renders each log record as one JSON object.
#[derive(Clone, Debug, Default)]
pub struct JsonFormat {
    indent: usize,
    syslog: bool,
}

impl JsonFormat {
    pub fn new(indent: usize, syslog: bool) -> Self {
        Self { indent, syslog }
    }

    pub fn render(&self, record: &Record) -> io::Result<String> {
        let rec = JsonRecord {
            time: Local::now().format(TIME_FORMAT).to_string(),
            level: record.level().as_str(),
            message: embed_json(record.args().to_string()),
        };

        // syslog wants a single line per message
        if self.syslog {
            let json = serde_json::to_string(&rec)?;
            return Ok(format!("<{}>{SYSLOG_TAG}: {json}", priority(record.level())));
        }

        if self.indent == 0 {
            return Ok(serde_json::to_string(&rec)?);
        }

        let indent = " ".repeat(self.indent);
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        rec.serialize(&mut ser)?;

        String::from_utf8(out).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

pub fn init(config: &Config) -> Result<()> {
    let format = JsonFormat::new(config.indent(), config.syslog());

    // only the builder and its filter handling are used, the format is ours
    let mut builder = pretty_env_logger::formatted_builder();
    builder.parse_filters(config.log_level());

    if config.syslog() {
        let writer = SyslogWriter::connect(Path::new(SYSLOG_PATH))
            .with_context(|| format!("Failed to connect to syslog at {SYSLOG_PATH}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(writer)));

        builder.format(move |buf, record| {
            let line = format.render(record)?;
            buf.write_all(line.as_bytes())
        });
    } else {
        builder.format(move |buf, record| {
            let line = format.render(record)?;
            writeln!(buf, "{line}")
        });
    }

    builder.try_init()?;
    Ok(())
}

// Messages that are JSON documents (the labels) are nested as-is
fn embed_json(message: String) -> Value {
    let trimmed = message.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(&message) {
            return value;
        }
    }

    Value::String(message)
}

fn priority(level: Level) -> u8 {
    let severity = match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    };

    SYSLOG_FACILITY_USER * 8 + severity
}

/// Sends every write as one datagram to a local syslog socket.
pub struct SyslogWriter {
    socket: UnixDatagram,
}

impl SyslogWriter {
    pub fn connect(path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self { socket })
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert2::{assert, let_assert};

    use super::*;

    fn render(format: &JsonFormat, level: Level, msg: &str) -> String {
        format
            .render(&Record::builder().args(format_args!("{msg}")).level(level).build())
            .unwrap()
    }

    #[test]
    fn test_plain_message() {
        let line = render(&JsonFormat::default(), Level::Info, "Starting up");
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value["level"] == "INFO");
        assert!(value["message"] == "Starting up");

        let_assert!(Some(time) = value["time"].as_str());
        assert!(time.len() == "2024-01-01 00:00:00".len());
    }

    #[test]
    fn test_field_order() {
        let line = render(&JsonFormat::default(), Level::Warn, "x");
        let time = line.find("\"time\"").unwrap();
        let level = line.find("\"level\"").unwrap();
        let message = line.find("\"message\"").unwrap();

        assert!(time < level);
        assert!(level < message);
        assert!(line.contains("\"WARN\""));
    }

    #[test]
    fn test_json_message_embedded() {
        let line = render(&JsonFormat::default(), Level::Info, r#"{"app/name":"x","app/item":[{"a":"b"}]}"#);
        let value: Value = serde_json::from_str(&line).unwrap();

        assert!(value["message"]["app/name"] == "x");
        assert!(value["message"]["app/item"][0]["a"] == "b");
    }

    #[test]
    fn test_non_json_stays_string() {
        for msg in ["42", "{not json", "true"] {
            let line = render(&JsonFormat::default(), Level::Info, msg);
            let value: Value = serde_json::from_str(&line).unwrap();
            assert!(value["message"] == msg);
        }
    }

    #[test]
    fn test_indent() {
        let line = render(&JsonFormat::new(4, false), Level::Info, "x");
        assert!(line.contains("\n    \"level\": \"INFO\""));
    }

    #[test]
    fn test_syslog_format() {
        let line = render(&JsonFormat::new(4, true), Level::Error, "boom");
        let_assert!(Some(json) = line.strip_prefix("<11>ev-logger: "));
        assert!(!json.contains('\n'));

        let value: Value = serde_json::from_str(json).unwrap();
        assert!(value["message"] == "boom");
    }

    #[test]
    fn test_priority() {
        assert!(priority(Level::Error) == 11);
        assert!(priority(Level::Warn) == 12);
        assert!(priority(Level::Info) == 14);
        assert!(priority(Level::Debug) == 15);
        assert!(priority(Level::Trace) == 15);
    }

    #[test]
    fn test_syslog_writer() {
        let path = std::env::temp_dir().join(format!("ev-logger-test-{}.sock", std::process::id()));
        _ = std::fs::remove_file(&path);

        let server = UnixDatagram::bind(&path).unwrap();
        let mut writer = SyslogWriter::connect(&path).unwrap();

        writer.write_all(b"<14>ev-logger: {}").unwrap();

        let mut buf = [0u8; 128];
        let n = server.recv(&mut buf).unwrap();
        assert!(&buf[..n] == b"<14>ev-logger: {}");

        _ = std::fs::remove_file(&path);
    }
}
